use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the long-lived secret the credential key is derived from
pub const ENCRYPTION_SECRET_ENV: &str = "PORTFOLIO_ENCRYPTION_SECRET";
/// Environment variable holding the secret shared with the external scheduler
pub const CRON_SECRET_ENV: &str = "CRON_SECRET";
/// Environment variable overriding the database location
pub const DATABASE_ENV: &str = "PORTFOLIO_DATABASE";

/// Main configuration structure for portfolio-sync
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// SQLite database holding the provider connection and projects
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// GitHub API access settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Reconciliation behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// In-process scheduler configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Trigger endpoint configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Secrets (normally supplied through the environment)
    #[serde(default)]
    pub security: SecurityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// REST API root
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Timeout for a single upstream request in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Retries on a primary rate limit before giving up
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: usize,

    /// First backoff delay in milliseconds
    #[serde(default = "default_retry_min_delay")]
    pub retry_min_delay_ms: u64,

    /// Upper bound for a single backoff delay in milliseconds
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Repositories fetched when searching or filtering client-side
    #[serde(default = "default_sample_size")]
    pub search_sample_size: u8,

    /// Repositories sampled for the language filter list
    #[serde(default = "default_sample_size")]
    pub language_sample_size: u8,
}

/// Reconciliation configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Maximum projects reconciled concurrently (1 = sequential)
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Timeout for one project's upstream fetch in seconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// Sync interval
    #[serde(default = "default_interval")]
    pub interval: String, // "6h"

    /// Run once immediately on start instead of waiting a full interval
    #[serde(default)]
    pub run_on_start: bool,
}

/// Trigger endpoint configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Address the endpoint listens on
    #[serde(default = "default_bind")]
    pub bind: String,
}

/// Secrets. Values from the environment take precedence and are never written back.
#[derive(Deserialize, Serialize, Clone, Default)]
pub struct SecurityConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_secret: Option<String>,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("encryption_secret", &self.encryption_secret.as_ref().map(|_| "<redacted>"))
            .field("cron_secret", &self.cron_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_database_path() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/portfolio-sync/portfolio.db", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/portfolio-sync/portfolio.db", home)
    } else {
        "/tmp/portfolio-sync.db".to_string()
    }
}
fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_request_timeout() -> u64 {
    15
}
fn default_rate_limit_retries() -> usize {
    2
}
fn default_retry_min_delay() -> u64 {
    1_000
}
fn default_retry_max_delay() -> u64 {
    30_000
}
fn default_sample_size() -> u8 {
    100
}
fn default_max_parallel() -> usize {
    4
}
fn default_fetch_timeout() -> u64 {
    30
}
fn default_interval() -> String {
    "6h".to_string()
}
fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            request_timeout_secs: default_request_timeout(),
            rate_limit_retries: default_rate_limit_retries(),
            retry_min_delay_ms: default_retry_min_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            search_sample_size: default_sample_size(),
            language_sample_size: default_sample_size(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            run_on_start: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            color: default_true(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            github: GitHubConfig::default(),
            sync: SyncConfig::default(),
            daemon: DaemonConfig::default(),
            server: ServerConfig::default(),
            security: SecurityConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl GitHubConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl SyncConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);

            config.apply_env_overrides();
            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.apply_env_overrides();
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("portfolio-sync").join("config.yml"))
    }

    /// Pull secrets and the database location from the environment
    pub fn apply_env_overrides(&mut self) {
        if let Some(secret) = non_empty_env(ENCRYPTION_SECRET_ENV) {
            self.security.encryption_secret = Some(secret);
        }
        if let Some(secret) = non_empty_env(CRON_SECRET_ENV) {
            self.security.cron_secret = Some(secret);
        }
        if let Some(path) = non_empty_env(DATABASE_ENV) {
            self.database_path = path;
        }
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.database_path = shellexpand::full(&self.database_path)
            .context("Failed to expand database_path")?
            .into_owned();

        Ok(())
    }

    /// Parse the daemon interval ("30m", "6h", "1d" or raw seconds)
    pub fn daemon_interval(&self) -> Result<Duration> {
        parse_interval(&self.daemon.interval).map(Duration::from_secs)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_interval(interval: &str) -> Result<u64> {
    let interval = interval.trim().to_lowercase();

    let (value, unit, label) = if let Some(value) = interval.strip_suffix('s') {
        (value, 1, "seconds")
    } else if let Some(value) = interval.strip_suffix('m') {
        (value, 60, "minutes")
    } else if let Some(value) = interval.strip_suffix('h') {
        (value, 3600, "hours")
    } else if let Some(value) = interval.strip_suffix('d') {
        (value, 86400, "days")
    } else {
        let secs = interval
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30m', '6h', '1d'")?;
        return check_interval(secs);
    };

    let count = value
        .parse::<u64>()
        .with_context(|| format!("Invalid {} value", label))?;
    let secs = count
        .checked_mul(unit)
        .with_context(|| format!("Sync interval of {} {} is too large", count, label))?;

    check_interval(secs)
}

/// Longest accepted interval: one year
const MAX_INTERVAL_SECS: u64 = 365 * 86400;

fn check_interval(secs: u64) -> Result<u64> {
    anyhow::ensure!(secs > 0, "Sync interval must be greater than zero");
    anyhow::ensure!(
        secs <= MAX_INTERVAL_SECS,
        "Sync interval must not exceed 365 days"
    );
    Ok(secs)
}
