//! Preflight checks for portfolio-sync
//!
//! `doctor` runs these before the operator wires up a scheduler: secrets,
//! database, and whether the stored credential still opens (and, optionally,
//! whether GitHub still accepts it).

use std::path::Path;

use crate::config::{Config, CRON_SECRET_ENV, ENCRYPTION_SECRET_ENV};
use crate::github::GitHubClient;
use crate::store::ProjectStore;
use crate::vault::TokenVault;

/// Result of all preflight checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub encryption_secret: CheckResult,
    /// Missing only matters when the trigger endpoint is used
    pub cron_secret: CheckResult,
    pub database: CheckResult,
    pub credential: CheckResult,
}

/// Result of an individual check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..Self::ok(message)
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all checks; `verify_remote` also asks GitHub about the credential
    pub async fn run(config: &Config, verify_remote: bool) -> Self {
        let vault = TokenVault::from_config(config);
        let store = ProjectStore::open(Path::new(&config.database_path));

        let database = match &store {
            Ok(_) => CheckResult::ok_with_details("Database available", config.database_path.clone()),
            Err(e) => CheckResult::error_with_details("Database unavailable", format!("{:#}", e)),
        };

        let credential = match &store {
            Ok(store) => Self::check_credential(store, &vault, config, verify_remote).await,
            Err(_) => CheckResult::error_with_details(
                "Stored credential not checked",
                "the database could not be opened",
            ),
        };

        Self {
            encryption_secret: Self::check_encryption_secret(&vault),
            cron_secret: Self::check_cron_secret(config),
            database,
            credential,
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.results().iter().all(|r| r.passed)
    }

    pub fn results(&self) -> [&CheckResult; 4] {
        [
            &self.encryption_secret,
            &self.cron_secret,
            &self.database,
            &self.credential,
        ]
    }

    /// Failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.results()
            .into_iter()
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.results().into_iter().filter(|r| r.is_warning).collect()
    }

    fn check_encryption_secret(vault: &TokenVault) -> CheckResult {
        if vault.is_keyed() {
            CheckResult::ok("Encryption secret configured")
        } else {
            CheckResult::error_with_details(
                "Encryption secret missing",
                format!("Set {} or security.encryption_secret", ENCRYPTION_SECRET_ENV),
            )
        }
    }

    fn check_cron_secret(config: &Config) -> CheckResult {
        match config.security.cron_secret.as_deref() {
            Some(secret) if !secret.trim().is_empty() => CheckResult::ok("Cron secret configured"),
            _ => CheckResult::warning_with_details(
                "Cron secret missing; the trigger endpoint will refuse every request",
                format!("Set {} or security.cron_secret", CRON_SECRET_ENV),
            ),
        }
    }

    async fn check_credential(
        store: &ProjectStore,
        vault: &TokenVault,
        config: &Config,
        verify_remote: bool,
    ) -> CheckResult {
        let connection = match store.load_connection() {
            Ok(Some(connection)) => connection,
            Ok(None) => {
                return CheckResult::warning_with_details(
                    "GitHub not connected",
                    "Run: portfolio-sync connect",
                )
            }
            Err(e) => return CheckResult::error_with_details("Connection unreadable", format!("{:#}", e)),
        };

        let token = match vault.decrypt(&connection.encrypted_token) {
            Ok(token) => token,
            Err(e) => {
                return CheckResult::error_with_details(
                    "Stored credential cannot be opened",
                    format!("{} (reconnect after fixing the encryption secret)", e),
                )
            }
        };

        if !verify_remote {
            return CheckResult::ok_with_details(
                "Stored credential decrypts",
                format!("connected as {}", connection.username),
            );
        }

        let verified = match GitHubClient::new(&token, &config.github) {
            Ok(client) => client.current_user().await,
            Err(e) => Err(e),
        };

        match verified {
            Ok(profile) => CheckResult::ok_with_details(
                "GitHub accepts the stored credential",
                format!("authenticated as {}", profile.login),
            ),
            Err(e) => CheckResult::error_with_details("GitHub rejected the stored credential", e.to_string()),
        }
    }
}
