use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use portfolio_sync::config::LoggingConfig;
use portfolio_sync::health::CheckResult;
use portfolio_sync::server::{self, AppState};
use portfolio_sync::{
    connection, customization, import, CatalogPage, Config, Daemon, FieldEdits, GitHubClient,
    HealthCheck, ProjectStore, RepoCatalog, SortKey, SyncReconciler, SyncableField, TokenVault,
};

#[derive(Parser)]
#[command(name = "portfolio-sync")]
#[command(about = "Import GitHub repositories as portfolio projects and keep them in sync")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Link a GitHub account with a personal access token
    Connect {
        /// Token to store (read from stdin when omitted)
        #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Forget the stored GitHub credential (projects are kept)
    Disconnect,

    /// Show connection and last sync status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Browse repositories of the connected account
    Repos {
        #[command(subcommand)]
        repos_command: ReposCommands,
    },

    /// Import repositories as projects
    Import {
        /// Repositories as owner/name
        #[arg(required = true)]
        repos: Vec<String>,
    },

    /// Inspect and edit projects
    Projects {
        #[command(subcommand)]
        projects_command: ProjectsCommands,
    },

    /// Reconcile all synced projects with GitHub once
    Sync,

    /// Serve the scheduler trigger endpoint
    Serve {
        /// Listen address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run the in-process scheduler in the foreground
    Daemon,

    /// System health check and diagnostics
    Doctor {
        /// Also verify the stored credential with GitHub
        #[arg(long)]
        online: bool,
    },
}

#[derive(Subcommand)]
enum ReposCommands {
    /// List one page of repositories
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 30)]
        per_page: u8,

        #[arg(long, value_enum, default_value_t = SortKey::Updated)]
        sort: SortKey,
    },

    /// Search name, description and topics
    Search {
        query: String,

        /// Only repositories in this language
        #[arg(long)]
        language: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 30)]
        per_page: u8,
    },

    /// Languages used across recent repositories
    Languages,
}

#[derive(Subcommand)]
enum ProjectsCommands {
    /// List all projects in display order
    List,

    /// Edit a project's title or description
    Edit {
        id: i64,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },

    /// Hand a customized field back to GitHub
    Reset {
        id: i64,

        /// title or description
        field: SyncableField,
    },

    /// Show or hide a project
    Visibility { id: i64, state: Visibility },
}

#[derive(ValueEnum, Clone, Copy)]
enum Visibility {
    Show,
    Hide,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        init_logging(cli.verbose, &LoggingConfig::default());
        return cmd_init(cli.config.as_deref(), force);
    }

    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.logging);
    info!("Starting portfolio-sync v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Connect { token } => cmd_connect(token, &config).await,
        Commands::Disconnect => cmd_disconnect(&config),
        Commands::Status { json } => cmd_status(json, &config),
        Commands::Repos { repos_command } => cmd_repos(repos_command, &config).await,
        Commands::Import { repos } => cmd_import(&repos, &config).await,
        Commands::Projects { projects_command } => cmd_projects(projects_command, &config).await,
        Commands::Sync => cmd_sync(&config).await,
        Commands::Serve { bind } => cmd_serve(bind, &config).await,
        Commands::Daemon => cmd_daemon(&config).await,
        Commands::Doctor { online } => cmd_doctor(online, &config).await,
    }
}

/// Initialize logging; RUST_LOG wins over --verbose and the configured level
fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_ansi(logging.color)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

fn open_store(config: &Config) -> Result<Arc<ProjectStore>> {
    let store = ProjectStore::open(Path::new(&config.database_path))?;
    Ok(Arc::new(store))
}

/// Client built from the stored, encrypted credential
fn stored_client(store: &ProjectStore, config: &Config) -> Result<GitHubClient> {
    let connection = store
        .load_connection()?
        .context("GitHub is not connected. Run: portfolio-sync connect")?;

    let token = TokenVault::from_config(config)
        .decrypt(&connection.encrypted_token)
        .context("Failed to open the stored credential")?;

    GitHubClient::new(&token, &config.github).context("Failed to create GitHub client")
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, finishing in-flight work...");
                cancel.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });
    token
}

fn cmd_init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_path()?,
    };

    if path.exists() && !force {
        println!("⚠️  Configuration already exists: {}", path.display());
        println!("   Use --force to overwrite it");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }
    Config::default().save(&path)?;

    println!("✅ Configuration written to {}", path.display());
    println!("   Next: export PORTFOLIO_ENCRYPTION_SECRET and run 'portfolio-sync connect'");
    Ok(())
}

async fn cmd_connect(token: Option<String>, config: &Config) -> Result<()> {
    let token = match token {
        Some(token) => token,
        None => read_token()?,
    };

    let store = open_store(config)?;
    let vault = TokenVault::from_config(config);
    let connection = connection::connect(&store, &vault, &config.github, &token).await?;

    println!("✅ Connected to GitHub as {}", connection.username);
    Ok(())
}

fn read_token() -> Result<String> {
    print!("GitHub token: ");
    std::io::stdout().flush().context("Failed to flush stdout")?;

    let mut token = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut token)
        .context("Failed to read token from stdin")?;
    Ok(token.trim().to_string())
}

fn cmd_disconnect(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    if connection::disconnect(&store)? {
        println!("✅ GitHub disconnected; projects were kept");
    } else {
        println!("⚠️  GitHub was not connected");
    }
    Ok(())
}

fn cmd_status(json: bool, config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let status = connection::status(&store)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    match &status.username {
        Some(username) => println!("🔗 Connected as {}", username),
        None => println!("🔌 Not connected"),
    }
    if let Some(at) = status.last_sync_at {
        println!("   Last sync: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(error) = &status.sync_error {
        println!("   ❌ Last sync errors: {}", error);
    }
    println!(
        "   Projects: {} ({} synced, {} hidden)",
        status.projects, status.synced_projects, status.hidden_projects
    );
    Ok(())
}

async fn cmd_repos(command: ReposCommands, config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let client = stored_client(&store, config)?;
    let catalog = RepoCatalog::new(&client, &config.github);

    match command {
        ReposCommands::List {
            page,
            per_page,
            sort,
        } => print_catalog_page(&catalog.list(page, per_page, sort).await?),
        ReposCommands::Search {
            query,
            language,
            page,
            per_page,
        } => print_catalog_page(
            &catalog
                .search(&query, language.as_deref(), page, per_page)
                .await?,
        ),
        ReposCommands::Languages => {
            for language in catalog.languages().await? {
                println!("{}", language);
            }
        }
    }

    Ok(())
}

fn print_catalog_page(page: &CatalogPage) {
    for item in &page.items {
        let language = item.language.as_deref().unwrap_or("-");
        println!("📁 {} ({}, ★ {})", item.full_name, language, item.stars);
        if let Some(description) = &item.description {
            println!("   {}", description);
        }
    }

    let total = page
        .total
        .map(|t| format!(" of {}{}", t, if page.approximate { "+" } else { "" }))
        .unwrap_or_default();
    println!(
        "\nPage {}{} · {} shown{}",
        page.page,
        if page.has_more { " (more available)" } else { "" },
        page.items.len(),
        total
    );
}

async fn cmd_import(repos: &[String], config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let client = stored_client(&store, config)?;

    let outcome = import::import_by_full_names(&store, &client, repos).await?;

    println!("✅ Imported {} repositories", outcome.imported());
    for skipped in &outcome.skipped {
        println!("   ⏭️  {} already imported", skipped);
    }
    Ok(())
}

async fn cmd_projects(command: ProjectsCommands, config: &Config) -> Result<()> {
    let store = open_store(config)?;

    match command {
        ProjectsCommands::List => {
            for project in store.list_projects()? {
                let source = project.github_full_name.as_deref().unwrap_or("manual");
                let visibility = if project.visible { "" } else { " [hidden]" };
                let customized: Vec<_> = project.customized_fields.iter().map(|f| f.as_str()).collect();
                println!(
                    "{:>4}  {:<32} {}{}",
                    project.id, project.title, source, visibility
                );
                if !customized.is_empty() {
                    println!("      customized: {}", customized.join(", "));
                }
            }
        }
        ProjectsCommands::Edit {
            id,
            title,
            description,
        } => {
            let edits = FieldEdits { title, description };
            anyhow::ensure!(!edits.is_empty(), "Nothing to change: pass --title and/or --description");

            let project = store
                .apply_user_edit(id, &edits)?
                .with_context(|| format!("Project {} not found", id))?;
            println!("✅ Updated project {}: {}", project.id, project.title);
        }
        ProjectsCommands::Reset { id, field } => {
            let client = stored_client(&store, config)?;
            let value = customization::reset_field(&store, &client, id, field).await?;
            println!("✅ {} of project {} follows GitHub again: {}", field, id, value);
        }
        ProjectsCommands::Visibility { id, state } => {
            let visible = matches!(state, Visibility::Show);
            store
                .set_visibility(id, visible)?
                .with_context(|| format!("Project {} not found", id))?;
            println!(
                "✅ Project {} is now {}",
                id,
                if visible { "visible" } else { "hidden" }
            );
        }
    }

    Ok(())
}

async fn cmd_sync(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let reconciler = SyncReconciler::new(store, TokenVault::from_config(config), config);
    let cancel = cancel_on_ctrl_c();

    println!("🔄 Syncing projects with GitHub...");
    let summary = reconciler.run_stored(&cancel).await?;

    println!("\n🎉 Sync complete in {:.2}s", summary.duration.as_secs_f64());
    println!("   ✅ Synced: {}", summary.synced);
    println!("   🙈 Hidden: {}", summary.hidden);
    if summary.skipped > 0 {
        println!("   ⏭️  Skipped (edited during sync): {}", summary.skipped);
    }
    if summary.cancelled {
        println!("   ⚠️  Cancelled before all projects were processed");
    }
    if !summary.errors.is_empty() {
        println!("\n❌ Errors:");
        for error in &summary.errors {
            println!("   {}", error);
        }
    }
    Ok(())
}

async fn cmd_serve(bind: Option<String>, config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let reconciler = SyncReconciler::new(store, TokenVault::from_config(config), config);

    if config.security.cron_secret.is_none() {
        warn!("No cron secret configured; every trigger request will be rejected");
    }

    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    let state = AppState {
        reconciler,
        cron_secret: config.security.cron_secret.clone(),
        shutdown: cancel_on_ctrl_c(),
    };
    server::serve(listener, state).await
}

async fn cmd_daemon(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let reconciler = SyncReconciler::new(store, TokenVault::from_config(config), config);

    println!("🖥️  Running scheduler every {} (Ctrl+C to stop)", config.daemon.interval);
    let mut daemon = Daemon::new(reconciler, config, CancellationToken::new())?;
    let stats = daemon.run().await?;

    println!(
        "✅ Daemon stopped: {} runs, {} failed",
        stats.total_runs, stats.failed_runs
    );
    Ok(())
}

async fn cmd_doctor(online: bool, config: &Config) -> Result<()> {
    let health = HealthCheck::run(config, online).await;
    print_health_report(&health);

    anyhow::ensure!(health.all_passed(), "Some checks failed");
    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning {
                "⚠️ "
            } else {
                "✅"
            }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 portfolio-sync Diagnostics");
    println!();

    let names = ["Encryption secret", "Cron secret", "Database", "GitHub credential"];
    for (name, result) in names.into_iter().zip(health.results()) {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
