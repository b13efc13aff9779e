//! Sync Reconciler - brings synced projects in line with their upstream repositories
//!
//! One run walks every synced project with a bounded number of concurrent
//! fetches. Each project is written in its own transaction, guarded by the
//! version read before the fetch. Unreachable repositories hide their project;
//! every other failure is collected and the run carries on.

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, GitHubConfig};
use crate::customization::SyncableField;
use crate::github::{GitHubClient, ProviderError, RepoProvider};
use crate::store::{Project, ProjectStore, ProviderConnection, RepoStats, SyncUpdate, WriteOutcome};
use crate::vault::{TokenVault, VaultError};

/// Failures that stop a run before any project is touched
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No stored credential, or GitHub refused it
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error(transparent)]
    Decryption(#[from] VaultError),

    #[error("a sync run is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Results from a complete reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub synced: usize,
    pub hidden: usize,
    /// `"{full_name}: {message}"`, in project order
    pub errors: Vec<String>,
    /// Projects left alone because they changed during the run
    pub skipped: usize,
    pub cancelled: bool,
    pub duration: Duration,
}

impl SyncSummary {
    fn error_text(&self) -> Option<String> {
        (!self.errors.is_empty()).then(|| self.errors.join("; "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ProjectOutcome {
    Synced,
    Hidden,
    Failed(String),
    Skipped,
    Cancelled,
}

/// Runs reconciliation against the store; cheap to clone
#[derive(Clone)]
pub struct SyncReconciler {
    store: Arc<ProjectStore>,
    vault: TokenVault,
    github: GitHubConfig,
    max_parallel: usize,
    fetch_timeout: Duration,
    running: Arc<Mutex<()>>,
}

impl SyncReconciler {
    pub fn new(store: Arc<ProjectStore>, vault: TokenVault, config: &Config) -> Self {
        Self {
            store,
            vault,
            github: config.github.clone(),
            max_parallel: config.sync.max_parallel.max(1),
            fetch_timeout: config.sync.fetch_timeout(),
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Override the per-project fetch deadline
    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub fn store(&self) -> &Arc<ProjectStore> {
        &self.store
    }

    /// Load the stored connection and run against it
    pub async fn run_stored(&self, cancel: &CancellationToken) -> Result<SyncSummary, ReconcileError> {
        let connection = self
            .store
            .load_connection()?
            .ok_or_else(|| ReconcileError::Unauthenticated("GitHub is not connected".to_string()))?;

        self.run(&connection, cancel).await
    }

    /// Decrypt the connection's credential and reconcile with a live client
    pub async fn run(
        &self,
        connection: &ProviderConnection,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary, ReconcileError> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| ReconcileError::AlreadyRunning)?;

        if !self.vault.is_keyed() {
            let message = "encryption secret is not configured";
            self.record_failure(message);
            return Err(ReconcileError::Configuration(message.to_string()));
        }

        let token = match self.vault.decrypt(&connection.encrypted_token) {
            Ok(token) => token,
            Err(e) => {
                self.record_failure(&e.to_string());
                return Err(ReconcileError::Decryption(e));
            }
        };

        let client = match GitHubClient::new(&token, &self.github) {
            Ok(client) => client,
            Err(e) => {
                self.record_failure(&e.to_string());
                return Err(ReconcileError::Configuration(e.to_string()));
            }
        };
        drop(token);

        match client.current_user().await {
            Ok(profile) => debug!("Credential belongs to {}", profile.login),
            Err(ProviderError::Unauthenticated(message)) => {
                self.record_failure(&format!("unauthenticated: {}", message));
                return Err(ReconcileError::Unauthenticated(message));
            }
            // anything else shows up again per project
            Err(e) => warn!("Could not verify credential before sync: {}", e),
        }

        self.reconcile_locked(&client, cancel).await
    }

    /// Reconcile every synced project against `provider`
    pub async fn reconcile(
        &self,
        provider: &dyn RepoProvider,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary, ReconcileError> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| ReconcileError::AlreadyRunning)?;

        self.reconcile_locked(provider, cancel).await
    }

    async fn reconcile_locked(
        &self,
        provider: &dyn RepoProvider,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary, ReconcileError> {
        let start_time = Instant::now();
        let projects = match self.store.list_synced_projects() {
            Ok(projects) => projects,
            Err(e) => {
                self.record_failure(&format!("{:#}", e));
                return Err(ReconcileError::Store(e));
            }
        };

        info!(
            "Starting GitHub sync of {} projects (max_parallel={})",
            projects.len(),
            self.max_parallel
        );

        let semaphore = Semaphore::new(self.max_parallel);
        let mut futures = FuturesUnordered::new();

        for (index, project) in projects.iter().enumerate() {
            let semaphore = &semaphore;
            futures.push(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (index, ProjectOutcome::Cancelled);
                };
                if cancel.is_cancelled() {
                    return (index, ProjectOutcome::Cancelled);
                }
                (index, self.reconcile_project(provider, project).await)
            });
        }

        let mut outcomes = Vec::with_capacity(projects.len());
        while let Some(outcome) = futures.next().await {
            outcomes.push(outcome);
        }
        drop(futures);
        outcomes.sort_by_key(|(index, _)| *index);

        let mut summary = compile_summary(outcomes.into_iter().map(|(_, outcome)| outcome));
        summary.duration = start_time.elapsed();

        if let Err(e) = self
            .store
            .record_sync_outcome(Utc::now(), summary.error_text().as_deref())
        {
            error!("Failed to record sync outcome: {:#}", e);
        }

        info!(
            "Sync completed in {:.2}s: {} synced, {} hidden, {} errors, {} skipped{}",
            summary.duration.as_secs_f64(),
            summary.synced,
            summary.hidden,
            summary.errors.len(),
            summary.skipped,
            if summary.cancelled { " (cancelled)" } else { "" }
        );

        Ok(summary)
    }

    async fn reconcile_project(&self, provider: &dyn RepoProvider, listed: &Project) -> ProjectOutcome {
        let label = listed
            .github_full_name
            .clone()
            .unwrap_or_else(|| format!("project {}", listed.id));

        // re-read so the version guards against edits made since the listing
        let project = match self.store.get_project(listed.id) {
            Ok(Some(project)) => project,
            Ok(None) => return ProjectOutcome::Skipped,
            Err(e) => return ProjectOutcome::Failed(format!("{}: {:#}", label, e)),
        };
        let Some(link) = project.github_link() else {
            return ProjectOutcome::Skipped;
        };

        let fetched = match timeout(self.fetch_timeout, provider.fetch_repo(&link.full_name)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Fetch timed out for {}", link.full_name);
                Err(ProviderError::Timeout)
            }
        };

        let synced_at = Utc::now();
        let (update, success) = match fetched {
            Ok(repo) => {
                let keep_upstream =
                    |field: SyncableField| (!project.customized_fields.contains(field)).then(|| field.upstream_value(&repo));

                let update = SyncUpdate::Refreshed {
                    title: keep_upstream(SyncableField::Title),
                    description: keep_upstream(SyncableField::Description),
                    github_url: repo.html_url.clone(),
                    stats: RepoStats::from(&repo),
                    synced_at,
                };
                (update, ProjectOutcome::Synced)
            }
            Err(e) if e.is_unreachable() => {
                info!("{} is unreachable ({}), hiding project {}", link.full_name, e, project.id);
                (SyncUpdate::Unreachable { synced_at }, ProjectOutcome::Hidden)
            }
            Err(e) => {
                warn!("Sync failed for {}: {}", link.full_name, e);
                return ProjectOutcome::Failed(format!("{}: {}", link.full_name, e));
            }
        };

        match self.store.apply_sync_update(project.id, project.version, &update) {
            Ok(WriteOutcome::Applied) => {
                debug!("Synced {} -> {:?}", link.full_name, success);
                success
            }
            Ok(WriteOutcome::Conflict) => {
                info!("{} was edited during sync, leaving it for the next run", link.full_name);
                ProjectOutcome::Skipped
            }
            Err(e) => ProjectOutcome::Failed(format!("{}: {:#}", link.full_name, e)),
        }
    }

    fn record_failure(&self, message: &str) {
        if let Err(e) = self.store.record_sync_outcome(Utc::now(), Some(message)) {
            error!("Failed to record sync failure: {:#}", e);
        }
    }
}

fn compile_summary(outcomes: impl IntoIterator<Item = ProjectOutcome>) -> SyncSummary {
    let mut summary = SyncSummary::default();

    for outcome in outcomes {
        match outcome {
            ProjectOutcome::Synced => summary.synced += 1,
            ProjectOutcome::Hidden => summary.hidden += 1,
            ProjectOutcome::Failed(message) => summary.errors.push(message),
            ProjectOutcome::Skipped => summary.skipped += 1,
            ProjectOutcome::Cancelled => summary.cancelled = true,
        }
    }

    summary
}
