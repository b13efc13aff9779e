//! Connection service - link, unlink and inspect the GitHub account

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::GitHubConfig;
use crate::github::GitHubClient;
use crate::store::{ProjectCounts, ProjectStore, ProviderConnection};
use crate::vault::TokenVault;

/// Snapshot of the link and the projects it feeds
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    pub projects: u64,
    pub synced_projects: u64,
    pub hidden_projects: u64,
}

impl ConnectionStatus {
    fn new(connection: Option<&ProviderConnection>, counts: ProjectCounts) -> Self {
        Self {
            connected: connection.is_some(),
            username: connection.map(|c| c.username.clone()),
            avatar_url: connection.and_then(|c| c.avatar_url.clone()),
            connected_at: connection.map(|c| c.connected_at),
            last_sync_at: connection.and_then(|c| c.last_sync_at),
            sync_error: connection.and_then(|c| c.sync_error.clone()),
            projects: counts.total,
            synced_projects: counts.synced,
            hidden_projects: counts.hidden,
        }
    }
}

/// Validate `token` against GitHub, then store it encrypted.
///
/// Replaces any previous connection. Nothing is stored when the token is
/// rejected or no encryption secret is configured.
pub async fn connect(
    store: &ProjectStore,
    vault: &TokenVault,
    github: &GitHubConfig,
    token: &str,
) -> Result<ProviderConnection> {
    let token = token.trim();
    if token.is_empty() {
        anyhow::bail!("GitHub token is empty");
    }
    if !vault.is_keyed() {
        anyhow::bail!("Encryption secret is not configured; refusing to store the token");
    }

    let client = GitHubClient::new(token, github).context("Failed to create GitHub client")?;
    let profile = client
        .current_user()
        .await
        .context("GitHub did not accept the token")?;

    let sealed = vault.encrypt(token).context("Failed to encrypt token")?;
    let connection = store.save_connection(&sealed, &profile.login, profile.avatar_url.as_deref())?;

    info!("Connected GitHub account {}", profile.login);
    Ok(connection)
}

/// Forget the stored credential; projects stay as they are
pub fn disconnect(store: &ProjectStore) -> Result<bool> {
    let removed = store.delete_connection()?;
    if removed {
        info!("Disconnected GitHub account");
    }
    Ok(removed)
}

pub fn status(store: &ProjectStore) -> Result<ConnectionStatus> {
    let connection = store.load_connection()?;
    let counts = store.project_counts()?;
    Ok(ConnectionStatus::new(connection.as_ref(), counts))
}
