//! Project Store - SQLite persistence for the provider connection and projects
//!
//! This module provides persistent storage for:
//! - The single provider connection (encrypted credential, profile, last sync outcome)
//! - Project records, including GitHub linkage, stats and customization state
//!
//! Every project write bumps `version`; reconciler writes are conditional on the
//! version they read, so a concurrent user edit turns them into a no-op.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::customization::{
    compute_customized_fields, CustomizedFields, FieldEdits, SyncableField, SyncableValues,
};
use crate::github::UpstreamRepo;

/// Who took a project off the public listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenBy {
    /// The reconciler could not reach the upstream repository
    Sync,
    /// The user chose to hide it
    User,
}

impl HiddenBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            HiddenBy::Sync => "sync",
            HiddenBy::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(HiddenBy::Sync),
            "user" => Some(HiddenBy::User),
            _ => None,
        }
    }
}

/// Upstream statistics; always overwritten on sync, never customizable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoStats {
    pub stars: u32,
    pub forks: u32,
    pub language: Option<String>,
}

impl From<&UpstreamRepo> for RepoStats {
    fn from(repo: &UpstreamRepo) -> Self {
        Self {
            stars: repo.stars,
            forks: repo.forks,
            language: repo.language.clone(),
        }
    }
}

/// Upstream identity of a synced project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubLink {
    pub repo_id: u64,
    pub full_name: String,
}

/// The stored provider link
#[derive(Clone)]
pub struct ProviderConnection {
    pub encrypted_token: String,
    pub username: String,
    pub avatar_url: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
}

impl fmt::Debug for ProviderConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConnection")
            .field("username", &self.username)
            .field("avatar_url", &self.avatar_url)
            .field("connected_at", &self.connected_at)
            .field("last_sync_at", &self.last_sync_at)
            .field("sync_error", &self.sync_error)
            .finish_non_exhaustive()
    }
}

/// Project record
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub github_repo_id: Option<u64>,
    pub github_full_name: Option<String>,
    pub github_url: Option<String>,
    pub stats: RepoStats,
    pub technologies: Vec<String>,
    pub is_github_synced: bool,
    pub customized_fields: CustomizedFields,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub visible: bool,
    pub hidden_by: Option<HiddenBy>,
    pub display_order: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Upstream identity, present only for synced projects
    pub fn github_link(&self) -> Option<GitHubLink> {
        if !self.is_github_synced {
            return None;
        }
        match (self.github_repo_id, &self.github_full_name) {
            (Some(repo_id), Some(full_name)) => Some(GitHubLink {
                repo_id,
                full_name: full_name.clone(),
            }),
            _ => None,
        }
    }

    pub fn syncable_values(&self) -> SyncableValues {
        SyncableValues {
            title: self.title.clone(),
            description: self.description.clone(),
        }
    }
}

/// A project about to be inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewProject {
    pub title: String,
    pub description: String,
    link: Option<GitHubLink>,
    pub github_url: Option<String>,
    pub stats: RepoStats,
    pub technologies: Vec<String>,
    pub display_order: i64,
}

impl NewProject {
    /// A synced project seeded from an upstream repository
    pub fn from_upstream(repo: &UpstreamRepo, display_order: i64) -> Self {
        Self {
            title: repo.name.clone(),
            description: repo.description.clone().unwrap_or_default(),
            link: Some(GitHubLink {
                repo_id: repo.id,
                full_name: repo.full_name.clone(),
            }),
            github_url: repo.html_url.clone(),
            stats: RepoStats::from(repo),
            technologies: repo.language.iter().cloned().collect(),
            display_order,
        }
    }

    /// A project entered by hand, not linked to any repository
    pub fn manual(title: impl Into<String>, description: impl Into<String>, display_order: i64) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            link: None,
            github_url: None,
            stats: RepoStats::default(),
            technologies: Vec::new(),
            display_order,
        }
    }

    pub fn link(&self) -> Option<&GitHubLink> {
        self.link.as_ref()
    }
}

/// What a reconciler pass wants to write for one project
#[derive(Debug, Clone, PartialEq)]
pub enum SyncUpdate {
    /// Upstream answered; `None` fields are customized and left alone
    Refreshed {
        title: Option<String>,
        description: Option<String>,
        github_url: Option<String>,
        stats: RepoStats,
        synced_at: DateTime<Utc>,
    },
    /// Upstream is gone or forbidden
    Unreachable { synced_at: DateTime<Utc> },
}

/// Result of a version-guarded write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The row changed (or vanished) since it was read
    Conflict,
}

/// Project totals for status output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectCounts {
    pub total: u64,
    pub synced: u64,
    pub hidden: u64,
}

const PROJECT_COLUMNS: &str = "id, title, description, github_repo_id, github_full_name, github_url, \
     stars, forks, language, technologies, is_github_synced, customized_fields, last_synced_at, \
     visible, hidden_by, display_order, version, created_at, updated_at";

/// SQLite-backed store
pub struct ProjectStore {
    conn: Mutex<Connection>,
}

impl fmt::Debug for ProjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectStore").finish_non_exhaustive()
    }
}

impl ProjectStore {
    /// Open or create the database at a specific path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;

        info!("Project store opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("project store lock poisoned"))
    }

    fn initialize(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS provider_connection (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    encrypted_token TEXT NOT NULL,
                    username TEXT NOT NULL,
                    avatar_url TEXT,
                    connected_at TEXT NOT NULL,
                    last_sync_at TEXT,
                    sync_error TEXT
                );

                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    github_repo_id INTEGER UNIQUE,
                    github_full_name TEXT,
                    github_url TEXT,
                    stars INTEGER NOT NULL DEFAULT 0,
                    forks INTEGER NOT NULL DEFAULT 0,
                    language TEXT,
                    technologies TEXT NOT NULL DEFAULT '[]',
                    is_github_synced INTEGER NOT NULL DEFAULT 0,
                    customized_fields TEXT NOT NULL DEFAULT '[]',
                    last_synced_at TEXT,
                    visible INTEGER NOT NULL DEFAULT 1,
                    hidden_by TEXT CHECK (hidden_by IS NULL OR hidden_by IN ('sync', 'user')),
                    display_order INTEGER NOT NULL DEFAULT 0,
                    version INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    CHECK (is_github_synced = 0
                        OR (github_repo_id IS NOT NULL AND github_full_name IS NOT NULL))
                );

                CREATE INDEX IF NOT EXISTS idx_projects_synced ON projects(is_github_synced, display_order);
                "#,
            )
            .context("Failed to initialize database schema")?;

        debug!("Database schema initialized");
        Ok(())
    }

    // =========================================================================
    // Provider Connection
    // =========================================================================

    /// Create or replace the single provider connection
    pub fn save_connection(
        &self,
        encrypted_token: &str,
        username: &str,
        avatar_url: Option<&str>,
    ) -> Result<ProviderConnection> {
        let now = Utc::now();
        self.conn()?
            .execute(
                r#"
                INSERT OR REPLACE INTO provider_connection
                    (id, encrypted_token, username, avatar_url, connected_at, last_sync_at, sync_error)
                VALUES (1, ?1, ?2, ?3, ?4, NULL, NULL)
                "#,
                params![encrypted_token, username, avatar_url, now.to_rfc3339()],
            )
            .context("Failed to save provider connection")?;

        debug!("Saved provider connection for {}", username);
        Ok(ProviderConnection {
            encrypted_token: encrypted_token.to_string(),
            username: username.to_string(),
            avatar_url: avatar_url.map(str::to_string),
            connected_at: now,
            last_sync_at: None,
            sync_error: None,
        })
    }

    pub fn load_connection(&self) -> Result<Option<ProviderConnection>> {
        self.conn()?
            .query_row(
                r#"
                SELECT encrypted_token, username, avatar_url, connected_at, last_sync_at, sync_error
                FROM provider_connection
                WHERE id = 1
                "#,
                [],
                |row| {
                    Ok(ProviderConnection {
                        encrypted_token: row.get(0)?,
                        username: row.get(1)?,
                        avatar_url: row.get(2)?,
                        connected_at: parse_timestamp(row.get(3)?).unwrap_or_else(Utc::now),
                        last_sync_at: parse_timestamp(row.get(4)?),
                        sync_error: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("Failed to query provider connection")
    }

    /// Remove the provider connection; projects are kept. Returns whether one existed.
    pub fn delete_connection(&self) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM provider_connection WHERE id = 1", [])
            .context("Failed to delete provider connection")?;
        Ok(removed > 0)
    }

    /// Stamp the outcome of a reconciliation run on the connection row
    pub fn record_sync_outcome(&self, at: DateTime<Utc>, error: Option<&str>) -> Result<()> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE provider_connection SET last_sync_at = ?1, sync_error = ?2 WHERE id = 1",
                params![at.to_rfc3339(), error],
            )
            .context("Failed to record sync outcome")?;

        if updated == 0 {
            debug!("No provider connection to record sync outcome on");
        }
        Ok(())
    }

    // =========================================================================
    // Projects
    // =========================================================================

    pub fn insert_project(&self, project: &NewProject) -> Result<i64> {
        let mut ids = self.insert_projects_batch(std::slice::from_ref(project))?;
        ids.pop().ok_or_else(|| anyhow!("insert returned no id"))
    }

    /// Insert all projects in one transaction; nothing is written if any insert fails
    pub fn insert_projects_batch(&self, projects: &[NewProject]) -> Result<Vec<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let now = Utc::now().to_rfc3339();
        let mut ids = Vec::with_capacity(projects.len());

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO projects (
                    title, description, github_repo_id, github_full_name, github_url,
                    stars, forks, language, technologies, is_github_synced, customized_fields,
                    visible, hidden_by, display_order, version, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, '[]', 1, NULL, ?11, 1, ?12, ?12)
                "#,
            )?;

            for project in projects {
                let technologies = serde_json::to_string(&project.technologies)
                    .context("Failed to encode technologies")?;
                stmt.execute(params![
                    project.title,
                    project.description,
                    project.link.as_ref().map(|l| l.repo_id as i64),
                    project.link.as_ref().map(|l| l.full_name.as_str()),
                    project.github_url,
                    project.stats.stars,
                    project.stats.forks,
                    project.stats.language,
                    technologies,
                    project.link.is_some(),
                    project.display_order,
                    now,
                ])
                .with_context(|| format!("Failed to insert project '{}'", project.title))?;
                ids.push(tx.last_insert_rowid());
            }
        }

        tx.commit().context("Failed to commit project batch")?;
        debug!("Inserted {} project(s)", ids.len());
        Ok(ids)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let conn = self.conn()?;
        query_project(&conn, id)
    }

    /// All projects in display order
    pub fn list_projects(&self) -> Result<Vec<Project>> {
        self.query_projects("")
    }

    /// Projects linked to an upstream repository, in display order
    pub fn list_synced_projects(&self) -> Result<Vec<Project>> {
        self.query_projects("WHERE is_github_synced = 1")
    }

    fn query_projects(&self, filter: &str) -> Result<Vec<Project>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM projects {} ORDER BY display_order ASC, id ASC",
            PROJECT_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;

        let projects = stmt
            .query_map([], project_from_row)
            .context("Failed to query projects")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect projects")?;

        Ok(projects)
    }

    /// Upstream ids already linked to a project
    pub fn synced_repo_ids(&self) -> Result<HashSet<u64>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT github_repo_id FROM projects WHERE github_repo_id IS NOT NULL")?;

        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .context("Failed to query repository ids")?
            .map(|id| id.map(|id| id as u64))
            .collect::<Result<HashSet<_>, _>>()
            .context("Failed to collect repository ids")?;

        Ok(ids)
    }

    /// Highest display order in use, 0 when there are no projects
    pub fn max_display_order(&self) -> Result<i64> {
        self.conn()?
            .query_row(
                "SELECT COALESCE(MAX(display_order), 0) FROM projects",
                [],
                |row| row.get(0),
            )
            .context("Failed to query display order")
    }

    pub fn project_counts(&self) -> Result<ProjectCounts> {
        self.conn()?
            .query_row(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(is_github_synced), 0),
                       COALESCE(SUM(CASE WHEN visible = 0 THEN 1 ELSE 0 END), 0)
                FROM projects
                "#,
                [],
                |row| {
                    Ok(ProjectCounts {
                        total: row.get::<_, i64>(0)? as u64,
                        synced: row.get::<_, i64>(1)? as u64,
                        hidden: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .context("Failed to count projects")
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a reconciler result if the project is still at `expected_version`
    pub fn apply_sync_update(
        &self,
        id: i64,
        expected_version: i64,
        update: &SyncUpdate,
    ) -> Result<WriteOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let now = Utc::now().to_rfc3339();

        let changed = match update {
            SyncUpdate::Refreshed {
                title,
                description,
                github_url,
                stats,
                synced_at,
            } => tx.execute(
                r#"
                UPDATE projects SET
                    title = COALESCE(?3, title),
                    description = COALESCE(?4, description),
                    github_url = COALESCE(?5, github_url),
                    stars = ?6,
                    forks = ?7,
                    language = ?8,
                    last_synced_at = ?9,
                    visible = CASE WHEN hidden_by = 'sync' THEN 1 ELSE visible END,
                    hidden_by = CASE WHEN hidden_by = 'sync' THEN NULL ELSE hidden_by END,
                    version = version + 1,
                    updated_at = ?10
                WHERE id = ?1 AND version = ?2
                "#,
                params![
                    id,
                    expected_version,
                    title,
                    description,
                    github_url,
                    stats.stars,
                    stats.forks,
                    stats.language,
                    synced_at.to_rfc3339(),
                    now,
                ],
            ),
            SyncUpdate::Unreachable { synced_at } => tx.execute(
                r#"
                UPDATE projects SET
                    visible = 0,
                    hidden_by = CASE WHEN hidden_by = 'user' THEN 'user' ELSE 'sync' END,
                    last_synced_at = ?3,
                    version = version + 1,
                    updated_at = ?4
                WHERE id = ?1 AND version = ?2
                "#,
                params![id, expected_version, synced_at.to_rfc3339(), now],
            ),
        }
        .with_context(|| format!("Failed to apply sync update to project {}", id))?;

        tx.commit().context("Failed to commit sync update")?;

        if changed == 0 {
            debug!("Project {} changed since version {}; sync write skipped", id, expected_version);
            return Ok(WriteOutcome::Conflict);
        }
        Ok(WriteOutcome::Applied)
    }

    /// Apply a user edit, recording newly customized fields in the same transaction
    pub fn apply_user_edit(&self, id: i64, edits: &FieldEdits) -> Result<Option<Project>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let Some(current) = query_project(&tx, id)? else {
            return Ok(None);
        };

        let customized = if current.is_github_synced {
            compute_customized_fields(&current.customized_fields, &current.syncable_values(), edits)
        } else {
            current.customized_fields.clone()
        };
        let customized_json =
            serde_json::to_string(&customized).context("Failed to encode customized fields")?;

        tx.execute(
            r#"
            UPDATE projects SET
                title = COALESCE(?2, title),
                description = COALESCE(?3, description),
                customized_fields = ?4,
                version = version + 1,
                updated_at = ?5
            WHERE id = ?1
            "#,
            params![
                id,
                edits.title,
                edits.description,
                customized_json,
                Utc::now().to_rfc3339()
            ],
        )
        .with_context(|| format!("Failed to update project {}", id))?;

        let updated = query_project(&tx, id)?;
        tx.commit().context("Failed to commit user edit")?;

        debug!("Applied user edit to project {}", id);
        Ok(updated)
    }

    /// Explicit visibility choice by the user
    pub fn set_visibility(&self, id: i64, visible: bool) -> Result<Option<Project>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let hidden_by = (!visible).then_some(HiddenBy::User.as_str());

        let changed = tx
            .execute(
                r#"
                UPDATE projects SET
                    visible = ?2,
                    hidden_by = ?3,
                    version = version + 1,
                    updated_at = ?4
                WHERE id = ?1
                "#,
                params![id, visible, hidden_by, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("Failed to update visibility of project {}", id))?;

        if changed == 0 {
            return Ok(None);
        }

        let updated = query_project(&tx, id)?;
        tx.commit().context("Failed to commit visibility change")?;
        Ok(updated)
    }

    /// Write an upstream value back and drop the field from the customized set
    pub fn reset_field_value(&self, id: i64, field: SyncableField, value: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let mut project =
            query_project(&tx, id)?.ok_or_else(|| anyhow!("project {} not found", id))?;
        project.customized_fields.remove(field);
        let customized_json = serde_json::to_string(&project.customized_fields)
            .context("Failed to encode customized fields")?;

        let sql = match field {
            SyncableField::Title => {
                "UPDATE projects SET title = ?2, customized_fields = ?3, version = version + 1, updated_at = ?4 WHERE id = ?1"
            }
            SyncableField::Description => {
                "UPDATE projects SET description = ?2, customized_fields = ?3, version = version + 1, updated_at = ?4 WHERE id = ?1"
            }
        };

        tx.execute(
            sql,
            params![id, value, customized_json, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("Failed to reset {} of project {}", field, id))?;

        tx.commit().context("Failed to commit field reset")?;
        Ok(())
    }
}

fn query_project(conn: &Connection, id: i64) -> Result<Option<Project>> {
    let sql = format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS);
    conn.query_row(&sql, params![id], project_from_row)
        .optional()
        .with_context(|| format!("Failed to query project {}", id))
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        github_repo_id: row.get::<_, Option<i64>>(3)?.map(|id| id as u64),
        github_full_name: row.get(4)?,
        github_url: row.get(5)?,
        stats: RepoStats {
            stars: row.get(6)?,
            forks: row.get(7)?,
            language: row.get(8)?,
        },
        technologies: json_column(row, 9)?,
        is_github_synced: row.get(10)?,
        customized_fields: json_column(row, 11)?,
        last_synced_at: parse_timestamp(row.get(12)?),
        visible: row.get(13)?,
        hidden_by: row
            .get::<_, Option<String>>(14)?
            .and_then(|s| HiddenBy::parse(&s)),
        display_order: row.get(15)?,
        version: row.get(16)?,
        created_at: parse_timestamp(row.get(17)?).unwrap_or_else(Utc::now),
        updated_at: parse_timestamp(row.get(18)?).unwrap_or_else(Utc::now),
    })
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
