//! Common test utilities and helpers for portfolio-sync tests
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use portfolio_sync::{Config, ProjectStore, TokenVault};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const TEST_SECRET: &str = "integration-secret";

/// Temporary home for a config file and database
pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.temp_dir.path().join("portfolio.db")
    }

    pub fn config_path(&self) -> PathBuf {
        self.temp_dir.path().join("config.yml")
    }

    /// Config pointing at the temp database, optionally at a mock API
    pub fn config(&self, api_url: Option<&str>) -> Config {
        let mut config = Config::default();
        config.database_path = self.database_path().to_string_lossy().into_owned();
        config.security.encryption_secret = Some(TEST_SECRET.to_string());
        config.github.retry_min_delay_ms = 0;
        config.github.retry_max_delay_ms = 0;
        if let Some(url) = api_url {
            config.github.api_url = url.to_string();
        }
        config
    }

    /// Write a minimal YAML config for the CLI
    pub fn create_minimal_config(&self) -> PathBuf {
        let content = format!(
            "database_path: \"{}\"\nlogging:\n  level: \"warn\"\n  color: false\n",
            self.database_path().display()
        );
        let path = self.config_path();
        std::fs::write(&path, content).expect("Failed to write test config");
        path
    }

    pub fn open_store(&self) -> Arc<ProjectStore> {
        Arc::new(ProjectStore::open(&self.database_path()).expect("Failed to open store"))
    }

    /// Store a credential sealed with the test secret
    pub fn connect(&self, store: &ProjectStore, token: &str) {
        let sealed = TokenVault::new(Some(TEST_SECRET))
            .encrypt(token)
            .expect("Failed to seal token");
        store
            .save_connection(&sealed, "octocat", None)
            .expect("Failed to save connection");
    }
}

/// Repository payload as GitHub returns it
pub fn repo_json(id: u64, full_name: &str) -> Value {
    let name = full_name.split('/').nth(1).unwrap_or(full_name);
    json!({
        "id": id,
        "name": name,
        "full_name": full_name,
        "description": format!("{} description", name),
        "html_url": format!("https://github.com/{}", full_name),
        "stargazers_count": 12,
        "forks_count": 3,
        "language": "Rust",
        "private": false,
        "updated_at": "2025-01-15T10:00:00Z",
        "topics": ["cli"]
    })
}

/// Full `/user` payload
pub fn user_json(login: &str) -> Value {
    let base = format!("https://api.github.com/users/{}", login);
    json!({
        "login": login,
        "id": 583231,
        "node_id": "MDQ6VXNlcjU4MzIzMQ==",
        "avatar_url": "https://avatars.githubusercontent.com/u/583231?v=4",
        "gravatar_id": "",
        "url": base,
        "html_url": format!("https://github.com/{}", login),
        "followers_url": format!("{}/followers", base),
        "following_url": format!("{}/following{{/other_user}}", base),
        "gists_url": format!("{}/gists{{/gist_id}}", base),
        "starred_url": format!("{}/starred{{/owner}}{{/repo}}", base),
        "subscriptions_url": format!("{}/subscriptions", base),
        "organizations_url": format!("{}/orgs", base),
        "repos_url": format!("{}/repos", base),
        "events_url": format!("{}/events{{/privacy}}", base),
        "received_events_url": format!("{}/received_events", base),
        "type": "User",
        "site_admin": false,
        "name": "The Octocat",
        "company": null,
        "blog": "",
        "location": null,
        "email": null,
        "hireable": null,
        "bio": null,
        "twitter_username": null,
        "public_repos": 8,
        "public_gists": 8,
        "followers": 100,
        "following": 9,
        "created_at": "2011-01-25T18:44:36Z",
        "updated_at": "2025-01-22T12:19:22Z"
    })
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
