//! portfolio-sync - GitHub import and synchronization for a portfolio CMS
//!
//! Links one GitHub account, imports selected repositories as portfolio
//! projects and keeps them in step with upstream without overwriting what the
//! user has edited by hand.
//!
//! ## Core Features
//!
//! - **Encrypted credential**: the access token is stored sealed with ChaCha20-Poly1305
//! - **Catalog**: paginated listing, client-side search and language filters
//! - **Import**: batch import with duplicate detection and display ordering
//! - **Reconciliation**: bounded-parallel sync that respects customized fields
//!   and hides projects whose repositories disappear
//! - **Triggers**: HTTP endpoint for external schedulers or an in-process daemon
//!
//! ## Modules
//!
//! - [`config`]: YAML configuration with environment overrides for secrets
//! - [`vault`]: credential encryption
//! - [`github`]: GitHub REST client and the [`RepoProvider`] seam
//! - [`store`]: SQLite persistence
//! - [`sync`]: the reconciler

pub mod catalog;
pub mod config;
pub mod connection;
pub mod customization;
pub mod daemon;
pub mod github;
pub mod health;
pub mod import;
pub mod retry;
pub mod server;
pub mod store;
pub mod sync;
pub mod vault;

pub use catalog::{CatalogItem, CatalogPage, RepoCatalog};
pub use config::Config;
pub use customization::{CustomizedFields, FieldEdits, Provenance, SyncableField};
pub use daemon::Daemon;
pub use github::{GitHubClient, ProviderError, RepoProvider, SortKey, UpstreamRepo};
pub use health::HealthCheck;
pub use import::{ImportError, ImportOutcome};
pub use store::{HiddenBy, Project, ProjectStore, ProviderConnection};
pub use sync::{ReconcileError, SyncReconciler, SyncSummary};
pub use vault::{TokenVault, VaultError};
