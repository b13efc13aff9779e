//! Import - turn selected repositories into new synced projects

use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, warn};

use crate::catalog::CatalogItem;
use crate::github::{ProviderError, RepoProvider, UpstreamRepo};
use crate::store::{NewProject, ProjectStore};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("nothing to import: every selected repository is already a project")]
    NothingToImport,

    #[error("could not fetch {full_name}: {source}")]
    Provider {
        full_name: String,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// What an import wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Ids of the created projects, in selection order
    pub project_ids: Vec<i64>,
    /// Full names skipped because they were already imported or repeated
    pub skipped: Vec<String>,
}

impl ImportOutcome {
    pub fn imported(&self) -> usize {
        self.project_ids.len()
    }
}

/// Create projects for the selected repositories in one transaction.
///
/// Repositories whose upstream id is already linked, or that repeat within the
/// selection, are skipped. New projects get display orders `max_order + 1`,
/// `max_order + 2`, ... in selection order.
pub fn import_repositories(
    store: &ProjectStore,
    selected: &[CatalogItem],
    max_order: i64,
) -> Result<ImportOutcome, ImportError> {
    let mut seen = store.synced_repo_ids()?;
    let mut skipped = Vec::new();
    let mut batch = Vec::new();

    for item in selected {
        if !seen.insert(item.id) {
            skipped.push(item.full_name.clone());
            continue;
        }
        let order = max_order + batch.len() as i64 + 1;
        batch.push(NewProject::from_upstream(&UpstreamRepo::from(item.clone()), order));
    }

    if batch.is_empty() {
        return Err(ImportError::NothingToImport);
    }

    let project_ids = store.insert_projects_batch(&batch)?;

    info!(
        "Imported {} repositories ({} skipped)",
        project_ids.len(),
        skipped.len()
    );
    Ok(ImportOutcome {
        project_ids,
        skipped,
    })
}

/// Fetch each named repository and import the lot after the current last project
pub async fn import_by_full_names(
    store: &ProjectStore,
    provider: &dyn RepoProvider,
    full_names: &[String],
) -> Result<ImportOutcome, ImportError> {
    let mut requested = HashSet::new();
    let mut selected = Vec::with_capacity(full_names.len());

    for full_name in full_names {
        if !requested.insert(full_name.to_lowercase()) {
            warn!("{} selected twice, importing once", full_name);
            continue;
        }
        let repo = provider
            .fetch_repo(full_name)
            .await
            .map_err(|source| ImportError::Provider {
                full_name: full_name.clone(),
                source,
            })?;
        selected.push(CatalogItem::from(repo));
    }

    let max_order = store.max_display_order()?;
    import_repositories(store, &selected, max_order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::MockRepoProvider;
    use assert_matches::assert_matches;

    fn item(id: u64, name: &str) -> CatalogItem {
        CatalogItem {
            id,
            name: name.to_string(),
            full_name: format!("octo/{}", name),
            description: None,
            html_url: Some(format!("https://github.com/octo/{}", name)),
            stars: 1,
            forks: 0,
            language: Some("Go".to_string()),
            private: false,
            updated_at: None,
            topics: vec![],
        }
    }

    #[test]
    fn imports_in_selection_order_after_max() {
        let store = ProjectStore::open_in_memory().unwrap();

        let outcome =
            import_repositories(&store, &[item(10, "b"), item(11, "a")], 4).unwrap();
        assert_eq!(outcome.imported(), 2);
        assert!(outcome.skipped.is_empty());

        let projects = store.list_projects().unwrap();
        assert_eq!(projects[0].title, "b");
        assert_eq!(projects[0].display_order, 5);
        assert_eq!(projects[1].title, "a");
        assert_eq!(projects[1].display_order, 6);

        for project in &projects {
            assert!(project.is_github_synced);
            assert!(project.visible);
            assert!(project.customized_fields.is_empty());
            assert_eq!(project.technologies, vec!["Go".to_string()]);
            assert_eq!(project.description, "");
        }
    }

    #[test]
    fn skips_existing_and_repeated_ids() {
        let store = ProjectStore::open_in_memory().unwrap();
        import_repositories(&store, &[item(1, "a")], 0).unwrap();

        let outcome =
            import_repositories(&store, &[item(1, "a"), item(2, "b"), item(2, "b")], 1).unwrap();

        assert_eq!(outcome.imported(), 1);
        assert_eq!(outcome.skipped, vec!["octo/a".to_string(), "octo/b".to_string()]);
        assert_eq!(store.list_projects().unwrap().len(), 2);
        // only created projects consume display order values
        assert_eq!(store.max_display_order().unwrap(), 2);
    }

    #[test]
    fn all_duplicates_writes_nothing() {
        let store = ProjectStore::open_in_memory().unwrap();
        import_repositories(&store, &[item(1, "a")], 0).unwrap();

        let err = import_repositories(&store, &[item(1, "a")], 1).unwrap_err();
        assert_matches!(err, ImportError::NothingToImport);
        assert_eq!(store.list_projects().unwrap().len(), 1);
    }

    #[test]
    fn empty_selection_is_nothing_to_import() {
        let store = ProjectStore::open_in_memory().unwrap();
        assert_matches!(
            import_repositories(&store, &[], 0),
            Err(ImportError::NothingToImport)
        );
    }

    #[tokio::test]
    async fn import_by_name_fetches_and_appends() {
        let store = ProjectStore::open_in_memory().unwrap();
        import_repositories(&store, &[item(1, "a")], 2).unwrap();

        let mut provider = MockRepoProvider::new();
        provider
            .expect_fetch_repo()
            .withf(|name| name == "octo/b")
            .times(1)
            .returning(|_| Ok(UpstreamRepo::from(item(2, "b"))));

        let names = vec!["octo/b".to_string(), "OCTO/B".to_string()];
        let outcome = import_by_full_names(&store, &provider, &names).await.unwrap();

        assert_eq!(outcome.imported(), 1);
        let project = store.get_project(outcome.project_ids[0]).unwrap().unwrap();
        assert_eq!(project.display_order, 4);
    }

    #[tokio::test]
    async fn import_by_name_reports_fetch_failure() {
        let store = ProjectStore::open_in_memory().unwrap();

        let mut provider = MockRepoProvider::new();
        provider
            .expect_fetch_repo()
            .returning(|name| Err(ProviderError::NotFound(name.to_string())));

        let names = vec!["octo/missing".to_string()];
        let err = import_by_full_names(&store, &provider, &names).await.unwrap_err();
        assert_matches!(err, ImportError::Provider { ref full_name, .. } if full_name == "octo/missing");
        assert!(store.list_projects().unwrap().is_empty());
    }
}
