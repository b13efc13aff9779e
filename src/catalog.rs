//! Repository catalog - browse the connected account's repositories
//!
//! Listing maps straight onto upstream pagination. Search and the language list
//! work on one bounded sample of the most recently updated repositories and
//! filter locally, so results on very large accounts are approximate.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::GitHubConfig;
use crate::github::{ListQuery, ProviderError, RepoProvider, SortKey, UpstreamRepo};

const MAX_PAGE_SIZE: u8 = 100;

/// A repository as presented for selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogItem {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    pub description: Option<String>,
    pub html_url: Option<String>,
    pub stars: u32,
    pub forks: u32,
    pub language: Option<String>,
    pub private: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub topics: Vec<String>,
}

impl From<UpstreamRepo> for CatalogItem {
    fn from(repo: UpstreamRepo) -> Self {
        Self {
            id: repo.id,
            name: repo.name,
            full_name: repo.full_name,
            description: repo.description,
            html_url: repo.html_url,
            stars: repo.stars,
            forks: repo.forks,
            language: repo.language,
            private: repo.private,
            updated_at: repo.updated_at,
            topics: repo.topics,
        }
    }
}

impl From<CatalogItem> for UpstreamRepo {
    fn from(item: CatalogItem) -> Self {
        Self {
            id: item.id,
            name: item.name,
            full_name: item.full_name,
            description: item.description,
            html_url: item.html_url,
            stars: item.stars,
            forks: item.forks,
            language: item.language,
            private: item.private,
            updated_at: item.updated_at,
            topics: item.topics,
        }
    }
}

impl CatalogItem {
    fn matches(&self, needle: &str, language: Option<&str>) -> bool {
        if let Some(language) = language {
            let same = self
                .language
                .as_deref()
                .is_some_and(|l| l.eq_ignore_ascii_case(language));
            if !same {
                return false;
            }
        }

        if needle.is_empty() {
            return true;
        }

        self.name.to_lowercase().contains(needle)
            || self.full_name.to_lowercase().contains(needle)
            || self
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(needle))
            || self.topics.iter().any(|t| t.to_lowercase().contains(needle))
    }
}

/// One page of catalog results
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogPage {
    pub items: Vec<CatalogItem>,
    pub page: u32,
    pub page_size: u8,
    /// Known only when the full result set was seen
    pub total: Option<usize>,
    pub has_more: bool,
    /// True when results were computed over a truncated sample
    pub approximate: bool,
}

/// Read-only view over the account's repositories
pub struct RepoCatalog<'a> {
    provider: &'a dyn RepoProvider,
    search_sample: u8,
    language_sample: u8,
}

impl<'a> RepoCatalog<'a> {
    pub fn new(provider: &'a dyn RepoProvider, config: &GitHubConfig) -> Self {
        Self {
            provider,
            search_sample: clamp_page_size(config.search_sample_size),
            language_sample: clamp_page_size(config.language_sample_size),
        }
    }

    /// One upstream page, in the requested order
    pub async fn list(
        &self,
        page: u32,
        page_size: u8,
        sort: SortKey,
    ) -> Result<CatalogPage, ProviderError> {
        let page = page.max(1);
        let page_size = clamp_page_size(page_size);

        let result = self
            .provider
            .list_repos(&ListQuery {
                page,
                per_page: page_size,
                sort,
            })
            .await?;

        let has_more = result.next_page.is_some();
        let items: Vec<CatalogItem> = result.repos.into_iter().map(CatalogItem::from).collect();

        // with no next page, everything before this page was full; an empty
        // page past the end says nothing about how many came before
        let total = (!has_more && (!items.is_empty() || page == 1))
            .then(|| (page as usize - 1) * page_size as usize + items.len());

        Ok(CatalogPage {
            items,
            page,
            page_size,
            total,
            has_more,
            approximate: false,
        })
    }

    /// Case-insensitive search over name, full name, description and topics
    pub async fn search(
        &self,
        query: &str,
        language: Option<&str>,
        page: u32,
        page_size: u8,
    ) -> Result<CatalogPage, ProviderError> {
        let page = page.max(1);
        let page_size = clamp_page_size(page_size);
        let needle = query.trim().to_lowercase();
        let language = language.map(str::trim).filter(|l| !l.is_empty());

        let (sample, truncated) = self.sample(self.search_sample).await?;
        let matches: Vec<CatalogItem> = sample
            .into_iter()
            .filter(|item| item.matches(&needle, language))
            .collect();

        let total = matches.len();
        let start = (page as usize - 1) * page_size as usize;
        let items: Vec<CatalogItem> = matches
            .into_iter()
            .skip(start)
            .take(page_size as usize)
            .collect();
        let has_more = start + items.len() < total;

        debug!(
            "Search '{}' matched {} repositories (truncated sample: {})",
            needle, total, truncated
        );

        Ok(CatalogPage {
            items,
            page,
            page_size,
            total: Some(total),
            has_more,
            approximate: truncated,
        })
    }

    /// Sorted languages across a sample of repositories, distinct ignoring
    /// case; the first spelling seen wins
    pub async fn languages(&self) -> Result<Vec<String>, ProviderError> {
        let (sample, _) = self.sample(self.language_sample).await?;

        let mut languages: BTreeMap<String, String> = BTreeMap::new();
        for language in sample.into_iter().filter_map(|item| item.language) {
            let language = language.trim();
            if language.is_empty() {
                continue;
            }
            languages
                .entry(language.to_lowercase())
                .or_insert_with(|| language.to_string());
        }

        Ok(languages.into_values().collect())
    }

    async fn sample(&self, size: u8) -> Result<(Vec<CatalogItem>, bool), ProviderError> {
        let result = self
            .provider
            .list_repos(&ListQuery {
                page: 1,
                per_page: size,
                sort: SortKey::Updated,
            })
            .await?;

        let truncated = result.next_page.is_some() || result.repos.len() >= size as usize;
        let items = result.repos.into_iter().map(CatalogItem::from).collect();
        Ok((items, truncated))
    }
}

fn clamp_page_size(size: u8) -> u8 {
    size.clamp(1, MAX_PAGE_SIZE)
}
