//! GitHub Client - authenticated, rate-limit aware access to the REST API
//!
//! Failures are classified into [`ProviderError`] from the status code, the
//! `x-ratelimit-*` and `retry-after` headers and the response message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use reqwest::header::{HeaderMap, ACCEPT, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::config::GitHubConfig;
use crate::retry::RetryPolicy;

const API_VERSION: &str = "2022-11-28";
const CLIENT_AGENT: &str = concat!("portfolio-sync/", env!("CARGO_PKG_VERSION"));

/// Errors surfaced by the provider client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("GitHub rejected the credential: {0}")]
    Unauthenticated(String),

    #[error("GitHub rate limit exceeded{}", reset_suffix(.reset_at))]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    #[error("GitHub secondary rate limit hit{}", retry_suffix(.retry_after))]
    AbuseRateLimited { retry_after: Option<u64> },

    #[error("repository not found: {0}")]
    NotFound(String),

    #[error("access forbidden: {0}")]
    Forbidden(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected HTTP status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("invalid repository full name: {0:?}")]
    InvalidFullName(String),

    #[error("could not decode GitHub response: {0}")]
    Decode(String),
}

fn reset_suffix(reset_at: &Option<DateTime<Utc>>) -> String {
    reset_at
        .map(|at| format!(", resets at {}", at.to_rfc3339()))
        .unwrap_or_default()
}

fn retry_suffix(retry_after: &Option<u64>) -> String {
    retry_after
        .map(|secs| format!(", retry after {}s", secs))
        .unwrap_or_default()
}

impl ProviderError {
    /// Primary rate limits are the only retryable condition
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }

    /// Repository gone or inaccessible: a steady state, not a failure
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ProviderError::NotFound(_) | ProviderError::Forbidden(_))
    }

    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Network(err.to_string())
        }
    }

    fn from_octocrab(err: octocrab::Error) -> Self {
        match err {
            octocrab::Error::GitHub { source, .. } => {
                let status = source.status_code.as_u16();
                let message = source.message.clone();
                let lowered = message.to_lowercase();
                match status {
                    401 => ProviderError::Unauthenticated(message),
                    404 => ProviderError::NotFound("authenticated user".to_string()),
                    403 | 429 if is_secondary_limit(&lowered) => {
                        ProviderError::AbuseRateLimited { retry_after: None }
                    }
                    403 | 429 if status == 429 || lowered.contains("rate limit") => {
                        ProviderError::RateLimited { reset_at: None }
                    }
                    403 => ProviderError::Forbidden(message),
                    _ => ProviderError::UnexpectedStatus { status, message },
                }
            }
            other => ProviderError::Network(other.to_string()),
        }
    }
}

/// Repository as returned by the GitHub REST API
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UpstreamRepo {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default, rename = "stargazers_count")]
    pub stars: u32,
    #[serde(default, rename = "forks_count")]
    pub forks: u32,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Authenticated account profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub login: String,
    pub avatar_url: Option<String>,
}

/// Sort order accepted by the repository listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Updated,
    Created,
    Pushed,
    FullName,
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::Updated => "updated",
            SortKey::Created => "created",
            SortKey::Pushed => "pushed",
            SortKey::FullName => "full_name",
        }
    }

    fn direction(&self) -> &'static str {
        match self {
            SortKey::FullName => "asc",
            _ => "desc",
        }
    }
}

/// One page request against the authenticated user's repositories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub page: u32,
    pub per_page: u8,
    pub sort: SortKey,
}

/// One page of repositories plus what the `Link` header said about the rest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoPage {
    pub repos: Vec<UpstreamRepo>,
    pub next_page: Option<u32>,
    pub last_page: Option<u32>,
}

/// Upstream repository source consumed by the catalog, import and reconciler
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepoProvider: Send + Sync {
    /// List one page of the authenticated account's repositories
    async fn list_repos(&self, query: &ListQuery) -> Result<RepoPage, ProviderError>;

    /// Fetch a single repository by `owner/name`
    async fn fetch_repo(&self, full_name: &str) -> Result<UpstreamRepo, ProviderError>;
}

/// GitHub client wrapper holding one decrypted credential
pub struct GitHubClient {
    octocrab: Octocrab,
    http: reqwest::Client,
    api_url: String,
    token: String,
    retry: RetryPolicy,
}

impl fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubClient")
            .field("api_url", &self.api_url)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl GitHubClient {
    /// Create a client for one operation using the decrypted token
    pub fn new(token: &str, config: &GitHubConfig) -> Result<Self, ProviderError> {
        let api_url = config.api_url.trim_end_matches('/').to_string();

        let octocrab = Octocrab::builder()
            .base_uri(api_url.as_str())
            .map_err(|e| ProviderError::Network(format!("invalid API url {}: {}", api_url, e)))?
            .personal_token(token.to_string())
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to create GitHub client: {}", e)))?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(ProviderError::from_transport)?;

        Ok(Self {
            octocrab,
            http,
            api_url,
            token: token.to_string(),
            retry: RetryPolicy::from_config(config),
        })
    }

    /// Replace the backoff policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fetch the profile the credential belongs to
    pub async fn current_user(&self) -> Result<ProviderProfile, ProviderError> {
        let author = self
            .retry
            .run("/user", || async {
                self.octocrab
                    .current()
                    .user()
                    .await
                    .map_err(ProviderError::from_octocrab)
            })
            .await?;

        Ok(ProviderProfile {
            login: author.login,
            avatar_url: Some(author.avatar_url.to_string()),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        route: &str,
        query: &[(&str, String)],
        resource: &str,
    ) -> Result<(T, HeaderMap), ProviderError> {
        let url = format!("{}{}", self.api_url, route);
        debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .query(query)
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, CLIENT_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = response.status();
        let headers = response.headers().clone();

        if status.is_success() {
            let body = response
                .json::<T>()
                .await
                .map_err(|e| ProviderError::Decode(e.to_string()))?;
            return Ok((body, headers));
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status.as_u16(), &headers, &body, resource))
    }
}

#[async_trait]
impl RepoProvider for GitHubClient {
    async fn list_repos(&self, query: &ListQuery) -> Result<RepoPage, ProviderError> {
        let params = [
            ("sort", query.sort.as_str().to_string()),
            ("direction", query.sort.direction().to_string()),
            ("per_page", query.per_page.clamp(1, 100).to_string()),
            ("page", query.page.max(1).to_string()),
            ("affiliation", "owner".to_string()),
        ];

        let (repos, headers) = self
            .retry
            .run("/user/repos", || {
                self.get_json::<Vec<UpstreamRepo>>("/user/repos", &params, "user repositories")
            })
            .await?;

        let pagination = headers
            .get("link")
            .and_then(|v| v.to_str().ok())
            .map(parse_link_header)
            .unwrap_or_default();

        Ok(RepoPage {
            repos,
            next_page: pagination.next_page,
            last_page: pagination.last_page,
        })
    }

    async fn fetch_repo(&self, full_name: &str) -> Result<UpstreamRepo, ProviderError> {
        let (owner, name) = split_full_name(full_name)?;
        let route = format!("/repos/{}/{}", owner, name);

        let (repo, _) = self
            .retry
            .run(full_name, || self.get_json::<UpstreamRepo>(&route, &[], full_name))
            .await?;

        Ok(repo)
    }
}

/// Validate and split an `owner/name` pair
pub fn split_full_name(full_name: &str) -> Result<(&str, &str), ProviderError> {
    let invalid = || ProviderError::InvalidFullName(full_name.to_string());
    let (owner, name) = full_name.split_once('/').ok_or_else(invalid)?;

    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };

    if valid_part(owner) && valid_part(name) {
        Ok((owner, name))
    } else {
        Err(invalid())
    }
}

#[derive(Deserialize)]
struct ApiMessage {
    message: String,
}

fn is_secondary_limit(lowered_message: &str) -> bool {
    lowered_message.contains("secondary rate limit") || lowered_message.contains("abuse")
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Map a non-success response onto the error taxonomy
fn classify_failure(status: u16, headers: &HeaderMap, body: &str, resource: &str) -> ProviderError {
    let message = serde_json::from_str::<ApiMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| body.trim().to_string());
    let lowered = message.to_lowercase();

    match status {
        401 => ProviderError::Unauthenticated(message),
        404 => ProviderError::NotFound(resource.to_string()),
        403 | 429 => {
            let retry_after = header_u64(headers, "retry-after");
            let exhausted = header_u64(headers, "x-ratelimit-remaining") == Some(0);

            if is_secondary_limit(&lowered) || (retry_after.is_some() && !exhausted) {
                ProviderError::AbuseRateLimited { retry_after }
            } else if exhausted || status == 429 || lowered.contains("rate limit") {
                let reset_at = header_u64(headers, "x-ratelimit-reset")
                    .and_then(|epoch| DateTime::from_timestamp(epoch as i64, 0));
                ProviderError::RateLimited { reset_at }
            } else {
                ProviderError::Forbidden(resource.to_string())
            }
        }
        _ => ProviderError::UnexpectedStatus { status, message },
    }
}

/// Pagination information extracted from GitHub's Link header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkPagination {
    pub last_page: Option<u32>,
    pub next_page: Option<u32>,
}

/// Parse the Link header to extract pagination info.
///
/// GitHub Link headers look like:
/// `<https://api.github.com/user/repos?per_page=30&page=2>; rel="next", <...&page=3>; rel="last"`
pub fn parse_link_header(link_header: &str) -> LinkPagination {
    let mut info = LinkPagination::default();

    for part in link_header.split(',') {
        let mut url = None;
        let mut rel = None;

        for segment in part.trim().split(';') {
            let segment = segment.trim();
            if segment.starts_with('<') && segment.ends_with('>') {
                url = Some(&segment[1..segment.len() - 1]);
            } else if let Some(rel_value) = segment.strip_prefix("rel=") {
                rel = Some(rel_value.trim_matches('"'));
            }
        }

        if let (Some(url), Some(rel)) = (url, rel) {
            if let Some(page) = extract_page_from_url(url) {
                match rel {
                    "last" => info.last_page = Some(page),
                    "next" => info.next_page = Some(page),
                    _ => {}
                }
            }
        }
    }

    info
}

fn extract_page_from_url(url: &str) -> Option<u32> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .find_map(|param| param.strip_prefix("page="))
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_split_full_name() {
        assert_eq!(split_full_name("octo/hello-world").unwrap(), ("octo", "hello-world"));
        assert_eq!(split_full_name("a.b/c_d").unwrap(), ("a.b", "c_d"));

        for bad in ["", "noslash", "/repo", "owner/", "a/b/c", "own er/repo"] {
            assert!(
                matches!(split_full_name(bad), Err(ProviderError::InvalidFullName(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_classify_not_found_and_forbidden() {
        let empty = HeaderMap::new();
        assert_eq!(
            classify_failure(404, &empty, r#"{"message":"Not Found"}"#, "o/r"),
            ProviderError::NotFound("o/r".to_string())
        );
        assert_eq!(
            classify_failure(403, &empty, r#"{"message":"Repository access blocked"}"#, "o/r"),
            ProviderError::Forbidden("o/r".to_string())
        );
        assert!(matches!(
            classify_failure(401, &empty, r#"{"message":"Bad credentials"}"#, "o/r"),
            ProviderError::Unauthenticated(m) if m == "Bad credentials"
        ));
    }

    #[test]
    fn test_classify_primary_rate_limit() {
        let exhausted = headers(&[
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset", "1700000000"),
        ]);
        let err = classify_failure(403, &exhausted, r#"{"message":"API rate limit exceeded"}"#, "o/r");

        assert_eq!(
            err,
            ProviderError::RateLimited {
                reset_at: DateTime::from_timestamp(1_700_000_000, 0)
            }
        );
        assert!(err.is_retryable());

        let plain_429 = classify_failure(429, &HeaderMap::new(), "", "o/r");
        assert!(matches!(plain_429, ProviderError::RateLimited { .. }));
    }

    #[test]
    fn test_classify_secondary_rate_limit() {
        let err = classify_failure(
            403,
            &headers(&[("retry-after", "60")]),
            r#"{"message":"You have exceeded a secondary rate limit."}"#,
            "o/r",
        );
        assert_eq!(err, ProviderError::AbuseRateLimited { retry_after: Some(60) });
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classify_unexpected_status() {
        let err = classify_failure(502, &HeaderMap::new(), "<html>bad gateway</html>", "o/r");
        assert_eq!(
            err,
            ProviderError::UnexpectedStatus {
                status: 502,
                message: "<html>bad gateway</html>".to_string()
            }
        );
        assert!(!err.is_unreachable());
    }

    #[test]
    fn test_parse_link_header_full() {
        let header = r#"<https://api.github.com/user/repos?per_page=30&page=2>; rel="next", <https://api.github.com/user/repos?per_page=30&page=7>; rel="last""#;
        let info = parse_link_header(header);
        assert_eq!(info.next_page, Some(2));
        assert_eq!(info.last_page, Some(7));
    }

    #[test]
    fn test_parse_link_header_last_page() {
        let header = r#"<https://api.github.com/user/repos?page=1>; rel="first", <https://api.github.com/user/repos?page=6>; rel="prev""#;
        assert_eq!(parse_link_header(header), LinkPagination::default());
        assert_eq!(parse_link_header(""), LinkPagination::default());
    }

    #[test]
    fn test_upstream_repo_deserializes_sparse_payload() {
        let repo: UpstreamRepo = serde_json::from_str(
            r#"{"id": 7, "name": "dots", "full_name": "me/dots", "description": null, "language": null}"#,
        )
        .unwrap();

        assert_eq!(repo.id, 7);
        assert_eq!(repo.stars, 0);
        assert!(repo.topics.is_empty());
        assert!(!repo.private);
    }

    #[test]
    fn test_sort_key_strings() {
        assert_eq!(SortKey::default(), SortKey::Updated);
        assert_eq!(SortKey::FullName.as_str(), "full_name");
        assert_eq!(SortKey::FullName.direction(), "asc");
        assert_eq!(SortKey::Pushed.direction(), "desc");
    }
}
