//! Shared backoff policy for upstream calls.
//!
//! Every GitHub request goes through [`RetryPolicy::run`]. Only primary rate
//! limits are retried; secondary (abuse) limits and everything else surface on
//! the first attempt.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::config::GitHubConfig;
use crate::github::ProviderError;

/// Backoff configuration for rate-limited requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Cap for a single delay.
    pub max_delay: Duration,
    /// Retries after the initial attempt.
    pub max_retries: usize,
    /// Whether to add jitter to delays.
    pub with_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&GitHubConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &GitHubConfig) -> Self {
        Self {
            min_delay: Duration::from_millis(config.retry_min_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms.max(config.retry_min_delay_ms)),
            max_retries: config.rate_limit_retries,
            with_jitter: true,
        }
    }

    /// A policy that retries immediately; used in tests.
    #[must_use]
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_retries,
            with_jitter: false,
        }
    }

    #[must_use]
    pub fn into_backoff(self) -> ExponentialBuilder {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries);

        if self.with_jitter {
            builder = builder.with_jitter();
        }

        builder
    }

    /// Run `operation`, retrying while it reports a primary rate limit.
    pub async fn run<T, F, Fut>(&self, label: &str, operation: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let attempt = AtomicU32::new(0);
        let mut operation = operation;
        let counted = || {
            attempt.fetch_add(1, Ordering::SeqCst);
            operation()
        };

        counted
            .retry(self.clone().into_backoff())
            .when(ProviderError::is_retryable)
            .notify(|err, dur| {
                tracing::warn!(
                    "Rate limited on {}, retrying in {:?} (attempt {}): {}",
                    label,
                    dur,
                    attempt.load(Ordering::SeqCst),
                    err
                );
            })
            .await
    }
}
