//! Opt-in retry for destination writes.
//!
//! Entity creations fail fast by default. Setting `max_retries` above zero
//! retries rate-limited and transient network errors with exponential
//! backoff; validation and auth errors are never retried.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::migrate::{MigrationProgress, ProgressCallback};
use crate::service::{EntityKind, ServiceError, short_error_message};

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Configuration for retry operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Minimum delay between retries.
    pub min_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Maximum number of retry attempts. Zero disables retrying.
    pub max_retries: usize,
    /// Whether to add jitter to delays.
    pub with_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            max_retries: 0,
            with_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom values.
    #[must_use]
    pub fn new(min_delay: Duration, max_delay: Duration, max_retries: usize) -> Self {
        Self {
            min_delay,
            max_delay,
            max_retries,
            with_jitter: true,
        }
    }

    /// Set whether to use jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.with_jitter = jitter;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }

    /// Build an exponential backoff strategy from this configuration.
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
}

/// Run a service call, retrying transient failures per `config`.
///
/// Each retry emits [`MigrationProgress::RateLimitBackoff`] and a debug log.
///
/// # Example
///
/// ```ignore
/// let id = with_retry(
///     || destination.create_entity(EntityKind::Milestone, Some("DEMO"), &payload),
///     &RetryConfig::default(),
///     EntityKind::Milestone,
///     source_id,
///     None,
/// )
/// .await?;
/// ```
pub async fn with_retry<T, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
    kind: EntityKind,
    source_id: u64,
    on_progress: Option<&ProgressCallback>,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let attempt = AtomicU32::new(0);

    let retry_op = || {
        attempt.fetch_add(1, Ordering::SeqCst);
        operation()
    };

    retry_op
        .retry(config.clone().into_backoff())
        .notify(|err, dur| {
            let current_attempt = attempt.load(Ordering::SeqCst);
            if let Some(cb) = on_progress {
                cb(MigrationProgress::RateLimitBackoff {
                    kind,
                    source_id,
                    retry_after_ms: dur.as_millis() as u64,
                    attempt: current_attempt,
                });
            }
            tracing::debug!(
                kind = %kind,
                source_id,
                attempt = current_attempt,
                delay_ms = dur.as_millis() as u64,
                error = %short_error_message(err),
                "Retrying after transient failure"
            );
        })
        .when(ServiceError::is_transient)
        .await
}
