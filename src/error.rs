//! Error types and caller-level retry logic
//!
//! The sync core never retries on its own: a failed authority call resolves to
//! "last known-good value retained". Callers that want persistence can wrap
//! an operation in [`with_retry`].

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

/// Failure talking to the settings authority
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport-level failure (DNS, connect, TLS, timeout)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Authority answered with a non-success HTTP status
    #[error("authority returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Authority answered `success: false`
    #[error("authority rejected the request: {0}")]
    Rejected(String),

    /// Response body could not be decoded
    #[error("malformed authority response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Authority could not be reached at all (used by in-process authorities)
    #[error("authority unavailable: {0}")]
    Unavailable(String),
}

/// Settings value validation failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("unknown setting key: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Umbrella error for the sync core
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("cache error: {0:#}")]
    Cache(anyhow::Error),
}

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Remote(e) => e.category(),
            SyncError::Settings(_) => ErrorCategory::Validation,
            SyncError::Cache(_) => ErrorCategory::Storage,
        }
    }
}

impl RemoteError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RemoteError::Network(e) if e.is_timeout() => ErrorCategory::Timeout,
            RemoteError::Network(_) | RemoteError::Unavailable(_) => ErrorCategory::Network,
            RemoteError::Status { status, .. } if *status >= 500 => ErrorCategory::Network,
            RemoteError::Status { status, .. } if *status == 401 || *status == 403 => {
                ErrorCategory::Authentication
            }
            RemoteError::Status { .. } | RemoteError::Rejected(_) => ErrorCategory::Validation,
            RemoteError::Decode(_) => ErrorCategory::Protocol,
        }
    }
}

/// Categorized error types for better handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Authority unreachable or 5xx (retryable)
    Network,

    /// Request timed out (retryable)
    Timeout,

    /// Credentials missing or refused (not retryable here)
    Authentication,

    /// Authority rejected the value, or local validation failed (not retryable)
    Validation,

    /// Unexpected response shape (not retryable)
    Protocol,

    /// Persistent cache failure (may be retryable)
    Storage,
}

impl ErrorCategory {
    /// Check if this error category is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Storage
        )
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create an aggressive retry policy
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(3),
        }
    }
}

/// Execute an async operation with retry logic.
///
/// Only errors whose category is retryable are retried; anything else is
/// returned immediately.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempts = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempts >= policy.max_attempts || !e.category().is_retryable() {
                    return Err(e);
                }

                tracing::warn!(
                    "Attempt {}/{} failed: {}. Retrying in {:?}",
                    attempts,
                    policy.max_attempts,
                    e,
                    delay
                );

                sleep(delay).await;

                // Exponential backoff
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * policy.backoff_multiplier)
                        .min(policy.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
