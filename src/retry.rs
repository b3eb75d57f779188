//! Shared retry policy and error classification.
//!
//! Every backend call and subprocess interaction funnels its failures through
//! [`BackendError`] so the upload scheduler, the manifest reader and the
//! restore downloader all retry on exactly the same verdicts.

use rand::RngExt;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Classified backend failure.
///
/// `Transient` consumes retry budget; everything else fails the operation
/// immediately. `NotFound` on a manifest object is benign in list mode and an
/// error in restore mode, so it keeps its own variant instead of folding into
/// `Permanent`.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    #[error("access denied: {0}")]
    Authz(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl BackendError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Classify an HTTP status: throttling and server errors are transient,
    /// auth failures are `Authz`, 404 is `NotFound`, remaining 4xx are
    /// permanent.
    #[must_use]
    pub fn from_status(status: StatusCode, context: String) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
            return Self::Transient(context);
        }

        if status.is_server_error() {
            return Self::Transient(context);
        }

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Authz(context),
            StatusCode::NOT_FOUND => Self::NotFound(context),
            _ => Self::Permanent(context),
        }
    }

    /// Classify a transport-level error: timeouts and connection failures are
    /// transient, request construction problems are permanent.
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error, what: &str) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_body() {
            Self::Transient(format!("{what}: {err}"))
        } else if err.is_builder() {
            Self::Permanent(format!("{what}: {err}"))
        } else {
            // reqwest surfaces plain I/O problems (reset connections, broken
            // pipes) without a dedicated predicate; treat them as retryable.
            Self::Transient(format!("{what}: {err}"))
        }
    }

    /// Classify a local I/O error.
    #[must_use]
    pub fn from_io(err: &std::io::Error, what: &str) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => Self::NotFound(format!("{what}: {err}")),
            ErrorKind::PermissionDenied => Self::Authz(format!("{what}: {err}")),
            ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                Self::Transient(format!("{what}: {err}"))
            }
            _ => Self::Permanent(format!("{what}: {err}")),
        }
    }
}

/// Retry budget with jittered exponential backoff, shared by every call site.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per operation, including the first one.
    pub max_retries: u32,
    /// Ceiling for a single backoff pause.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`: base 2 exponential from 1s,
    /// jittered by plus or minus 20%, capped at `max_backoff`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = Duration::from_secs(1 << attempt.min(16));
        let capped = base.min(self.max_backoff);
        let jitter: f64 = rand::rng().random_range(0.8..1.2);
        capped.mul_f64(jitter)
    }
}

/// Run `op` under `policy`, sleeping between transient failures.
///
/// Permanent, `Authz` and `NotFound` verdicts fail immediately. Cancellation
/// is observed before every attempt and during backoff; a cancelled operation
/// reports as permanent so nothing upstream retries it.
///
/// # Errors
/// Returns the last error once the budget is exhausted, or the first
/// non-transient error.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let attempts = policy.max_retries.max(1);

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(BackendError::Permanent(format!("{what}: cancelled")));
        }

        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                return Err(BackendError::Permanent(format!("{what}: cancelled")));
            }
            outcome = op() => outcome,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                let pause = policy.backoff(attempt);
                log::warn!(
                    "{what}: attempt {attempt}/{attempts} failed: {err}, retrying in {}s",
                    pause.as_secs()
                );

                tokio::select! {
                    () = cancel.cancelled() => {
                        return Err(BackendError::Permanent(format!("{what}: cancelled")));
                    }
                    () = sleep(pause) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(BackendError::Permanent(format!("{what}: retries exhausted")))
}
