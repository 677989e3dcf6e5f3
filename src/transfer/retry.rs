//! Retry policy and per-transfer state machine shared by every provider
//!
//! Each provider classifies its own failures (HTTP status, backend error
//! codes, errno) into an [`ErrorClass`]; the policy applied to that
//! classification is identical everywhere.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Classification of a provider failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network timeout, 5xx, connection reset: retried with backoff
    Transient,
    /// Authentication, authorization, bad request: never retried
    Permanent,
    /// The remote object (or local source) does not exist
    NotFound,
    /// The transfer was stopped by a cancellation request
    Cancelled,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::NotFound => "not_found",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify a filesystem error
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::Transient,
            _ => Self::Permanent,
        }
    }

    /// Classify an HTTP status code returned by an object-storage API
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => Self::NotFound,
            408 | 429 => Self::Transient,
            500..=599 => Self::Transient,
            _ => Self::Permanent,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure raised inside a provider
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub class: ErrorClass,
    pub message: String,
}

impl ProviderError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotFound, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Cancelled, message)
    }

    /// Wrap a filesystem error with context
    pub fn io(context: impl fmt::Display, err: io::Error) -> Self {
        Self::new(ErrorClass::from_io(&err), format!("{}: {}", context, err))
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

/// States a single transfer moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Attempting(u32),
    RetryableFailure(u32),
    Success,
    Failed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Attempting(n) => write!(f, "attempting({})", n),
            Self::RetryableFailure(n) => write!(f, "retryable_failure({})", n),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Retry tunables shared by every provider
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_retries: u32,
    /// Base delay; attempt `n` (0-based) waits `retry_delay * 2^n` before the next
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Delay after the given (0-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.retry_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(20)))
    }

    fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Drive `op` through the transfer state machine.
///
/// `op` receives the 0-based attempt number. Permanent and not-found failures
/// end the transfer immediately; transient failures are retried until the
/// policy is exhausted. Once `cancel` fires no further attempt is started and
/// a pending backoff sleep is interrupted.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let attempts = policy.attempts();
    debug!(operation = label, state = %TransferState::Pending, max_attempts = attempts);

    let mut last_error = None;
    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(ProviderError::cancelled(format!(
                "{} cancelled before attempt {}",
                label,
                attempt + 1
            )));
        }

        debug!(operation = label, state = %TransferState::Attempting(attempt + 1));
        match op(attempt).await {
            Ok(value) => {
                debug!(operation = label, state = %TransferState::Success);
                return Ok(value);
            }
            Err(err) if !err.is_transient() => {
                debug!(operation = label, state = %TransferState::Failed, class = %err.class);
                return Err(err);
            }
            Err(err) => {
                warn!(
                    operation = label,
                    state = %TransferState::RetryableFailure(attempt + 1),
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    "Transient failure: {}",
                    err
                );
                last_error = Some(err);

                if attempt + 1 < attempts {
                    let delay = policy.delay_for(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(ProviderError::cancelled(format!(
                                "{} cancelled while backing off",
                                label
                            )));
                        }
                    }
                }
            }
        }
    }

    debug!(operation = label, state = %TransferState::Failed);
    let cause = last_error
        .map(|e| e.message)
        .unwrap_or_else(|| "no attempt made".to_string());
    Err(ProviderError::transient(format!(
        "{} failed after {} attempts: {}",
        label, attempts, cause
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy::new(max, Duration::from_millis(100))
    }

    #[test]
    fn test_delay_grows_geometrically() {
        let policy = policy(5);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(ErrorClass::from_status(401), ErrorClass::Permanent);
        assert_eq!(ErrorClass::from_status(403), ErrorClass::Permanent);
        assert_eq!(ErrorClass::from_status(404), ErrorClass::NotFound);
        assert_eq!(ErrorClass::from_status(429), ErrorClass::Transient);
        assert_eq!(ErrorClass::from_status(503), ErrorClass::Transient);
        assert_eq!(ErrorClass::from_status(400), ErrorClass::Permanent);
    }

    #[test]
    fn test_io_classification() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(ErrorClass::from_io(&missing), ErrorClass::NotFound);
        assert_eq!(ErrorClass::from_io(&denied), ErrorClass::Permanent);
        assert_eq!(ErrorClass::from_io(&reset), ErrorClass::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_uses_exactly_max_retries_attempts() {
        let stamps = Mutex::new(Vec::new());
        let cancel = CancellationToken::new();

        let result: Result<(), _> = run_with_retry(&policy(4), &cancel, "upload", |_| {
            stamps.lock().unwrap().push(Instant::now());
            async { Err(ProviderError::transient("connection reset")) }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.class, ErrorClass::Transient);

        let stamps = stamps.into_inner().unwrap();
        assert_eq!(stamps.len(), 4);

        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps[0], Duration::from_millis(100));
        assert_eq!(gaps[1], gaps[0] * 2);
        assert_eq!(gaps[2], gaps[1] * 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> = run_with_retry(&policy(5), &cancel, "upload", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::permanent("403 forbidden")) }
        })
        .await;

        assert_eq!(result.unwrap_err().class, ErrorClass::Permanent);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> = run_with_retry(&policy(5), &cancel, "download", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::not_found("no such key")) }
        })
        .await;

        assert_eq!(result.unwrap_err().class, ErrorClass::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let cancel = CancellationToken::new();

        let value = run_with_retry(&policy(3), &cancel, "list", |attempt| async move {
            if attempt == 0 {
                Err(ProviderError::transient("503"))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_new_attempts() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> = run_with_retry(&policy(3), &cancel, "upload", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert_eq!(result.unwrap_err().class, ErrorClass::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
