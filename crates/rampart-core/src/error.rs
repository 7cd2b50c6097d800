use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::circuit_breaker::CircuitState;

/// Application-wide error types for Rampart.
///
/// Caller-supplied operations report failures through the same enum the
/// resilience layers use, so admission, circuit breaking and retries compose
/// with plain `?`.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed before a status was available.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Upstream answered with a non-success status.
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Admission rejected synchronously because the wait queue is full.
    #[error("Admission queue for '{name}' is full ({limit} waiting)")]
    QueueLimitExceeded { name: String, limit: usize },

    /// Waited in the admission queue longer than the configured timeout.
    #[error("Timed out after {}ms waiting for an admission slot on '{name}'", .waited.as_millis())]
    AcquisitionTimeout { name: String, waited: Duration },

    /// Queued request was failed by `clear_queue`.
    #[error("Admission queue for '{name}' was cleared")]
    QueueCleared { name: String },

    /// Circuit breaker rejected the call without invoking the operation.
    #[error("Circuit breaker '{name}' is {state}. Retry after {}ms.", .retry_after.as_millis())]
    CircuitOpen {
        name: String,
        state: CircuitState,
        retry_after: Duration,
    },

    /// All retry attempts failed.
    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last_error: Box<AppError>,
    },

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    ///
    /// Default classification for [`RetryPolicy`](crate::retry::RetryPolicy):
    /// network failures, timeouts, connection resets and 5xx responses are
    /// retried; 4xx responses never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::HttpStatus { status, .. } => (500..600).contains(status),
            AppError::HttpError(msg) | AppError::Generic(msg) => message_looks_transient(msg),
            AppError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns true for the three ways admission control can refuse a caller.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            AppError::QueueLimitExceeded { .. }
                | AppError::AcquisitionTimeout { .. }
                | AppError::QueueCleared { .. }
        )
    }

    /// Create a generic error from anything printable.
    pub fn generic(message: impl std::fmt::Display) -> Self {
        Self::Generic(message.to_string())
    }
}

/// Injectable error classifier.
///
/// Used twice with different defaults: the circuit breaker's `is_countable`
/// (count everything) and the retry policy's `is_retryable`
/// ([`AppError::is_retryable`]).
pub type ErrorPredicate = Arc<dyn Fn(&AppError) -> bool + Send + Sync>;

const TRANSIENT_MARKERS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection closed",
    "econnreset",
    "econnrefused",
    "etimedout",
    "socket hang up",
    "temporarily unavailable",
];

/// Substring heuristic for errors that only carry a message.
fn message_looks_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    if let Some(status) = embedded_status_code(&lower) {
        return (500..600).contains(&status);
    }
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Finds an HTTP status in messages shaped like "HTTP 503" or "status 404".
fn embedded_status_code(lower: &str) -> Option<u16> {
    ["http ", "status ", "status: ", "status code "]
        .iter()
        .find_map(|prefix| {
            let start = lower.find(prefix)? + prefix.len();
            let digits: String = lower[start..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            if digits.len() != 3 {
                return None;
            }
            digits.parse::<u16>().ok().filter(|s| (100..600).contains(s))
        })
}
