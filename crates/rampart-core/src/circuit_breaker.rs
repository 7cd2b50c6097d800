//! Circuit breaker pattern for downstream resilience.
//!
//! Stops calling a data source that keeps failing, then lets a single probe
//! through once the recovery timeout has elapsed.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N countable failures]--> OPEN (fail fast) --[timeout]--> HALF_OPEN (one probe)
//!                                                   ^                              |
//!                                                   +----------[failure]-----------+
//!                                                                                  |
//! CLOSED <----------------------------------[success]------------------------------+
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{AppError, ErrorPredicate};
use crate::traits::{SlotContext, context_fields};

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    #[default]
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - a single probe is allowed to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive countable failures before opening the circuit.
    pub failure_threshold: u32,

    /// Time to stay open before a probe is allowed.
    pub recovery_timeout: Duration,

    /// Decides which errors count toward `failure_threshold`.
    ///
    /// Errors that are not countable still propagate to the caller but leave
    /// the breaker untouched.
    pub is_countable: ErrorPredicate,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            is_countable: Arc::new(|_| true),
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("recovery_timeout", &self.recovery_timeout)
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Replace the failure classifier, e.g. to ignore 4xx client errors.
    pub fn with_countable<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&AppError) -> bool + Send + Sync + 'static,
    {
        self.is_countable = Arc::new(predicate);
        self
    }
}

/// Internal state tracking for the circuit breaker.
#[derive(Debug, Default)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    total_requests: u64,
    total_failures: u64,
    total_successes: u64,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    last_error_message: Option<String>,
    next_retry_at: Option<Instant>,
    next_retry_time: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    /// Consecutive countable failures.
    pub failure_count: u32,
    /// Successes since the last reset.
    pub success_count: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub last_error: Option<String>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub time_until_half_open: Option<Duration>,
}

/// Thread-safe circuit breaker for protecting calls to one downstream dependency.
///
/// Clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(CircuitBreakerInner::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state.
    ///
    /// An open circuit whose recovery timeout has elapsed still reports
    /// `Open` until the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.lock_inner().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.lock_inner();

        let time_until_half_open = match (inner.state, inner.next_retry_at) {
            (CircuitState::Open, Some(at)) => {
                Some(at.saturating_duration_since(Instant::now()))
            }
            _ => None,
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            last_error: inner.last_error_message.clone(),
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            next_retry_time: inner.next_retry_time,
            time_until_half_open,
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open before the recovery deadline: returns `AppError::CircuitOpen`
    ///   without invoking the operation
    /// - Open after the deadline: moves to HalfOpen and runs the operation as
    ///   the single probe
    /// - HalfOpen with a probe already running: returns `AppError::CircuitOpen`
    pub async fn execute<F, T, Fut>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let is_probe = self.admit()?;
        let _probe = is_probe.then(|| ProbeGuard { breaker: self });

        let result = operation().await;

        match &result {
            Ok(_) => self.on_success(is_probe),
            Err(e) if (self.config.is_countable)(e) => self.on_failure(e, is_probe),
            Err(e) => {
                tracing::debug!(circuit = %self.name, error = %e, "Failure not counted");
            }
        }

        result
    }

    /// Same as [`execute`](Self::execute), tagging failures with caller context.
    pub async fn execute_with_context<F, T, Fut>(
        &self,
        context: &SlotContext,
        operation: F,
    ) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let result = self.execute(operation).await;
        if let Err(e) = &result {
            tracing::debug!(
                circuit = %self.name,
                context = %context_fields(Some(context)),
                error = %e,
                "Call failed"
            );
        }
        result
    }

    /// Decides whether a call may proceed. Returns `true` when the call is
    /// the half-open probe.
    fn admit(&self) -> Result<bool, AppError> {
        let mut inner = self.lock_inner();
        inner.total_requests += 1;

        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let now = Instant::now();
                let deadline = inner.next_retry_at.unwrap_or(now);
                if now < deadline {
                    return Err(AppError::CircuitOpen {
                        name: self.name.clone(),
                        state: CircuitState::Open,
                        retry_after: deadline - now,
                    });
                }

                tracing::info!(
                    circuit = %self.name,
                    "Circuit breaker transitioning to half-open state"
                );
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                Ok(true)
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(AppError::CircuitOpen {
                        name: self.name.clone(),
                        state: CircuitState::HalfOpen,
                        retry_after: Duration::ZERO,
                    });
                }
                inner.probe_in_flight = true;
                Ok(true)
            }
        }
    }

    /// Records a success observed outside [`execute`](Self::execute).
    ///
    /// Never resolves a half-open circuit; only the probe does that.
    pub fn record_success(&self) {
        self.on_success(false);
    }

    /// Records a failure that has already been classified as countable.
    ///
    /// Never resolves a half-open circuit; only the probe does that.
    pub fn record_failure(&self, error: &AppError) {
        self.on_failure(error, false);
    }

    fn on_success(&self, is_probe: bool) {
        let mut inner = self.lock_inner();
        inner.total_successes += 1;
        inner.last_success_time = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen if is_probe => {
                tracing::info!(circuit = %self.name, "Circuit breaker closing after successful probe");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.last_error_message = None;
                inner.next_retry_at = None;
                inner.next_retry_time = None;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count += 1;
            }
            // A call admitted before the circuit opened finished late.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, error: &AppError, is_probe: bool) {
        let mut inner = self.lock_inner();
        inner.total_failures += 1;
        inner.last_failure_time = Some(Utc::now());
        inner.last_error_message = Some(error.to_string());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.failure_count
                    );
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen if is_probe => {
                inner.failure_count += 1;
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker probe failed, returning to open state"
                );
                self.open(&mut inner);
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        *inner = CircuitBreakerInner::default();
    }

    fn open(&self, inner: &mut CircuitBreakerInner) {
        let timeout = self.config.recovery_timeout;
        inner.state = CircuitState::Open;
        inner.success_count = 0;
        inner.next_retry_at = Some(Instant::now() + timeout);
        inner.next_retry_time =
            Some(Utc::now() + TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX));
    }
}

/// Clears the probe flag however the probe call ends, including when its
/// future is dropped.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.breaker.lock_inner().probe_in_flight = false;
    }
}
