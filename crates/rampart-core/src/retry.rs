//! Retry with capped exponential backoff.
//!
//! [`RetryExecutor::execute_with_retry`] reports every call as a
//! [`RetryOutcome`]. [`RetryExecutor::wrap`] builds a [`Retryable`] whose
//! `call` returns a plain `Result` instead, for dropping retries into code that
//! already expects one.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{AppError, ErrorPredicate};

/// Retry configuration.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Decides whether a failed attempt is worth repeating.
    pub is_retryable: ErrorPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            is_retryable: Arc::new(|e: &AppError| e.is_retryable()),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    pub fn with_retryable(
        mut self,
        is_retryable: impl Fn(&AppError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_retryable = Arc::new(is_retryable);
        self
    }

    /// Calculate the delay after a failed attempt (1-indexed).
    ///
    /// `base_delay * backoff_multiplier^(attempt - 1)`, never more than
    /// `max_delay`.
    ///
    /// - Attempt 1: 1s
    /// - Attempt 2: 2s
    /// - Attempt 3: 4s
    /// - ...capped at 30s (with defaults)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.max_delay
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Result of [`RetryExecutor::execute_with_retry`].
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Value of the successful attempt, or the error of the last one.
    pub result: Result<T, AppError>,
    pub attempts: u32,
    /// Wall time across all attempts and backoff delays.
    pub elapsed: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, AppError> {
        self.result
    }
}

/// Re-runs failed operations according to a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    name: String,
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is used up. Only the final result is reported.
    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let started = Instant::now();
        let max_attempts = self.policy.attempts();
        let mut attempt = 1;

        loop {
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(retry = %self.name, attempt, "Succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    };
                }
                Err(e) => e,
            };

            if !(self.policy.is_retryable)(&error) {
                tracing::debug!(
                    retry = %self.name,
                    attempt,
                    error = %error,
                    "Error is not retryable, giving up"
                );
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                };
            }

            if attempt >= max_attempts {
                tracing::warn!(
                    retry = %self.name,
                    attempts = attempt,
                    error = %error,
                    "Retry attempts exhausted"
                );
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                };
            }

            let delay = self.policy.delay_for_attempt(attempt);
            tracing::warn!(
                retry = %self.name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Wraps `operation` so each [`Retryable::call`] retries it transparently.
    pub fn wrap<F, Fut, T>(&self, operation: F) -> Retryable<F>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        Retryable {
            executor: self.clone(),
            operation,
        }
    }
}

/// An operation bound to a retry policy.
#[derive(Debug, Clone)]
pub struct Retryable<F> {
    executor: RetryExecutor,
    operation: F,
}

impl<F> Retryable<F> {
    /// Runs the operation with retries.
    ///
    /// A non-retryable error is returned as is. Running out of attempts on a
    /// retryable error yields [`AppError::RetryExhausted`] carrying the last
    /// error.
    pub async fn call<Fut, T>(&self) -> Result<T, AppError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let outcome = self
            .executor
            .execute_with_retry(|| (self.operation)())
            .await;
        match outcome.result {
            Ok(value) => Ok(value),
            Err(error) if (self.executor.policy.is_retryable)(&error) => {
                Err(AppError::RetryExhausted {
                    attempts: outcome.attempts,
                    last_error: Box::new(error),
                })
            }
            Err(error) => Err(error),
        }
    }
}
