use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::admission::AdmissionConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::retry::RetryPolicy;

/// Combined configuration for the admission, circuit breaker and retry layers.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub admission: AdmissionConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::new(5),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ResilienceConfig {
    /// Read configuration from environment variables.
    ///
    /// Every variable is optional; missing ones keep their defaults.
    ///
    /// - `RAMPART_MAX_CONCURRENT` (defaults to 5)
    /// - `RAMPART_QUEUE_LIMIT` (defaults to 0, unlimited)
    /// - `RAMPART_ACQUIRE_TIMEOUT_MS` (defaults to 30000)
    /// - `RAMPART_FAILURE_THRESHOLD` (defaults to 5)
    /// - `RAMPART_RECOVERY_TIMEOUT_MS` (defaults to 60000)
    /// - `RAMPART_RETRY_MAX_ATTEMPTS` (defaults to 3)
    /// - `RAMPART_RETRY_BASE_DELAY_MS` (defaults to 1000)
    /// - `RAMPART_RETRY_MAX_DELAY_MS` (defaults to 30000)
    /// - `RAMPART_RETRY_BACKOFF_MULTIPLIER` (defaults to 2.0)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();

        let max_concurrent = parse_var(
            &lookup,
            "RAMPART_MAX_CONCURRENT",
            defaults.admission.max_concurrent,
        )?;
        let queue_limit = parse_var(&lookup, "RAMPART_QUEUE_LIMIT", defaults.admission.queue_limit)?;
        let acquire_timeout = parse_millis(
            &lookup,
            "RAMPART_ACQUIRE_TIMEOUT_MS",
            defaults.admission.timeout,
        )?;
        let failure_threshold = parse_var(
            &lookup,
            "RAMPART_FAILURE_THRESHOLD",
            defaults.circuit_breaker.failure_threshold,
        )?;
        let recovery_timeout = parse_millis(
            &lookup,
            "RAMPART_RECOVERY_TIMEOUT_MS",
            defaults.circuit_breaker.recovery_timeout,
        )?;
        let max_attempts = parse_var(
            &lookup,
            "RAMPART_RETRY_MAX_ATTEMPTS",
            defaults.retry.max_attempts,
        )?;
        let base_delay = parse_millis(
            &lookup,
            "RAMPART_RETRY_BASE_DELAY_MS",
            defaults.retry.base_delay,
        )?;
        let max_delay = parse_millis(
            &lookup,
            "RAMPART_RETRY_MAX_DELAY_MS",
            defaults.retry.max_delay,
        )?;
        let backoff_multiplier = parse_var(
            &lookup,
            "RAMPART_RETRY_BACKOFF_MULTIPLIER",
            defaults.retry.backoff_multiplier,
        )?;

        // Validate the raw values before the builders clamp them.
        if max_concurrent == 0 {
            return Err(AppError::ConfigError(
                "RAMPART_MAX_CONCURRENT must be at least 1".into(),
            ));
        }
        if failure_threshold == 0 {
            return Err(AppError::ConfigError(
                "RAMPART_FAILURE_THRESHOLD must be at least 1".into(),
            ));
        }

        let config = Self {
            admission: AdmissionConfig::new(max_concurrent)
                .with_queue_limit(queue_limit)
                .with_timeout(acquire_timeout),
            circuit_breaker: CircuitBreakerConfig::default()
                .with_failure_threshold(failure_threshold)
                .with_recovery_timeout(recovery_timeout),
            retry: RetryPolicy::default()
                .with_max_attempts(max_attempts)
                .with_base_delay(base_delay)
                .with_max_delay(max_delay)
                .with_backoff_multiplier(backoff_multiplier),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints. Also run after CLI flag overrides.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.admission.max_concurrent == 0 {
            return Err(AppError::ConfigError(
                "max_concurrent must be at least 1".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(AppError::ConfigError(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::ConfigError(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        let multiplier = self.retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(AppError::ConfigError(format!(
                "retry backoff_multiplier must be a finite number >= 1.0, got {multiplier}"
            )));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(AppError::ConfigError(format!(
                "retry base delay ({}ms) exceeds max delay ({}ms)",
                self.retry.base_delay.as_millis(),
                self.retry.max_delay.as_millis()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ResilienceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue_limit = match self.admission.queue_limit {
            0 => "unlimited".to_string(),
            n => n.to_string(),
        };
        writeln!(f, "Admission:")?;
        writeln!(f, "  max_concurrent:     {}", self.admission.max_concurrent)?;
        writeln!(f, "  queue_limit:        {queue_limit}")?;
        writeln!(
            f,
            "  acquire_timeout:    {}ms",
            self.admission.timeout.as_millis()
        )?;
        writeln!(f, "Circuit breaker:")?;
        writeln!(
            f,
            "  failure_threshold:  {}",
            self.circuit_breaker.failure_threshold
        )?;
        writeln!(
            f,
            "  recovery_timeout:   {}ms",
            self.circuit_breaker.recovery_timeout.as_millis()
        )?;
        writeln!(f, "Retry:")?;
        writeln!(f, "  max_attempts:       {}", self.retry.max_attempts)?;
        writeln!(
            f,
            "  base_delay:         {}ms",
            self.retry.base_delay.as_millis()
        )?;
        writeln!(
            f,
            "  max_delay:          {}ms",
            self.retry.max_delay.as_millis()
        )?;
        write!(
            f,
            "  backoff_multiplier: {}",
            self.retry.backoff_multiplier
        )
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(format!("Invalid {key} '{raw}': expected a number"))
        }),
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, AppError> {
    let millis = parse_var(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}
