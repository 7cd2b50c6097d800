//! Named registry of admission controllers and circuit breakers.
//!
//! One logical service name maps to at most one limiter and one breaker.
//! Handles returned by the registry are clones sharing the registered
//! instance's state.

use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::admission::{AdmissionConfig, AdmissionController, AdmissionStatus};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};

/// Process-wide lookup of resilience components by service name.
#[derive(Default)]
pub struct ResilienceRegistry {
    limiters: RwLock<HashMap<String, AdmissionController>>,
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned registry lock");
        poisoned.into_inner()
    })
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned registry lock");
        poisoned.into_inner()
    })
}

impl ResilienceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the limiter for `name`.
    ///
    /// `config` only applies when the limiter is created.
    pub fn admission(&self, name: &str, config: AdmissionConfig) -> AdmissionController {
        if let Some(existing) = read(&self.limiters).get(name) {
            return existing.clone();
        }

        write(&self.limiters)
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(limiter = %name, "Registering admission controller");
                AdmissionController::new(name, config)
            })
            .clone()
    }

    /// Get or create the breaker for `name`.
    ///
    /// `config` only applies when the breaker is created.
    pub fn circuit_breaker(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        if let Some(existing) = read(&self.breakers).get(name) {
            return existing.clone();
        }

        write(&self.breakers)
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(circuit = %name, "Registering circuit breaker");
                CircuitBreaker::new(name, config)
            })
            .clone()
    }

    pub fn get_admission(&self, name: &str) -> Option<AdmissionController> {
        read(&self.limiters).get(name).cloned()
    }

    pub fn get_circuit_breaker(&self, name: &str) -> Option<CircuitBreaker> {
        read(&self.breakers).get(name).cloned()
    }

    /// Status of every registered limiter, sorted by name.
    pub fn list_all_status(&self) -> Vec<AdmissionStatus> {
        let mut statuses: Vec<_> = read(&self.limiters)
            .values()
            .map(AdmissionController::status)
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Stats of every registered breaker, sorted by name.
    pub fn list_all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = read(&self.breakers)
            .values()
            .map(CircuitBreaker::stats)
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Changes the limit of a registered limiter. Returns `false` if `name`
    /// is unknown.
    pub fn update_limit(&self, name: &str, max_concurrent: usize) -> bool {
        match self.get_admission(name) {
            Some(limiter) => {
                limiter.update_limit(max_concurrent);
                true
            }
            None => false,
        }
    }

    /// Drops the limiter and the breaker registered under `name`.
    ///
    /// Outstanding handles keep working but are no longer reachable by name.
    /// Returns `true` if anything was removed.
    pub fn remove(&self, name: &str) -> bool {
        let limiter = write(&self.limiters).remove(name);
        let breaker = write(&self.breakers).remove(name);
        let removed = limiter.is_some() || breaker.is_some();
        if removed {
            tracing::info!(service = %name, "Removed from resilience registry");
        }
        removed
    }
}

impl fmt::Debug for ResilienceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceRegistry")
            .field("limiters", &read(&self.limiters).len())
            .field("breakers", &read(&self.breakers).len())
            .finish()
    }
}
