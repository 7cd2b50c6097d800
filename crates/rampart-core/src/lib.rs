pub mod admission;
pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod registry;
pub mod retry;
pub mod traits;

#[cfg(test)]
pub mod testutil;

pub use admission::{AdmissionConfig, AdmissionController, AdmissionStatus, Settled, Slot};
pub use batch::{
    BatchCoordinator, BatchEvent, BatchOutcome, BatchReporter, BatchResult, TracingBatchReporter,
    UnitFailure,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use config::ResilienceConfig;
pub use error::{AppError, ErrorPredicate};
pub use registry::ResilienceRegistry;
pub use retry::{RetryExecutor, RetryOutcome, RetryPolicy, Retryable};
pub use traits::{BatchUnit, Fetcher, SlotContext};
