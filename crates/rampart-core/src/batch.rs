//! Batch coordination over an [`AdmissionController`].
//!
//! Runs one operation per unit with bounded concurrency. A failing unit is
//! recorded in the [`BatchResult`] and never stops the rest of the batch.

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::admission::{AdmissionController, Settled, Slot};
use crate::error::AppError;
use crate::traits::{BatchUnit, SlotContext};

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Events emitted while a batch runs.
#[derive(Debug)]
pub enum BatchEvent<'a> {
    Started {
        batch_id: Uuid,
        units: usize,
    },
    UnitStarted {
        batch_id: Uuid,
        unit_id: &'a str,
    },
    UnitSucceeded {
        batch_id: Uuid,
        unit_id: &'a str,
    },
    UnitFailed {
        batch_id: Uuid,
        unit_id: &'a str,
        error: &'a str,
    },
    /// Units could not be loaded; nothing was processed.
    Aborted {
        batch_id: Uuid,
        error: &'a str,
    },
    Finished {
        batch_id: Uuid,
        outcome: BatchOutcome,
        succeeded: usize,
        failed: usize,
        duration_ms: u64,
    },
}

/// Receives [`BatchEvent`]s. The default implementation ignores them.
pub trait BatchReporter: Send + Sync {
    fn report(&self, event: BatchEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBatchReporter;

impl BatchReporter for TracingBatchReporter {
    fn report(&self, event: BatchEvent<'_>) {
        match event {
            BatchEvent::Started { batch_id, units } => {
                tracing::info!(%batch_id, units, "Batch started");
            }
            BatchEvent::UnitStarted { batch_id, unit_id } => {
                tracing::debug!(%batch_id, %unit_id, "Processing unit");
            }
            BatchEvent::UnitSucceeded { batch_id, unit_id } => {
                tracing::info!(%batch_id, %unit_id, "Unit succeeded");
            }
            BatchEvent::UnitFailed {
                batch_id,
                unit_id,
                error,
            } => {
                tracing::warn!(%batch_id, %unit_id, %error, "Unit failed");
            }
            BatchEvent::Aborted { batch_id, error } => {
                tracing::error!(%batch_id, %error, "Batch aborted before any unit started");
            }
            BatchEvent::Finished {
                batch_id,
                outcome,
                succeeded,
                failed,
                duration_ms,
            } => {
                tracing::info!(
                    %batch_id,
                    %outcome,
                    succeeded,
                    failed,
                    duration_ms,
                    "Batch finished"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Overall verdict for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchOutcome {
    FullSuccess,
    PartialFailure,
    TotalFailure,
}

impl BatchOutcome {
    fn classify(succeeded: usize, failed: usize) -> Self {
        if failed == 0 {
            BatchOutcome::FullSuccess
        } else if succeeded == 0 {
            BatchOutcome::TotalFailure
        } else {
            BatchOutcome::PartialFailure
        }
    }

    /// Process exit code: 0 full success, 1 partial failure, 2 total failure.
    pub fn exit_code(self) -> u8 {
        match self {
            BatchOutcome::FullSuccess => 0,
            BatchOutcome::PartialFailure => 1,
            BatchOutcome::TotalFailure => 2,
        }
    }
}

impl fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchOutcome::FullSuccess => write!(f, "full-success"),
            BatchOutcome::PartialFailure => write!(f, "partial-failure"),
            BatchOutcome::TotalFailure => write!(f, "total-failure"),
        }
    }
}

/// One failed unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    pub unit_id: String,
    /// Always names the unit.
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate result of one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    /// Every submitted unit, in input order.
    pub processed: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub failures: Vec<UnitFailure>,
    pub outcome: BatchOutcome,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when the batch failed before any unit started.
    pub fatal_error: Option<String>,
}

impl BatchResult {
    pub fn is_aborted(&self) -> bool {
        self.fatal_error.is_some()
    }

    pub fn failure_for(&self, unit_id: &str) -> Option<&UnitFailure> {
        self.failures.iter().find(|f| f.unit_id == unit_id)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Reports a failed unit and records when it failed.
fn unit_failed<R: BatchReporter>(
    reporter: &R,
    batch_id: Uuid,
    unit_id: &str,
    error: &AppError,
) -> UnitFailure {
    let message = format!("Unit '{unit_id}' failed: {error}");
    reporter.report(BatchEvent::UnitFailed {
        batch_id,
        unit_id,
        error: &message,
    });
    UnitFailure {
        unit_id: unit_id.to_string(),
        error: message,
        timestamp: Utc::now(),
    }
}


/// Drives a list of units through an [`AdmissionController`].
pub struct BatchCoordinator<R = TracingBatchReporter> {
    admission: AdmissionController,
    reporter: R,
}

impl BatchCoordinator<TracingBatchReporter> {
    pub fn new(admission: AdmissionController) -> Self {
        Self {
            admission,
            reporter: TracingBatchReporter,
        }
    }
}

impl<R: BatchReporter> BatchCoordinator<R> {
    pub fn with_reporter(admission: AdmissionController, reporter: R) -> Self {
        Self {
            admission,
            reporter,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Runs `operation` once per unit and aggregates the results.
    ///
    /// Every unit ends up in exactly one of `succeeded` or `failed`, however
    /// many units there are relative to the admission window.
    pub async fn run_batch<U, F, Fut, T>(&self, units: Vec<U>, operation: F) -> BatchResult
    where
        U: BatchUnit,
        F: Fn(U) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();

        let ids: Vec<String> = units.iter().map(BatchUnit::unit_id).collect();
        self.reporter.report(BatchEvent::Started {
            batch_id,
            units: ids.len(),
        });

        let operation = &operation;
        let reporter = &self.reporter;
        let unit_operations: Vec<_> = units
            .into_iter()
            .zip(ids.iter())
            .map(|(unit, unit_id)| {
                move |_slot: Slot| async move {
                    reporter.report(BatchEvent::UnitStarted { batch_id, unit_id });
                    let settled = match operation(unit).await {
                        Ok(_) => {
                            reporter.report(BatchEvent::UnitSucceeded { batch_id, unit_id });
                            Ok(())
                        }
                        Err(error) => Err(unit_failed(reporter, batch_id, unit_id, &error)),
                    };
                    Ok::<_, AppError>(settled)
                }
            })
            .collect();

        let context = SlotContext::from([("batch_id".to_string(), batch_id.to_string())]);
        let settled = self
            .admission
            .execute_all_settled(unit_operations, Some(context))
            .await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut failures = Vec::new();
        for (unit_id, result) in ids.iter().zip(settled) {
            let failure = match result {
                Settled::Fulfilled(Ok(())) => {
                    succeeded.push(unit_id.clone());
                    continue;
                }
                Settled::Fulfilled(Err(failure)) => failure,
                // Never admitted, so the operation did not run.
                Settled::Rejected(error) => unit_failed(&self.reporter, batch_id, unit_id, &error),
            };
            failed.push(unit_id.clone());
            failures.push(failure);
        }

        let outcome = BatchOutcome::classify(succeeded.len(), failed.len());
        self.finish(BatchResult {
            batch_id,
            processed: ids,
            succeeded,
            failed,
            failures,
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
            started_at,
            finished_at: Utc::now(),
            fatal_error: None,
        })
    }

    /// Loads the units first, then runs them like [`run_batch`](Self::run_batch).
    ///
    /// If loading fails the batch is a `TotalFailure` with nothing processed
    /// and `fatal_error` set, distinguishable from every unit failing.
    pub async fn run_batch_from<L, U, F, Fut, T>(&self, loader: L, operation: F) -> BatchResult
    where
        L: Future<Output = Result<Vec<U>, AppError>>,
        U: BatchUnit,
        F: Fn(U) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let started_at = Utc::now();
        let started = Instant::now();

        match loader.await {
            Ok(units) => self.run_batch(units, operation).await,
            Err(error) => {
                let batch_id = Uuid::new_v4();
                let message = error.to_string();
                self.reporter.report(BatchEvent::Aborted {
                    batch_id,
                    error: &message,
                });
                self.finish(BatchResult {
                    batch_id,
                    processed: Vec::new(),
                    succeeded: Vec::new(),
                    failed: Vec::new(),
                    failures: Vec::new(),
                    outcome: BatchOutcome::TotalFailure,
                    duration_ms: started.elapsed().as_millis() as u64,
                    started_at,
                    finished_at: Utc::now(),
                    fatal_error: Some(message),
                })
            }
        }
    }

    fn finish(&self, result: BatchResult) -> BatchResult {
        self.reporter.report(BatchEvent::Finished {
            batch_id: result.batch_id,
            outcome: result.outcome,
            succeeded: result.succeeded.len(),
            failed: result.failed.len(),
            duration_ms: result.duration_ms,
        });
        result
    }
}
