//! Admission control for concurrent remote-fetch operations.
//!
//! An [`AdmissionController`] hands out at most `max_concurrent` slots at a
//! time. Callers beyond that wait in a FIFO queue (optionally bounded by
//! `queue_limit`) until a slot is released or their wait times out.
//!
//! [`AdmissionController::execute_all_settled`] drives a whole list of
//! operations through the controller with a sliding window of
//! `max_concurrent + queue_limit` in-flight calls, so a list longer than the
//! window is never rejected by the queue limit and every operation gets a
//! result.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AppError;
use crate::traits::{SlotContext, context_fields};

/// Configuration for an [`AdmissionController`].
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Hard cap on active slots. Always at least 1.
    pub max_concurrent: usize,

    /// Maximum time a caller waits in the queue before failing.
    pub timeout: Duration,

    /// Maximum queued callers before immediate rejection. `0` means unlimited.
    pub queue_limit: usize,
}

impl AdmissionConfig {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            timeout: Duration::from_secs(30),
            queue_limit: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }
}

/// Permission to run one concurrent operation.
///
/// The controller tracks slots by id only. Releasing a clone of an already
/// released slot is logged and ignored.
#[derive(Debug, Clone)]
pub struct Slot {
    id: Uuid,
    acquired_at: DateTime<Utc>,
    context: Option<SlotContext>,
}

impl Slot {
    fn new(context: Option<SlotContext>) -> Self {
        Self {
            id: Uuid::new_v4(),
            acquired_at: Utc::now(),
            context,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn context(&self) -> Option<&SlotContext> {
        self.context.as_ref()
    }
}

/// Outcome of one operation in [`AdmissionController::execute_all_settled`].
#[derive(Debug)]
pub enum Settled<T> {
    Fulfilled(T),
    Rejected(AppError),
}

impl<T> Settled<T> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settled::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Settled::Rejected(_))
    }

    pub fn into_result(self) -> Result<T, AppError> {
        match self {
            Settled::Fulfilled(value) => Ok(value),
            Settled::Rejected(error) => Err(error),
        }
    }
}

impl<T> From<Result<T, AppError>> for Settled<T> {
    fn from(result: Result<T, AppError>) -> Self {
        match result {
            Ok(value) => Settled::Fulfilled(value),
            Err(error) => Settled::Rejected(error),
        }
    }
}

/// Point-in-time view of a controller, for health and metrics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStatus {
    pub name: String,
    pub active: usize,
    pub max_concurrent: usize,
    pub queued: usize,
    pub queue_limit: usize,
    /// Mean time from request to grant over every granted acquisition.
    pub average_wait_time_ms: f64,
    /// Slots acquired and released.
    pub total_processed: u64,
}

/// A caller blocked on capacity.
struct Waiter {
    id: u64,
    enqueued_at: Instant,
    context: Option<SlotContext>,
    tx: oneshot::Sender<Result<Slot, AppError>>,
}

struct AdmissionState {
    max_concurrent: usize,
    queue_limit: usize,
    active: HashSet<Uuid>,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
    total_processed: u64,
    granted: u64,
    total_wait: Duration,
}

impl AdmissionState {
    fn new(config: &AdmissionConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent.max(1),
            queue_limit: config.queue_limit,
            active: HashSet::new(),
            queue: VecDeque::new(),
            next_waiter_id: 0,
            total_processed: 0,
            granted: 0,
            total_wait: Duration::ZERO,
        }
    }

    fn has_capacity(&self) -> bool {
        self.active.len() < self.max_concurrent
    }

    fn register(&mut self, slot: &Slot, waited: Duration) {
        self.active.insert(slot.id);
        self.granted += 1;
        self.total_wait += waited;
    }

    fn remove_waiter(&mut self, waiter_id: u64) -> bool {
        match self.queue.iter().position(|w| w.id == waiter_id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Grants slots to queued waiters, oldest first, while capacity allows.
    fn drain_queue(&mut self, name: &str) {
        while self.has_capacity() {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };

            let waited = waiter.enqueued_at.elapsed();
            let slot = Slot::new(waiter.context);
            let granted = slot.clone();
            match waiter.tx.send(Ok(slot)) {
                Ok(()) => {
                    self.register(&granted, waited);
                    tracing::debug!(
                        limiter = %name,
                        slot_id = %granted.id,
                        waited_ms = waited.as_millis() as u64,
                        "Granted queued admission slot"
                    );
                }
                Err(_) => {
                    // The acquirer stopped waiting; its slot was never handed out.
                    tracing::debug!(limiter = %name, "Skipping abandoned waiter");
                }
            }
        }
    }
}

/// Bounds how many operations run at once, queueing the excess in FIFO order.
///
/// Clones share state.
#[derive(Clone)]
pub struct AdmissionController {
    name: String,
    timeout: Duration,
    inner: Arc<Mutex<AdmissionState>>,
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    pub fn new(name: impl Into<String>, config: AdmissionConfig) -> Self {
        Self {
            name: name.into(),
            timeout: config.timeout,
            inner: Arc::new(Mutex::new(AdmissionState::new(&config))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, AdmissionState> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(limiter = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    pub async fn acquire(&self) -> Result<Slot, AppError> {
        self.acquire_with_context(None).await
    }

    /// Waits for a slot.
    ///
    /// Grants immediately when below `max_concurrent`. Otherwise fails at once
    /// with `QueueLimitExceeded` if the queue is full, or queues the caller and
    /// fails with `AcquisitionTimeout` if no slot frees up within the timeout.
    pub async fn acquire_with_context(
        &self,
        context: Option<SlotContext>,
    ) -> Result<Slot, AppError> {
        let mut pending = {
            let mut state = self.lock_inner();

            if state.has_capacity() {
                let slot = Slot::new(context);
                state.register(&slot, Duration::ZERO);
                tracing::debug!(
                    limiter = %self.name,
                    slot_id = %slot.id,
                    active = state.active.len(),
                    context = %context_fields(slot.context()),
                    "Granted admission slot"
                );
                return Ok(slot);
            }

            if state.queue_limit > 0 && state.queue.len() >= state.queue_limit {
                tracing::warn!(
                    limiter = %self.name,
                    queued = state.queue.len(),
                    queue_limit = state.queue_limit,
                    "Admission queue full, rejecting"
                );
                return Err(AppError::QueueLimitExceeded {
                    name: self.name.clone(),
                    limit: state.queue_limit,
                });
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            tracing::debug!(
                limiter = %self.name,
                queued = state.queue.len() + 1,
                context = %context_fields(context.as_ref()),
                "Waiting for admission slot"
            );
            state.queue.push_back(Waiter {
                id,
                enqueued_at: Instant::now(),
                context,
                tx,
            });
            PendingWaiter {
                controller: self,
                waiter_id: id,
                rx,
                settled: false,
            }
        };

        let outcome = tokio::time::timeout(self.timeout, &mut pending.rx).await;
        pending.settled = true;
        match outcome {
            Ok(Ok(granted)) => granted,
            Ok(Err(_)) => Err(AppError::QueueCleared {
                name: self.name.clone(),
            }),
            Err(_) => {
                let removed = self.lock_inner().remove_waiter(pending.waiter_id);
                if !removed {
                    // Granted or cleared in the same instant the timer fired.
                    if let Ok(granted) = pending.rx.try_recv() {
                        return granted;
                    }
                }
                tracing::warn!(
                    limiter = %self.name,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Timed out waiting for admission slot"
                );
                Err(AppError::AcquisitionTimeout {
                    name: self.name.clone(),
                    waited: self.timeout,
                })
            }
        }
    }

    /// Returns a slot and hands freed capacity to queued callers in FIFO order.
    ///
    /// Unknown slots are logged and ignored.
    pub fn release(&self, slot: &Slot) {
        let mut state = self.lock_inner();
        if !state.active.remove(&slot.id) {
            tracing::warn!(
                limiter = %self.name,
                slot_id = %slot.id,
                "Ignoring release of unknown admission slot"
            );
            return;
        }
        state.total_processed += 1;
        tracing::debug!(
            limiter = %self.name,
            slot_id = %slot.id,
            active = state.active.len(),
            "Released admission slot"
        );
        state.drain_queue(&self.name);
    }

    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnOnce(Slot) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.execute_with_context(None, operation).await
    }

    /// Acquires a slot, runs `operation` with it and releases the slot on
    /// every exit path, including a panic or the future being dropped.
    pub async fn execute_with_context<F, Fut, T>(
        &self,
        context: Option<SlotContext>,
        operation: F,
    ) -> Result<T, AppError>
    where
        F: FnOnce(Slot) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let slot = self.acquire_with_context(context).await?;
        let _guard = SlotGuard {
            controller: self,
            slot: slot.clone(),
        };
        operation(slot).await
    }

    /// Runs every operation through the controller and returns one result per
    /// operation, in input order.
    ///
    /// At most `max_concurrent + queue_limit` operations are submitted at
    /// once; the next one is submitted only when an in-flight one settles.
    pub async fn execute_all_settled<F, Fut, T>(
        &self,
        operations: Vec<F>,
        context: Option<SlotContext>,
    ) -> Vec<Settled<T>>
    where
        F: FnOnce(Slot) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let total = operations.len();
        let window = {
            let state = self.lock_inner();
            state.max_concurrent + state.queue_limit
        };
        tracing::debug!(limiter = %self.name, total, window, "Executing operations");

        let mut results: Vec<Option<Settled<T>>> =
            std::iter::repeat_with(|| None).take(total).collect();
        let mut pending = operations.into_iter().enumerate();
        let mut in_flight = FuturesUnordered::new();

        for (index, operation) in pending.by_ref().take(window) {
            in_flight.push(self.settle(index, operation, context.clone()));
        }

        while let Some((index, settled)) = in_flight.next().await {
            results[index] = Some(settled);
            if let Some((next, operation)) = pending.next() {
                in_flight.push(self.settle(next, operation, context.clone()));
            }
        }

        results
            .into_iter()
            .map(|settled| {
                settled.unwrap_or_else(|| {
                    Settled::Rejected(AppError::generic("operation was never scheduled"))
                })
            })
            .collect()
    }

    async fn settle<F, Fut, T>(
        &self,
        index: usize,
        operation: F,
        context: Option<SlotContext>,
    ) -> (usize, Settled<T>)
    where
        F: FnOnce(Slot) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let result = self.execute_with_context(context, operation).await;
        (index, result.into())
    }

    pub fn status(&self) -> AdmissionStatus {
        let state = self.lock_inner();
        let average_wait_time_ms = if state.granted == 0 {
            0.0
        } else {
            state.total_wait.as_secs_f64() * 1000.0 / state.granted as f64
        };

        AdmissionStatus {
            name: self.name.clone(),
            active: state.active.len(),
            max_concurrent: state.max_concurrent,
            queued: state.queue.len(),
            queue_limit: state.queue_limit,
            average_wait_time_ms,
            total_processed: state.total_processed,
        }
    }

    /// Changes `max_concurrent` at runtime (minimum 1).
    ///
    /// Raising the limit grants queued callers right away. Lowering it never
    /// revokes active slots.
    pub fn update_limit(&self, max_concurrent: usize) {
        let mut state = self.lock_inner();
        let previous = state.max_concurrent;
        state.max_concurrent = max_concurrent.max(1);
        tracing::info!(
            limiter = %self.name,
            previous,
            current = state.max_concurrent,
            "Admission limit updated"
        );
        if state.max_concurrent > previous {
            state.drain_queue(&self.name);
        }
    }

    /// Fails every queued caller with `QueueCleared`. Active slots are untouched.
    ///
    /// Returns the number of callers that were waiting.
    pub fn clear_queue(&self) -> usize {
        let mut state = self.lock_inner();
        let waiters: Vec<Waiter> = state.queue.drain(..).collect();
        let cleared = waiters.len();
        for waiter in waiters {
            let _ = waiter.tx.send(Err(AppError::QueueCleared {
                name: self.name.clone(),
            }));
        }
        if cleared > 0 {
            tracing::info!(limiter = %self.name, cleared, "Admission queue cleared");
        }
        cleared
    }
}

/// A queued acquisition. If the acquiring future is dropped before it
/// settles, the wait entry leaves the queue, and a slot granted in the
/// meantime goes back to the controller.
struct PendingWaiter<'a> {
    controller: &'a AdmissionController,
    waiter_id: u64,
    rx: oneshot::Receiver<Result<Slot, AppError>>,
    settled: bool,
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let removed = self.controller.lock_inner().remove_waiter(self.waiter_id);
        if removed {
            tracing::debug!(limiter = %self.controller.name, "Abandoned admission wait");
            return;
        }
        if let Ok(Ok(slot)) = self.rx.try_recv() {
            tracing::debug!(
                limiter = %self.controller.name,
                slot_id = %slot.id,
                "Returning slot granted to an abandoned waiter"
            );
            self.controller.release(&slot);
        }
    }
}

/// Releases its slot when dropped.
struct SlotGuard<'a> {
    controller: &'a AdmissionController,
    slot: Slot,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.controller.release(&self.slot);
    }
}
