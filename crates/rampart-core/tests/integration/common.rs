use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rampart_core::{
    AdmissionConfig, AdmissionController, AppError, BatchCoordinator, RetryPolicy,
};

/// Retry policy with millisecond delays so paused-clock tests stay short.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_base_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(40))
}

pub fn coordinator(max_concurrent: usize, queue_limit: usize) -> BatchCoordinator {
    BatchCoordinator::new(AdmissionController::new(
        "integration",
        AdmissionConfig::new(max_concurrent).with_queue_limit(queue_limit),
    ))
}

/// A fake data source whose units fail a scripted number of times before
/// answering.
#[derive(Clone, Default)]
pub struct FlakySource {
    failures_left: Arc<Mutex<HashMap<String, u32>>>,
    down: Arc<Mutex<bool>>,
    calls: Arc<AtomicU32>,
}

impl FlakySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// `unit` fails with a transient error `times` times, then succeeds.
    pub fn fail_times(self, unit: &str, times: u32) -> Self {
        self.failures_left
            .lock()
            .unwrap()
            .insert(unit.to_string(), times);
        self
    }

    /// Every call fails with a 503 until [`recover`](Self::recover) is called.
    pub fn go_down(&self) {
        *self.down.lock().unwrap() = true;
    }

    pub fn recover(&self) {
        *self.down.lock().unwrap() = false;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn fetch(&self, unit: &str) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;

        if *self.down.lock().unwrap() {
            return Err(AppError::HttpStatus {
                status: 503,
                url: format!("https://source.test/{unit}"),
            });
        }

        let mut failures = self.failures_left.lock().unwrap();
        if let Some(left) = failures.get_mut(unit) {
            if *left > 0 {
                *left -= 1;
                return Err(AppError::NetworkError(format!("connection reset on {unit}")));
            }
        }
        Ok(format!("payload for {unit}"))
    }
}
