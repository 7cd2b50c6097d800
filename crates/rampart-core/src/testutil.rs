//! Test utilities: hand-written mocks for the core traits.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls. Clones share their recordings.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::batch::{BatchEvent, BatchReporter};
use crate::error::AppError;
use crate::traits::Fetcher;

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher with scripted responses per URL.
///
/// Each call pops the next scripted response for its URL. URLs without a
/// script (or with an exhausted one) answer `body of <url>`.
#[derive(Clone, Default)]
pub struct MockFetcher {
    responses: Arc<Mutex<HashMap<String, VecDeque<Result<String, AppError>>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(self, url: &str, responses: Vec<Result<String, AppError>>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), responses.into());
        self
    }

    pub fn with_error(self, url: &str, error: AppError) -> Self {
        self.with_responses(url, vec![Err(error)])
    }

    /// URLs fetched so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.calls.lock().unwrap().push(url.to_string());
        let next = self
            .responses
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| Ok(format!("body of {url}")))
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records every batch event as a short string.
///
/// Format: `started 3`, `unit_started a`, `unit_succeeded a`,
/// `unit_failed b`, `aborted`, `finished partial-failure`.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl BatchReporter for MockReporter {
    fn report(&self, event: BatchEvent<'_>) {
        let line = match event {
            BatchEvent::Started { units, .. } => format!("started {units}"),
            BatchEvent::UnitStarted { unit_id, .. } => format!("unit_started {unit_id}"),
            BatchEvent::UnitSucceeded { unit_id, .. } => format!("unit_succeeded {unit_id}"),
            BatchEvent::UnitFailed { unit_id, .. } => format!("unit_failed {unit_id}"),
            BatchEvent::Aborted { .. } => "aborted".to_string(),
            BatchEvent::Finished { outcome, .. } => format!("finished {outcome}"),
        };
        self.events.lock().unwrap().push(line);
    }
}

// ---------------------------------------------------------------------------
// ScriptedOperation
// ---------------------------------------------------------------------------

/// An async operation that returns pre-scripted results in order.
///
/// Once the script runs out every call fails with a generic error.
#[derive(Clone)]
pub struct ScriptedOperation<T> {
    script: Arc<Mutex<VecDeque<Result<T, AppError>>>>,
    calls: Arc<AtomicU32>,
}

impl<T> ScriptedOperation<T> {
    pub fn new(script: Vec<Result<T, AppError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub async fn run(&self) -> Result<T, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(AppError::generic("script exhausted")))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}
