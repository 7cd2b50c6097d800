use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rampart_core::{AppError, BatchOutcome};

use crate::integration::common::{FlakySource, coordinator};

#[tokio::test]
async fn twenty_units_through_window_of_eight_all_reported() {
    let coordinator = coordinator(3, 5);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let units: Vec<String> = (0..20).map(|i| format!("unit-{i}")).collect();

    let result = coordinator
        .run_batch(units.clone(), |unit| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, AppError>(unit)
            }
        })
        .await;

    assert_eq!(result.outcome, BatchOutcome::FullSuccess);
    assert_eq!(result.processed, units);
    assert_eq!(result.succeeded, units);
    assert!(peak.load(Ordering::SeqCst) <= 3);

    let status = coordinator.admission().status();
    assert_eq!(status.active, 0);
    assert_eq!(status.queued, 0);
    assert_eq!(status.total_processed, 20);
}

#[tokio::test]
async fn every_unit_lands_in_exactly_one_bucket() {
    let coordinator = coordinator(2, 1);
    let units: Vec<u32> = (0..13).collect();

    let result = coordinator
        .run_batch(units, |unit| async move {
            if unit % 3 == 0 {
                Err(AppError::Generic("rejected by source".into()))
            } else {
                Ok(())
            }
        })
        .await;

    assert_eq!(result.processed.len(), 13);
    for id in &result.processed {
        let in_succeeded = result.succeeded.contains(id);
        let in_failed = result.failed.contains(id);
        assert!(in_succeeded ^ in_failed, "unit {id} must be in exactly one bucket");
    }
    assert_eq!(result.failed, vec!["0", "3", "6", "9", "12"]);
    assert_eq!(result.outcome, BatchOutcome::PartialFailure);
}

#[tokio::test]
async fn failure_messages_name_the_unit() {
    let coordinator = coordinator(4, 0);
    let source = FlakySource::new().fail_times("beta", 1);

    let result = coordinator
        .run_batch(vec!["alpha", "beta", "gamma"], |unit| {
            let source = source.clone();
            async move { source.fetch(unit).await }
        })
        .await;

    assert_eq!(result.failed, vec!["beta"]);
    let failure = &result.failures[0];
    assert_eq!(failure.unit_id, "beta");
    assert!(failure.error.contains("beta"));
    assert!(failure.timestamp >= result.started_at);
}

#[tokio::test]
async fn upstream_fatal_error_differs_from_all_units_failing() {
    let coordinator = coordinator(2, 0);

    let aborted = coordinator
        .run_batch_from(
            async { Err::<Vec<String>, _>(AppError::generic("source list unreadable")) },
            |_unit| async { Ok::<(), AppError>(()) },
        )
        .await;

    let all_failed = coordinator
        .run_batch(vec!["a", "b"], |_unit| async {
            Err::<(), _>(AppError::Timeout(1))
        })
        .await;

    assert_eq!(aborted.outcome, BatchOutcome::TotalFailure);
    assert_eq!(all_failed.outcome, BatchOutcome::TotalFailure);

    assert!(aborted.processed.is_empty());
    assert!(aborted.fatal_error.is_some());
    assert_eq!(all_failed.processed.len(), 2);
    assert!(all_failed.fatal_error.is_none());
}
