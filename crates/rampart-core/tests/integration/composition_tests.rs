use std::time::Duration;

use rampart_core::{
    AppError, BatchOutcome, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryExecutor,
};

use crate::integration::common::{FlakySource, coordinator, fast_retry};

#[tokio::test]
async fn retry_absorbs_transient_failures_inside_a_batch() {
    let coordinator = coordinator(2, 0);
    let source = FlakySource::new().fail_times("beta", 2);
    let breaker = CircuitBreaker::new("source.test", CircuitBreakerConfig::default());
    let retry = RetryExecutor::new("source.test", fast_retry());

    let result = coordinator
        .run_batch(vec!["alpha", "beta", "gamma"], |unit| {
            let source = source.clone();
            let breaker = breaker.clone();
            let retry = retry.clone();
            async move {
                retry
                    .execute_with_retry(|| breaker.execute(|| source.fetch(unit)))
                    .await
                    .into_result()
            }
        })
        .await;

    assert_eq!(result.outcome, BatchOutcome::FullSuccess);
    // alpha and gamma once, beta three times.
    assert_eq!(source.calls(), 5);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn open_breaker_fails_remaining_units_fast() {
    let coordinator = coordinator(1, 0);
    let source = FlakySource::new();
    source.go_down();
    let breaker = CircuitBreaker::new(
        "source.test",
        CircuitBreakerConfig::default().with_failure_threshold(3),
    );
    let retry = RetryExecutor::new("source.test", fast_retry());

    let result = coordinator
        .run_batch(vec!["a", "b", "c"], |unit| {
            let source = source.clone();
            let breaker = breaker.clone();
            let retry = retry.clone();
            async move {
                retry
                    .execute_with_retry(|| breaker.execute(|| source.fetch(unit)))
                    .await
                    .into_result()
            }
        })
        .await;

    assert_eq!(result.outcome, BatchOutcome::TotalFailure);
    assert_eq!(result.failed, vec!["a", "b", "c"]);
    // Only the first unit reaches the source; its third failure opens the circuit.
    assert_eq!(source.calls(), 3);
    assert!(result.failure_for("a").unwrap().error.contains("503"));
    let fast_failed = result.failure_for("b").unwrap();
    assert!(fast_failed.error.contains("'b'"));
    assert!(fast_failed.error.contains("Circuit breaker 'source.test' is open"));
}

#[tokio::test]
async fn breaker_recovers_after_timeout() {
    let coordinator = coordinator(1, 0);
    let source = FlakySource::new();
    let breaker = CircuitBreaker::new(
        "source.test",
        CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_millis(50)),
    );

    source.go_down();
    let first = coordinator
        .run_batch(vec!["a"], |unit| {
            let source = source.clone();
            let breaker = breaker.clone();
            async move { breaker.execute(|| source.fetch(unit)).await }
        })
        .await;
    assert_eq!(first.outcome, BatchOutcome::TotalFailure);
    assert_eq!(breaker.state(), CircuitState::Open);

    source.recover();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let second = coordinator
        .run_batch(vec!["a", "b"], |unit| {
            let source = source.clone();
            let breaker = breaker.clone();
            async move { breaker.execute(|| source.fetch(unit)).await }
        })
        .await;
    assert_eq!(second.outcome, BatchOutcome::FullSuccess);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.stats().failure_count, 0);
}

#[tokio::test]
async fn non_retryable_errors_are_not_repeated() {
    let coordinator = coordinator(2, 0);
    let retry = RetryExecutor::new("source.test", fast_retry());

    let result = coordinator
        .run_batch(vec!["missing"], |unit| {
            let retry = retry.clone();
            async move {
                retry
                    .execute_with_retry(|| async move {
                        Err::<(), _>(AppError::HttpStatus {
                            status: 404,
                            url: format!("https://source.test/{unit}"),
                        })
                    })
                    .await
                    .into_result()
            }
        })
        .await;

    assert_eq!(result.outcome, BatchOutcome::TotalFailure);
    assert!(result.failures[0].error.contains("HTTP 404"));
}
