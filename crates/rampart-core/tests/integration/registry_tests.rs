use rampart_core::{
    AdmissionConfig, AppError, CircuitBreakerConfig, CircuitState, ResilienceRegistry,
};

#[tokio::test]
async fn limiters_with_different_names_do_not_share_capacity() {
    let registry = ResilienceRegistry::new();
    let weather = registry.admission("weather", AdmissionConfig::new(1));
    let traffic = registry.admission("traffic", AdmissionConfig::new(1));

    let _held = weather.acquire().await.unwrap();
    let other = traffic.acquire().await.unwrap();

    let statuses = registry.list_all_status();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].name, "traffic");
    assert_eq!(statuses[0].active, 1);
    assert_eq!(statuses[1].name, "weather");
    assert_eq!(statuses[1].active, 1);

    traffic.release(&other);
    assert_eq!(registry.get_admission("traffic").unwrap().status().active, 0);
}

#[tokio::test]
async fn opening_one_breaker_leaves_others_closed() {
    let registry = ResilienceRegistry::new();
    let config = CircuitBreakerConfig::default().with_failure_threshold(1);
    let flaky = registry.circuit_breaker("flaky.example.com", config.clone());
    let healthy = registry.circuit_breaker("healthy.example.com", config);

    let _ = flaky
        .execute(|| async { Err::<(), _>(AppError::NetworkError("down".into())) })
        .await;

    assert_eq!(flaky.state(), CircuitState::Open);
    assert_eq!(healthy.state(), CircuitState::Closed);
    assert_eq!(
        healthy.execute(|| async { Ok::<_, AppError>(1) }).await.unwrap(),
        1
    );

    let stats = registry.list_all_stats();
    assert_eq!(stats[0].state, CircuitState::Open);
    assert_eq!(stats[1].state, CircuitState::Closed);
}

#[tokio::test]
async fn removed_names_start_fresh() {
    let registry = ResilienceRegistry::new();
    let first = registry.admission("weather", AdmissionConfig::new(1));
    let _held = first.acquire().await.unwrap();

    assert!(registry.remove("weather"));

    let second = registry.admission("weather", AdmissionConfig::new(3));
    let status = second.status();
    assert_eq!(status.active, 0);
    assert_eq!(status.max_concurrent, 3);
}
