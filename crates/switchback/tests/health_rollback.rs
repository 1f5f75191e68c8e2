//! Integration tests for health aggregation feeding rollback decisions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use serde_json::Value;
use switchback::Environment;
use switchback::ErrorReporter;
use switchback::HealthMonitor;
use switchback::MigrationEvent;
use switchback::MigrationEventType;
use switchback::RollbackConfig;
use switchback::RollbackManager;
use switchback::RolloutConfig;
use switchback::RolloutController;
use switchback::ServiceId;
use switchback::SwitchbackError;
use switchback::REDACTED_MARKER;
use switchback::RETENTION_HOURS;
use uuid::Uuid;

fn service() -> ServiceId {
    ServiceId::new("transcription")
}

#[derive(Default)]
struct RecordingReporter {
    reports: Mutex<Vec<String>>,
}

#[async_trait]
impl ErrorReporter for RecordingReporter {
    async fn report_error(&self, _service: &ServiceId, error: &str, _context: &BTreeMap<String, Value>) {
        self.reports.lock().unwrap().push(error.to_string());
    }
}

fn backdated_event(hours_ago: i64) -> MigrationEvent {
    MigrationEvent {
        id: Uuid::new_v4(),
        service: service(),
        event_type: MigrationEventType::Success,
        used_new_implementation: true,
        timestamp: Utc::now() - chrono::Duration::hours(hours_ago),
        duration_ms: 10,
        platform: "test".to_string(),
        environment: Environment::Staging,
        metadata: BTreeMap::new(),
        error: None,
    }
}

#[tokio::test]
async fn events_older_than_the_retention_window_are_never_returned() {
    let monitor = HealthMonitor::new(Environment::Staging);
    monitor.record_event(backdated_event(RETENTION_HOURS + 1)).await;
    // The next insert prunes by age regardless of count.
    monitor.record_event(backdated_event(0)).await;
    let events = monitor.get_events_for_service(&service()).await;
    assert_eq!(events.len(), 1);
    let metrics = monitor.get_metrics().await;
    assert_eq!(metrics.overall.total_events, 1);
}

#[tokio::test]
async fn half_errors_yields_a_fifty_percent_service_error_rate() {
    let monitor = HealthMonitor::new(Environment::Staging);
    for _ in 0..50 {
        monitor
            .log_outcome(&service(), true, Duration::from_millis(20), false, Some("boom"), BTreeMap::new())
            .await;
    }
    for _ in 0..50 {
        monitor
            .log_outcome(&service(), true, Duration::from_millis(20), true, None, BTreeMap::new())
            .await;
    }
    let metrics = monitor.get_metrics().await;
    assert_eq!(metrics.services[&service()].error_rate, 50);
}

#[tokio::test]
async fn sensitive_metadata_never_reaches_the_log() {
    let monitor = HealthMonitor::new(Environment::Staging);
    let metadata = BTreeMap::from([
        ("session_token".to_string(), json!("tok_live_12345")),
        ("note".to_string(), json!("user 900101-1234 affected")),
        ("attempt".to_string(), json!(2)),
    ]);
    monitor
        .log_fallback(&service(), "codec negotiation failed", Duration::from_millis(8), metadata)
        .await;
    let events = monitor.get_events_for_service(&service()).await;
    let stored = &events[0].metadata;
    assert_eq!(stored["session_token"], json!(REDACTED_MARKER));
    assert_eq!(stored["note"], json!(REDACTED_MARKER));
    assert_eq!(stored["attempt"], json!(2));
}

#[tokio::test]
async fn observed_rate_above_threshold_forces_percentage_to_zero() {
    let controller = Arc::new(RolloutController::with_configs(
        Environment::Staging,
        [RolloutConfig::new(service()).enabled_at(25).rollback_threshold(1.0)],
    ));
    let monitor = HealthMonitor::new(Environment::Staging);
    let reporter = Arc::new(RecordingReporter::default());
    let manager = RollbackManager::new(
        Arc::clone(&controller),
        Arc::clone(&reporter) as Arc<dyn ErrorReporter>,
        RollbackConfig::default(),
    );

    // Feed metrics showing a 5% error rate.
    for _ in 0..95 {
        monitor
            .log_outcome(&service(), true, Duration::from_millis(10), true, None, BTreeMap::new())
            .await;
    }
    for _ in 0..5 {
        monitor
            .log_outcome(&service(), true, Duration::from_millis(10), false, Some("boom"), BTreeMap::new())
            .await;
    }
    let metrics = monitor.get_metrics().await;
    let observed = f64::from(metrics.services[&service()].error_rate);
    assert_eq!(observed, 5.0);

    let threshold = controller.config(&service()).await.unwrap().rollback_threshold;
    assert!(observed > threshold);
    manager
        .execute_automatic_rollback(&service(), observed, 0.0, "error rate above threshold")
        .await
        .unwrap();

    let config = controller.config(&service()).await.unwrap();
    assert_eq!(config.percentage, 0);
    assert!(!config.enabled);
    assert_eq!(manager.rollback_history().await.len(), 1);
}

#[tokio::test]
async fn cooldown_allows_exactly_one_of_two_back_to_back_rollbacks() {
    let controller = Arc::new(RolloutController::with_configs(
        Environment::Staging,
        [RolloutConfig::new(service()).enabled_at(50)],
    ));
    let reporter = Arc::new(RecordingReporter::default());
    let manager = RollbackManager::new(
        Arc::clone(&controller),
        Arc::clone(&reporter) as Arc<dyn ErrorReporter>,
        RollbackConfig::default(),
    );

    let first = manager.execute_automatic_rollback(&service(), 5.0, 0.0, "first breach").await;
    let second = manager.execute_automatic_rollback(&service(), 5.0, 0.0, "second breach").await;
    assert!(first.is_ok());
    assert!(matches!(second, Err(SwitchbackError::RollbackCooldown { .. })));
    assert_eq!(manager.rollback_history().await.len(), 1);
}
