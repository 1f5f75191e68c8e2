//! Migration health monitoring.
//!
//! An append-only event log of implementation-load outcomes, bounded both by
//! a maximum count and a retention window. Metadata passes through redaction
//! at write time, so raw sensitive values never reach the log. Aggregated
//! metrics drive the rollback manager's thresholds and the orchestrator's
//! phase gates.
//!
//! Bounded storage:
//!
//! - `MAX_EVENTS` caps the log; oldest entries are evicted first.
//! - `RETENTION_HOURS` drops expired events on every insert, independent of
//!   the count cap.
//!
//! Recorded events fan out on a broadcast channel for observers, and are
//! persisted fire-and-forget to an optional [`EventSink`]; a sink failure is
//! logged and never blocks the caller.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::redact::redact_metadata;
use crate::types::Environment;
use crate::types::ServiceId;

/// Maximum events retained in the log.
pub const MAX_EVENTS: usize = 1_000;

/// Retention window for events, in hours.
pub const RETENTION_HOURS: i64 = 24;

/// Capacity of the broadcast channel for event observers.
const BROADCAST_CAPACITY: usize = 256;

/// Outcome class of an implementation load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationEventType {
    /// The selected implementation loaded and completed.
    Success,
    /// The selected implementation failed.
    Error,
    /// The new implementation was abandoned mid-flight for the legacy one.
    Fallback,
}

impl MigrationEventType {
    /// String form used in logs and sinks.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Fallback => "fallback",
        }
    }
}

/// One recorded implementation-resolution outcome. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationEvent {
    /// Unique event id.
    pub id: Uuid,
    /// Service the outcome belongs to.
    pub service: ServiceId,
    /// Outcome class.
    pub event_type: MigrationEventType,
    /// Whether the new implementation was used.
    pub used_new_implementation: bool,
    /// When the outcome was recorded.
    pub timestamp: DateTime<Utc>,
    /// How long the load took, in milliseconds.
    pub duration_ms: u64,
    /// Host platform tag.
    pub platform: String,
    /// Environment tag.
    pub environment: Environment,
    /// Sanitized metadata; redacted before storage.
    pub metadata: BTreeMap<String, Value>,
    /// Error summary, when the outcome was not a success.
    pub error: Option<String>,
}

/// Aggregated health for one scope (global or per service).
///
/// Rates are rounded percentages of total events in the scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthSummary {
    /// Events counted in the scope.
    pub total_events: u64,
    /// Successful loads of the new implementation.
    pub successful_migrations: u64,
    /// Fallbacks to the legacy implementation.
    pub fallbacks: u64,
    /// Errors.
    pub errors: u64,
    /// Rounded percentage of successful new-implementation loads.
    pub success_rate: u8,
    /// Rounded percentage of fallbacks.
    pub fallback_rate: u8,
    /// Rounded percentage of errors.
    pub error_rate: u8,
    /// Average load duration across the scope, in milliseconds.
    pub avg_duration_ms: f64,
}

/// Full metrics snapshot: global summary plus per-service breakdown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthMetrics {
    /// Aggregation over every unexpired event.
    pub overall: HealthSummary,
    /// Per-service aggregation.
    pub services: BTreeMap<ServiceId, HealthSummary>,
}

/// Durable destination for recorded events.
///
/// Persistence is fire-and-forget: the monitor spawns the write and logs a
/// warning on failure without blocking or failing the recording call.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Persist one event.
    async fn persist(&self, event: &MigrationEvent) -> anyhow::Result<()>;
}

/// Append-only, capped, time-windowed log of migration outcomes.
pub struct HealthMonitor {
    environment: Environment,
    events: RwLock<VecDeque<MigrationEvent>>,
    broadcast: broadcast::Sender<MigrationEvent>,
    sink: Option<Arc<dyn EventSink>>,
}

impl HealthMonitor {
    /// Create a monitor with no durable sink.
    pub fn new(environment: Environment) -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            environment,
            events: RwLock::new(VecDeque::new()),
            broadcast,
            sink: None,
        }
    }

    /// Attach a durable event sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Subscribe to recorded events.
    ///
    /// The receiver sees every event recorded after the call; lagging
    /// receivers miss events rather than blocking the monitor.
    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.broadcast.subscribe()
    }

    /// Record an implementation-load outcome.
    pub async fn log_outcome(
        &self,
        service: &ServiceId,
        used_new_implementation: bool,
        duration: Duration,
        success: bool,
        error: Option<&str>,
        metadata: BTreeMap<String, Value>,
    ) {
        let event_type = if success {
            MigrationEventType::Success
        } else {
            MigrationEventType::Error
        };
        let event = self.build_event(
            service,
            event_type,
            used_new_implementation,
            duration,
            error,
            metadata,
        );
        self.record_event(event).await;
    }

    /// Record a fallback from the new implementation to the legacy one.
    ///
    /// A fallback means the new path was abandoned mid-flight, so the event
    /// always records the new implementation as not used.
    pub async fn log_fallback(
        &self,
        service: &ServiceId,
        original_error: &str,
        duration: Duration,
        metadata: BTreeMap<String, Value>,
    ) {
        let event = self.build_event(
            service,
            MigrationEventType::Fallback,
            false,
            duration,
            Some(original_error),
            metadata,
        );
        self.record_event(event).await;
    }

    /// Append a fully-built event to the log.
    ///
    /// Low-level entry used by [`Self::log_outcome`] and
    /// [`Self::log_fallback`]; expired events are dropped on every insert and
    /// the count cap evicts oldest-first.
    pub async fn record_event(&self, event: MigrationEvent) {
        {
            let mut events = self.events.write().await;
            let cutoff = Utc::now() - chrono::Duration::hours(RETENTION_HOURS);
            events.retain(|existing| existing.timestamp >= cutoff);
            events.push_back(event.clone());
            while events.len() > MAX_EVENTS {
                events.pop_front();
            }
        }
        debug!(
            service = %event.service,
            event_type = event.event_type.as_str(),
            duration_ms = event.duration_ms,
            "migration event recorded"
        );
        // Ignore the error: no subscribers is the normal case.
        let _ = self.broadcast.send(event.clone());
        if let Some(sink) = &self.sink {
            let sink = Arc::clone(sink);
            tokio::spawn(async move {
                if let Err(error) = sink.persist(&event).await {
                    warn!(service = %event.service, error = %error, "event sink persist failed");
                }
            });
        }
    }

    /// Aggregate the unexpired event set into global and per-service metrics.
    ///
    /// An empty log yields an explicit all-zero snapshot.
    pub async fn get_metrics(&self) -> HealthMetrics {
        let cutoff = Utc::now() - chrono::Duration::hours(RETENTION_HOURS);
        let events = self.events.read().await;
        let live: Vec<&MigrationEvent> =
            events.iter().filter(|event| event.timestamp >= cutoff).collect();

        let mut metrics = HealthMetrics {
            overall: summarize(live.iter().copied()),
            services: BTreeMap::new(),
        };
        let mut by_service: BTreeMap<&ServiceId, Vec<&MigrationEvent>> = BTreeMap::new();
        for event in &live {
            by_service.entry(&event.service).or_default().push(*event);
        }
        for (service, events) in by_service {
            metrics
                .services
                .insert(service.clone(), summarize(events.iter().copied()));
        }
        metrics
    }

    /// Unexpired events for one service, oldest first.
    pub async fn get_events_for_service(&self, service: &ServiceId) -> Vec<MigrationEvent> {
        let cutoff = Utc::now() - chrono::Duration::hours(RETENTION_HOURS);
        let events = self.events.read().await;
        events
            .iter()
            .filter(|event| &event.service == service && event.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    fn build_event(
        &self,
        service: &ServiceId,
        event_type: MigrationEventType,
        used_new_implementation: bool,
        duration: Duration,
        error: Option<&str>,
        metadata: BTreeMap<String, Value>,
    ) -> MigrationEvent {
        MigrationEvent {
            id: Uuid::new_v4(),
            service: service.clone(),
            event_type,
            used_new_implementation,
            timestamp: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            platform: std::env::consts::OS.to_string(),
            environment: self.environment,
            metadata: redact_metadata(metadata),
            error: error.map(str::to_string),
        }
    }
}

fn summarize<'a>(events: impl Iterator<Item = &'a MigrationEvent>) -> HealthSummary {
    let mut summary = HealthSummary::default();
    let mut total_duration_ms: u64 = 0;
    for event in events {
        summary.total_events += 1;
        total_duration_ms += event.duration_ms;
        match event.event_type {
            MigrationEventType::Success if event.used_new_implementation => {
                summary.successful_migrations += 1;
            }
            MigrationEventType::Success => {}
            MigrationEventType::Error => summary.errors += 1,
            MigrationEventType::Fallback => summary.fallbacks += 1,
        }
    }
    if summary.total_events > 0 {
        summary.success_rate = rate(summary.successful_migrations, summary.total_events);
        summary.fallback_rate = rate(summary.fallbacks, summary.total_events);
        summary.error_rate = rate(summary.errors, summary.total_events);
        summary.avg_duration_ms = total_duration_ms as f64 / summary.total_events as f64;
    }
    summary
}

/// Rounded percentage of `part` in `total`.
fn rate(part: u64, total: u64) -> u8 {
    ((part as f64 / total as f64) * 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ServiceId {
        ServiceId::new("signalling")
    }

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(Environment::Staging)
    }

    #[tokio::test]
    async fn test_empty_log_yields_all_zero_metrics() {
        let metrics = monitor().get_metrics().await;
        assert_eq!(metrics.overall, HealthSummary::default());
        assert!(metrics.services.is_empty());
    }

    #[tokio::test]
    async fn test_error_rate_is_rounded_percentage() {
        let monitor = monitor();
        for _ in 0..50 {
            monitor
                .log_outcome(&service(), true, Duration::from_millis(10), true, None, BTreeMap::new())
                .await;
        }
        for _ in 0..50 {
            monitor
                .log_outcome(
                    &service(),
                    true,
                    Duration::from_millis(30),
                    false,
                    Some("boom"),
                    BTreeMap::new(),
                )
                .await;
        }
        let metrics = monitor.get_metrics().await;
        let breakdown = &metrics.services[&service()];
        assert_eq!(breakdown.total_events, 100);
        assert_eq!(breakdown.error_rate, 50);
        assert_eq!(breakdown.success_rate, 50);
        assert_eq!(breakdown.avg_duration_ms, 20.0);
    }

    #[tokio::test]
    async fn test_fallback_marks_new_implementation_unused() {
        let monitor = monitor();
        monitor
            .log_fallback(&service(), "codec mismatch", Duration::from_millis(5), BTreeMap::new())
            .await;
        let events = monitor.get_events_for_service(&service()).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, MigrationEventType::Fallback);
        assert!(!events[0].used_new_implementation);
        assert_eq!(events[0].error.as_deref(), Some("codec mismatch"));
    }

    #[tokio::test]
    async fn test_expired_events_dropped_on_insert() {
        let monitor = monitor();
        monitor
            .log_outcome(&service(), true, Duration::ZERO, true, None, BTreeMap::new())
            .await;
        // Backdate an event past the retention window.
        let mut events = monitor.events.write().await;
        events[0].timestamp = Utc::now() - chrono::Duration::hours(RETENTION_HOURS + 1);
        drop(events);

        monitor
            .log_outcome(&service(), true, Duration::ZERO, true, None, BTreeMap::new())
            .await;
        let events = monitor.get_events_for_service(&service()).await;
        assert_eq!(events.len(), 1, "expired event must be evicted on insert");
    }

    #[tokio::test]
    async fn test_count_cap_evicts_oldest_first() {
        let monitor = monitor();
        for n in 0..(MAX_EVENTS + 10) {
            let mut metadata = BTreeMap::new();
            metadata.insert("sequence".to_string(), serde_json::json!(n));
            monitor
                .log_outcome(&service(), true, Duration::ZERO, true, None, metadata)
                .await;
        }
        let events = monitor.get_events_for_service(&service()).await;
        assert_eq!(events.len(), MAX_EVENTS);
        assert_eq!(events[0].metadata["sequence"], serde_json::json!(10));
    }

    #[tokio::test]
    async fn test_metadata_redacted_at_write_time() {
        let monitor = monitor();
        let metadata = BTreeMap::from([
            ("auth_token".to_string(), serde_json::json!("abc")),
            ("attempt".to_string(), serde_json::json!(1)),
        ]);
        monitor
            .log_outcome(&service(), true, Duration::ZERO, true, None, metadata)
            .await;
        let events = monitor.get_events_for_service(&service()).await;
        assert_eq!(events[0].metadata["auth_token"], serde_json::json!(crate::redact::REDACTED_MARKER));
        assert_eq!(events[0].metadata["attempt"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_subscribers_receive_recorded_events() {
        let monitor = monitor();
        let mut rx = monitor.subscribe();
        monitor
            .log_outcome(&service(), true, Duration::ZERO, true, None, BTreeMap::new())
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.service, service());
    }
}
