//! Automatic and manual rollback execution.
//!
//! Rolling a service back forces its rollout percentage to 0 and disables
//! it, so the legacy implementation becomes authoritative again. Two guards
//! bound the blast radius of a flapping health signal:
//!
//! - a per-service cooldown rejects rollbacks that arrive too soon after the
//!   previous one, preventing oscillation with an external re-enable;
//! - a per-service attempt limit refuses further automatic rollbacks once
//!   exhausted and escalates to the error-reporting sink instead of
//!   silently retrying forever.
//!
//! Every executed rollback appends an immutable [`RollbackRecord`]; the
//! history is capped to the most recent entries for display.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::error::SwitchbackError;
use crate::redact::redact_metadata;
use crate::reporting::ErrorReporter;
use crate::rollout::RolloutController;
use crate::types::ServiceId;

/// Maximum rollback records retained for display.
pub const MAX_ROLLBACK_HISTORY: usize = 50;

/// What initiated a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    /// Health thresholds breached, no human action.
    Automatic,
    /// Explicit operator request.
    Manual,
}

impl fmt::Display for RollbackTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Automatic => f.write_str("automatic"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

/// Record of one executed rollback. Append-only, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    /// Service that was rolled back.
    pub service: ServiceId,
    /// What initiated the rollback.
    pub trigger: RollbackTrigger,
    /// Why the rollback was executed.
    pub reason: String,
    /// Error rate observed at trigger time, percent.
    pub error_rate: f64,
    /// Performance impact observed at trigger time.
    pub performance_impact: f64,
    /// When the rollback completed.
    pub timestamp: DateTime<Utc>,
}

/// Guard configuration for rollback execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Minimum elapsed time between rollbacks for the same service.
    pub cooldown: Duration,
    /// Automatic rollbacks allowed per service before escalation.
    pub max_attempts: u32,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30 * 60),
            max_attempts: 3,
        }
    }
}

#[derive(Default)]
struct RollbackState {
    history: Vec<RollbackRecord>,
    attempts: HashMap<ServiceId, u32>,
    last_rollback: HashMap<ServiceId, DateTime<Utc>>,
}

/// Executes rollbacks against the rollout controller, subject to cooldown
/// and attempt-limit guards.
pub struct RollbackManager {
    controller: Arc<RolloutController>,
    reporter: Arc<dyn ErrorReporter>,
    config: RollbackConfig,
    state: RwLock<RollbackState>,
}

impl RollbackManager {
    /// Create a manager over a controller and an error-reporting sink.
    pub fn new(
        controller: Arc<RolloutController>,
        reporter: Arc<dyn ErrorReporter>,
        config: RollbackConfig,
    ) -> Self {
        Self {
            controller,
            reporter,
            config,
            state: RwLock::new(RollbackState::default()),
        }
    }

    /// Roll a service back in response to a health-check failure.
    pub async fn execute_automatic_rollback(
        &self,
        service: &ServiceId,
        error_rate: f64,
        performance_impact: f64,
        reason: &str,
    ) -> Result<RollbackRecord> {
        self.execute(service, RollbackTrigger::Automatic, error_rate, performance_impact, reason)
            .await
    }

    /// Roll a service back on explicit operator request.
    ///
    /// The cooldown still applies; the attempt limit does not, since a human
    /// issuing the rollback is already the escalation path.
    pub async fn execute_manual_rollback(
        &self,
        service: &ServiceId,
        error_rate: f64,
        reason: &str,
    ) -> Result<RollbackRecord> {
        self.execute(service, RollbackTrigger::Manual, error_rate, 0.0, reason).await
    }

    /// Executed rollbacks, oldest first, capped to [`MAX_ROLLBACK_HISTORY`].
    pub async fn rollback_history(&self) -> Vec<RollbackRecord> {
        let state = self.state.read().await;
        state.history.clone()
    }

    /// Executed rollback count for a service.
    pub async fn attempts(&self, service: &ServiceId) -> u32 {
        let state = self.state.read().await;
        state.attempts.get(service).copied().unwrap_or(0)
    }

    /// Administrative reset of the attempt counter, used together with an
    /// external re-enable of the service.
    pub async fn reset_attempts(&self, service: &ServiceId) {
        let mut state = self.state.write().await;
        state.attempts.remove(service);
    }

    // The guard check and the state commit run under one write-lock
    // acquisition, so two interleaved rollbacks for the same service can
    // never both pass the cooldown.
    async fn execute(
        &self,
        service: &ServiceId,
        trigger: RollbackTrigger,
        error_rate: f64,
        performance_impact: f64,
        reason: &str,
    ) -> Result<RollbackRecord> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        if let Some(last) = state.last_rollback.get(service) {
            let elapsed = (now - *last)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed < self.config.cooldown {
                let remaining_secs = (self.config.cooldown - elapsed).as_secs();
                warn!(
                    service = %service,
                    remaining_secs,
                    "rollback rejected: cooldown active"
                );
                return Err(SwitchbackError::RollbackCooldown {
                    service: service.clone(),
                    remaining_secs,
                });
            }
        }
        let attempts = state.attempts.get(service).copied().unwrap_or(0);
        if trigger == RollbackTrigger::Automatic && attempts >= self.config.max_attempts {
            drop(state);
            let context = redact_metadata(BTreeMap::from([
                ("attempts".to_string(), json!(attempts)),
                ("reason".to_string(), json!(reason)),
            ]));
            self.reporter
                .report_error(service, "rollback attempts exhausted, human intervention required", &context)
                .await;
            return Err(SwitchbackError::RollbackAttemptsExhausted {
                service: service.clone(),
                attempts,
            });
        }

        self.controller.force_rollback(service).await?;

        let record = RollbackRecord {
            service: service.clone(),
            trigger,
            reason: reason.to_string(),
            error_rate,
            performance_impact,
            timestamp: now,
        };
        *state.attempts.entry(service.clone()).or_insert(0) += 1;
        state.last_rollback.insert(service.clone(), now);
        state.history.push(record.clone());
        if state.history.len() > MAX_ROLLBACK_HISTORY {
            let excess = state.history.len() - MAX_ROLLBACK_HISTORY;
            state.history.drain(..excess);
        }
        drop(state);

        let context = redact_metadata(BTreeMap::from([
            ("trigger".to_string(), json!(record.trigger.to_string())),
            ("error_rate".to_string(), json!(error_rate)),
            ("performance_impact".to_string(), json!(performance_impact)),
        ]));
        self.reporter
            .report_error(service, &format!("rollback executed: {reason}"), &context)
            .await;
        info!(
            service = %service,
            trigger = %record.trigger,
            error_rate,
            "rollback executed, legacy implementation authoritative"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use crate::reporting::testing::RecordingReporter;
    use crate::rollout::RolloutConfig;
    use crate::types::Environment;

    use super::*;

    fn service() -> ServiceId {
        ServiceId::new("transcription")
    }

    fn manager(config: RollbackConfig) -> (Arc<RolloutController>, Arc<RecordingReporter>, RollbackManager) {
        let controller = Arc::new(RolloutController::with_configs(
            Environment::Staging,
            [RolloutConfig::new(service()).enabled_at(50)],
        ));
        let reporter = Arc::new(RecordingReporter::default());
        let manager = RollbackManager::new(
            Arc::clone(&controller),
            Arc::clone(&reporter) as Arc<dyn ErrorReporter>,
            config,
        );
        (controller, reporter, manager)
    }

    #[tokio::test]
    async fn test_rollback_zeroes_percentage_and_records() {
        let (controller, reporter, manager) = manager(RollbackConfig::default());
        let record = manager
            .execute_automatic_rollback(&service(), 5.0, 1.5, "error rate above threshold")
            .await
            .unwrap();
        assert_eq!(record.trigger, RollbackTrigger::Automatic);
        assert_eq!(record.error_rate, 5.0);

        let config = controller.config(&service()).await.unwrap();
        assert_eq!(config.percentage, 0);
        assert!(!config.enabled);
        assert_eq!(manager.rollback_history().await.len(), 1);
        assert_eq!(reporter.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_rejects_second_rollback() {
        let (_, _, manager) = manager(RollbackConfig::default());
        manager
            .execute_automatic_rollback(&service(), 5.0, 0.0, "first")
            .await
            .unwrap();
        let second = manager.execute_automatic_rollback(&service(), 5.0, 0.0, "second").await;
        assert!(matches!(second, Err(SwitchbackError::RollbackCooldown { .. })));
        assert_eq!(manager.rollback_history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhaustion_refuses_and_escalates() {
        let config = RollbackConfig {
            cooldown: Duration::ZERO,
            max_attempts: 2,
        };
        let (controller, reporter, manager) = manager(config);
        for n in 0..2 {
            controller.re_enable(&service(), 50).await.unwrap();
            manager
                .execute_automatic_rollback(&service(), 5.0, 0.0, &format!("breach {n}"))
                .await
                .unwrap();
        }
        controller.re_enable(&service(), 50).await.unwrap();
        let refused = manager.execute_automatic_rollback(&service(), 5.0, 0.0, "breach 2").await;
        assert!(matches!(
            refused,
            Err(SwitchbackError::RollbackAttemptsExhausted { attempts: 2, .. })
        ));
        // Escalation report on top of the two execution reports.
        assert_eq!(reporter.reports().len(), 3);
        // The rollout stays wherever the external re-enable put it.
        assert_eq!(controller.config(&service()).await.unwrap().percentage, 50);

        manager.reset_attempts(&service()).await;
        assert!(manager.execute_automatic_rollback(&service(), 5.0, 0.0, "after reset").await.is_ok());
    }

    #[tokio::test]
    async fn test_interleaved_rollbacks_execute_exactly_once() {
        let (_, _, manager) = manager(RollbackConfig::default());
        let service = service();
        let (first, second) = tokio::join!(
            manager.execute_automatic_rollback(&service, 5.0, 0.0, "first observer"),
            manager.execute_automatic_rollback(&service, 5.0, 0.0, "second observer"),
        );
        let executed = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!(executed, 1, "exactly one of two racing rollbacks may execute");
        assert_eq!(manager.rollback_history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_manual_rollback_ignores_attempt_limit() {
        let config = RollbackConfig {
            cooldown: Duration::ZERO,
            max_attempts: 1,
        };
        let (controller, _, manager) = manager(config);
        manager.execute_automatic_rollback(&service(), 5.0, 0.0, "auto").await.unwrap();
        controller.re_enable(&service(), 25).await.unwrap();
        let record = manager.execute_manual_rollback(&service(), 2.0, "operator request").await.unwrap();
        assert_eq!(record.trigger, RollbackTrigger::Manual);
    }

    #[tokio::test]
    async fn test_unknown_service_rollback_propagates() {
        let (_, _, manager) = manager(RollbackConfig::default());
        let missing = ServiceId::new("ghost");
        let result = manager.execute_manual_rollback(&missing, 0.0, "nope").await;
        assert!(matches!(result, Err(SwitchbackError::UnknownRolloutService { .. })));
    }
}
