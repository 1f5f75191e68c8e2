//! Deterministic progressive-rollout decisions.
//!
//! Given a service and a stable per-entity identifier, the controller
//! decides whether the new or the legacy implementation is active. Bucketing
//! is a non-cryptographic rolling hash, so the same identifier lands on the
//! same side of the rollout on every call within a deployment window; there
//! is no randomness anywhere in the decision path.
//!
//! Decision order is fixed: unknown or disabled services decide `false`,
//! then the date window is applied (before `start_date` always `false`,
//! after `end_date` always `true`), and only then is the percentile bucket
//! compared against the rollout percentage.
//!
//! Percentage mutations are single assignments under a short write lock that
//! is never held across an await, so interleaved writers (orchestrator and
//! rollback manager) are last-writer-wins with no partially-applied state.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::info;

use crate::error::Result;
use crate::error::SwitchbackError;
use crate::types::Environment;
use crate::types::ServiceId;

/// Stable-identifier sentinel used when neither a user id nor a session id
/// is available.
pub const ANONYMOUS_ID: &str = "anonymous";

/// Rollout configuration for a single service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Service the configuration applies to.
    pub service: ServiceId,
    /// Whether the rollout is enabled at all.
    pub enabled: bool,
    /// Share of stably-bucketed entities on the new implementation (0-100).
    pub percentage: u8,
    /// Rollout window start; decisions before this are always legacy.
    pub start_date: DateTime<Utc>,
    /// Optional window end; decisions after this are always new.
    pub end_date: Option<DateTime<Utc>>,
    /// Error-rate percentage above which the rollback manager triggers.
    pub rollback_threshold: f64,
    /// Whether phase monitoring is armed for this service.
    pub monitoring_enabled: bool,
}

impl RolloutConfig {
    /// A disabled 0% configuration starting now.
    pub fn new(service: impl Into<ServiceId>) -> Self {
        Self {
            service: service.into(),
            enabled: false,
            percentage: 0,
            start_date: Utc::now(),
            end_date: None,
            rollback_threshold: 5.0,
            monitoring_enabled: true,
        }
    }

    /// Enable the rollout at the given percentage (clamped to 100).
    pub fn enabled_at(mut self, percentage: u8) -> Self {
        self.enabled = true;
        self.percentage = percentage.min(100);
        self
    }

    /// Set the rollout window start.
    pub fn starting(mut self, start_date: DateTime<Utc>) -> Self {
        self.start_date = start_date;
        self
    }

    /// Set the rollout window end.
    pub fn ending(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }

    /// Set the rollback error-rate threshold.
    pub fn rollback_threshold(mut self, threshold: f64) -> Self {
        self.rollback_threshold = threshold;
        self
    }
}

/// Snapshot of the full rollout configuration surface.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutStatus {
    /// Environment the controller serves.
    pub environment: Environment,
    /// Per-service configuration, keyed by service id.
    pub services: BTreeMap<ServiceId, RolloutConfig>,
}

/// Decides, per service and per stable identifier, which implementation is
/// active. One controller instance serves one environment.
#[derive(Debug)]
pub struct RolloutController {
    environment: Environment,
    configs: RwLock<BTreeMap<ServiceId, RolloutConfig>>,
}

impl RolloutController {
    /// Create a controller with no configured services.
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            configs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a controller pre-populated with configurations.
    pub fn with_configs(environment: Environment, configs: impl IntoIterator<Item = RolloutConfig>) -> Self {
        let configs = configs
            .into_iter()
            .map(|config| (config.service.clone(), config))
            .collect();
        Self {
            environment,
            configs: RwLock::new(configs),
        }
    }

    /// Environment this controller serves.
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Insert or replace the configuration for a service.
    pub async fn register_config(&self, config: RolloutConfig) {
        let mut configs = self.configs.write().await;
        configs.insert(config.service.clone(), config);
    }

    /// Whether the new implementation is active for `stable_id`.
    ///
    /// The identifier must be stable for the lifetime of the entity (user
    /// id, session id, or the anonymous sentinel) so that repeated calls
    /// never flap between implementations.
    pub async fn should_use_new_implementation(&self, service: &ServiceId, stable_id: &str) -> bool {
        self.decision_at(service, stable_id, Utc::now()).await
    }

    /// Decision point for application code: resolves the stable identifier
    /// as user id, falling back to session id, falling back to the
    /// anonymous sentinel.
    pub async fn should_use_migrated_service(
        &self,
        service: &ServiceId,
        user_id: Option<&str>,
        session_id: Option<&str>,
    ) -> bool {
        let stable_id = user_id.or(session_id).unwrap_or(ANONYMOUS_ID);
        self.should_use_new_implementation(service, stable_id).await
    }

    /// [`Self::should_use_new_implementation`] with an explicit timestamp.
    pub async fn decision_at(&self, service: &ServiceId, stable_id: &str, now: DateTime<Utc>) -> bool {
        let configs = self.configs.read().await;
        let Some(config) = configs.get(service) else {
            return false;
        };
        if !config.enabled {
            return false;
        }
        if now < config.start_date {
            return false;
        }
        if let Some(end_date) = config.end_date {
            if now > end_date {
                // Window closed: full rollout assumed complete.
                return true;
            }
        }
        let bucket = bucket_for(stable_id, service);
        let decision = bucket < config.percentage;
        debug!(
            service = %service,
            bucket,
            percentage = config.percentage,
            decision,
            "rollout decision"
        );
        decision
    }

    /// Set a service's rollout percentage (clamped to 0-100).
    pub async fn update_rollout_percentage(&self, service: &ServiceId, percentage: u8) -> Result<()> {
        let mut configs = self.configs.write().await;
        let config = configs
            .get_mut(service)
            .ok_or_else(|| SwitchbackError::UnknownRolloutService { service: service.clone() })?;
        config.percentage = percentage.min(100);
        info!(service = %service, percentage = config.percentage, "rollout percentage updated");
        Ok(())
    }

    /// Enable or disable a service's rollout.
    pub async fn set_enabled(&self, service: &ServiceId, enabled: bool) -> Result<()> {
        let mut configs = self.configs.write().await;
        let config = configs
            .get_mut(service)
            .ok_or_else(|| SwitchbackError::UnknownRolloutService { service: service.clone() })?;
        config.enabled = enabled;
        Ok(())
    }

    /// Force a service back to the legacy implementation: percentage 0 and
    /// disabled, in one assignment under the write lock.
    pub async fn force_rollback(&self, service: &ServiceId) -> Result<()> {
        let mut configs = self.configs.write().await;
        let config = configs
            .get_mut(service)
            .ok_or_else(|| SwitchbackError::UnknownRolloutService { service: service.clone() })?;
        config.percentage = 0;
        config.enabled = false;
        info!(service = %service, "rollout forced back to legacy implementation");
        Ok(())
    }

    /// Explicit external transition out of the rolled-back state.
    pub async fn re_enable(&self, service: &ServiceId, percentage: u8) -> Result<()> {
        let mut configs = self.configs.write().await;
        let config = configs
            .get_mut(service)
            .ok_or_else(|| SwitchbackError::UnknownRolloutService { service: service.clone() })?;
        config.enabled = true;
        config.percentage = percentage.min(100);
        info!(service = %service, percentage = config.percentage, "rollout re-enabled");
        Ok(())
    }

    /// Configuration for a single service, if present.
    pub async fn config(&self, service: &ServiceId) -> Option<RolloutConfig> {
        let configs = self.configs.read().await;
        configs.get(service).cloned()
    }

    /// Full per-service configuration snapshot plus global settings.
    pub async fn rollout_status(&self) -> RolloutStatus {
        let configs = self.configs.read().await;
        RolloutStatus {
            environment: self.environment,
            services: configs.clone(),
        }
    }
}

/// Percentile bucket (0-99) for a stable identifier and service.
///
/// 32-bit order-sensitive rolling hash (`hash * 31 + byte` in wrapping
/// arithmetic) over `"{stable_id}:{service}"`, absolute value modulo 100.
/// Uniform enough for bucketing; no cryptographic property is required or
/// provided.
pub fn bucket_for(stable_id: &str, service: &ServiceId) -> u8 {
    let mut hash: i32 = 0;
    for byte in stable_id.bytes().chain([b':']).chain(service.as_str().bytes()) {
        hash = hash.wrapping_mul(31).wrapping_add(i32::from(byte));
    }
    (hash.unsigned_abs() % 100) as u8
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn service() -> ServiceId {
        ServiceId::new("transcription")
    }

    async fn controller_at(percentage: u8) -> RolloutController {
        RolloutController::with_configs(
            Environment::Staging,
            [RolloutConfig::new(service()).enabled_at(percentage)],
        )
    }

    #[test]
    fn test_bucket_is_deterministic_and_in_range() {
        let id = service();
        let first = bucket_for("user-42", &id);
        for _ in 0..100 {
            assert_eq!(bucket_for("user-42", &id), first);
        }
        assert!(first < 100);
    }

    #[test]
    fn test_bucket_is_order_sensitive() {
        let id = service();
        // Not a strict requirement for any pair, but these differ under the
        // rolling hash and pin the multiply-and-add behavior.
        assert_ne!(bucket_for("ab", &id), bucket_for("ba", &id));
    }

    #[tokio::test]
    async fn test_unknown_service_decides_false() {
        let controller = RolloutController::new(Environment::Staging);
        assert!(!controller.should_use_new_implementation(&service(), "user-1").await);
    }

    #[tokio::test]
    async fn test_disabled_service_decides_false_regardless_of_percentage() {
        let config = RolloutConfig {
            enabled: false,
            percentage: 100,
            ..RolloutConfig::new(service())
        };
        let controller = RolloutController::with_configs(Environment::Staging, [config]);
        assert!(!controller.should_use_new_implementation(&service(), "user-1").await);
    }

    #[tokio::test]
    async fn test_percentage_boundaries() {
        let none = controller_at(0).await;
        let all = controller_at(100).await;
        for n in 0..50 {
            let id = format!("user-{n}");
            assert!(!none.should_use_new_implementation(&service(), &id).await);
            assert!(all.should_use_new_implementation(&service(), &id).await);
        }
    }

    #[tokio::test]
    async fn test_percentage_sweep_is_monotonic_with_single_threshold() {
        let controller = controller_at(0).await;
        let bucket = bucket_for("user-7", &service());
        let mut previous = false;
        let mut flips = 0;
        for percentage in 0..=100u8 {
            controller.update_rollout_percentage(&service(), percentage).await.unwrap();
            let decision = controller.should_use_new_implementation(&service(), "user-7").await;
            if decision != previous {
                flips += 1;
                assert_eq!(percentage, bucket + 1, "step must occur right past the bucket");
            }
            previous = decision;
        }
        assert_eq!(flips, 1);
        assert!(previous, "must be in at 100%");
    }

    #[tokio::test]
    async fn test_date_window_gates_decision() {
        let now = Utc::now();
        let config = RolloutConfig::new(service())
            .enabled_at(0)
            .starting(now - Duration::days(2))
            .ending(now - Duration::days(1));
        let controller = RolloutController::with_configs(Environment::Staging, [config]);
        // Past the end date: full rollout assumed even at 0%.
        assert!(controller.should_use_new_implementation(&service(), "user-1").await);

        let config = RolloutConfig::new(service())
            .enabled_at(100)
            .starting(now + Duration::days(1));
        let controller = RolloutController::with_configs(Environment::Staging, [config]);
        // Before the start date: legacy even at 100%.
        assert!(!controller.should_use_new_implementation(&service(), "user-1").await);
    }

    #[tokio::test]
    async fn test_stable_identifier_fallback_chain() {
        let controller = controller_at(50).await;
        let with_user = controller
            .should_use_migrated_service(&service(), Some("user-9"), Some("session-1"))
            .await;
        assert_eq!(
            with_user,
            controller.should_use_new_implementation(&service(), "user-9").await
        );
        let with_session = controller
            .should_use_migrated_service(&service(), None, Some("session-1"))
            .await;
        assert_eq!(
            with_session,
            controller.should_use_new_implementation(&service(), "session-1").await
        );
        let anonymous = controller.should_use_migrated_service(&service(), None, None).await;
        assert_eq!(
            anonymous,
            controller.should_use_new_implementation(&service(), ANONYMOUS_ID).await
        );
    }

    #[tokio::test]
    async fn test_update_clamps_percentage() {
        let controller = controller_at(10).await;
        controller.update_rollout_percentage(&service(), 250).await.unwrap();
        assert_eq!(controller.config(&service()).await.unwrap().percentage, 100);
    }

    #[tokio::test]
    async fn test_force_rollback_zeroes_and_disables() {
        let controller = controller_at(75).await;
        controller.force_rollback(&service()).await.unwrap();
        let config = controller.config(&service()).await.unwrap();
        assert_eq!(config.percentage, 0);
        assert!(!config.enabled);

        controller.re_enable(&service(), 5).await.unwrap();
        let config = controller.config(&service()).await.unwrap();
        assert!(config.enabled);
        assert_eq!(config.percentage, 5);
    }
}
