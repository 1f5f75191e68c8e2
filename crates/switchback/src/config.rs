//! Deployment configuration.
//!
//! Rollout configurations and schedules are static, version-controlled data:
//! they are loaded from a TOML file checked into the repository, or built
//! from the default phased plan when no file is given. Runtime state (event
//! log, rollback history) is never persisted here.

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;

use crate::error::ConfigParseSnafu;
use crate::error::Result;
use crate::orchestrator::HealthThresholds;
use crate::orchestrator::RolloutPhase;
use crate::orchestrator::RolloutSchedule;
use crate::rollback::RollbackConfig;
use crate::rollout::RolloutConfig;
use crate::types::Environment;
use crate::types::ServiceId;

/// Default phased plan: day offset, target percentage, description,
/// monitoring hours.
const DEFAULT_PLAN: &[(u32, u8, &str, u32)] = &[
    (0, 5, "canary", 4),
    (1, 25, "early adopters", 4),
    (3, 50, "half fleet", 4),
    (5, 75, "majority", 4),
    (7, 100, "full rollout", 2),
];

/// Full deployment configuration for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Environment the deployment targets.
    #[serde(default)]
    pub environment: Environment,
    /// Health-gate thresholds for the orchestrator.
    #[serde(default)]
    pub thresholds: HealthThresholds,
    /// Rollback guard settings.
    #[serde(default)]
    pub rollback: RollbackConfig,
    /// Per-service rollout configurations.
    #[serde(default)]
    pub rollouts: Vec<RolloutConfig>,
    /// Per-service rollout schedules.
    #[serde(default)]
    pub schedules: Vec<RolloutSchedule>,
}

impl DeploymentConfig {
    /// Parse a TOML configuration document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context(ConfigParseSnafu)
    }

    /// Built-in default plan for the given services: enabled 0%
    /// configurations plus the standard 5/25/50/75/100 schedule over days
    /// 0/1/3/5/7.
    pub fn builtin(environment: Environment, services: &[ServiceId]) -> Self {
        let rollouts = services
            .iter()
            .map(|service| RolloutConfig::new(service.clone()).enabled_at(0))
            .collect();
        let schedules = services
            .iter()
            .map(|service| RolloutSchedule {
                service: service.clone(),
                phases: DEFAULT_PLAN
                    .iter()
                    .map(|&(day, percentage, description, monitoring_hours)| RolloutPhase {
                        day,
                        percentage,
                        description: description.to_string(),
                        monitoring_hours,
                    })
                    .collect(),
            })
            .collect();
        Self {
            environment,
            thresholds: HealthThresholds::default(),
            rollback: RollbackConfig::default(),
            rollouts,
            schedules,
        }
    }
}
