//! Phased deployment orchestration.
//!
//! Advances each service through a multi-day rollout plan: one cancellable
//! timer per phase, a health gate before every percentage change, and a
//! bounded monitoring window after it, polling aggregated health until the
//! window elapses or a breach triggers an automatic rollback.
//!
//! All timers and polls run under one `TaskTracker` with a shared
//! `CancellationToken`, so `stop` cancels the whole orchestration as a unit
//! and stopping twice is a no-op. The day length and poll interval are
//! configuration knobs so tests drive the schedule on a compressed clock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::health::HealthMonitor;
use crate::redact::redact_metadata;
use crate::reporting::ErrorReporter;
use crate::rollback::RollbackManager;
use crate::rollout::RolloutController;
use crate::types::Environment;
use crate::types::ServiceId;

/// Sentinel error rate used when a phase fails to execute at all: the phase
/// is treated as fully broken.
pub const PHASE_FAILURE_ERROR_RATE: f64 = 100.0;

/// One scheduled step of a rollout plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutPhase {
    /// Day offset from deployment start.
    pub day: u32,
    /// Target rollout percentage for the phase.
    pub percentage: u8,
    /// Human-readable phase description.
    pub description: String,
    /// Hours of post-transition health monitoring.
    pub monitoring_hours: u32,
}

/// Ordered rollout plan for one service.
///
/// Day offsets and percentages are expected, not enforced, to be
/// non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutSchedule {
    /// Service the plan applies to.
    pub service: ServiceId,
    /// Scheduled phases, in order.
    pub phases: Vec<RolloutPhase>,
}

/// Health-gate thresholds for phase execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Maximum tolerated error rate, percent. A per-service
    /// `rollback_threshold` in the rollout configuration overrides this.
    pub max_error_rate: f64,
    /// Maximum tolerated average load duration, milliseconds.
    pub max_avg_duration_ms: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 5.0,
            max_avg_duration_ms: 5_000.0,
        }
    }
}

/// Orchestrator timing and threshold configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Environment tag attached to phase events.
    pub environment: Environment,
    /// Wall-clock length of one schedule day (24h in production; tests
    /// compress it).
    pub day_duration: Duration,
    /// Wall-clock length of one monitoring hour.
    pub hour_duration: Duration,
    /// Interval between health polls inside a monitoring window.
    pub poll_interval: Duration,
    /// Default health-gate thresholds.
    pub thresholds: HealthThresholds,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Staging,
            day_duration: Duration::from_secs(24 * 60 * 60),
            hour_duration: Duration::from_secs(60 * 60),
            poll_interval: Duration::from_secs(5 * 60),
            thresholds: HealthThresholds::default(),
        }
    }
}

/// Informal per-service deployment state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// No phase has fired yet.
    NotStarted,
    /// A phase transition is being applied.
    PhaseActive {
        /// Index of the active phase.
        phase: usize,
    },
    /// Post-transition monitoring window is armed.
    Monitoring {
        /// Index of the monitored phase.
        phase: usize,
    },
    /// The final phase completed its monitoring window.
    FullyRolledOut,
    /// The rollback manager forced the service back to legacy. Only an
    /// explicit external re-enable leaves this state.
    RolledBack,
}

/// Drives per-service rollout schedules against the controller, health
/// monitor, and rollback manager.
pub struct DeploymentOrchestrator {
    controller: Arc<RolloutController>,
    monitor: Arc<HealthMonitor>,
    rollback: Arc<RollbackManager>,
    reporter: Arc<dyn ErrorReporter>,
    config: OrchestratorConfig,
    schedules: Vec<RolloutSchedule>,
    states: tokio::sync::RwLock<BTreeMap<ServiceId, DeploymentState>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl DeploymentOrchestrator {
    /// Create an orchestrator over the given collaborators and schedules.
    pub fn new(
        controller: Arc<RolloutController>,
        monitor: Arc<HealthMonitor>,
        rollback: Arc<RollbackManager>,
        reporter: Arc<dyn ErrorReporter>,
        config: OrchestratorConfig,
        schedules: Vec<RolloutSchedule>,
    ) -> Arc<Self> {
        let states = schedules
            .iter()
            .map(|schedule| (schedule.service.clone(), DeploymentState::NotStarted))
            .collect();
        Arc::new(Self {
            controller,
            monitor,
            rollback,
            reporter,
            config,
            schedules,
            states: tokio::sync::RwLock::new(states),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Arm one timer per scheduled phase, relative to now.
    pub fn start(self: &Arc<Self>) {
        info!(
            environment = %self.config.environment,
            services = self.schedules.len(),
            "deployment orchestration starting"
        );
        for schedule in &self.schedules {
            let last_phase = schedule.phases.len().saturating_sub(1);
            for (index, phase) in schedule.phases.iter().enumerate() {
                let orchestrator = Arc::clone(self);
                let service = schedule.service.clone();
                let phase = phase.clone();
                let delay = self.config.day_duration * phase.day;
                let is_last = index == last_phase;
                self.tracker.spawn(async move {
                    tokio::select! {
                        _ = orchestrator.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if let Err(err) = orchestrator.execute_phase(&service, index, &phase, is_last).await {
                        orchestrator.handle_phase_failure(&service, index, &err).await;
                    }
                });
            }
        }
    }

    /// Cancel all pending phase timers and monitoring polls as a unit.
    ///
    /// Idempotent: stopping an already-stopped orchestration is a no-op.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("deployment orchestration stopped");
    }

    /// Per-service deployment state snapshot.
    ///
    /// A service whose rollout was forced back to legacy reports
    /// [`DeploymentState::RolledBack`] even when the rollback was executed
    /// outside a monitoring window.
    pub async fn deployment_states(&self) -> BTreeMap<ServiceId, DeploymentState> {
        let mut states = self.states.read().await.clone();
        for (service, state) in states.iter_mut() {
            if matches!(
                state,
                DeploymentState::PhaseActive { .. }
                    | DeploymentState::Monitoring { .. }
                    | DeploymentState::FullyRolledOut
            ) {
                if let Some(config) = self.controller.config(service).await {
                    if !config.enabled && config.percentage == 0 {
                        *state = DeploymentState::RolledBack;
                    }
                }
            }
        }
        states
    }

    async fn execute_phase(
        &self,
        service: &ServiceId,
        index: usize,
        phase: &RolloutPhase,
        is_last: bool,
    ) -> Result<()> {
        if let Some(observed) = self.unhealthy_reading(service).await {
            warn!(
                service = %service,
                phase = index,
                error_rate = observed.error_rate,
                avg_duration_ms = observed.avg_duration_ms,
                "phase skipped: service unhealthy at gate"
            );
            return Ok(());
        }

        self.set_state(service, DeploymentState::PhaseActive { phase: index }).await;
        self.controller.update_rollout_percentage(service, phase.percentage).await?;
        let metadata = BTreeMap::from([
            ("phase_day".to_string(), json!(phase.day)),
            ("target_percentage".to_string(), json!(phase.percentage)),
            ("description".to_string(), json!(phase.description)),
        ]);
        self.monitor
            .log_outcome(service, true, Duration::ZERO, true, None, metadata)
            .await;
        info!(
            service = %service,
            phase = index,
            percentage = phase.percentage,
            description = %phase.description,
            "phase transition applied"
        );

        let monitoring_enabled = self
            .controller
            .config(service)
            .await
            .map(|config| config.monitoring_enabled)
            .unwrap_or(true);
        if monitoring_enabled && phase.monitoring_hours > 0 {
            self.set_state(service, DeploymentState::Monitoring { phase: index }).await;
            if self.monitor_phase(service, phase).await {
                // Rollback fired; the schedule is short-circuited for this
                // service (later phase gates will see it disabled).
                self.set_state(service, DeploymentState::RolledBack).await;
                return Ok(());
            }
        }
        if is_last {
            self.set_state(service, DeploymentState::FullyRolledOut).await;
            info!(service = %service, "rollout fully deployed");
        }
        Ok(())
    }

    /// Poll health for the phase's monitoring window. Returns true when a
    /// breach triggered a rollback.
    async fn monitor_phase(&self, service: &ServiceId, phase: &RolloutPhase) -> bool {
        let deadline = Instant::now() + self.config.hour_duration * phase.monitoring_hours;
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; it doubles as the initial
        // post-transition health reading.
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return false,
                _ = poll.tick() => {}
            }
            if let Some(observed) = self.unhealthy_reading(service).await {
                warn!(
                    service = %service,
                    error_rate = observed.error_rate,
                    avg_duration_ms = observed.avg_duration_ms,
                    "health breach during phase monitoring"
                );
                match self
                    .rollback
                    .execute_automatic_rollback(
                        service,
                        observed.error_rate,
                        observed.avg_duration_ms,
                        "health threshold breached during phase monitoring",
                    )
                    .await
                {
                    Ok(_) => return true,
                    Err(err) => {
                        // Cooldown or exhaustion; already reported, keep
                        // polling until the window closes.
                        warn!(service = %service, error = %err, "automatic rollback rejected");
                    }
                }
            }
        }
    }

    async fn handle_phase_failure(&self, service: &ServiceId, index: usize, err: &crate::error::SwitchbackError) {
        error!(service = %service, phase = index, error = %err, "phase execution failed");
        let context = redact_metadata(BTreeMap::from([
            ("phase".to_string(), json!(index)),
            ("error".to_string(), json!(err.to_string())),
        ]));
        self.reporter
            .report_error(service, "phase execution failed", &context)
            .await;
        match self
            .rollback
            .execute_automatic_rollback(
                service,
                PHASE_FAILURE_ERROR_RATE,
                0.0,
                "phase execution failure treated as full breakage",
            )
            .await
        {
            Ok(_) => self.set_state(service, DeploymentState::RolledBack).await,
            Err(rollback_err) => {
                warn!(service = %service, error = %rollback_err, "rollback after phase failure rejected");
            }
        }
    }

    async fn set_state(&self, service: &ServiceId, state: DeploymentState) {
        let mut states = self.states.write().await;
        states.insert(service.clone(), state);
    }

    /// An unhealthy observation for the service, if thresholds are breached.
    ///
    /// No recorded events means healthy. The error-rate threshold comes from
    /// the service's rollout configuration (`rollback_threshold`) when
    /// present, the orchestrator default otherwise.
    async fn unhealthy_reading(&self, service: &ServiceId) -> Option<HealthObservation> {
        let metrics = self.monitor.get_metrics().await;
        let summary = metrics.services.get(service)?;
        if summary.total_events == 0 {
            return None;
        }
        let max_error_rate = match self.controller.config(service).await {
            Some(config) => config.rollback_threshold,
            None => self.config.thresholds.max_error_rate,
        };
        let observation = HealthObservation {
            error_rate: f64::from(summary.error_rate),
            avg_duration_ms: summary.avg_duration_ms,
        };
        if observation.error_rate > max_error_rate
            || observation.avg_duration_ms > self.config.thresholds.max_avg_duration_ms
        {
            Some(observation)
        } else {
            None
        }
    }
}

struct HealthObservation {
    error_rate: f64,
    avg_duration_ms: f64,
}
