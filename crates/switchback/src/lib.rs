//! Service composition and progressive-rollout control plane.
//!
//! Switchback wires together alternate (legacy vs. new) implementations of
//! application services and controls, per user and per day, which one is
//! active:
//!
//! - **Registry**: composition root resolving service definitions on
//!   demand, with static and runtime dependency-cycle detection
//! - **Rollout Controller**: deterministic percentage bucketing over stable
//!   identifiers, gated by enablement and a date window
//! - **Health Monitor**: bounded, time-windowed log of load outcomes with
//!   write-time metadata redaction and aggregated rates
//! - **Rollback Manager**: forces a rollout back to legacy when thresholds
//!   are breached, guarded by a cooldown and an attempt limit
//! - **Deployment Orchestrator**: advances multi-day phased schedules with
//!   health gates and bounded monitoring windows
//!
//! Components are explicitly constructed and explicitly passed; there are no
//! global singletons. The top-level process entry point owns every lifecycle.
//!
//! # Example
//!
//! ```ignore
//! use switchback::{RolloutController, RolloutConfig, Environment, ServiceId};
//!
//! let controller = RolloutController::with_configs(
//!     Environment::Staging,
//!     [RolloutConfig::new("transcription").enabled_at(25)],
//! );
//! let service = ServiceId::new("transcription");
//! if controller.should_use_migrated_service(&service, Some("user-42"), None).await {
//!     // instantiate the new implementation
//! }
//! ```

#![warn(missing_docs)]

mod config;
mod error;
mod health;
mod orchestrator;
mod redact;
mod registry;
mod reporting;
mod rollback;
mod rollout;
mod types;

pub use config::DeploymentConfig;
pub use error::Result;
pub use error::SwitchbackError;
pub use health::EventSink;
pub use health::HealthMetrics;
pub use health::HealthMonitor;
pub use health::HealthSummary;
pub use health::MigrationEvent;
pub use health::MigrationEventType;
pub use health::MAX_EVENTS;
pub use health::RETENTION_HOURS;
pub use orchestrator::DeploymentOrchestrator;
pub use orchestrator::DeploymentState;
pub use orchestrator::HealthThresholds;
pub use orchestrator::OrchestratorConfig;
pub use orchestrator::RolloutPhase;
pub use orchestrator::RolloutSchedule;
pub use orchestrator::PHASE_FAILURE_ERROR_RATE;
pub use redact::redact_metadata;
pub use redact::REDACTED_MARKER;
pub use registry::DependencyReport;
pub use registry::FactoryFuture;
pub use registry::MissingDependency;
pub use registry::ServiceDefinition;
pub use registry::ServiceFactory;
pub use registry::ServiceInstance;
pub use registry::ServiceMetadata;
pub use registry::ServiceRegistry;
pub use reporting::ErrorReporter;
pub use reporting::TracingReporter;
pub use rollback::RollbackConfig;
pub use rollback::RollbackManager;
pub use rollback::RollbackRecord;
pub use rollback::RollbackTrigger;
pub use rollback::MAX_ROLLBACK_HISTORY;
pub use rollout::bucket_for;
pub use rollout::RolloutConfig;
pub use rollout::RolloutController;
pub use rollout::RolloutStatus;
pub use rollout::ANONYMOUS_ID;
pub use types::Environment;
pub use types::ServiceId;
