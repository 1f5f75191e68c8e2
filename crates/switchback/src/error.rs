//! Error types for the rollout control plane.

use snafu::Snafu;

use crate::types::ServiceId;

/// Result type for control-plane operations.
pub type Result<T, E = SwitchbackError> = std::result::Result<T, E>;

/// Errors that can occur in the rollout control plane.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SwitchbackError {
    /// A service identifier was registered twice.
    #[snafu(display("service already registered: {service}"))]
    DuplicateService {
        /// Identifier that was already registered.
        service: ServiceId,
    },

    /// A service identifier was resolved without being registered.
    #[snafu(display("unknown service: {service}"))]
    UnknownService {
        /// Identifier that was not found.
        service: ServiceId,
    },

    /// Resolution re-entered an identifier that was still being constructed.
    #[snafu(display("circular dependency detected: {}", format_chain(chain)))]
    CircularDependency {
        /// Full chain of in-progress identifiers, ending at the re-entered one.
        chain: Vec<ServiceId>,
    },

    /// A service factory returned an error during construction.
    #[snafu(display("factory for '{service}' failed: {reason}"))]
    FactoryFailed {
        /// Service whose factory failed.
        service: ServiceId,
        /// Failure description.
        reason: String,
    },

    /// A resolved instance did not have the requested concrete type.
    #[snafu(display("instance for '{service}' is not a {expected}"))]
    WrongInstanceType {
        /// Service whose instance was downcast.
        service: ServiceId,
        /// Type that was requested.
        expected: &'static str,
    },

    /// No rollout configuration exists for the service.
    #[snafu(display("no rollout configuration for service: {service}"))]
    UnknownRolloutService {
        /// Service without a rollout configuration.
        service: ServiceId,
    },

    /// A rollback was requested while the per-service cooldown was active.
    #[snafu(display("rollback for '{service}' rejected: cooldown active for {remaining_secs}s"))]
    RollbackCooldown {
        /// Service whose rollback was rejected.
        service: ServiceId,
        /// Seconds until the cooldown expires.
        remaining_secs: u64,
    },

    /// The per-service rollback attempt limit was exhausted.
    #[snafu(display("rollback for '{service}' refused: {attempts} attempts exhausted, escalation required"))]
    RollbackAttemptsExhausted {
        /// Service whose rollback was refused.
        service: ServiceId,
        /// Attempts already executed.
        attempts: u32,
    },

    /// An environment string did not name a known environment.
    #[snafu(display("unknown environment: '{value}' (expected 'staging' or 'production')"))]
    InvalidEnvironment {
        /// Value that failed to parse.
        value: String,
    },

    /// A deployment configuration file failed to parse.
    #[snafu(display("invalid deployment configuration: {source}"))]
    ConfigParse {
        /// Underlying TOML error.
        source: toml::de::Error,
    },
}

fn format_chain(chain: &[ServiceId]) -> String {
    chain.iter().map(ServiceId::as_str).collect::<Vec<_>>().join(" -> ")
}
