//! Deployment entry point for the switchback rollout control plane.
//!
//! Composes the rollout controller, health monitor, rollback manager, and
//! deployment orchestrator explicitly (no global singletons), starts the
//! phased rollout for the requested environment, and runs until a
//! termination signal stops monitoring and exits cleanly. Initialization
//! failures exit with a non-zero status.

mod args;

use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use switchback::DeploymentConfig;
use switchback::DeploymentOrchestrator;
use switchback::ErrorReporter;
use switchback::HealthMonitor;
use switchback::OrchestratorConfig;
use switchback::RollbackManager;
use switchback::RolloutController;
use switchback::ServiceId;
use switchback::TracingReporter;
use tokio::signal;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_filter.as_deref());

    let config = load_config(&args).context("deployment initialization failed")?;
    info!(environment = %config.environment, services = config.schedules.len(), "deployment configured");

    let controller = Arc::new(RolloutController::with_configs(
        config.environment,
        config.rollouts.clone(),
    ));
    let monitor = Arc::new(HealthMonitor::new(config.environment));
    let reporter: Arc<dyn ErrorReporter> = Arc::new(TracingReporter);
    let rollback = Arc::new(RollbackManager::new(
        Arc::clone(&controller),
        Arc::clone(&reporter),
        config.rollback.clone(),
    ));
    let orchestrator = DeploymentOrchestrator::new(
        controller,
        monitor,
        rollback,
        reporter,
        OrchestratorConfig {
            environment: config.environment,
            thresholds: config.thresholds,
            ..OrchestratorConfig::default()
        },
        config.schedules.clone(),
    );

    orchestrator.start();
    info!(environment = %config.environment, "deployment orchestration running; press Ctrl-C to stop");

    shutdown_signal().await;

    orchestrator.stop().await;
    info!("deployment monitoring stopped");
    Ok(())
}

fn init_tracing(log_filter: Option<&str>) {
    let filter = match log_filter {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

fn load_config(args: &Args) -> Result<DeploymentConfig> {
    if let Some(path) = &args.config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config = DeploymentConfig::from_toml_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.environment = args.environment;
        return Ok(config);
    }
    if args.services.is_empty() {
        bail!("no services to deploy: pass --config <file> or at least one --service <name>");
    }
    let services: Vec<ServiceId> = args.services.iter().map(ServiceId::new).collect();
    Ok(DeploymentConfig::builtin(args.environment, &services))
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(err) => error!("failed to install Ctrl+C handler: {err}"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!("failed to install SIGTERM handler: {err}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT, stopping deployment monitoring");
        }
        _ = terminate => {
            info!("received SIGTERM, stopping deployment monitoring");
        }
    }
}
