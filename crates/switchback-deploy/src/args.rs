//! CLI argument parsing for switchback-deploy.

use std::path::PathBuf;

use clap::Parser;
use switchback::Environment;

/// Start a phased rollout deployment and monitor it until interrupted.
#[derive(Parser, Debug)]
#[command(name = "switchback-deploy")]
pub struct Args {
    /// Target environment.
    #[arg(default_value = "staging")]
    pub environment: Environment,

    /// Path to a TOML deployment configuration file. When omitted, the
    /// built-in default plan is used for the services named by --service.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Service to deploy with the built-in default plan. Repeatable.
    /// Ignored when --config is given.
    #[arg(long = "service")]
    pub services: Vec<String>,

    /// Tracing filter directive (overrides RUST_LOG).
    #[arg(long)]
    pub log_filter: Option<String>,
}
