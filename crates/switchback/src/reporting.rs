//! Error-reporting sink consumed by the rollback manager and orchestrator.
//!
//! The control plane passes already-redacted context only; callers are
//! responsible for running metadata through [`crate::redact::redact_metadata`]
//! before reporting.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::error;

use crate::types::ServiceId;

/// External collaborator accepting error reports for rollout failures.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    /// Report a rollout or rollback failure with redacted context.
    async fn report_error(&self, service: &ServiceId, error: &str, context: &BTreeMap<String, Value>);
}

/// Reporter that surfaces failures through the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

#[async_trait]
impl ErrorReporter for TracingReporter {
    async fn report_error(&self, service: &ServiceId, error: &str, context: &BTreeMap<String, Value>) {
        error!(service = %service, context = ?context, "{error}");
    }
}
