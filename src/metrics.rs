//! Minimal metrics seam.
//!
//! The orchestrator and budget tracker report counters through this trait so
//! deployments can bridge to whatever backend they run. The default sinks
//! either drop observations or mirror them into the tracing stream.

use std::sync::Arc;

use tracing::info;

/// Counter sink for token usage and QA outcomes.
pub trait MetricsSink: Send + Sync {
    /// Record tokens consumed by one model call.
    fn observe_tokens(&self, phase: &str, model: &str, tokens: u64);

    /// Count a QA verdict (`"PASS"` or `"FAIL"`).
    fn inc_qa_verdict(&self, verdict: &str);
}

/// Discards every observation. Used by tests and library embedders that do
/// not care about metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn observe_tokens(&self, _phase: &str, _model: &str, _tokens: u64) {}

    fn inc_qa_verdict(&self, _verdict: &str) {}
}

/// Emits each observation as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn observe_tokens(&self, phase: &str, model: &str, tokens: u64) {
        info!(target: "conductor::metrics", phase, model, tokens, "tokens_used");
    }

    fn inc_qa_verdict(&self, verdict: &str) {
        info!(target: "conductor::metrics", verdict, "qa_verdict");
    }
}

/// Shared handle; sinks are cheap to clone behind an `Arc`.
pub type SharedMetrics = Arc<dyn MetricsSink>;

pub fn noop() -> SharedMetrics {
    Arc::new(NoopMetrics)
}

/// Sink that forwards every observation to the subscriber installed by
/// [`crate::telemetry::init`].
pub fn tracing() -> SharedMetrics {
    Arc::new(TracingMetrics)
}
