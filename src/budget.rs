//! Token budget tracking.
//!
//! Counters live in process memory keyed by protocol run and step run id.
//! Checks are advisory before a model call (projected usage against the
//! configured ceiling, using a rough 4-chars-per-token estimate) and exact
//! after it, when the engine reports real prompt/completion counts.
//!
//! Three modes: `strict` rejects a call whose projection would cross the
//! ceiling, `warn` logs and lets it through, `off` disables checks entirely.
//! A rejected check leaves the counters untouched so a later, smaller call
//! can still fit.

use std::str::FromStr;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{OrchestratorError, Result};
use crate::metrics::SharedMetrics;

/// Enforcement mode for budget checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetMode {
    #[default]
    Strict,
    Warn,
    Off,
}

impl BudgetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Warn => "warn",
            Self::Off => "off",
        }
    }
}

impl FromStr for BudgetMode {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "warn" => Ok(Self::Warn),
            "off" => Ok(Self::Off),
            other => Err(OrchestratorError::Validation(format!(
                "unknown budget mode: {other}"
            ))),
        }
    }
}

/// Rough token estimate for prompt text: one token per four characters,
/// never less than one.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4).max(1)
}

/// In-memory token accountant shared by the orchestrator and its handlers.
pub struct BudgetTracker {
    mode: BudgetMode,
    max_protocol_tokens: Option<u64>,
    max_step_tokens: Option<u64>,
    protocol_usage: DashMap<i64, u64>,
    step_usage: DashMap<i64, u64>,
    metrics: SharedMetrics,
}

impl BudgetTracker {
    pub fn new(
        mode: BudgetMode,
        max_protocol_tokens: Option<u64>,
        max_step_tokens: Option<u64>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            mode,
            max_protocol_tokens,
            max_step_tokens,
            protocol_usage: DashMap::new(),
            step_usage: DashMap::new(),
            metrics,
        }
    }

    pub fn mode(&self) -> BudgetMode {
        self.mode
    }

    /// Tokens recorded against a protocol run so far.
    pub fn protocol_usage(&self, protocol_run_id: i64) -> u64 {
        self.protocol_usage
            .get(&protocol_run_id)
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Tokens recorded against a step run so far.
    pub fn step_usage(&self, step_run_id: i64) -> u64 {
        self.step_usage.get(&step_run_id).map(|v| *v).unwrap_or(0)
    }

    /// Check an upcoming spend against the protocol ceiling and, when it
    /// fits (or mode is `warn`), commit the projection.
    pub fn check_protocol_budget(&self, protocol_run_id: i64, additional: u64) -> Result<()> {
        let Some(limit) = self.max_protocol_tokens else {
            return Ok(());
        };
        self.check_and_track(&self.protocol_usage, "protocol", protocol_run_id, additional, limit)
    }

    /// Check an upcoming spend against the step ceiling and, when it fits
    /// (or mode is `warn`), commit the projection.
    pub fn check_step_budget(&self, step_run_id: i64, additional: u64) -> Result<()> {
        let Some(limit) = self.max_step_tokens else {
            return Ok(());
        };
        self.check_and_track(&self.step_usage, "step", step_run_id, additional, limit)
    }

    /// Pre-flight check for one prompt: estimate its tokens, enforce the
    /// per-call ceiling under the current mode and report the estimate to
    /// the metrics sink. Returns the estimate so callers can project
    /// cumulative usage with [`Self::check_protocol_budget`].
    pub fn check_prompt(
        &self,
        prompt: &str,
        model: &str,
        phase: &str,
        max_tokens: Option<u64>,
    ) -> Result<u64> {
        let estimate = estimate_tokens(prompt);
        if let Some(limit) = max_tokens
            && estimate > limit
        {
            match self.mode {
                BudgetMode::Strict => {
                    return Err(OrchestratorError::BudgetExceeded {
                        scope: "call",
                        projected: estimate,
                        limit,
                    });
                }
                BudgetMode::Warn => {
                    warn!(phase, model, estimate, limit, "prompt over per-call token limit");
                }
                BudgetMode::Off => {}
            }
        }
        self.metrics.observe_tokens(phase, model, estimate);
        Ok(estimate)
    }

    fn check_and_track(
        &self,
        usage: &DashMap<i64, u64>,
        scope: &'static str,
        id: i64,
        additional: u64,
        limit: u64,
    ) -> Result<()> {
        if self.mode == BudgetMode::Off {
            return Ok(());
        }
        let mut entry = usage.entry(id).or_insert(0);
        let projected = entry.saturating_add(additional);
        if projected > limit {
            match self.mode {
                BudgetMode::Strict => {
                    // Counter unchanged: the caller may retry with a smaller
                    // prompt against the same remaining budget.
                    return Err(OrchestratorError::BudgetExceeded {
                        scope,
                        projected,
                        limit,
                    });
                }
                BudgetMode::Warn => {
                    warn!(scope, id, projected, limit, "token budget exceeded");
                }
                BudgetMode::Off => unreachable!(),
            }
        }
        *entry = projected;
        Ok(())
    }

    /// Record actual usage reported by an engine. Always accounted, in every
    /// mode, against both the step and its protocol run.
    pub fn record_usage(
        &self,
        protocol_run_id: i64,
        step_run_id: i64,
        phase: &str,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) {
        let total = prompt_tokens.saturating_add(completion_tokens);
        *self.protocol_usage.entry(protocol_run_id).or_insert(0) += total;
        *self.step_usage.entry(step_run_id).or_insert(0) += total;
        self.metrics.observe_tokens(phase, model, total);
    }
}
