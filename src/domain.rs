//! Core entities for protocol orchestration: projects, protocol runs,
//! step runs and the append-only event log.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle states for a protocol run.
///
/// `pending → planning → planned → running → {completed|blocked|failed|cancelled}`
/// with `paused` as a suspend state reachable from `running`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolStatus {
    Pending,
    Planning,
    Planned,
    Running,
    Paused,
    Blocked,
    Failed,
    Cancelled,
    Completed,
}

impl ProtocolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    /// A terminal protocol never transitions again (blocked counts: it needs
    /// operator intervention before the orchestrator will touch it).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Failed | Self::Blocked
        )
    }
}

impl FromStr for ProtocolStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "planned" => Ok(Self::Planned),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "blocked" => Ok(Self::Blocked),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid protocol status: {}", s)),
        }
    }
}

impl std::fmt::Display for ProtocolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states for a single step within a protocol.
///
/// `pending → running → needs_qa → {completed|failed|blocked|cancelled}`,
/// or reset back to `pending` by a loop/trigger policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    NeedsQa,
    Completed,
    Failed,
    Cancelled,
    Blocked,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::NeedsQa => "needs_qa",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Blocked => "blocked",
        }
    }

    /// Terminal for completion accounting: only completed and cancelled steps
    /// count toward a finished protocol.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "needs_qa" => Ok(Self::NeedsQa),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// QA outcome reported by the quality collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QaVerdict {
    Pass,
    Fail,
}

impl QaVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub git_url: String,
    pub base_branch: String,
    pub local_path: Option<String>,
    pub ci_provider: Option<String>,
    pub secrets: Option<serde_json::Value>,
    pub default_models: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolRun {
    pub id: i64,
    pub project_id: i64,
    pub protocol_name: String,
    pub status: ProtocolStatus,
    pub base_branch: String,
    pub worktree_path: Option<String>,
    pub protocol_root: Option<String>,
    pub description: Option<String>,
    /// Holds the normalized protocol spec under `protocol_spec` and
    /// validation metadata under `spec_meta`.
    pub template_config: Option<serde_json::Value>,
    pub template_source: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

/// Well-known runtime state carried on a step, parsed at the store boundary.
///
/// Unknown keys survive in `extra` so additive merges never drop data a
/// previous writer stashed there.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeState {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub loop_counts: HashMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_by: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub inline_trigger_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_policy_module_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_target_step_index: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl RuntimeState {
    pub fn is_empty(&self) -> bool {
        self.loop_counts.is_empty()
            && self.last_triggered_by.is_none()
            && self.inline_trigger_depth == 0
            && self.last_action.is_none()
            && self.last_policy_module_id.is_none()
            && self.last_target_step_index.is_none()
            && self.extra.is_empty()
    }

    /// Current iteration count for a loop policy module.
    pub fn loop_count(&self, module_id: &str) -> u64 {
        self.loop_counts.get(module_id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: i64,
    pub protocol_run_id: i64,
    pub step_index: i64,
    pub step_name: String,
    pub step_type: String,
    pub status: StepStatus,
    pub retries: i64,
    pub model: Option<String>,
    pub engine_id: Option<String>,
    pub policy: Vec<crate::policy::PolicyRecord>,
    pub runtime_state: RuntimeState,
    pub summary: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl StepRun {
    /// The agent id a trigger policy matches against: step name minus a
    /// leading `NN-` ordering prefix and any file extension
    /// (`"01-qa.md"` → `"qa"`).
    pub fn agent_id(&self) -> &str {
        agent_id_from_step_name(&self.step_name)
    }
}

/// Strip the `NN-` ordering prefix and extension from a step name.
pub fn agent_id_from_step_name(step_name: &str) -> &str {
    let tail = match step_name.split_once('-') {
        Some((prefix, rest)) if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()) => {
            rest
        }
        _ => step_name,
    };
    match tail.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => tail,
    }
}

/// Append-only audit record. Never mutated or deleted; the joined
/// protocol/project fields are populated only by the recent-events query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub protocol_run_id: i64,
    pub step_run_id: Option<i64>,
    pub event_type: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_status_round_trips_through_str() {
        for s in [
            "pending",
            "planning",
            "planned",
            "running",
            "paused",
            "blocked",
            "failed",
            "cancelled",
            "completed",
        ] {
            let status: ProtocolStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        assert!("bogus".parse::<ProtocolStatus>().is_err());
    }

    #[test]
    fn terminal_protocol_statuses() {
        assert!(ProtocolStatus::Completed.is_terminal());
        assert!(ProtocolStatus::Blocked.is_terminal());
        assert!(!ProtocolStatus::Paused.is_terminal());
        assert!(!ProtocolStatus::Running.is_terminal());
    }

    #[test]
    fn step_status_round_trips_through_str() {
        for s in [
            "pending",
            "running",
            "needs_qa",
            "completed",
            "failed",
            "cancelled",
            "blocked",
        ] {
            let status: StepStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
    }

    #[test]
    fn step_terminal_excludes_failed_and_blocked() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Cancelled.is_terminal());
        assert!(!StepStatus::Failed.is_terminal());
        assert!(!StepStatus::Blocked.is_terminal());
    }

    #[test]
    fn agent_id_strips_numeric_prefix_and_extension() {
        assert_eq!(agent_id_from_step_name("00-main"), "main");
        assert_eq!(agent_id_from_step_name("01-qa.md"), "qa");
        assert_eq!(agent_id_from_step_name("qa"), "qa");
        assert_eq!(agent_id_from_step_name("10-code-review"), "code-review");
    }

    #[test]
    fn agent_id_keeps_non_numeric_prefix() {
        // Only an all-digit leading segment is an ordering prefix.
        assert_eq!(agent_id_from_step_name("pre-flight"), "pre-flight");
    }

    #[test]
    fn runtime_state_preserves_unknown_keys() {
        let json = serde_json::json!({
            "loop_counts": {"qa-loop": 2},
            "inline_trigger_depth": 1,
            "custom_marker": "kept"
        });
        let state: RuntimeState = serde_json::from_value(json).unwrap();
        assert_eq!(state.loop_count("qa-loop"), 2);
        assert_eq!(state.inline_trigger_depth, 1);
        assert_eq!(
            state.extra.get("custom_marker").and_then(|v| v.as_str()),
            Some("kept")
        );
        let back = serde_json::to_value(&state).unwrap();
        assert_eq!(back["custom_marker"], "kept");
    }

    #[test]
    fn empty_runtime_state_serializes_to_empty_object() {
        let state = RuntimeState::default();
        assert!(state.is_empty());
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }
}
