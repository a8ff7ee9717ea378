//! Persistence layer for projects, protocol runs, step runs and events.
//!
//! Two schema-equivalent backends implement [`Store`]: an embedded
//! single-writer SQLite file database ([`sqlite::SqliteStore`]) and a
//! client-server libsql/sqld database ([`remote::RemoteStore`]). Both share
//! one logical schema with JSON-encoded `policy`, `runtime_state`,
//! `template_config`, `secrets` and `default_models` columns.
//!
//! Status updates accept an optional expected status for optimistic
//! concurrency: when the stored status does not match, the update fails with
//! [`OrchestratorError::Conflict`] and zero rows change.

pub mod remote;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{
    Event, Project, ProtocolRun, ProtocolStatus, RuntimeState, StepRun, StepStatus,
};
use crate::errors::{OrchestratorError, Result};
use crate::policy::PolicyRecord;

pub use remote::RemoteStore;
pub use sqlite::SqliteStore;

/// Events older than the newest `MAX_RECENT_EVENTS` are never returned by the
/// dashboard query regardless of the requested limit.
pub const MAX_RECENT_EVENTS: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct NewProject {
    pub name: String,
    pub git_url: String,
    pub base_branch: String,
    pub local_path: Option<String>,
    pub ci_provider: Option<String>,
    pub secrets: Option<Value>,
    pub default_models: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewProtocolRun {
    pub project_id: i64,
    pub protocol_name: String,
    pub status: ProtocolStatus,
    pub base_branch: String,
    pub worktree_path: Option<String>,
    pub protocol_root: Option<String>,
    pub description: Option<String>,
    pub template_config: Option<Value>,
    pub template_source: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewStepRun {
    pub protocol_run_id: i64,
    pub step_index: i64,
    pub step_name: String,
    pub step_type: String,
    pub status: StepStatus,
    pub model: Option<String>,
    pub engine_id: Option<String>,
    pub retries: i64,
    pub summary: Option<String>,
    pub policy: Vec<PolicyRecord>,
}

/// Partial update for a step run. `None` fields keep their stored value
/// (COALESCE semantics); `runtime_state` replaces the whole column, so
/// callers merge into a copy of the current state first.
#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub retries: Option<i64>,
    pub summary: Option<String>,
    pub model: Option<String>,
    pub engine_id: Option<String>,
    pub runtime_state: Option<RuntimeState>,
}

impl StepPatch {
    pub fn summary(text: impl Into<String>) -> Self {
        Self {
            summary: Some(text.into()),
            ..Self::default()
        }
    }
}

/// Optional context attached to an appended event. `request_id` and `job_id`
/// are folded into the metadata object when not already present.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub step_run_id: Option<i64>,
    pub metadata: Option<Value>,
    pub request_id: Option<String>,
    pub job_id: Option<String>,
}

impl EventContext {
    pub fn for_step(step_run_id: i64) -> Self {
        Self {
            step_run_id: Some(step_run_id),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_project(&self, new: NewProject) -> Result<Project>;
    async fn get_project(&self, id: i64) -> Result<Project>;
    async fn list_projects(&self) -> Result<Vec<Project>>;
    async fn update_project_local_path(&self, id: i64, local_path: String) -> Result<Project>;

    async fn create_protocol_run(&self, new: NewProtocolRun) -> Result<ProtocolRun>;
    async fn get_protocol_run(&self, id: i64) -> Result<ProtocolRun>;
    async fn find_protocol_run_by_name(&self, name: String) -> Result<Option<ProtocolRun>>;
    async fn list_protocol_runs(&self, project_id: i64) -> Result<Vec<ProtocolRun>>;
    async fn list_all_protocol_runs(&self) -> Result<Vec<ProtocolRun>>;
    /// CAS status transition when `expected` is given; plain update otherwise.
    async fn update_protocol_status(
        &self,
        id: i64,
        status: ProtocolStatus,
        expected: Option<ProtocolStatus>,
    ) -> Result<ProtocolRun>;
    async fn update_protocol_paths(
        &self,
        id: i64,
        worktree_path: Option<String>,
        protocol_root: Option<String>,
    ) -> Result<ProtocolRun>;
    async fn update_protocol_template(
        &self,
        id: i64,
        template_config: Option<Value>,
        template_source: Option<Value>,
    ) -> Result<ProtocolRun>;

    async fn create_step_run(&self, new: NewStepRun) -> Result<StepRun>;
    async fn get_step_run(&self, id: i64) -> Result<StepRun>;
    /// Steps ordered by ascending `step_index`.
    async fn list_step_runs(&self, protocol_run_id: i64) -> Result<Vec<StepRun>>;
    async fn latest_step_run(&self, protocol_run_id: i64) -> Result<Option<StepRun>>;
    /// CAS status transition when `expected` is given; fields omitted from
    /// the patch retain their previous value.
    async fn update_step_status(
        &self,
        id: i64,
        status: StepStatus,
        patch: StepPatch,
        expected: Option<StepStatus>,
    ) -> Result<StepRun>;

    async fn append_event(
        &self,
        protocol_run_id: i64,
        event_type: String,
        message: String,
        ctx: EventContext,
    ) -> Result<Event>;
    /// Events for one protocol, newest first.
    async fn list_events(&self, protocol_run_id: i64) -> Result<Vec<Event>>;
    /// Recent events across protocols joined with protocol/project context
    /// for global dashboards, newest first. The limit is clamped to
    /// `1..=MAX_RECENT_EVENTS`.
    async fn list_recent_events(
        &self,
        limit: usize,
        project_id: Option<i64>,
    ) -> Result<Vec<Event>>;
}

// ── Shared column codecs ──────────────────────────────────────────────

/// One logical schema for both backends. SQLite and sqld speak the same
/// dialect, so the DDL is shared verbatim.
pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    git_url TEXT NOT NULL,
    base_branch TEXT NOT NULL,
    local_path TEXT,
    ci_provider TEXT,
    secrets TEXT,
    default_models TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS protocol_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    protocol_name TEXT NOT NULL,
    status TEXT NOT NULL,
    base_branch TEXT NOT NULL,
    worktree_path TEXT,
    protocol_root TEXT,
    description TEXT,
    template_config TEXT,
    template_source TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS step_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    protocol_run_id INTEGER NOT NULL REFERENCES protocol_runs(id),
    step_index INTEGER NOT NULL,
    step_name TEXT NOT NULL,
    step_type TEXT NOT NULL,
    status TEXT NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0,
    model TEXT,
    engine_id TEXT,
    policy TEXT,
    runtime_state TEXT,
    summary TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    protocol_run_id INTEGER NOT NULL REFERENCES protocol_runs(id),
    step_run_id INTEGER REFERENCES step_runs(id),
    event_type TEXT NOT NULL,
    message TEXT NOT NULL,
    metadata TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_protocol_runs_project ON protocol_runs(project_id);
CREATE INDEX IF NOT EXISTS idx_step_runs_protocol ON step_runs(protocol_run_id, step_index);
CREATE INDEX IF NOT EXISTS idx_events_protocol ON events(protocol_run_id);
";

pub(crate) fn encode_json(value: &Option<Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

pub(crate) fn decode_json(
    entity: &'static str,
    id: i64,
    column: &'static str,
    text: Option<String>,
) -> Result<Option<Value>> {
    match text {
        Some(t) if !t.is_empty() => serde_json::from_str(&t)
            .map(Some)
            .map_err(|source| OrchestratorError::CorruptColumn {
                entity,
                id,
                column,
                source,
            }),
        _ => Ok(None),
    }
}

pub(crate) fn encode_policy(policy: &[PolicyRecord]) -> Option<String> {
    if policy.is_empty() {
        None
    } else {
        serde_json::to_string(policy).ok()
    }
}

/// Decode the stored policy column. Historical rows may hold a single object
/// instead of a list; both shapes normalize to a vector.
pub(crate) fn decode_policy(id: i64, text: Option<String>) -> Result<Vec<PolicyRecord>> {
    let Some(t) = text.filter(|t| !t.is_empty()) else {
        return Ok(Vec::new());
    };
    let value: Value =
        serde_json::from_str(&t).map_err(|source| OrchestratorError::CorruptColumn {
            entity: "StepRun",
            id,
            column: "policy",
            source,
        })?;
    Ok(match value {
        Value::Array(items) => items.into_iter().map(PolicyRecord::from_value).collect(),
        Value::Object(_) => vec![PolicyRecord::from_value(value)],
        _ => Vec::new(),
    })
}

pub(crate) fn encode_runtime_state(state: &RuntimeState) -> Option<String> {
    if state.is_empty() {
        None
    } else {
        serde_json::to_string(state).ok()
    }
}

pub(crate) fn decode_runtime_state(id: i64, text: Option<String>) -> Result<RuntimeState> {
    match text {
        Some(t) if !t.is_empty() => {
            serde_json::from_str(&t).map_err(|source| OrchestratorError::CorruptColumn {
                entity: "StepRun",
                id,
                column: "runtime_state",
                source,
            })
        }
        _ => Ok(RuntimeState::default()),
    }
}

pub(crate) fn parse_protocol_status(id: i64, s: &str) -> Result<ProtocolStatus> {
    s.parse()
        .map_err(|e: String| OrchestratorError::Validation(format!("ProtocolRun {}: {}", id, e)))
}

pub(crate) fn parse_step_status(id: i64, s: &str) -> Result<StepStatus> {
    s.parse()
        .map_err(|e: String| OrchestratorError::Validation(format!("StepRun {}: {}", id, e)))
}

/// Fold `request_id`/`job_id` into the metadata object unless already set.
pub(crate) fn event_metadata(ctx: &EventContext) -> Option<String> {
    let mut map = match &ctx.metadata {
        Some(Value::Object(m)) => m.clone(),
        Some(other) => {
            let mut m = serde_json::Map::new();
            m.insert("value".into(), other.clone());
            m
        }
        None => serde_json::Map::new(),
    };
    if let Some(request_id) = &ctx.request_id {
        map.entry("request_id".to_string())
            .or_insert_with(|| Value::String(request_id.clone()));
    }
    if let Some(job_id) = &ctx.job_id {
        map.entry("job_id".to_string())
            .or_insert_with(|| Value::String(job_id.clone()));
    }
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map).to_string())
    }
}

pub(crate) fn clamp_recent_limit(limit: usize) -> i64 {
    limit.clamp(1, MAX_RECENT_EVENTS) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_policy_accepts_single_object_and_list() {
        let single = r#"{"behavior":"loop","module_id":"qa-loop","step_back":1}"#;
        let parsed = decode_policy(1, Some(single.to_string())).unwrap();
        assert_eq!(parsed.len(), 1);

        let list = r#"[{"behavior":"loop","module_id":"a"},{"behavior":"trigger","module_id":"b","trigger_agent_id":"qa"}]"#;
        let parsed = decode_policy(1, Some(list.to_string())).unwrap();
        assert_eq!(parsed.len(), 2);

        assert!(decode_policy(1, None).unwrap().is_empty());
    }

    #[test]
    fn decode_policy_rejects_corrupt_json() {
        let err = decode_policy(9, Some("{not json".to_string())).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::CorruptColumn { id: 9, column: "policy", .. }
        ));
    }

    #[test]
    fn event_metadata_folds_job_and_request_ids() {
        let ctx = EventContext {
            step_run_id: None,
            metadata: Some(serde_json::json!({"source": "qa_passed"})),
            request_id: Some("req-1".into()),
            job_id: Some("job-1".into()),
        };
        let encoded = event_metadata(&ctx).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["source"], "qa_passed");
        assert_eq!(value["request_id"], "req-1");
        assert_eq!(value["job_id"], "job-1");
    }

    #[test]
    fn event_metadata_does_not_clobber_existing_keys() {
        let ctx = EventContext {
            metadata: Some(serde_json::json!({"job_id": "original"})),
            job_id: Some("late".into()),
            ..EventContext::default()
        };
        let encoded = event_metadata(&ctx).unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["job_id"], "original");
    }

    #[test]
    fn recent_limit_is_clamped() {
        assert_eq!(clamp_recent_limit(0), 1);
        assert_eq!(clamp_recent_limit(50), 50);
        assert_eq!(clamp_recent_limit(10_000), MAX_RECENT_EVENTS as i64);
    }
}
