//! Job dispatch: durable queue when configured, inline execution otherwise.
//!
//! Every work item the orchestrator hands off goes through [`Dispatcher`].
//! With a queue configured, jobs are enqueued for external workers. Without
//! one (dev/local), the handler runs synchronously in the caller's call
//! stack. Recursive triggering through the inline path is bounded by
//! `max_inline_trigger_depth`; at or beyond the limit the dispatcher refuses
//! and appends an explanatory event instead of executing.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::StepStatus;
use crate::errors::Result;
use crate::spec;
use crate::store::{EventContext, StepPatch, Store};

/// Default bound on inline trigger recursion.
pub const MAX_INLINE_TRIGGER_DEPTH: u32 = 3;

pub const PLAN_PROTOCOL_JOB: &str = "plan_protocol_job";
pub const EXECUTE_STEP_JOB: &str = "execute_step_job";
pub const RUN_QUALITY_JOB: &str = "run_quality_job";

/// A unit of work handed to the queue or the inline handler.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub job_type: &'static str,
    pub payload: Value,
}

impl Job {
    fn new(job_type: &'static str, payload: Value) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            job_type,
            payload,
        }
    }

    pub fn plan_protocol(protocol_run_id: i64) -> Self {
        Self::new(PLAN_PROTOCOL_JOB, json!({"protocol_run_id": protocol_run_id}))
    }

    pub fn execute_step(step_run_id: i64) -> Self {
        Self::new(EXECUTE_STEP_JOB, json!({"step_run_id": step_run_id}))
    }

    pub fn run_quality(step_run_id: i64) -> Self {
        Self::new(RUN_QUALITY_JOB, json!({"step_run_id": step_run_id}))
    }
}

/// Durable queue backend. Failures surface as
/// [`crate::errors::OrchestratorError::Queue`].
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<()>;
}

/// Execution/QA collaborator invoked by both dispatch paths. Implemented by
/// the engine-facing worker layer, out of scope for this crate.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle_plan_protocol(&self, protocol_run_id: i64) -> Result<()>;
    async fn handle_execute_step(&self, step_run_id: i64) -> Result<()>;
    async fn handle_quality(&self, step_run_id: i64) -> Result<()>;
}

/// How a job left the dispatcher.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// Enqueued on the durable queue.
    Enqueued { job_id: String },
    /// Ran synchronously in the caller's call stack.
    Inline,
    /// Refused or abandoned; an event explains why.
    Refused,
}

pub struct Dispatcher {
    queue: Option<Arc<dyn JobQueue>>,
    handler: Arc<dyn StepHandler>,
    max_inline_trigger_depth: u32,
}

impl Dispatcher {
    pub fn new(
        queue: Option<Arc<dyn JobQueue>>,
        handler: Arc<dyn StepHandler>,
        max_inline_trigger_depth: u32,
    ) -> Self {
        Self {
            queue,
            handler,
            max_inline_trigger_depth,
        }
    }

    pub fn max_inline_trigger_depth(&self) -> u32 {
        self.max_inline_trigger_depth
    }

    /// Send a lifecycle job to the queue, or run the handler inline when no
    /// queue is configured. Queue and inline handler failures both
    /// propagate; this path carries no best-effort semantics.
    pub async fn dispatch(&self, job: Job) -> Result<DispatchOutcome> {
        match &self.queue {
            Some(queue) => {
                let job_id = job.job_id.clone();
                let job_type = job.job_type;
                queue.enqueue(job).await?;
                info!(job_id = %job_id, job_type, "job enqueued");
                Ok(DispatchOutcome::Enqueued { job_id })
            }
            None => {
                let job_type = job.job_type;
                info!(job_id = %job.job_id, job_type, "job running inline");
                self.run_inline(&job).await?;
                Ok(DispatchOutcome::Inline)
            }
        }
    }

    async fn run_inline(&self, job: &Job) -> Result<()> {
        match job.job_type {
            PLAN_PROTOCOL_JOB => {
                let id = payload_id(&job.payload, "protocol_run_id");
                self.handler.handle_plan_protocol(id).await
            }
            RUN_QUALITY_JOB => {
                let id = payload_id(&job.payload, "step_run_id");
                self.handler.handle_quality(id).await
            }
            _ => {
                let id = payload_id(&job.payload, "step_run_id");
                self.handler.handle_execute_step(id).await
            }
        }
    }

    /// Re-dispatch a step set pending by a trigger policy.
    ///
    /// Ordering of concerns: depth guard first, then the queue, then the
    /// inline fallback. An enqueue failure falls through to inline rather
    /// than abandoning the trigger. When no queue exists and the target's QA
    /// policy is `skip`, the step is left pending for a later worker instead
    /// of being run inline. Inline execution failures are absorbed: the
    /// target is marked failed and an event records the error.
    pub async fn trigger_step(
        &self,
        store: &dyn Store,
        step_run_id: i64,
        protocol_run_id: i64,
        source: &str,
        inline_depth: u32,
    ) -> Result<DispatchOutcome> {
        let meta = |extra: Option<(&str, Value)>| {
            let mut map = json!({
                "target_step_id": step_run_id,
                "source": source,
                "inline_depth": inline_depth,
            });
            if let (Some((key, value)), Some(obj)) = (extra, map.as_object_mut()) {
                obj.insert(key.to_string(), value);
            }
            map
        };

        if inline_depth >= self.max_inline_trigger_depth {
            store
                .append_event(
                    protocol_run_id,
                    "trigger_inline_depth_exceeded".to_string(),
                    format!(
                        "Inline trigger depth exceeded ({}/{}).",
                        inline_depth, self.max_inline_trigger_depth
                    ),
                    EventContext::for_step(step_run_id).with_metadata(meta(None)),
                )
                .await?;
            warn!(
                protocol_run_id,
                step_run_id, inline_depth, "inline trigger depth exceeded"
            );
            return Ok(DispatchOutcome::Refused);
        }

        if let Some(queue) = &self.queue {
            let job = Job::execute_step(step_run_id);
            let job_id = job.job_id.clone();
            match queue.enqueue(job).await {
                Ok(()) => {
                    store
                        .append_event(
                            protocol_run_id,
                            "trigger_enqueued".to_string(),
                            "Triggered step enqueued for execution.".to_string(),
                            EventContext::for_step(step_run_id)
                                .with_metadata(meta(Some(("job_id", json!(job_id))))),
                        )
                        .await?;
                    return Ok(DispatchOutcome::Enqueued { job_id });
                }
                Err(exc) => {
                    store
                        .append_event(
                            protocol_run_id,
                            "trigger_enqueue_failed".to_string(),
                            format!("Failed to enqueue triggered step: {exc}"),
                            EventContext::for_step(step_run_id).with_metadata(meta(None)),
                        )
                        .await?;
                    warn!(
                        protocol_run_id,
                        step_run_id,
                        error = %exc,
                        "trigger enqueue failed; falling back to inline"
                    );
                }
            }
        }

        // Best-effort target lookup for the QA-skip check.
        let target = store.get_step_run(step_run_id).await.ok();
        let target_qa_skip = match &target {
            Some(target) => match store.get_protocol_run(protocol_run_id).await {
                Ok(run) => spec::get_step_spec(run.template_config.as_ref(), &target.step_name)
                    .is_some_and(|s| s.qa_is_skip()),
                Err(_) => false,
            },
            None => false,
        };
        if self.queue.is_none() && target_qa_skip {
            store
                .append_event(
                    protocol_run_id,
                    "trigger_pending".to_string(),
                    "Triggered step pending; no queue configured.".to_string(),
                    EventContext::for_step(step_run_id).with_metadata(meta(None)),
                )
                .await?;
            return Ok(DispatchOutcome::Refused);
        }

        match self
            .execute_inline(store, step_run_id, protocol_run_id, target, &meta(None))
            .await
        {
            Ok(()) => Ok(DispatchOutcome::Inline),
            Err(exc) => {
                store
                    .append_event(
                        protocol_run_id,
                        "trigger_inline_failed".to_string(),
                        format!("Inline trigger failed: {exc}"),
                        EventContext::for_step(step_run_id).with_metadata(meta(None)),
                    )
                    .await?;
                let _ = store
                    .update_step_status(
                        step_run_id,
                        StepStatus::Failed,
                        StepPatch::summary(format!("Trigger inline failed: {exc}")),
                        None,
                    )
                    .await;
                Ok(DispatchOutcome::Refused)
            }
        }
    }

    async fn execute_inline(
        &self,
        store: &dyn Store,
        step_run_id: i64,
        protocol_run_id: i64,
        target: Option<crate::domain::StepRun>,
        metadata: &Value,
    ) -> Result<()> {
        let target = match target {
            Some(target) => target,
            None => store.get_step_run(step_run_id).await?,
        };
        // The runtime state already carries the depth set by the trigger
        // policy; re-assert it so a direct trigger_step call behaves the
        // same.
        let mut merged_state = target.runtime_state.clone();
        merged_state.inline_trigger_depth = metadata["inline_depth"].as_u64().unwrap_or(0) as u32;
        store
            .update_step_status(
                step_run_id,
                StepStatus::Running,
                StepPatch {
                    summary: Some("Triggered (inline)".to_string()),
                    runtime_state: Some(merged_state),
                    ..StepPatch::default()
                },
                None,
            )
            .await?;
        store
            .append_event(
                protocol_run_id,
                "trigger_executed_inline".to_string(),
                "Triggered step executed inline (no queue configured).".to_string(),
                EventContext::for_step(step_run_id).with_metadata(metadata.clone()),
            )
            .await?;
        self.handler.handle_execute_step(step_run_id).await
    }
}

fn payload_id(payload: &Value, key: &str) -> i64 {
    payload.get(key).and_then(Value::as_i64).unwrap_or(0)
}
