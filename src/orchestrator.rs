//! Top-level coordinator for protocol and step lifecycles.
//!
//! The orchestrator composes the store, the policy runtime, the budget
//! tracker and the job dispatcher. It owns every protocol/step status
//! transition; each lifecycle transition goes through the store's CAS path,
//! so two workers racing on the same entity leave exactly one winner.
//!
//! Protocol lifecycle: pending → planning → planned → running →
//! {completed | blocked | failed | cancelled}, with paused as a suspend
//! state. Step lifecycle: pending → running → needs_qa →
//! {completed | failed | blocked | cancelled}, with policy-driven resets
//! back to pending.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::budget::BudgetTracker;
use crate::dispatch::{DispatchOutcome, Dispatcher, Job};
use crate::domain::{ProtocolRun, ProtocolStatus, QaVerdict, StepRun, StepStatus};
use crate::errors::{OrchestratorError, Result};
use crate::metrics::SharedMetrics;
use crate::policy::{self, LoopDecision, TriggerDecision};
use crate::spec;
use crate::store::{EventContext, NewProtocolRun, StepPatch, Store};

pub struct Orchestrator {
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    budget: Arc<BudgetTracker>,
    metrics: SharedMetrics,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Dispatcher,
        budget: Arc<BudgetTracker>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            dispatcher,
            budget,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    /// Create a new protocol run. A thin wrapper over the store so front
    /// ends depend on the orchestrator instead of the store directly.
    pub async fn create_protocol_run(&self, new: NewProtocolRun) -> Result<ProtocolRun> {
        let run = self.store.create_protocol_run(new).await?;
        info!(
            protocol_run_id = run.id,
            project_id = run.project_id,
            protocol_name = %run.protocol_name,
            "protocol created"
        );
        Ok(run)
    }

    /// Transition a protocol to planning and dispatch the planning job.
    /// Only pending, planned and paused protocols can be started.
    pub async fn start_protocol_run(&self, protocol_run_id: i64) -> Result<DispatchOutcome> {
        let run = self.store.get_protocol_run(protocol_run_id).await?;
        if !matches!(
            run.status,
            ProtocolStatus::Pending | ProtocolStatus::Planned | ProtocolStatus::Paused
        ) {
            return Err(OrchestratorError::InvalidStateTransition {
                id: protocol_run_id,
                from: run.status.as_str().to_string(),
                to: ProtocolStatus::Planning.as_str().to_string(),
            });
        }
        self.store
            .update_protocol_status(protocol_run_id, ProtocolStatus::Planning, Some(run.status))
            .await?;
        let outcome = self
            .dispatcher
            .dispatch(Job::plan_protocol(protocol_run_id))
            .await?;
        info!(protocol_run_id, "plan dispatched");
        Ok(outcome)
    }

    /// Select the lowest-index runnable step (pending, blocked or failed),
    /// mark it running, set the protocol running and dispatch execution.
    pub async fn enqueue_next_step(
        &self,
        protocol_run_id: i64,
    ) -> Result<(StepRun, DispatchOutcome)> {
        let run = self.store.get_protocol_run(protocol_run_id).await?;
        self.ensure_valid_spec(&run).await?;
        let steps = self.store.list_step_runs(protocol_run_id).await?;
        let target = steps
            .iter()
            .find(|s| {
                matches!(
                    s.status,
                    StepStatus::Pending | StepStatus::Blocked | StepStatus::Failed
                )
            })
            .ok_or(OrchestratorError::NoRunnableStep { protocol_run_id })?;
        let step = self
            .store
            .update_step_status(
                target.id,
                StepStatus::Running,
                StepPatch::default(),
                Some(target.status),
            )
            .await?;
        self.store
            .update_protocol_status(protocol_run_id, ProtocolStatus::Running, None)
            .await?;
        let outcome = self.dispatcher.dispatch(Job::execute_step(step.id)).await?;
        info!(protocol_run_id, step_run_id = step.id, "step dispatched");
        Ok((step, outcome))
    }

    /// Retry the most recently created failed or blocked step, bumping its
    /// retry counter.
    pub async fn retry_latest_step(
        &self,
        protocol_run_id: i64,
    ) -> Result<(StepRun, DispatchOutcome)> {
        let run = self.store.get_protocol_run(protocol_run_id).await?;
        self.ensure_valid_spec(&run).await?;
        let steps = self.store.list_step_runs(protocol_run_id).await?;
        let target = steps
            .iter()
            .rev()
            .find(|s| matches!(s.status, StepStatus::Failed | StepStatus::Blocked))
            .ok_or(OrchestratorError::NoRunnableStep { protocol_run_id })?;
        let step = self
            .store
            .update_step_status(
                target.id,
                StepStatus::Running,
                StepPatch {
                    retries: Some(target.retries + 1),
                    ..StepPatch::default()
                },
                Some(target.status),
            )
            .await?;
        self.store
            .update_protocol_status(protocol_run_id, ProtocolStatus::Running, None)
            .await?;
        let outcome = self.dispatcher.dispatch(Job::execute_step(step.id)).await?;
        info!(
            protocol_run_id,
            step_run_id = step.id,
            retries = step.retries,
            "step retry dispatched"
        );
        Ok((step, outcome))
    }

    /// Transition one specific step to running and dispatch execution.
    pub async fn run_step(&self, step_run_id: i64) -> Result<DispatchOutcome> {
        let step = self.store.get_step_run(step_run_id).await?;
        if !matches!(
            step.status,
            StepStatus::Pending | StepStatus::Blocked | StepStatus::Failed
        ) {
            return Err(OrchestratorError::InvalidStateTransition {
                id: step_run_id,
                from: step.status.as_str().to_string(),
                to: StepStatus::Running.as_str().to_string(),
            });
        }
        let run = self.store.get_protocol_run(step.protocol_run_id).await?;
        self.ensure_valid_spec(&run).await?;
        let step = self
            .store
            .update_step_status(
                step.id,
                StepStatus::Running,
                StepPatch::default(),
                Some(step.status),
            )
            .await?;
        self.store
            .update_protocol_status(step.protocol_run_id, ProtocolStatus::Running, None)
            .await?;
        self.dispatcher.dispatch(Job::execute_step(step.id)).await
    }

    /// Transition a step to needs_qa and dispatch a QA job. Completed and
    /// cancelled steps cannot re-enter QA.
    pub async fn run_step_qa(&self, step_run_id: i64) -> Result<DispatchOutcome> {
        let step = self.store.get_step_run(step_run_id).await?;
        if step.status.is_terminal() {
            return Err(OrchestratorError::InvalidStateTransition {
                id: step_run_id,
                from: step.status.as_str().to_string(),
                to: StepStatus::NeedsQa.as_str().to_string(),
            });
        }
        let run = self.store.get_protocol_run(step.protocol_run_id).await?;
        self.ensure_valid_spec(&run).await?;
        let step = self
            .store
            .update_step_status(
                step.id,
                StepStatus::NeedsQa,
                StepPatch::default(),
                Some(step.status),
            )
            .await?;
        self.dispatcher.dispatch(Job::run_quality(step.id)).await
    }

    /// Pause a protocol. Blocked protocols may still be paused; only
    /// completed, cancelled and failed ones are settled.
    pub async fn pause_protocol(&self, protocol_run_id: i64) -> Result<ProtocolRun> {
        let run = self.store.get_protocol_run(protocol_run_id).await?;
        if matches!(
            run.status,
            ProtocolStatus::Completed | ProtocolStatus::Cancelled | ProtocolStatus::Failed
        ) {
            return Err(OrchestratorError::InvalidStateTransition {
                id: protocol_run_id,
                from: run.status.as_str().to_string(),
                to: ProtocolStatus::Paused.as_str().to_string(),
            });
        }
        self.store
            .update_protocol_status(protocol_run_id, ProtocolStatus::Paused, Some(run.status))
            .await
    }

    /// Resume a paused protocol. Any other source state is rejected.
    pub async fn resume_protocol(&self, protocol_run_id: i64) -> Result<ProtocolRun> {
        let run = self.store.get_protocol_run(protocol_run_id).await?;
        if run.status != ProtocolStatus::Paused {
            return Err(OrchestratorError::InvalidStateTransition {
                id: protocol_run_id,
                from: run.status.as_str().to_string(),
                to: ProtocolStatus::Running.as_str().to_string(),
            });
        }
        self.store
            .update_protocol_status(
                protocol_run_id,
                ProtocolStatus::Running,
                Some(ProtocolStatus::Paused),
            )
            .await
    }

    /// Cancel a protocol and cascade cancellation to its in-flight steps.
    ///
    /// Idempotent: an already-cancelled protocol is returned as-is. The
    /// cascade is best effort; one step's failure does not stop the rest.
    pub async fn cancel_protocol(&self, protocol_run_id: i64) -> Result<ProtocolRun> {
        let run = self.store.get_protocol_run(protocol_run_id).await?;
        if run.status == ProtocolStatus::Cancelled {
            return Ok(run);
        }
        let updated = self
            .store
            .update_protocol_status(protocol_run_id, ProtocolStatus::Cancelled, Some(run.status))
            .await?;
        let steps = self.store.list_step_runs(protocol_run_id).await?;
        for step in steps {
            if !matches!(
                step.status,
                StepStatus::Pending | StepStatus::Running | StepStatus::NeedsQa
            ) {
                continue;
            }
            if let Err(e) = self
                .store
                .update_step_status(
                    step.id,
                    StepStatus::Cancelled,
                    StepPatch::summary("Cancelled with protocol"),
                    Some(step.status),
                )
                .await
            {
                warn!(
                    protocol_run_id,
                    step_run_id = step.id,
                    error = %e,
                    "step cancellation skipped"
                );
            }
        }
        Ok(updated)
    }

    /// Ensure step runs exist for each numbered step file under the protocol
    /// root. Returns the number of steps created.
    pub async fn sync_steps_from_spec(
        &self,
        protocol_run_id: i64,
        protocol_root: &Path,
    ) -> Result<u32> {
        let built = spec::build_spec_from_step_files(
            protocol_root,
            "codex",
            "full",
            "prompts/quality-validator.prompt.md",
        )?;
        let existing: std::collections::HashSet<String> = self
            .store
            .list_step_runs(protocol_run_id)
            .await?
            .into_iter()
            .map(|s| s.step_name)
            .collect();
        let created =
            spec::create_steps_from_spec(self.store.as_ref(), protocol_run_id, &built, &existing)
                .await?;
        info!(protocol_run_id, created, "steps synced from protocol files");
        Ok(created)
    }

    /// Validate the stored protocol spec and record the outcome in
    /// `spec_meta`. Returns the error list (empty when valid).
    pub async fn validate_protocol_spec_and_record(
        &self,
        protocol_run_id: i64,
    ) -> Result<Vec<String>> {
        let run = self.store.get_protocol_run(protocol_run_id).await?;
        let errors = self.spec_errors(&run);
        let status = if errors.is_empty() { "ok" } else { "invalid" };
        spec::update_spec_meta(
            self.store.as_ref(),
            protocol_run_id,
            run.template_config,
            run.template_source,
            status,
            &errors,
        )
        .await?;
        Ok(errors)
    }

    fn spec_errors(&self, run: &ProtocolRun) -> Vec<String> {
        let Some(config) = &run.template_config else {
            return Vec::new();
        };
        let Some(spec_value) = config.get(spec::PROTOCOL_SPEC_KEY) else {
            return Vec::new();
        };
        let base = run
            .protocol_root
            .as_deref()
            .map_or_else(|| Path::new(".").to_path_buf(), |p| Path::new(p).to_path_buf());
        let workspace = run.worktree_path.as_deref().map(Path::new);
        spec::validate_protocol_spec(&base, spec_value, workspace)
    }

    /// Pre-flight validity gate: execution and QA are never dispatched
    /// against an invalid spec. Protocols without a stored spec pass.
    async fn ensure_valid_spec(&self, run: &ProtocolRun) -> Result<()> {
        let errors = self.spec_errors(run);
        if errors.is_empty() {
            return Ok(());
        }
        spec::update_spec_meta(
            self.store.as_ref(),
            run.id,
            run.template_config.clone(),
            run.template_source.clone(),
            "invalid",
            &errors,
        )
        .await?;
        Err(OrchestratorError::Validation(format!(
            "protocol spec invalid: {}",
            errors.join("; ")
        )))
    }

    /// Mark the protocol completed when every step is completed or
    /// cancelled. Returns true when the transition happened here.
    pub async fn check_and_complete_protocol(&self, protocol_run_id: i64) -> Result<bool> {
        let run = self.store.get_protocol_run(protocol_run_id).await?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        let steps = self.store.list_step_runs(protocol_run_id).await?;
        if steps.is_empty() {
            return Ok(false);
        }
        if steps.iter().any(|s| !s.status.is_terminal()) {
            return Ok(false);
        }
        self.store
            .update_protocol_status(protocol_run_id, ProtocolStatus::Completed, None)
            .await?;
        self.store
            .append_event(
                protocol_run_id,
                "protocol_completed".to_string(),
                "All steps completed; protocol closed.".to_string(),
                EventContext::default(),
            )
            .await?;
        info!(
            protocol_run_id,
            project_id = run.project_id,
            "protocol completed"
        );
        Ok(true)
    }

    /// Apply trigger policies and re-dispatch the chosen target. The
    /// decision's inline depth (source depth + 1) feeds the dispatcher's
    /// recursion guard.
    pub async fn apply_trigger_policy(
        &self,
        step: &StepRun,
        reason: &str,
    ) -> Result<Option<TriggerDecision>> {
        let Some(decision) =
            policy::apply_trigger_policies(step, self.store.as_ref(), reason).await?
        else {
            return Ok(None);
        };
        self.dispatcher
            .trigger_step(
                self.store.as_ref(),
                decision.target_step_id,
                step.protocol_run_id,
                reason,
                decision.inline_depth,
            )
            .await?;
        Ok(Some(decision))
    }

    /// Apply loop policies, resetting earlier steps when one matches.
    pub async fn apply_loop_policy(
        &self,
        step: &StepRun,
        reason: &str,
    ) -> Result<Option<LoopDecision>> {
        policy::apply_loop_policies(step, self.store.as_ref(), reason).await
    }

    /// Direct access to the dispatcher's trigger primitive for callers that
    /// already hold a policy decision.
    pub async fn trigger_step(
        &self,
        step_run_id: i64,
        protocol_run_id: i64,
        source: &str,
        inline_depth: u32,
    ) -> Result<DispatchOutcome> {
        self.dispatcher
            .trigger_step(
                self.store.as_ref(),
                step_run_id,
                protocol_run_id,
                source,
                inline_depth,
            )
            .await
    }

    /// Post-completion workflow: apply policies based on the step outcome,
    /// then update the protocol status and check for completion.
    ///
    /// Failure path (QA FAIL verdict or failed step): a matching loop
    /// policy keeps the protocol running; otherwise a trigger policy is
    /// tried even on failure, and with neither the protocol is blocked.
    /// Success path: trigger policy, then completion check. A step in
    /// needs_qa only fires trigger policies with reason `exec_completed`.
    pub async fn handle_step_completion(
        &self,
        step_run_id: i64,
        qa_verdict: Option<QaVerdict>,
    ) -> Result<()> {
        let step = self.store.get_step_run(step_run_id).await?;
        let protocol_run_id = step.protocol_run_id;
        if let Some(verdict) = qa_verdict {
            self.metrics.inc_qa_verdict(verdict.as_str());
        }

        let verdict_fail = qa_verdict == Some(QaVerdict::Fail);
        let verdict_pass = qa_verdict == Some(QaVerdict::Pass);

        if verdict_fail || step.status == StepStatus::Failed {
            let reason = if verdict_fail { "qa_failed" } else { "exec_failed" };
            if self.apply_loop_policy(&step, reason).await?.is_some() {
                self.store
                    .update_protocol_status(protocol_run_id, ProtocolStatus::Running, None)
                    .await?;
                return Ok(());
            }
            if self.apply_trigger_policy(&step, reason).await?.is_some() {
                self.store
                    .update_protocol_status(protocol_run_id, ProtocolStatus::Running, None)
                    .await?;
            } else {
                self.store
                    .update_protocol_status(protocol_run_id, ProtocolStatus::Blocked, None)
                    .await?;
            }
        } else if verdict_pass || step.status == StepStatus::Completed {
            let reason = if verdict_pass { "qa_passed" } else { "exec_completed" };
            if self.apply_trigger_policy(&step, reason).await?.is_some() {
                self.store
                    .update_protocol_status(protocol_run_id, ProtocolStatus::Running, None)
                    .await?;
            }
            self.check_and_complete_protocol(protocol_run_id).await?;
        } else if step.status == StepStatus::NeedsQa {
            if self
                .apply_trigger_policy(&step, "exec_completed")
                .await?
                .is_some()
            {
                self.store
                    .update_protocol_status(protocol_run_id, ProtocolStatus::Running, None)
                    .await?;
            }
        }
        Ok(())
    }
}
