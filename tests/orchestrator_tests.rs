//! End-to-end orchestration flows against the in-memory SQLite backend.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use conductor::budget::{BudgetMode, BudgetTracker};
use conductor::dispatch::{DispatchOutcome, Dispatcher, Job, JobQueue, StepHandler};
use conductor::domain::{Event, ProtocolStatus, QaVerdict, RuntimeState, StepStatus};
use conductor::errors::{OrchestratorError, Result};
use conductor::metrics;
use conductor::orchestrator::Orchestrator;
use conductor::policy::PolicyRecord;
use conductor::store::{
    NewProject, NewProtocolRun, NewStepRun, SqliteStore, StepPatch, Store,
};

/// Records handler invocations instead of talking to an engine.
#[derive(Default)]
struct RecordingHandler {
    calls: Mutex<Vec<(&'static str, i64)>>,
}

impl RecordingHandler {
    fn calls(&self) -> Vec<(&'static str, i64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepHandler for RecordingHandler {
    async fn handle_plan_protocol(&self, protocol_run_id: i64) -> Result<()> {
        self.calls.lock().unwrap().push(("plan", protocol_run_id));
        Ok(())
    }

    async fn handle_execute_step(&self, step_run_id: i64) -> Result<()> {
        self.calls.lock().unwrap().push(("execute", step_run_id));
        Ok(())
    }

    async fn handle_quality(&self, step_run_id: i64) -> Result<()> {
        self.calls.lock().unwrap().push(("quality", step_run_id));
        Ok(())
    }
}

#[derive(Default)]
struct VecQueue {
    jobs: Mutex<Vec<Job>>,
}

impl VecQueue {
    fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobQueue for VecQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}

struct FailingQueue;

#[async_trait]
impl JobQueue for FailingQueue {
    async fn enqueue(&self, _job: Job) -> Result<()> {
        Err(OrchestratorError::Queue("queue unavailable".into()))
    }
}

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<dyn Store>,
    handler: Arc<RecordingHandler>,
}

fn harness(queue: Option<Arc<dyn JobQueue>>) -> Harness {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let handler = Arc::new(RecordingHandler::default());
    let dispatcher = Dispatcher::new(queue, handler.clone(), 3);
    let budget = Arc::new(BudgetTracker::new(
        BudgetMode::Strict,
        Some(100),
        None,
        metrics::noop(),
    ));
    let orchestrator = Orchestrator::new(store.clone(), dispatcher, budget, metrics::noop());
    Harness {
        orchestrator,
        store,
        handler,
    }
}

async fn seed_run(store: &Arc<dyn Store>, template_config: Option<Value>) -> i64 {
    let project = store
        .create_project(NewProject {
            name: "demo".into(),
            git_url: "https://example.com/demo.git".into(),
            base_branch: "main".into(),
            ..NewProject::default()
        })
        .await
        .unwrap();
    store
        .create_protocol_run(NewProtocolRun {
            project_id: project.id,
            protocol_name: "feature-1".into(),
            status: ProtocolStatus::Pending,
            base_branch: "main".into(),
            worktree_path: None,
            protocol_root: None,
            description: None,
            template_config,
            template_source: None,
        })
        .await
        .unwrap()
        .id
}

async fn seed_step(
    store: &Arc<dyn Store>,
    protocol_run_id: i64,
    step_index: i64,
    step_name: &str,
    status: StepStatus,
    policy: Vec<Value>,
) -> i64 {
    store
        .create_step_run(NewStepRun {
            protocol_run_id,
            step_index,
            step_name: step_name.into(),
            step_type: "work".into(),
            status,
            model: None,
            engine_id: None,
            retries: 0,
            summary: None,
            policy: policy.into_iter().map(PolicyRecord::from_value).collect(),
        })
        .await
        .unwrap()
        .id
}

fn count_events(events: &[Event], event_type: &str) -> usize {
    events.iter().filter(|e| e.event_type == event_type).count()
}

#[tokio::test]
async fn qa_failure_loops_steps_back_then_blocks_at_limit() {
    let h = harness(None);
    let run_id = seed_run(&h.store, None).await;
    let main_id = seed_step(&h.store, run_id, 0, "00-main.md", StepStatus::Completed, vec![]).await;
    let qa_id = seed_step(
        &h.store,
        run_id,
        1,
        "01-qa.md",
        StepStatus::NeedsQa,
        vec![json!({
            "behavior": "loop",
            "module_id": "qa-loop",
            "step_back": 1,
            "max_iterations": 2,
            "condition": "qa_failed",
        })],
    )
    .await;

    // First failed verdict loops both steps back to pending.
    h.orchestrator
        .handle_step_completion(qa_id, Some(QaVerdict::Fail))
        .await
        .unwrap();
    let main = h.store.get_step_run(main_id).await.unwrap();
    let qa = h.store.get_step_run(qa_id).await.unwrap();
    assert_eq!(main.status, StepStatus::Pending);
    assert_eq!(qa.status, StepStatus::Pending);
    assert_eq!(main.summary.as_deref(), Some("Looped via qa-loop (1/2)"));
    assert_eq!(qa.runtime_state.loop_counts.get("qa-loop"), Some(&1));
    assert_eq!(
        h.store.get_protocol_run(run_id).await.unwrap().status,
        ProtocolStatus::Running
    );

    // Second failure still loops.
    h.orchestrator
        .handle_step_completion(qa_id, Some(QaVerdict::Fail))
        .await
        .unwrap();
    let qa = h.store.get_step_run(qa_id).await.unwrap();
    assert_eq!(qa.runtime_state.loop_counts.get("qa-loop"), Some(&2));
    assert_eq!(qa.summary.as_deref(), Some("Looped via qa-loop (2/2)"));

    // Third failure hits the iteration cap; no trigger policy, so blocked.
    h.orchestrator
        .handle_step_completion(qa_id, Some(QaVerdict::Fail))
        .await
        .unwrap();
    assert_eq!(
        h.store.get_protocol_run(run_id).await.unwrap().status,
        ProtocolStatus::Blocked
    );

    let events = h.store.list_events(run_id).await.unwrap();
    assert_eq!(count_events(&events, "loop_decision"), 2);
    assert_eq!(count_events(&events, "loop_limit_reached"), 1);
}

#[tokio::test]
async fn trigger_policy_marks_target_pending_and_enqueues() {
    let queue = Arc::new(VecQueue::default());
    let h = harness(Some(queue.clone()));
    let run_id = seed_run(&h.store, None).await;
    let main_id = seed_step(
        &h.store,
        run_id,
        0,
        "00-main.md",
        StepStatus::Completed,
        vec![json!({
            "behavior": "trigger",
            "module_id": "qa-gate",
            "trigger_agent_id": "qa",
            "condition": "qa_passed",
        })],
    )
    .await;
    let qa_id = seed_step(&h.store, run_id, 1, "01-qa.md", StepStatus::Failed, vec![]).await;

    h.orchestrator
        .handle_step_completion(main_id, Some(QaVerdict::Pass))
        .await
        .unwrap();

    let qa = h.store.get_step_run(qa_id).await.unwrap();
    assert_eq!(qa.status, StepStatus::Pending);
    assert_eq!(qa.summary.as_deref(), Some("Triggered by 00-main.md"));
    assert_eq!(
        qa.runtime_state.last_triggered_by.as_deref(),
        Some("00-main.md")
    );
    assert_eq!(qa.runtime_state.inline_trigger_depth, 1);

    let jobs = queue.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].payload["step_run_id"], qa_id);

    let events = h.store.list_events(run_id).await.unwrap();
    assert_eq!(count_events(&events, "trigger_decision"), 1);
    assert_eq!(count_events(&events, "trigger_enqueued"), 1);
    assert_eq!(
        h.store.get_protocol_run(run_id).await.unwrap().status,
        ProtocolStatus::Running
    );
    // Queue path never runs the handler.
    assert!(h.handler.calls().is_empty());
}

#[tokio::test]
async fn trigger_without_queue_runs_target_inline() {
    let h = harness(None);
    let run_id = seed_run(&h.store, None).await;
    let main_id = seed_step(
        &h.store,
        run_id,
        0,
        "00-main.md",
        StepStatus::Completed,
        vec![json!({
            "behavior": "trigger",
            "trigger_agent_id": "qa",
            "condition": "qa_passed",
        })],
    )
    .await;
    let qa_id = seed_step(&h.store, run_id, 1, "01-qa.md", StepStatus::Failed, vec![]).await;

    h.orchestrator
        .handle_step_completion(main_id, Some(QaVerdict::Pass))
        .await
        .unwrap();

    let qa = h.store.get_step_run(qa_id).await.unwrap();
    assert_eq!(qa.status, StepStatus::Running);
    assert_eq!(qa.summary.as_deref(), Some("Triggered (inline)"));
    assert_eq!(qa.runtime_state.inline_trigger_depth, 1);
    assert_eq!(h.handler.calls(), vec![("execute", qa_id)]);

    let events = h.store.list_events(run_id).await.unwrap();
    assert_eq!(count_events(&events, "trigger_executed_inline"), 1);
}

#[tokio::test]
async fn inline_trigger_chain_stops_at_depth_limit() {
    let h = harness(None);
    let run_id = seed_run(&h.store, None).await;
    let source_id = seed_step(
        &h.store,
        run_id,
        0,
        "00-main.md",
        StepStatus::Completed,
        vec![json!({
            "behavior": "trigger",
            "trigger_agent_id": "qa",
            "condition": "qa_passed",
        })],
    )
    .await;
    let qa_id = seed_step(&h.store, run_id, 1, "01-qa.md", StepStatus::Failed, vec![]).await;

    // The source already sits two inline hops deep; its trigger would be the
    // third.
    let mut state = RuntimeState::default();
    state.inline_trigger_depth = 2;
    h.store
        .update_step_status(
            source_id,
            StepStatus::Completed,
            StepPatch {
                runtime_state: Some(state),
                ..StepPatch::default()
            },
            None,
        )
        .await
        .unwrap();

    h.orchestrator
        .handle_step_completion(source_id, Some(QaVerdict::Pass))
        .await
        .unwrap();

    let events = h.store.list_events(run_id).await.unwrap();
    assert_eq!(count_events(&events, "trigger_inline_depth_exceeded"), 1);
    // Target stays pending; nothing ran inline.
    let qa = h.store.get_step_run(qa_id).await.unwrap();
    assert_eq!(qa.status, StepStatus::Pending);
    assert_eq!(qa.runtime_state.inline_trigger_depth, 3);
    assert!(h.handler.calls().is_empty());
}

#[tokio::test]
async fn enqueue_failure_falls_back_to_inline_execution() {
    let h = harness(Some(Arc::new(FailingQueue)));
    let run_id = seed_run(&h.store, None).await;
    let step_id = seed_step(&h.store, run_id, 0, "01-qa.md", StepStatus::Pending, vec![]).await;

    let outcome = h
        .orchestrator
        .trigger_step(step_id, run_id, "qa_passed", 1)
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Inline));
    assert_eq!(h.handler.calls(), vec![("execute", step_id)]);

    let events = h.store.list_events(run_id).await.unwrap();
    assert_eq!(count_events(&events, "trigger_enqueue_failed"), 1);
    assert_eq!(count_events(&events, "trigger_executed_inline"), 1);
}

#[tokio::test]
async fn protocol_completes_once_when_all_steps_terminal() {
    let h = harness(None);
    let run_id = seed_run(&h.store, None).await;
    seed_step(&h.store, run_id, 0, "00-main.md", StepStatus::Completed, vec![]).await;
    let last_id =
        seed_step(&h.store, run_id, 1, "01-qa.md", StepStatus::Completed, vec![]).await;

    h.orchestrator
        .handle_step_completion(last_id, None)
        .await
        .unwrap();
    assert_eq!(
        h.store.get_protocol_run(run_id).await.unwrap().status,
        ProtocolStatus::Completed
    );
    let events = h.store.list_events(run_id).await.unwrap();
    assert_eq!(count_events(&events, "protocol_completed"), 1);
    assert_eq!(
        events[0].message,
        "All steps completed; protocol closed."
    );

    // A second check is a no-op on an already-completed protocol.
    let completed = h
        .orchestrator
        .check_and_complete_protocol(run_id)
        .await
        .unwrap();
    assert!(!completed);
    let events = h.store.list_events(run_id).await.unwrap();
    assert_eq!(count_events(&events, "protocol_completed"), 1);
}

#[tokio::test]
async fn completion_ignores_protocol_without_steps() {
    let h = harness(None);
    let run_id = seed_run(&h.store, None).await;
    let completed = h
        .orchestrator
        .check_and_complete_protocol(run_id)
        .await
        .unwrap();
    assert!(!completed);
    assert_eq!(
        h.store.get_protocol_run(run_id).await.unwrap().status,
        ProtocolStatus::Pending
    );
}

#[tokio::test]
async fn concurrent_next_step_selection_has_one_winner() {
    let h = harness(None);
    let run_id = seed_run(&h.store, None).await;
    seed_step(&h.store, run_id, 0, "00-main.md", StepStatus::Pending, vec![]).await;

    let (a, b) = tokio::join!(
        h.orchestrator.enqueue_next_step(run_id),
        h.orchestrator.enqueue_next_step(run_id),
    );
    let winners = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(winners, 1);
    for outcome in [a, b] {
        if let Err(e) = outcome {
            assert!(
                matches!(
                    e,
                    OrchestratorError::Conflict { .. }
                        | OrchestratorError::NoRunnableStep { .. }
                ),
                "unexpected error: {e}"
            );
        }
    }
    // The losing call left the winner's transition intact.
    let steps = h.store.list_step_runs(run_id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Running);
}

#[tokio::test]
async fn invalid_spec_gates_dispatch_and_records_meta() {
    let h = harness(None);
    let config = json!({"protocol_spec": {"steps": "nope"}});
    let run_id = seed_run(&h.store, Some(config)).await;
    seed_step(&h.store, run_id, 0, "00-main.md", StepStatus::Pending, vec![]).await;

    let err = h.orchestrator.enqueue_next_step(run_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let run = h.store.get_protocol_run(run_id).await.unwrap();
    let meta = &run.template_config.unwrap()["spec_meta"];
    assert_eq!(meta["status"], "invalid");
    assert!(!meta["errors"].as_array().unwrap().is_empty());
    // Nothing was dispatched.
    assert!(h.handler.calls().is_empty());
}

#[tokio::test]
async fn valid_spec_recording_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("00-main.md"), "prompt").unwrap();
    let h = harness(None);
    let project = h
        .store
        .create_project(NewProject {
            name: "demo".into(),
            git_url: "https://example.com/demo.git".into(),
            base_branch: "main".into(),
            ..NewProject::default()
        })
        .await
        .unwrap();
    let run = h
        .store
        .create_protocol_run(NewProtocolRun {
            project_id: project.id,
            protocol_name: "feature-2".into(),
            status: ProtocolStatus::Pending,
            base_branch: "main".into(),
            worktree_path: None,
            protocol_root: Some(dir.path().to_string_lossy().into_owned()),
            description: None,
            template_config: Some(json!({
                "protocol_spec": {
                    "steps": [{"name": "00-main.md", "prompt_ref": "00-main.md"}]
                }
            })),
            template_source: None,
        })
        .await
        .unwrap();

    let errors = h
        .orchestrator
        .validate_protocol_spec_and_record(run.id)
        .await
        .unwrap();
    assert!(errors.is_empty(), "{errors:?}");
    let run = h.store.get_protocol_run(run.id).await.unwrap();
    let meta = &run.template_config.unwrap()["spec_meta"];
    assert_eq!(meta["status"], "ok");
    assert_eq!(meta["spec_hash"].as_str().unwrap().len(), 12);
}

#[tokio::test]
async fn sync_steps_from_numbered_files_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("00-setup.md"), "a").unwrap();
    std::fs::write(dir.path().join("01-impl.md"), "b").unwrap();
    std::fs::write(dir.path().join("notes.md"), "ignored").unwrap();

    let h = harness(None);
    let run_id = seed_run(&h.store, None).await;
    let created = h
        .orchestrator
        .sync_steps_from_spec(run_id, dir.path())
        .await
        .unwrap();
    assert_eq!(created, 2);

    let steps = h.store.list_step_runs(run_id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].step_name, "00-setup.md");
    assert_eq!(steps[0].step_type, "setup");
    assert_eq!(steps[1].step_name, "01-impl.md");
    assert_eq!(steps[1].step_type, "work");
    assert!(steps.iter().all(|s| s.status == StepStatus::Pending));

    let created = h
        .orchestrator
        .sync_steps_from_spec(run_id, dir.path())
        .await
        .unwrap();
    assert_eq!(created, 0);
}

#[tokio::test]
async fn cancel_cascades_to_inflight_steps_and_is_idempotent() {
    let h = harness(None);
    let run_id = seed_run(&h.store, None).await;
    let done_id =
        seed_step(&h.store, run_id, 0, "00-main.md", StepStatus::Completed, vec![]).await;
    let pending_id =
        seed_step(&h.store, run_id, 1, "01-qa.md", StepStatus::Pending, vec![]).await;

    let run = h.orchestrator.cancel_protocol(run_id).await.unwrap();
    assert_eq!(run.status, ProtocolStatus::Cancelled);

    let done = h.store.get_step_run(done_id).await.unwrap();
    assert_eq!(done.status, StepStatus::Completed);
    let pending = h.store.get_step_run(pending_id).await.unwrap();
    assert_eq!(pending.status, StepStatus::Cancelled);
    assert_eq!(pending.summary.as_deref(), Some("Cancelled with protocol"));

    // Second cancel returns the settled run unchanged.
    let again = h.orchestrator.cancel_protocol(run_id).await.unwrap();
    assert_eq!(again.status, ProtocolStatus::Cancelled);
}

#[tokio::test]
async fn paused_protocol_resumes_only_from_paused() {
    let h = harness(None);
    let run_id = seed_run(&h.store, None).await;
    h.store
        .update_protocol_status(run_id, ProtocolStatus::Running, None)
        .await
        .unwrap();

    let paused = h.orchestrator.pause_protocol(run_id).await.unwrap();
    assert_eq!(paused.status, ProtocolStatus::Paused);

    let resumed = h.orchestrator.resume_protocol(run_id).await.unwrap();
    assert_eq!(resumed.status, ProtocolStatus::Running);
    let err = h.orchestrator.resume_protocol(run_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidStateTransition { .. }));

    h.store
        .update_protocol_status(run_id, ProtocolStatus::Completed, None)
        .await
        .unwrap();
    let err = h.orchestrator.pause_protocol(run_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn retry_bumps_retry_counter_and_redispatches() {
    let h = harness(None);
    let run_id = seed_run(&h.store, None).await;
    seed_step(&h.store, run_id, 0, "00-main.md", StepStatus::Completed, vec![]).await;
    let failed_id =
        seed_step(&h.store, run_id, 1, "01-qa.md", StepStatus::Failed, vec![]).await;

    let (step, outcome) = h.orchestrator.retry_latest_step(run_id).await.unwrap();
    assert_eq!(step.id, failed_id);
    assert_eq!(step.status, StepStatus::Running);
    assert_eq!(step.retries, 1);
    assert!(matches!(outcome, DispatchOutcome::Inline));
    assert_eq!(h.handler.calls(), vec![("execute", failed_id)]);
    assert_eq!(
        h.store.get_protocol_run(run_id).await.unwrap().status,
        ProtocolStatus::Running
    );
}

#[tokio::test]
async fn strict_budget_refuses_without_charging() {
    let h = harness(None);
    let budget = h.orchestrator.budget();
    budget.record_usage(1, 10, "exec", "gpt-test", 50, 40);
    assert_eq!(budget.protocol_usage(1), 90);

    let err = budget.check_protocol_budget(1, 20).unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::BudgetExceeded {
            scope: "protocol",
            projected: 110,
            limit: 100
        }
    ));
    // The refused request charged nothing.
    assert_eq!(budget.protocol_usage(1), 90);
    budget.check_protocol_budget(1, 10).unwrap();
    assert_eq!(budget.protocol_usage(1), 100);
}

#[tokio::test]
async fn start_protocol_dispatches_planning() {
    let h = harness(None);
    let run_id = seed_run(&h.store, None).await;
    let outcome = h.orchestrator.start_protocol_run(run_id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Inline));
    assert_eq!(h.handler.calls(), vec![("plan", run_id)]);
    assert_eq!(
        h.store.get_protocol_run(run_id).await.unwrap().status,
        ProtocolStatus::Planning
    );

    // Planning is not a startable state.
    let err = h.orchestrator.start_protocol_run(run_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn run_step_qa_rejects_terminal_steps() {
    let h = harness(None);
    let run_id = seed_run(&h.store, None).await;
    let step_id =
        seed_step(&h.store, run_id, 0, "00-main.md", StepStatus::Running, vec![]).await;

    let outcome = h.orchestrator.run_step_qa(step_id).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Inline));
    assert_eq!(h.handler.calls(), vec![("quality", step_id)]);
    assert_eq!(
        h.store.get_step_run(step_id).await.unwrap().status,
        StepStatus::NeedsQa
    );

    h.store
        .update_step_status(step_id, StepStatus::Completed, StepPatch::default(), None)
        .await
        .unwrap();
    let err = h.orchestrator.run_step_qa(step_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn recent_events_respect_project_filter() {
    let h = harness(None);
    let run_id = seed_run(&h.store, None).await;
    seed_step(&h.store, run_id, 0, "00-main.md", StepStatus::Completed, vec![]).await;
    seed_step(&h.store, run_id, 1, "01-qa.md", StepStatus::Completed, vec![]).await;
    h.orchestrator
        .check_and_complete_protocol(run_id)
        .await
        .unwrap();

    let run = h.store.get_protocol_run(run_id).await.unwrap();
    let events = h
        .store
        .list_recent_events(10, Some(run.project_id))
        .await
        .unwrap();
    assert_eq!(count_events(&events, "protocol_completed"), 1);
    assert_eq!(events[0].protocol_name.as_deref(), Some("feature-1"));
    assert_eq!(events[0].project_name.as_deref(), Some("demo"));

    let other = h.store.list_recent_events(10, Some(999)).await.unwrap();
    assert!(other.is_empty());
}
