//! Loop/trigger policy runtime.
//!
//! A step carries an ordered list of policy records. For a requested
//! behavior the runtime scans the list in order: the first record whose
//! conditions allow the supplied reason is applied and the scan stops;
//! non-matching records emit a skip event and the scan continues. Every
//! decision, skip, limit and miss is mirrored into the event log — the audit
//! trail is part of the contract.
//!
//! Execution/routing of the applied decision (queueing or inline-running the
//! target step) is handled by the orchestrator, not here.

use std::collections::HashMap;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::domain::{RuntimeState, StepRun, StepStatus};
use crate::errors::Result;
use crate::store::{EventContext, StepPatch, Store};

/// A loop policy: reset earlier steps to pending ("retry from here"),
/// bounded by `max_iterations` per module.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopPolicy {
    pub module_id: String,
    /// How many indices to walk back from the triggering step. Floor 1.
    pub step_back: i64,
    pub max_iterations: Option<u64>,
    pub skip_steps: Vec<i64>,
    /// Normalized (trimmed, lowercased) condition tokens. Empty allows all.
    pub conditions: Vec<String>,
    /// The record as persisted, echoed into event metadata.
    pub raw: Value,
}

/// A trigger policy: advance another step to pending when a condition holds.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerPolicy {
    pub module_id: String,
    pub trigger_agent_id: Option<String>,
    pub conditions: Vec<String>,
    pub raw: Value,
}

/// One entry of a step's policy list, parsed at the store boundary.
///
/// Deserialization is deliberately lenient: historical records spell the
/// module id as `module_id` or `id`, conditions as `condition`/`conditions`
/// (scalar, list or nested `on/reason/event/when/name` maps) and the trigger
/// target as `trigger_agent_id`/`target_agent_id`/`targetAgentId`. Records
/// with an unknown behavior are preserved verbatim and ignored by both scans.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyRecord {
    Loop(LoopPolicy),
    Trigger(TriggerPolicy),
    Other(Value),
}

impl PolicyRecord {
    pub fn from_value(value: Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::Other(value);
        };
        let behavior = obj
            .get("behavior")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();
        let conditions = normalized_conditions(obj);
        match behavior.as_str() {
            "loop" => {
                let step_back = obj
                    .get("step_back")
                    .and_then(value_as_i64)
                    .filter(|v| *v > 0)
                    .unwrap_or(1);
                let max_iterations = obj.get("max_iterations").and_then(value_as_u64);
                let skip_steps = obj
                    .get("skip_steps")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().filter_map(value_as_i64).collect())
                    .unwrap_or_default();
                Self::Loop(LoopPolicy {
                    module_id: module_id(obj, "loop"),
                    step_back,
                    max_iterations,
                    skip_steps,
                    conditions,
                    raw: value.clone(),
                })
            }
            "trigger" => {
                let trigger_agent_id = ["trigger_agent_id", "target_agent_id", "targetAgentId"]
                    .iter()
                    .find_map(|key| obj.get(*key).and_then(Value::as_str))
                    .map(str::to_string)
                    .filter(|s| !s.is_empty());
                Self::Trigger(TriggerPolicy {
                    module_id: module_id(obj, "trigger"),
                    trigger_agent_id,
                    conditions,
                    raw: value.clone(),
                })
            }
            _ => Self::Other(value),
        }
    }

    /// The record as persisted.
    pub fn raw(&self) -> &Value {
        match self {
            Self::Loop(p) => &p.raw,
            Self::Trigger(p) => &p.raw,
            Self::Other(v) => v,
        }
    }
}

impl Serialize for PolicyRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.raw().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PolicyRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(Self::from_value(Value::deserialize(deserializer)?))
    }
}

fn module_id(obj: &serde_json::Map<String, Value>, fallback: &str) -> String {
    obj.get("module_id")
        .or_else(|| obj.get("id"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn value_as_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn value_as_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Collect stringified condition tokens from `condition`, `conditions` and
/// common nested keys.
fn normalized_conditions(obj: &serde_json::Map<String, Value>) -> Vec<String> {
    let mut tokens = Vec::new();
    if let Some(v) = obj.get("condition") {
        collect_condition_tokens(v, &mut tokens);
    }
    if let Some(v) = obj.get("conditions") {
        collect_condition_tokens(v, &mut tokens);
    }
    tokens
}

fn collect_condition_tokens(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_ascii_lowercase());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_condition_tokens(item, out);
            }
        }
        Value::Object(map) => {
            for key in ["on", "reason", "event", "when", "name"] {
                if let Some(v) = map.get(key) {
                    collect_condition_tokens(v, out);
                }
            }
        }
        _ => {}
    }
}

/// Empty conditions always allow; otherwise the reason must match one token
/// case-insensitively.
fn conditions_allow(conditions: &[String], reason: &str) -> bool {
    if conditions.is_empty() {
        return true;
    }
    let reason = reason.trim().to_ascii_lowercase();
    !reason.is_empty() && conditions.iter().any(|c| *c == reason)
}

/// Result of applying a loop policy.
#[derive(Debug, Clone)]
pub struct LoopDecision {
    pub module_id: String,
    pub policy: Value,
    pub target_step_index: i64,
    pub steps_reset: Vec<i64>,
    pub iterations: u64,
    pub max_iterations: Option<u64>,
    pub runtime_state: RuntimeState,
    pub reason: String,
}

/// Result of applying a trigger policy.
#[derive(Debug, Clone)]
pub struct TriggerDecision {
    pub module_id: String,
    pub policy: Value,
    pub target_step_id: i64,
    pub target_step_index: i64,
    pub inline_depth: u32,
    pub reason: String,
}

/// Outcome of screening one policy record against the reason: either an
/// audit event to emit before moving on, or eligibility to apply.
enum Screen {
    Eligible,
    Skip {
        event_type: &'static str,
        message: String,
        metadata: Value,
    },
}

fn screen_loop_policy(step: &StepRun, policy: &LoopPolicy, reason: &str) -> Screen {
    if !conditions_allow(&policy.conditions, reason) {
        return Screen::Skip {
            event_type: "loop_condition_skipped",
            message: format!("Loop policy {} skipped; condition not met.", policy.module_id),
            metadata: json!({
                "policy": policy.raw,
                "reason": reason,
                "conditions": policy.conditions,
            }),
        };
    }
    let current = step.runtime_state.loop_count(&policy.module_id);
    if let Some(max) = policy.max_iterations
        && current >= max
    {
        return Screen::Skip {
            event_type: "loop_limit_reached",
            message: format!("Loop limit reached for module {}.", policy.module_id),
            metadata: json!({
                "policy": policy.raw,
                "iterations": current,
                "max_iterations": max,
                "reason": reason,
            }),
        };
    }
    Screen::Eligible
}

fn screen_trigger_policy(policy: &TriggerPolicy, reason: &str) -> Screen {
    if !conditions_allow(&policy.conditions, reason) {
        return Screen::Skip {
            event_type: "trigger_condition_skipped",
            message: format!(
                "Trigger policy {} skipped; condition not met.",
                policy.module_id
            ),
            metadata: json!({
                "policy": policy.raw,
                "reason": reason,
                "conditions": policy.conditions,
            }),
        };
    }
    Screen::Eligible
}

/// Compute the loop target index: walk back `step_back` indices, then keep
/// descending while the candidate is in `skip_steps`. The walk clamps at
/// zero; an index 0 that is itself in `skip_steps` is still selected.
fn loop_target_index(step_index: i64, policy: &LoopPolicy) -> i64 {
    let mut target = (step_index - policy.step_back).max(0);
    while policy.skip_steps.contains(&target) && target > 0 {
        target -= 1;
    }
    target
}

/// Apply the first eligible loop policy attached to the step.
///
/// Resets the target step range to pending, bumps the module's loop counter
/// in the triggering step's runtime state, and emits a `loop_decision` event.
/// Returns `None` when no loop policy applied.
pub async fn apply_loop_policies(
    step: &StepRun,
    store: &dyn Store,
    reason: &str,
) -> Result<Option<LoopDecision>> {
    for record in &step.policy {
        let PolicyRecord::Loop(policy) = record else {
            continue;
        };
        match screen_loop_policy(step, policy, reason) {
            Screen::Skip {
                event_type,
                message,
                metadata,
            } => {
                store
                    .append_event(
                        step.protocol_run_id,
                        event_type.to_string(),
                        message,
                        EventContext::for_step(step.id).with_metadata(metadata),
                    )
                    .await?;
                info!(
                    protocol_run_id = step.protocol_run_id,
                    step_run_id = step.id,
                    module_id = %policy.module_id,
                    reason,
                    event_type,
                    "loop policy not applied"
                );
                continue;
            }
            Screen::Eligible => {}
        }

        let decision = apply_loop(step, policy, store, reason).await?;
        return Ok(Some(decision));
    }
    Ok(None)
}

async fn apply_loop(
    step: &StepRun,
    policy: &LoopPolicy,
    store: &dyn Store,
    reason: &str,
) -> Result<LoopDecision> {
    let target_index = loop_target_index(step.step_index, policy);
    let iterations = step.runtime_state.loop_count(&policy.module_id) + 1;

    let mut new_state = step.runtime_state.clone();
    new_state
        .loop_counts
        .insert(policy.module_id.clone(), iterations);
    new_state.last_action = Some("loop_step_back".to_string());
    new_state.last_policy_module_id = Some(policy.module_id.clone());
    new_state.last_target_step_index = Some(target_index);

    let max_label = policy
        .max_iterations
        .map(|m| m.to_string())
        .unwrap_or_else(|| "∞".to_string());
    let summary = format!(
        "Looped via {} ({}/{})",
        policy.module_id, iterations, max_label
    );

    // Reset everything at or after the target, skipping excluded indices and
    // steps already cancelled. The triggering step additionally carries the
    // bumped loop counters.
    let steps = store.list_step_runs(step.protocol_run_id).await?;
    let mut steps_reset = Vec::new();
    for candidate in steps.iter().filter(|s| {
        s.step_index >= target_index
            && !policy.skip_steps.contains(&s.step_index)
            && s.status != StepStatus::Cancelled
    }) {
        let patch = StepPatch {
            summary: Some(summary.clone()),
            runtime_state: (candidate.id == step.id).then(|| new_state.clone()),
            ..StepPatch::default()
        };
        store
            .update_step_status(candidate.id, StepStatus::Pending, patch, None)
            .await?;
        steps_reset.push(candidate.step_index);
    }

    store
        .append_event(
            step.protocol_run_id,
            "loop_decision".to_string(),
            format!(
                "Looping back to step index {} via module {}.",
                target_index, policy.module_id
            ),
            EventContext::for_step(step.id).with_metadata(json!({
                "policy": policy.raw,
                "runtime_state": new_state,
                "target_step_index": target_index,
                "steps_reset": steps_reset,
                "iterations": iterations,
                "max_iterations": policy.max_iterations,
                "reason": reason,
            })),
        )
        .await?;
    info!(
        protocol_run_id = step.protocol_run_id,
        step_run_id = step.id,
        module_id = %policy.module_id,
        target_index,
        iterations,
        "loop_decision"
    );

    Ok(LoopDecision {
        module_id: policy.module_id.clone(),
        policy: policy.raw.clone(),
        target_step_index: target_index,
        steps_reset,
        iterations,
        max_iterations: policy.max_iterations,
        runtime_state: new_state,
        reason: reason.to_string(),
    })
}

/// Apply the first eligible trigger policy attached to the step.
///
/// Finds the target step by agent id (step name minus ordering prefix and
/// extension), marks it pending unless terminal, and records who triggered
/// it plus the propagated inline depth in its runtime state. Returns `None`
/// when no trigger policy applied.
pub async fn apply_trigger_policies(
    step: &StepRun,
    store: &dyn Store,
    reason: &str,
) -> Result<Option<TriggerDecision>> {
    let inline_depth = step.runtime_state.inline_trigger_depth + 1;

    let steps = store.list_step_runs(step.protocol_run_id).await?;
    // Last step wins when two share an agent id, matching insertion order.
    let mut by_agent: HashMap<&str, &StepRun> = HashMap::new();
    for s in &steps {
        by_agent.insert(s.agent_id(), s);
    }

    for record in &step.policy {
        let PolicyRecord::Trigger(policy) = record else {
            continue;
        };
        if let Screen::Skip {
            event_type,
            message,
            metadata,
        } = screen_trigger_policy(policy, reason)
        {
            store
                .append_event(
                    step.protocol_run_id,
                    event_type.to_string(),
                    message,
                    EventContext::for_step(step.id).with_metadata(metadata),
                )
                .await?;
            info!(
                protocol_run_id = step.protocol_run_id,
                step_run_id = step.id,
                module_id = %policy.module_id,
                reason,
                "trigger_condition_skipped"
            );
            continue;
        }
        let Some(target_agent) = &policy.trigger_agent_id else {
            continue;
        };

        let Some(target) = by_agent.get(target_agent.as_str()).copied() else {
            store
                .append_event(
                    step.protocol_run_id,
                    "trigger_missing_target".to_string(),
                    format!("Trigger target agent {} not found.", target_agent),
                    EventContext::for_step(step.id)
                        .with_metadata(json!({"policy": policy.raw, "reason": reason})),
                )
                .await?;
            continue;
        };

        if target.status.is_terminal() {
            store
                .append_event(
                    step.protocol_run_id,
                    "trigger_skipped".to_string(),
                    format!(
                        "Trigger skipped; target {} already terminal.",
                        target_agent
                    ),
                    EventContext::for_step(step.id).with_metadata(json!({
                        "policy": policy.raw,
                        "target_status": target.status,
                        "reason": reason,
                    })),
                )
                .await?;
            continue;
        }

        let mut new_state = target.runtime_state.clone();
        new_state.last_triggered_by = Some(step.step_name.clone());
        new_state.inline_trigger_depth = inline_depth;
        store
            .update_step_status(
                target.id,
                StepStatus::Pending,
                StepPatch {
                    summary: Some(format!("Triggered by {}", step.step_name)),
                    runtime_state: Some(new_state),
                    ..StepPatch::default()
                },
                None,
            )
            .await?;
        store
            .append_event(
                step.protocol_run_id,
                "trigger_decision".to_string(),
                format!(
                    "Triggering agent {} via policy on {}.",
                    target_agent, step.step_name
                ),
                EventContext::for_step(step.id).with_metadata(json!({
                    "policy": policy.raw,
                    "reason": reason,
                    "target_step_index": target.step_index,
                    "target_step_id": target.id,
                    "inline_depth": inline_depth,
                })),
            )
            .await?;
        info!(
            protocol_run_id = step.protocol_run_id,
            step_run_id = step.id,
            target_agent = %target_agent,
            target_index = target.step_index,
            inline_depth,
            "trigger_decision"
        );

        return Ok(Some(TriggerDecision {
            module_id: policy.module_id.clone(),
            policy: policy.raw.clone(),
            target_step_id: target.id,
            target_step_index: target.step_index,
            inline_depth,
            reason: reason.to_string(),
        }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loop_record(value: Value) -> LoopPolicy {
        match PolicyRecord::from_value(value) {
            PolicyRecord::Loop(p) => p,
            other => panic!("expected loop policy, got {:?}", other),
        }
    }

    fn step_with_state(step_index: i64, state: RuntimeState) -> StepRun {
        StepRun {
            id: 1,
            protocol_run_id: 1,
            step_index,
            step_name: format!("{:02}-step", step_index),
            step_type: "work".into(),
            status: StepStatus::Failed,
            retries: 0,
            model: None,
            engine_id: None,
            policy: Vec::new(),
            runtime_state: state,
            summary: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn parses_loop_policy_with_aliases_and_defaults() {
        let p = loop_record(json!({
            "behavior": "Loop",
            "id": "qa-loop",
            "max_iterations": 2,
            "skip_steps": [0],
        }));
        assert_eq!(p.module_id, "qa-loop");
        assert_eq!(p.step_back, 1);
        assert_eq!(p.max_iterations, Some(2));
        assert_eq!(p.skip_steps, vec![0]);
        assert!(p.conditions.is_empty());
    }

    #[test]
    fn nonpositive_step_back_floors_to_one() {
        let p = loop_record(json!({"behavior": "loop", "module_id": "m", "step_back": 0}));
        assert_eq!(p.step_back, 1);
        let p = loop_record(json!({"behavior": "loop", "module_id": "m", "step_back": -3}));
        assert_eq!(p.step_back, 1);
    }

    #[test]
    fn parses_trigger_target_aliases() {
        for key in ["trigger_agent_id", "target_agent_id", "targetAgentId"] {
            let record = PolicyRecord::from_value(json!({"behavior": "trigger", key: "qa"}));
            match record {
                PolicyRecord::Trigger(p) => assert_eq!(p.trigger_agent_id.as_deref(), Some("qa")),
                other => panic!("expected trigger, got {:?}", other),
            }
        }
    }

    #[test]
    fn unknown_behavior_is_preserved_verbatim() {
        let value = json!({"behavior": "escalate", "module_id": "x"});
        let record = PolicyRecord::from_value(value.clone());
        assert_eq!(record, PolicyRecord::Other(value.clone()));
        assert_eq!(serde_json::to_value(&record).unwrap(), value);
    }

    #[test]
    fn conditions_collected_from_nested_shapes() {
        let p = loop_record(json!({
            "behavior": "loop",
            "module_id": "m",
            "condition": " QA_Failed ",
            "conditions": [{"on": "exec_failed"}, {"when": ["Timeout"]}],
        }));
        assert_eq!(p.conditions, vec!["qa_failed", "exec_failed", "timeout"]);
    }

    #[test]
    fn empty_conditions_allow_any_reason() {
        assert!(conditions_allow(&[], "qa_failed"));
        assert!(conditions_allow(&[], ""));
    }

    #[test]
    fn condition_match_is_case_insensitive() {
        let conditions = vec!["qa_failed".to_string()];
        assert!(conditions_allow(&conditions, "QA_FAILED"));
        assert!(conditions_allow(&conditions, " qa_failed "));
        assert!(!conditions_allow(&conditions, "qa_passed"));
        assert!(!conditions_allow(&conditions, ""));
    }

    #[test]
    fn loop_target_walks_past_skip_steps() {
        let p = loop_record(json!({
            "behavior": "loop", "module_id": "m", "step_back": 1, "skip_steps": [2, 1]
        }));
        // 3 - 1 = 2, skipped; 1 skipped; lands on 0.
        assert_eq!(loop_target_index(3, &p), 0);
    }

    #[test]
    fn loop_target_clamps_at_zero_even_when_skipped() {
        // Index 0 in skip_steps still selects 0: the walk only descends
        // while target > 0.
        let p = loop_record(json!({
            "behavior": "loop", "module_id": "m", "step_back": 5, "skip_steps": [0]
        }));
        assert_eq!(loop_target_index(2, &p), 0);
    }

    #[test]
    fn screen_skips_when_condition_not_met() {
        let p = loop_record(json!({
            "behavior": "loop", "module_id": "m", "condition": "qa_failed"
        }));
        let step = step_with_state(1, RuntimeState::default());
        match screen_loop_policy(&step, &p, "exec_failed") {
            Screen::Skip { event_type, .. } => assert_eq!(event_type, "loop_condition_skipped"),
            Screen::Eligible => panic!("expected skip"),
        }
    }

    #[test]
    fn screen_reports_limit_reached_at_max_iterations() {
        let p = loop_record(json!({
            "behavior": "loop", "module_id": "qa-loop", "max_iterations": 2
        }));
        let mut state = RuntimeState::default();
        state.loop_counts.insert("qa-loop".into(), 2);
        let step = step_with_state(1, state);
        match screen_loop_policy(&step, &p, "qa_failed") {
            Screen::Skip { event_type, .. } => assert_eq!(event_type, "loop_limit_reached"),
            Screen::Eligible => panic!("expected limit skip"),
        }

        // One below the limit is still eligible.
        let mut state = RuntimeState::default();
        state.loop_counts.insert("qa-loop".into(), 1);
        let step = step_with_state(1, state);
        assert!(matches!(
            screen_loop_policy(&step, &p, "qa_failed"),
            Screen::Eligible
        ));
    }

    #[test]
    fn policy_record_round_trips_through_json() {
        let value = json!({
            "behavior": "trigger",
            "module_id": "qa-gate",
            "trigger_agent_id": "qa",
            "condition": "qa_passed",
        });
        let record: PolicyRecord = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(serde_json::to_value(&record).unwrap(), value);
    }
}
