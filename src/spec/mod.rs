//! Protocol/step specification: typed model, schema validation and the
//! pre-flight path checks that gate execution.
//!
//! A protocol's declarative spec is persisted inside
//! `ProtocolRun.template_config` under [`PROTOCOL_SPEC_KEY`]; validation
//! metadata lives next to it under [`SPEC_META_KEY`]. Validation functions
//! return error lists rather than failing on the first problem, so an
//! operator sees every broken path at once.

pub mod resolver;

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use chrono::Utc;
use glob::glob;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::domain::StepStatus;
use crate::errors::Result;
use crate::policy::PolicyRecord;
use crate::store::{NewStepRun, Store};

pub use resolver::{resolve_outputs_map, resolve_spec_path};

/// Key inside `protocol_run.template_config` holding the normalized spec.
pub const PROTOCOL_SPEC_KEY: &str = "protocol_spec";
/// Key inside `protocol_run.template_config` holding validation metadata.
pub const SPEC_META_KEY: &str = "spec_meta";

/// Structural schema for a protocol spec (Draft 7). Kept inline so the
/// validator needs no files on disk.
const PROTOCOL_SPEC_SCHEMA: &str = r##"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "ProtocolSpec",
  "type": "object",
  "required": ["steps"],
  "properties": {
    "steps": {
      "type": "array",
      "items": {
        "type": "object",
        "anyOf": [
          {"required": ["name"]},
          {"required": ["id"]}
        ],
        "properties": {
          "id": {"type": "string"},
          "name": {"type": "string"},
          "engine_id": {"type": ["string", "null"]},
          "model": {"type": ["string", "null"]},
          "prompt_ref": {"type": ["string", "null"]},
          "step_type": {"type": "string", "enum": ["setup", "work", "qa"]},
          "order": {"type": "integer", "minimum": 0},
          "description": {"type": ["string", "null"]},
          "policies": {"type": "array", "items": {"type": "object"}},
          "outputs": {
            "type": "object",
            "properties": {
              "protocol": {"type": ["string", "null"]},
              "aux": {
                "type": "object",
                "additionalProperties": {"type": "string"}
              }
            }
          },
          "qa": {
            "type": "object",
            "properties": {
              "policy": {"type": ["string", "null"]},
              "prompt": {"type": ["string", "null"]}
            }
          }
        }
      }
    },
    "placeholders": {"type": "object"},
    "template": {"type": ["string", "null"]}
  }
}"##;

fn schema_validator() -> &'static std::result::Result<jsonschema::Validator, String> {
    static VALIDATOR: OnceLock<std::result::Result<jsonschema::Validator, String>> =
        OnceLock::new();
    VALIDATOR.get_or_init(|| {
        let schema: Value = serde_json::from_str(PROTOCOL_SPEC_SCHEMA)
            .map_err(|e| format!("schema: {e}"))?;
        jsonschema::validator_for(&schema).map_err(|e| format!("schema: {e}"))
    })
}

/// Output destinations declared by a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputsSpec {
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub aux: HashMap<String, String>,
}

/// QA configuration for a step. Policy `"skip"` disables the QA phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QaSpec {
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

impl QaSpec {
    pub fn is_skip(&self) -> bool {
        self.policy.as_deref().is_some_and(|p| p.eq_ignore_ascii_case("skip"))
    }
}

/// One step of a protocol spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub engine_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt_ref: Option<String>,
    #[serde(default)]
    pub outputs: Option<OutputsSpec>,
    #[serde(default)]
    pub step_type: Option<String>,
    #[serde(default)]
    pub policies: Vec<PolicyRecord>,
    #[serde(default)]
    pub qa: Option<QaSpec>,
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl StepSpec {
    /// Display name: `name`, falling back to `id`.
    pub fn step_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or("(unknown)")
    }

    pub fn qa_is_skip(&self) -> bool {
        self.qa.as_ref().is_some_and(QaSpec::is_skip)
    }
}

/// A full protocol spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolSpec {
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholders: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Stable short fingerprint of a spec: SHA-256 over the canonical compact
/// JSON rendering (object keys sorted), truncated to 12 hex characters.
/// Field order in the input never changes the hash.
pub fn protocol_spec_hash(spec: &Value) -> String {
    // serde_json maps are BTreeMap-backed, so re-encoding sorts keys.
    let canonical = spec.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..12].to_string()
}

/// Classify a step by its name: `00-` prefixed or setup-flavored names are
/// setup, QA-flavored names are qa, everything else is work.
pub fn infer_step_type_from_name(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower.starts_with("00-") || lower.contains("setup") {
        "setup"
    } else if lower.contains("qa") {
        "qa"
    } else {
        "work"
    }
}

/// Retrieve the spec entry for a step name from a protocol's
/// `template_config`. Returns `None` when no spec is stored or the step is
/// not declared.
pub fn get_step_spec(template_config: Option<&Value>, step_name: &str) -> Option<StepSpec> {
    let spec = template_config?.get(PROTOCOL_SPEC_KEY)?;
    let steps = spec.get("steps")?.as_array()?;
    for step in steps {
        let name = step
            .get("name")
            .or_else(|| step.get("id"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if name == step_name {
            return serde_json::from_value(step.clone()).ok();
        }
    }
    None
}

/// Validate prompt and output paths for one step. Relative paths are tried
/// against both the protocol base and the workspace root. Returns an error
/// list; empty means valid.
pub fn validate_step_spec_paths(
    base: &Path,
    step: &StepSpec,
    workspace: Option<&Path>,
) -> Vec<String> {
    let workspace_root = workspace.unwrap_or(base);
    let mut errors = Vec::new();

    match &step.prompt_ref {
        Some(prompt_ref) => {
            let (resolved, _) = resolver::resolve_path_candidates(prompt_ref, base, workspace_root);
            if !resolved.exists() {
                errors.push(format!("prompt_ref missing: {}", resolved.display()));
            }
        }
        None => {
            let default_prompt = base.join(step.step_name());
            if !default_prompt.exists() {
                errors.push(format!("prompt_ref missing: {}", default_prompt.display()));
            }
        }
    }

    if let Some(outputs) = &step.outputs {
        if let Some(protocol_output) = &outputs.protocol {
            let path =
                resolver::resolve_output_path(protocol_output, base, workspace_root, false);
            if !path.parent().is_some_and(Path::exists) {
                errors.push(format!(
                    "output parent missing: {}",
                    path.parent().unwrap_or(&path).display()
                ));
            }
        }
        for (key, path_value) in &outputs.aux {
            let path = resolver::resolve_output_path(path_value, base, workspace_root, false);
            if !path.parent().is_some_and(Path::exists) {
                errors.push(format!(
                    "output parent missing ({}): {}",
                    key,
                    path.parent().unwrap_or(&path).display()
                ));
            }
        }
    }
    errors
}

/// Validate a whole protocol spec: JSON-Schema structure first, then path
/// checks per step. Never fails; every problem becomes one list entry.
pub fn validate_protocol_spec(
    base: &Path,
    spec: &Value,
    workspace: Option<&Path>,
) -> Vec<String> {
    if !spec.is_object() {
        return vec!["protocol spec missing or malformed".to_string()];
    }
    let mut errors = Vec::new();

    match schema_validator() {
        Ok(validator) => {
            for err in validator.iter_errors(spec) {
                let location = err.instance_path().to_string();
                let location = location.trim_start_matches('/');
                let location = if location.is_empty() { "(root)" } else { location };
                errors.push(format!("schema:{}: {}", location, err));
            }
        }
        Err(e) => errors.push(e.clone()),
    }

    let Some(steps) = spec.get("steps").and_then(Value::as_array) else {
        errors.push("protocol spec steps must be a list".to_string());
        return errors;
    };
    for step in steps {
        let parsed: StepSpec = match serde_json::from_value(step.clone()) {
            Ok(s) => s,
            Err(e) => {
                errors.push(format!("step malformed: {e}"));
                continue;
            }
        };
        let name = parsed.step_name().to_string();
        for e in validate_step_spec_paths(base, &parsed, workspace) {
            errors.push(format!("{name}: {e}"));
        }
    }
    errors
}

/// Persist spec validation metadata on the protocol's `template_config` so
/// later reads do not have to scan the event log. Returns the updated
/// config.
pub async fn update_spec_meta(
    store: &dyn Store,
    protocol_run_id: i64,
    template_config: Option<Value>,
    template_source: Option<Value>,
    status: &str,
    errors: &[String],
) -> Result<Value> {
    let mut config = match template_config {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let mut meta = match config.get(SPEC_META_KEY) {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    meta.insert("status".to_string(), json!(status));
    meta.insert("errors".to_string(), json!(errors));
    meta.insert("validated_at".to_string(), json!(Utc::now().to_rfc3339()));
    if let Some(spec) = config.get(PROTOCOL_SPEC_KEY) {
        meta.insert("spec_hash".to_string(), json!(protocol_spec_hash(spec)));
    }
    config.insert(SPEC_META_KEY.to_string(), Value::Object(meta));

    let config = Value::Object(config);
    store
        .update_protocol_template(protocol_run_id, Some(config.clone()), template_source)
        .await?;
    Ok(config)
}

/// Build a protocol spec from numbered step files (`NN-*.md`) under the
/// protocol root, ordered by file name.
pub fn build_spec_from_step_files(
    protocol_root: &Path,
    default_engine_id: &str,
    default_qa_policy: &str,
    default_qa_prompt: &str,
) -> Result<ProtocolSpec> {
    let pattern = protocol_root.join("*.md");
    let pattern = pattern.to_string_lossy();
    let mut files: Vec<_> = glob(&pattern)
        .map_err(|e| crate::errors::OrchestratorError::Validation(format!(
            "bad step file pattern {pattern}: {e}"
        )))?
        .filter_map(|entry| entry.ok())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.len() >= 2 && n[..2].chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();

    let steps = files
        .iter()
        .enumerate()
        .map(|(idx, path)| {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let stem = path
                .file_stem()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            StepSpec {
                id: Some(stem),
                name: Some(file_name.clone()),
                engine_id: Some(default_engine_id.to_string()),
                model: None,
                prompt_ref: Some(path.to_string_lossy().into_owned()),
                outputs: Some(OutputsSpec {
                    protocol: Some(path.to_string_lossy().into_owned()),
                    aux: HashMap::new(),
                }),
                step_type: Some(infer_step_type_from_name(&file_name).to_string()),
                policies: Vec::new(),
                qa: Some(QaSpec {
                    policy: Some(default_qa_policy.to_string()),
                    prompt: Some(default_qa_prompt.to_string()),
                }),
                order: Some(idx as i64),
                description: None,
            }
        })
        .collect();
    Ok(ProtocolSpec {
        steps,
        placeholders: None,
        template: None,
    })
}

/// Materialize step runs from a spec, skipping names already present.
/// Returns the number of steps created.
pub async fn create_steps_from_spec(
    store: &dyn Store,
    protocol_run_id: i64,
    spec: &ProtocolSpec,
    existing_names: &std::collections::HashSet<String>,
) -> Result<u32> {
    let mut created = 0;
    for (idx, step) in spec.steps.iter().enumerate() {
        let step_name = match (step.name.as_deref(), step.id.as_deref()) {
            (Some(name), _) if !name.is_empty() => name.to_string(),
            (_, Some(id)) if !id.is_empty() => id.to_string(),
            _ => format!("{idx:02}-step"),
        };
        if existing_names.contains(&step_name) {
            continue;
        }
        let step_type = step
            .step_type
            .clone()
            .unwrap_or_else(|| infer_step_type_from_name(&step_name).to_string());
        store
            .create_step_run(NewStepRun {
                protocol_run_id,
                step_index: idx as i64,
                step_name,
                step_type,
                status: StepStatus::Pending,
                model: step.model.clone(),
                engine_id: step.engine_id.clone(),
                retries: 0,
                summary: step.description.clone(),
                policy: step.policies.clone(),
            })
            .await?;
        created += 1;
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn hash_is_field_order_independent_and_short() {
        let a = json!({"steps": [{"name": "00-main", "engine_id": "codex"}]});
        let b: Value =
            serde_json::from_str(r#"{"steps":[{"engine_id":"codex","name":"00-main"}]}"#).unwrap();
        assert_eq!(protocol_spec_hash(&a), protocol_spec_hash(&b));
        assert_eq!(protocol_spec_hash(&a).len(), 12);
        assert_ne!(protocol_spec_hash(&a), protocol_spec_hash(&json!({})));
    }

    #[test]
    fn step_type_inference() {
        assert_eq!(infer_step_type_from_name("00-bootstrap.md"), "setup");
        assert_eq!(infer_step_type_from_name("03-env-setup.md"), "setup");
        assert_eq!(infer_step_type_from_name("02-qa-review.md"), "qa");
        assert_eq!(infer_step_type_from_name("01-implement.md"), "work");
    }

    #[test]
    fn get_step_spec_matches_name_or_id() {
        let config = json!({
            PROTOCOL_SPEC_KEY: {
                "steps": [
                    {"id": "main", "name": "00-main.md", "engine_id": "codex"},
                    {"id": "qa"},
                ]
            }
        });
        let by_name = get_step_spec(Some(&config), "00-main.md").unwrap();
        assert_eq!(by_name.engine_id.as_deref(), Some("codex"));
        let by_id = get_step_spec(Some(&config), "qa").unwrap();
        assert_eq!(by_id.id.as_deref(), Some("qa"));
        assert!(get_step_spec(Some(&config), "missing").is_none());
        assert!(get_step_spec(None, "00-main.md").is_none());
    }

    #[test]
    fn schema_validation_reports_paths() {
        let dir = tempdir().unwrap();
        let errors = validate_protocol_spec(dir.path(), &json!({"steps": "nope"}), None);
        assert!(errors.iter().any(|e| e.starts_with("schema:steps:")), "{errors:?}");
        assert!(errors.iter().any(|e| e == "protocol spec steps must be a list"));
    }

    #[test]
    fn non_object_spec_is_malformed() {
        let errors = validate_protocol_spec(Path::new("/tmp"), &json!(null), None);
        assert_eq!(errors, vec!["protocol spec missing or malformed".to_string()]);
    }

    #[test]
    fn path_validation_reports_missing_prompt_and_output_parent() {
        let dir = tempdir().unwrap();
        let step = StepSpec {
            name: Some("00-main.md".into()),
            prompt_ref: Some("prompts/main.md".into()),
            outputs: Some(OutputsSpec {
                protocol: Some("out/result.md".into()),
                aux: HashMap::new(),
            }),
            ..StepSpec::default()
        };
        let errors = validate_step_spec_paths(dir.path(), &step, None);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("prompt_ref missing:"));
        assert!(errors[1].starts_with("output parent missing:"));

        fs::create_dir_all(dir.path().join("prompts")).unwrap();
        fs::write(dir.path().join("prompts/main.md"), "p").unwrap();
        fs::create_dir_all(dir.path().join("out")).unwrap();
        assert!(validate_step_spec_paths(dir.path(), &step, None).is_empty());
    }

    #[test]
    fn valid_spec_produces_no_errors() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("00-main.md"), "prompt").unwrap();
        let spec = json!({
            "steps": [{"name": "00-main.md", "prompt_ref": "00-main.md"}]
        });
        assert!(validate_protocol_spec(dir.path(), &spec, None).is_empty());
    }

    #[test]
    fn builds_spec_from_numbered_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("01-impl.md"), "b").unwrap();
        fs::write(dir.path().join("00-setup.md"), "a").unwrap();
        fs::write(dir.path().join("notes.md"), "ignored").unwrap();
        let spec =
            build_spec_from_step_files(dir.path(), "codex", "full", "prompts/qa.md").unwrap();
        assert_eq!(spec.steps.len(), 2);
        assert_eq!(spec.steps[0].name.as_deref(), Some("00-setup.md"));
        assert_eq!(spec.steps[0].step_type.as_deref(), Some("setup"));
        assert_eq!(spec.steps[0].order, Some(0));
        assert_eq!(spec.steps[1].name.as_deref(), Some("01-impl.md"));
        assert_eq!(spec.steps[1].step_type.as_deref(), Some("work"));
    }

    #[test]
    fn qa_skip_detection_is_case_insensitive() {
        let step: StepSpec =
            serde_json::from_value(json!({"name": "x", "qa": {"policy": "Skip"}})).unwrap();
        assert!(step.qa_is_skip());
        let step: StepSpec =
            serde_json::from_value(json!({"name": "x", "qa": {"policy": "full"}})).unwrap();
        assert!(!step.qa_is_skip());
    }
}
