//! Path resolution for spec-declared prompts and outputs.
//!
//! Relative paths in a protocol spec may live under the protocol root or
//! under the workspace root. Resolution tries both: for inputs the first
//! existing candidate wins, for outputs the first candidate whose parent
//! directory exists wins (the file itself may not be created yet). When no
//! candidate qualifies, the first candidate is still returned so validation
//! can report a concrete missing path.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path: drop `.` components and fold `..` into the
/// preceding component without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Candidates for an input path: protocol-root-relative first, then
/// workspace-relative. The first existing candidate wins.
pub(crate) fn resolve_path_candidates(
    path_value: &str,
    base: &Path,
    workspace: &Path,
) -> (PathBuf, Vec<PathBuf>) {
    let path = Path::new(path_value);
    if path.is_absolute() {
        return (path.to_path_buf(), vec![path.to_path_buf()]);
    }
    let mut candidates = vec![normalize(&base.join(path))];
    if workspace != base {
        candidates.push(normalize(&workspace.join(path)));
    }
    let resolved = candidates
        .iter()
        .find(|p| p.exists())
        .unwrap_or(&candidates[0])
        .clone();
    (resolved, candidates)
}

/// Resolve an output path, preferring a candidate whose parent directory
/// exists. `prefer_workspace` reverses the candidate order.
pub(crate) fn resolve_output_path(
    path_value: &str,
    base: &Path,
    workspace: &Path,
    prefer_workspace: bool,
) -> PathBuf {
    let path = Path::new(path_value);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let mut candidates = Vec::new();
    if prefer_workspace && workspace != base {
        candidates.push(normalize(&workspace.join(path)));
    }
    candidates.push(normalize(&base.join(path)));
    if !prefer_workspace && workspace != base {
        candidates.push(normalize(&workspace.join(path)));
    }
    candidates
        .iter()
        .find(|c| c.parent().is_some_and(Path::exists))
        .unwrap_or(&candidates[0])
        .clone()
}

/// Resolve a prompt or output reference from a spec value against the
/// protocol base and workspace root.
pub fn resolve_spec_path(path_value: &str, base: &Path, workspace: Option<&Path>) -> PathBuf {
    let workspace_root = workspace.unwrap_or(base);
    resolve_path_candidates(path_value, base, workspace_root).0
}

/// Resolve a step's protocol/aux output paths, falling back to the provided
/// defaults where the spec is silent. All returned paths are absolute when
/// base and workspace are.
pub fn resolve_outputs_map(
    outputs: Option<&super::OutputsSpec>,
    base: &Path,
    workspace: &Path,
    default_protocol: PathBuf,
    default_aux: HashMap<String, PathBuf>,
    prefer_workspace: bool,
) -> (PathBuf, HashMap<String, PathBuf>) {
    let mut protocol_path = default_protocol;
    let mut aux_paths = default_aux;
    if let Some(outputs) = outputs {
        if let Some(protocol_output) = &outputs.protocol {
            protocol_path = resolve_output_path(protocol_output, base, workspace, prefer_workspace);
        }
        for (key, path_value) in &outputs.aux {
            aux_paths.insert(
                key.clone(),
                resolve_output_path(path_value, base, workspace, prefer_workspace),
            );
        }
    }
    (protocol_path, aux_paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn absolute_paths_pass_through() {
        let dir = tempdir().unwrap();
        let abs = dir.path().join("prompt.md");
        let resolved = resolve_spec_path(abs.to_str().unwrap(), Path::new("/other"), None);
        assert_eq!(resolved, abs);
    }

    #[test]
    fn existing_base_candidate_wins_over_workspace() {
        let base = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        fs::write(base.path().join("prompt.md"), "x").unwrap();
        fs::write(workspace.path().join("prompt.md"), "y").unwrap();
        let resolved = resolve_spec_path("prompt.md", base.path(), Some(workspace.path()));
        assert_eq!(resolved, base.path().join("prompt.md"));
    }

    #[test]
    fn falls_back_to_workspace_when_base_missing() {
        let base = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        fs::write(workspace.path().join("prompt.md"), "y").unwrap();
        let resolved = resolve_spec_path("prompt.md", base.path(), Some(workspace.path()));
        assert_eq!(resolved, workspace.path().join("prompt.md"));
    }

    #[test]
    fn missing_everywhere_returns_first_candidate() {
        let base = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let resolved = resolve_spec_path("absent.md", base.path(), Some(workspace.path()));
        assert_eq!(resolved, base.path().join("absent.md"));
    }

    #[test]
    fn output_resolution_prefers_existing_parent() {
        let base = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        fs::create_dir_all(workspace.path().join("outputs")).unwrap();
        let resolved =
            resolve_output_path("outputs/result.md", base.path(), workspace.path(), false);
        assert_eq!(resolved, workspace.path().join("outputs/result.md"));
    }

    #[test]
    fn prefer_workspace_reverses_output_order() {
        let base = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        fs::create_dir_all(base.path().join("outputs")).unwrap();
        fs::create_dir_all(workspace.path().join("outputs")).unwrap();
        let default_order =
            resolve_output_path("outputs/result.md", base.path(), workspace.path(), false);
        assert_eq!(default_order, base.path().join("outputs/result.md"));
        let workspace_first =
            resolve_output_path("outputs/result.md", base.path(), workspace.path(), true);
        assert_eq!(workspace_first, workspace.path().join("outputs/result.md"));
    }

    #[test]
    fn outputs_map_overrides_defaults_and_keeps_the_rest() {
        let base = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        fs::create_dir_all(base.path().join("out")).unwrap();
        let mut default_aux = HashMap::new();
        default_aux.insert("notes".to_string(), base.path().join("notes.md"));
        default_aux.insert("log".to_string(), base.path().join("log.md"));
        let outputs = crate::spec::OutputsSpec {
            protocol: Some("out/result.md".into()),
            aux: HashMap::from([("log".to_string(), "out/run.log".to_string())]),
        };
        let (protocol, aux) = resolve_outputs_map(
            Some(&outputs),
            base.path(),
            workspace.path(),
            base.path().join("default.md"),
            default_aux,
            false,
        );
        assert_eq!(protocol, base.path().join("out/result.md"));
        assert_eq!(aux["log"], base.path().join("out/run.log"));
        assert_eq!(aux["notes"], base.path().join("notes.md"));
    }

    #[test]
    fn outputs_map_without_spec_returns_defaults() {
        let base = tempdir().unwrap();
        let (protocol, aux) = resolve_outputs_map(
            None,
            base.path(),
            base.path(),
            base.path().join("default.md"),
            HashMap::new(),
            false,
        );
        assert_eq!(protocol, base.path().join("default.md"));
        assert!(aux.is_empty());
    }

    #[test]
    fn normalize_folds_dot_and_dotdot() {
        assert_eq!(
            normalize(Path::new("/a/b/../c/./d.md")),
            PathBuf::from("/a/c/d.md")
        );
    }
}
