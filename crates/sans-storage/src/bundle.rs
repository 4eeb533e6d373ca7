//! Bundle layout, path canonicalization, and the report shape, grounded on
//! `original_source/sans/sans/bundle.py` and `hash_utils.py`'s
//! `canonicalize_report`/`compute_report_sha256`.
//!
//! All report paths are bundle-relative, forward-slash only; a path that
//! would resolve outside the bundle is refused rather than silently
//! recorded, because the report is a reproducibility artifact and must
//! never leak host filesystem layout.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const INPUTS_SOURCE: &str = "inputs/source";
pub const INPUTS_DATA: &str = "inputs/data";
pub const ARTIFACTS: &str = "artifacts";
pub const OUTPUTS: &str = "outputs";

/// Creates the four standard bundle subdirectories, idempotently.
pub fn ensure_bundle_layout(out_dir: &Path) -> Result<(), StorageError> {
    for sub in [INPUTS_SOURCE, INPUTS_DATA, ARTIFACTS, OUTPUTS] {
        std::fs::create_dir_all(out_dir.join(sub)).map_err(|e| StorageError::Io(e.to_string()))?;
    }
    Ok(())
}

/// Returns `physical_path` as a bundle-relative, forward-slash path.
/// Refuses if `physical_path` does not resolve under `bundle_root`.
pub fn bundle_relative_path(physical_path: &Path, bundle_root: &Path) -> Result<String, StorageError> {
    let physical = canonicalize_best_effort(physical_path);
    let root = canonicalize_best_effort(bundle_root);
    let rel = physical.strip_prefix(&root).map_err(|_| StorageError::PathEscapesBundle {
        path: physical.display().to_string(),
        bundle_root: root.display().to_string(),
    })?;
    Ok(rel.to_string_lossy().replace('\\', "/"))
}

/// `dunce`-free best-effort canonicalization: falls back to the
/// as-given path (with `.`/`..` lexically normalized) when the path
/// doesn't exist yet, since report entries are often computed before the
/// artifact is written.
fn canonicalize_best_effort(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| lexical_normalize(path))
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolves a `save` step's path under `outputs_base`, rejecting absolute
/// paths, `..` traversal, and any resolution that escapes the bundle or
/// `outputs/` specifically — two distinct failure modes, grounded on
/// `bundle.py::validate_save_path_under_outputs` checking both
/// independently.
pub fn validate_save_path_under_outputs(
    path: &str,
    outputs_base: &Path,
    bundle_root: &Path,
) -> Result<PathBuf, StorageError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(StorageError::SavePathEmpty);
    }
    let rel = Path::new(trimmed);
    if rel.is_absolute() {
        return Err(StorageError::SavePathAbsolute(trimmed.to_string()));
    }
    if rel.components().any(|c| c == std::path::Component::ParentDir) {
        return Err(StorageError::SavePathTraversal(trimmed.to_string()));
    }
    let resolved = lexical_normalize(&outputs_base.join(rel));
    let bundle_root = canonicalize_best_effort(bundle_root);
    let outputs_base = canonicalize_best_effort(outputs_base);
    if resolved.strip_prefix(&bundle_root).is_err() {
        return Err(StorageError::PathEscapesBundle {
            path: trimmed.to_string(),
            bundle_root: bundle_root.display().to_string(),
        });
    }
    if resolved.strip_prefix(&outputs_base).is_err() {
        return Err(StorageError::PathEscapesOutputs { path: trimmed.to_string() });
    }
    Ok(resolved)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleMode {
    Full,
    Thin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasourceInput {
    pub datasource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub sha256: String,
    pub size_bytes: u64,
    pub embedded: bool,
}

/// The `report.json` shape (`report_schema_version: "0.3"`). Built
/// incrementally, then hashed and closed off by [`finalize_report`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub report_schema_version: String,
    pub status: String,
    pub exit_code_bucket: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_error: Option<Value>,
    #[serde(default)]
    pub diagnostics: Vec<Value>,
    #[serde(default)]
    pub inputs: Vec<FileEntry>,
    #[serde(default)]
    pub artifacts: Vec<FileEntry>,
    #[serde(default)]
    pub outputs: Vec<FileEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datasource_inputs: Vec<DatasourceInput>,
    pub plan_path: String,
    pub engine: Value,
    pub settings: Value,
    pub timing: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_mode: Option<BundleMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_lock_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_lock_used_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_lock_emit_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_sha256: Option<String>,
}

const SELF_HASH_KEYS: &[&str] = &["report_sha256", "report_hash"];
const DIAGNOSTIC_ONLY_KEYS: &[&str] = &["schema_lock_used_path", "schema_lock_emit_path"];

/// Deep-canonicalizes `report` for hashing: strips self-hash fields,
/// drops host-specific diagnostic-only keys once `bundle_mode` is set
/// (v2 bundles), and sorts `inputs`/`artifacts`/`outputs` by path (and
/// `datasource_inputs` by datasource name) so `report_sha256` is stable
/// regardless of the order entries were appended in.
fn canonicalize_report_value(value: &Value, skip_diagnostic: bool) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                if SELF_HASH_KEYS.contains(&key.as_str()) {
                    continue;
                }
                if skip_diagnostic && DIAGNOSTIC_ONLY_KEYS.contains(&key.as_str()) {
                    continue;
                }
                out.insert(key.clone(), canonicalize_report_value(item, skip_diagnostic));
            }
            for list_key in ["inputs", "artifacts", "outputs"] {
                if let Some(Value::Array(items)) = out.get_mut(list_key) {
                    items.sort_by_key(|v| {
                        let path = v.get("path").and_then(Value::as_str).unwrap_or("").to_string();
                        let name = v.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                        (path, name)
                    });
                }
            }
            if let Some(Value::Array(items)) = out.get_mut("datasource_inputs") {
                items.sort_by_key(|v| v.get("datasource").and_then(Value::as_str).unwrap_or("").to_string());
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| canonicalize_report_value(v, skip_diagnostic)).collect()),
        other => other.clone(),
    }
}

pub fn canonicalize_report(report: &Value) -> Value {
    let skip_diagnostic = report.get("bundle_mode").is_some();
    canonicalize_report_value(report, skip_diagnostic)
}

pub fn compute_report_sha256(report: &Value) -> Result<String, StorageError> {
    let canonical = canonicalize_report(report);
    sans_core::canon::canonical_sha256(&canonical).map_err(StorageError::Core)
}

/// Serializes `report`, computes `report_sha256` over the canonicalized
/// payload (with `report_sha256` itself excluded), and returns the closed
/// report with the hash filled in.
pub fn finalize_report(mut report: Report) -> Result<Report, StorageError> {
    report.report_sha256 = None;
    let value = serde_json::to_value(&report).map_err(|e| StorageError::Io(e.to_string()))?;
    let hash = compute_report_sha256(&value)?;
    report.report_sha256 = Some(hash);
    Ok(report)
}

pub fn write_report(report: &Report, bundle_root: &Path) -> Result<(), StorageError> {
    let text = serde_json::to_string_pretty(report).map_err(|e| StorageError::Io(e.to_string()))?;
    std::fs::write(bundle_root.join("report.json"), text).map_err(|e| StorageError::Io(e.to_string()))
}

pub fn read_report(bundle_root: &Path) -> Result<Value, StorageError> {
    let text = std::fs::read_to_string(bundle_root.join("report.json")).map_err(|e| StorageError::Io(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| StorageError::Io(e.to_string()))
}

/// Builds the `name -> sha256` map needed to recompute every entry in
/// `inputs`/`artifacts`/`outputs` against files on disk, keyed by the
/// bundle-relative path recorded in the report.
pub fn collect_entry_hashes(entries: &[FileEntry]) -> BTreeMap<&str, &str> {
    entries.iter().map(|e| (e.path.as_str(), e.sha256.as_str())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_path_rejects_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = dir.path().join(OUTPUTS);
        std::fs::create_dir_all(&outputs).unwrap();
        let err = validate_save_path_under_outputs("/etc/passwd", &outputs, dir.path()).unwrap_err();
        assert!(matches!(err, StorageError::SavePathAbsolute(_)));
    }

    #[test]
    fn save_path_rejects_traversal_out_of_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = dir.path().join(OUTPUTS);
        std::fs::create_dir_all(&outputs).unwrap();
        let err = validate_save_path_under_outputs("../artifacts/x.csv", &outputs, dir.path()).unwrap_err();
        assert!(matches!(err, StorageError::SavePathTraversal(_)));
    }

    #[test]
    fn save_path_accepts_nested_subpath() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = dir.path().join(OUTPUTS);
        std::fs::create_dir_all(outputs.join("sub")).unwrap();
        let resolved = validate_save_path_under_outputs("sub/t.csv", &outputs, dir.path()).unwrap();
        assert!(resolved.ends_with("sub/t.csv") || resolved.to_string_lossy().ends_with("sub\\t.csv"));
    }

    #[test]
    fn report_sha256_excludes_its_own_field() {
        let report = serde_json::json!({"status": "ok", "report_sha256": "stale"});
        let canonical = canonicalize_report(&report);
        assert!(canonical.get("report_sha256").is_none());
    }

    #[test]
    fn report_canonicalization_sorts_artifact_lists_by_path() {
        let report = serde_json::json!({
            "artifacts": [{"path": "b.json", "sha256": "x"}, {"path": "a.json", "sha256": "y"}]
        });
        let canonical = canonicalize_report(&report);
        let arr = canonical["artifacts"].as_array().unwrap();
        assert_eq!(arr[0]["path"], "a.json");
    }
}
