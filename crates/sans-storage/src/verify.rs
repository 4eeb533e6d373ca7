//! Bundle verifier (§4.J): recomputes `report_sha256` and every listed file
//! hash straight from bytes on disk, checks thin-bundle fingerprints
//! against any externally supplied datasource bindings, and optionally
//! compares a schema lock's hash. Trusts nothing in `report.json` except
//! as a set of claims to check.
//!
//! Grounded on `original_source/sans/sans/bundle.py`'s `verify_bundle`.

use crate::bundle;
use crate::error::StorageError;
use crate::hash;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct VerifyOutcome {
    pub ok: bool,
    pub failures: Vec<String>,
}

impl VerifyOutcome {
    /// Turns a failed outcome into a single [`StorageError::VerifyFailed`]
    /// carrying every failure joined with `"; "`, matching the CLI's
    /// one-line "failed: ..." diagnostic contract.
    pub fn into_result(self) -> Result<(), StorageError> {
        if self.ok {
            Ok(())
        } else {
            Err(StorageError::VerifyFailed(self.failures.join("; ")))
        }
    }
}

/// Verifies the bundle rooted at `bundle_root`. `external_datasource_bindings`
/// maps datasource name to a file the caller claims is the original input,
/// checked against the thin bundle's fingerprints when present.
/// `schema_lock_path`, if given, is loaded and its canonical hash compared
/// against `report.schema_lock_sha256`.
pub fn verify_bundle(
    bundle_root: &Path,
    external_datasource_bindings: &BTreeMap<String, PathBuf>,
    schema_lock_path: Option<&Path>,
) -> Result<VerifyOutcome, StorageError> {
    let mut failures = Vec::new();
    let report = bundle::read_report(bundle_root)?;

    check_report_hash(&report, &mut failures)?;
    check_entry_hashes(bundle_root, &report, &mut failures);

    if report.get("bundle_mode").and_then(Value::as_str) == Some("thin") {
        check_thin_bundle(bundle_root, &report, external_datasource_bindings, &mut failures);
    }

    if let Some(lock_path) = schema_lock_path {
        check_schema_lock(lock_path, &report, &mut failures);
    }

    Ok(VerifyOutcome { ok: failures.is_empty(), failures })
}

fn check_report_hash(report: &Value, failures: &mut Vec<String>) -> Result<(), StorageError> {
    let recomputed = bundle::compute_report_sha256(report)?;
    match report.get("report_sha256").and_then(Value::as_str) {
        Some(recorded) if recorded == recomputed => {}
        Some(recorded) => failures.push(format!(
            "report_sha256 mismatch: recorded {recorded}, recomputed {recomputed}"
        )),
        None => failures.push("report.json has no report_sha256".to_string()),
    }
    Ok(())
}

fn check_entry_hashes(bundle_root: &Path, report: &Value, failures: &mut Vec<String>) {
    for list_key in ["inputs", "artifacts", "outputs"] {
        let Some(items) = report.get(list_key).and_then(Value::as_array) else { continue };
        for item in items {
            let Some(path) = item.get("path").and_then(Value::as_str) else {
                failures.push(format!("{list_key} entry missing 'path'"));
                continue;
            };
            let Some(recorded) = item.get("sha256").and_then(Value::as_str) else {
                failures.push(format!("{list_key} entry '{path}' missing 'sha256'"));
                continue;
            };
            let full = bundle_root.join(path);
            if !full.is_file() {
                failures.push(format!("{list_key} entry '{path}' is missing on disk"));
                continue;
            }
            let actual = if list_key == "inputs" {
                hash::compute_input_hash(&full)
            } else {
                hash::compute_artifact_hash(&full)
            };
            match actual {
                Ok(actual) if actual == recorded => {}
                Ok(actual) => failures.push(format!(
                    "{list_key} entry '{path}' hash mismatch: recorded {recorded}, recomputed {actual}"
                )),
                Err(e) => failures.push(format!("{list_key} entry '{path}' could not be hashed: {e}")),
            }
        }
    }
}

fn check_thin_bundle(
    bundle_root: &Path,
    report: &Value,
    external_datasource_bindings: &BTreeMap<String, PathBuf>,
    failures: &mut Vec<String>,
) {
    let data_dir = bundle_root.join(bundle::INPUTS_DATA);
    if let Ok(mut entries) = std::fs::read_dir(&data_dir) {
        if entries.next().is_some() {
            failures.push("thin bundle must not contain files under inputs/data/".to_string());
        }
    }

    let Some(items) = report.get("datasource_inputs").and_then(Value::as_array) else { return };
    for item in items {
        let name = item.get("datasource").and_then(Value::as_str).unwrap_or("<unknown>");
        if item.get("embedded").and_then(Value::as_bool) != Some(false) {
            failures.push(format!("datasource '{name}' must have embedded=false in a thin bundle"));
        }
        let Some(recorded_sha) = item.get("sha256").and_then(Value::as_str) else {
            failures.push(format!("datasource '{name}' missing sha256 fingerprint"));
            continue;
        };
        let Some(recorded_size) = item.get("size_bytes").and_then(Value::as_u64) else {
            failures.push(format!("datasource '{name}' missing size_bytes fingerprint"));
            continue;
        };
        let Some(bound_path) = external_datasource_bindings.get(name) else { continue };
        let Ok(metadata) = std::fs::metadata(bound_path) else {
            failures.push(format!("datasource '{name}' binding '{}' is not readable", bound_path.display()));
            continue;
        };
        if metadata.len() != recorded_size {
            failures.push(format!(
                "datasource '{name}' size mismatch: fingerprint {recorded_size}, actual {}",
                metadata.len()
            ));
            continue;
        }
        match hash::compute_input_hash(bound_path) {
            Ok(actual) if actual == recorded_sha => {}
            Ok(actual) => failures.push(format!(
                "datasource '{name}' sha256 mismatch: fingerprint {recorded_sha}, actual {actual}"
            )),
            Err(e) => failures.push(format!("datasource '{name}' could not be hashed: {e}")),
        }
    }
}

fn check_schema_lock(lock_path: &Path, report: &Value, failures: &mut Vec<String>) {
    let Some(recorded) = report.get("schema_lock_sha256").and_then(Value::as_str) else {
        failures.push("report has no schema_lock_sha256 to compare against".to_string());
        return;
    };
    match sans_check::load_schema_lock(lock_path) {
        Ok(lock) => match sans_check::compute_lock_sha256(&lock) {
            Ok(actual) if actual == recorded => {}
            Ok(actual) => failures.push(format!(
                "schema lock hash mismatch: report has {recorded}, file hashes to {actual}"
            )),
            Err(e) => failures.push(format!("schema lock could not be hashed: {e}")),
        },
        Err(e) => failures.push(format!("schema lock at '{}' could not be loaded: {e}", lock_path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{ensure_bundle_layout, finalize_report, write_report, BundleMode, FileEntry, Report};
    use std::io::Write;

    fn base_report() -> Report {
        Report {
            report_schema_version: "0.3".to_string(),
            status: "ok".to_string(),
            exit_code_bucket: 0,
            primary_error: None,
            diagnostics: vec![],
            inputs: vec![],
            artifacts: vec![],
            outputs: vec![],
            datasource_inputs: vec![],
            plan_path: "inputs/source/script.sans".to_string(),
            engine: serde_json::json!({"version": "sans-rs/0.1.0"}),
            settings: serde_json::json!({}),
            timing: serde_json::json!({}),
            bundle_mode: None,
            schema_lock_sha256: None,
            schema_lock_used_path: None,
            schema_lock_emit_path: None,
            report_sha256: None,
        }
    }

    #[test]
    fn verifies_a_freshly_finalized_bundle() {
        let dir = tempfile::tempdir().unwrap();
        ensure_bundle_layout(dir.path()).unwrap();
        let out_path = dir.path().join("outputs/t.csv");
        std::fs::File::create(&out_path).unwrap().write_all(b"a\n1\n").unwrap();
        let sha = hash::compute_artifact_hash(&out_path).unwrap();

        let mut report = base_report();
        report.outputs.push(FileEntry { path: "outputs/t.csv".to_string(), name: Some("t".to_string()), sha256: sha });
        let report = finalize_report(report).unwrap();
        write_report(&report, dir.path()).unwrap();

        let outcome = verify_bundle(dir.path(), &BTreeMap::new(), None).unwrap();
        assert!(outcome.ok, "{:?}", outcome.failures);
    }

    #[test]
    fn detects_tampered_output_file() {
        let dir = tempfile::tempdir().unwrap();
        ensure_bundle_layout(dir.path()).unwrap();
        let out_path = dir.path().join("outputs/t.csv");
        std::fs::File::create(&out_path).unwrap().write_all(b"a\n1\n").unwrap();
        let sha = hash::compute_artifact_hash(&out_path).unwrap();

        let mut report = base_report();
        report.outputs.push(FileEntry { path: "outputs/t.csv".to_string(), name: Some("t".to_string()), sha256: sha });
        let report = finalize_report(report).unwrap();
        write_report(&report, dir.path()).unwrap();

        std::fs::File::create(&out_path).unwrap().write_all(b"a\n999\n").unwrap();

        let outcome = verify_bundle(dir.path(), &BTreeMap::new(), None).unwrap();
        assert!(!outcome.ok);
        assert!(outcome.failures.iter().any(|f| f.contains("hash mismatch")));
    }

    #[test]
    fn thin_bundle_rejects_nonempty_inputs_data() {
        let dir = tempfile::tempdir().unwrap();
        ensure_bundle_layout(dir.path()).unwrap();
        std::fs::write(dir.path().join("inputs/data/in.csv"), b"a\n1\n").unwrap();

        let mut report = base_report();
        report.bundle_mode = Some(BundleMode::Thin);
        let report = finalize_report(report).unwrap();
        write_report(&report, dir.path()).unwrap();

        let outcome = verify_bundle(dir.path(), &BTreeMap::new(), None).unwrap();
        assert!(!outcome.ok);
        assert!(outcome.failures.iter().any(|f| f.contains("inputs/data")));
    }

    #[test]
    fn moving_a_passing_bundle_still_verifies() {
        let dir = tempfile::tempdir().unwrap();
        ensure_bundle_layout(dir.path()).unwrap();
        let report = finalize_report(base_report()).unwrap();
        write_report(&report, dir.path()).unwrap();

        let moved = tempfile::tempdir().unwrap();
        for entry in [bundle::INPUTS_SOURCE, bundle::INPUTS_DATA, bundle::ARTIFACTS, bundle::OUTPUTS] {
            std::fs::create_dir_all(moved.path().join(entry)).unwrap();
        }
        std::fs::copy(dir.path().join("report.json"), moved.path().join("report.json")).unwrap();

        let outcome = verify_bundle(moved.path(), &BTreeMap::new(), None).unwrap();
        assert!(outcome.ok, "{:?}", outcome.failures);
    }
}
