//! End-to-end integration tests for the execution + bundling pipeline:
//! a hand-built IR (datasource -> filter -> select -> save) is validated,
//! executed against a real CSV file on disk, written into a bundle, and
//! the resulting bundle is checked with the verifier.
//!
//! The analog of `lmlang-server`'s handler-level `tests/integration_test.rs`,
//! but over the storage/runtime stack instead of the HTTP API.

use std::collections::BTreeMap;
use std::io::Write;

use indexmap::IndexMap;
use sans_core::expr::{BinOp, Expr};
use sans_core::ir::{
    ds_input, DatasourceDecl, DatasourceKind, DatasourceParams, FilterParams, IrDoc, OpParams,
    SaveParams, SelectParams, Step,
};
use sans_core::types::Literal;
use sans_core::validate::{validate_structural, ValidateOptions};
use sans_storage::bundle::{self, BundleMode, DatasourceInput, FileEntry, Report};
use sans_storage::{hash, runtime, verify};

fn write_fixture_csv(dir: &std::path::Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    path
}

/// `in` -> filter (age > 30) -> select (name, age) -> save "adults.csv"
fn adults_ir() -> IrDoc {
    let mut ir = IrDoc::new();
    ir.datasources.insert("people".to_string(), DatasourceDecl::csv("people.csv"));

    ir.steps.push(Step {
        id: "ds:people".to_string(),
        inputs: vec![],
        outputs: vec![ds_input("people")],
        params: OpParams::Datasource(DatasourceParams {
            name: "people".to_string(),
            kind: DatasourceKind::Csv,
            path: Some("people.csv".to_string()),
            columns: None,
            inline_text: None,
            inline_sha256: None,
        }),
        loc: None,
    });
    ir.steps.push(Step {
        id: "filter:adults".to_string(),
        inputs: vec![ds_input("people")],
        outputs: vec!["adults".to_string()],
        params: OpParams::Filter(FilterParams {
            predicate: Expr::binop(BinOp::Gt, Expr::col("age"), Expr::lit(Literal::Int(30))),
        }),
        loc: None,
    });
    ir.steps.push(Step {
        id: "select:adults".to_string(),
        inputs: vec!["adults".to_string()],
        outputs: vec!["adults_slim".to_string()],
        params: OpParams::Select(SelectParams::Cols { cols: vec!["name".to_string(), "age".to_string()] }),
        loc: None,
    });
    ir.steps.push(Step {
        id: "save:adults_slim".to_string(),
        inputs: vec!["adults_slim".to_string()],
        outputs: vec![],
        params: OpParams::Save(SaveParams { path: "adults.csv".to_string(), name: None }),
        loc: None,
    });
    ir
}

#[test]
fn full_pipeline_runs_and_produces_a_verifiable_bundle() {
    let work = tempfile::tempdir().unwrap();
    let csv_dir = work.path().join("csv");
    std::fs::create_dir_all(&csv_dir).unwrap();
    let people_csv = write_fixture_csv(&csv_dir, "people.csv", "name,age\nAda,36\nBob,22\nCarol,41\n");

    let ir = adults_ir();
    let validated = validate_structural(&ir, ValidateOptions::default()).expect("structural validation");

    let out_dir = work.path().join("bundle");
    bundle::ensure_bundle_layout(&out_dir).unwrap();

    let mut bindings = IndexMap::new();
    bindings.insert(ds_input("people"), people_csv.clone());

    let exec = runtime::execute_plan(&ir, &validated, &bindings, &out_dir, "csv").expect("execution");
    assert_eq!(exec.outputs.len(), 1);
    assert_eq!(exec.outputs[0].rows, 2, "only Ada and Carol are over 30");
    assert_eq!(exec.outputs[0].columns, vec!["name".to_string(), "age".to_string()]);

    let ds_sha = hash::compute_input_hash(&people_csv).unwrap();
    let ds_size = std::fs::metadata(&people_csv).unwrap().len();
    let out_rel = bundle::bundle_relative_path(&exec.outputs[0].path, &out_dir).unwrap();
    let out_sha = hash::compute_artifact_hash(&exec.outputs[0].path).unwrap();

    let report = Report {
        report_schema_version: "0.3".to_string(),
        status: "ok".to_string(),
        exit_code_bucket: 0,
        primary_error: None,
        diagnostics: vec![],
        inputs: vec![],
        artifacts: vec![],
        outputs: vec![FileEntry { path: out_rel, name: Some("adults_slim".to_string()), sha256: out_sha }],
        datasource_inputs: vec![DatasourceInput {
            datasource: "people".to_string(),
            path: None,
            sha256: ds_sha,
            size_bytes: ds_size,
            embedded: false,
        }],
        plan_path: "inputs/source/script.sans".to_string(),
        engine: serde_json::json!({"version": sans_core::ENGINE_VERSION}),
        settings: serde_json::json!({"bundle_mode": "thin"}),
        timing: serde_json::json!({}),
        bundle_mode: Some(BundleMode::Thin),
        schema_lock_sha256: None,
        schema_lock_used_path: None,
        schema_lock_emit_path: None,
        report_sha256: None,
    };
    let report = bundle::finalize_report(report).unwrap();
    bundle::write_report(&report, &out_dir).unwrap();

    let mut external_bindings = BTreeMap::new();
    external_bindings.insert("people".to_string(), people_csv);
    let outcome = verify::verify_bundle(&out_dir, &external_bindings, None).unwrap();
    assert!(outcome.ok, "verification failures: {:?}", outcome.failures);
}

#[test]
fn tampering_with_an_output_after_the_fact_is_caught_by_verify() {
    let work = tempfile::tempdir().unwrap();
    let csv_dir = work.path().join("csv");
    std::fs::create_dir_all(&csv_dir).unwrap();
    let people_csv = write_fixture_csv(&csv_dir, "people.csv", "name,age\nAda,36\n");

    let ir = adults_ir();
    let validated = validate_structural(&ir, ValidateOptions::default()).unwrap();

    let out_dir = work.path().join("bundle");
    bundle::ensure_bundle_layout(&out_dir).unwrap();
    let mut bindings = IndexMap::new();
    bindings.insert(ds_input("people"), people_csv);

    let exec = runtime::execute_plan(&ir, &validated, &bindings, &out_dir, "csv").unwrap();
    let out_sha = hash::compute_artifact_hash(&exec.outputs[0].path).unwrap();
    let out_rel = bundle::bundle_relative_path(&exec.outputs[0].path, &out_dir).unwrap();

    let report = Report {
        report_schema_version: "0.3".to_string(),
        status: "ok".to_string(),
        exit_code_bucket: 0,
        primary_error: None,
        diagnostics: vec![],
        inputs: vec![],
        artifacts: vec![],
        outputs: vec![FileEntry { path: out_rel, name: Some("adults_slim".to_string()), sha256: out_sha }],
        datasource_inputs: vec![],
        plan_path: "inputs/source/script.sans".to_string(),
        engine: serde_json::json!({"version": sans_core::ENGINE_VERSION}),
        settings: serde_json::json!({}),
        timing: serde_json::json!({}),
        bundle_mode: None,
        schema_lock_sha256: None,
        schema_lock_used_path: None,
        schema_lock_emit_path: None,
        report_sha256: None,
    };
    let report = bundle::finalize_report(report).unwrap();
    bundle::write_report(&report, &out_dir).unwrap();

    std::fs::write(&exec.outputs[0].path, "name,age\nTampered,1\n").unwrap();

    let outcome = verify::verify_bundle(&out_dir, &BTreeMap::new(), None).unwrap();
    assert!(!outcome.ok);
    assert!(outcome.failures.iter().any(|f| f.contains("hash mismatch")));
}
