//! The amendment engine: a transactional, deep-copy-mutate-validate-or-discard
//! mutation of a `sans.ir` document driven by a declarative request, plus the
//! structural/assertion diffs and diagnostics payload every mutation reports
//! back. Grounded throughout on
//! `original_source/sans/sans/amendment/{apply,diff,schemas}.py`.

pub mod diff;
pub mod engine;
pub mod error;
pub mod request;
pub mod rfc6901;

pub use diff::{AssertionDiff, Diagnostics, StructuralDiff};
pub use engine::{apply_amendment, MutationResult, MutationStatus};
pub use error::AmendError;
pub use request::{AmendOp, AmendmentRequest, Policy};

use indexmap::IndexMap;
use sans_core::ir::IrDoc;
use sans_core::{validate_structural, ValidateOptions};
use sans_check::typecheck::SchemaEnv;

/// Builds the per-datasource starting schema `sans_check::propagate_schemas`
/// needs from the typed `column_types` a [`sans_core::ir::DatasourceDecl`]
/// may already carry (e.g. from a loaded schema lock). Datasources with no
/// declared column types propagate as an empty environment, same as
/// `propagate_schemas` falls back to for any name it doesn't recognize.
fn datasource_schema_env(ir: &IrDoc) -> IndexMap<String, SchemaEnv> {
    ir.datasources
        .iter()
        .map(|(name, decl)| {
            let env: SchemaEnv = decl
                .column_types
                .as_ref()
                .map(|types| types.iter().map(|(c, t)| (c.clone(), *t)).collect())
                .unwrap_or_default();
            (name.clone(), env)
        })
        .collect()
}

/// Applies `request` to `ir_in` and, if the mutation succeeds structurally,
/// also re-runs the same schema propagation `sans-check` performs at ingress
/// (§4.D) over the mutated IR. An amendment that type-checks structurally
/// but produces a column-type error (an `edit_expr` that turns a numeric
/// comparison into a string one, say) is refused with `E_AMEND_IR_INVALID`
/// rather than silently handed back to the caller.
pub fn apply_amendment_checked(ir_in: &IrDoc, request: &AmendmentRequest) -> MutationResult {
    let result = apply_amendment(ir_in, request);
    if result.status != MutationStatus::Ok {
        return result;
    }
    let ir_out = result
        .ir_out
        .as_ref()
        .expect("MutationStatus::Ok always carries ir_out");

    let validated = match validate_structural(ir_out, ValidateOptions::default()) {
        Ok(v) => v,
        Err(e) => return check_refusal(e.code(), e.to_string()),
    };
    let ds_schemas = datasource_schema_env(ir_out);
    if let Err(e) = sans_check::propagate_schemas(ir_out, &validated, &ds_schemas) {
        return check_refusal(e.code(), e.to_string());
    }
    result
}

fn check_refusal(code: &str, message: String) -> MutationResult {
    let refusal = serde_json::json!({"code": "E_AMEND_IR_INVALID", "message": format!("{code}: {message}")});
    MutationResult {
        status: MutationStatus::Refused,
        ir_out: None,
        diff_structural: None,
        diff_assertions: None,
        diagnostics: diff::build_diagnostics("refused", vec![refusal], vec![]),
    }
}

/// Renders the mutated IR back to native `.sans` source, for amendment
/// previews and audit trails. Thin re-export of the shared printer so
/// callers don't need a direct `sans-frontend` dependency just for this.
pub fn print_amended(ir: &IrDoc) -> String {
    sans_frontend::print_ir(ir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Policy, StepSelectorFlat};
    use sans_core::expr::Expr;
    use sans_core::ir::{ds_input, DatasourceDecl, DatasourceKind, DatasourceParams, OpParams, SaveParams, Step};

    fn ir_with_typed_datasource() -> IrDoc {
        let mut ir = IrDoc::new();
        let mut decl = DatasourceDecl::csv("in.csv");
        let mut types = indexmap::IndexMap::new();
        types.insert("a".to_string(), sans_core::Type::Int);
        decl.column_types = Some(types);
        ir.datasources.insert("in".to_string(), decl);
        ir.steps.push(Step {
            id: "ds:in".to_string(),
            inputs: vec![],
            outputs: vec![ds_input("in")],
            params: OpParams::Datasource(DatasourceParams {
                name: "in".to_string(),
                kind: DatasourceKind::Csv,
                path: Some("in.csv".to_string()),
                columns: None,
                inline_text: None,
                inline_sha256: None,
            }),
            loc: None,
        });
        ir.steps.push(Step {
            id: "out:t".to_string(),
            inputs: vec![ds_input("in")],
            outputs: vec!["t".to_string()],
            params: OpParams::Identity(sans_core::ir::IdentityParams {}),
            loc: None,
        });
        ir.steps.push(Step {
            id: "out:t:save".to_string(),
            inputs: vec!["t".to_string()],
            outputs: vec![],
            params: OpParams::Save(SaveParams { path: "t.csv".to_string(), name: None }),
            loc: None,
        });
        ir
    }

    #[test]
    fn checked_apply_rejects_unknown_column_after_mutation() {
        let ir = ir_with_typed_datasource();
        let op = AmendOp::ReplaceStep {
            op_id: "op1".to_string(),
            selector: StepSelectorFlat { step_id: Some("out:t".to_string()), transform_id: None, table: None },
            op: "select".to_string(),
            params: serde_json::json!({"cols": ["ghost"]}),
            preserve_wiring: None,
        };
        let request = AmendmentRequest {
            format: "sans.amendment_request".to_string(),
            version: 1,
            contract_version: request::CONTRACT_VERSION.to_string(),
            policy: Policy::default(),
            ops: vec![op],
        };
        let result = apply_amendment_checked(&ir, &request);
        assert_eq!(result.status, MutationStatus::Refused);
    }

    #[test]
    fn checked_apply_accepts_well_typed_mutation() {
        let ir = ir_with_typed_datasource();
        let op = AmendOp::AddAssertion {
            op_id: "op1".to_string(),
            table: "t".to_string(),
            assertion: crate::request::Assertion {
                assertion_id: "a1".to_string(),
                table: "t".to_string(),
                predicate: Expr::binop(sans_core::expr::BinOp::Gt, Expr::col("a"), Expr::lit(sans_core::types::Literal::Int(0))),
                severity: None,
            },
        };
        let request = AmendmentRequest {
            format: "sans.amendment_request".to_string(),
            version: 1,
            contract_version: request::CONTRACT_VERSION.to_string(),
            policy: Policy::default(),
            ops: vec![op],
        };
        let result = apply_amendment_checked(&ir, &request);
        assert_eq!(result.status, MutationStatus::Ok);
    }

    #[test]
    fn print_amended_round_trips_through_frontend_printer() {
        let ir = ir_with_typed_datasource();
        let text = print_amended(&ir);
        assert!(text.contains("save"));
    }
}
