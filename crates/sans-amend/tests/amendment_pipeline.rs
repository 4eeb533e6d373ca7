//! End-to-end integration tests for the amendment engine over a script
//! compiled through the real `.sans` front-end, rather than a hand-built
//! IR: compile -> amend -> revalidate -> reprint -> recompile.

use sans_amend::request::{StepSelectorFlat, CONTRACT_VERSION};
use sans_amend::{apply_amendment_checked, print_amended, AmendOp, AmendmentRequest, MutationStatus, Policy};
use sans_amend::request::Assertion;
use sans_core::expr::{BinOp, Expr};
use sans_core::types::Literal;

const SCRIPT: &str = r#"datasource x = csv("x.csv", columns(a, b))
table t = from(x) filter(a > 0) derive(c = a + b)
save t to "out/t.csv""#;

fn compile(src: &str) -> sans_core::ir::IrDoc {
    let (ir, _) = sans_frontend::compile_sans_source(src, "t.sans").expect("fixture script should compile");
    ir
}

fn wrap(op: AmendOp) -> AmendmentRequest {
    AmendmentRequest {
        format: "sans.amendment_request".to_string(),
        version: 1,
        contract_version: CONTRACT_VERSION.to_string(),
        policy: Policy::default(),
        ops: vec![op],
    }
}

#[test]
fn adding_an_assertion_survives_revalidation_and_reprints_cleanly() {
    let ir = compile(SCRIPT);
    let request = wrap(AmendOp::AddAssertion {
        op_id: "op1".to_string(),
        table: "t".to_string(),
        assertion: Assertion {
            assertion_id: "a_nonneg".to_string(),
            table: "t".to_string(),
            predicate: Expr::binop(BinOp::Ge, Expr::col("c"), Expr::lit(Literal::Int(0))),
            severity: None,
        },
    });

    let result = apply_amendment_checked(&ir, &request);
    assert_eq!(result.status, MutationStatus::Ok, "{:?}", result.diagnostics);
    let ir_out = result.ir_out.expect("ok mutation carries ir_out");

    let printed = print_amended(&ir_out);
    assert!(printed.contains("a_nonneg"), "printed source should keep the assertion id: {printed}");

    // The amended source must still be valid `.sans`, and recompiling it
    // must reach the exact same canonical IR the engine already produced.
    let recompiled = compile(&printed);
    assert_eq!(ir_out.canonical_sha256().unwrap(), recompiled.canonical_sha256().unwrap());
}

#[test]
fn replacing_a_step_with_an_unknown_column_is_refused_not_panicking() {
    let ir = compile(SCRIPT);
    let request = wrap(AmendOp::ReplaceStep {
        op_id: "op1".to_string(),
        selector: StepSelectorFlat { step_id: None, transform_id: None, table: Some("t".to_string()) },
        op: "select".to_string(),
        params: serde_json::json!({"cols": ["ghost_column"]}),
        preserve_wiring: None,
    });

    let result = apply_amendment_checked(&ir, &request);
    assert_eq!(result.status, MutationStatus::Refused);
    assert!(result.ir_out.is_none());
    assert!(!result.diagnostics.refusals.is_empty());
}

#[test]
fn destructive_op_is_refused_without_the_policy_flag() {
    let ir = compile(SCRIPT);
    let mut request = wrap(AmendOp::RemoveStep {
        op_id: "op1".to_string(),
        selector: StepSelectorFlat { step_id: None, transform_id: None, table: Some("t".to_string()) },
    });
    request.policy.allow_destructive = false;

    let result = apply_amendment_checked(&ir, &request);
    assert_eq!(result.status, MutationStatus::Refused);
}
