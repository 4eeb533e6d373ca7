//! Amendment request wire schema, grounded on
//! `original_source/sans/sans/amendment/schemas.py`'s `pydantic` models.
//! Every payload struct carries `#[serde(deny_unknown_fields)]` as the
//! direct equivalent of `ConfigDict(extra="forbid")`.

use sans_core::expr::Expr;
use sans_core::ir::OpParams;
use sans_core::types::Literal;
use serde::{Deserialize, Serialize};

pub const CONTRACT_VERSION: &str = "0.1";
pub const MAX_OPS_HARD_CAP: usize = 50;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    #[serde(default)]
    pub allow_destructive: bool,
    #[serde(default)]
    pub allow_output_rewire: bool,
    #[serde(default)]
    pub allow_approx: bool,
    #[serde(default = "default_max_ops")]
    pub max_ops: usize,
}

fn default_max_ops() -> usize {
    MAX_OPS_HARD_CAP
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            allow_destructive: false,
            allow_output_rewire: false,
            allow_approx: false,
            max_ops: MAX_OPS_HARD_CAP,
        }
    }
}

/// A wire-level step payload for `add_step`/`replace_step`: the same
/// shape as `sans_core::ir::Step`, but with `params` left as a raw
/// `Value` until `OpParams::from_json` re-validates it against the
/// canonical shape for `op`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StepPayload {
    pub id: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    pub op: String,
    pub params: serde_json::Value,
}

/// A selector naming the assert step this assertion is (or will become).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Assertion {
    pub assertion_id: String,
    pub table: String,
    pub predicate: Expr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

/// The closed set of step-selector fields. Any subset may be given; all
/// present fields must resolve to the same step.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StepSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

/// Closed allow-list for `edit_expr`'s `edit` discriminator, grounded on
/// `amendment/schemas.py::EDIT_EXPR_ALLOWLIST`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "edit", rename_all = "snake_case", deny_unknown_fields)]
pub enum ExprEdit {
    ReplaceLiteral { value: Literal },
    ReplaceColumnRef { name: String },
    ReplaceOp { op: String },
    WrapWithNot,
}

/// Closed allow-list of operator tokens `replace_op` may substitute,
/// grounded on `amendment/schemas.py::REPLACE_OP_ALLOWLIST`.
pub const REPLACE_OP_ALLOWLIST: &[&str] =
    &["+", "-", "*", "/", "==", "!=", "<", "<=", ">", ">=", "and", "or"];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum AmendOp {
    AddStep {
        op_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before_step_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after_step_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        step: StepPayload,
    },
    RemoveStep {
        op_id: String,
        #[serde(flatten)]
        selector: StepSelectorFlat,
    },
    ReplaceStep {
        op_id: String,
        #[serde(flatten)]
        selector: StepSelectorFlat,
        op: String,
        params: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preserve_wiring: Option<bool>,
    },
    RewireInputs {
        op_id: String,
        #[serde(flatten)]
        selector: StepSelectorFlat,
        inputs: Vec<String>,
    },
    RewireOutputs {
        op_id: String,
        #[serde(flatten)]
        selector: StepSelectorFlat,
        outputs: Vec<String>,
    },
    RenameTable {
        op_id: String,
        table: String,
        new_name: String,
    },
    SetParams {
        op_id: String,
        #[serde(flatten)]
        selector: StepSelectorFlat,
        path: String,
        value: serde_json::Value,
    },
    ReplaceExpr {
        op_id: String,
        #[serde(flatten)]
        selector: StepSelectorFlat,
        path: String,
        expr: Expr,
    },
    EditExpr {
        op_id: String,
        #[serde(flatten)]
        selector: StepSelectorFlat,
        path: String,
        #[serde(flatten)]
        edit: ExprEdit,
    },
    AddAssertion {
        op_id: String,
        table: String,
        assertion: Assertion,
    },
    RemoveAssertion {
        op_id: String,
        assertion_id: String,
    },
    ReplaceAssertion {
        op_id: String,
        assertion_id: String,
        assertion: Assertion,
    },
}

/// `StepSelector` without `deny_unknown_fields` so it can be `#[serde(flatten)]`ed
/// into each op variant above (serde forbids combining `flatten` with
/// `deny_unknown_fields` anywhere in the structure); unknown-key rejection
/// for these ops is instead performed on the outer request during
/// `validate_request_schema`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StepSelectorFlat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl From<StepSelectorFlat> for StepSelector {
    fn from(f: StepSelectorFlat) -> Self {
        StepSelector { step_id: f.step_id, transform_id: f.transform_id, table: f.table }
    }
}

impl AmendOp {
    pub fn op_id(&self) -> &str {
        match self {
            AmendOp::AddStep { op_id, .. }
            | AmendOp::RemoveStep { op_id, .. }
            | AmendOp::ReplaceStep { op_id, .. }
            | AmendOp::RewireInputs { op_id, .. }
            | AmendOp::RewireOutputs { op_id, .. }
            | AmendOp::RenameTable { op_id, .. }
            | AmendOp::SetParams { op_id, .. }
            | AmendOp::ReplaceExpr { op_id, .. }
            | AmendOp::EditExpr { op_id, .. }
            | AmendOp::AddAssertion { op_id, .. }
            | AmendOp::RemoveAssertion { op_id, .. }
            | AmendOp::ReplaceAssertion { op_id, .. } => op_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AmendmentRequest {
    pub format: String,
    pub version: u32,
    pub contract_version: String,
    #[serde(default)]
    pub policy: Policy,
    pub ops: Vec<AmendOp>,
}

/// Turns [`OpParams`] back into the wire `{op, params}` pair `StepPayload`
/// expects, used when building diffs and snapshots.
pub fn op_params_wire(params: &OpParams) -> (String, serde_json::Value) {
    (params.op_name().to_string(), params.to_value())
}
