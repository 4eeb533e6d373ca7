//! The canonical intermediate representation: datasources, op-steps, table
//! facts, and the closed per-op parameter shapes of §3.4.
//!
//! Illegal states are made unrepresentable wherever serde can carry the
//! weight: every [`OpParams`] variant wraps a `#[serde(deny_unknown_fields)]`
//! struct, so a legacy key or wrong cardinality fails to deserialize rather
//! than silently surviving. [`OpParams::from_json`] is the one seam where a
//! generic `serde_json::Value` (e.g. from an amendment `set_params` patch)
//! re-enters the typed world; its failure path is what actually raises the
//! `SANS_IR_CANON_SHAPE_<OP>` codes of §4.C.

use crate::diagnostic::Loc;
use crate::error::CoreError;
use crate::expr::Expr;
use crate::types::{Literal, Type};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix for the pseudo-table name a `datasource` step produces.
pub const DATASOURCE_PREFIX: &str = "__datasource__";

pub fn ds_input(name: &str) -> String {
    format!("{DATASOURCE_PREFIX}{name}")
}

pub fn is_ds_input(s: &str) -> bool {
    s.starts_with(DATASOURCE_PREFIX)
}

pub fn ds_name_from_input(s: &str) -> Option<&str> {
    s.strip_prefix(DATASOURCE_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasourceKind {
    Csv,
    InlineCsv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasourceDecl {
    pub kind: DatasourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_types: Option<IndexMap<String, Type>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_sha256: Option<String>,
}

impl DatasourceDecl {
    pub fn csv(path: impl Into<String>) -> Self {
        DatasourceDecl {
            kind: DatasourceKind::Csv,
            path: Some(path.into()),
            columns: None,
            column_types: None,
            inline_text: None,
            inline_sha256: None,
        }
    }

    /// True once every column this datasource declares has a concrete
    /// (non-`unknown`) type — the condition invariant 6 / `E_SCHEMA_REQUIRED`
    /// gate on.
    pub fn is_fully_typed(&self) -> bool {
        match &self.column_types {
            Some(types) => !types.is_empty() && types.values().all(|t| !t.is_unknown()),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub col: String,
    pub desc: bool,
}

/// Per-table sortedness metadata threaded through the validator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableFact {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sorted_by: Option<Vec<SortKey>>,
}

// ---------------------------------------------------------------------
// Per-op canonical parameter shapes (§3.4)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasourceParams {
    pub name: String,
    pub kind: DatasourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityParams {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterParams {
    pub predicate: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeMode {
    Derive,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Assignment {
    pub target: String,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComputeParams {
    pub mode: ComputeMode,
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SelectParams {
    Cols { cols: Vec<String> },
    Drop { drop: Vec<String> },
}

impl SelectParams {
    /// Manual shape check standing in for `#[derive(Deserialize)]` +
    /// `deny_unknown_fields`: both are no-ops on an `untagged` enum (serde
    /// ignores unknown keys and picks the first variant that matches), which
    /// would let `{"cols":["a"],"legacy_flag":true}` and
    /// `{"cols":["a"],"drop":["b"]}` both silently parse as `Cols`. This
    /// walks the raw object itself: exactly one of `cols`/`drop`, no other
    /// keys, non-empty.
    fn from_value(params: Value) -> Result<SelectParams, String> {
        let obj = params
            .as_object()
            .ok_or_else(|| "params must be an object".to_string())?;
        let has_cols = obj.contains_key("cols");
        let has_drop = obj.contains_key("drop");
        let key = match (has_cols, has_drop) {
            (true, true) => return Err("exactly one of `cols` or `drop` is allowed, not both".to_string()),
            (false, false) => return Err("exactly one of `cols` or `drop` is required".to_string()),
            (true, false) => "cols",
            (false, true) => "drop",
        };
        if let Some(extra) = obj.keys().find(|k| k.as_str() != key) {
            return Err(format!("unknown field '{extra}'"));
        }
        let values: Vec<String> =
            serde_json::from_value(obj[key].clone()).map_err(|e| e.to_string())?;
        if values.is_empty() {
            return Err(format!("`{key}` must not be empty"));
        }
        match key {
            "cols" => Ok(SelectParams::Cols { cols: values }),
            _ => Ok(SelectParams::Drop { drop: values }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DropParams {
    pub cols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameEntry {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameParams {
    pub mapping: Vec<RenameEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SortParams {
    pub by: Vec<SortKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodupkey: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CastType {
    Int,
    Decimal,
    #[serde(rename = "str")]
    Str,
    Bool,
    Date,
    Datetime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    Fail,
    Null,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CastEntry {
    pub col: String,
    pub to: CastType,
    pub on_error: OnError,
    pub trim: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CastParams {
    pub casts: Vec<CastEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggOp {
    Mean,
    Sum,
    Min,
    Max,
    Count,
    N,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metric {
    pub name: String,
    pub op: AggOp,
    pub col: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateParams {
    pub group_by: Vec<String>,
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransposeParams {
    pub by: Vec<String>,
    pub id_col: String,
    pub var_cols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqlJoin {
    pub table: String,
    pub left_col: String,
    pub right_col: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqlSelectParams {
    pub from: String,
    #[serde(default)]
    pub joins: Vec<SqlJoin>,
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub where_: Option<Expr>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataStepMode {
    Merge,
}

/// The SAS front-end's `data out; merge a b …; by k1, …;` form, lowered
/// whole rather than decomposed into the closed single-input ops —
/// multi-table BY-group merging has no equivalent among them. Only
/// `Merge` is produced today; `Set` stays implicit (SET with no MERGE
/// decomposes into `rename`/`compute`/`filter`/`select` as before).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataStepParams {
    pub mode: DataStepMode,
    pub by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatEntry {
    pub value: Literal,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatParams {
    pub name: String,
    pub entries: Vec<FormatEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaveParams {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssertParams {
    pub predicate: Expr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LetScalarParams {
    pub name: String,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstParams {
    pub bindings: IndexMap<String, Literal>,
}

/// The closed op-set. Each variant's name (serialized via [`OpParams::op_name`])
/// is the wire-level `op` string every step carries alongside `params`.
#[derive(Debug, Clone, PartialEq)]
pub enum OpParams {
    Datasource(DatasourceParams),
    Identity(IdentityParams),
    Filter(FilterParams),
    Compute(ComputeParams),
    Select(SelectParams),
    Drop(DropParams),
    Rename(RenameParams),
    Sort(SortParams),
    Cast(CastParams),
    Aggregate(AggregateParams),
    Transpose(TransposeParams),
    SqlSelect(SqlSelectParams),
    DataStep(DataStepParams),
    Format(FormatParams),
    Save(SaveParams),
    Assert(AssertParams),
    LetScalar(LetScalarParams),
    Const(ConstParams),
}

impl OpParams {
    pub fn op_name(&self) -> &'static str {
        match self {
            OpParams::Datasource(_) => "datasource",
            OpParams::Identity(_) => "identity",
            OpParams::Filter(_) => "filter",
            OpParams::Compute(_) => "compute",
            OpParams::Select(_) => "select",
            OpParams::Drop(_) => "drop",
            OpParams::Rename(_) => "rename",
            OpParams::Sort(_) => "sort",
            OpParams::Cast(_) => "cast",
            OpParams::Aggregate(_) => "aggregate",
            OpParams::Transpose(_) => "transpose",
            OpParams::SqlSelect(_) => "sql_select",
            OpParams::DataStep(_) => "data_step",
            OpParams::Format(_) => "format",
            OpParams::Save(_) => "save",
            OpParams::Assert(_) => "assert",
            OpParams::LetScalar(_) => "let_scalar",
            OpParams::Const(_) => "const",
        }
    }

    /// Number of outputs this op's contract declares: 0 for the
    /// side-effecting/compile-time ops, 1 for every table-producing op —
    /// `format` included, since it binds an (empty) catalog table to its
    /// output the same way `save`/`assert`/`let_scalar`/`const` do not.
    pub fn expected_output_arity(&self) -> usize {
        match self {
            OpParams::Save(_) | OpParams::Assert(_) | OpParams::LetScalar(_) | OpParams::Const(_) => 0,
            _ => 1,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            OpParams::Datasource(p) => serde_json::to_value(p),
            OpParams::Identity(p) => serde_json::to_value(p),
            OpParams::Filter(p) => serde_json::to_value(p),
            OpParams::Compute(p) => serde_json::to_value(p),
            OpParams::Select(p) => serde_json::to_value(p),
            OpParams::Drop(p) => serde_json::to_value(p),
            OpParams::Rename(p) => serde_json::to_value(p),
            OpParams::Sort(p) => serde_json::to_value(p),
            OpParams::Cast(p) => serde_json::to_value(p),
            OpParams::Aggregate(p) => serde_json::to_value(p),
            OpParams::Transpose(p) => serde_json::to_value(p),
            OpParams::SqlSelect(p) => serde_json::to_value(p),
            OpParams::DataStep(p) => serde_json::to_value(p),
            OpParams::Format(p) => serde_json::to_value(p),
            OpParams::Save(p) => serde_json::to_value(p),
            OpParams::Assert(p) => serde_json::to_value(p),
            OpParams::LetScalar(p) => serde_json::to_value(p),
            OpParams::Const(p) => serde_json::to_value(p),
        }
        .expect("op param structs always serialize")
    }

    /// Parses `params` against the shape declared for `op`. Any unknown key,
    /// missing field, or wrong cardinality surfaces as a
    /// `SANS_IR_CANON_SHAPE_<OP>` refusal rather than a generic parse error —
    /// this is the canonical-shape gate of §4.C step 4, the one seam where a
    /// raw `serde_json::Value` (an amendment patch, a loaded `sans.ir` file)
    /// re-enters the typed `OpParams` world.
    pub fn from_json(op: &str, params: Value) -> Result<OpParams, CoreError> {
        let shape_err = |e: serde_json::Error| CoreError::CanonShape {
            code: format!("SANS_IR_CANON_SHAPE_{}", op.to_ascii_uppercase()),
            message: format!("op '{op}' has a non-canonical params shape: {e}"),
            loc: None,
        };
        Ok(match op {
            "datasource" => OpParams::Datasource(serde_json::from_value(params).map_err(shape_err)?),
            "identity" => OpParams::Identity(serde_json::from_value(params).map_err(shape_err)?),
            "filter" => OpParams::Filter(serde_json::from_value(params).map_err(shape_err)?),
            "compute" => OpParams::Compute(serde_json::from_value(params).map_err(shape_err)?),
            "select" => {
                let select = SelectParams::from_value(params).map_err(|msg| CoreError::CanonShape {
                    code: "SANS_IR_CANON_SHAPE_SELECT".to_string(),
                    message: format!("op 'select' has a non-canonical params shape: {msg}"),
                    loc: None,
                })?;
                OpParams::Select(select)
            }
            "drop" => OpParams::Drop(serde_json::from_value(params).map_err(shape_err)?),
            "rename" => OpParams::Rename(serde_json::from_value(params).map_err(shape_err)?),
            "sort" => OpParams::Sort(serde_json::from_value(params).map_err(shape_err)?),
            "cast" => OpParams::Cast(serde_json::from_value(params).map_err(shape_err)?),
            "aggregate" => OpParams::Aggregate(serde_json::from_value(params).map_err(shape_err)?),
            "transpose" => OpParams::Transpose(serde_json::from_value(params).map_err(shape_err)?),
            "sql_select" => OpParams::SqlSelect(serde_json::from_value(params).map_err(shape_err)?),
            "data_step" => OpParams::DataStep(serde_json::from_value(params).map_err(shape_err)?),
            "format" => OpParams::Format(serde_json::from_value(params).map_err(shape_err)?),
            "save" => OpParams::Save(serde_json::from_value(params).map_err(shape_err)?),
            "assert" => OpParams::Assert(serde_json::from_value(params).map_err(shape_err)?),
            "let_scalar" => OpParams::LetScalar(serde_json::from_value(params).map_err(shape_err)?),
            "const" => OpParams::Const(serde_json::from_value(params).map_err(shape_err)?),
            other => {
                return Err(CoreError::CanonShape {
                    code: "SANS_IR_CANON_SHAPE_UNKNOWN_OP".to_string(),
                    message: format!("unknown op '{other}'"),
                    loc: None,
                })
            }
        })
    }
}

impl Serialize for OpParams {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_value().serialize(serializer)
    }
}

/// A step in the IR: a typed op-step. Unknown-block refusals from a
/// front-end never reach this type — they are raised as `FrontendError`
/// before lowering produces a `Step`.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub id: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub params: OpParams,
    pub loc: Option<Loc>,
}

impl Step {
    pub fn op(&self) -> &'static str {
        self.params.op_name()
    }

    /// `transform_id(step) = canonical_sha256({op, params})`; independent of
    /// `id`, `inputs`, `outputs`.
    pub fn transform_id(&self) -> Result<String, CoreError> {
        let payload = serde_json::json!({ "op": self.op(), "params": self.params.to_value() });
        crate::canon::canonical_sha256(&payload)
    }

    /// `transform_class_id`: like `transform_id`, but every literal in
    /// `params` is replaced with `{type:"lit", lit_type:<type>}`, so two
    /// steps that differ only in literal values share a class id.
    pub fn transform_class_id(&self) -> Result<String, CoreError> {
        let shaped = shape_literals(self.params.to_value());
        let payload = serde_json::json!({ "op": self.op(), "params": shaped });
        crate::canon::canonical_sha256(&payload)
    }

    /// `step_id(step) = canonical_sha256({transform_id, inputs, outputs})`;
    /// wiring-sensitive, id-insensitive. Distinct from the human-readable
    /// `id` field used for selectors and wiring — this is the hash used to
    /// mint ids for multi-output steps (`<op>:<hash12>`, §6.2).
    pub fn derived_step_id(&self) -> Result<String, CoreError> {
        let payload = serde_json::json!({
            "transform_id": self.transform_id()?,
            "inputs": self.inputs,
            "outputs": self.outputs,
        });
        crate::canon::canonical_sha256(&payload)
    }
}

/// Walks a parsed params value, replacing every `lit` expression node's
/// concrete value with a `{type:"lit", lit_type:<type>}` shape. Used only by
/// `transform_class_id`; the literal's own type name is read straight back
/// off the JSON so this needs no access to the typed `Expr` tree.
fn shape_literals(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let is_lit_node = map.get("type").and_then(Value::as_str) == Some("lit");
            if is_lit_node {
                let lit_type = map
                    .get("value")
                    .map(literal_type_name)
                    .unwrap_or("unknown");
                serde_json::json!({"type": "lit", "lit_type": lit_type})
            } else {
                Value::Object(
                    map.into_iter()
                        .map(|(k, v)| (k, shape_literals(v)))
                        .collect(),
                )
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(shape_literals).collect()),
        other => other,
    }
}

fn literal_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "decimal",
        Value::String(_) => "string",
        _ => "unknown",
    }
}

/// The full document: datasource declarations plus a topologically ordered
/// step list. Stored on disk only as canonical JSON, version-stamped.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IrDoc {
    pub datasources: IndexMap<String, DatasourceDecl>,
    pub steps: Vec<Step>,
}

impl IrDoc {
    pub fn new() -> Self {
        IrDoc::default()
    }

    pub fn find_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn find_step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// The canonical on-disk `sans.ir` shape: `{version, datasources, steps}`
    /// with steps in document order (callers are expected to have already
    /// topologically sorted, per §4.C's validator).
    pub fn to_canonical_value(&self) -> Value {
        let datasources: serde_json::Map<String, Value> = self
            .datasources
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap()))
            .collect();
        let steps: Vec<Value> = self
            .steps
            .iter()
            .map(|s| {
                let mut obj = serde_json::Map::new();
                obj.insert("id".to_string(), Value::String(s.id.clone()));
                obj.insert("op".to_string(), Value::String(s.op().to_string()));
                obj.insert(
                    "inputs".to_string(),
                    Value::Array(s.inputs.iter().cloned().map(Value::String).collect()),
                );
                obj.insert(
                    "outputs".to_string(),
                    Value::Array(s.outputs.iter().cloned().map(Value::String).collect()),
                );
                obj.insert("params".to_string(), s.params.to_value());
                Value::Object(obj)
            })
            .collect();
        serde_json::json!({
            "version": crate::IR_VERSION,
            "datasources": Value::Object(datasources),
            "steps": steps,
        })
    }

    pub fn canonical_sha256(&self) -> Result<String, CoreError> {
        crate::canon::canonical_sha256(&self.to_canonical_value())
    }

    /// Parses the on-disk canonical shape back into an `IrDoc`. Each step's
    /// `params` is routed through [`OpParams::from_json`], so a legacy param
    /// key surviving into a loaded document is caught here.
    pub fn from_canonical_value(value: &Value) -> Result<IrDoc, CoreError> {
        let datasources_value = value
            .get("datasources")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut datasources = IndexMap::new();
        for (name, v) in datasources_value {
            let decl: DatasourceDecl = serde_json::from_value(v)?;
            datasources.insert(name, decl);
        }
        let steps_value = value
            .get("steps")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut steps = Vec::with_capacity(steps_value.len());
        for sv in steps_value {
            let id = sv
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let op = sv.get("op").and_then(Value::as_str).unwrap_or_default();
            let inputs: Vec<String> = sv
                .get("inputs")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            let outputs: Vec<String> = sv
                .get("outputs")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            let params = sv.get("params").cloned().unwrap_or(Value::Object(Default::default()));
            let params = OpParams::from_json(op, params)?;
            steps.push(Step {
                id,
                inputs,
                outputs,
                params,
                loc: None,
            });
        }
        Ok(IrDoc { datasources, steps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Literal;

    fn sample_step() -> Step {
        Step {
            id: "out:t".to_string(),
            inputs: vec![ds_input("in")],
            outputs: vec!["t".to_string()],
            params: OpParams::Compute(ComputeParams {
                mode: ComputeMode::Derive,
                assignments: vec![Assignment {
                    target: "c".to_string(),
                    expr: Expr::binop(
                        crate::expr::BinOp::Add,
                        Expr::col("a"),
                        Expr::col("b"),
                    ),
                }],
            }),
            loc: None,
        }
    }

    #[test]
    fn ds_input_round_trips() {
        assert_eq!(ds_input("in"), "__datasource__in");
        assert!(is_ds_input("__datasource__in"));
        assert_eq!(ds_name_from_input("__datasource__in"), Some("in"));
        assert_eq!(ds_name_from_input("in"), None);
    }

    #[test]
    fn transform_id_depends_only_on_op_and_params() {
        let a = sample_step();
        let mut b = a.clone();
        b.id = "different-id".to_string();
        b.outputs = vec!["other_table".to_string()];
        assert_eq!(a.transform_id().unwrap(), b.transform_id().unwrap());
    }

    #[test]
    fn step_id_is_wiring_sensitive() {
        let a = sample_step();
        let mut b = a.clone();
        b.outputs = vec!["different".to_string()];
        assert_ne!(a.derived_step_id().unwrap(), b.derived_step_id().unwrap());
    }

    #[test]
    fn transform_class_id_ignores_literal_value() {
        let mut a = sample_step();
        a.params = OpParams::Filter(FilterParams {
            predicate: Expr::binop(
                crate::expr::BinOp::Gt,
                Expr::col("a"),
                Expr::lit(Literal::Int(1)),
            ),
        });
        let mut b = a.clone();
        b.params = OpParams::Filter(FilterParams {
            predicate: Expr::binop(
                crate::expr::BinOp::Gt,
                Expr::col("a"),
                Expr::lit(Literal::Int(999)),
            ),
        });
        assert_eq!(a.transform_class_id().unwrap(), b.transform_class_id().unwrap());
        assert_ne!(a.transform_id().unwrap(), b.transform_id().unwrap());
    }

    #[test]
    fn from_json_rejects_unknown_key_with_canon_shape_code() {
        let params = serde_json::json!({"cols": ["a"], "legacy_flag": true});
        let err = OpParams::from_json("select", params).unwrap_err();
        assert_eq!(err.code(), "SANS_IR_CANON_SHAPE_SELECT");
    }

    #[test]
    fn select_rejects_both_cols_and_drop() {
        let params = serde_json::json!({"cols": ["a"], "drop": ["b"]});
        let err = OpParams::from_json("select", params).unwrap_err();
        assert_eq!(err.code(), "SANS_IR_CANON_SHAPE_SELECT");
    }

    #[test]
    fn select_rejects_empty_cols() {
        let params = serde_json::json!({"cols": []});
        let err = OpParams::from_json("select", params).unwrap_err();
        assert_eq!(err.code(), "SANS_IR_CANON_SHAPE_SELECT");
    }

    #[test]
    fn select_rejects_empty_drop() {
        let params = serde_json::json!({"drop": []});
        let err = OpParams::from_json("select", params).unwrap_err();
        assert_eq!(err.code(), "SANS_IR_CANON_SHAPE_SELECT");
    }

    #[test]
    fn select_rejects_neither_cols_nor_drop() {
        let params = serde_json::json!({});
        let err = OpParams::from_json("select", params).unwrap_err();
        assert_eq!(err.code(), "SANS_IR_CANON_SHAPE_SELECT");
    }

    #[test]
    fn ir_doc_round_trips_through_canonical_value() {
        let mut doc = IrDoc::new();
        doc.datasources.insert("in".to_string(), DatasourceDecl::csv("in.csv"));
        doc.steps.push(Step {
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
        doc.steps.push(sample_step());
        let value = doc.to_canonical_value();
        let doc2 = IrDoc::from_canonical_value(&value).unwrap();
        assert_eq!(doc.canonical_sha256().unwrap(), doc2.canonical_sha256().unwrap());
    }
}
