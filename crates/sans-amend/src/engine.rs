//! `apply_amendment`: the transactional mutation engine, grounded on
//! `original_source/sans/sans/amendment/apply.py::apply_amendment`.
//!
//! The engine walks `request.ops` in order over a working copy of the IR's
//! canonical JSON shape, applying each op's mutation in place. Any refusal
//! aborts the whole request and discards the working copy — nothing is
//! ever partially applied. Once every op has run, the working copy is
//! parsed back into a typed [`IrDoc`] (re-running the canonical-shape gate
//! on every step) and revalidated structurally before the engine reports
//! success.

use crate::diff::{
    build_assertion_diff, build_diagnostics, build_structural_diff, build_table_universe,
    AssertionDiff, Diagnostics, OpApplied, StructuralDiff,
};
use crate::error::AmendError;
use crate::request::{AmendOp, AmendmentRequest, ExprEdit, StepSelectorFlat, REPLACE_OP_ALLOWLIST};
use sans_core::ir::{IrDoc, OpParams};
use sans_core::{validate_structural, ValidateOptions};
use serde_json::Value;

/// Expression call targets an amendment is allowed to introduce. Narrower
/// than `sans_core::expr::CALL_ALLOWLIST` — amendments may not introduce a
/// `row_count` predicate, since that call's semantics depend on context
/// only a full front-end compile establishes.
const ALLOWED_CALLS: &[&str] = &["coalesce", "if", "put", "input"];
const ALLOWED_BINOPS: &[&str] = &["==", "!=", "<", ">", "<=", ">=", "+", "-", "*", "/"];
const ALLOWED_BOOLOPS: &[&str] = &["and", "or"];
const ALLOWED_UNOPS: &[&str] = &["not", "+", "-"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Ok,
    Refused,
}

#[derive(Debug, Clone)]
pub struct MutationResult {
    pub status: MutationStatus,
    pub ir_out: Option<IrDoc>,
    pub diff_structural: Option<StructuralDiff>,
    pub diff_assertions: Option<AssertionDiff>,
    pub diagnostics: Diagnostics,
}

fn refused(err: AmendError) -> MutationResult {
    let diag = err.to_diagnostic();
    let refusal = serde_json::to_value(&diag).unwrap_or(Value::Null);
    MutationResult {
        status: MutationStatus::Refused,
        ir_out: None,
        diff_structural: None,
        diff_assertions: None,
        diagnostics: build_diagnostics("refused", vec![refusal], vec![]),
    }
}

/// Applies `request` to `ir_in`, producing either a mutated `IrDoc` plus
/// diffs, or a single-refusal diagnostics payload. Pure: `ir_in` is never
/// mutated, and nothing is written anywhere.
pub fn apply_amendment(ir_in: &IrDoc, request: &AmendmentRequest) -> MutationResult {
    if request.format != "sans.amendment_request" {
        return refused(AmendError::ValidationSchema(format!(
            "unexpected request format '{}'",
            request.format
        )));
    }
    if request.contract_version != crate::request::CONTRACT_VERSION {
        return refused(AmendError::ValidationSchema(format!(
            "unsupported contract_version '{}'",
            request.contract_version
        )));
    }

    let cap = request
        .policy
        .max_ops
        .min(crate::request::MAX_OPS_HARD_CAP);
    if request.ops.len() > cap {
        return refused(AmendError::CapabilityLimit {
            count: request.ops.len(),
            cap,
        });
    }

    let mut seen_op_ids = std::collections::HashSet::new();
    for op in &request.ops {
        if !seen_op_ids.insert(op.op_id()) {
            return refused(AmendError::DuplicateOpId(op.op_id().to_string()));
        }
    }

    let ir_in_value = ir_in.to_canonical_value();
    let mut work = ir_in_value.clone();

    let assertions_before = assertion_records(&work);

    let mut ops_applied = Vec::new();
    let mut affected_steps = Vec::new();
    let mut affected_tables = Vec::new();

    for op in &request.ops {
        if let Err(err) = apply_one(&mut work, op, &request.policy, &mut affected_steps, &mut affected_tables)
        {
            return refused(err);
        }
        ops_applied.push(OpApplied {
            op_id: op.op_id().to_string(),
            kind: op_kind_name(op).to_string(),
            status: "ok".to_string(),
        });
    }

    let ir_out = match IrDoc::from_canonical_value(&work) {
        Ok(ir) => ir,
        Err(e) => {
            return refused(AmendError::IrInvalid {
                op_id: ops_applied.last().map(|o| o.op_id.clone()).unwrap_or_default(),
                reason: e.to_string(),
            })
        }
    };
    if let Err(e) = validate_structural(&ir_out, ValidateOptions::default()) {
        return refused(AmendError::IrInvalid {
            op_id: ops_applied.last().map(|o| o.op_id.clone()).unwrap_or_default(),
            reason: e.to_string(),
        });
    }

    let assertions_after = assertion_records(&work);
    let diff_structural = match build_structural_diff(
        &ir_in_value,
        &work,
        ops_applied,
        affected_steps,
        affected_tables,
    ) {
        Ok(d) => d,
        Err(e) => return refused(AmendError::Core(e)),
    };
    let diff_assertions = build_assertion_diff(&assertions_before, &assertions_after);

    MutationResult {
        status: MutationStatus::Ok,
        ir_out: Some(ir_out),
        diff_structural: Some(diff_structural),
        diff_assertions: Some(diff_assertions),
        diagnostics: build_diagnostics("ok", vec![], vec![]),
    }
}

fn op_kind_name(op: &AmendOp) -> &'static str {
    match op {
        AmendOp::AddStep { .. } => "add_step",
        AmendOp::RemoveStep { .. } => "remove_step",
        AmendOp::ReplaceStep { .. } => "replace_step",
        AmendOp::RewireInputs { .. } => "rewire_inputs",
        AmendOp::RewireOutputs { .. } => "rewire_outputs",
        AmendOp::RenameTable { .. } => "rename_table",
        AmendOp::SetParams { .. } => "set_params",
        AmendOp::ReplaceExpr { .. } => "replace_expr",
        AmendOp::EditExpr { .. } => "edit_expr",
        AmendOp::AddAssertion { .. } => "add_assertion",
        AmendOp::RemoveAssertion { .. } => "remove_assertion",
        AmendOp::ReplaceAssertion { .. } => "replace_assertion",
    }
}

/// An `assert`-op step read back as `(assertion_id, snapshot)`, where
/// `assertion_id` is the step's own `id`. This is how the amendment diff
/// tracks added/removed/modified assertions without a parallel
/// `ir.assertions` list — see `DESIGN.md` for why.
fn assertion_records(work: &Value) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    let Some(steps) = work.get("steps").and_then(Value::as_array) else {
        return out;
    };
    for step in steps {
        if step.get("op").and_then(Value::as_str) != Some("assert") {
            continue;
        }
        let id = step.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
        let table = step
            .get("inputs")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .unwrap_or_default();
        let mut snapshot = serde_json::Map::new();
        snapshot.insert("assertion_id".to_string(), Value::String(id.clone()));
        snapshot.insert("table".to_string(), Value::String(table.to_string()));
        if let Some(params) = step.get("params") {
            if let Some(pred) = params.get("predicate") {
                snapshot.insert("predicate".to_string(), pred.clone());
            }
            if let Some(sev) = params.get("severity") {
                snapshot.insert("severity".to_string(), sev.clone());
            }
        }
        out.push((id, Value::Object(snapshot)));
    }
    out
}

fn steps_mut(work: &mut Value) -> &mut Vec<Value> {
    work.get_mut("steps")
        .and_then(Value::as_array_mut)
        .expect("work.steps is always an array; seeded from IrDoc::to_canonical_value")
}

fn steps_ref(work: &Value) -> &[Value] {
    work.get("steps").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

/// Resolves a selector's `step_id`/`transform_id`/`table` fields to a single
/// step index, grounded on `apply.py::_resolve_single_step_index`. Every
/// field given must agree on the same step.
fn resolve_step_index(work: &Value, op_id: &str, selector: &StepSelectorFlat) -> Result<usize, AmendError> {
    let steps = steps_ref(work);
    let mut by_field: Vec<usize> = Vec::new();

    if let Some(step_id) = &selector.step_id {
        let matches: Vec<usize> = steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.get("id").and_then(Value::as_str) == Some(step_id.as_str()))
            .map(|(i, _)| i)
            .collect();
        match matches.len() {
            0 => return Err(AmendError::TargetNotFound { op_id: op_id.to_string() }),
            1 => by_field.push(matches[0]),
            _ => return Err(AmendError::TargetAmbiguous { op_id: op_id.to_string() }),
        }
    }
    if let Some(transform_id) = &selector.transform_id {
        let matches: Vec<usize> = steps
            .iter()
            .enumerate()
            .filter(|(_, s)| derive_step_transform_id(s).as_deref() == Ok(transform_id.as_str()))
            .map(|(i, _)| i)
            .collect();
        match matches.len() {
            0 => return Err(AmendError::TargetNotFound { op_id: op_id.to_string() }),
            1 => by_field.push(matches[0]),
            _ => return Err(AmendError::TargetAmbiguous { op_id: op_id.to_string() }),
        }
    }
    if let Some(table) = &selector.table {
        let matches: Vec<usize> = steps
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.get("outputs")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().any(|v| v.as_str() == Some(table.as_str())))
                    .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect();
        match matches.len() {
            0 => return Err(AmendError::TargetNotFound { op_id: op_id.to_string() }),
            1 => by_field.push(matches[0]),
            _ => return Err(AmendError::TargetAmbiguous { op_id: op_id.to_string() }),
        }
    }

    if by_field.is_empty() {
        return Err(AmendError::TargetNotFound { op_id: op_id.to_string() });
    }
    let first = by_field[0];
    if by_field.iter().any(|&i| i != first) {
        return Err(AmendError::TargetMismatch { op_id: op_id.to_string() });
    }
    Ok(first)
}

fn derive_step_transform_id(step: &Value) -> Result<String, sans_core::CoreError> {
    let payload = serde_json::json!({
        "op": step.get("op").cloned().unwrap_or(Value::Null),
        "params": step.get("params").cloned().unwrap_or(Value::Object(Default::default())),
    });
    sans_core::canon::canonical_sha256(&payload)
}

fn apply_one(
    work: &mut Value,
    op: &AmendOp,
    policy: &crate::request::Policy,
    affected_steps: &mut Vec<String>,
    affected_tables: &mut Vec<String>,
) -> Result<(), AmendError> {
    match op {
        AmendOp::AddStep { op_id, before_step_id, after_step_id, index, step } => {
            apply_add_step(work, op_id, before_step_id.as_deref(), after_step_id.as_deref(), *index, step, policy, affected_steps, affected_tables)
        }
        AmendOp::RemoveStep { op_id, selector } => {
            if !policy.allow_destructive {
                return Err(AmendError::PolicyDestructive { op_id: op_id.clone() });
            }
            let idx = resolve_step_index(work, op_id, selector)?;
            let removed = steps_mut(work).remove(idx);
            affected_steps.push(removed.get("id").and_then(Value::as_str).unwrap_or_default().to_string());
            if let Some(outs) = removed.get("outputs").and_then(Value::as_array) {
                affected_tables.extend(outs.iter().filter_map(|v| v.as_str().map(String::from)));
            }
            Ok(())
        }
        AmendOp::ReplaceStep { op_id, selector, op: new_op, params, preserve_wiring: _ } => {
            let idx = resolve_step_index(work, op_id, selector)?;
            let parsed = OpParams::from_json(new_op, params.clone()).map_err(|e| AmendError::IrInvalid {
                op_id: op_id.clone(),
                reason: e.to_string(),
            })?;
            let steps = steps_mut(work);
            let id = steps[idx].get("id").cloned().unwrap_or(Value::Null);
            let inputs = steps[idx].get("inputs").cloned().unwrap_or(Value::Array(vec![]));
            let outputs = steps[idx].get("outputs").cloned().unwrap_or(Value::Array(vec![]));
            steps[idx] = serde_json::json!({
                "id": id,
                "op": new_op,
                "inputs": inputs,
                "outputs": outputs,
                "params": parsed.to_value(),
            });
            affected_steps.push(steps[idx].get("id").and_then(Value::as_str).unwrap_or_default().to_string());
            if let Some(outs) = steps[idx].get("outputs").and_then(Value::as_array) {
                affected_tables.extend(outs.iter().filter_map(|v| v.as_str().map(String::from)));
            }
            Ok(())
        }
        AmendOp::RewireInputs { op_id, selector, inputs } => {
            let idx = resolve_step_index(work, op_id, selector)?;
            let steps = steps_mut(work);
            steps[idx]["inputs"] = serde_json::to_value(inputs).expect("Vec<String> always serializes");
            affected_steps.push(steps[idx].get("id").and_then(Value::as_str).unwrap_or_default().to_string());
            Ok(())
        }
        AmendOp::RewireOutputs { op_id, selector, outputs } => {
            if !policy.allow_output_rewire {
                return Err(AmendError::PolicyOutputRewire { op_id: op_id.clone() });
            }
            let idx = resolve_step_index(work, op_id, selector)?;
            let current_outputs: Vec<String> = steps_ref(work)[idx]
                .get("outputs")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            let mut universe = build_table_universe(work);
            for t in &current_outputs {
                universe.remove(t);
            }
            let collisions: Vec<&String> = outputs.iter().filter(|t| universe.contains(*t)).collect();
            if !collisions.is_empty() {
                return Err(AmendError::OutputTableCollision { op_id: op_id.clone() });
            }
            let steps = steps_mut(work);
            steps[idx]["outputs"] = serde_json::to_value(outputs).expect("Vec<String> always serializes");
            affected_steps.push(steps[idx].get("id").and_then(Value::as_str).unwrap_or_default().to_string());
            affected_tables.extend(outputs.iter().cloned());
            Ok(())
        }
        AmendOp::RenameTable { op_id, table, new_name } => {
            let universe = build_table_universe(work);
            if !universe.contains(table) {
                return Err(AmendError::TargetNotFound { op_id: op_id.clone() });
            }
            if universe.contains(new_name) {
                return Err(AmendError::OutputTableCollision { op_id: op_id.clone() });
            }
            for step in steps_mut(work) {
                rename_in_string_array(step, "inputs", table, new_name);
                rename_in_string_array(step, "outputs", table, new_name);
            }
            affected_tables.push(table.clone());
            affected_tables.push(new_name.clone());
            Ok(())
        }
        AmendOp::SetParams { op_id, selector, path, value } => {
            let idx = resolve_step_index(work, op_id, selector)?;
            let steps = steps_mut(work);
            let params = steps[idx].get_mut("params").expect("every step carries params");
            crate::rfc6901::set(params, path, value.clone()).map_err(|e| path_error(op_id, path, e))?;
            let op_name = steps[idx].get("op").and_then(Value::as_str).unwrap_or_default().to_string();
            let updated_params = steps[idx].get("params").cloned().unwrap_or(Value::Null);
            OpParams::from_json(&op_name, updated_params).map_err(|e| AmendError::IrInvalid {
                op_id: op_id.clone(),
                reason: e.to_string(),
            })?;
            affected_steps.push(steps[idx].get("id").and_then(Value::as_str).unwrap_or_default().to_string());
            Ok(())
        }
        AmendOp::ReplaceExpr { op_id, selector, path, expr } => {
            let idx = resolve_step_index(work, op_id, selector)?;
            let expr_value = serde_json::to_value(expr).expect("Expr always serializes");
            validate_expr_node(&expr_value).map_err(|reason| AmendError::ExprInvalid {
                op_id: op_id.clone(),
                reason,
            })?;
            let steps = steps_mut(work);
            let params = steps[idx].get_mut("params").expect("every step carries params");
            crate::rfc6901::set(params, path, expr_value).map_err(|e| path_error(op_id, path, e))?;
            affected_steps.push(steps[idx].get("id").and_then(Value::as_str).unwrap_or_default().to_string());
            Ok(())
        }
        AmendOp::EditExpr { op_id, selector, path, edit } => {
            let idx = resolve_step_index(work, op_id, selector)?;
            let steps = steps_mut(work);
            let params = steps[idx].get("params").expect("every step carries params");
            let current = crate::rfc6901::get(params, path)
                .map_err(|e| path_error(op_id, path, e))?
                .clone();
            if !current.is_object() || current.get("type").is_none() {
                return Err(AmendError::PathInvalid { op_id: op_id.clone(), path: path.clone() });
            }
            let edited = apply_expr_edit(&current, edit, op_id)?;
            validate_expr_node(&edited).map_err(|reason| AmendError::ExprInvalid {
                op_id: op_id.clone(),
                reason,
            })?;
            let params = steps[idx].get_mut("params").expect("every step carries params");
            crate::rfc6901::set(params, path, edited).map_err(|e| path_error(op_id, path, e))?;
            affected_steps.push(steps[idx].get("id").and_then(Value::as_str).unwrap_or_default().to_string());
            Ok(())
        }
        AmendOp::AddAssertion { op_id, table, assertion } => {
            let steps = steps_ref(work);
            if steps.iter().any(|s| {
                s.get("op").and_then(Value::as_str) == Some("assert")
                    && s.get("id").and_then(Value::as_str) == Some(assertion.assertion_id.as_str())
            }) {
                return Err(AmendError::ValidationSchema(format!(
                    "assertion_id '{}' already exists",
                    assertion.assertion_id
                )));
            }
            let predicate = serde_json::to_value(&assertion.predicate).expect("Expr always serializes");
            let mut params = serde_json::Map::new();
            params.insert("predicate".to_string(), predicate);
            if let Some(sev) = &assertion.severity {
                params.insert("severity".to_string(), Value::String(sev.clone()));
            }
            let new_step = serde_json::json!({
                "id": assertion.assertion_id,
                "op": "assert",
                "inputs": [table],
                "outputs": Value::Array(vec![]),
                "params": Value::Object(params),
            });
            steps_mut(work).push(new_step);
            affected_steps.push(assertion.assertion_id.clone());
            affected_tables.push(table.clone());
            Ok(())
        }
        AmendOp::RemoveAssertion { op_id, assertion_id } => {
            if !policy.allow_destructive {
                return Err(AmendError::PolicyDestructive { op_id: op_id.clone() });
            }
            let steps = steps_mut(work);
            let matches: Vec<usize> = steps
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    s.get("op").and_then(Value::as_str) == Some("assert")
                        && s.get("id").and_then(Value::as_str) == Some(assertion_id.as_str())
                })
                .map(|(i, _)| i)
                .collect();
            match matches.len() {
                0 => Err(AmendError::AssertionNotFound { op_id: op_id.clone(), assertion_id: assertion_id.clone() }),
                1 => {
                    steps.remove(matches[0]);
                    Ok(())
                }
                _ => Err(AmendError::TargetAmbiguous { op_id: op_id.clone() }),
            }
        }
        AmendOp::ReplaceAssertion { op_id, assertion_id, assertion } => {
            if &assertion.assertion_id != assertion_id {
                return Err(AmendError::TargetMismatch { op_id: op_id.clone() });
            }
            let steps = steps_mut(work);
            let matches: Vec<usize> = steps
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    s.get("op").and_then(Value::as_str) == Some("assert")
                        && s.get("id").and_then(Value::as_str) == Some(assertion_id.as_str())
                })
                .map(|(i, _)| i)
                .collect();
            let idx = match matches.len() {
                0 => return Err(AmendError::AssertionNotFound { op_id: op_id.clone(), assertion_id: assertion_id.clone() }),
                1 => matches[0],
                _ => return Err(AmendError::TargetAmbiguous { op_id: op_id.clone() }),
            };
            let predicate = serde_json::to_value(&assertion.predicate).expect("Expr always serializes");
            let mut params = serde_json::Map::new();
            params.insert("predicate".to_string(), predicate);
            if let Some(sev) = &assertion.severity {
                params.insert("severity".to_string(), Value::String(sev.clone()));
            }
            steps[idx]["inputs"] = Value::Array(vec![Value::String(assertion.table.clone())]);
            steps[idx]["params"] = Value::Object(params);
            affected_steps.push(assertion_id.clone());
            affected_tables.push(assertion.table.clone());
            Ok(())
        }
    }
}

fn rename_in_string_array(step: &mut Value, field: &str, old: &str, new: &str) {
    if let Some(arr) = step.get_mut(field).and_then(Value::as_array_mut) {
        for item in arr.iter_mut() {
            if item.as_str() == Some(old) {
                *item = Value::String(new.to_string());
            }
        }
    }
}

fn path_error(op_id: &str, path: &str, err: crate::rfc6901::PointerError) -> AmendError {
    match err {
        crate::rfc6901::PointerError::NotFound => {
            AmendError::PathNotFound { op_id: op_id.to_string(), path: path.to_string() }
        }
        crate::rfc6901::PointerError::Invalid | crate::rfc6901::PointerError::NotContainer => {
            AmendError::PathInvalid { op_id: op_id.to_string(), path: path.to_string() }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_add_step(
    work: &mut Value,
    op_id: &str,
    before_step_id: Option<&str>,
    after_step_id: Option<&str>,
    index: Option<usize>,
    step: &crate::request::StepPayload,
    policy: &crate::request::Policy,
    affected_steps: &mut Vec<String>,
    affected_tables: &mut Vec<String>,
) -> Result<(), AmendError> {
    let parsed = OpParams::from_json(&step.op, step.params.clone()).map_err(|e| AmendError::IrInvalid {
        op_id: op_id.to_string(),
        reason: e.to_string(),
    })?;
    let _ = &policy.allow_approx; // approx steps are not representable in OpParams; see DESIGN.md.

    if steps_ref(work).iter().any(|s| s.get("id").and_then(Value::as_str) == Some(step.id.as_str())) {
        return Err(AmendError::ValidationSchema(format!(
            "add_step params.step.id '{}' collides with existing step id",
            step.id
        )));
    }

    let universe = build_table_universe(work);
    let collisions: Vec<&String> = step.outputs.iter().filter(|t| universe.contains(*t)).collect();
    if !collisions.is_empty() {
        return Err(AmendError::OutputTableCollision { op_id: op_id.to_string() });
    }

    let new_step = serde_json::json!({
        "id": step.id,
        "op": step.op,
        "inputs": step.inputs,
        "outputs": step.outputs,
        "params": parsed.to_value(),
    });

    let steps = steps_mut(work);
    if let Some(index) = index {
        if index > steps.len() {
            return Err(AmendError::IndexOutOfRange { op_id: op_id.to_string(), index, max: steps.len() });
        }
        steps.insert(index, new_step);
    } else if let Some(before) = before_step_id {
        let pos = steps.iter().position(|s| s.get("id").and_then(Value::as_str) == Some(before));
        match pos {
            Some(pos) => steps.insert(pos, new_step),
            None => return Err(AmendError::TargetNotFound { op_id: op_id.to_string() }),
        }
    } else if let Some(after) = after_step_id {
        let pos = steps.iter().position(|s| s.get("id").and_then(Value::as_str) == Some(after));
        match pos {
            Some(pos) => steps.insert(pos + 1, new_step),
            None => return Err(AmendError::TargetNotFound { op_id: op_id.to_string() }),
        }
    } else {
        steps.push(new_step);
    }

    affected_steps.push(step.id.clone());
    affected_tables.extend(step.outputs.iter().cloned());
    Ok(())
}

fn apply_expr_edit(current: &Value, edit: &ExprEdit, op_id: &str) -> Result<Value, AmendError> {
    Ok(match edit {
        ExprEdit::ReplaceLiteral { value } => {
            serde_json::json!({"type": "lit", "value": value})
        }
        ExprEdit::ReplaceColumnRef { name } => {
            serde_json::json!({"type": "col", "name": name})
        }
        ExprEdit::ReplaceOp { op } => {
            let node_type = current.get("type").and_then(Value::as_str);
            if !matches!(node_type, Some("binop") | Some("boolop") | Some("unop")) {
                return Err(AmendError::PathInvalid { op_id: op_id.to_string(), path: String::new() });
            }
            if !REPLACE_OP_ALLOWLIST.contains(&op.as_str()) {
                return Err(AmendError::ExprInvalid {
                    op_id: op_id.to_string(),
                    reason: format!("operator '{op}' is not in the replace_op allowlist"),
                });
            }
            let mut updated = current.clone();
            updated["op"] = Value::String(op.clone());
            updated
        }
        ExprEdit::WrapWithNot => {
            serde_json::json!({"type": "unop", "op": "not", "arg": current})
        }
    })
}

/// Shape-and-allowlist check for an expression an amendment is about to
/// introduce, grounded on `apply.py::_validate_expr`. Deliberately stricter
/// than `OpParams::from_json`'s structural parse: it also enforces the
/// amendment-specific call/operator allowlists.
fn validate_expr_node(node: &Value) -> Result<(), String> {
    let Some(obj) = node.as_object() else {
        return Err("expr node must be an object".to_string());
    };
    let node_type = obj.get("type").and_then(Value::as_str).unwrap_or_default();
    match node_type {
        "lit" => {
            if keys_are(obj, &["type", "value"]) {
                Ok(())
            } else {
                Err("lit node shape invalid".to_string())
            }
        }
        "col" => {
            if keys_are(obj, &["type", "name"]) && obj.get("name").and_then(Value::as_str).is_some() {
                Ok(())
            } else {
                Err("col node shape invalid".to_string())
            }
        }
        "binop" => {
            if !keys_are(obj, &["type", "op", "left", "right"]) {
                return Err("binop node shape invalid".to_string());
            }
            if !ALLOWED_BINOPS.contains(&obj.get("op").and_then(Value::as_str).unwrap_or_default()) {
                return Err("binop operator invalid".to_string());
            }
            validate_expr_node(&obj["left"])?;
            validate_expr_node(&obj["right"])
        }
        "boolop" => {
            if !keys_are(obj, &["type", "op", "args"]) {
                return Err("boolop node shape invalid".to_string());
            }
            if !ALLOWED_BOOLOPS.contains(&obj.get("op").and_then(Value::as_str).unwrap_or_default()) {
                return Err("boolop operator invalid".to_string());
            }
            let args = obj.get("args").and_then(Value::as_array).ok_or("boolop args invalid")?;
            if args.len() < 2 {
                return Err("boolop args invalid".to_string());
            }
            args.iter().try_for_each(validate_expr_node)
        }
        "unop" => {
            if !keys_are(obj, &["type", "op", "arg"]) {
                return Err("unop node shape invalid".to_string());
            }
            if !ALLOWED_UNOPS.contains(&obj.get("op").and_then(Value::as_str).unwrap_or_default()) {
                return Err("unop operator invalid".to_string());
            }
            validate_expr_node(&obj["arg"])
        }
        "call" => {
            if !keys_are(obj, &["type", "name", "args"]) {
                return Err("call node shape invalid".to_string());
            }
            if !ALLOWED_CALLS.contains(&obj.get("name").and_then(Value::as_str).unwrap_or_default()) {
                return Err("call name invalid".to_string());
            }
            let args = obj.get("args").and_then(Value::as_array).ok_or("call args invalid")?;
            args.iter().try_for_each(validate_expr_node)
        }
        _ => Err("unknown expr node type".to_string()),
    }
}

fn keys_are(obj: &serde_json::Map<String, Value>, expected: &[&str]) -> bool {
    obj.len() == expected.len() && expected.iter().all(|k| obj.contains_key(*k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Assertion, Policy, StepPayload};
    use sans_core::expr::Expr;
    use sans_core::ir::{ds_input, DatasourceDecl, DatasourceKind, DatasourceParams, OpParams, SaveParams, Step};
    use sans_core::types::Literal;

    fn minimal_ir() -> IrDoc {
        let mut ir = IrDoc::new();
        ir.datasources.insert("in".to_string(), DatasourceDecl::csv("in.csv"));
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

    fn request(ops: Vec<AmendOp>, policy: Policy) -> AmendmentRequest {
        AmendmentRequest {
            format: "sans.amendment_request".to_string(),
            version: 1,
            contract_version: crate::request::CONTRACT_VERSION.to_string(),
            policy,
            ops,
        }
    }

    #[test]
    fn add_assertion_then_remove_round_trips() {
        let ir = minimal_ir();
        let add = AmendOp::AddAssertion {
            op_id: "op1".to_string(),
            table: "t".to_string(),
            assertion: Assertion {
                assertion_id: "a1".to_string(),
                table: "t".to_string(),
                predicate: Expr::call("row_count", vec![Expr::col("t")]),
                severity: None,
            },
        };
        let result = apply_amendment(&ir, &request(vec![add], Policy::default()));
        assert_eq!(result.status, MutationStatus::Ok);
        let ir_out = result.ir_out.unwrap();
        assert!(ir_out.find_step("a1").is_some());

        let remove = AmendOp::RemoveAssertion { op_id: "op2".to_string(), assertion_id: "a1".to_string() };
        let mut policy = Policy::default();
        policy.allow_destructive = true;
        let result2 = apply_amendment(&ir_out, &request(vec![remove], policy));
        assert_eq!(result2.status, MutationStatus::Ok);
        assert!(result2.ir_out.unwrap().find_step("a1").is_none());
    }

    #[test]
    fn remove_step_without_policy_is_refused() {
        let ir = minimal_ir();
        let op = AmendOp::RemoveStep {
            op_id: "op1".to_string(),
            selector: StepSelectorFlat { step_id: Some("out:t".to_string()), transform_id: None, table: None },
        };
        let result = apply_amendment(&ir, &request(vec![op], Policy::default()));
        assert_eq!(result.status, MutationStatus::Refused);
    }

    #[test]
    fn set_params_rejects_non_canonical_shape() {
        let ir = minimal_ir();
        let op = AmendOp::SetParams {
            op_id: "op1".to_string(),
            selector: StepSelectorFlat { step_id: Some("out:t".to_string()), transform_id: None, table: None },
            path: "/legacy_flag".to_string(),
            value: serde_json::json!(true),
        };
        let result = apply_amendment(&ir, &request(vec![op], Policy::default()));
        assert_eq!(result.status, MutationStatus::Refused);
    }

    #[test]
    fn add_step_collision_is_refused() {
        let ir = minimal_ir();
        let op = AmendOp::AddStep {
            op_id: "op1".to_string(),
            before_step_id: None,
            after_step_id: None,
            index: None,
            step: StepPayload {
                id: "out:dup".to_string(),
                inputs: vec!["t".to_string()],
                outputs: vec!["t".to_string()],
                op: "identity".to_string(),
                params: serde_json::json!({}),
            },
        };
        let result = apply_amendment(&ir, &request(vec![op], Policy::default()));
        assert_eq!(result.status, MutationStatus::Refused);
    }

    #[test]
    fn replace_expr_rejects_disallowed_call() {
        let ir = minimal_ir();
        let op = AmendOp::ReplaceStep {
            op_id: "op0".to_string(),
            selector: StepSelectorFlat { step_id: Some("out:t".to_string()), transform_id: None, table: None },
            op: "filter".to_string(),
            params: serde_json::json!({"predicate": {"type": "lit", "value": true}}),
            preserve_wiring: None,
        };
        let replace_expr = AmendOp::ReplaceExpr {
            op_id: "op1".to_string(),
            selector: StepSelectorFlat { step_id: Some("out:t".to_string()), transform_id: None, table: None },
            path: "/predicate".to_string(),
            expr: Expr::call("row_count", vec![Expr::col("t")]),
        };
        let result = apply_amendment(&ir, &request(vec![op, replace_expr], Policy::default()));
        assert_eq!(result.status, MutationStatus::Refused);
    }

    #[test]
    fn literal_helper_unused_warning_silencer() {
        let _ = Literal::Int(1);
    }
}
