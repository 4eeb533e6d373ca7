//! Structural and assertion diff payloads, grounded on
//! `original_source/sans/sans/amendment/diff.py`.
//!
//! The engine works over the canonical JSON shape of the IR (`{version,
//! datasources, steps}`) rather than the typed [`sans_core::ir::IrDoc`]
//! directly, so these builders read `serde_json::Value` the same way the
//! Python original walked plain dicts.

use sans_core::canon::canonical_sha256;
use sans_core::CoreError;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

pub const DATASOURCE_PREFIX: &str = "__datasource__";

fn derive_transform_id(step: &Value) -> Result<String, CoreError> {
    let payload = serde_json::json!({
        "op": step.get("op").cloned().unwrap_or(Value::Null),
        "params": step.get("params").cloned().unwrap_or(Value::Object(Default::default())),
    });
    canonical_sha256(&payload)
}

fn step_array(ir: &Value) -> &[Value] {
    ir.get("steps").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

/// Every non-datasource table name any step in `ir` produces. Used to check
/// `add_step`/`rewire_outputs`/`rename_table` for output-table collisions.
pub fn build_table_universe(ir: &Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for step in step_array(ir) {
        let Some(outputs) = step.get("outputs").and_then(Value::as_array) else {
            continue;
        };
        for out in outputs {
            if let Some(s) = out.as_str() {
                if !s.is_empty() && !s.starts_with(DATASOURCE_PREFIX) {
                    names.insert(s.to_string());
                }
            }
        }
    }
    names
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformChange {
    pub before: String,
    pub after: String,
    pub step_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Affected {
    pub steps: Vec<String>,
    pub tables: Vec<String>,
    pub transforms_added: Vec<String>,
    pub transforms_removed: Vec<String>,
    pub transforms_changed: Vec<TransformChange>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpApplied {
    pub op_id: String,
    pub kind: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StructuralDiff {
    pub format: String,
    pub version: u32,
    pub base_ir_sha256: String,
    pub mutated_ir_sha256: String,
    pub ops_applied: Vec<OpApplied>,
    pub affected: Affected,
}

pub fn build_structural_diff(
    ir_in: &Value,
    ir_out: &Value,
    ops_applied: Vec<OpApplied>,
    affected_steps: Vec<String>,
    affected_tables: Vec<String>,
) -> Result<StructuralDiff, CoreError> {
    let mut in_by_id = std::collections::BTreeMap::new();
    for step in step_array(ir_in) {
        if let Some(id) = step.get("id").and_then(Value::as_str) {
            in_by_id.insert(id.to_string(), derive_transform_id(step)?);
        }
    }
    let mut out_by_id = std::collections::BTreeMap::new();
    for step in step_array(ir_out) {
        if let Some(id) = step.get("id").and_then(Value::as_str) {
            out_by_id.insert(id.to_string(), derive_transform_id(step)?);
        }
    }

    let in_ids: BTreeSet<&String> = in_by_id.keys().collect();
    let out_ids: BTreeSet<&String> = out_by_id.keys().collect();

    let transforms_added: BTreeSet<String> = out_ids
        .difference(&in_ids)
        .map(|id| out_by_id[*id].clone())
        .collect();
    let transforms_removed: BTreeSet<String> = in_ids
        .difference(&out_ids)
        .map(|id| in_by_id[*id].clone())
        .collect();

    let mut transforms_changed = Vec::new();
    for id in in_ids.intersection(&out_ids) {
        let before = &in_by_id[*id];
        let after = &out_by_id[*id];
        if before != after {
            transforms_changed.push(TransformChange {
                before: before.clone(),
                after: after.clone(),
                step_id: (*id).clone(),
            });
        }
    }
    transforms_changed.sort_by(|a, b| a.step_id.cmp(&b.step_id));

    let steps: BTreeSet<String> = affected_steps.into_iter().collect();
    let tables: BTreeSet<String> = affected_tables.into_iter().collect();

    Ok(StructuralDiff {
        format: "sans.mutation.diff.structural".to_string(),
        version: 1,
        base_ir_sha256: canonical_sha256(ir_in)?,
        mutated_ir_sha256: canonical_sha256(ir_out)?,
        ops_applied,
        affected: Affected {
            steps: steps.into_iter().collect(),
            tables: tables.into_iter().collect(),
            transforms_added: transforms_added.into_iter().collect(),
            transforms_removed: transforms_removed.into_iter().collect(),
            transforms_changed,
        },
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ModifiedAssertion {
    pub before: Value,
    pub after: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssertionDiff {
    pub format: String,
    pub version: u32,
    pub added: Vec<Value>,
    pub removed: Vec<Value>,
    pub modified: Vec<ModifiedAssertion>,
}

/// Assertion records are keyed by `assertion_id`; each is the JSON snapshot
/// built by [`crate::engine::assertion_records`] for an `assert`-op step.
pub fn build_assertion_diff(before: &[(String, Value)], after: &[(String, Value)]) -> AssertionDiff {
    let before_by_id: std::collections::BTreeMap<&String, &Value> =
        before.iter().map(|(id, v)| (id, v)).collect();
    let after_by_id: std::collections::BTreeMap<&String, &Value> =
        after.iter().map(|(id, v)| (id, v)).collect();
    let before_ids: BTreeSet<&String> = before_by_id.keys().copied().collect();
    let after_ids: BTreeSet<&String> = after_by_id.keys().copied().collect();

    let added: Vec<Value> = after_ids
        .difference(&before_ids)
        .map(|id| (*after_by_id[*id]).clone())
        .collect();
    let removed: Vec<Value> = before_ids
        .difference(&after_ids)
        .map(|id| (*before_by_id[*id]).clone())
        .collect();

    let mut modified = Vec::new();
    for id in before_ids.intersection(&after_ids) {
        let b = before_by_id[*id];
        let a = after_by_id[*id];
        if b != a {
            modified.push(ModifiedAssertion {
                before: b.clone(),
                after: a.clone(),
            });
        }
    }

    AssertionDiff {
        format: "sans.mutation.diff.assertions".to_string(),
        version: 1,
        added,
        removed,
        modified,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub format: String,
    pub version: u32,
    pub status: String,
    pub refusals: Vec<Value>,
    pub warnings: Vec<Value>,
}

pub fn build_diagnostics(status: &str, refusals: Vec<Value>, warnings: Vec<Value>) -> Diagnostics {
    Diagnostics {
        format: "sans.mutation.diagnostics".to_string(),
        version: 1,
        status: status.to_string(),
        refusals,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_universe_skips_datasource_pseudo_tables() {
        let ir = json!({
            "steps": [
                {"id": "ds:in", "op": "datasource", "inputs": [], "outputs": ["__datasource__in"], "params": {}},
                {"id": "out:t", "op": "identity", "inputs": ["__datasource__in"], "outputs": ["t"], "params": {}},
            ]
        });
        let universe = build_table_universe(&ir);
        assert_eq!(universe.len(), 1);
        assert!(universe.contains("t"));
    }

    #[test]
    fn structural_diff_detects_changed_transform() {
        let ir_in = json!({"steps": [{"id": "s1", "op": "identity", "inputs": [], "outputs": ["t"], "params": {}}]});
        let ir_out = json!({"steps": [{"id": "s1", "op": "filter", "inputs": [], "outputs": ["t"], "params": {"predicate": {"type": "lit", "value": true}}}]});
        let diff = build_structural_diff(&ir_in, &ir_out, vec![], vec![], vec![]).unwrap();
        assert_eq!(diff.affected.transforms_changed.len(), 1);
        assert_eq!(diff.affected.transforms_changed[0].step_id, "s1");
    }

    #[test]
    fn assertion_diff_tracks_added_and_removed() {
        let before = vec![("a1".to_string(), json!({"assertion_id": "a1"}))];
        let after = vec![("a2".to_string(), json!({"assertion_id": "a2"}))];
        let diff = build_assertion_diff(&before, &after);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.removed.len(), 1);
        assert!(diff.modified.is_empty());
    }
}
