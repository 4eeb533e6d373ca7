//! Per-table schema propagation (§4.D): one pass over the toposorted step
//! order that `sans_core::validate_structural` already derived, threading a
//! per-table column-name -> [`Type`] environment through each op.
//!
//! Grounded on `original_source/sans/sans/type_infer.py`'s per-node schema
//! walk: each op either passes its input schema through unchanged, narrows
//! it (`select`/`drop`), extends it (`compute`, `aggregate`), or replaces it
//! outright (`datasource`, `sql_select`, `transpose`).

use crate::error::CheckError;
use crate::typecheck::{infer_expr_type, SchemaEnv};
use indexmap::IndexMap;
use sans_core::ir::{ds_name_from_input, is_ds_input, AggOp, ComputeMode, IrDoc, OpParams, SelectParams, Step};
use sans_core::validate::ValidatedIr;
use sans_core::Type;

/// Per-table column schemas, keyed by table name (datasource tables keyed by
/// their plain name, not the `__datasource__`-prefixed input string).
#[derive(Debug, Clone, Default)]
pub struct Schemas {
    pub tables: IndexMap<String, SchemaEnv>,
}

impl Schemas {
    pub fn get(&self, table: &str) -> Option<&SchemaEnv> {
        self.tables.get(table)
    }
}

/// Walks `ir` in `validated.order`, inferring a concrete column schema for
/// every produced table. `datasource_schemas` supplies the starting
/// environment for each datasource (from a loaded schema lock, or sniffed
/// CSV headers); a datasource absent from it is treated as fully `UNKNOWN`.
pub fn propagate_schemas(
    ir: &IrDoc,
    validated: &ValidatedIr,
    datasource_schemas: &IndexMap<String, SchemaEnv>,
) -> Result<Schemas, CheckError> {
    let mut schemas = Schemas::default();
    for &idx in &validated.order {
        let step = &ir.steps[idx];
        if step.outputs.is_empty() {
            // save/assert/let_scalar/const: validated for type correctness
            // but produce no table of their own.
            check_side_effecting_step(step, &schemas)?;
            continue;
        }
        // `data_step` MERGE draws columns from every participating table,
        // not just the first — the single-env lookup below only ever looks
        // at one input, which is right for every other op (they all take
        // exactly one table input) but wrong for a multi-table merge.
        let env = if matches!(&step.params, OpParams::DataStep(_)) {
            let mut merged = SchemaEnv::new();
            for input in &step.inputs {
                let input_env = if is_ds_input(input) {
                    let name = ds_name_from_input(input).unwrap_or_default();
                    datasource_schemas.get(name).cloned().unwrap_or_default()
                } else {
                    schemas.tables.get(input.as_str()).cloned().unwrap_or_default()
                };
                for (col, ty) in input_env {
                    merged.insert(col, ty);
                }
            }
            merged
        } else {
            let input_table = step.inputs.iter().find(|i| !is_ds_input(i));
            let ds_table = step.inputs.iter().find(|i| is_ds_input(i));
            if let Some(ds_input) = ds_table {
                let name = ds_name_from_input(ds_input).unwrap_or_default();
                datasource_schemas.get(name).cloned().unwrap_or_default()
            } else if let Some(table) = input_table {
                schemas.tables.get(table.as_str()).cloned().unwrap_or_default()
            } else {
                SchemaEnv::new()
            }
        };

        let out_env = propagate_one(step, env)?;
        schemas.tables.insert(step.outputs[0].clone(), out_env);
    }
    Ok(schemas)
}

fn check_side_effecting_step(step: &Step, schemas: &Schemas) -> Result<(), CheckError> {
    match &step.params {
        OpParams::Assert(p) => {
            let env = input_env(step, schemas);
            infer_expr_type(&p.predicate, &env, step.loc.as_ref())?;
            Ok(())
        }
        OpParams::LetScalar(p) => {
            infer_expr_type(&p.expr, &SchemaEnv::new(), step.loc.as_ref())?;
            Ok(())
        }
        _ => Ok(()),
    }
}

fn input_env(step: &Step, schemas: &Schemas) -> SchemaEnv {
    step.inputs
        .iter()
        .find(|i| !is_ds_input(i))
        .and_then(|t| schemas.tables.get(t.as_str()))
        .cloned()
        .unwrap_or_default()
}

fn propagate_one(step: &Step, env: SchemaEnv) -> Result<SchemaEnv, CheckError> {
    match &step.params {
        OpParams::Datasource(_) => Ok(env),
        OpParams::Identity(_) => Ok(env),
        OpParams::Filter(p) => {
            infer_expr_type(&p.predicate, &env, step.loc.as_ref())?;
            Ok(env)
        }
        OpParams::Compute(p) => {
            let mut out = env.clone();
            for assignment in &p.assignments {
                let exists = env.contains_key(&assignment.target);
                match p.mode {
                    ComputeMode::Derive if exists => {
                        return Err(CheckError::InvalidUpdate {
                            name: assignment.target.clone(),
                            loc: step.loc.clone(),
                        });
                    }
                    ComputeMode::Update if !exists => {
                        return Err(CheckError::StrictMutation {
                            name: assignment.target.clone(),
                            loc: step.loc.clone(),
                        });
                    }
                    _ => {}
                }
                let t = infer_expr_type(&assignment.expr, &out, step.loc.as_ref())?;
                out.insert(assignment.target.clone(), t);
            }
            Ok(out)
        }
        OpParams::Select(sel) => {
            let mut out = SchemaEnv::new();
            match sel {
                SelectParams::Cols { cols } => {
                    for c in cols {
                        let t = env.get(c.as_str()).copied().ok_or_else(|| CheckError::UnknownColumn {
                            name: c.clone(),
                            loc: step.loc.clone(),
                        })?;
                        out.insert(c.clone(), t);
                    }
                }
                SelectParams::Drop { drop } => {
                    for (name, t) in &env {
                        if !drop.contains(name) {
                            out.insert(name.clone(), *t);
                        }
                    }
                }
            }
            Ok(out)
        }
        OpParams::Drop(p) => {
            let mut out = SchemaEnv::new();
            for (name, t) in &env {
                if !p.cols.contains(name) {
                    out.insert(name.clone(), *t);
                }
            }
            Ok(out)
        }
        OpParams::Rename(p) => {
            let mut out = SchemaEnv::new();
            for (name, t) in &env {
                let renamed_to = p.mapping.iter().find(|m| &m.from == name).map(|m| m.to.clone());
                out.insert(renamed_to.unwrap_or_else(|| name.clone()), *t);
            }
            Ok(out)
        }
        OpParams::Sort(_) => Ok(env),
        OpParams::Cast(p) => {
            let mut out = env.clone();
            for c in &p.casts {
                if !out.contains_key(&c.col) {
                    return Err(CheckError::UnknownColumn {
                        name: c.col.clone(),
                        loc: step.loc.clone(),
                    });
                }
                let new_type = match c.to {
                    sans_core::ir::CastType::Int => Type::Int,
                    sans_core::ir::CastType::Decimal => Type::Decimal,
                    sans_core::ir::CastType::Str => Type::String,
                    sans_core::ir::CastType::Bool => Type::Bool,
                    sans_core::ir::CastType::Date | sans_core::ir::CastType::Datetime => Type::String,
                };
                out.insert(c.col.clone(), new_type);
            }
            Ok(out)
        }
        OpParams::Aggregate(p) => {
            let mut out = SchemaEnv::new();
            for g in &p.group_by {
                let t = env.get(g.as_str()).copied().ok_or_else(|| CheckError::UnknownColumn {
                    name: g.clone(),
                    loc: step.loc.clone(),
                })?;
                out.insert(g.clone(), t);
            }
            for m in &p.metrics {
                let metric_type = match m.op {
                    AggOp::Count | AggOp::N => Type::Int,
                    AggOp::Mean => Type::Decimal,
                    AggOp::Sum | AggOp::Min | AggOp::Max => {
                        let t = env.get(m.col.as_str()).copied().ok_or_else(|| CheckError::UnknownColumn {
                            name: m.col.clone(),
                            loc: step.loc.clone(),
                        })?;
                        if !t.is_numeric() && m.op == AggOp::Sum {
                            return Err(CheckError::Type {
                                detail: format!("metric '{}': sum requires a numeric column", m.name),
                                left: t.name(),
                                right: t.name(),
                                loc: step.loc.clone(),
                            });
                        }
                        t
                    }
                };
                out.insert(m.name.clone(), metric_type);
            }
            Ok(out)
        }
        // SAS-only intermediate ops: their output schema is not fully
        // determined by the closed op vocabulary alone (transpose's output
        // columns depend on runtime data values). Treated as unknown.
        OpParams::Transpose(p) => {
            let mut out = SchemaEnv::new();
            for b in &p.by {
                if let Some(t) = env.get(b.as_str()) {
                    out.insert(b.clone(), *t);
                }
            }
            Ok(out)
        }
        OpParams::SqlSelect(p) => {
            let mut out = SchemaEnv::new();
            for c in &p.select {
                out.insert(c.clone(), env.get(c.as_str()).copied().unwrap_or(Type::Unknown));
            }
            for m in &p.metrics {
                out.insert(m.name.clone(), Type::Unknown);
            }
            Ok(out)
        }
        // The merged env built in `propagate_schemas` is already the right
        // output schema for a merge.
        OpParams::DataStep(_) => Ok(env),
        OpParams::Format(_) | OpParams::Save(_) | OpParams::Assert(_) | OpParams::LetScalar(_) | OpParams::Const(_) => {
            Ok(env)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sans_core::expr::Expr;
    use sans_core::ir::*;
    use sans_core::validate::{validate_structural, ValidateOptions};

    fn ds_step(name: &str) -> Step {
        Step {
            id: format!("ds:{name}"),
            inputs: vec![],
            outputs: vec![ds_input(name)],
            params: OpParams::Datasource(DatasourceParams {
                name: name.to_string(),
                kind: DatasourceKind::Csv,
                path: Some(format!("{name}.csv")),
                columns: None,
                inline_text: None,
                inline_sha256: None,
            }),
            loc: None,
        }
    }

    fn save_step(table: &str) -> Step {
        Step {
            id: format!("out:{table}:save"),
            inputs: vec![table.to_string()],
            outputs: vec![],
            params: OpParams::Save(SaveParams {
                path: format!("{table}.csv"),
                name: None,
            }),
            loc: None,
        }
    }

    fn base_ir() -> (IrDoc, IndexMap<String, SchemaEnv>) {
        let mut ir = IrDoc::new();
        ir.datasources.insert("in".to_string(), DatasourceDecl::csv("in.csv"));
        ir.steps.push(ds_step("in"));
        let mut ds_schemas = IndexMap::new();
        let mut env = SchemaEnv::new();
        env.insert("a".to_string(), Type::Int);
        env.insert("b".to_string(), Type::Int);
        ds_schemas.insert("in".to_string(), env);
        (ir, ds_schemas)
    }

    #[test]
    fn compute_derive_adds_new_column() {
        let (mut ir, ds) = base_ir();
        ir.steps.push(Step {
            id: "out:t".to_string(),
            inputs: vec![ds_input("in")],
            outputs: vec!["t".to_string()],
            params: OpParams::Compute(ComputeParams {
                mode: ComputeMode::Derive,
                assignments: vec![Assignment {
                    target: "c".to_string(),
                    expr: Expr::binop(sans_core::expr::BinOp::Add, Expr::col("a"), Expr::col("b")),
                }],
            }),
            loc: None,
        });
        ir.steps.push(save_step("t"));
        let validated = validate_structural(&ir, ValidateOptions::default()).unwrap();
        let schemas = propagate_schemas(&ir, &validated, &ds).unwrap();
        assert_eq!(schemas.get("t").unwrap().get("c"), Some(&Type::Int));
    }

    #[test]
    fn compute_derive_on_existing_column_fails() {
        let (mut ir, ds) = base_ir();
        ir.steps.push(Step {
            id: "out:t".to_string(),
            inputs: vec![ds_input("in")],
            outputs: vec!["t".to_string()],
            params: OpParams::Compute(ComputeParams {
                mode: ComputeMode::Derive,
                assignments: vec![Assignment {
                    target: "a".to_string(),
                    expr: Expr::lit(sans_core::types::Literal::Int(1)),
                }],
            }),
            loc: None,
        });
        ir.steps.push(save_step("t"));
        let validated = validate_structural(&ir, ValidateOptions::default()).unwrap();
        let err = propagate_schemas(&ir, &validated, &ds).unwrap_err();
        assert_eq!(err.code(), "E_INVALID_UPDATE");
    }

    #[test]
    fn compute_update_on_missing_column_fails() {
        let (mut ir, ds) = base_ir();
        ir.steps.push(Step {
            id: "out:t".to_string(),
            inputs: vec![ds_input("in")],
            outputs: vec!["t".to_string()],
            params: OpParams::Compute(ComputeParams {
                mode: ComputeMode::Update,
                assignments: vec![Assignment {
                    target: "ghost".to_string(),
                    expr: Expr::lit(sans_core::types::Literal::Int(1)),
                }],
            }),
            loc: None,
        });
        ir.steps.push(save_step("t"));
        let validated = validate_structural(&ir, ValidateOptions::default()).unwrap();
        let err = propagate_schemas(&ir, &validated, &ds).unwrap_err();
        assert_eq!(err.code(), "E_STRICT_MUTATION");
    }

    #[test]
    fn select_unknown_column_fails() {
        let (mut ir, ds) = base_ir();
        ir.steps.push(Step {
            id: "out:t".to_string(),
            inputs: vec![ds_input("in")],
            outputs: vec!["t".to_string()],
            params: OpParams::Select(SelectParams::Cols { cols: vec!["ghost".to_string()] }),
            loc: None,
        });
        ir.steps.push(save_step("t"));
        let validated = validate_structural(&ir, ValidateOptions::default()).unwrap();
        let err = propagate_schemas(&ir, &validated, &ds).unwrap_err();
        assert_eq!(err.code(), "E_UNKNOWN_COLUMN");
    }

    #[test]
    fn aggregate_mean_is_decimal_and_count_is_int() {
        let (mut ir, ds) = base_ir();
        ir.steps.push(Step {
            id: "out:t".to_string(),
            inputs: vec![ds_input("in")],
            outputs: vec!["t".to_string()],
            params: OpParams::Aggregate(AggregateParams {
                group_by: vec!["a".to_string()],
                metrics: vec![
                    Metric { name: "avg_b".to_string(), op: AggOp::Mean, col: "b".to_string() },
                    Metric { name: "n".to_string(), op: AggOp::Count, col: "b".to_string() },
                ],
            }),
            loc: None,
        });
        ir.steps.push(save_step("t"));
        let validated = validate_structural(&ir, ValidateOptions::default()).unwrap();
        let schemas = propagate_schemas(&ir, &validated, &ds).unwrap();
        let t = schemas.get("t").unwrap();
        assert_eq!(t.get("avg_b"), Some(&Type::Decimal));
        assert_eq!(t.get("n"), Some(&Type::Int));
    }

    #[test]
    fn rename_preserves_type() {
        let (mut ir, ds) = base_ir();
        ir.steps.push(Step {
            id: "out:t".to_string(),
            inputs: vec![ds_input("in")],
            outputs: vec!["t".to_string()],
            params: OpParams::Rename(RenameParams {
                mapping: vec![RenameEntry { from: "a".to_string(), to: "z".to_string() }],
            }),
            loc: None,
        });
        ir.steps.push(save_step("t"));
        let validated = validate_structural(&ir, ValidateOptions::default()).unwrap();
        let schemas = propagate_schemas(&ir, &validated, &ds).unwrap();
        assert_eq!(schemas.get("t").unwrap().get("z"), Some(&Type::Int));
        assert_eq!(schemas.get("t").unwrap().get("a"), None);
    }

    #[test]
    fn cast_changes_column_type() {
        let (mut ir, ds) = base_ir();
        ir.steps.push(Step {
            id: "out:t".to_string(),
            inputs: vec![ds_input("in")],
            outputs: vec!["t".to_string()],
            params: OpParams::Cast(CastParams {
                casts: vec![CastEntry {
                    col: "a".to_string(),
                    to: CastType::Str,
                    on_error: OnError::Fail,
                    trim: false,
                }],
            }),
            loc: None,
        });
        ir.steps.push(save_step("t"));
        let validated = validate_structural(&ir, ValidateOptions::default()).unwrap();
        let schemas = propagate_schemas(&ir, &validated, &ds).unwrap();
        assert_eq!(schemas.get("t").unwrap().get("a"), Some(&Type::String));
    }
}
