//! Semantic validation and IR lowering for the native `.sans` dialect.
//!
//! Names live in one of three kinds — `scalar` (let/const), `table`, or
//! `datasource` — and a name can only ever hold one kind for the lifetime of
//! a script (`E_KIND_LOCK`). `const` bindings are inlined as literals into
//! every expression that references them by name; `let` bindings stay
//! symbolic and lower to their own `let_scalar` step. Both count toward the
//! unused-binding warning.

use std::collections::HashMap;

use indexmap::IndexMap;
use sans_core::diagnostic::{Diagnostic, Loc};
use sans_core::expr::Expr;
use sans_core::ir::*;
use sans_core::types::Literal;

use crate::ast::*;
use crate::error::FrontendError;

type PResult<T> = Result<T, FrontendError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Scalar,
    Table,
    Datasource,
}

impl Kind {
    fn label(self) -> &'static str {
        match self {
            Kind::Scalar => "scalar",
            Kind::Table => "table",
            Kind::Datasource => "datasource",
        }
    }
}

struct LowerCtx {
    file: String,
    ir: IrDoc,
    kinds: HashMap<String, Kind>,
    table_schemas: HashMap<String, Option<Vec<String>>>,
    const_bindings: IndexMap<String, Literal>,
    scalar_decls: IndexMap<String, Loc>,
    used_scalars: std::collections::HashSet<String>,
    temp_counters: HashMap<String, u32>,
    step_seq: u32,
}

impl LowerCtx {
    fn loc(&self, line: u32) -> Loc {
        Loc::new(self.file.clone(), line, line)
    }

    fn next_id(&mut self, op: &str) -> String {
        self.step_seq += 1;
        format!("{op}:{}", self.step_seq)
    }

    fn fresh(&mut self, base: &str) -> String {
        let n = self.temp_counters.entry(base.to_string()).or_insert(0);
        *n += 1;
        format!("{base}__{n}")
    }

    fn check_kind_lock(&mut self, name: &str, kind: Kind, loc: &Loc) -> PResult<()> {
        if let Some(existing) = self.kinds.get(name) {
            if *existing != kind {
                return Err(FrontendError::KindLock {
                    name: name.to_string(),
                    existing_kind: existing.label(),
                    new_kind: kind.label(),
                    loc: loc.clone(),
                });
            }
            return Err(FrontendError::KindLock {
                name: name.to_string(),
                existing_kind: existing.label(),
                new_kind: kind.label(),
                loc: loc.clone(),
            });
        }
        self.kinds.insert(name.to_string(), kind);
        Ok(())
    }

    /// Walks an expression marking scalar usage and rejecting column
    /// references that collide with a table/datasource name.
    fn mark_usage(&mut self, expr: &Expr, loc: &Loc) -> PResult<()> {
        match expr {
            Expr::Col { name } => match self.kinds.get(name).copied() {
                Some(Kind::Scalar) => {
                    self.used_scalars.insert(name.clone());
                    Ok(())
                }
                Some(Kind::Table) => Err(FrontendError::KindLock {
                    name: name.clone(),
                    existing_kind: "table",
                    new_kind: "scalar",
                    loc: loc.clone(),
                }),
                Some(Kind::Datasource) => Err(FrontendError::KindLock {
                    name: name.clone(),
                    existing_kind: "datasource",
                    new_kind: "scalar",
                    loc: loc.clone(),
                }),
                None => Ok(()),
            },
            Expr::Lit { .. } => Ok(()),
            Expr::Binop { left, right, .. } => {
                self.mark_usage(left, loc)?;
                self.mark_usage(right, loc)
            }
            Expr::Boolop { args, .. } => {
                for a in args {
                    self.mark_usage(a, loc)?;
                }
                Ok(())
            }
            Expr::Unop { arg, .. } => self.mark_usage(arg, loc),
            Expr::Call { args, .. } => {
                for a in args {
                    self.mark_usage(a, loc)?;
                }
                Ok(())
            }
        }
    }

    fn substitute_consts(&self, expr: &Expr) -> Expr {
        match expr {
            Expr::Col { name } => match self.const_bindings.get(name) {
                Some(lit) => Expr::lit(lit.clone()),
                None => expr.clone(),
            },
            Expr::Lit { .. } => expr.clone(),
            Expr::Binop { op, left, right } => Expr::binop(
                *op,
                self.substitute_consts(left),
                self.substitute_consts(right),
            ),
            Expr::Boolop { op, args } => {
                Expr::boolop(*op, args.iter().map(|a| self.substitute_consts(a)).collect())
            }
            Expr::Unop { op, arg } => Expr::unop(*op, self.substitute_consts(arg)),
            Expr::Call { name, args } => Expr::call(
                name.clone(),
                args.iter().map(|a| self.substitute_consts(a)).collect(),
            ),
        }
    }

    fn prepare_expr(&mut self, expr: &Expr, loc: &Loc) -> PResult<Expr> {
        self.mark_usage(expr, loc)?;
        Ok(self.substitute_consts(expr))
    }

    fn resolve_ref(&self, name: &str, loc: &Loc) -> PResult<String> {
        match self.kinds.get(name) {
            Some(Kind::Table) => Ok(name.to_string()),
            Some(Kind::Datasource) => Ok(ds_input(name)),
            Some(Kind::Scalar) => Err(FrontendError::KindLock {
                name: name.to_string(),
                existing_kind: "scalar",
                new_kind: "table",
                loc: loc.clone(),
            }),
            None => {
                let known_tables: Vec<&str> = self
                    .kinds
                    .iter()
                    .filter(|(_, k)| **k == Kind::Table)
                    .map(|(n, _)| n.as_str())
                    .collect();
                let known_datasources: Vec<&str> = self
                    .kinds
                    .iter()
                    .filter(|(_, k)| **k == Kind::Datasource)
                    .map(|(n, _)| n.as_str())
                    .collect();
                let mut known_tables = known_tables;
                let mut known_datasources = known_datasources;
                known_tables.sort();
                known_datasources.sort();
                Err(FrontendError::UndeclaredSource {
                    name: name.to_string(),
                    known_tables: known_tables.join(", "),
                    known_datasources: known_datasources.join(", "),
                    loc: loc.clone(),
                })
            }
        }
    }

    fn schema_of(&self, table_or_ds_id: &str) -> Option<Vec<String>> {
        if let Some(ds_name) = ds_name_from_input(table_or_ds_id) {
            return self.table_schemas.get(ds_name).cloned().flatten();
        }
        self.table_schemas.get(table_or_ds_id).cloned().flatten()
    }
}

pub fn lower_program(program: &Program, file: &str) -> PResult<(IrDoc, Vec<Diagnostic>)> {
    let mut ctx = LowerCtx {
        file: file.to_string(),
        ir: IrDoc::new(),
        kinds: HashMap::new(),
        table_schemas: HashMap::new(),
        const_bindings: IndexMap::new(),
        scalar_decls: IndexMap::new(),
        used_scalars: std::collections::HashSet::new(),
        temp_counters: HashMap::new(),
        step_seq: 0,
    };

    // Pre-pass: collect every const binding so forward references inline
    // correctly regardless of declaration order.
    for stmt in &program.statements {
        if let Stmt::Const { bindings, .. } = stmt {
            for (name, lit) in bindings {
                ctx.const_bindings.insert(name.clone(), lit.clone());
            }
        }
    }

    for stmt in &program.statements {
        lower_stmt(&mut ctx, stmt)?;
    }

    let mut warnings = Vec::new();
    for (name, loc) in &ctx.scalar_decls {
        if !ctx.used_scalars.contains(name) {
            let mut d = Diagnostic::new("W_UNUSED_LET", format!("unused let binding '{name}'"));
            d.loc = Some(loc.clone());
            warnings.push(d);
        }
    }

    Ok((ctx.ir, warnings))
}

fn lower_stmt(ctx: &mut LowerCtx, stmt: &Stmt) -> PResult<()> {
    match stmt {
        Stmt::Let { name, expr, loc } => {
            ctx.check_kind_lock(name, Kind::Scalar, loc)?;
            let expr = ctx.prepare_expr(expr, loc)?;
            ctx.scalar_decls.insert(name.clone(), loc.clone());
            let id = ctx.next_id("let_scalar");
            ctx.ir.steps.push(Step {
                id,
                inputs: vec![],
                outputs: vec![],
                params: OpParams::LetScalar(LetScalarParams { name: name.clone(), expr }),
                loc: Some(loc.clone()),
            });
            Ok(())
        }
        Stmt::Const { bindings, loc } => {
            let mut canon: IndexMap<String, Literal> = IndexMap::new();
            for (name, lit) in bindings {
                ctx.check_kind_lock(name, Kind::Scalar, loc)?;
                ctx.scalar_decls.insert(name.clone(), loc.clone());
                canon.insert(name.clone(), lit.clone());
            }
            let id = ctx.next_id("const");
            ctx.ir.steps.push(Step {
                id,
                inputs: vec![],
                outputs: vec![],
                params: OpParams::Const(ConstParams { bindings: canon }),
                loc: Some(loc.clone()),
            });
            Ok(())
        }
        Stmt::Datasource { name, spec, loc } => {
            ctx.check_kind_lock(name, Kind::Datasource, loc)?;
            let (kind, path, columns, inline_text, inline_sha256, schema) = match spec {
                DatasourceSpec::Csv { path, columns } => {
                    (DatasourceKind::Csv, Some(path.clone()), columns.clone(), None, None, columns.clone())
                }
                DatasourceSpec::InlineCsv { columns, body } => {
                    let sha = sans_core::canon::sha256_hex(body.as_bytes());
                    let header: Vec<String> = body
                        .lines()
                        .next()
                        .map(|l| l.split(',').map(|s| s.trim().to_string()).collect())
                        .unwrap_or_default();
                    let schema = columns.clone().or_else(|| (!header.is_empty()).then_some(header));
                    (DatasourceKind::InlineCsv, None, columns.clone(), Some(body.clone()), Some(sha), schema)
                }
            };
            ctx.ir.datasources.insert(
                name.clone(),
                DatasourceDecl {
                    kind,
                    path: path.clone(),
                    columns: columns.clone(),
                    column_types: None,
                    inline_text: inline_text.clone(),
                    inline_sha256: inline_sha256.clone(),
                },
            );
            ctx.table_schemas.insert(name.clone(), schema);
            let id = ctx.next_id("datasource");
            ctx.ir.steps.push(Step {
                id,
                inputs: vec![],
                outputs: vec![ds_input(name)],
                params: OpParams::Datasource(DatasourceParams {
                    name: name.clone(),
                    kind,
                    path,
                    columns,
                    inline_text,
                    inline_sha256,
                }),
                loc: Some(loc.clone()),
            });
            Ok(())
        }
        Stmt::Table { name, expr, loc } => {
            ctx.check_kind_lock(name, Kind::Table, loc)?;
            let schema = lower_table_expr_chain(ctx, name, expr, Some(name.clone()))?;
            ctx.table_schemas.insert(name.clone(), schema);
            let _ = loc;
            Ok(())
        }
        Stmt::Save { table, path, artifact_name, loc } => {
            ctx.resolve_ref(table, loc)?;
            let id = ctx.next_id("save");
            ctx.ir.steps.push(Step {
                id,
                inputs: vec![table.clone()],
                outputs: vec![],
                params: OpParams::Save(SaveParams { path: path.clone(), name: artifact_name.clone() }),
                loc: Some(loc.clone()),
            });
            Ok(())
        }
        Stmt::Assert { expr, loc } => {
            let expr = ctx.prepare_expr(expr, loc)?;
            let id = ctx.next_id("assert");
            ctx.ir.steps.push(Step {
                id,
                inputs: vec![],
                outputs: vec![],
                params: OpParams::Assert(AssertParams { predicate: expr, severity: None }),
                loc: Some(loc.clone()),
            });
            Ok(())
        }
    }
}

/// Schema returned here is a plain column-name list (no types) — enough to
/// catch `select`/`drop`/`rename`/`derive` misuse at lowering time; the full
/// typed schema pass lives downstream in the checker.
fn lower_table_expr_chain(
    ctx: &mut LowerCtx,
    parent: &str,
    texpr: &TableExpr,
    final_name: Option<String>,
) -> PResult<Option<Vec<String>>> {
    let (mut current, mut schema) = lower_source(ctx, parent, &texpr.source)?;

    if texpr.transforms.is_empty() {
        if let Some(name) = &final_name {
            let id = ctx.next_id("identity");
            ctx.ir.steps.push(Step {
                id,
                inputs: vec![current.clone()],
                outputs: vec![name.clone()],
                params: OpParams::Identity(IdentityParams {}),
                loc: None,
            });
        }
        return Ok(schema);
    }

    let n = texpr.transforms.len();
    for (i, transform) in texpr.transforms.iter().enumerate() {
        let is_last = i == n - 1;
        let out = match (is_last, &final_name) {
            (true, Some(name)) => name.clone(),
            _ => ctx.fresh(parent),
        };
        schema = lower_transform(ctx, transform, &current, &out, schema)?;
        current = out;
    }
    Ok(schema)
}

fn lower_source(
    ctx: &mut LowerCtx,
    parent: &str,
    source: &Source,
) -> PResult<(String, Option<Vec<String>>)> {
    match source {
        Source::From(name) | Source::Bare(name) => {
            let loc = ctx.loc(0);
            let id = ctx.resolve_ref(name, &loc)?;
            let schema = ctx.schema_of(&id);
            Ok((id, schema))
        }
        Source::Sort(inner, builder) => {
            let (inner_id, inner_schema) = lower_table_expr_inner(ctx, parent, inner)?;
            let by = builder
                .by
                .iter()
                .map(|(col, desc)| SortKey { col: col.clone(), desc: *desc })
                .collect();
            let out = ctx.fresh(parent);
            let id = ctx.next_id("sort");
            ctx.ir.steps.push(Step {
                id,
                inputs: vec![inner_id],
                outputs: vec![out.clone()],
                params: OpParams::Sort(SortParams { by, nodupkey: builder.nodupkey }),
                loc: None,
            });
            Ok((out, inner_schema))
        }
        Source::Aggregate(inner, builder) => {
            let (inner_id, _inner_schema) = lower_table_expr_inner(ctx, parent, inner)?;
            let mut group_by = builder.by.clone();
            for c in &builder.class {
                if !group_by.contains(c) {
                    group_by.push(c.clone());
                }
            }
            let stats: Vec<String> = if builder.stats.is_empty() {
                vec!["mean".to_string()]
            } else {
                builder.stats.clone()
            };
            let mut metrics = Vec::new();
            for col in &builder.var {
                for stat in &stats {
                    let op = match stat.as_str() {
                        "mean" => AggOp::Mean,
                        "sum" => AggOp::Sum,
                        "min" => AggOp::Min,
                        "max" => AggOp::Max,
                        "count" => AggOp::Count,
                        "n" => AggOp::N,
                        other => {
                            return Err(FrontendError::BadExpr(
                                format!("unknown aggregate stat '{other}'"),
                                ctx.loc(0),
                            ))
                        }
                    };
                    metrics.push(Metric { name: format!("{col}_{stat}"), op, col: col.clone() });
                }
            }
            let mut schema: Vec<String> = group_by.clone();
            schema.extend(metrics.iter().map(|m| m.name.clone()));
            let out = ctx.fresh(parent);
            let id = ctx.next_id("aggregate");
            ctx.ir.steps.push(Step {
                id,
                inputs: vec![inner_id],
                outputs: vec![out.clone()],
                params: OpParams::Aggregate(AggregateParams { group_by, metrics }),
                loc: None,
            });
            Ok((out, Some(schema)))
        }
    }
}

/// Lowers a nested table expression (the inner table of `sort(...)` /
/// `aggregate(...)`) to a temp chain, without declaring it as a top-level
/// name.
fn lower_table_expr_inner(
    ctx: &mut LowerCtx,
    parent: &str,
    texpr: &TableExpr,
) -> PResult<(String, Option<Vec<String>>)> {
    let (mut current, mut schema) = lower_source(ctx, parent, &texpr.source)?;
    for transform in &texpr.transforms {
        let out = ctx.fresh(parent);
        schema = lower_transform(ctx, transform, &current, &out, schema)?;
        current = out;
    }
    Ok((current, schema))
}

fn lower_transform(
    ctx: &mut LowerCtx,
    transform: &Transform,
    input: &str,
    output: &str,
    schema: Option<Vec<String>>,
) -> PResult<Option<Vec<String>>> {
    let loc = ctx.loc(0);
    match transform {
        Transform::Select(cols) => {
            if let Some(known) = &schema {
                for c in cols {
                    if !known.contains(c) {
                        return Err(FrontendError::UnknownColumn { name: c.clone(), loc });
                    }
                }
            }
            let id = ctx.next_id("select");
            ctx.ir.steps.push(Step {
                id,
                inputs: vec![input.to_string()],
                outputs: vec![output.to_string()],
                params: OpParams::Select(SelectParams::Cols { cols: cols.clone() }),
                loc: None,
            });
            Ok(Some(cols.clone()))
        }
        Transform::Filter(expr) => {
            let expr = ctx.prepare_expr(expr, &loc)?;
            let id = ctx.next_id("filter");
            ctx.ir.steps.push(Step {
                id,
                inputs: vec![input.to_string()],
                outputs: vec![output.to_string()],
                params: OpParams::Filter(FilterParams { predicate: expr }),
                loc: None,
            });
            Ok(schema)
        }
        Transform::Derive(assigns) => {
            let mut new_schema = schema.clone();
            let mut assignments = Vec::new();
            for a in assigns {
                if let Some(known) = &mut new_schema {
                    let exists = known.contains(&a.target);
                    if a.is_update && !exists {
                        return Err(FrontendError::StrictMutation { name: a.target.clone(), loc });
                    }
                    if !a.is_update && exists {
                        return Err(FrontendError::InvalidUpdate { name: a.target.clone(), loc });
                    }
                    if !exists {
                        known.push(a.target.clone());
                    }
                }
                let expr = ctx.prepare_expr(&a.expr, &loc)?;
                assignments.push(Assignment { target: a.target.clone(), expr });
            }
            let mode = if assigns.iter().any(|a| a.is_update) {
                ComputeMode::Update
            } else {
                ComputeMode::Derive
            };
            let id = ctx.next_id("compute");
            ctx.ir.steps.push(Step {
                id,
                inputs: vec![input.to_string()],
                outputs: vec![output.to_string()],
                params: OpParams::Compute(ComputeParams { mode, assignments }),
                loc: None,
            });
            Ok(new_schema)
        }
        Transform::Rename(pairs) => {
            let mut new_schema = schema.clone();
            if let Some(known) = &mut new_schema {
                for (from, _to) in pairs {
                    if !known.contains(from) {
                        return Err(FrontendError::UnknownColumn { name: from.clone(), loc });
                    }
                }
                for (from, to) in pairs {
                    if let Some(pos) = known.iter().position(|c| c == from) {
                        known[pos] = to.clone();
                    }
                }
            }
            let mapping = pairs
                .iter()
                .map(|(from, to)| RenameEntry { from: from.clone(), to: to.clone() })
                .collect();
            let id = ctx.next_id("rename");
            ctx.ir.steps.push(Step {
                id,
                inputs: vec![input.to_string()],
                outputs: vec![output.to_string()],
                params: OpParams::Rename(RenameParams { mapping }),
                loc: None,
            });
            Ok(new_schema)
        }
        Transform::Drop(cols) => {
            if let Some(known) = &schema {
                for c in cols {
                    if !known.contains(c) {
                        return Err(FrontendError::UnknownColumn { name: c.clone(), loc });
                    }
                }
            }
            let new_schema = schema.map(|known| known.into_iter().filter(|c| !cols.contains(c)).collect());
            let id = ctx.next_id("drop");
            ctx.ir.steps.push(Step {
                id,
                inputs: vec![input.to_string()],
                outputs: vec![output.to_string()],
                params: OpParams::Drop(DropParams { cols: cols.clone() }),
                loc: None,
            });
            Ok(new_schema)
        }
        Transform::Cast(casts) => {
            if let Some(known) = &schema {
                for c in casts {
                    if !known.contains(&c.col) {
                        return Err(FrontendError::UnknownColumn { name: c.col.clone(), loc });
                    }
                }
            }
            let mut entries = Vec::new();
            for c in casts {
                let to = match c.to.as_str() {
                    "int" => CastType::Int,
                    "decimal" => CastType::Decimal,
                    "str" | "string" => CastType::Str,
                    "bool" => CastType::Bool,
                    "date" => CastType::Date,
                    "datetime" => CastType::Datetime,
                    other => {
                        return Err(FrontendError::BadExpr(format!("unknown cast type '{other}'"), loc))
                    }
                };
                let on_error = match c.on_error.as_deref() {
                    Some("null") => OnError::Null,
                    _ => OnError::Fail,
                };
                entries.push(CastEntry { col: c.col.clone(), to, on_error, trim: c.trim.unwrap_or(false) });
            }
            let id = ctx.next_id("cast");
            ctx.ir.steps.push(Step {
                id,
                inputs: vec![input.to_string()],
                outputs: vec![output.to_string()],
                params: OpParams::Cast(CastParams { casts: entries }),
                loc: None,
            });
            Ok(schema)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn lower(src: &str) -> PResult<(IrDoc, Vec<Diagnostic>)> {
        let mut p = Parser::new(src, "t.sans").unwrap();
        let program = p.parse_program().unwrap();
        lower_program(&program, "t.sans")
    }

    #[test]
    fn lowers_datasource_and_save() {
        let (ir, _) = lower(
            r#"datasource x = csv("x.csv", columns(a, b))
table t = from(x)
save t to "out/t.csv""#,
        )
        .unwrap();
        assert_eq!(ir.steps.len(), 3);
        assert!(ir.datasources.contains_key("x"));
    }

    #[test]
    fn kind_lock_rejects_reuse_across_kinds() {
        let result = lower(
            r#"datasource x = csv("x.csv")
table x = from(x)"#,
        );
        assert!(matches!(result, Err(FrontendError::KindLock { .. })));
    }

    #[test]
    fn undeclared_source_lists_known_names() {
        let result = lower("table t = from(nope)");
        assert!(matches!(result, Err(FrontendError::UndeclaredSource { .. })));
    }

    #[test]
    fn select_unknown_column_fails() {
        let result = lower(
            r#"datasource x = csv("x.csv", columns(a, b))
table t = from(x) select(a, c)"#,
        );
        assert!(matches!(result, Err(FrontendError::UnknownColumn { .. })));
    }

    #[test]
    fn update_on_missing_column_fails() {
        let result = lower(
            r#"datasource x = csv("x.csv", columns(a, b))
table t = from(x) derive(update! c = a + b)"#,
        );
        assert!(matches!(result, Err(FrontendError::StrictMutation { .. })));
    }

    #[test]
    fn derive_on_existing_column_fails() {
        let result = lower(
            r#"datasource x = csv("x.csv", columns(a, b))
table t = from(x) derive(a = a + b)"#,
        );
        assert!(matches!(result, Err(FrontendError::InvalidUpdate { .. })));
    }

    #[test]
    fn const_values_are_inlined_as_literals() {
        let (ir, _) = lower(
            r#"const { threshold = 10 }
datasource x = csv("x.csv", columns(a))
table t = from(x) filter(a > threshold)"#,
        )
        .unwrap();
        let filter_step = ir.steps.iter().find(|s| s.op() == "filter").unwrap();
        match &filter_step.params {
            OpParams::Filter(p) => match &p.predicate {
                Expr::Binop { right, .. } => assert!(matches!(**right, Expr::Lit { .. })),
                _ => panic!("expected binop"),
            },
            _ => panic!("expected filter"),
        }
    }

    #[test]
    fn unused_let_binding_warns() {
        let (_, warnings) = lower("let unused = 1\ndatasource x = csv(\"x.csv\")\ntable t = from(x)").unwrap();
        assert!(warnings.iter().any(|d| d.code == "W_UNUSED_LET"));
    }
}
