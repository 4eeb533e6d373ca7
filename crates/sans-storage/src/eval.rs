//! The reference expression evaluator, grounded on
//! `original_source/sans/sans/runtime.py::_eval_expr`/`_eval_expr_assert`.
//!
//! A `Row` is a column-name-ordered map of [`Literal`] cells. Arithmetic and
//! comparison follow SAS semantics: any `NULL` operand propagates to `NULL`
//! for arithmetic, and `NULL` sorts/compares as the smallest value rather
//! than the SQL three-valued-logic `UNKNOWN`. Division always yields
//! `DECIMAL`. There is no floating point anywhere in this evaluator —
//! numeric literals are `i64` or `rust_decimal::Decimal` only.

use crate::error::StorageError;
use indexmap::IndexMap;
use rust_decimal::Decimal;
use sans_core::expr::{BinOp, BoolOp, Expr, UnOp};
use sans_core::ir::FormatParams;
use sans_core::types::Literal;
use std::cmp::Ordering;

pub type Row = IndexMap<String, Literal>;

/// Format registries accumulated so far (keyed by lower-cased, trailing-dot-stripped
/// name), available to `put(value, "fmtname")` in every evaluation context —
/// not just assertions, mirroring `runtime.py::_eval_expr`'s `formats` argument
/// being threaded through every op, not only the assert path.
pub type Formats = IndexMap<String, FormatParams>;

/// Tables visible to `row_count(table)` during assertion evaluation. Not
/// populated for ordinary `compute`/`filter` expression evaluation, where a
/// `row_count` call is a parse-time refusal instead (`ALLOWED_CALLS` in
/// `sans-amend` excludes it for the same reason: it isn't row-local).
#[derive(Default)]
pub struct EvalContext<'a> {
    pub tables: Option<&'a IndexMap<String, Vec<Row>>>,
    pub formats: Option<&'a Formats>,
}

/// Back-compat alias: assertion evaluation is just [`EvalContext`] with
/// `tables` populated.
pub type AssertContext<'a> = EvalContext<'a>;

fn as_decimal(lit: &Literal) -> Result<Decimal, StorageError> {
    match lit {
        Literal::Int(i) => Ok(Decimal::from(*i)),
        Literal::Decimal(d) => Ok(*d),
        other => Err(StorageError::UnsupportedExprNode(format!("expected numeric value, got {other:?}"))),
    }
}

fn numeric_binop(op: BinOp, left: &Literal, right: &Literal) -> Result<Literal, StorageError> {
    if matches!(left, Literal::Null) || matches!(right, Literal::Null) {
        return Ok(Literal::Null);
    }
    let both_int = matches!(left, Literal::Int(_)) && matches!(right, Literal::Int(_));
    if both_int && op != BinOp::Div {
        let (Literal::Int(l), Literal::Int(r)) = (left, right) else { unreachable!() };
        let result = match op {
            BinOp::Add => l.checked_add(*r),
            BinOp::Sub => l.checked_sub(*r),
            BinOp::Mul => l.checked_mul(*r),
            _ => unreachable!(),
        };
        return result
            .map(Literal::Int)
            .ok_or_else(|| StorageError::UnsupportedExprNode("integer overflow".to_string()));
    }
    let l = as_decimal(left)?;
    let r = as_decimal(right)?;
    let result = match op {
        BinOp::Add => l + r,
        BinOp::Sub => l - r,
        BinOp::Mul => l * r,
        BinOp::Div => {
            if r.is_zero() {
                return Err(StorageError::UnsupportedExprNode("division by zero".to_string()));
            }
            l / r
        }
        _ => unreachable!(),
    };
    Ok(Literal::Decimal(result))
}

/// SAS-style ordering: `NULL` is the smallest value of any type; values of
/// differing non-null type compare by their string rendering, matching
/// `_compare_sas`'s fallback for mixed-type columns.
pub fn compare_sas(left: &Literal, right: &Literal) -> Ordering {
    match (left, right) {
        (Literal::Null, Literal::Null) => Ordering::Equal,
        (Literal::Null, _) => Ordering::Less,
        (_, Literal::Null) => Ordering::Greater,
        (Literal::Int(a), Literal::Int(b)) => a.cmp(b),
        (Literal::Decimal(a), Literal::Decimal(b)) => a.cmp(b),
        (Literal::Int(a), Literal::Decimal(b)) => Decimal::from(*a).cmp(b),
        (Literal::Decimal(a), Literal::Int(b)) => a.cmp(&Decimal::from(*b)),
        (Literal::String(a), Literal::String(b)) => a.cmp(b),
        (Literal::Bool(a), Literal::Bool(b)) => a.cmp(b),
        (a, b) => literal_render(a).cmp(&literal_render(b)),
    }
}

fn literal_render(lit: &Literal) -> String {
    match lit {
        Literal::Null => String::new(),
        Literal::Bool(b) => b.to_string(),
        Literal::Int(i) => i.to_string(),
        Literal::Decimal(d) => d.to_string(),
        Literal::String(s) => s.clone(),
    }
}

fn compare_binop(op: BinOp, left: &Literal, right: &Literal) -> Literal {
    let ord = compare_sas(left, right);
    let result = match op {
        BinOp::Eq => left == right || ord == Ordering::Equal,
        BinOp::Ne => !(left == right || ord == Ordering::Equal),
        BinOp::Lt => ord == Ordering::Less,
        BinOp::Le => ord != Ordering::Greater,
        BinOp::Gt => ord == Ordering::Greater,
        BinOp::Ge => ord != Ordering::Less,
        _ => unreachable!(),
    };
    Literal::Bool(result)
}

fn truthy(lit: &Literal) -> bool {
    match lit {
        Literal::Null => false,
        Literal::Bool(b) => *b,
        Literal::Int(i) => *i != 0,
        Literal::Decimal(d) => !d.is_zero(),
        Literal::String(s) => !s.is_empty(),
    }
}

/// Evaluates `expr` against a single row with no format registry and no
/// table access — `put`/`row_count` fail if referenced. Most callers should
/// use [`eval_expr_with`] instead, passing the runtime's accumulated
/// `formats` registry.
pub fn eval_expr(expr: &Expr, row: &Row) -> Result<Literal, StorageError> {
    eval_inner(expr, row, None)
}

/// Evaluates `expr` with a format registry (for `put`) and, in assertion
/// context, table access (for `row_count`).
pub fn eval_expr_with(expr: &Expr, row: &Row, ctx: &EvalContext) -> Result<Literal, StorageError> {
    eval_inner(expr, row, Some(ctx))
}

/// Assertion-context evaluator: identical to [`eval_expr_with`] except `call`
/// nodes named `row_count` resolve against `ctx.tables` instead of row data.
pub fn eval_expr_assert(expr: &Expr, row: &Row, ctx: &AssertContext) -> Result<Literal, StorageError> {
    eval_inner(expr, row, Some(ctx))
}

fn eval_inner(expr: &Expr, row: &Row, ctx: Option<&EvalContext>) -> Result<Literal, StorageError> {
    match expr {
        Expr::Lit { value } => Ok(value.clone()),
        Expr::Col { name } => row
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnsupportedExprNode(format!("unbound column '{name}'"))),
        Expr::Binop { op, left, right } => {
            let l = eval_inner(left, row, ctx)?;
            let r = eval_inner(right, row, ctx)?;
            if op.is_arithmetic() {
                numeric_binop(*op, &l, &r)
            } else {
                Ok(compare_binop(*op, &l, &r))
            }
        }
        Expr::Boolop { op, args } => {
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(eval_inner(a, row, ctx)?);
            }
            let result = match op {
                BoolOp::And => values.iter().all(truthy),
                BoolOp::Or => values.iter().any(truthy),
            };
            Ok(Literal::Bool(result))
        }
        Expr::Unop { op, arg } => {
            let v = eval_inner(arg, row, ctx)?;
            match op {
                UnOp::Not => Ok(Literal::Bool(!truthy(&v))),
                UnOp::Pos => Ok(v),
                UnOp::Neg => match v {
                    Literal::Null => Ok(Literal::Null),
                    Literal::Int(i) => Ok(Literal::Int(-i)),
                    Literal::Decimal(d) => Ok(Literal::Decimal(-d)),
                    other => Err(StorageError::UnsupportedExprNode(format!("cannot negate {other:?}"))),
                },
            }
        }
        Expr::Call { name, args } => eval_call(name, args, row, ctx),
    }
}

fn eval_call(name: &str, args: &[Expr], row: &Row, ctx: Option<&EvalContext>) -> Result<Literal, StorageError> {
    match name {
        "coalesce" => {
            for a in args {
                let v = eval_inner(a, row, ctx)?;
                if !matches!(v, Literal::Null) {
                    return Ok(v);
                }
            }
            Ok(Literal::Null)
        }
        "if" => {
            let [cond, then_branch, else_branch] = args else {
                return Err(StorageError::UnsupportedExprNode("if() requires exactly 3 arguments".to_string()));
            };
            let c = eval_inner(cond, row, ctx)?;
            if truthy(&c) {
                eval_inner(then_branch, row, ctx)
            } else {
                eval_inner(else_branch, row, ctx)
            }
        }
        "input" => {
            let [value] = args else {
                return Err(StorageError::UnsupportedExprNode("input() requires exactly 1 argument".to_string()));
            };
            let v = eval_inner(value, row, ctx)?;
            match v {
                Literal::String(s) => parse_numeric_string(&s),
                other => Ok(other),
            }
        }
        "put" => {
            match args {
                [value] => {
                    let v = eval_inner(value, row, ctx)?;
                    Ok(Literal::String(literal_render(&v)))
                }
                [value, fmt_expr] => {
                    let v = eval_inner(value, row, ctx)?;
                    let Expr::Lit { value: Literal::String(fmt_name) } = fmt_expr else {
                        return Err(StorageError::UnsupportedExprNode("put() format name must be a string literal".to_string()));
                    };
                    let fmt_name = normalize_format_name(fmt_name);
                    let formats = ctx
                        .and_then(|c| c.formats)
                        .ok_or_else(|| StorageError::FormatUndefined(fmt_name.clone()))?;
                    let fmt = formats
                        .get(&fmt_name)
                        .ok_or_else(|| StorageError::FormatUndefined(fmt_name.clone()))?;
                    if matches!(v, Literal::Null) {
                        return Ok(Literal::Null);
                    }
                    let label = fmt.entries.iter().find(|e| e.value == v).map(|e| e.label.clone());
                    Ok(label.map(Literal::String).unwrap_or(Literal::Null))
                }
                _ => Err(StorageError::UnsupportedExprNode("put() requires 1 or 2 arguments".to_string())),
            }
        }
        "row_count" => {
            let [table_expr] = args else {
                return Err(StorageError::UnsupportedExprNode("row_count() requires exactly 1 argument".to_string()));
            };
            let Expr::Lit { value: Literal::String(table) } = table_expr else {
                return Err(StorageError::UnsupportedExprNode("row_count() argument must be a table name literal".to_string()));
            };
            let tables = ctx
                .and_then(|c| c.tables)
                .ok_or_else(|| StorageError::UnsupportedExprNode("row_count() is only valid in assertions".to_string()))?;
            let count = tables
                .get(table)
                .ok_or_else(|| StorageError::TableUndefined { table: table.clone() })?
                .len();
            Ok(Literal::Int(count as i64))
        }
        other => Err(StorageError::UnsupportedExprNode(format!("unknown call '{other}'"))),
    }
}

fn normalize_format_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    lower.strip_suffix('.').map(str::to_string).unwrap_or(lower)
}

fn parse_numeric_string(s: &str) -> Result<Literal, StorageError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Ok(Literal::Null);
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Ok(Literal::Int(i));
    }
    trimmed
        .parse::<Decimal>()
        .map(Literal::Decimal)
        .map_err(|_| StorageError::UnsupportedExprNode(format!("cannot parse '{s}' as a number")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Literal)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn arithmetic_propagates_null() {
        let r = row(&[("a", Literal::Null), ("b", Literal::Int(1))]);
        let expr = Expr::binop(BinOp::Add, Expr::col("a"), Expr::col("b"));
        assert_eq!(eval_expr(&expr, &r).unwrap(), Literal::Null);
    }

    #[test]
    fn division_yields_decimal_even_for_ints() {
        let r = row(&[("a", Literal::Int(10)), ("b", Literal::Int(4))]);
        let expr = Expr::binop(BinOp::Div, Expr::col("a"), Expr::col("b"));
        match eval_expr(&expr, &r).unwrap() {
            Literal::Decimal(d) => assert_eq!(d, Decimal::new(25, 1)),
            other => panic!("expected decimal, got {other:?}"),
        }
    }

    #[test]
    fn null_compares_smallest() {
        assert_eq!(compare_sas(&Literal::Null, &Literal::Int(0)), Ordering::Less);
        assert_eq!(compare_sas(&Literal::Int(0), &Literal::Null), Ordering::Greater);
    }

    #[test]
    fn coalesce_returns_first_non_null() {
        let r = row(&[("a", Literal::Null), ("b", Literal::String("x".to_string()))]);
        let expr = Expr::call("coalesce", vec![Expr::col("a"), Expr::col("b")]);
        assert_eq!(eval_expr(&expr, &r).unwrap(), Literal::String("x".to_string()));
    }

    #[test]
    fn if_selects_branch_by_truthiness() {
        let r = row(&[("flag", Literal::Bool(false))]);
        let expr = Expr::call(
            "if",
            vec![Expr::col("flag"), Expr::lit(Literal::Int(1)), Expr::lit(Literal::Int(2))],
        );
        assert_eq!(eval_expr(&expr, &r).unwrap(), Literal::Int(2));
    }

    #[test]
    fn row_count_requires_assert_context() {
        let r = row(&[]);
        let expr = Expr::call("row_count", vec![Expr::lit(Literal::String("t".to_string()))]);
        assert!(eval_expr(&expr, &r).is_err());
    }

    #[test]
    fn put_looks_up_label_from_format_registry() {
        use sans_core::ir::FormatEntry;

        let r = row(&[("sev", Literal::Int(1))]);
        let mut formats = Formats::new();
        formats.insert(
            "$sev".to_string(),
            FormatParams {
                name: "$sev".to_string(),
                entries: vec![FormatEntry { value: Literal::Int(1), label: "HIGH".to_string() }],
            },
        );
        let ctx = EvalContext { tables: None, formats: Some(&formats) };
        let expr = Expr::call("put", vec![Expr::col("sev"), Expr::lit(Literal::String("$sev.".to_string()))]);
        assert_eq!(eval_expr_with(&expr, &r, &ctx).unwrap(), Literal::String("HIGH".to_string()));
    }

    #[test]
    fn row_count_reads_table_length_in_assert_context() {
        let r = row(&[]);
        let mut tables = IndexMap::new();
        tables.insert("t".to_string(), vec![row(&[]), row(&[])]);
        let ctx = AssertContext { tables: Some(&tables), formats: None };
        let expr = Expr::call("row_count", vec![Expr::lit(Literal::String("t".to_string()))]);
        assert_eq!(eval_expr_assert(&expr, &r, &ctx).unwrap(), Literal::Int(2));
    }
}
