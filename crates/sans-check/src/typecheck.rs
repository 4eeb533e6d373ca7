//! Expression type inference (§4.B): one fold over [`sans_core::expr::Expr`],
//! grounded on `original_source/sans/sans/type_infer.py::infer_expr_type`.
//!
//! This is the concrete-typing half of §4.D; the per-op schema propagation
//! that calls into this lives in [`crate::schema`].

use crate::error::CheckError;
use indexmap::IndexMap;
use sans_core::expr::{BinOp, BoolOp, Expr, UnOp};
use sans_core::types::{promote_numeric, unify, UnifyContext};
use sans_core::{Loc, Type};

pub type SchemaEnv = IndexMap<String, Type>;

fn type_err(detail: impl Into<String>, left: Type, right: Type, loc: Option<Loc>) -> CheckError {
    CheckError::Type {
        detail: detail.into(),
        left: left.name(),
        right: right.name(),
        loc,
    }
}

fn unknown_err(detail: impl Into<String>, ty: Type, loc: Option<Loc>) -> CheckError {
    CheckError::TypeUnknown {
        detail: detail.into(),
        ty: ty.name(),
        loc,
    }
}

fn require_bool(detail: &str, t: Type, loc: Option<Loc>) -> Result<(), CheckError> {
    if t == Type::Bool {
        return Ok(());
    }
    if t.is_unknown() {
        return Err(unknown_err(detail, t, loc));
    }
    Err(type_err(detail, t, t, loc))
}

/// Infers the concrete type of `expr` under `env`. `loc` is attached to any
/// error raised (front-ends carry a span per statement; the amendment engine
/// generally has none).
pub fn infer_expr_type(expr: &Expr, env: &SchemaEnv, loc: Option<&Loc>) -> Result<Type, CheckError> {
    let loc = loc.cloned();
    match expr {
        Expr::Lit { value } => Ok(value.value_type()),
        Expr::Col { name } => Ok(env
            .get(name.as_str())
            .copied()
            .or_else(|| env.get(name.to_ascii_lowercase().as_str()).copied())
            .unwrap_or(Type::Unknown)),
        Expr::Binop { op, left, right } => {
            let lt = infer_expr_type(left, env, loc.as_ref())?;
            let rt = infer_expr_type(right, env, loc.as_ref())?;
            infer_binop(*op, lt, rt, loc)
        }
        Expr::Boolop { op, args } => {
            for arg in args {
                let t = infer_expr_type(arg, env, loc.as_ref())?;
                require_bool(bool_op_name(*op), t, loc.clone())?;
            }
            Ok(Type::Bool)
        }
        Expr::Unop { op, arg } => {
            let t = infer_expr_type(arg, env, loc.as_ref())?;
            infer_unop(*op, t, loc)
        }
        Expr::Call { name, args } => infer_call(name, args, env, loc),
    }
}

fn infer_binop(op: BinOp, left: Type, right: Type, loc: Option<Loc>) -> Result<Type, CheckError> {
    let sym = op.symbol();
    if op.is_arithmetic() {
        if left == Type::Null || right == Type::Null {
            return Err(type_err(
                format!("'{sym}': null is not permitted in arithmetic"),
                left,
                right,
                loc,
            ));
        }
        if left.is_unknown() || right.is_unknown() {
            return Err(unknown_err(
                format!("'{sym}': unknown is not permitted in arithmetic"),
                if left.is_unknown() { left } else { right },
                loc,
            ));
        }
        if !left.is_numeric() || !right.is_numeric() {
            return Err(type_err(
                format!("'{sym}': arithmetic requires numeric operands"),
                left,
                right,
                loc,
            ));
        }
        return Ok(if op == BinOp::Div {
            Type::Decimal
        } else {
            promote_numeric(left, right)
        });
    }
    if op.is_equality() {
        if left.is_unknown() || right.is_unknown() {
            let both_unknown_or_null = (left.is_unknown() && right.is_unknown())
                || (left.is_unknown() && right == Type::Null)
                || (right.is_unknown() && left == Type::Null);
            if both_unknown_or_null {
                return Ok(Type::Bool);
            }
            return Err(unknown_err(
                format!("'{sym}': operands are not comparable"),
                if left.is_unknown() { left } else { right },
                loc,
            ));
        }
        if left == Type::Null || right == Type::Null || left == right {
            return Ok(Type::Bool);
        }
        if left.is_numeric() && right.is_numeric() {
            return Ok(Type::Bool);
        }
        return Err(type_err(
            format!("'{sym}': operands must be comparable"),
            left,
            right,
            loc,
        ));
    }
    // Ordered comparisons.
    if left == Type::Null || right == Type::Null {
        return Err(type_err(
            format!("'{sym}': null is not permitted in ordered comparisons"),
            left,
            right,
            loc,
        ));
    }
    if left.is_unknown() || right.is_unknown() {
        return Err(unknown_err(
            format!("'{sym}': operands are not comparable"),
            if left.is_unknown() { left } else { right },
            loc,
        ));
    }
    if left.is_numeric() && right.is_numeric() {
        return Ok(Type::Bool);
    }
    if left == right && left == Type::String {
        return Ok(Type::Bool);
    }
    Err(type_err(
        format!("'{sym}': operands must be comparable"),
        left,
        right,
        loc,
    ))
}

fn bool_op_name(op: BoolOp) -> &'static str {
    match op {
        BoolOp::And => "and",
        BoolOp::Or => "or",
    }
}

fn infer_unop(op: UnOp, arg: Type, loc: Option<Loc>) -> Result<Type, CheckError> {
    match op {
        UnOp::Not => {
            require_bool("not", arg, loc)?;
            Ok(Type::Bool)
        }
        UnOp::Pos | UnOp::Neg => {
            if arg == Type::Null {
                return Err(type_err("unary: null is not permitted in arithmetic", arg, arg, loc));
            }
            if arg.is_unknown() {
                return Err(unknown_err("unary: unknown is not permitted in arithmetic", arg, loc));
            }
            if !arg.is_numeric() {
                return Err(type_err("unary: arithmetic requires a numeric operand", arg, arg, loc));
            }
            Ok(arg)
        }
    }
}

fn infer_call(
    name: &str,
    args: &[Expr],
    env: &SchemaEnv,
    loc: Option<Loc>,
) -> Result<Type, CheckError> {
    match name {
        "if" => {
            if args.len() != 3 {
                return Err(type_err(
                    format!("'if' expects 3 args, got {}", args.len()),
                    Type::Unknown,
                    Type::Unknown,
                    loc,
                ));
            }
            let cond_t = infer_expr_type(&args[0], env, loc.as_ref())?;
            require_bool("if", cond_t, loc.clone())?;
            let then_t = infer_expr_type(&args[1], env, loc.as_ref())?;
            let else_t = infer_expr_type(&args[2], env, loc.as_ref())?;
            unify(then_t, else_t, UnifyContext::If)
                .map_err(|_| type_err("'if': then/else types must unify", then_t, else_t, loc))
        }
        "coalesce" => {
            if args.is_empty() {
                return Err(type_err(
                    "'coalesce' expects at least 1 arg",
                    Type::Unknown,
                    Type::Unknown,
                    loc,
                ));
            }
            let mut result: Option<Type> = None;
            for arg in args {
                let t = infer_expr_type(arg, env, loc.as_ref())?;
                if t.is_unknown() {
                    return Ok(Type::Unknown);
                }
                result = Some(match result {
                    None => t,
                    Some(prev) => unify(prev, t, UnifyContext::Coalesce)
                        .map_err(|_| type_err("'coalesce': argument types must unify", prev, t, loc.clone()))?,
                });
            }
            Ok(result.unwrap_or(Type::Unknown))
        }
        "put" | "input" => Ok(Type::Unknown),
        "row_count" => Ok(Type::Int),
        _ => Ok(Type::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sans_core::types::Literal;

    fn env(pairs: &[(&str, Type)]) -> SchemaEnv {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn arithmetic_promotes_to_decimal_on_division() {
        let e = Expr::binop(BinOp::Div, Expr::col("a"), Expr::col("b"));
        let t = infer_expr_type(&e, &env(&[("a", Type::Int), ("b", Type::Int)]), None).unwrap();
        assert_eq!(t, Type::Decimal);
    }

    #[test]
    fn arithmetic_rejects_null() {
        let e = Expr::binop(BinOp::Add, Expr::col("a"), Expr::lit(Literal::Null));
        let err = infer_expr_type(&e, &env(&[("a", Type::Int)]), None).unwrap_err();
        assert_eq!(err.code(), "E_TYPE");
    }

    #[test]
    fn arithmetic_rejects_unknown() {
        let e = Expr::binop(BinOp::Add, Expr::col("a"), Expr::col("b"));
        let err = infer_expr_type(&e, &env(&[("a", Type::Int)]), None).unwrap_err();
        assert_eq!(err.code(), "E_TYPE_UNKNOWN");
    }

    #[test]
    fn equality_allows_null_either_side() {
        let e = Expr::binop(BinOp::Eq, Expr::col("a"), Expr::lit(Literal::Null));
        let t = infer_expr_type(&e, &env(&[("a", Type::Int)]), None).unwrap();
        assert_eq!(t, Type::Bool);
    }

    #[test]
    fn ordered_comparison_rejects_null() {
        let e = Expr::binop(BinOp::Gt, Expr::col("a"), Expr::lit(Literal::Null));
        let err = infer_expr_type(&e, &env(&[("a", Type::Int)]), None).unwrap_err();
        assert_eq!(err.code(), "E_TYPE");
    }

    #[test]
    fn if_unifies_null_branch() {
        let e = Expr::call(
            "if",
            vec![
                Expr::binop(BinOp::Gt, Expr::col("a"), Expr::lit(Literal::Int(0))),
                Expr::col("a"),
                Expr::lit(Literal::Null),
            ],
        );
        let t = infer_expr_type(&e, &env(&[("a", Type::Int)]), None).unwrap();
        assert_eq!(t, Type::Int);
    }

    #[test]
    fn coalesce_short_circuits_to_unknown() {
        let e = Expr::call("coalesce", vec![Expr::col("a"), Expr::col("b")]);
        let t = infer_expr_type(&e, &env(&[("a", Type::Unknown), ("b", Type::Int)]), None).unwrap();
        assert_eq!(t, Type::Unknown);
    }

    #[test]
    fn coalesce_unifies_null_argument() {
        let e = Expr::call("coalesce", vec![Expr::lit(Literal::Null), Expr::col("a")]);
        let t = infer_expr_type(&e, &env(&[("a", Type::Int)]), None).unwrap();
        assert_eq!(t, Type::Int);
    }

    #[test]
    fn row_count_is_int() {
        let e = Expr::call("row_count", vec![Expr::col("t")]);
        let t = infer_expr_type(&e, &SchemaEnv::new(), None).unwrap();
        assert_eq!(t, Type::Int);
    }

    #[test]
    fn boolop_requires_bool_args() {
        let e = Expr::boolop(
            sans_core::expr::BoolOp::And,
            vec![Expr::lit(Literal::Bool(true)), Expr::col("a")],
        );
        let err = infer_expr_type(&e, &env(&[("a", Type::Int)]), None).unwrap_err();
        assert_eq!(err.code(), "E_TYPE");
    }
}
