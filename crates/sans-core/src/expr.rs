//! The expression ADT shared by both front-ends and the IR.
//!
//! A cyclic-free tree with closed operator sets. The evaluator, type
//! inferencer, column-reference collector, and printer (each living in the
//! crate that needs them) are folds over this one type.

use crate::types::Literal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }

    pub fn from_symbol(s: &str) -> Option<BinOp> {
        Some(match s {
            "+" => BinOp::Add,
            "-" => BinOp::Sub,
            "*" => BinOp::Mul,
            "/" => BinOp::Div,
            "==" => BinOp::Eq,
            "!=" => BinOp::Ne,
            "<" => BinOp::Lt,
            "<=" => BinOp::Le,
            ">" => BinOp::Gt,
            ">=" => BinOp::Ge,
            _ => return None,
        })
    }

    pub fn is_ordered_comparison(self) -> bool {
        matches!(self, BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
    }

    pub fn is_equality(self) -> bool {
        matches!(self, BinOp::Eq | BinOp::Ne)
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(self, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnOp {
    Not,
    Pos,
    Neg,
}

/// The closed allow-list of call targets. Anything else is a parse-time
/// refusal, never a runtime `UNKNOWN`.
pub const CALL_ALLOWLIST: &[&str] = &["coalesce", "if", "put", "input", "row_count"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Expr {
    Lit { value: Literal },
    Col { name: String },
    Binop { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    Boolop { op: BoolOp, args: Vec<Expr> },
    Unop { op: UnOp, arg: Box<Expr> },
    Call { name: String, args: Vec<Expr> },
}

impl Expr {
    pub fn lit(value: Literal) -> Expr {
        Expr::Lit { value }
    }

    pub fn col(name: impl Into<String>) -> Expr {
        Expr::Col { name: name.into() }
    }

    pub fn binop(op: BinOp, left: Expr, right: Expr) -> Expr {
        Expr::Binop {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn boolop(op: BoolOp, args: Vec<Expr>) -> Expr {
        Expr::Boolop { op, args }
    }

    pub fn unop(op: UnOp, arg: Expr) -> Expr {
        Expr::Unop { op, arg: Box::new(arg) }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call { name: name.into(), args }
    }

    /// Fold: collects every distinct column name referenced anywhere in the
    /// expression tree, in first-seen order.
    pub fn collect_columns(&self, out: &mut Vec<String>) {
        match self {
            Expr::Lit { .. } => {}
            Expr::Col { name } => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Binop { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::Boolop { args, .. } => {
                for a in args {
                    a.collect_columns(out);
                }
            }
            Expr::Unop { arg, .. } => arg.collect_columns(out),
            Expr::Call { args, .. } => {
                for a in args {
                    a.collect_columns(out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binop_symbol_round_trips() {
        for op in [
            BinOp::Add,
            BinOp::Sub,
            BinOp::Mul,
            BinOp::Div,
            BinOp::Eq,
            BinOp::Ne,
            BinOp::Lt,
            BinOp::Le,
            BinOp::Gt,
            BinOp::Ge,
        ] {
            assert_eq!(BinOp::from_symbol(op.symbol()), Some(op));
        }
    }

    #[test]
    fn legacy_equality_tokens_are_not_recognized() {
        for tok in ["=", "^=", "~=", "eq", "ne"] {
            assert_eq!(BinOp::from_symbol(tok), None);
        }
    }

    #[test]
    fn collect_columns_deduplicates_and_preserves_order() {
        let e = Expr::binop(
            BinOp::Add,
            Expr::col("a"),
            Expr::binop(BinOp::Mul, Expr::col("b"), Expr::col("a")),
        );
        let mut cols = Vec::new();
        e.collect_columns(&mut cols);
        assert_eq!(cols, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn expr_serializes_with_type_tag() {
        let e = Expr::col("x");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "col");
        assert_eq!(v["name"], "x");
    }
}
