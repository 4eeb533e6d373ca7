//! The SANS type lattice and its promotion/unification rules.
//!
//! `{NULL, BOOL, INT, DECIMAL, STRING, UNKNOWN}`. `UNKNOWN` is not erasure:
//! any operation that requires a concrete type and sees `UNKNOWN` must fail
//! rather than silently proceed.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    Null,
    Bool,
    Int,
    Decimal,
    String,
    Unknown,
}

impl Type {
    pub fn name(self) -> &'static str {
        match self {
            Type::Null => "null",
            Type::Bool => "bool",
            Type::Int => "int",
            Type::Decimal => "decimal",
            Type::String => "string",
            Type::Unknown => "unknown",
        }
    }

    /// Parses a type name, accepting the legacy `str` alias for `string`.
    pub fn parse_name(name: &str) -> Option<Type> {
        match name.trim().to_ascii_lowercase().as_str() {
            "null" => Some(Type::Null),
            "bool" => Some(Type::Bool),
            "int" => Some(Type::Int),
            "decimal" => Some(Type::Decimal),
            "string" | "str" => Some(Type::String),
            "unknown" => Some(Type::Unknown),
            _ => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Type::Int | Type::Decimal)
    }

    pub fn is_unknown(self) -> bool {
        matches!(self, Type::Unknown)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `INT + INT -> INT`; anything touching `DECIMAL` promotes to `DECIMAL`.
/// Division always yields `DECIMAL` regardless of operand types — callers
/// of `promote_numeric` for `/` must force the result to `Decimal`
/// themselves, since promotion alone cannot see the operator.
pub fn promote_numeric(left: Type, right: Type) -> Type {
    if left == Type::Decimal || right == Type::Decimal {
        Type::Decimal
    } else {
        Type::Int
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("cannot unify {left} with {right}")]
pub struct UnifyError {
    pub left: Type,
    pub right: Type,
}

/// Used by `if`/`coalesce`. Equal types unify to themselves; `UNKNOWN` with
/// anything yields `UNKNOWN`; `NULL` with `T` yields `T` in both contexts —
/// `coalesce` is itself a NULL-elimination form, so it gets the same
/// NULL-absorbs rule as `if`; numeric pairs promote; otherwise fails.
pub fn unify(left: Type, right: Type, _context: UnifyContext) -> Result<Type, UnifyError> {
    if left == right {
        return Ok(left);
    }
    if left.is_unknown() || right.is_unknown() {
        return Ok(Type::Unknown);
    }
    if left == Type::Null {
        return Ok(right);
    }
    if right == Type::Null {
        return Ok(left);
    }
    if left.is_numeric() && right.is_numeric() {
        return Ok(promote_numeric(left, right));
    }
    Err(UnifyError { left, right })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifyContext {
    If,
    Coalesce,
}

/// A JSON literal value as it appears in `lit(value)` expression nodes and
/// `const` bindings. Decimal values are always constructed from a parsed
/// string or an integer, never from `f32`/`f64` — there is deliberately no
/// `From<f64>` impl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(rust_decimal::Decimal),
    String(String),
}

impl Literal {
    /// `from_literal`: booleans are checked before integers (a JSON `true`
    /// must never be read back as `INT`), decimals are their own case, and
    /// anything unrecognized maps to `UNKNOWN` rather than failing, since
    /// front-ends may hand the type checker partially-formed literals.
    pub fn value_type(&self) -> Type {
        match self {
            Literal::Null => Type::Null,
            Literal::Bool(_) => Type::Bool,
            Literal::Int(_) => Type::Int,
            Literal::Decimal(_) => Type::Decimal,
            Literal::String(_) => Type::String,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_name_accepts_str_alias() {
        assert_eq!(Type::parse_name("str"), Some(Type::String));
        assert_eq!(Type::parse_name("STRING"), Some(Type::String));
    }

    #[test]
    fn parse_name_rejects_unknown_word() {
        assert_eq!(Type::parse_name("float"), None);
    }

    #[test]
    fn promote_numeric_decimal_dominates() {
        assert_eq!(promote_numeric(Type::Int, Type::Decimal), Type::Decimal);
        assert_eq!(promote_numeric(Type::Decimal, Type::Int), Type::Decimal);
        assert_eq!(promote_numeric(Type::Int, Type::Int), Type::Int);
    }

    #[test]
    fn unify_equal_types() {
        assert_eq!(unify(Type::Int, Type::Int, UnifyContext::If), Ok(Type::Int));
    }

    #[test]
    fn unify_unknown_absorbs() {
        assert_eq!(
            unify(Type::Unknown, Type::Int, UnifyContext::If),
            Ok(Type::Unknown)
        );
        assert_eq!(
            unify(Type::String, Type::Unknown, UnifyContext::Coalesce),
            Ok(Type::Unknown)
        );
    }

    #[test]
    fn unify_null_with_t_in_if_context() {
        assert_eq!(unify(Type::Null, Type::Int, UnifyContext::If), Ok(Type::Int));
        assert_eq!(unify(Type::String, Type::Null, UnifyContext::If), Ok(Type::String));
    }

    #[test]
    fn unify_null_with_t_in_coalesce_context() {
        assert_eq!(unify(Type::Null, Type::Int, UnifyContext::Coalesce), Ok(Type::Int));
        assert_eq!(unify(Type::String, Type::Null, UnifyContext::Coalesce), Ok(Type::String));
    }

    #[test]
    fn unify_numeric_pair_promotes() {
        assert_eq!(
            unify(Type::Int, Type::Decimal, UnifyContext::If),
            Ok(Type::Decimal)
        );
    }

    #[test]
    fn unify_incompatible_fails() {
        assert!(unify(Type::Bool, Type::String, UnifyContext::If).is_err());
    }

    #[test]
    fn literal_value_type_bool_before_int() {
        assert_eq!(Literal::Bool(true).value_type(), Type::Bool);
        assert_eq!(Literal::Int(1).value_type(), Type::Int);
    }
}
