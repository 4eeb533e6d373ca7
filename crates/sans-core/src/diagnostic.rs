//! The shared diagnostic shape every crate's error type converts into at
//! its public boundary, and the code-prefix -> exit-bucket table.

use serde::{Deserialize, Serialize};

/// A source span. Front-ends attach these to every statement they lower;
/// the amendment engine and runtime generally have none to offer and leave
/// it `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loc {
    pub file: String,
    pub line_start: u32,
    pub line_end: u32,
}

impl Loc {
    pub fn new(file: impl Into<String>, line_start: u32, line_end: u32) -> Self {
        Loc {
            file: file.into(),
            line_start,
            line_end,
        }
    }
}

/// A structured, non-recoverable error with a stable code and, where
/// applicable, a source location. Every `thiserror` error variant in this
/// workspace can be converted into exactly one `Diagnostic`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc: Option<Loc>,
}

impl Diagnostic {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Diagnostic {
            code: code.into(),
            message: message.into(),
            loc: None,
        }
    }

    pub fn with_loc(mut self, loc: Loc) -> Self {
        self.loc = Some(loc);
        self
    }

    pub fn exit_bucket(&self) -> ExitBucket {
        ExitBucket::for_code(&self.code)
    }
}

/// Status -> exit code bucket, per the error handling design table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExitBucket {
    Ok = 0,
    OkWithWarnings = 10,
    ParseError = 30,
    ValidationError = 31,
    CapabilityRefusal = 32,
    OtherFailure = 50,
}

impl ExitBucket {
    pub fn code(self) -> i32 {
        self as u8 as i32
    }

    /// Maps a diagnostic code to its exit bucket by checking the code's
    /// prefix against the table in the error handling design. Order
    /// matters: the more specific `SANS_IR_CANON_SHAPE_` and
    /// `SANS_CAP_`/`E_AMEND_*` groups are checked before the broader
    /// `SANS_*`/`E_*` parse and validate groups they would otherwise also
    /// match as substrings.
    pub fn for_code(code: &str) -> ExitBucket {
        const PARSE: &[&str] = &[
            "SANS_PARSE_",
            "SANS_BLOCK_",
            "E_PARSE",
            "E_MISSING_HEADER",
            "E_BAD_EXPR",
        ];
        const VALIDATE: &[&str] = &[
            "SANS_VALIDATE_",
            "SANS_IR_CANON_SHAPE_",
            "E_TYPE_UNKNOWN",
            "E_TYPE",
            "E_UNKNOWN_COLUMN",
            "E_STRICT_MUTATION",
            "E_INVALID_UPDATE",
            "E_KIND_LOCK",
            "E_UNDEFINED_TABLE",
            "E_UNDECLARED_SOURCE",
            "E_DUPLICATE_DATASOURCE",
            "E_COLUMN_NOT_FOUND",
            "E_SCHEMA_REQUIRED",
            "E_SCHEMA_LOCK_MISSING_DS",
            "E_SCHEMA_LOCK_INVALID",
            "E_SCHEMA_LOCK_NOT_FOUND",
            "E_SCHEMA_MISSING_COL",
            "E_CSV_COERCE",
        ];
        const CAPABILITY: &[&str] = &[
            "SANS_CAP_",
            "E_AMEND_CAPABILITY_LIMIT",
            "E_AMEND_POLICY_",
            "E_AMEND_VALIDATION_SCHEMA",
            "E_AMEND_TARGET_",
            "E_AMEND_PATH_",
            "E_AMEND_OUTPUT_TABLE_COLLISION",
            "E_AMEND_INDEX_OUT_OF_RANGE",
            "E_AMEND_EXPR_INVALID",
            "E_AMEND_ASSERTION_",
            "E_AMEND_IR_INVALID",
        ];
        const RUNTIME: &[&str] = &["SANS_RUNTIME_", "SANS_IO_ERROR", "SANS_INTERNAL_"];

        if CAPABILITY.iter().any(|p| code.starts_with(p)) {
            ExitBucket::CapabilityRefusal
        } else if RUNTIME.iter().any(|p| code.starts_with(p)) {
            ExitBucket::OtherFailure
        } else if VALIDATE.iter().any(|p| code.starts_with(p)) {
            ExitBucket::ValidationError
        } else if PARSE.iter().any(|p| code.starts_with(p)) {
            ExitBucket::ParseError
        } else {
            ExitBucket::OtherFailure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_codes_map_to_30() {
        assert_eq!(ExitBucket::for_code("SANS_PARSE_BAD_TOKEN").code(), 30);
        assert_eq!(ExitBucket::for_code("E_BAD_EXPR").code(), 30);
    }

    #[test]
    fn validate_codes_map_to_31() {
        assert_eq!(ExitBucket::for_code("E_TYPE").code(), 31);
        assert_eq!(ExitBucket::for_code("E_TYPE_UNKNOWN").code(), 31);
        assert_eq!(ExitBucket::for_code("E_SCHEMA_REQUIRED").code(), 31);
    }

    #[test]
    fn canon_shape_maps_to_31_not_capability() {
        assert_eq!(
            ExitBucket::for_code("SANS_IR_CANON_SHAPE_SORT").code(),
            31
        );
    }

    #[test]
    fn capability_codes_map_to_32() {
        assert_eq!(ExitBucket::for_code("E_AMEND_TARGET_NOT_FOUND").code(), 32);
        assert_eq!(ExitBucket::for_code("SANS_CAP_DENIED").code(), 32);
    }

    #[test]
    fn runtime_codes_map_to_50() {
        assert_eq!(ExitBucket::for_code("SANS_RUNTIME_MERGE_MANY_MANY").code(), 50);
        assert_eq!(ExitBucket::for_code("SANS_INTERNAL_PANIC").code(), 50);
    }

    #[test]
    fn unknown_code_falls_back_to_other_failure() {
        assert_eq!(ExitBucket::for_code("WHATEVER").code(), 50);
    }

    #[test]
    fn diagnostic_serializes_without_loc_when_absent() {
        let d = Diagnostic::new("E_TYPE", "boom");
        let v = serde_json::to_value(&d).unwrap();
        assert!(v.get("loc").is_none());
    }
}
