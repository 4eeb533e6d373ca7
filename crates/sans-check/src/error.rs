//! `sans-check`'s error boundary: type inference and schema-lock/ingress
//! refusals, each converting to exactly one [`sans_core::Diagnostic`].

use sans_core::{CoreError, Diagnostic, Loc};

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("type error: {detail} (left={left}, right={right})")]
    Type {
        detail: String,
        left: &'static str,
        right: &'static str,
        loc: Option<Loc>,
    },

    #[error("type error: {detail} (type={ty})")]
    TypeUnknown {
        detail: String,
        ty: &'static str,
        loc: Option<Loc>,
    },

    #[error("unknown column '{name}'")]
    UnknownColumn { name: String, loc: Option<Loc> },

    #[error("column '{name}' already exists; 'derive' requires a new target")]
    InvalidUpdate { name: String, loc: Option<Loc> },

    #[error("column '{name}' does not exist; 'update' requires a pre-existing target")]
    StrictMutation { name: String, loc: Option<Loc> },

    #[error("datasource '{name}' has no concrete column types and no schema lock was supplied; searched: {searched}")]
    SchemaRequired { name: String, searched: String },

    #[error("schema lock is missing datasource '{name}'")]
    SchemaLockMissingDs { name: String },

    #[error("schema lock has a non-concrete (unknown) type for column '{column}' of datasource '{name}'")]
    SchemaLockInvalid { name: String, column: String },

    #[error("schema lock not found at '{path}'")]
    SchemaLockNotFound { path: String },

    #[error("datasource '{name}' is missing required column '{column}'")]
    SchemaMissingCol { name: String, column: String },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl CheckError {
    pub fn code(&self) -> &str {
        match self {
            CheckError::Type { .. } => "E_TYPE",
            CheckError::TypeUnknown { .. } => "E_TYPE_UNKNOWN",
            CheckError::UnknownColumn { .. } => "E_UNKNOWN_COLUMN",
            CheckError::InvalidUpdate { .. } => "E_INVALID_UPDATE",
            CheckError::StrictMutation { .. } => "E_STRICT_MUTATION",
            CheckError::SchemaRequired { .. } => "E_SCHEMA_REQUIRED",
            CheckError::SchemaLockMissingDs { .. } => "E_SCHEMA_LOCK_MISSING_DS",
            CheckError::SchemaLockInvalid { .. } => "E_SCHEMA_LOCK_INVALID",
            CheckError::SchemaLockNotFound { .. } => "E_SCHEMA_LOCK_NOT_FOUND",
            CheckError::SchemaMissingCol { .. } => "E_SCHEMA_MISSING_COL",
            CheckError::Core(e) => e.code(),
        }
    }

    pub fn loc(&self) -> Option<Loc> {
        match self {
            CheckError::Type { loc, .. }
            | CheckError::TypeUnknown { loc, .. }
            | CheckError::UnknownColumn { loc, .. }
            | CheckError::InvalidUpdate { loc, .. }
            | CheckError::StrictMutation { loc, .. } => loc.clone(),
            _ => None,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let mut d = Diagnostic::new(self.code(), self.to_string());
        d.loc = self.loc();
        d
    }
}
