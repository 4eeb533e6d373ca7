//! `sans-core`'s error boundary. Every fallible function in this crate
//! returns `Result<T, CoreError>`.

use crate::diagnostic::{Diagnostic, Loc};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("duplicate producer for table '{table}'")]
    DuplicateProducer { table: String },

    #[error("input table '{table}' has no prior producer")]
    UnresolvedInput { table: String },

    #[error("step references undeclared datasource '{name}'")]
    UndeclaredDatasource { name: String },

    #[error("op '{op}' declares {found} outputs, expected {expected}")]
    OutputArityMismatch {
        op: String,
        expected: usize,
        found: usize,
    },

    #[error("{code}: {message}")]
    CanonShape {
        code: String,
        message: String,
        loc: Option<Loc>,
    },

    #[error("IR has no 'save' step")]
    NoSaveStep,

    #[error("saved table '{table}' does not trace back to a datasource")]
    SaveNotGrounded { table: String },

    #[error("cycle detected in step dependency graph")]
    CyclicGraph,

    #[error("table '{table}' is produced but never consumed or saved")]
    DanglingTable { table: String },

    #[error("input table '{table}' must be sorted by {by:?} for BY-group MERGE processing")]
    MergeOrderRequired { table: String, by: Vec<String> },

    #[error("canonical JSON rejected non-finite number")]
    NonFiniteNumber,

    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn code(&self) -> &str {
        match self {
            CoreError::DuplicateProducer { .. } => "SANS_VALIDATE_DUPLICATE_PRODUCER",
            CoreError::UnresolvedInput { .. } => "SANS_VALIDATE_UNRESOLVED_INPUT",
            CoreError::UndeclaredDatasource { .. } => "E_UNDECLARED_SOURCE",
            CoreError::OutputArityMismatch { .. } => "SANS_VALIDATE_OUTPUT_ARITY",
            CoreError::CanonShape { code, .. } => code,
            CoreError::NoSaveStep => "SANS_VALIDATE_NO_SAVE",
            CoreError::SaveNotGrounded { .. } => "SANS_VALIDATE_SAVE_NOT_GROUNDED",
            CoreError::CyclicGraph => "SANS_VALIDATE_CYCLE",
            CoreError::DanglingTable { .. } => "SANS_VALIDATE_DANGLING_TABLE",
            CoreError::MergeOrderRequired { .. } => "SANS_VALIDATE_ORDER_REQUIRED",
            CoreError::NonFiniteNumber => "SANS_IO_ERROR",
            CoreError::Io(_) => "SANS_IO_ERROR",
            CoreError::Json(_) => "SANS_IO_ERROR",
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let loc = match self {
            CoreError::CanonShape { loc, .. } => loc.clone(),
            _ => None,
        };
        let mut d = Diagnostic::new(self.code(), self.to_string());
        d.loc = loc;
        d
    }
}
