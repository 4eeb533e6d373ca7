//! `sans-storage`'s error boundary: bundle path-safety refusals, the
//! reference execution runtime's failures, and I/O. Grounded on
//! `original_source/sans/sans/{bundle,runtime,hash_utils}.py`.

use sans_check::CheckError;
use sans_core::{CoreError, Diagnostic, Loc};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("path is outside bundle: {path} (bundle_root={bundle_root})")]
    PathEscapesBundle { path: String, bundle_root: String },

    #[error("save path would escape outputs/: {path}")]
    PathEscapesOutputs { path: String },

    #[error("save path must not be absolute: {0}")]
    SavePathAbsolute(String),

    #[error("save path must not contain '..': {0}")]
    SavePathTraversal(String),

    #[error("save path cannot be empty")]
    SavePathEmpty,

    #[error("input table '{table}' not bound at runtime")]
    TableUndefined { table: String },

    #[error("input table '{table}' is not sorted by {by:?}")]
    OrderRequired { table: String, by: Vec<String> },

    #[error("many-to-many join detected on key ({key_desc}) between '{left}' and '{right}'")]
    MergeManyMany {
        key_desc: String,
        left: String,
        right: String,
    },

    #[error("Python floats are not permitted in decimal arithmetic")]
    DecimalNoFloat,

    #[error("unsupported expression node in runtime evaluation: {0}")]
    UnsupportedExprNode(String),

    #[error("unknown format '{0}'")]
    FormatUndefined(String),

    #[error("cast of column '{col}' to {to} failed for value {value:?}")]
    CastFailed { col: String, to: String, value: String },

    #[error("PROC TRANSPOSE requires ID and VAR options")]
    TransposeMissingArgs,

    #[error("missing ID value for column '{0}'")]
    TransposeIdMissing(String),

    #[error("ID value '{value}' collides with '{existing}' after sanitization")]
    TransposeIdCollision { value: String, existing: String },

    #[error("assertion failed: {message}")]
    AssertionFailed { message: String },

    #[error("XPT writer is not implemented in this build: {0}")]
    Unsupported(String),

    #[error("bundle verification failed: {0}")]
    VerifyFailed(String),

    #[error("{0}")]
    Io(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Check(#[from] CheckError),
}

impl StorageError {
    pub fn code(&self) -> &str {
        match self {
            StorageError::PathEscapesBundle { .. } => "SANS_IO_ERROR_PATH_ESCAPES_BUNDLE",
            StorageError::PathEscapesOutputs { .. } => "SANS_IO_ERROR_PATH_ESCAPES_OUTPUTS",
            StorageError::SavePathAbsolute(_) => "SANS_IO_ERROR_PATH_ESCAPES_BUNDLE",
            StorageError::SavePathTraversal(_) => "SANS_IO_ERROR_PATH_ESCAPES_BUNDLE",
            StorageError::SavePathEmpty => "SANS_IO_ERROR_PATH_ESCAPES_BUNDLE",
            StorageError::TableUndefined { .. } => "SANS_RUNTIME_TABLE_UNDEFINED",
            StorageError::OrderRequired { .. } => "SANS_RUNTIME_ORDER_REQUIRED",
            StorageError::MergeManyMany { .. } => "SANS_RUNTIME_MERGE_MANY_MANY",
            StorageError::DecimalNoFloat => "SANS_RUNTIME_DECIMAL_NO_FLOAT",
            StorageError::UnsupportedExprNode(_) => "SANS_RUNTIME_UNSUPPORTED_EXPR_NODE",
            StorageError::FormatUndefined(_) => "SANS_RUNTIME_FORMAT_UNDEFINED",
            StorageError::CastFailed { .. } => "SANS_RUNTIME_CAST_FAILED",
            StorageError::TransposeMissingArgs => "SANS_RUNTIME_TRANSPOSE_MISSING_ARGS",
            StorageError::TransposeIdMissing(_) => "SANS_RUNTIME_TRANSPOSE_ID_MISSING",
            StorageError::TransposeIdCollision { .. } => "SANS_RUNTIME_TRANSPOSE_ID_COLLISION",
            StorageError::AssertionFailed { .. } => "SANS_RUNTIME_ASSERTION_FAILED",
            StorageError::Unsupported(_) => "SANS_RUNTIME_UNSUPPORTED",
            StorageError::VerifyFailed(_) => "SANS_IO_ERROR",
            StorageError::Io(_) => "SANS_IO_ERROR",
            StorageError::Core(e) => e.code(),
            StorageError::Check(e) => e.code(),
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::new(self.code(), self.to_string())
    }

    #[allow(dead_code)]
    fn loc(&self) -> Option<Loc> {
        None
    }
}
