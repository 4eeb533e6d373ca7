//! Amendment engine's error boundary: request-schema refusals, policy
//! gates, selector resolution, and RFC6901 path traversal failures.

use sans_core::{CoreError, Diagnostic, Loc};

#[derive(Debug, thiserror::Error)]
pub enum AmendError {
    #[error("amendment request schema is invalid: {0}")]
    ValidationSchema(String),

    #[error("duplicate op_id '{0}' in amendment request")]
    DuplicateOpId(String),

    #[error("amendment request declares {count} ops, exceeding the cap of {cap}")]
    CapabilityLimit { count: usize, cap: usize },

    #[error("op '{op_id}' requires allow_destructive")]
    PolicyDestructive { op_id: String },

    #[error("op '{op_id}' requires allow_output_rewire")]
    PolicyOutputRewire { op_id: String },

    #[error("op '{op_id}' requires allow_approx")]
    PolicyApprox { op_id: String },

    #[error("op '{op_id}' target selector did not resolve to any step")]
    TargetNotFound { op_id: String },

    #[error("op '{op_id}' target selector resolved to more than one step")]
    TargetAmbiguous { op_id: String },

    #[error("op '{op_id}' target selector fields resolved to different steps")]
    TargetMismatch { op_id: String },

    #[error("op '{op_id}' RFC6901 path '{path}' does not exist")]
    PathNotFound { op_id: String, path: String },

    #[error("op '{op_id}' RFC6901 path '{path}' traverses a non-container value")]
    PathInvalid { op_id: String, path: String },

    #[error("op '{op_id}' index {index} is out of range (0..={max})")]
    IndexOutOfRange { op_id: String, index: usize, max: usize },

    #[error("op '{op_id}' produces an invalid expression: {reason}")]
    ExprInvalid { op_id: String, reason: String },

    #[error("op '{op_id}' references unknown assertion '{assertion_id}'")]
    AssertionNotFound { op_id: String, assertion_id: String },

    #[error("op '{op_id}' save path collides with an existing output table")]
    OutputTableCollision { op_id: String },

    #[error("applying op '{op_id}' produced an invalid IR: {reason}")]
    IrInvalid { op_id: String, reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl AmendError {
    pub fn code(&self) -> &'static str {
        match self {
            AmendError::ValidationSchema(_) => "E_AMEND_VALIDATION_SCHEMA",
            AmendError::DuplicateOpId(_) => "E_AMEND_VALIDATION_SCHEMA",
            AmendError::CapabilityLimit { .. } => "E_AMEND_CAPABILITY_LIMIT",
            AmendError::PolicyDestructive { .. } => "E_AMEND_POLICY_DESTRUCTIVE",
            AmendError::PolicyOutputRewire { .. } => "E_AMEND_POLICY_OUTPUT_REWIRE",
            AmendError::PolicyApprox { .. } => "E_AMEND_POLICY_APPROX",
            AmendError::TargetNotFound { .. } => "E_AMEND_TARGET_NOT_FOUND",
            AmendError::TargetAmbiguous { .. } => "E_AMEND_TARGET_AMBIGUOUS",
            AmendError::TargetMismatch { .. } => "E_AMEND_TARGET_MISMATCH",
            AmendError::PathNotFound { .. } => "E_AMEND_PATH_NOT_FOUND",
            AmendError::PathInvalid { .. } => "E_AMEND_PATH_INVALID",
            AmendError::IndexOutOfRange { .. } => "E_AMEND_INDEX_OUT_OF_RANGE",
            AmendError::ExprInvalid { .. } => "E_AMEND_EXPR_INVALID",
            AmendError::AssertionNotFound { .. } => "E_AMEND_ASSERTION_NOT_FOUND",
            AmendError::OutputTableCollision { .. } => "E_AMEND_OUTPUT_TABLE_COLLISION",
            AmendError::IrInvalid { .. } => "E_AMEND_IR_INVALID",
            AmendError::Core(e) => e.code(),
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let mut d = Diagnostic::new(self.code(), self.to_string());
        d.loc = self.loc();
        d
    }

    fn loc(&self) -> Option<Loc> {
        None
    }
}
