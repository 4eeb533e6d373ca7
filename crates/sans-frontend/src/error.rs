//! Both front-ends' error boundary: parse/block refusals and the semantic
//! validator's kind-lock and reference-resolution refusals.

use sans_core::{CoreError, Diagnostic, Loc};

#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    #[error("{0}")]
    Parse(String, Loc),

    #[error("missing '# sans 0.1' header in the first five non-blank lines")]
    MissingHeader,

    #[error("malformed expression: {0}")]
    BadExpr(String, Loc),

    #[error("'{name}' is already declared as a {existing_kind}; cannot redeclare as a {new_kind}")]
    KindLock {
        name: String,
        existing_kind: &'static str,
        new_kind: &'static str,
        loc: Loc,
    },

    #[error("undeclared source '{name}'; known tables: [{known_tables}], known datasources: [{known_datasources}]")]
    UndeclaredSource {
        name: String,
        known_tables: String,
        known_datasources: String,
        loc: Loc,
    },

    #[error("'update!' target column '{name}' does not exist")]
    StrictMutation { name: String, loc: Loc },

    #[error("derive target column '{name}' already exists")]
    InvalidUpdate { name: String, loc: Loc },

    #[error("rename source column '{name}' does not exist")]
    UnknownColumn { name: String, loc: Loc },

    #[error("forbidden token '{token}' inside a data step")]
    ForbiddenToken { token: String, loc: Loc },

    #[error("{0}")]
    StatefulToken(String, Loc),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl FrontendError {
    pub fn code(&self) -> &'static str {
        match self {
            FrontendError::Parse(..) => "E_PARSE",
            FrontendError::MissingHeader => "E_MISSING_HEADER",
            FrontendError::BadExpr(..) => "E_BAD_EXPR",
            FrontendError::KindLock { .. } => "E_KIND_LOCK",
            FrontendError::UndeclaredSource { .. } => "E_UNDECLARED_SOURCE",
            FrontendError::StrictMutation { .. } => "E_STRICT_MUTATION",
            FrontendError::InvalidUpdate { .. } => "E_INVALID_UPDATE",
            FrontendError::UnknownColumn { .. } => "E_UNKNOWN_COLUMN",
            FrontendError::ForbiddenToken { .. } => "SANS_PARSE_FORBIDDEN_TOKEN",
            FrontendError::StatefulToken(..) => "SANS_BLOCK_STATEFUL_TOKEN",
            FrontendError::Core(e) => e.code(),
        }
    }

    pub fn loc(&self) -> Option<Loc> {
        match self {
            FrontendError::Parse(_, loc)
            | FrontendError::BadExpr(_, loc)
            | FrontendError::KindLock { loc, .. }
            | FrontendError::UndeclaredSource { loc, .. }
            | FrontendError::StrictMutation { loc, .. }
            | FrontendError::InvalidUpdate { loc, .. }
            | FrontendError::UnknownColumn { loc, .. }
            | FrontendError::ForbiddenToken { loc, .. }
            | FrontendError::StatefulToken(_, loc) => Some(loc.clone()),
            _ => None,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        let mut d = Diagnostic::new(self.code(), self.to_string());
        d.loc = self.loc();
        d
    }
}
