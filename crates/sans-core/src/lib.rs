//! Core data model for SANS: the type lattice, the expression ADT, the
//! canonical intermediate representation (datasources, op-steps, table
//! facts), canonical-JSON hashing, and the structural validator.
//!
//! Everything below the amendment engine and the two front-ends is rooted
//! here: this crate has no dependency on any other crate in the workspace.

pub mod canon;
pub mod diagnostic;
pub mod error;
pub mod expr;
pub mod ir;
pub mod types;
pub mod validate;

pub use diagnostic::{Diagnostic, ExitBucket, Loc};
pub use error::CoreError;
pub use ir::{IrDoc, OpParams, Step};
pub use types::Type;
pub use validate::{validate_structural, ValidateOptions, ValidatedIr};

/// `engine.version`, baked into every report. Compile-time constant; no
/// environment variable or config file ever overrides it.
pub const ENGINE_VERSION: &str = "sans-rs/0.1.0";

/// The version stamp every canonical `sans.ir` document carries.
pub const IR_VERSION: &str = "0.1";
