//! Front-end crate: two surface syntaxes lowering to the same
//! `sans_core::ir::IrDoc`, plus the deterministic printer that turns IR
//! back into `.sans` source.
//!
//! [`sas`] is the legacy SAS-subset front-end (`data … run`, a handful of
//! `proc` steps); [`parser`]/[`lower`] are the native `.sans` dialect. Both
//! bottom out in the same [`sans_core::validate::validate_structural`] once
//! the caller runs it — this crate only lowers and prints, it never
//! validates.

pub mod ast;
pub mod error;
pub mod lexer;
pub mod lower;
pub mod parser;
pub mod printer;
pub mod sas;

pub use error::FrontendError;
pub use lower::lower_program;
pub use parser::Parser;
pub use printer::print_ir;
pub use sas::lower_sas_source;

use sans_core::ir::IrDoc;
use sans_core::Diagnostic;

type PResult<T> = Result<T, FrontendError>;

/// Parses and lowers a `.sans` source file in one call.
pub fn compile_sans_source(source: &str, file: &str) -> PResult<(IrDoc, Vec<Diagnostic>)> {
    let mut parser = Parser::new(source, file)?;
    let program = parser.parse_program()?;
    lower_program(&program, file)
}
