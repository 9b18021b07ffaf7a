//! Fragment script language.
//!
//! Plugin source fragments are written in a small expression language whose
//! values are JSON values. A fragment is exactly one function literal; the
//! only way it can reach the outside world is through the capability objects
//! the host binds in (see [`crate::host`]).
//!
//! Pipeline: [`lexer`] → [`parser`] → [`check`] (scope resolution) →
//! [`interp`] (async tree-walking evaluation under a step budget).

mod ast;
mod builtins;
mod check;
mod interp;
mod lexer;
mod parser;
pub mod value;

use std::fmt;

use serde_json::Value;
use thiserror::Error;

pub use ast::Function;
pub use builtins::RESPONSE_TAG;
pub use check::{Surface, check_function};
pub use interp::{Budget, HostBridge, execute};
pub use parser::parse_function;

/// A lexing, parsing or resolution error with its source position.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct SyntaxError {
    /// 1-based line (0 when the position is unknown).
    pub line: usize,
    /// 1-based column (0 when only the line is known).
    pub col: usize,
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: usize, col: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            col,
            message: message.into(),
        }
    }

    pub fn at_line(line: usize, message: impl Into<String>) -> Self {
        Self::new(line, 0, message)
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.col) {
            (0, _) => write!(f, "{}", self.message),
            (line, 0) => write!(f, "line {line}: {}", self.message),
            (line, col) => write!(f, "line {line}, column {col}: {}", self.message),
        }
    }
}

/// Misuse of a capability that the compile-time checks cannot rule out,
/// such as a malformed collection name or a request to a host outside the
/// allowlist.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("capability violation in '{capability}': {reason}")]
pub struct CapabilityViolation {
    pub capability: String,
    pub reason: String,
}

impl CapabilityViolation {
    pub fn new(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            reason: reason.into(),
        }
    }
}

/// Runtime failure of a fragment function.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// The fragment executed `throw`.
    #[error("fragment threw: {}", value::to_display(.0))]
    Thrown(Value),

    #[error("type error: {0}")]
    Type(String),

    #[error(transparent)]
    Capability(#[from] CapabilityViolation),

    /// A capability backend (data store, outbound HTTP) failed.
    #[error("host call failed: {0}")]
    Host(String),

    #[error("step budget of {0} exhausted")]
    BudgetExhausted(u64),

    #[error("value exceeds the size limit of {0} or nests too deeply")]
    ValueTooLarge(usize),
}

/// Parse and resolve a fragment body against a capability surface.
pub fn compile(source: &str, surface: &Surface) -> Result<Function, SyntaxError> {
    let function = parse_function(source)?;
    check_function(&function, surface)?;
    Ok(function)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_display_includes_position() {
        assert_eq!(
            SyntaxError::new(2, 5, "boom").to_string(),
            "line 2, column 5: boom"
        );
        assert_eq!(SyntaxError::at_line(3, "boom").to_string(), "line 3: boom");
        assert_eq!(SyntaxError::at_line(0, "boom").to_string(), "boom");
    }

    #[test]
    fn thrown_values_display_as_text() {
        let err = ExecError::Thrown(Value::String("nope".into()));
        assert_eq!(err.to_string(), "fragment threw: nope");
    }

    #[test]
    fn compile_runs_the_checker() {
        let surface: &Surface = &[("log", &["info"])];
        assert!(compile("fn() { log.info(\"hi\"); }", surface).is_ok());
        assert!(compile("fn() { db.insert(\"x\", {}); }", surface).is_err());
    }
}
