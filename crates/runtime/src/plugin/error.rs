//! Plugin compilation and invocation errors.
//!
//! Messages name the fragment and carry the parser position so plugin authors
//! can find the problem without access to host logs.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{FragmentKind, SourceFragment};
use crate::script::{ExecError, SyntaxError};

/// A fragment body that cannot be turned into a callable unit.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind} '{fragment}' failed to compile: {diagnostic}")]
pub struct CompileError {
    pub fragment_id: Uuid,
    pub plugin_id: Uuid,
    pub kind: FragmentKind,
    pub fragment: String,
    #[serde(flatten)]
    pub diagnostic: Diagnostic,
}

/// Parser diagnostic: 1-based position (0 when unknown) plus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let err = SyntaxError::new(self.line, self.column, self.message.clone());
        write!(f, "{err}")
    }
}

impl CompileError {
    pub fn new(fragment: &SourceFragment, err: SyntaxError) -> Self {
        Self {
            fragment_id: fragment.id,
            plugin_id: fragment.plugin_id,
            kind: fragment.kind,
            fragment: fragment.name.clone(),
            diagnostic: Diagnostic {
                line: err.line,
                column: err.col,
                message: err.message,
            },
        }
    }
}

/// Why a fragment invocation did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Execution(#[from] ExecError),

    #[error("invocation timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    /// No live fragment answers to the requested name.
    #[error("{0} not found")]
    NotFound(String),

    #[error("registry lookup failed: {0}")]
    Registry(String),
}
