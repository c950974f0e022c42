//! KF-002: Engine error types.
//!
//! Every error is local to the vertex that raised it; the block handler
//! turns it into a [`Diagnostic`](super::types::Diagnostic) for the recorder.

use super::types::BlockType;
use crate::expr::ExprError;
use thiserror::Error;

/// The main error type for kform execution.
#[derive(Error, Debug)]
pub enum Error {
    /// An expression references a variable missing from locals and the store.
    #[error("unresolved reference '{reference}' in expression '{expression}'")]
    UnresolvedReference {
        reference: String,
        expression: String,
    },

    /// A rendered loop attribute has an unsupported shape.
    #[error("type mismatch for {attribute}: expected {expected}, got {actual}")]
    TypeMismatch {
        attribute: String,
        expected: String,
        actual: String,
    },

    #[error("failed to compile expression '{expression}': {cause}")]
    Compile {
        expression: String,
        cause: ExprError,
    },

    #[error("failed to evaluate expression '{expression}': {cause}")]
    Evaluate {
        expression: String,
        cause: ExprError,
    },

    /// A provider returned an ERROR diagnostic.
    #[error("provider '{provider}' {operation} failed: {detail}")]
    Provider {
        provider: String,
        operation: String,
        detail: String,
    },

    #[error("provider '{0}' is not registered")]
    UnknownProvider(String),

    #[error("provider '{provider}' does not support {kind} '{resource_type}'")]
    Unsupported {
        provider: String,
        kind: String,
        resource_type: String,
    },

    #[error("variable '{0}' already exists")]
    DuplicateVariable(String),

    #[error("variable '{0}' not found")]
    VariableNotFound(String),

    #[error("input '{0}' has no value and no default")]
    MissingInput(String),

    #[error("no runner registered for block type {0}")]
    NoRunner(BlockType),

    #[error("module '{0}' has no nested graph")]
    MissingModuleGraph(String),

    #[error("module '{0}' failed")]
    ModuleFailed(String),

    /// A write was refused because the run was cancelled.
    #[error("execution cancelled before '{0}' could commit")]
    Cancelled(String),

    #[error("instance task of '{block}' did not complete: {detail}")]
    InstanceAborted { block: String, detail: String },

    #[error("graph error: {0}")]
    Graph(String),

    #[error("invalid engine config: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
