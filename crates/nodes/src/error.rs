//! Node-level error types.

use thiserror::Error;

use crate::expression::ExpressionError;

/// Errors returned by a node's `execute` method.
///
/// The engine records the message on the node's execution state; whether the
/// run aborts depends on the node's `continueOnError` flag.
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    /// The executor ran and failed.
    #[error("{0}")]
    Failed(String),

    /// A collaborator handler is missing or the node is misconfigured.
    /// Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The run was cancelled while the node was working.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl NodeError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Errors raised by the node registry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("unknown node type '{0}'")]
    UnknownNodeType(String),

    #[error("invalid config for '{node_type}' field '{field}': {reason}")]
    InvalidNodeConfig {
        node_type: String,
        field: String,
        reason: String,
    },
}

/// Errors raised by the execution context.
#[derive(Debug, Error, Clone)]
pub enum ContextError {
    /// A required graph parameter has no default and was not supplied.
    #[error("missing required parameter '{0}'")]
    MissingParameter(String),

    /// A collaborator handler was called before being bound.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// A bound handler reported a failure.
    #[error("{0}")]
    Handler(String),

    #[error("cancelled")]
    Cancelled,
}
