//! Engine-level error types.

use nodes::GraphValidationError;
use thiserror::Error;

/// Errors produced by the workflow engine (validation + execution).
///
/// [`WorkflowExecutor::execute`](crate::WorkflowExecutor::execute) never
/// returns these directly; they end up as the outcome's error message and on
/// the failing node's execution state.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Load-time errors ------

    /// The graph failed structural validation; nothing was dispatched.
    #[error(transparent)]
    GraphValidation(#[from] GraphValidationError),

    /// A handler or node type is missing, or the executor is misused.
    #[error("configuration error: {0}")]
    Configuration(String),

    // ------ Execution errors ------

    /// A node's executor returned an error.
    #[error("node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    /// A node's executor did not finish within its timeout.
    #[error("Node '{node_id}' timed out after {secs}s")]
    Timeout { node_id: String, secs: u64 },

    /// A second End node was reached under the `error` end policy.
    #[error("end node '{node_id}' reached after '{first}' already recorded the result")]
    EndConflict { node_id: String, first: String },

    /// A sync node can never fire because a predecessor failed.
    #[error("sync '{node_id}' abandoned: predecessor '{failed}' failed")]
    SyncAbandoned { node_id: String, failed: String },

    /// The run was cancelled.
    #[error("execution cancelled")]
    Cancelled,

    // ------ Persistence errors ------

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
