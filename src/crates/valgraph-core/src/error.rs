//! Error types for graph construction and execution.
//!
//! Every variant maps to one of the stable string kinds carried in wire
//! `error` events via [`GraphError::kind`]. The taxonomy is part of the
//! protocol: clients switch on kinds, never on messages.

use thiserror::Error;
use valgraph_checkpoint::InterruptRecord;

/// Convenience result type using [`GraphError`]
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while building or executing a graph
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure or input validation failed
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown thread, checkpoint or node
    #[error("Not found: {0}")]
    NotFound(String),

    /// A node raised a non-retryable error
    ///
    /// `kind` is the node-supplied classification consulted by retry
    /// policies (e.g. `"transient"`, `"rate_limit"`).
    #[error("Node '{node}' failed: {message}")]
    NodeError {
        /// Node that failed
        node: String,
        /// Namespace the node ran under
        namespace: String,
        /// Node-supplied error classification
        kind: String,
        /// Error description
        message: String,
    },

    /// A node's retry policy gave up
    #[error("Node '{node}' exhausted {attempts} attempts: {message}")]
    RetryExhausted {
        /// Node that failed
        node: String,
        /// Namespace the node ran under
        namespace: String,
        /// Attempts made, including the first
        attempts: usize,
        /// Last error message
        message: String,
    },

    /// The execution used up its superstep budget
    #[error("Recursion limit of {limit} supersteps reached")]
    RecursionLimit {
        /// Configured limit
        limit: usize,
    },

    /// A node or the execution exceeded its time budget
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout {
        /// What timed out
        operation: String,
        /// Budget in seconds
        seconds: u64,
    },

    /// The execution was cancelled by the caller
    #[error("Execution cancelled")]
    Cancelled,

    /// Two concurrent writers hit the same overwrite channel
    #[error("Conflicting writes to overwrite channel '{channel}' by nodes {nodes:?}")]
    Conflict {
        /// Channel both nodes wrote
        channel: String,
        /// The conflicting writers
        nodes: Vec<String>,
    },

    /// A resume value addressed an interrupt this thread does not hold
    #[error("Unknown interrupt id '{interrupt_id}'")]
    UnknownInterrupt {
        /// The id the caller supplied
        interrupt_id: String,
    },

    /// A resume was issued against a thread that is not suspended
    #[error("Thread '{0}' is not suspended")]
    NotSuspended(String),

    /// Control-flow signal: a node suspended itself awaiting a resume value.
    ///
    /// Caught by the runtime at the superstep barrier; never surfaces to
    /// callers, who observe a suspended run outcome instead.
    #[error("Execution suspended at '{}'", .0.source)]
    Suspended(InterruptRecord),

    /// Checkpoint store failure; fatal for the current execution
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] valgraph_checkpoint::CheckpointError),

    /// JSON encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    /// Create a node error with the default `node_error` classification
    pub fn node_error(
        node: impl Into<String>,
        namespace: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::NodeError {
            node: node.into(),
            namespace: namespace.into(),
            kind: "node_error".to_string(),
            message: message.into(),
        }
    }

    /// Stable wire kind carried in `error` events
    pub fn kind(&self) -> &'static str {
        match self {
            GraphError::Validation(_) => "validation",
            GraphError::NotFound(_) => "not_found",
            GraphError::NodeError { .. } => "node_error",
            GraphError::RetryExhausted { .. } => "retry_exhausted",
            GraphError::RecursionLimit { .. } => "recursion_limit",
            GraphError::Timeout { .. } => "execution_timeout",
            GraphError::Cancelled => "cancelled",
            GraphError::Conflict { .. } => "conflict",
            GraphError::UnknownInterrupt { .. } => "not_found",
            GraphError::NotSuspended(_) => "not_suspended",
            GraphError::Suspended(_) => "node_error",
            GraphError::Checkpoint(e) => e.kind(),
            GraphError::Serialization(_) => "persistence_failure",
        }
    }

    /// Node and namespace context, when the error has one
    pub fn node_context(&self) -> Option<(&str, &str)> {
        match self {
            GraphError::NodeError { node, namespace, .. }
            | GraphError::RetryExhausted { node, namespace, .. } => {
                Some((node.as_str(), namespace.as_str()))
            }
            _ => None,
        }
    }
}
