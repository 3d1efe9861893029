/// Engine-level error types
///
/// `EngineError` covers graph validation, node dispatch, the resilience layer
/// and runaway-execution guards. Persistence failures arrive wrapped as
/// [`EngineError::Store`].

use crate::store::StoreError;
use thiserror::Error;

/// Errors produced while validating, dispatching or executing a workflow.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Structural problem with the node/edge graph. Blocks execution start.
    #[error("malformed graph at '{node_id}': {reason}")]
    MalformedGraph { node_id: String, reason: String },

    /// A node's parameters don't match its schema (or a required one is missing at run time).
    #[error("invalid config for node '{node_id}': {reason}")]
    InvalidConfig { node_id: String, reason: String },

    // ------ Dispatch errors ------

    /// No handler registered for the node type. Never retried.
    #[error("no handler registered for node type '{0}'")]
    UnknownNodeType(String),

    /// The breaker guarding `target` is open; the handler was not invoked.
    #[error("circuit open for target '{target}'")]
    CircuitOpen { target: String },

    /// An external handler failed (network, auth, non-2xx, ...).
    #[error("node '{node_id}' failed: {message}")]
    Handler { node_id: String, message: String },

    // ------ Runaway guards (always fatal to the execution) ------

    #[error("loop limit exceeded at node '{node_id}' (limit {limit})")]
    LoopLimitExceeded { node_id: String, limit: u32 },

    #[error("sub-workflow depth exceeded at node '{node_id}' (limit {limit})")]
    SubWorkflowDepthExceeded { node_id: String, limit: u32 },

    // ------ Surface errors ------

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The execution was marked FAILED from outside; its branches stop at the next node.
    #[error("execution {0} aborted by administrator")]
    Aborted(uuid::Uuid),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The job queue has shut down; nothing can be scheduled any more.
    #[error("job queue is closed")]
    QueueClosed,
}

impl EngineError {
    pub fn malformed(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedGraph {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_config(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether an error_handler `retry` policy may re-attempt the node.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Handler { .. } | Self::CircuitOpen { .. })
    }

    /// Errors that fail the whole execution regardless of any error_handler.
    pub fn is_execution_fatal(&self) -> bool {
        matches!(
            self,
            Self::LoopLimitExceeded { .. }
                | Self::SubWorkflowDepthExceeded { .. }
                | Self::Store(_)
                | Self::Aborted(_)
                | Self::QueueClosed
        )
    }
}
