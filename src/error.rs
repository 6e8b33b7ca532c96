/// Error taxonomy for the orchestrator
///
/// Planning errors (`Validation`, `CyclicGraph`) are raised before anything is
/// dispatched. Node-level errors are captured into node state and never reach
/// the caller of `execute_workflow`. Infrastructure errors (queue, store) do.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    // Planning errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cyclic graph: cycle detected at node {node_id}")]
    CyclicGraph { node_id: String },

    // Node errors
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Node execution failed: {node_type}: {message}")]
    NodeExecution { node_type: String, message: String },

    #[error("Timed out after {elapsed_ms}ms: {scope}")]
    Timeout { scope: String, elapsed_ms: u64 },

    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    // Infrastructure errors
    #[error("Task queue error: {0}")]
    Queue(String),

    #[error("Execution store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Shorthand for a failed node with a message.
    pub fn node(node_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeExecution {
            node_type: node_type.into(),
            message: message.into(),
        }
    }

    /// Whether the Task Queue should spend another attempt on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NodeExecution { .. } | Self::Timeout { .. })
    }

    /// Errors coming from collaborators rather than from the workflow itself.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Queue(_) | Self::Store(_) | Self::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EngineError::node("delay", "boom").is_retryable());
        assert!(EngineError::Timeout {
            scope: "node n1".into(),
            elapsed_ms: 10
        }
        .is_retryable());
        assert!(!EngineError::UnknownNodeType("nope".into()).is_retryable());
        assert!(!EngineError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn infrastructure_classification() {
        assert!(EngineError::Queue("down".into()).is_infrastructure());
        assert!(EngineError::Store("down".into()).is_infrastructure());
        assert!(!EngineError::NotFound("x".into()).is_infrastructure());
    }

    #[test]
    fn cyclic_message_names_node() {
        let err = EngineError::CyclicGraph {
            node_id: "B".into(),
        };
        assert!(err.to_string().contains("B"));
    }
}
