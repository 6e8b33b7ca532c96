/// Structured orchestration events
///
/// Published on a broadcast bus so the CLI (or any embedding service) can
/// follow executions without polling.

use crate::runtime::context::{ExecutionMetrics, ExecutionStatus};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: String,
        workflow_id: String,
        total_nodes: usize,
    },
    NodeStarted {
        execution_id: String,
        node_id: String,
        attempt: u32,
    },
    NodeRetrying {
        execution_id: String,
        node_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    NodeCompleted {
        execution_id: String,
        node_id: String,
        output: Value,
        /// Executed nodes over total nodes, 0.0 to 1.0
        progress: f64,
    },
    NodeFailed {
        execution_id: String,
        node_id: String,
        error: String,
    },
    ExecutionFinished {
        execution_id: String,
        status: ExecutionStatus,
        metrics: ExecutionMetrics,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::NodeStarted { execution_id, .. }
            | Self::NodeRetrying { execution_id, .. }
            | Self::NodeCompleted { execution_id, .. }
            | Self::NodeFailed { execution_id, .. }
            | Self::ExecutionFinished { execution_id, .. } => execution_id,
        }
    }
}

/// Event bus using tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Nobody listening is not an error.
    pub fn publish(&self, event: ExecutionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
