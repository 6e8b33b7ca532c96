/// Runtime Orchestration
///
/// This module turns workflow definitions into running executions:
/// - Converting workflows to petgraph DAGs and planning their order
/// - Tracking live executions behind per-execution locks
/// - Readiness-driven dispatch of nodes to the task queue
/// - Failure policies, completion detection and orchestration events

// DAG construction from nodes and connections
pub mod graph;

// Topological order, parallel groups and estimates
pub mod planner;

// Live execution registry and state machines
pub mod context;

// Ready-node selection and task submission
pub mod dispatcher;

// STOP_ON_ERROR / CONTINUE_ON_ERROR handling
pub mod failure;

// Terminal detection and finalization
pub mod completion;

// Broadcast bus of orchestration events
pub mod events;

// Orchestrator surface and task event handlers
pub mod engine;

pub use context::{ExecutionContext, ExecutionMode, ExecutionResult, ExecutionStatus, NodeStatus};
pub use engine::{ExecuteRequest, ExecutionEngine, ExecutionResponse};
pub use events::ExecutionEvent;

use crate::config::Config;
use crate::nodes::NodeExecutorRegistry;
use crate::queue::InMemoryTaskQueue;
use crate::store::ExecutionStore;
use crate::workflow::WorkflowRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Wire an engine to an in-process task queue and start its background tasks.
///
/// Must be called from within a tokio runtime.
pub fn launch(
    registry: Arc<WorkflowRegistry>,
    nodes: Arc<NodeExecutorRegistry>,
    store: Arc<dyn ExecutionStore>,
    config: &Config,
) -> Arc<ExecutionEngine> {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = InMemoryTaskQueue::start(nodes, &config.queue, tx);
    let engine = Arc::new(ExecutionEngine::new(
        registry,
        queue,
        store,
        config.engine.clone(),
    ));
    engine.spawn_event_loop(rx);
    engine.spawn_watchdog();
    engine
}
