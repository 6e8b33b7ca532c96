/// dagflow: workflow execution orchestrator
///
/// This library turns workflow definitions (nodes and connections) into
/// DAG executions: planning, readiness-driven dispatch through a task queue,
/// retries, error policies and durable execution records.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Workflow management layer - definitions, storage, and registry
pub mod workflow;

// Runtime orchestration - DAG planning, live executions and dispatch
pub mod runtime;

// Task queue contract and the in-process implementation
pub mod queue;

// Node executor registry and built-in node types
pub mod nodes;

// Execution records and context snapshots
pub mod store;

// Component wiring for the binary
pub mod app;

// Re-export commonly used types for external consumers
pub use error::{EngineError, Result};
pub use runtime::{ExecuteRequest, ExecutionEngine, ExecutionResponse, ExecutionResult};
pub use workflow::{Connection, Node, Workflow};
