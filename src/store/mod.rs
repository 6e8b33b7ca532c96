/// Execution Store
///
/// Durable record of executions and node runs. The orchestrator writes a
/// record when an execution is accepted, a node record on every permanent
/// node transition, context snapshots along the way, and the final status
/// once the execution is terminal.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryExecutionStore;
pub use sqlite::SqliteExecutionStore;

use crate::error::Result;
use crate::runtime::context::{
    ExecutionContext, ExecutionMetrics, ExecutionMode, ExecutionStatus, NodeStatus,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level execution row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub status: ExecutionStatus,
    pub mode: ExecutionMode,
    pub input_data: Value,
    pub started_at: DateTime<Utc>,
}

/// One node's final state within an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionRecord {
    pub execution_id: String,
    pub node_id: String,
    pub node_type: String,
    pub status: NodeStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persistence backend for executions
pub trait ExecutionStore: Send + Sync + 'static {
    fn create_execution_record(&self, record: ExecutionRecord) -> BoxFuture<'_, Result<()>>;

    /// Record the latest status, output and metrics of an execution
    fn update_execution_record(
        &self,
        execution_id: String,
        status: ExecutionStatus,
        output: Value,
        metrics: ExecutionMetrics,
        error: Option<String>,
    ) -> BoxFuture<'_, Result<()>>;

    fn create_node_execution_record(&self, record: NodeExecutionRecord) -> BoxFuture<'_, Result<()>>;

    /// Replace the stored snapshot of an execution context
    fn save_snapshot(&self, context: ExecutionContext) -> BoxFuture<'_, Result<()>>;

    fn load_snapshot(&self, execution_id: String) -> BoxFuture<'_, Result<Option<ExecutionContext>>>;

    /// Executions whose stored status is PENDING or RUNNING
    fn list_unfinished(&self) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>>;

    /// Refresh the liveness heartbeat of executions owned by this process.
    ///
    /// A record's heartbeat starts at its `started_at`.
    fn touch_executions(&self, execution_ids: Vec<String>) -> BoxFuture<'_, Result<()>>;

    /// Unfinished executions whose last heartbeat is older than `idle_since`
    fn list_abandoned(&self, idle_since: DateTime<Utc>) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>>;
}
