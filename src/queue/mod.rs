/// Task Queue contract
///
/// The orchestrator hands every node attempt to a `TaskQueue` and resumes only
/// when a `TaskEvent` comes back on the event channel. Delivery, retries,
/// backoff and per-attempt timeouts belong to the queue.

pub mod memory;

pub use memory::InMemoryTaskQueue;

use crate::error::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Priority of first attempts. Entry nodes and siblings all share it.
pub const PRIORITY_NORMAL: i32 = 0;
/// Priority of retried attempts, served ahead of fresh work
pub const PRIORITY_RETRY: i32 = 10;

/// One unit of work: a single node of a single execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeTask {
    pub task_id: String,
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub node_id: String,
    pub node_type: String,
    pub configuration: Value,
    pub input: Value,
    pub variables: Map<String, Value>,
}

/// Exponential backoff between attempts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    pub base_delay_ms: u64,
}

impl Backoff {
    /// Delay before the attempt following failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << exponent))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOptions {
    pub priority: i32,
    pub retry_priority: i32,
    /// Total attempts including the first, at least 1
    pub attempts: u32,
    pub backoff: Backoff,
    pub timeout_ms: u64,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: PRIORITY_NORMAL,
            retry_priority: PRIORITY_RETRY,
            attempts: 3,
            backoff: Backoff { base_delay_ms: 2000 },
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAck {
    pub task_id: String,
    /// Tasks waiting ahead of or alongside this one at enqueue time
    pub queued: usize,
}

/// Outcome notifications, delivered in order per task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Started {
        execution_id: String,
        node_id: String,
        task_id: String,
        attempt: u32,
    },
    /// Attempt failed and another one is scheduled after `delay_ms`
    Retrying {
        execution_id: String,
        node_id: String,
        task_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    Completed {
        execution_id: String,
        node_id: String,
        task_id: String,
        attempt: u32,
        output: Value,
    },
    /// Attempts exhausted or the error is not retryable
    Failed {
        execution_id: String,
        node_id: String,
        task_id: String,
        attempt: u32,
        error: String,
    },
}

impl TaskEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Started { execution_id, .. }
            | Self::Retrying { execution_id, .. }
            | Self::Completed { execution_id, .. }
            | Self::Failed { execution_id, .. } => execution_id,
        }
    }
}

/// Task queue as seen by the orchestrator
pub trait TaskQueue: Send + Sync + 'static {
    /// Accept a task for eventual execution
    fn enqueue(&self, task: NodeTask, options: EnqueueOptions) -> BoxFuture<'_, Result<TaskAck>>;

    /// Drop queued tasks and abort active ones tagged with `execution_id`.
    /// Returns how many tasks were affected.
    fn remove_all_for_execution(&self, execution_id: String) -> BoxFuture<'_, Result<usize>>;
}
