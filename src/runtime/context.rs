/// Execution Context Manager
///
/// Owns the registry of live executions. The registry map sits behind an
/// `RwLock` and every execution behind its own `Mutex`, so callbacks for
/// different executions never contend and callbacks for the same execution
/// are serialized. No lock is ever held across a task queue or store call.

use crate::error::{EngineError, Result};
use crate::runtime::graph::WorkflowGraph;
use crate::runtime::planner::ExecutionPlan;
use crate::workflow::types::{ErrorHandling, Workflow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex, RwLock};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Waiting,
    Running,
    Completed,
    Failed,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// Whether `execute_workflow` waits for the terminal status
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub status: NodeStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Failed attempts that were followed by another attempt
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set once the node has been handed to the task queue
    #[serde(default)]
    pub task_id: Option<String>,
}

impl NodeState {
    pub(crate) fn waiting() -> Self {
        Self {
            status: NodeStatus::Waiting,
            input: None,
            output: None,
            error: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            task_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeError {
    pub node_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Nodes that reached COMPLETED or FAILED
    pub executed_nodes: usize,
    pub total_nodes: usize,
    /// Every failed attempt, retried or not
    pub errors: Vec<NodeError>,
    pub duration_ms: Option<u64>,
}

/// Snapshot of one execution, live or finished
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub input_data: Value,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub nodes: BTreeMap<String, NodeState>,
    pub variables: Map<String, Value>,
    pub metrics: ExecutionMetrics,
    pub error: Option<String>,
}

impl ExecutionContext {
    pub fn node(&self, node_id: &str) -> Option<&NodeState> {
        self.nodes.get(node_id)
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|n| n.status)
    }

    pub fn has_failed_node(&self) -> bool {
        self.nodes.values().any(|n| n.status == NodeStatus::Failed)
    }
}

/// Final outcome of an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub duration_ms: u64,
    /// Output of every completed node
    pub node_results: BTreeMap<String, Value>,
    /// Nodes never dispatched because an ancestor failed
    pub skipped_nodes: Vec<String>,
    pub metrics: ExecutionMetrics,
    pub error: Option<String>,
}

/// Engine defaults merged with the workflow's own settings
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSettings {
    pub error_handling: ErrorHandling,
    pub attempts: u32,
    pub backoff_base_ms: u64,
    pub node_timeout_ms: u64,
    pub execution_timeout_ms: Option<u64>,
}

/// Everything the engine keeps about a live execution
#[derive(Debug)]
pub struct LiveExecution {
    pub context: ExecutionContext,
    pub graph: Arc<WorkflowGraph>,
    pub plan: Arc<ExecutionPlan>,
    pub settings: ExecutionSettings,
    pub started: Instant,
    /// Resolved by the finalizer for synchronous callers
    pub waiter: Option<oneshot::Sender<ExecutionResult>>,
}

/// Everything needed to register a new execution
#[derive(Debug)]
pub struct NewExecution {
    pub execution_id: String,
    pub workflow: Arc<Workflow>,
    pub graph: Arc<WorkflowGraph>,
    pub plan: Arc<ExecutionPlan>,
    pub user_id: String,
    pub input_data: Value,
    pub mode: ExecutionMode,
    pub settings: ExecutionSettings,
    pub waiter: Option<oneshot::Sender<ExecutionResult>>,
}

/// Live execution whose status just became terminal
#[derive(Debug)]
pub struct Finalized {
    pub context: ExecutionContext,
    pub skipped_nodes: Vec<String>,
    pub waiter: Option<oneshot::Sender<ExecutionResult>>,
}

/// Outcome of a state mutation on a live execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The execution is terminal or the node is not in a state that allows
    /// the move; the late result is dropped.
    Ignored,
}

/// Concurrency-safe registry of live executions
#[derive(Debug, Default)]
pub struct ExecutionContextManager {
    executions: RwLock<HashMap<String, Arc<Mutex<LiveExecution>>>>,
}

impl ExecutionContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new PENDING execution with every node WAITING
    pub async fn create(&self, new: NewExecution) -> Result<ExecutionContext> {
        let nodes: BTreeMap<String, NodeState> = new
            .graph
            .nodes()
            .map(|n| (n.id.clone(), NodeState::waiting()))
            .collect();

        let context = ExecutionContext {
            execution_id: new.execution_id.clone(),
            workflow_id: new.workflow.id.clone(),
            user_id: new.user_id,
            input_data: new.input_data,
            mode: new.mode,
            status: ExecutionStatus::Pending,
            metrics: ExecutionMetrics {
                started_at: Utc::now(),
                completed_at: None,
                executed_nodes: 0,
                total_nodes: nodes.len(),
                errors: Vec::new(),
                duration_ms: None,
            },
            nodes,
            variables: new.workflow.variables.clone(),
            error: None,
        };

        let live = LiveExecution {
            context: context.clone(),
            graph: new.graph,
            plan: new.plan,
            settings: new.settings,
            started: Instant::now(),
            waiter: new.waiter,
        };

        let mut executions = self.executions.write().await;
        if executions.contains_key(&new.execution_id) {
            return Err(EngineError::Validation(format!(
                "execution {} already exists",
                new.execution_id
            )));
        }
        executions.insert(new.execution_id, Arc::new(Mutex::new(live)));
        Ok(context)
    }

    /// Snapshot of a live execution
    pub async fn get(&self, execution_id: &str) -> Option<ExecutionContext> {
        self.with_live(execution_id, |live| live.context.clone()).await
    }

    pub async fn contains(&self, execution_id: &str) -> bool {
        self.executions.read().await.contains_key(execution_id)
    }

    pub async fn list(&self) -> Vec<ExecutionContext> {
        let entries: Vec<Arc<Mutex<LiveExecution>>> =
            self.executions.read().await.values().cloned().collect();

        let mut contexts = Vec::with_capacity(entries.len());
        for entry in entries {
            contexts.push(entry.lock().await.context.clone());
        }
        contexts.sort_by(|a, b| a.metrics.started_at.cmp(&b.metrics.started_at));
        contexts
    }

    pub async fn ids(&self) -> Vec<String> {
        self.executions.read().await.keys().cloned().collect()
    }

    pub async fn remove(&self, execution_id: &str) -> Option<ExecutionContext> {
        let entry = self.executions.write().await.remove(execution_id)?;
        let context = entry.lock().await.context.clone();
        Some(context)
    }

    /// Run `f` on a live execution while holding its lock.
    ///
    /// Returns `None` when the execution is not registered. `f` must not block.
    pub async fn with_live<R>(
        &self,
        execution_id: &str,
        f: impl FnOnce(&mut LiveExecution) -> R,
    ) -> Option<R> {
        let entry = self.executions.read().await.get(execution_id).cloned()?;
        let mut live = entry.lock().await;
        Some(f(&mut live))
    }

    /// PENDING → RUNNING
    pub async fn mark_running(&self, execution_id: &str) -> Result<Transition> {
        self.mutate(execution_id, |live| {
            if live.context.status != ExecutionStatus::Pending {
                return Transition::Ignored;
            }
            live.context.status = ExecutionStatus::Running;
            Transition::Applied
        })
        .await
    }

    /// WAITING → RUNNING for a node whose next attempt has started.
    ///
    /// A node already RUNNING (first attempt, marked at dispatch) is left as is.
    pub async fn mark_node_running(&self, execution_id: &str, node_id: &str) -> Result<Transition> {
        self.mutate(execution_id, |live| {
            let Some(node) = live.context.nodes.get_mut(node_id) else {
                return Transition::Ignored;
            };
            match node.status {
                NodeStatus::Waiting if node.task_id.is_some() => {
                    node.status = NodeStatus::Running;
                    node.started_at = Some(Utc::now());
                    Transition::Applied
                }
                NodeStatus::Running => Transition::Applied,
                _ => Transition::Ignored,
            }
        })
        .await
    }

    /// RUNNING → WAITING after a failed attempt that will be retried
    pub async fn mark_node_retrying(
        &self,
        execution_id: &str,
        node_id: &str,
        error: &str,
    ) -> Result<Transition> {
        self.mutate(execution_id, |live| {
            let Some(node) = live.context.nodes.get_mut(node_id) else {
                return Transition::Ignored;
            };
            if node.status != NodeStatus::Running {
                return Transition::Ignored;
            }
            node.status = NodeStatus::Waiting;
            node.retry_count += 1;
            node.error = Some(error.to_string());
            live.context.metrics.errors.push(NodeError {
                node_id: node_id.to_string(),
                error: error.to_string(),
                timestamp: Utc::now(),
            });
            Transition::Applied
        })
        .await
    }

    /// RUNNING → COMPLETED
    pub async fn mark_node_completed(
        &self,
        execution_id: &str,
        node_id: &str,
        output: Value,
    ) -> Result<Transition> {
        self.mutate(execution_id, |live| {
            let Some(node) = live.context.nodes.get_mut(node_id) else {
                return Transition::Ignored;
            };
            if node.status != NodeStatus::Running {
                return Transition::Ignored;
            }
            node.status = NodeStatus::Completed;
            node.output = Some(output);
            node.error = None;
            node.completed_at = Some(Utc::now());
            live.context.metrics.executed_nodes += 1;
            Transition::Applied
        })
        .await
    }

    /// RUNNING (or WAITING between attempts) → FAILED, permanently
    pub async fn mark_node_failed(
        &self,
        execution_id: &str,
        node_id: &str,
        error: &str,
    ) -> Result<Transition> {
        self.mutate(execution_id, |live| {
            let Some(node) = live.context.nodes.get_mut(node_id) else {
                return Transition::Ignored;
            };
            if !matches!(node.status, NodeStatus::Running | NodeStatus::Waiting) {
                return Transition::Ignored;
            }
            if node.status == NodeStatus::Waiting && node.task_id.is_none() {
                return Transition::Ignored;
            }
            node.status = NodeStatus::Failed;
            node.error = Some(error.to_string());
            node.completed_at = Some(Utc::now());
            live.context.metrics.executed_nodes += 1;
            live.context.metrics.errors.push(NodeError {
                node_id: node_id.to_string(),
                error: error.to_string(),
                timestamp: Utc::now(),
            });
            Transition::Applied
        })
        .await
    }

    /// Whether every node is terminal or blocked behind a failed ancestor
    pub async fn is_complete(&self, execution_id: &str) -> Result<bool> {
        self.with_live(execution_id, |live| {
            crate::runtime::completion::evaluate(&live.context, &live.graph).is_some()
        })
        .await
        .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))
    }

    /// Flip a non-terminal execution to `status`.
    ///
    /// Exactly one caller wins the flip and receives the finalized snapshot;
    /// everyone else gets `None`.
    pub async fn finish(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Option<Finalized> {
        self.with_live(execution_id, |live| finish_locked(live, status, error))
            .await
            .flatten()
    }

    async fn mutate(
        &self,
        execution_id: &str,
        f: impl FnOnce(&mut LiveExecution) -> Transition,
    ) -> Result<Transition> {
        self.with_live(execution_id, |live| {
            if live.context.status.is_terminal() {
                return Transition::Ignored;
            }
            f(live)
        })
        .await
        .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))
    }
}

/// Terminal flip performed while the execution lock is held
pub(crate) fn finish_locked(
    live: &mut LiveExecution,
    status: ExecutionStatus,
    error: Option<String>,
) -> Option<Finalized> {
    if live.context.status.is_terminal() {
        return None;
    }

    let now = Utc::now();
    live.context.status = status;
    live.context.error = error;
    live.context.metrics.completed_at = Some(now);
    live.context.metrics.duration_ms = Some(elapsed_ms(live.started));

    let skipped_nodes = crate::runtime::failure::blocked_nodes(&live.context, &live.graph);

    Some(Finalized {
        context: live.context.clone(),
        skipped_nodes,
        waiter: live.waiter.take(),
    })
}

/// Milliseconds since `started`, never zero once any time has passed
fn elapsed_ms(started: Instant) -> u64 {
    let micros = started.elapsed().as_micros();
    (micros.div_ceil(1000)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::graph::build_graph;
    use crate::runtime::planner::plan;
    use crate::workflow::types::{Connection, Node};
    use serde_json::json;

    fn settings() -> ExecutionSettings {
        ExecutionSettings {
            error_handling: ErrorHandling::StopOnError,
            attempts: 3,
            backoff_base_ms: 10,
            node_timeout_ms: 1000,
            execution_timeout_ms: None,
        }
    }

    async fn register(manager: &ExecutionContextManager, id: &str) -> ExecutionContext {
        let workflow = Workflow::new(
            "wf",
            vec![Node::new("A", "trigger"), Node::new("B", "delay")],
            vec![Connection::new("c1", "A", "B")],
        );
        let graph = build_graph(&workflow.nodes, &workflow.connections).unwrap();
        let plan = plan(&graph).unwrap();
        manager
            .create(NewExecution {
                execution_id: id.to_string(),
                workflow: Arc::new(workflow),
                graph: Arc::new(graph),
                plan: Arc::new(plan),
                user_id: "user-1".into(),
                input_data: json!({ "x": 1 }),
                mode: ExecutionMode::Async,
                settings: settings(),
                waiter: None,
            })
            .await
            .unwrap()
    }

    async fn claim(manager: &ExecutionContextManager, id: &str, node_id: &str) {
        manager
            .with_live(id, |live| {
                let node = live.context.nodes.get_mut(node_id).unwrap();
                node.status = NodeStatus::Running;
                node.task_id = Some(format!("task-{}", node_id));
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_registers_waiting_nodes() {
        let manager = ExecutionContextManager::new();
        let context = register(&manager, "e1").await;

        assert_eq!(context.status, ExecutionStatus::Pending);
        assert_eq!(context.metrics.total_nodes, 2);
        assert!(context.nodes.values().all(|n| n.status == NodeStatus::Waiting));
        assert!(manager.get("e1").await.is_some());
        assert_eq!(manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_execution_id_is_rejected() {
        let manager = ExecutionContextManager::new();
        register(&manager, "dup").await;

        let workflow = Workflow::new("wf", vec![Node::new("A", "trigger")], vec![]);
        let graph = build_graph(&workflow.nodes, &[]).unwrap();
        let plan = plan(&graph).unwrap();
        let result = manager
            .create(NewExecution {
                execution_id: "dup".into(),
                workflow: Arc::new(workflow),
                graph: Arc::new(graph),
                plan: Arc::new(plan),
                user_id: String::new(),
                input_data: Value::Null,
                mode: ExecutionMode::Async,
                settings: settings(),
                waiter: None,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn node_lifecycle_with_retry() {
        let manager = ExecutionContextManager::new();
        register(&manager, "e1").await;
        manager.mark_running("e1").await.unwrap();
        claim(&manager, "e1", "A").await;

        let retry = manager.mark_node_retrying("e1", "A", "flaky").await.unwrap();
        assert_eq!(retry, Transition::Applied);
        assert_eq!(manager.get("e1").await.unwrap().node_status("A"), Some(NodeStatus::Waiting));

        manager.mark_node_running("e1", "A").await.unwrap();
        let done = manager
            .mark_node_completed("e1", "A", json!({ "ok": true }))
            .await
            .unwrap();
        assert_eq!(done, Transition::Applied);

        let context = manager.get("e1").await.unwrap();
        let a = context.node("A").unwrap();
        assert_eq!(a.status, NodeStatus::Completed);
        assert_eq!(a.retry_count, 1);
        assert!(a.error.is_none());
        assert_eq!(context.metrics.executed_nodes, 1);
        assert_eq!(context.metrics.errors.len(), 1);
    }

    #[tokio::test]
    async fn completing_a_waiting_node_is_ignored() {
        let manager = ExecutionContextManager::new();
        register(&manager, "e1").await;
        manager.mark_running("e1").await.unwrap();

        let outcome = manager.mark_node_completed("e1", "B", json!(1)).await.unwrap();
        assert_eq!(outcome, Transition::Ignored);
    }

    #[tokio::test]
    async fn finish_happens_once_and_freezes_state() {
        let manager = ExecutionContextManager::new();
        register(&manager, "e1").await;
        manager.mark_running("e1").await.unwrap();
        claim(&manager, "e1", "A").await;

        let finalized = manager
            .finish("e1", ExecutionStatus::Cancelled, None)
            .await
            .unwrap();
        assert_eq!(finalized.context.status, ExecutionStatus::Cancelled);
        assert!(finalized.context.metrics.duration_ms.is_some());
        assert!(manager.finish("e1", ExecutionStatus::Failed, None).await.is_none());

        let late = manager.mark_node_completed("e1", "A", json!(1)).await.unwrap();
        assert_eq!(late, Transition::Ignored);
    }

    #[tokio::test]
    async fn unknown_execution_is_not_found() {
        let manager = ExecutionContextManager::new();
        let err = manager.mark_node_failed("ghost", "A", "x").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(manager.remove("ghost").await.is_none());
    }

    #[tokio::test]
    async fn is_complete_tracks_terminal_nodes() {
        let manager = ExecutionContextManager::new();
        register(&manager, "e1").await;
        manager.mark_running("e1").await.unwrap();
        assert!(!manager.is_complete("e1").await.unwrap());

        claim(&manager, "e1", "A").await;
        manager.mark_node_completed("e1", "A", json!({})).await.unwrap();
        claim(&manager, "e1", "B").await;
        manager.mark_node_completed("e1", "B", json!({})).await.unwrap();
        assert!(manager.is_complete("e1").await.unwrap());
    }
}
