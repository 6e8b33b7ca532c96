/// Node Dispatcher
///
/// Finds WAITING nodes whose predecessors all COMPLETED, builds their input
/// and hands them to the task queue. Selection and the RUNNING transition
/// happen under the execution lock; the enqueue calls run concurrently after
/// the lock is released and their errors are collected per node.

use crate::error::{EngineError, Result};
use crate::queue::{Backoff, EnqueueOptions, NodeTask, TaskQueue, PRIORITY_NORMAL, PRIORITY_RETRY};
use crate::runtime::context::{ExecutionContext, ExecutionContextManager, ExecutionStatus, LiveExecution, NodeStatus};
use crate::runtime::graph::WorkflowGraph;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Result of one dispatch step
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Nodes accepted by the task queue
    pub dispatched: Vec<String>,
    /// Nodes the task queue refused, with the reason
    pub failed: Vec<(String, EngineError)>,
}

impl DispatchReport {
    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty() && self.failed.is_empty()
    }
}

pub struct NodeDispatcher {
    contexts: Arc<ExecutionContextManager>,
    queue: Arc<dyn TaskQueue>,
}

impl NodeDispatcher {
    pub fn new(contexts: Arc<ExecutionContextManager>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { contexts, queue }
    }

    /// Submit every node that just became ready.
    ///
    /// Unknown or terminal executions yield an empty report.
    pub async fn dispatch_ready(&self, execution_id: &str) -> Result<DispatchReport> {
        let claimed = self
            .contexts
            .with_live(execution_id, claim_ready)
            .await
            .unwrap_or_default();

        if claimed.is_empty() {
            return Ok(DispatchReport::default());
        }

        tracing::debug!(
            execution_id,
            nodes = ?claimed.iter().map(|(t, _)| t.node_id.as_str()).collect::<Vec<_>>(),
            "Dispatching ready nodes"
        );

        let submissions = claimed.into_iter().map(|(task, options)| {
            let node_id = task.node_id.clone();
            let queue = Arc::clone(&self.queue);
            async move { (node_id, queue.enqueue(task, options).await) }
        });

        let mut report = DispatchReport::default();
        for (node_id, outcome) in futures::future::join_all(submissions).await {
            match outcome {
                Ok(_) => report.dispatched.push(node_id),
                Err(err) => {
                    tracing::error!(execution_id, node_id = %node_id, error = %err, "Task queue rejected node");
                    report.failed.push((node_id, err));
                }
            }
        }
        Ok(report)
    }
}

/// Select ready nodes in topological order and mark them RUNNING.
///
/// Runs under the execution lock so two concurrent callbacks never claim the
/// same node.
pub(crate) fn claim_ready(live: &mut LiveExecution) -> Vec<(NodeTask, EnqueueOptions)> {
    if live.context.status != ExecutionStatus::Running {
        return Vec::new();
    }

    let ready: Vec<String> = live
        .plan
        .execution_order
        .iter()
        .filter(|id| is_ready(&live.context, &live.graph, id))
        .cloned()
        .collect();

    let mut claimed = Vec::with_capacity(ready.len());
    for node_id in ready {
        let Some(node) = live.graph.node(&node_id) else {
            continue;
        };
        let input = build_input(&live.context, &live.graph, &node_id);
        let task_id = uuid::Uuid::new_v4().to_string();

        let options = EnqueueOptions {
            priority: PRIORITY_NORMAL,
            retry_priority: PRIORITY_RETRY,
            attempts: node.attempts_override().unwrap_or(live.settings.attempts).max(1),
            backoff: Backoff {
                base_delay_ms: live.settings.backoff_base_ms,
            },
            timeout_ms: node.timeout_override_ms().unwrap_or(live.settings.node_timeout_ms),
        };

        let task = NodeTask {
            task_id: task_id.clone(),
            execution_id: live.context.execution_id.clone(),
            workflow_id: live.context.workflow_id.clone(),
            user_id: live.context.user_id.clone(),
            node_id: node_id.clone(),
            node_type: node.node_type.clone(),
            configuration: node.configuration.clone(),
            input: input.clone(),
            variables: live.context.variables.clone(),
        };

        if let Some(state) = live.context.nodes.get_mut(&node_id) {
            state.status = NodeStatus::Running;
            state.input = Some(input);
            state.task_id = Some(task_id);
            state.started_at = Some(Utc::now());
        }
        claimed.push((task, options));
    }
    claimed
}

/// WAITING, never handed to the queue, and every predecessor COMPLETED
pub fn is_ready(context: &ExecutionContext, graph: &WorkflowGraph, node_id: &str) -> bool {
    let Some(state) = context.node(node_id) else {
        return false;
    };
    state.status == NodeStatus::Waiting
        && state.task_id.is_none()
        && graph
            .predecessors(node_id)
            .iter()
            .all(|p| context.node_status(p) == Some(NodeStatus::Completed))
}

/// Input of a node: predecessor outputs keyed by the connection's target
/// input, or the execution input for entry nodes.
///
/// When several connections share a target input the last one wins.
pub fn build_input(context: &ExecutionContext, graph: &WorkflowGraph, node_id: &str) -> Value {
    let incoming = graph.incoming(node_id);
    if incoming.is_empty() {
        return context.input_data.clone();
    }

    let mut input = Map::new();
    for connection in incoming {
        let output = context
            .node(&connection.source_node_id)
            .and_then(|s| s.output.clone())
            .unwrap_or(Value::Null);
        input.insert(connection.target_input.clone(), output);
    }
    Value::Object(input)
}
