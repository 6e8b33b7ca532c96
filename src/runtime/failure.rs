/// Failure Handler
///
/// Applies the workflow's error-handling policy once a node has failed for
/// good. STOP_ON_ERROR ends the execution and purges its queued tasks;
/// CONTINUE_ON_ERROR lets independent branches run on while the failed
/// node's descendants stay WAITING and are reported as skipped.

use crate::queue::TaskQueue;
use crate::runtime::completion::CompletionDetector;
use crate::runtime::context::{
    ExecutionContext, ExecutionContextManager, ExecutionResult, ExecutionStatus, NodeStatus,
};
use crate::runtime::graph::WorkflowGraph;
use crate::workflow::types::ErrorHandling;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// WAITING nodes that can never run because an ancestor FAILED.
///
/// Nodes already handed to the queue are excluded. Declaration order.
pub fn blocked_nodes(context: &ExecutionContext, graph: &WorkflowGraph) -> Vec<String> {
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut frontier: VecDeque<&str> = context
        .nodes
        .iter()
        .filter(|(_, state)| state.status == NodeStatus::Failed)
        .map(|(id, _)| id.as_str())
        .collect();

    while let Some(current) = frontier.pop_front() {
        for next in graph.successors(current) {
            if reachable.insert(next) {
                frontier.push_back(next);
            }
        }
    }

    graph
        .nodes()
        .filter(|node| reachable.contains(node.id.as_str()))
        .filter(|node| {
            context
                .node(&node.id)
                .map(|s| s.status == NodeStatus::Waiting && s.task_id.is_none())
                .unwrap_or(false)
        })
        .map(|node| node.id.clone())
        .collect()
}

pub struct FailureHandler {
    contexts: Arc<ExecutionContextManager>,
    queue: Arc<dyn TaskQueue>,
    completion: Arc<CompletionDetector>,
}

impl FailureHandler {
    pub fn new(
        contexts: Arc<ExecutionContextManager>,
        queue: Arc<dyn TaskQueue>,
        completion: Arc<CompletionDetector>,
    ) -> Self {
        Self {
            contexts,
            queue,
            completion,
        }
    }

    /// React to a node that exhausted its attempts.
    ///
    /// Returns the final result when the policy ended the execution here.
    pub async fn on_permanent_failure(
        &self,
        execution_id: &str,
        node_id: &str,
        error: &str,
    ) -> Option<ExecutionResult> {
        let policy = self
            .contexts
            .with_live(execution_id, |live| live.settings.error_handling)
            .await?;

        match policy {
            ErrorHandling::StopOnError => {
                tracing::warn!(execution_id, node_id, "❌ Stopping execution on node failure");
                self.stop(
                    execution_id,
                    ExecutionStatus::Failed,
                    Some(format!("node {} failed: {}", node_id, error)),
                )
                .await
            }
            ErrorHandling::ContinueOnError => {
                tracing::warn!(execution_id, node_id, error, "Node failed, continuing with independent branches");
                None
            }
        }
    }

    /// Force an execution into a terminal status and drop its queued work.
    ///
    /// Returns `None` if another path already finalized the execution.
    pub async fn stop(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Option<ExecutionResult> {
        let finalized = self.contexts.finish(execution_id, status, error).await?;

        match self
            .queue
            .remove_all_for_execution(execution_id.to_string())
            .await
        {
            Ok(removed) if removed > 0 => {
                tracing::debug!(execution_id, removed, "Purged queued tasks")
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(execution_id, error = %e, "Failed to purge queued tasks")
            }
        }

        Some(self.completion.publish(finalized).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::queue::{EnqueueOptions, NodeTask, TaskAck};
    use crate::runtime::context::{ExecutionMode, ExecutionSettings, NewExecution, NodeState};
    use crate::runtime::events::EventBus;
    use crate::runtime::graph::build_graph;
    use crate::runtime::planner::plan;
    use crate::store::InMemoryExecutionStore;
    use crate::workflow::types::{Connection, Node, Workflow};
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingQueue {
        purges: AtomicUsize,
    }

    impl TaskQueue for CountingQueue {
        fn enqueue(&self, task: NodeTask, _options: EnqueueOptions) -> BoxFuture<'_, Result<TaskAck>> {
            Box::pin(async move {
                Ok(TaskAck {
                    task_id: task.task_id,
                    queued: 1,
                })
            })
        }

        fn remove_all_for_execution(&self, _execution_id: String) -> BoxFuture<'_, Result<usize>> {
            Box::pin(async move {
                self.purges.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
        }
    }

    fn branching() -> (Workflow, WorkflowGraph) {
        let workflow = Workflow::new(
            "wf",
            vec![
                Node::new("T", "trigger"),
                Node::new("A", "delay"),
                Node::new("B", "delay"),
                Node::new("C", "delay"),
            ],
            vec![
                Connection::new("c1", "T", "A"),
                Connection::new("c2", "A", "B"),
                Connection::new("c3", "T", "C"),
            ],
        );
        let graph = build_graph(&workflow.nodes, &workflow.connections).unwrap();
        (workflow, graph)
    }

    fn state(status: NodeStatus) -> NodeState {
        let mut state = NodeState::waiting();
        state.status = status;
        state
    }

    #[test]
    fn descendants_of_failed_nodes_are_blocked() {
        let (workflow, graph) = branching();
        let mut ctx = ExecutionContext {
            execution_id: "e".into(),
            workflow_id: workflow.id.clone(),
            user_id: "u".into(),
            input_data: json!({}),
            mode: ExecutionMode::Async,
            status: ExecutionStatus::Running,
            nodes: Default::default(),
            variables: Default::default(),
            metrics: crate::runtime::context::ExecutionMetrics {
                started_at: chrono::Utc::now(),
                completed_at: None,
                executed_nodes: 0,
                total_nodes: 4,
                errors: Vec::new(),
                duration_ms: None,
            },
            error: None,
        };
        ctx.nodes.insert("T".into(), state(NodeStatus::Completed));
        ctx.nodes.insert("A".into(), state(NodeStatus::Failed));
        ctx.nodes.insert("B".into(), state(NodeStatus::Waiting));
        ctx.nodes.insert("C".into(), state(NodeStatus::Waiting));

        assert_eq!(blocked_nodes(&ctx, &graph), vec!["B".to_string()]);
    }

    async fn setup(
        error_handling: ErrorHandling,
    ) -> (Arc<ExecutionContextManager>, Arc<CountingQueue>, FailureHandler) {
        let (workflow, graph) = branching();
        let plan = plan(&graph).unwrap();
        let contexts = Arc::new(ExecutionContextManager::new());
        contexts
            .create(NewExecution {
                execution_id: "e1".into(),
                workflow: Arc::new(workflow),
                graph: Arc::new(graph),
                plan: Arc::new(plan),
                user_id: "u".into(),
                input_data: json!({}),
                mode: ExecutionMode::Async,
                settings: ExecutionSettings {
                    error_handling,
                    attempts: 1,
                    backoff_base_ms: 1,
                    node_timeout_ms: 1000,
                    execution_timeout_ms: None,
                },
                waiter: None,
            })
            .await
            .unwrap();
        contexts.mark_running("e1").await.unwrap();

        let queue = Arc::new(CountingQueue::default());
        let completion = Arc::new(CompletionDetector::new(
            Arc::clone(&contexts),
            Arc::new(InMemoryExecutionStore::new()),
            EventBus::default(),
        ));
        let handler = FailureHandler::new(Arc::clone(&contexts), queue.clone(), completion);
        (contexts, queue, handler)
    }

    #[tokio::test]
    async fn stop_on_error_finalizes_and_purges() {
        let (contexts, queue, handler) = setup(ErrorHandling::StopOnError).await;

        let result = handler.on_permanent_failure("e1", "A", "boom").await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("node A failed: boom"));
        assert_eq!(queue.purges.load(Ordering::SeqCst), 1);
        assert!(!contexts.contains("e1").await);

        // A second stop finds nothing to finalize
        assert!(handler.stop("e1", ExecutionStatus::Cancelled, None).await.is_none());
    }

    #[tokio::test]
    async fn continue_on_error_keeps_execution_running() {
        let (contexts, queue, handler) = setup(ErrorHandling::ContinueOnError).await;

        assert!(handler.on_permanent_failure("e1", "A", "boom").await.is_none());
        assert_eq!(queue.purges.load(Ordering::SeqCst), 0);
        let ctx = contexts.get("e1").await.unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Running);
    }
}
