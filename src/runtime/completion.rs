/// Completion Detector
///
/// Runs after every node terminal transition. The completeness check and the
/// terminal flip happen under the execution lock, so exactly one callback
/// finalizes an execution. Finalizing persists the outcome, emits the
/// completion event, releases the live context and wakes a synchronous caller.

use crate::runtime::context::{
    finish_locked, ExecutionContext, ExecutionContextManager, ExecutionResult, ExecutionStatus,
    Finalized, NodeStatus,
};
use crate::runtime::events::{EventBus, ExecutionEvent};
use crate::runtime::failure::blocked_nodes;
use crate::runtime::graph::WorkflowGraph;
use crate::store::ExecutionStore;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Terminal status the execution has reached, if any.
///
/// Complete when every node is COMPLETED, FAILED, or WAITING behind a failed
/// ancestor. FAILED if any node failed.
pub fn evaluate(context: &ExecutionContext, graph: &WorkflowGraph) -> Option<ExecutionStatus> {
    let blocked = blocked_nodes(context, graph);
    let done = context.nodes.iter().all(|(id, state)| {
        matches!(state.status, NodeStatus::Completed | NodeStatus::Failed)
            || blocked.iter().any(|b| b == id)
    });

    if !done {
        return None;
    }
    if context.has_failed_node() {
        Some(ExecutionStatus::Failed)
    } else {
        Some(ExecutionStatus::Completed)
    }
}

/// Human-readable summary of the first failed node
pub fn failure_summary(context: &ExecutionContext) -> Option<String> {
    context
        .nodes
        .iter()
        .find(|(_, state)| state.status == NodeStatus::Failed)
        .map(|(id, state)| {
            format!(
                "node {} failed: {}",
                id,
                state.error.as_deref().unwrap_or("unknown error")
            )
        })
}

/// Assemble the caller-facing result from a terminal context
pub fn build_result(context: &ExecutionContext, skipped_nodes: Vec<String>) -> ExecutionResult {
    let node_results: BTreeMap<String, Value> = context
        .nodes
        .iter()
        .filter(|(_, state)| state.status == NodeStatus::Completed)
        .map(|(id, state)| (id.clone(), state.output.clone().unwrap_or(Value::Null)))
        .collect();

    ExecutionResult {
        success: context.status == ExecutionStatus::Completed,
        execution_id: context.execution_id.clone(),
        status: context.status,
        duration_ms: context.metrics.duration_ms.unwrap_or_default(),
        node_results,
        skipped_nodes,
        metrics: context.metrics.clone(),
        error: context.error.clone(),
    }
}

pub struct CompletionDetector {
    contexts: Arc<ExecutionContextManager>,
    store: Arc<dyn ExecutionStore>,
    events: EventBus,
}

impl CompletionDetector {
    pub fn new(
        contexts: Arc<ExecutionContextManager>,
        store: Arc<dyn ExecutionStore>,
        events: EventBus,
    ) -> Self {
        Self {
            contexts,
            store,
            events,
        }
    }

    /// Finalize the execution if every node is done.
    ///
    /// Returns the result only to the caller that performed the flip.
    pub async fn check(&self, execution_id: &str) -> Option<ExecutionResult> {
        let finalized = self
            .contexts
            .with_live(execution_id, |live| {
                if live.context.status != ExecutionStatus::Running {
                    return None;
                }
                let status = evaluate(&live.context, &live.graph)?;
                let error = match status {
                    ExecutionStatus::Failed => failure_summary(&live.context),
                    _ => None,
                };
                finish_locked(live, status, error)
            })
            .await
            .flatten()?;

        Some(self.publish(finalized).await)
    }

    /// Persist, announce and release a finalized execution
    pub async fn publish(&self, finalized: Finalized) -> ExecutionResult {
        let Finalized {
            context,
            skipped_nodes,
            waiter,
        } = finalized;
        let execution_id = context.execution_id.clone();
        let result = build_result(&context, skipped_nodes);

        let output: Map<String, Value> = result
            .node_results
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Err(e) = self
            .store
            .update_execution_record(
                execution_id.clone(),
                result.status,
                Value::Object(output),
                result.metrics.clone(),
                result.error.clone(),
            )
            .await
        {
            tracing::error!(execution_id = %execution_id, error = %e, "Failed to persist execution result");
        }
        if let Err(e) = self.store.save_snapshot(context).await {
            tracing::error!(execution_id = %execution_id, error = %e, "Failed to save final snapshot");
        }

        self.events.publish(ExecutionEvent::ExecutionFinished {
            execution_id: execution_id.clone(),
            status: result.status,
            metrics: result.metrics.clone(),
        });

        self.contexts.remove(&execution_id).await;

        match result.status {
            ExecutionStatus::Completed => tracing::info!(
                execution_id = %execution_id,
                duration_ms = result.duration_ms,
                nodes = result.node_results.len(),
                "🎉 Execution completed"
            ),
            status => tracing::info!(
                execution_id = %execution_id,
                status = status.as_str(),
                duration_ms = result.duration_ms,
                skipped = result.skipped_nodes.len(),
                error = result.error.as_deref().unwrap_or(""),
                "Execution finished"
            ),
        }

        if let Some(waiter) = waiter {
            // The synchronous caller may have timed out and gone away
            let _ = waiter.send(result.clone());
        }
        result
    }
}
