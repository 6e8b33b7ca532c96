/// Workflow Execution Engine
///
/// Entry point of the orchestrator. A call to `execute_workflow` builds and
/// plans the DAG, registers the execution, and hands the entry nodes to the
/// task queue. From then on the engine only moves when a `TaskEvent` comes
/// back: each completed node unblocks its dependents, each failed node goes
/// through the failure policy, and the completion detector closes the run.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::queue::{TaskEvent, TaskQueue};
use crate::runtime::completion::CompletionDetector;
use crate::runtime::context::{
    ExecutionContext, ExecutionContextManager, ExecutionMetrics, ExecutionMode, ExecutionResult,
    ExecutionSettings, ExecutionStatus, NewExecution, Transition,
};
use crate::runtime::dispatcher::NodeDispatcher;
use crate::runtime::events::{EventBus, ExecutionEvent};
use crate::runtime::failure::FailureHandler;
use crate::runtime::graph::build_graph;
use crate::runtime::planner;
use crate::store::{ExecutionRecord, ExecutionStore, NodeExecutionRecord};
use crate::workflow::{Workflow, WorkflowRegistry};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Inbound request to run a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub workflow_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub input_data: Value,
    #[serde(default)]
    pub mode: ExecutionMode,
}

/// What `execute_workflow` hands back
#[derive(Debug, Clone)]
pub enum ExecutionResponse {
    /// Synchronous mode: the terminal result
    Finished(ExecutionResult),
    /// Asynchronous mode: poll with `get_execution_status`
    Accepted { execution_id: String },
}

impl ExecutionResponse {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Finished(result) => &result.execution_id,
            Self::Accepted { execution_id } => execution_id,
        }
    }
}

pub struct ExecutionEngine {
    registry: Arc<WorkflowRegistry>,
    contexts: Arc<ExecutionContextManager>,
    dispatcher: NodeDispatcher,
    failure: FailureHandler,
    completion: Arc<CompletionDetector>,
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn TaskQueue>,
    events: EventBus,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn ExecutionStore>,
        config: EngineConfig,
    ) -> Self {
        let contexts = Arc::new(ExecutionContextManager::new());
        let events = EventBus::new(config.event_capacity);
        let completion = Arc::new(CompletionDetector::new(
            Arc::clone(&contexts),
            Arc::clone(&store),
            events.clone(),
        ));
        let failure = FailureHandler::new(
            Arc::clone(&contexts),
            Arc::clone(&queue),
            Arc::clone(&completion),
        );
        let dispatcher = NodeDispatcher::new(Arc::clone(&contexts), Arc::clone(&queue));

        Self {
            registry,
            contexts,
            dispatcher,
            failure,
            completion,
            store,
            queue,
            events,
            config,
        }
    }

    /// Run a stored workflow.
    ///
    /// Planning errors and infrastructure failures are returned before any
    /// state is left behind. Node failures never surface here; they end up
    /// in the result of a synchronous call or in the execution status.
    pub async fn execute_workflow(&self, request: ExecuteRequest) -> Result<ExecutionResponse> {
        let workflow = self
            .registry
            .get_workflow(&request.workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", request.workflow_id)))?;

        tracing::debug!(
            workflow_id = %workflow.id,
            nodes = workflow.nodes.len(),
            connections = workflow.connections.len(),
            "📊 Building workflow DAG"
        );
        let graph = build_graph(&workflow.nodes, &workflow.connections)?;
        let plan = planner::plan(&graph)?;
        tracing::debug!(order = ?plan.execution_order, groups = plan.parallel_groups.len(), "📋 Execution plan");

        let execution_id = uuid::Uuid::new_v4().to_string();
        let settings = self.resolve_settings(&workflow);

        self.store
            .create_execution_record(ExecutionRecord {
                execution_id: execution_id.clone(),
                workflow_id: workflow.id.clone(),
                user_id: request.user_id.clone(),
                status: ExecutionStatus::Running,
                mode: request.mode,
                input_data: request.input_data.clone(),
                started_at: Utc::now(),
            })
            .await?;

        let (waiter, receiver) = match request.mode {
            ExecutionMode::Sync => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            ExecutionMode::Async => (None, None),
        };

        let total_nodes = graph.node_count();
        self.contexts
            .create(NewExecution {
                execution_id: execution_id.clone(),
                workflow: Arc::clone(&workflow),
                graph: Arc::new(graph),
                plan: Arc::new(plan),
                user_id: request.user_id,
                input_data: request.input_data,
                mode: request.mode,
                settings,
                waiter,
            })
            .await?;
        self.contexts.mark_running(&execution_id).await?;

        if let Some(context) = self.contexts.get(&execution_id).await {
            if let Err(e) = self.store.save_snapshot(context).await {
                self.abort_start(&execution_id, &e).await;
                return Err(e);
            }
        }

        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %workflow.id,
            total_nodes,
            "🚀 Starting workflow execution"
        );
        self.events.publish(ExecutionEvent::ExecutionStarted {
            execution_id: execution_id.clone(),
            workflow_id: workflow.id.clone(),
            total_nodes,
        });

        let report = self.dispatcher.dispatch_ready(&execution_id).await?;
        if let Some((_, err)) = report.failed.into_iter().next() {
            self.abort_start(&execution_id, &err).await;
            return Err(err);
        }

        let Some(receiver) = receiver else {
            return Ok(ExecutionResponse::Accepted { execution_id });
        };

        let limit = Duration::from_millis(self.config.sync_timeout_ms);
        match tokio::time::timeout(limit, receiver).await {
            Ok(Ok(result)) => Ok(ExecutionResponse::Finished(result)),
            Ok(Err(_)) => Err(EngineError::NotFound(format!(
                "execution {} ended without a result",
                execution_id
            ))),
            Err(_) => {
                tracing::warn!(execution_id = %execution_id, "Synchronous wait expired, execution keeps running");
                Err(EngineError::Timeout {
                    scope: format!("waiting for execution {}", execution_id),
                    elapsed_ms: self.config.sync_timeout_ms,
                })
            }
        }
    }

    /// Live context, or the last stored snapshot once the execution ended
    pub async fn get_execution_status(&self, execution_id: &str) -> Result<Option<ExecutionContext>> {
        if let Some(context) = self.contexts.get(execution_id).await {
            return Ok(Some(context));
        }
        self.store.load_snapshot(execution_id.to_string()).await
    }

    /// Cancel a live execution and drop its queued and running tasks
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<ExecutionResult> {
        tracing::info!(execution_id, "🛑 Cancelling execution");
        self.failure
            .stop(
                execution_id,
                ExecutionStatus::Cancelled,
                Some("execution cancelled".to_string()),
            )
            .await
            .ok_or_else(|| EngineError::NotFound(format!("live execution {}", execution_id)))
    }

    pub async fn list_active_executions(&self) -> Vec<ExecutionContext> {
        self.contexts.list().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Route one queue notification to its handler
    pub async fn handle_task_event(&self, event: TaskEvent) {
        match event {
            TaskEvent::Started {
                execution_id,
                node_id,
                attempt,
                ..
            } => self.on_node_started(&execution_id, &node_id, attempt).await,
            TaskEvent::Retrying {
                execution_id,
                node_id,
                attempt,
                delay_ms,
                error,
                ..
            } => {
                self.on_node_retrying(&execution_id, &node_id, attempt, delay_ms, &error)
                    .await
            }
            TaskEvent::Completed {
                execution_id,
                node_id,
                output,
                ..
            } => self.on_node_completed(&execution_id, &node_id, output).await,
            TaskEvent::Failed {
                execution_id,
                node_id,
                error,
                ..
            } => self.on_node_failed(&execution_id, &node_id, &error).await,
        }
    }

    pub async fn on_node_started(&self, execution_id: &str, node_id: &str, attempt: u32) {
        let transition = self.contexts.mark_node_running(execution_id, node_id).await;
        if !self.accepted(transition, execution_id, node_id, "start") {
            return;
        }
        tracing::debug!(execution_id, node_id, attempt, "▶️ Node attempt started");
        self.events.publish(ExecutionEvent::NodeStarted {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            attempt,
        });
    }

    pub async fn on_node_retrying(
        &self,
        execution_id: &str,
        node_id: &str,
        attempt: u32,
        delay_ms: u64,
        error: &str,
    ) {
        let transition = self
            .contexts
            .mark_node_retrying(execution_id, node_id, error)
            .await;
        if !self.accepted(transition, execution_id, node_id, "retry") {
            return;
        }
        tracing::warn!(execution_id, node_id, attempt, delay_ms, error, "🔁 Node attempt failed, retrying");
        self.events.publish(ExecutionEvent::NodeRetrying {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            attempt,
            delay_ms,
            error: error.to_string(),
        });
    }

    pub async fn on_node_completed(&self, execution_id: &str, node_id: &str, output: Value) {
        let transition = self
            .contexts
            .mark_node_completed(execution_id, node_id, output.clone())
            .await;
        if !self.accepted(transition, execution_id, node_id, "result") {
            return;
        }

        let progress = self.persist_node(execution_id, node_id).await;
        tracing::info!(execution_id, node_id, progress, "✅ Node completed");
        self.events.publish(ExecutionEvent::NodeCompleted {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            output,
            progress,
        });

        self.advance(execution_id).await;
    }

    pub async fn on_node_failed(&self, execution_id: &str, node_id: &str, error: &str) {
        if self.fail_node(execution_id, node_id, error).await {
            self.completion.check(execution_id).await;
        }
    }

    /// Fail every live execution that ran past its ceiling.
    ///
    /// Returns how many executions were stopped.
    pub async fn enforce_timeouts(&self) -> usize {
        let mut stopped = 0;
        for execution_id in self.contexts.ids().await {
            let expired = self
                .contexts
                .with_live(&execution_id, |live| {
                    let limit = live.settings.execution_timeout_ms?;
                    let elapsed = live.started.elapsed().as_millis() as u64;
                    (elapsed > limit).then_some(elapsed)
                })
                .await
                .flatten();

            let Some(elapsed_ms) = expired else {
                continue;
            };
            let error = EngineError::Timeout {
                scope: format!("execution {}", execution_id),
                elapsed_ms,
            };
            tracing::warn!(execution_id = %execution_id, elapsed_ms, "⏰ Execution timed out");
            if self
                .failure
                .stop(&execution_id, ExecutionStatus::Failed, Some(error.to_string()))
                .await
                .is_some()
            {
                stopped += 1;
            }
        }
        stopped
    }

    /// Refresh the stored heartbeat of every live execution
    pub async fn heartbeat(&self) {
        let ids = self.contexts.ids().await;
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.store.touch_executions(ids).await {
            tracing::warn!(error = %e, "Failed to refresh execution heartbeats");
        }
    }

    /// Mark executions whose owner stopped heartbeating as FAILED.
    ///
    /// An unfinished record counts as interrupted once its heartbeat is older
    /// than `recovery_grace_ms`, so runs owned by another live engine on the
    /// same store are left alone. Interrupted runs are never re-dispatched:
    /// node handlers give no idempotency guarantee.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let grace = i64::try_from(self.config.recovery_grace_ms).unwrap_or(i64::MAX);
        let idle_since = Utc::now()
            .checked_sub_signed(chrono::Duration::milliseconds(grace))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let mut recovered = 0;
        for record in self.store.list_abandoned(idle_since).await? {
            if self.contexts.contains(&record.execution_id).await {
                continue;
            }

            let snapshot = self.store.load_snapshot(record.execution_id.clone()).await?;
            let now = Utc::now();
            let metrics = match &snapshot {
                Some(context) => ExecutionMetrics {
                    completed_at: Some(now),
                    ..context.metrics.clone()
                },
                None => ExecutionMetrics {
                    started_at: record.started_at,
                    completed_at: Some(now),
                    executed_nodes: 0,
                    total_nodes: 0,
                    errors: Vec::new(),
                    duration_ms: None,
                },
            };
            let error = "interrupted".to_string();

            self.store
                .update_execution_record(
                    record.execution_id.clone(),
                    ExecutionStatus::Failed,
                    Value::Object(Map::new()),
                    metrics.clone(),
                    Some(error.clone()),
                )
                .await?;
            if let Some(mut context) = snapshot {
                context.status = ExecutionStatus::Failed;
                context.error = Some(error);
                context.metrics = metrics;
                self.store.save_snapshot(context).await?;
            }

            tracing::warn!(execution_id = %record.execution_id, "Marked interrupted execution as failed");
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Consume queue notifications until the queue goes away
    pub fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<TaskEvent>) {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.handle_task_event(event).await;
            }
            tracing::debug!("Task event loop stopped");
        });
    }

    /// Periodically enforce whole-execution timeouts and refresh heartbeats
    pub fn spawn_watchdog(self: &Arc<Self>) {
        let engine: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.watchdog_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.enforce_timeouts().await;
                engine.heartbeat().await;
            }
        });
    }

    fn resolve_settings(&self, workflow: &Workflow) -> ExecutionSettings {
        ExecutionSettings {
            error_handling: workflow.settings.error_handling,
            attempts: workflow
                .settings
                .max_retries
                .unwrap_or(self.config.default_attempts)
                .max(1),
            backoff_base_ms: self.config.backoff_base_ms,
            node_timeout_ms: self.config.node_timeout_ms,
            execution_timeout_ms: workflow
                .settings
                .execution_timeout_ms
                .or(self.config.execution_timeout_ms),
        }
    }

    /// Dispatch newly ready nodes, then see whether the run is over
    async fn advance(&self, execution_id: &str) {
        match self.dispatcher.dispatch_ready(execution_id).await {
            Ok(report) => {
                for (node_id, err) in report.failed {
                    self.fail_node(execution_id, &node_id, &err.to_string()).await;
                }
            }
            Err(e) => tracing::error!(execution_id, error = %e, "Dispatch failed"),
        }
        self.completion.check(execution_id).await;
    }

    /// Permanent node failure: record it and apply the error policy.
    ///
    /// Returns false when the failure was discarded.
    async fn fail_node(&self, execution_id: &str, node_id: &str, error: &str) -> bool {
        let transition = self
            .contexts
            .mark_node_failed(execution_id, node_id, error)
            .await;
        if !self.accepted(transition, execution_id, node_id, "failure") {
            return false;
        }

        self.persist_node(execution_id, node_id).await;
        tracing::error!(execution_id, node_id, error, "❌ Node failed permanently");
        self.events.publish(ExecutionEvent::NodeFailed {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            error: error.to_string(),
        });

        self.failure
            .on_permanent_failure(execution_id, node_id, error)
            .await;
        true
    }

    /// Write the node record and a context snapshot. Returns the progress.
    async fn persist_node(&self, execution_id: &str, node_id: &str) -> f64 {
        let captured = self
            .contexts
            .with_live(execution_id, |live| {
                let state = live.context.node(node_id)?;
                let node_type = live
                    .graph
                    .node(node_id)
                    .map(|n| n.node_type.clone())
                    .unwrap_or_default();
                let record = NodeExecutionRecord {
                    execution_id: execution_id.to_string(),
                    node_id: node_id.to_string(),
                    node_type,
                    status: state.status,
                    input: state.input.clone(),
                    output: state.output.clone(),
                    error: state.error.clone(),
                    retry_count: state.retry_count,
                    started_at: state.started_at,
                    completed_at: state.completed_at,
                };
                let metrics = &live.context.metrics;
                let progress = if metrics.total_nodes == 0 {
                    1.0
                } else {
                    metrics.executed_nodes as f64 / metrics.total_nodes as f64
                };
                Some((record, live.context.clone(), progress))
            })
            .await
            .flatten();

        let Some((record, snapshot, progress)) = captured else {
            return 0.0;
        };
        if let Err(e) = self.store.create_node_execution_record(record).await {
            tracing::error!(execution_id, node_id, error = %e, "Failed to persist node record");
        }
        if let Err(e) = self.store.save_snapshot(snapshot).await {
            tracing::error!(execution_id, error = %e, "Failed to save execution snapshot");
        }
        progress
    }

    /// Undo a start that failed on infrastructure: nothing stays live
    async fn abort_start(&self, execution_id: &str, cause: &EngineError) {
        tracing::error!(execution_id, error = %cause, "Execution could not start");
        if let Err(e) = self
            .queue
            .remove_all_for_execution(execution_id.to_string())
            .await
        {
            tracing::error!(execution_id, error = %e, "Failed to purge queued tasks");
        }
        let Some(context) = self.contexts.remove(execution_id).await else {
            return;
        };
        if let Err(e) = self
            .store
            .update_execution_record(
                execution_id.to_string(),
                ExecutionStatus::Failed,
                Value::Object(Map::new()),
                context.metrics,
                Some(cause.to_string()),
            )
            .await
        {
            tracing::warn!(execution_id, error = %e, "Failed to mark aborted execution");
        }
    }

    /// Whether a state mutation took effect; logs discarded late results
    fn accepted(
        &self,
        transition: Result<Transition>,
        execution_id: &str,
        node_id: &str,
        what: &str,
    ) -> bool {
        match transition {
            Ok(Transition::Applied) => true,
            Ok(Transition::Ignored) => {
                tracing::warn!(execution_id, node_id, what, "Discarding late node {}", what);
                false
            }
            Err(e) => {
                tracing::warn!(execution_id, node_id, error = %e, "Discarding node {} for unknown execution", what);
                false
            }
        }
    }
}
