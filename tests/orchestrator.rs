use dagflow::config::Config;
use dagflow::error::{EngineError, Result};
use dagflow::nodes::{NodeContext, NodeExecutorRegistry, NodeHandler, NodeOutcome};
use dagflow::runtime::{
    self, ExecuteRequest, ExecutionEngine, ExecutionEvent, ExecutionMode, ExecutionResponse,
    ExecutionResult, ExecutionStatus, NodeStatus,
};
use dagflow::store::{ExecutionStore, InMemoryExecutionStore};
use dagflow::workflow::{Connection, ErrorHandling, Node, Workflow, WorkflowRegistry};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct StubHttp;

impl NodeHandler for StubHttp {
    fn node_type(&self) -> &str {
        "http-request"
    }

    fn execute(&self, input: Value, _ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move { Ok(NodeOutcome::ok(json!({ "statusCode": 200, "body": input }))) })
    }
}

/// Fails its first `failures` calls, then succeeds
struct Flaky {
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl NodeHandler for Flaky {
    fn node_type(&self) -> &str {
        "flaky"
    }

    fn execute(&self, input: Value, _ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(EngineError::node("flaky", format!("call {} failed", call)));
            }
            Ok(NodeOutcome::ok(input))
        })
    }
}

struct Broken;

impl NodeHandler for Broken {
    fn node_type(&self) -> &str {
        "broken"
    }

    fn execute(&self, _input: Value, _ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move { Err(EngineError::node("broken", "boom")) })
    }
}

struct Harness {
    engine: Arc<ExecutionEngine>,
    store: Arc<InMemoryExecutionStore>,
    flaky_calls: Arc<AtomicU32>,
}

async fn harness(workflows: Vec<Workflow>) -> Harness {
    let mut config = Config::default();
    config.engine.default_attempts = 3;
    config.engine.backoff_base_ms = 5;
    config.engine.node_timeout_ms = 2000;
    config.engine.execution_timeout_ms = None;
    config.engine.sync_timeout_ms = 5000;
    config.engine.watchdog_interval_ms = 10;
    config.queue.concurrency = 8;

    let flaky_calls = Arc::new(AtomicU32::new(0));
    let mut nodes = NodeExecutorRegistry::with_builtins(&config.nodes);
    nodes.register(StubHttp);
    nodes.register(Broken);
    nodes.register(Flaky {
        failures: 2,
        calls: Arc::clone(&flaky_calls),
    });

    let registry = Arc::new(WorkflowRegistry::in_memory());
    for workflow in workflows {
        registry.upsert_workflow(workflow).await.unwrap();
    }
    let store = Arc::new(InMemoryExecutionStore::new());
    let engine = runtime::launch(registry, Arc::new(nodes), store.clone(), &config);

    Harness {
        engine,
        store,
        flaky_calls,
    }
}

fn delay(id: &str, ms: u64) -> Node {
    Node::new(id, "delay").with_configuration(json!({ "duration": ms }))
}

fn request(workflow_id: &str, mode: ExecutionMode) -> ExecuteRequest {
    ExecuteRequest {
        workflow_id: workflow_id.into(),
        user_id: "user-1".into(),
        input_data: json!({ "x": 1 }),
        mode,
    }
}

async fn run_sync(harness: &Harness, workflow_id: &str) -> ExecutionResult {
    match harness
        .engine
        .execute_workflow(request(workflow_id, ExecutionMode::Sync))
        .await
        .unwrap()
    {
        ExecutionResponse::Finished(result) => result,
        other => panic!("expected a finished execution, got {:?}", other),
    }
}

async fn run_async(harness: &Harness, workflow_id: &str) -> String {
    harness
        .engine
        .execute_workflow(request(workflow_id, ExecutionMode::Async))
        .await
        .unwrap()
        .execution_id()
        .to_string()
}

#[tokio::test]
async fn trigger_http_delay_runs_to_completion() {
    let workflow = Workflow::new(
        "wf-chain",
        vec![Node::new("T", "trigger"), Node::new("H", "http-request"), delay("D", 5)],
        vec![Connection::new("c1", "T", "H"), Connection::new("c2", "H", "D")],
    );
    let harness = harness(vec![workflow]).await;

    let result = run_sync(&harness, "wf-chain").await;

    assert!(result.success);
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(result.duration_ms > 0);
    assert_eq!(result.node_results.len(), 3);
    assert_eq!(result.node_results["H"]["body"]["main"], result.node_results["T"]);
    assert_eq!(result.node_results["D"]["delayed"], json!(true));
    assert_eq!(result.metrics.executed_nodes, 3);
    assert!(result.skipped_nodes.is_empty());
    assert!(harness.engine.list_active_executions().await.is_empty());

    let outcome = harness.store.outcome(&result.execution_id).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(harness.store.node_records(&result.execution_id).await.len(), 3);
}

#[tokio::test]
async fn stop_on_error_fails_the_execution() {
    let workflow = Workflow::new(
        "wf-stop",
        vec![
            Node::new("T", "trigger"),
            Node::new("F", "broken"),
            delay("D", 0),
            delay("S", 300),
        ],
        vec![
            Connection::new("c1", "T", "F"),
            Connection::new("c2", "F", "D"),
            Connection::new("c3", "T", "S"),
        ],
    );
    let harness = harness(vec![workflow]).await;

    let result = run_sync(&harness, "wf-stop").await;

    assert!(!result.success);
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.error.as_deref().unwrap().starts_with("node F failed"));
    assert!(!result.node_results.contains_key("F"));
    assert!(!result.node_results.contains_key("S"));

    let records = harness.store.node_records(&result.execution_id).await;
    assert!(records.iter().all(|r| r.node_id != "D" && r.node_id != "S"));
    let failed = records.iter().find(|r| r.node_id == "F").unwrap();
    assert_eq!(failed.status, NodeStatus::Failed);
    assert_eq!(failed.retry_count, 2);
}

#[tokio::test]
async fn continue_on_error_finishes_independent_branches() {
    let workflow = Workflow::new(
        "wf-continue",
        vec![
            Node::new("T", "trigger"),
            Node::new("F", "broken"),
            delay("D", 0),
            delay("C", 20),
        ],
        vec![
            Connection::new("c1", "T", "F"),
            Connection::new("c2", "F", "D"),
            Connection::new("c3", "T", "C"),
        ],
    )
    .with_error_handling(ErrorHandling::ContinueOnError);
    let harness = harness(vec![workflow]).await;

    let result = run_sync(&harness, "wf-continue").await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.node_results.contains_key("T"));
    assert!(result.node_results.contains_key("C"));
    assert_eq!(result.skipped_nodes, vec!["D".to_string()]);
}

#[tokio::test]
async fn cancelled_execution_dispatches_nothing_more() {
    let workflow = Workflow::new(
        "wf-cancel",
        vec![Node::new("T", "trigger"), delay("D", 400), delay("E", 0)],
        vec![Connection::new("c1", "T", "D"), Connection::new("c2", "D", "E")],
    );
    let harness = harness(vec![workflow]).await;

    let id = run_async(&harness, "wf-cancel").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = harness.engine.cancel_execution(&id).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = harness.engine.get_execution_status(&id).await.unwrap().unwrap();
    assert_eq!(status.status, ExecutionStatus::Cancelled);
    assert_eq!(status.node_status("E"), Some(NodeStatus::Waiting));
    assert!(harness
        .store
        .node_records(&id)
        .await
        .iter()
        .all(|r| r.node_id == "T"));

    let again = harness.engine.cancel_execution(&id).await;
    assert!(matches!(again, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn status_after_termination_is_stable() {
    let workflow = Workflow::new("wf-once", vec![Node::new("T", "trigger")], vec![]);
    let harness = harness(vec![workflow]).await;

    let result = run_sync(&harness, "wf-once").await;
    let first = harness
        .engine
        .get_execution_status(&result.execution_id)
        .await
        .unwrap()
        .unwrap();
    let second = harness
        .engine
        .get_execution_status(&result.execution_id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(first.status, second.status);
    assert_eq!(first.metrics, second.metrics);
    assert_eq!(first.metrics, result.metrics);
}

#[tokio::test]
async fn independent_entry_branches_run_concurrently() {
    let workflow = Workflow::new(
        "wf-parallel",
        vec![delay("A", 150), delay("B", 150), delay("C", 150), delay("D", 150)],
        vec![Connection::new("c1", "A", "B"), Connection::new("c2", "C", "D")],
    );
    let harness = harness(vec![workflow]).await;

    let result = run_sync(&harness, "wf-parallel").await;

    assert!(result.success);
    assert!(result.duration_ms >= 300);
    assert!(result.duration_ms < 550, "took {}ms", result.duration_ms);
}

#[tokio::test]
async fn unavailable_store_leaves_no_live_execution() {
    let workflow = Workflow::new("wf-store", vec![Node::new("T", "trigger")], vec![]);
    let harness = harness(vec![workflow]).await;
    harness.store.set_unavailable(true);

    let err = harness
        .engine
        .execute_workflow(request("wf-store", ExecutionMode::Sync))
        .await
        .unwrap_err();

    assert!(err.is_infrastructure());
    assert!(harness.engine.list_active_executions().await.is_empty());
}

#[tokio::test]
async fn cycle_is_rejected_before_dispatch() {
    let workflow = Workflow::new(
        "wf-cycle",
        vec![Node::new("T", "trigger"), Node::new("A", "delay"), Node::new("B", "delay")],
        vec![
            Connection::new("c1", "T", "A"),
            Connection::new("c2", "A", "B"),
            Connection::new("c3", "B", "A"),
        ],
    );
    let harness = harness(vec![workflow]).await;

    let err = harness
        .engine
        .execute_workflow(request("wf-cycle", ExecutionMode::Async))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::CyclicGraph { .. }));
    assert!(harness.engine.list_active_executions().await.is_empty());
    assert!(harness.store.list_unfinished().await.unwrap().is_empty());
}

#[tokio::test]
async fn whole_execution_timeout_fails_the_run() {
    let mut workflow = Workflow::new(
        "wf-slow",
        vec![Node::new("T", "trigger"), delay("D", 1000)],
        vec![Connection::new("c1", "T", "D")],
    );
    workflow.settings.execution_timeout_ms = Some(50);
    let harness = harness(vec![workflow]).await;

    let result = run_sync(&harness, "wf-slow").await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.error.unwrap().contains("Timed out"));
    assert!(result.duration_ms < 1000);
}

#[tokio::test]
async fn retried_node_reports_its_retry_count() {
    let workflow = Workflow::new(
        "wf-flaky",
        vec![Node::new("T", "trigger"), Node::new("F", "flaky")],
        vec![Connection::new("c1", "T", "F")],
    );
    let harness = harness(vec![workflow]).await;
    let mut events = harness.engine.subscribe();

    let result = run_sync(&harness, "wf-flaky").await;

    assert!(result.success);
    assert_eq!(harness.flaky_calls.load(Ordering::SeqCst), 3);
    let records = harness.store.node_records(&result.execution_id).await;
    let flaky = records.iter().find(|r| r.node_id == "F").unwrap();
    assert_eq!(flaky.retry_count, 2);
    assert_eq!(result.metrics.errors.len(), 2);

    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ExecutionEvent::NodeRetrying { .. }) {
            retries += 1;
        }
    }
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn second_engine_on_a_shared_store_leaves_live_runs_alone() {
    let workflow = Workflow::new(
        "wf-shared",
        vec![Node::new("T", "trigger"), delay("D", 300)],
        vec![Connection::new("c1", "T", "D")],
    );
    let harness = harness(vec![workflow]).await;
    let mut events = harness.engine.subscribe();
    let id = run_async(&harness, "wf-shared").await;

    let peer = runtime::launch(
        Arc::new(WorkflowRegistry::in_memory()),
        Arc::new(NodeExecutorRegistry::with_builtins(&Config::default().nodes)),
        harness.store.clone(),
        &Config::default(),
    );
    assert_eq!(peer.recover_interrupted().await.unwrap(), 0);

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.unwrap() {
                ExecutionEvent::ExecutionFinished { execution_id, .. } if execution_id == id => break,
                _ => continue,
            }
        }
    })
    .await;
    assert!(finished.is_ok());

    let outcome = harness.store.outcome(&id).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
}
