/// Application setup and initialization
///
/// Wires together storage, the workflow registry, the node executors, the
/// task queue and the execution engine.

use crate::{
    config::Config,
    nodes::NodeExecutorRegistry,
    runtime::{self, ExecutionEngine},
    store::{sqlite::connect, SqliteExecutionStore},
    workflow::{WorkflowRegistry, WorkflowStorage},
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Fully wired orchestrator
pub struct App {
    pub engine: Arc<ExecutionEngine>,
    pub registry: Arc<WorkflowRegistry>,
    pub storage: WorkflowStorage,
    pub store: Arc<SqliteExecutionStore>,
}

/// Install the fmt subscriber. Level comes from `DAGFLOW_LOG`, default `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("DAGFLOW_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();
}

/// Open the database, build every component and recover interrupted runs.
///
/// Must be called from within a tokio runtime.
pub async fn build(config: Config) -> Result<App> {
    let path = config.database.database_path();
    tracing::info!("📁 Opening database at {}", path.display());
    let pool = connect(&path)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))?;

    tracing::info!("📋 Initializing workflow storage");
    let storage = WorkflowStorage::new(pool.clone());
    storage
        .init_schema()
        .await
        .context("Failed to create workflow tables")?;
    let registry = Arc::new(WorkflowRegistry::new(Some(storage.clone())));

    tracing::info!("🗄️ Initializing execution store");
    let store = Arc::new(SqliteExecutionStore::new(pool));
    store
        .init_schema()
        .await
        .context("Failed to create execution tables")?;

    tracing::info!("⚙️ Registering node executors");
    let nodes = Arc::new(NodeExecutorRegistry::with_builtins(&config.nodes));
    tracing::debug!(types = ?nodes.node_types(), "Node types available");

    tracing::info!("🚀 Initializing execution engine");
    let engine = runtime::launch(Arc::clone(&registry), nodes, store.clone(), &config);

    let recovered = engine
        .recover_interrupted()
        .await
        .context("Failed to recover interrupted executions")?;
    if recovered > 0 {
        tracing::warn!(recovered, "Interrupted executions marked as failed");
    }

    tracing::info!("✅ Application initialized successfully");
    Ok(App {
        engine,
        registry,
        storage,
        store,
    })
}
