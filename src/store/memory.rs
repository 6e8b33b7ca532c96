/// In-memory Execution Store for tests and embedding

use super::{ExecutionRecord, ExecutionStore, NodeExecutionRecord};
use crate::error::{EngineError, Result};
use crate::runtime::context::{ExecutionContext, ExecutionMetrics, ExecutionStatus};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Final fields written by `update_execution_record`
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub output: Value,
    pub metrics: ExecutionMetrics,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
    executions: HashMap<String, ExecutionRecord>,
    outcomes: HashMap<String, ExecutionOutcome>,
    nodes: Vec<NodeExecutionRecord>,
    snapshots: HashMap<String, ExecutionContext>,
    heartbeats: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a store error, simulating an outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.tables.read().await.executions.get(execution_id).cloned()
    }

    pub async fn outcome(&self, execution_id: &str) -> Option<ExecutionOutcome> {
        self.tables.read().await.outcomes.get(execution_id).cloned()
    }

    pub async fn node_records(&self, execution_id: &str) -> Vec<NodeExecutionRecord> {
        self.tables
            .read()
            .await
            .nodes
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Store("execution store unavailable".to_string()));
        }
        Ok(())
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    fn create_execution_record(&self, record: ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_available()?;
            let mut tables = self.tables.write().await;
            tables
                .heartbeats
                .insert(record.execution_id.clone(), record.started_at);
            tables.executions.insert(record.execution_id.clone(), record);
            Ok(())
        })
    }

    fn update_execution_record(
        &self,
        execution_id: String,
        status: ExecutionStatus,
        output: Value,
        metrics: ExecutionMetrics,
        error: Option<String>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_available()?;
            let mut tables = self.tables.write().await;
            let record = tables
                .executions
                .get_mut(&execution_id)
                .ok_or_else(|| EngineError::NotFound(format!("execution {}", execution_id)))?;
            record.status = status;
            tables.outcomes.insert(
                execution_id,
                ExecutionOutcome {
                    status,
                    output,
                    metrics,
                    error,
                },
            );
            Ok(())
        })
    }

    fn create_node_execution_record(&self, record: NodeExecutionRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_available()?;
            self.tables.write().await.nodes.push(record);
            Ok(())
        })
    }

    fn save_snapshot(&self, context: ExecutionContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_available()?;
            self.tables
                .write()
                .await
                .snapshots
                .insert(context.execution_id.clone(), context);
            Ok(())
        })
    }

    fn load_snapshot(&self, execution_id: String) -> BoxFuture<'_, Result<Option<ExecutionContext>>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.tables.read().await.snapshots.get(&execution_id).cloned())
        })
    }

    fn list_unfinished(&self) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>> {
        Box::pin(async move {
            self.check_available()?;
            let tables = self.tables.read().await;
            let mut unfinished: Vec<ExecutionRecord> = tables
                .executions
                .values()
                .filter(|r| !r.status.is_terminal())
                .cloned()
                .collect();
            unfinished.sort_by(|a, b| a.started_at.cmp(&b.started_at));
            Ok(unfinished)
        })
    }

    fn touch_executions(&self, execution_ids: Vec<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_available()?;
            let now = Utc::now();
            let mut tables = self.tables.write().await;
            for id in execution_ids {
                if tables.executions.contains_key(&id) {
                    tables.heartbeats.insert(id, now);
                }
            }
            Ok(())
        })
    }

    fn list_abandoned(&self, idle_since: DateTime<Utc>) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>> {
        Box::pin(async move {
            self.check_available()?;
            let tables = self.tables.read().await;
            let mut abandoned: Vec<ExecutionRecord> = tables
                .executions
                .values()
                .filter(|r| !r.status.is_terminal())
                .filter(|r| {
                    tables
                        .heartbeats
                        .get(&r.execution_id)
                        .map_or(true, |beat| *beat < idle_since)
                })
                .cloned()
                .collect();
            abandoned.sort_by(|a, b| a.started_at.cmp(&b.started_at));
            Ok(abandoned)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::ExecutionMode;
    use chrono::Duration;
    use serde_json::json;

    fn record(id: &str) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: id.into(),
            workflow_id: "wf".into(),
            user_id: "u".into(),
            status: ExecutionStatus::Running,
            mode: ExecutionMode::Sync,
            input_data: json!({}),
            started_at: Utc::now(),
        }
    }

    fn metrics() -> ExecutionMetrics {
        ExecutionMetrics {
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            executed_nodes: 1,
            total_nodes: 1,
            errors: Vec::new(),
            duration_ms: Some(3),
        }
    }

    #[tokio::test]
    async fn update_moves_record_out_of_unfinished() {
        let store = InMemoryExecutionStore::new();
        store.create_execution_record(record("e1")).await.unwrap();
        store.create_execution_record(record("e2")).await.unwrap();
        assert_eq!(store.list_unfinished().await.unwrap().len(), 2);

        store
            .update_execution_record("e1".into(), ExecutionStatus::Completed, json!({}), metrics(), None)
            .await
            .unwrap();

        let unfinished = store.list_unfinished().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].execution_id, "e2");
        assert_eq!(store.outcome("e1").await.unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn touched_executions_are_not_abandoned() {
        let store = InMemoryExecutionStore::new();
        let mut stale = record("stale");
        stale.started_at = Utc::now() - Duration::hours(1);
        let mut revived = record("revived");
        revived.started_at = Utc::now() - Duration::hours(1);
        store.create_execution_record(stale).await.unwrap();
        store.create_execution_record(revived).await.unwrap();
        store.create_execution_record(record("fresh")).await.unwrap();

        store
            .touch_executions(vec!["revived".into(), "ghost".into()])
            .await
            .unwrap();

        let abandoned = store
            .list_abandoned(Utc::now() - Duration::minutes(1))
            .await
            .unwrap();
        let ids: Vec<_> = abandoned.iter().map(|r| r.execution_id.as_str()).collect();
        assert_eq!(ids, vec!["stale"]);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryExecutionStore::new();
        store.set_unavailable(true);
        let err = store.create_execution_record(record("e1")).await.unwrap_err();
        assert!(err.is_infrastructure());
    }
}
