/// SQLite Execution Store using sqlx
///
/// Two tables: `workflow_executions` (one row per execution, final output,
/// metrics and the latest context snapshot as JSON) and `node_executions`
/// (one row per permanent node transition).

use super::{ExecutionRecord, ExecutionStore, NodeExecutionRecord};
use crate::error::{EngineError, Result};
use crate::runtime::context::{ExecutionContext, ExecutionMetrics, ExecutionMode, ExecutionStatus};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;

/// Open (creating if missing) the SQLite database at `path`
pub async fn connect(path: impl AsRef<Path>) -> Result<SqlitePool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            EngineError::Store(format!(
                "failed to create database directory '{}': {}",
                parent.display(),
                e
            ))
        })?;
    }

    tracing::info!("🗄️ Opening database: {}", path.display());

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    Ok(SqlitePool::connect_with(options).await?)
}

#[derive(Debug, Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                input_data JSON NOT NULL,
                output JSON,
                metrics JSON,
                error TEXT,
                snapshot JSON,
                started_at TEXT NOT NULL,
                heartbeat_ms INTEGER NOT NULL DEFAULT 0,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS node_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                status TEXT NOT NULL,
                input JSON,
                output JSON,
                error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                started_at TEXT,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_status ON workflow_executions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_node_executions_execution ON node_executions(execution_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Node rows of an execution, oldest first
    pub async fn node_records(&self, execution_id: &str) -> Result<Vec<NodeExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT execution_id, node_id, node_type, status, input, output, error, retry_count, \
             started_at, completed_at FROM node_executions WHERE execution_id = ? ORDER BY id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(NodeExecutionRecord {
                    execution_id: row.get("execution_id"),
                    node_id: row.get("node_id"),
                    node_type: row.get("node_type"),
                    status: serde_json::from_value(Value::String(status))?,
                    input: parse_json(row.get("input"))?,
                    output: parse_json(row.get("output"))?,
                    error: row.get("error"),
                    retry_count: u32::try_from(row.get::<i64, _>("retry_count").max(0))
                        .unwrap_or(u32::MAX),
                    started_at: parse_time(row.get("started_at")),
                    completed_at: parse_time(row.get("completed_at")),
                })
            })
            .collect()
    }
}

fn to_json_text(value: &Option<Value>) -> Result<Option<String>> {
    value.as_ref().map(serde_json::to_string).transpose().map_err(Into::into)
}

fn parse_json(text: Option<String>) -> Result<Option<Value>> {
    text.map(|t| serde_json::from_str(&t)).transpose().map_err(Into::into)
}

fn parse_time(text: Option<String>) -> Option<DateTime<Utc>> {
    text.and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn execution_from_row(row: &SqliteRow) -> Result<ExecutionRecord> {
    let status: String = row.get("status");
    let mode: String = row.get("mode");
    let input_data: String = row.get("input_data");
    Ok(ExecutionRecord {
        execution_id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        user_id: row.get("user_id"),
        status: ExecutionStatus::parse(&status).unwrap_or(ExecutionStatus::Running),
        mode: if mode == "async" {
            ExecutionMode::Async
        } else {
            ExecutionMode::Sync
        },
        input_data: serde_json::from_str(&input_data)?,
        started_at: parse_time(row.get("started_at")).unwrap_or_else(Utc::now),
    })
}

fn mode_str(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Sync => "sync",
        ExecutionMode::Async => "async",
    }
}

impl ExecutionStore for SqliteExecutionStore {
    fn create_execution_record(&self, record: ExecutionRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO workflow_executions
                    (id, workflow_id, user_id, status, mode, input_data, started_at,
                     heartbeat_ms, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
                "#,
            )
            .bind(&record.execution_id)
            .bind(&record.workflow_id)
            .bind(&record.user_id)
            .bind(record.status.as_str())
            .bind(mode_str(record.mode))
            .bind(serde_json::to_string(&record.input_data)?)
            .bind(record.started_at.to_rfc3339())
            .bind(record.started_at.timestamp_millis())
            .execute(&self.pool)
            .await?;
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
            let result = sqlx::query(
                r#"
                UPDATE workflow_executions
                SET status = ?, output = ?, metrics = ?, error = ?, updated_at = CURRENT_TIMESTAMP
                WHERE id = ?
                "#,
            )
            .bind(status.as_str())
            .bind(serde_json::to_string(&output)?)
            .bind(serde_json::to_string(&metrics)?)
            .bind(error)
            .bind(&execution_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(EngineError::NotFound(format!("execution {}", execution_id)));
            }
            Ok(())
        })
    }

    fn create_node_execution_record(&self, record: NodeExecutionRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO node_executions
                    (execution_id, node_id, node_type, status, input, output, error,
                     retry_count, started_at, completed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.execution_id)
            .bind(&record.node_id)
            .bind(&record.node_type)
            .bind(record.status.as_str())
            .bind(to_json_text(&record.input)?)
            .bind(to_json_text(&record.output)?)
            .bind(&record.error)
            .bind(record.retry_count as i64)
            .bind(record.started_at.map(|t| t.to_rfc3339()))
            .bind(record.completed_at.map(|t| t.to_rfc3339()))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn save_snapshot(&self, context: ExecutionContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let snapshot = serde_json::to_string(&context)?;
            let result = sqlx::query(
                "UPDATE workflow_executions SET snapshot = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            )
            .bind(snapshot)
            .bind(&context.execution_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(EngineError::NotFound(format!(
                    "execution {}",
                    context.execution_id
                )));
            }
            Ok(())
        })
    }

    fn load_snapshot(&self, execution_id: String) -> BoxFuture<'_, Result<Option<ExecutionContext>>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT snapshot FROM workflow_executions WHERE id = ?")
                .bind(&execution_id)
                .fetch_optional(&self.pool)
                .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let snapshot: Option<String> = row.get("snapshot");
            snapshot
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(Into::into)
        })
    }

    fn list_unfinished(&self) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, workflow_id, user_id, status, mode, input_data, started_at \
                 FROM workflow_executions WHERE status IN ('PENDING', 'RUNNING') ORDER BY started_at",
            )
            .fetch_all(&self.pool)
            .await?;

            rows.iter().map(execution_from_row).collect()
        })
    }

    fn touch_executions(&self, execution_ids: Vec<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let now = Utc::now().timestamp_millis();
            let mut tx = self.pool.begin().await?;
            for id in &execution_ids {
                sqlx::query("UPDATE workflow_executions SET heartbeat_ms = ? WHERE id = ?")
                    .bind(now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }

    fn list_abandoned(&self, idle_since: DateTime<Utc>) -> BoxFuture<'_, Result<Vec<ExecutionRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, workflow_id, user_id, status, mode, input_data, started_at \
                 FROM workflow_executions WHERE status IN ('PENDING', 'RUNNING') AND heartbeat_ms < ? \
                 ORDER BY started_at",
            )
            .bind(idle_since.timestamp_millis())
            .fetch_all(&self.pool)
            .await?;

            rows.iter().map(execution_from_row).collect()
        })
    }
}
