/// SQLite persistence for workflow definitions
///
/// Definitions are stored whole as JSON, with the owner and name pulled out
/// into columns for listing.

use crate::error::Result;
use crate::workflow::types::Workflow;
use sqlx::{sqlite::SqlitePool, Row};

/// SQLite-backed workflow definition storage
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    pool: SqlitePool,
}

/// Summary row returned by `list_workflows`
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub node_count: i64,
    pub updated_at: String,
}

impl WorkflowStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `workflows` table if it does not exist yet
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                node_count INTEGER NOT NULL,
                definition JSON NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflows_owner ON workflows(owner_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Insert or replace a definition
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let definition = serde_json::to_string(workflow)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, owner_id, node_count, definition, updated_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                owner_id = excluded.owner_id,
                node_count = excluded.node_count,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&workflow.owner_id)
        .bind(workflow.nodes.len() as i64)
        .bind(&definition)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition)?))
            }
            None => Ok(None),
        }
    }

    /// Most recently updated first
    pub async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        let rows = sqlx::query(
            "SELECT id, name, owner_id, node_count, CAST(updated_at AS TEXT) AS updated_at \
             FROM workflows ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| WorkflowSummary {
                id: row.get("id"),
                name: row.get("name"),
                owner_id: row.get("owner_id"),
                node_count: row.get("node_count"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    /// Returns whether a row was deleted
    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::connect;
    use crate::workflow::types::{Connection, Node};

    #[tokio::test]
    async fn save_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let pool = connect(dir.path().join("wf.db")).await.unwrap();
        let storage = WorkflowStorage::new(pool);
        storage.init_schema().await.unwrap();

        let workflow = Workflow::new(
            "wf-1",
            vec![Node::new("A", "trigger"), Node::new("B", "delay")],
            vec![Connection::new("c1", "A", "B")],
        );
        storage.save_workflow(&workflow).await.unwrap();

        let loaded = storage.get_workflow("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded, workflow);

        let listed = storage.list_workflows().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].node_count, 2);

        assert!(storage.delete_workflow("wf-1").await.unwrap());
        assert!(!storage.delete_workflow("wf-1").await.unwrap());
        assert!(storage.get_workflow("wf-1").await.unwrap().is_none());
    }
}
