/// SQLite persistence layer for workflow and execution storage
/// 
/// Handles workflow CRUD and finished run records in the main SQLite database.
/// Definitions and plans are stored as JSON next to indexed lookup columns.

use crate::runtime::plan::ExecutionPlan;
use crate::workflow::types::Workflow;
use anyhow::Result;
use serde::Serialize;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;

/// SQLite-based workflow and execution storage manager
/// 
/// Workflows are keyed by id; executions are keyed by run id and indexed by
/// workflow and start time for history queries.
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    /// SQLite connection pool shared with the registry
    pool: SqlitePool,
}

impl WorkflowStorage {
    /// Create new storage instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the storage schema
    /// 
    /// Creates the workflows and executions tables with their indexes.
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflows_name ON workflows(name)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                duration_ms INTEGER,
                started_at TEXT,
                finished_at TEXT,
                plan JSON NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id, started_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Insert or update a workflow definition
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let definition_json = serde_json::to_string(workflow)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, definition, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a workflow definition by id
    pub async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    /// Workflow ids and names, most recently updated first
    pub async fn list_workflows(&self) -> Result<Vec<WorkflowMetadata>> {
        let rows = sqlx::query(
            "SELECT id, name, CAST(created_at AS TEXT) AS created_at, CAST(updated_at AS TEXT) AS updated_at \
             FROM workflows ORDER BY updated_at DESC, id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| WorkflowMetadata {
                id: row.get("id"),
                name: row.get("name"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    /// Every stored workflow keyed by id, for registry loading
    pub async fn load_all_workflows(&self) -> Result<HashMap<String, Workflow>> {
        let rows = sqlx::query("SELECT id, definition FROM workflows")
            .fetch_all(&self.pool)
            .await?;

        let mut workflows = HashMap::new();
        for row in rows {
            let id: String = row.get("id");
            let definition_json: String = row.get("definition");
            workflows.insert(id, serde_json::from_str(&definition_json)?);
        }

        Ok(workflows)
    }

    /// Delete a workflow by id
    /// 
    /// Returns false when no row matched.
    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Persist a run record
    pub async fn save_execution(&self, plan: &ExecutionPlan) -> Result<()> {
        let plan_json = serde_json::to_string(plan)?;

        sqlx::query(
            r#"
            INSERT INTO executions (id, workflow_id, status, mode, duration_ms, started_at, finished_at, plan)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                duration_ms = excluded.duration_ms,
                finished_at = excluded.finished_at,
                plan = excluded.plan
            "#,
        )
        .bind(&plan.id)
        .bind(&plan.workflow_id)
        .bind(plan.status.as_str())
        .bind(plan.mode.as_str())
        .bind(plan.duration_ms.map(|ms| ms as i64))
        .bind(plan.started_at.map(|t| t.to_rfc3339()))
        .bind(plan.finished_at.map(|t| t.to_rfc3339()))
        .bind(&plan_json)
        .execute(&self.pool)
        .await?;

        tracing::debug!("💾 Stored run record {} ({})", plan.id, plan.status.as_str());
        Ok(())
    }

    /// Get a stored run record by run id
    pub async fn get_execution(&self, id: &str) -> Result<Option<ExecutionPlan>> {
        let row = sqlx::query("SELECT plan FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let plan_json: String = row.get("plan");
                Ok(Some(serde_json::from_str(&plan_json)?))
            }
            None => Ok(None),
        }
    }

    /// Run summaries, newest first, optionally for one workflow
    pub async fn list_executions(&self, workflow_id: Option<&str>, limit: u32) -> Result<Vec<ExecutionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, status, mode, duration_ms, started_at, finished_at
            FROM executions
            WHERE (?1 IS NULL OR workflow_id = ?1)
            ORDER BY started_at DESC
            LIMIT ?2
            "#,
        )
        .bind(workflow_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ExecutionSummary {
                id: row.get("id"),
                workflow_id: row.get("workflow_id"),
                status: row.get("status"),
                mode: row.get("mode"),
                duration_ms: row.get::<Option<i64>, _>("duration_ms").map(|ms| ms.max(0) as u64),
                started_at: row.get("started_at"),
                finished_at: row.get("finished_at"),
            })
            .collect())
    }
}

/// Basic workflow metadata for listing operations
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Stored run without its full plan
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub id: String,
    pub workflow_id: String,
    pub status: String,
    pub mode: String,
    pub duration_ms: Option<u64>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}
