//! Worker registry: which executors exist, what they are doing, and which
//! of them have gone quiet.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::{Result, TxError};
use crate::jsontext;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Stopping,
    Dead,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub pid: Option<i64>,
    pub status: WorkerStatus,
    pub registered_at: String,
    pub last_heartbeat_at: String,
    pub current_task_id: Option<String>,
    #[serde(with = "jsontext::json_array")]
    pub capabilities: String,
    #[serde(with = "jsontext::json_object")]
    pub metadata: String,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterWorker {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub pid: Option<i64>,
    pub capabilities: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct WorkerRegistry {
    pool: SqlitePool,
}

impl WorkerRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a worker, or refresh it if the id is already known: a
    /// re-registering worker comes back `idle` with a fresh heartbeat.
    pub async fn register(&self, input: RegisterWorker) -> Result<Worker> {
        if input.id.trim().is_empty() {
            return Err(TxError::validation("id", "must not be empty"));
        }
        let now = Utc::now().to_rfc3339();
        let capabilities =
            serde_json::to_string(&input.capabilities).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            "INSERT INTO workers
             (id, name, hostname, pid, status, registered_at, last_heartbeat_at, capabilities, metadata)
             VALUES (?, ?, ?, ?, 'starting', ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 hostname = excluded.hostname,
                 pid = excluded.pid,
                 status = 'idle',
                 last_heartbeat_at = excluded.last_heartbeat_at,
                 capabilities = excluded.capabilities,
                 metadata = excluded.metadata",
        )
        .bind(&input.id)
        .bind(&input.name)
        .bind(&input.hostname)
        .bind(input.pid)
        .bind(&now)
        .bind(&now)
        .bind(&capabilities)
        .bind(input.metadata.map(|v| v.to_string()).unwrap_or_else(|| "{}".into()))
        .execute(&self.pool)
        .await?;

        self.get(&input.id).await
    }

    pub async fn get(&self, id: &str) -> Result<Worker> {
        sqlx::query_as("SELECT * FROM workers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TxError::WorkerNotFound { id: id.to_string() })
    }

    pub async fn list(&self, include_dead: bool) -> Result<Vec<Worker>> {
        let rows: Vec<Worker> = sqlx::query_as(
            "SELECT * FROM workers ORDER BY last_heartbeat_at DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(if include_dead {
            rows
        } else {
            rows.into_iter()
                .filter(|w| w.status != WorkerStatus::Dead)
                .collect()
        })
    }

    pub async fn heartbeat(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE workers SET last_heartbeat_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TxError::WorkerNotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub async fn set_status(&self, id: &str, status: WorkerStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE workers SET status = ?, last_heartbeat_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TxError::WorkerNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Point the worker at a task (busy) or clear it (idle).
    pub async fn set_current_task(&self, id: &str, task_id: Option<&str>) -> Result<()> {
        let status = if task_id.is_some() {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        };
        let result = sqlx::query(
            "UPDATE workers SET current_task_id = ?, status = ?, last_heartbeat_at = ? WHERE id = ?",
        )
        .bind(task_id)
        .bind(status)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TxError::WorkerNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Mark workers dead when their heartbeat is older than `timeout_secs`.
    /// Returns the ids swept.
    pub async fn sweep_stale(&self, timeout_secs: i64) -> Result<Vec<String>> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(timeout_secs)).to_rfc3339();
        let stale: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM workers
             WHERE status NOT IN ('dead', 'stopping') AND last_heartbeat_at < ?",
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<String> = stale.into_iter().map(|(id,)| id).collect();
        for id in &ids {
            sqlx::query(
                "UPDATE workers SET status = 'dead', current_task_id = NULL WHERE id = ?",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            info!(worker_id = %id, "worker marked dead after missed heartbeats");
        }
        Ok(ids)
    }
}
