//! Run lifecycle: start, complete, fail, cancel.
//!
//! Every transition writes its event in the same transaction as the run
//! row, so a rollback leaves neither.

use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::debug;

use crate::errors::{Result, TxError};
use crate::events::{EventStore, EventType, NewEvent};
use crate::ids;
use crate::runs::model::{Run, RunConfig, RunDetail, RunFilter, RunStatus};

#[derive(Clone)]
pub struct RunService {
    pool: SqlitePool,
}

impl RunService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a run in `running` and append `run_started` atomically.
    pub async fn start(&self, config: RunConfig) -> Result<Run> {
        if config.agent.trim().is_empty() {
            return Err(TxError::validation("agent", "must not be empty"));
        }

        let mut metadata = config
            .metadata
            .unwrap_or_else(|| Value::Object(Default::default()));
        if !metadata.is_object() {
            return Err(TxError::validation("metadata", "must be a JSON object"));
        }
        if let Some(capture) = config.log_capture {
            metadata["logCapture"] = serde_json::to_value(capture)?;
        }

        let id = ids::new_run_id();
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        if let Some(ref task_id) = config.task_id {
            let exists: (i64,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?)")
                .bind(task_id)
                .fetch_one(&mut *tx)
                .await?;
            if exists.0 == 0 {
                return Err(TxError::TaskNotFound {
                    id: task_id.clone(),
                });
            }
        }

        sqlx::query(
            "INSERT INTO runs
             (id, task_id, agent, started_at, status, pid,
              transcript_path, stdout_path, stderr_path, context_path, metadata)
             VALUES (?, ?, ?, ?, 'running', ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&config.task_id)
        .bind(&config.agent)
        .bind(&now)
        .bind(config.pid)
        .bind(&config.transcript_path)
        .bind(&config.stdout_path)
        .bind(&config.stderr_path)
        .bind(&config.context_path)
        .bind(metadata.to_string())
        .execute(&mut *tx)
        .await?;

        let mut event = NewEvent::of(EventType::RunStarted)
            .run(&id)
            .agent(&config.agent);
        if let Some(ref task_id) = config.task_id {
            event = event.task(task_id);
        }
        EventStore::append_tx(&mut tx, event).await?;
        tx.commit().await?;

        debug!(run_id = %id, agent = %config.agent, "run started");
        self.get(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<Run> {
        sqlx::query_as("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TxError::RunNotFound { id: id.to_string() })
    }

    /// The run-detail view: row plus decoded log-capture block, read-only.
    pub async fn detail(&self, id: &str) -> Result<RunDetail> {
        let run = self.get(id).await?;
        let log_capture = run.log_capture();
        Ok(RunDetail { run, log_capture })
    }

    pub async fn list(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let limit = filter.limit.unwrap_or(100).min(500);
        let mut rows: Vec<Run> =
            sqlx::query_as("SELECT * FROM runs ORDER BY started_at DESC, id DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        if let Some(status) = filter.status {
            rows.retain(|r| r.status == status);
        }
        if let Some(ref task_id) = filter.task_id {
            rows.retain(|r| r.task_id.as_deref() == Some(task_id.as_str()));
        }
        Ok(rows)
    }

    pub async fn complete(&self, id: &str, summary: Option<&str>) -> Result<Run> {
        self.finish(
            id,
            RunStatus::Completed,
            Some(0),
            summary,
            None,
            EventType::RunCompleted,
        )
        .await
    }

    pub async fn fail(&self, id: &str, error: &str) -> Result<Run> {
        self.finish(
            id,
            RunStatus::Failed,
            Some(1),
            None,
            Some(error),
            EventType::RunFailed,
        )
        .await
    }

    pub async fn cancel(&self, id: &str) -> Result<Run> {
        self.finish(
            id,
            RunStatus::Cancelled,
            None,
            None,
            None,
            EventType::RunCancelled,
        )
        .await
    }

    /// Mark a running run timed out.
    pub async fn timeout(&self, id: &str) -> Result<Run> {
        self.finish(
            id,
            RunStatus::Timeout,
            Some(124),
            None,
            Some("run exceeded its time budget"),
            EventType::RunFailed,
        )
        .await
    }

    async fn finish(
        &self,
        id: &str,
        status: RunStatus,
        exit_code: Option<i64>,
        summary: Option<&str>,
        error: Option<&str>,
        event_type: EventType,
    ) -> Result<Run> {
        let run = self.get(id).await?;
        if run.status != RunStatus::Running {
            return Err(TxError::InvalidTransition {
                from: run.status.to_string(),
                to: status.to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE runs
             SET status = ?, ended_at = ?, exit_code = ?, summary = COALESCE(?, summary),
                 error = COALESCE(?, error)
             WHERE id = ? AND status = 'running'",
        )
        .bind(status)
        .bind(&now)
        .bind(exit_code)
        .bind(summary)
        .bind(error)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TxError::InvalidTransition {
                from: "unknown".to_string(),
                to: status.to_string(),
            });
        }

        let mut event = NewEvent::of(event_type)
            .run(id)
            .agent(&run.agent)
            .content(summary.or(error).unwrap_or(""));
        if let Some(ref task_id) = run.task_id {
            event = event.task(task_id);
        }
        EventStore::append_tx(&mut tx, event).await?;
        tx.commit().await?;

        debug!(run_id = %id, status = %status, "run finished");
        self.get(id).await
    }

    /// Fail every `running` run left behind by a previous process.
    /// Returns the number recovered. Intended for startup recovery only.
    pub async fn recover_orphaned(&self) -> Result<u64> {
        let orphans: Vec<Run> = sqlx::query_as("SELECT * FROM runs WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await?;
        let mut recovered = 0u64;
        for run in orphans {
            self.fail(&run.id, "run lost: engine restarted while it was running")
                .await?;
            recovered += 1;
        }
        Ok(recovered)
    }
}
