//! Append-only task attempt log.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::errors::Result;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Abandoned,
    Unknown,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub id: i64,
    pub task_id: String,
    pub run_id: Option<String>,
    pub worker_id: Option<String>,
    pub outcome: AttemptOutcome,
    pub summary: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewAttempt {
    pub task_id: String,
    pub run_id: Option<String>,
    pub worker_id: Option<String>,
    pub outcome: Option<AttemptOutcome>,
    pub summary: Option<String>,
}

#[derive(Clone)]
pub struct AttemptStore {
    pool: SqlitePool,
}

impl AttemptStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, attempt: NewAttempt) -> Result<Attempt> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO attempts (task_id, run_id, worker_id, outcome, summary, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attempt.task_id)
        .bind(&attempt.run_id)
        .bind(&attempt.worker_id)
        .bind(attempt.outcome.unwrap_or(AttemptOutcome::Unknown))
        .bind(&attempt.summary)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(sqlx::query_as("SELECT * FROM attempts WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Attempt>> {
        Ok(sqlx::query_as("SELECT * FROM attempts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn for_task(&self, task_id: &str) -> Result<Vec<Attempt>> {
        Ok(
            sqlx::query_as("SELECT * FROM attempts WHERE task_id = ? ORDER BY created_at ASC, id ASC")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn all(&self) -> Result<Vec<Attempt>> {
        Ok(
            sqlx::query_as("SELECT * FROM attempts ORDER BY created_at ASC, id ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Insert-or-replace by id, preserving the caller's timestamps. Used by
    /// the sync importer. Skips silently when the task is gone.
    pub async fn upsert(&self, attempt: &Attempt) -> Result<bool> {
        let task_exists: (i64,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?)")
            .bind(&attempt.task_id)
            .fetch_one(&self.pool)
            .await?;
        if task_exists.0 == 0 {
            return Ok(false);
        }
        sqlx::query(
            "INSERT INTO attempts (id, task_id, run_id, worker_id, outcome, summary, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 task_id = excluded.task_id,
                 run_id = excluded.run_id,
                 worker_id = excluded.worker_id,
                 outcome = excluded.outcome,
                 summary = excluded.summary,
                 updated_at = excluded.updated_at",
        )
        .bind(attempt.id)
        .bind(&attempt.task_id)
        .bind(&attempt.run_id)
        .bind(&attempt.worker_id)
        .bind(attempt.outcome)
        .bind(&attempt.summary)
        .bind(&attempt.created_at)
        .bind(&attempt.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM attempts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
