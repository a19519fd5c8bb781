//! Per-file learning associations.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::errors::{Result, TxError};

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLearning {
    pub id: i64,
    pub file_path: String,
    pub learning_id: i64,
    pub relevance: f64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct FileLearningStore {
    pool: SqlitePool,
}

impl FileLearningStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Associate a learning with a file. Re-linking an existing pair
    /// refreshes its relevance.
    pub async fn link(
        &self,
        file_path: &str,
        learning_id: i64,
        relevance: Option<f64>,
    ) -> Result<FileLearning> {
        if file_path.trim().is_empty() {
            return Err(TxError::validation("filePath", "must not be empty"));
        }
        let learning_exists: (i64,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM learnings WHERE id = ?)")
                .bind(learning_id)
                .fetch_one(&self.pool)
                .await?;
        if learning_exists.0 == 0 {
            return Err(TxError::LearningNotFound { id: learning_id });
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO file_learnings (file_path, learning_id, relevance, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(file_path, learning_id) DO UPDATE SET
                 relevance = excluded.relevance,
                 updated_at = excluded.updated_at",
        )
        .bind(file_path)
        .bind(learning_id)
        .bind(relevance.unwrap_or(1.0))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(sqlx::query_as(
            "SELECT * FROM file_learnings WHERE file_path = ? AND learning_id = ?",
        )
        .bind(file_path)
        .bind(learning_id)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn for_file(&self, file_path: &str) -> Result<Vec<FileLearning>> {
        Ok(sqlx::query_as(
            "SELECT * FROM file_learnings WHERE file_path = ?
             ORDER BY relevance DESC, id ASC",
        )
        .bind(file_path)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn for_learning(&self, learning_id: i64) -> Result<Vec<FileLearning>> {
        Ok(
            sqlx::query_as("SELECT * FROM file_learnings WHERE learning_id = ? ORDER BY id ASC")
                .bind(learning_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn all(&self) -> Result<Vec<FileLearning>> {
        Ok(
            sqlx::query_as("SELECT * FROM file_learnings ORDER BY created_at ASC, id ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Insert-or-replace by id preserving caller timestamps (sync import).
    /// Skips silently when the learning is gone.
    pub async fn upsert(&self, row: &FileLearning) -> Result<bool> {
        let learning_exists: (i64,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM learnings WHERE id = ?)")
                .bind(row.learning_id)
                .fetch_one(&self.pool)
                .await?;
        if learning_exists.0 == 0 {
            return Ok(false);
        }
        sqlx::query(
            "INSERT INTO file_learnings (id, file_path, learning_id, relevance, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 file_path = excluded.file_path,
                 learning_id = excluded.learning_id,
                 relevance = excluded.relevance,
                 updated_at = excluded.updated_at",
        )
        .bind(row.id)
        .bind(&row.file_path)
        .bind(row.learning_id)
        .bind(row.relevance)
        .bind(&row.created_at)
        .bind(&row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    pub async fn unlink(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM file_learnings WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
