//! Ready-set computation: which tasks can a worker start right now.

use sqlx::SqlitePool;

use crate::errors::{Result, TxError};
use crate::tasks::model::{Task, TaskStatus};
use crate::tasks::storage::TaskStore;

/// Default policy: only `ready` tasks are work-capable. Hosts may widen the
/// set through `EngineConfig::ready_statuses`.
pub const DEFAULT_READY_STATUSES: &[TaskStatus] = &[TaskStatus::Ready];

#[derive(Clone)]
pub struct ReadyService {
    pool: SqlitePool,
    store: TaskStore,
    ready_statuses: Vec<TaskStatus>,
}

impl ReadyService {
    pub fn new(pool: SqlitePool, ready_statuses: Vec<TaskStatus>) -> Self {
        let store = TaskStore::new(pool.clone());
        Self {
            pool,
            store,
            ready_statuses,
        }
    }

    pub fn ready_statuses(&self) -> &[TaskStatus] {
        &self.ready_statuses
    }

    /// Tasks whose status permits execution and whose blockers are all done,
    /// highest score first, oldest first within a score.
    pub async fn get_ready(&self, limit: i64) -> Result<Vec<Task>> {
        let placeholders = vec!["?"; self.ready_statuses.len()].join(",");
        let sql = format!(
            "SELECT t.* FROM tasks t
             WHERE t.status IN ({placeholders})
               AND NOT EXISTS (
                   SELECT 1 FROM task_dependencies d
                   JOIN tasks b ON b.id = d.blocker_id
                   WHERE d.blocked_id = t.id AND b.status != 'done'
               )
             ORDER BY t.score DESC, t.created_at ASC, t.id ASC
             LIMIT ?"
        );
        let mut query = sqlx::query_as::<_, Task>(&sql);
        for status in &self.ready_statuses {
            query = query.bind(*status);
        }
        Ok(query.bind(limit.max(0)).fetch_all(&self.pool).await?)
    }

    /// Single-row readiness check.
    pub async fn is_ready(&self, id: &str) -> Result<bool> {
        let task = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| TxError::TaskNotFound { id: id.to_string() })?;
        if !self.ready_statuses.contains(&task.status) {
            return Ok(false);
        }
        let blockers = self.store.blockers_of(id).await?;
        Ok(blockers.iter().all(|b| b.status == TaskStatus::Done))
    }

    /// Tasks whose only remaining (non-done) blocker is `id` — the work
    /// that completing `id` would unblock.
    pub async fn get_blocking(&self, id: &str) -> Result<Vec<Task>> {
        if self.store.get(id).await?.is_none() {
            return Err(TxError::TaskNotFound { id: id.to_string() });
        }
        Ok(sqlx::query_as(
            "SELECT t.* FROM tasks t
             JOIN task_dependencies d ON d.blocked_id = t.id
             WHERE d.blocker_id = ?
               AND NOT EXISTS (
                   SELECT 1 FROM task_dependencies d2
                   JOIN tasks b ON b.id = d2.blocker_id
                   WHERE d2.blocked_id = t.id
                     AND d2.blocker_id != ?
                     AND b.status != 'done'
               )
             ORDER BY t.score DESC, t.created_at ASC, t.id ASC",
        )
        .bind(id)
        .bind(id)
        .fetch_all(&self.pool)
        .await?)
    }
}
