//! Typed mapper over the `tasks` and `task_dependencies` tables.
//!
//! The store is deliberately thin: validation and transition rules live in
//! the services. Everything here is a direct SQL round trip.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::errors::Result;
use crate::tasks::model::{Task, TaskFilter, TaskStatus, TaskWithDeps};

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub blocker_id: String,
    pub blocked_id: String,
    pub created_at: String,
}

/// A task row keyed by the id it was joined against, for batch assembly.
#[derive(Debug, sqlx::FromRow)]
struct KeyedTask {
    key: String,
    #[sqlx(flatten)]
    task: Task,
}

#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ─── Tasks ────────────────────────────────────────────────────────────────

    pub async fn insert(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks
             (id, title, description, status, parent_id, score, metadata,
              assignee_type, assignee_id, assigned_at, assigned_by,
              created_at, updated_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status)
        .bind(&task.parent_id)
        .bind(task.score)
        .bind(&task.metadata)
        .bind(task.assignee_type)
        .bind(&task.assignee_id)
        .bind(&task.assigned_at)
        .bind(&task.assigned_by)
        .bind(&task.created_at)
        .bind(&task.updated_at)
        .bind(&task.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn all(&self) -> Result<Vec<Task>> {
        Ok(sqlx::query_as("SELECT * FROM tasks ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let limit = filter.limit.unwrap_or(200).min(500);
        let offset = filter.offset.unwrap_or(0);

        let mut rows: Vec<Task> = sqlx::query_as(
            "SELECT * FROM tasks ORDER BY score DESC, created_at ASC, id ASC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        if let Some(status) = filter.status {
            rows.retain(|t| t.status == status);
        }
        if let Some(ref parent) = filter.parent_id {
            rows.retain(|t| t.parent_id.as_deref() == Some(parent.as_str()));
        }
        if let Some(ref assignee) = filter.assignee_id {
            rows.retain(|t| t.assignee_id.as_deref() == Some(assignee.as_str()));
        }
        if let Some(ref search) = filter.search {
            let q = search.to_lowercase();
            rows.retain(|t| {
                t.title.to_lowercase().contains(&q) || t.id.to_lowercase().contains(&q)
            });
        }

        Ok(rows)
    }

    /// Full-row update keyed by id. Returns false when the task is missing.
    pub async fn update_row(&self, task: &Task) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET
                 title = ?, description = ?, status = ?, parent_id = ?, score = ?,
                 metadata = ?, assignee_type = ?, assignee_id = ?, assigned_at = ?,
                 assigned_by = ?, updated_at = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status)
        .bind(&task.parent_id)
        .bind(task.score)
        .bind(&task.metadata)
        .bind(task.assignee_type)
        .bind(&task.assignee_id)
        .bind(&task.assigned_at)
        .bind(&task.assigned_by)
        .bind(&task.updated_at)
        .bind(&task.completed_at)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert-or-replace preserving the caller's timestamps (sync import path).
    pub async fn upsert(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks
             (id, title, description, status, parent_id, score, metadata,
              assignee_type, assignee_id, assigned_at, assigned_by,
              created_at, updated_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 title = excluded.title,
                 description = excluded.description,
                 status = excluded.status,
                 parent_id = excluded.parent_id,
                 score = excluded.score,
                 metadata = excluded.metadata,
                 assignee_type = excluded.assignee_type,
                 assignee_id = excluded.assignee_id,
                 assigned_at = excluded.assigned_at,
                 assigned_by = excluded.assigned_by,
                 updated_at = excluded.updated_at,
                 completed_at = excluded.completed_at",
        )
        .bind(&task.id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status)
        .bind(&task.parent_id)
        .bind(task.score)
        .bind(&task.metadata)
        .bind(task.assignee_type)
        .bind(&task.assignee_id)
        .bind(&task.assigned_at)
        .bind(&task.assigned_by)
        .bind(&task.created_at)
        .bind(&task.updated_at)
        .bind(&task.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a task. Children are re-parented to NULL in the same
    /// transaction; dependencies, claims, and attempts cascade via FK.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE tasks SET parent_id = NULL WHERE parent_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_by_status(&self) -> Result<HashMap<TaskStatus, i64>> {
        let rows: Vec<(TaskStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    // ─── Dependencies ─────────────────────────────────────────────────────────

    /// Set-style insert: duplicates are ignored.
    pub async fn add_dependency(
        &self,
        blocker_id: &str,
        blocked_id: &str,
        created_at: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO task_dependencies (blocker_id, blocked_id, created_at)
             VALUES (?, ?, ?)",
        )
        .bind(blocker_id)
        .bind(blocked_id)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set-style delete: removing an absent pair is a no-op.
    pub async fn remove_dependency(&self, blocker_id: &str, blocked_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM task_dependencies WHERE blocker_id = ? AND blocked_id = ?",
        )
        .bind(blocker_id)
        .bind(blocked_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn dependencies_all(&self) -> Result<Vec<Dependency>> {
        Ok(sqlx::query_as(
            "SELECT * FROM task_dependencies ORDER BY created_at ASC, blocker_id ASC, blocked_id ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Tasks that block `id` (any status).
    pub async fn blockers_of(&self, id: &str) -> Result<Vec<Task>> {
        Ok(sqlx::query_as(
            "SELECT t.* FROM task_dependencies d
             JOIN tasks t ON t.id = d.blocker_id
             WHERE d.blocked_id = ?
             ORDER BY t.created_at ASC, t.id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Tasks that `id` blocks.
    pub async fn blocked_by(&self, id: &str) -> Result<Vec<Task>> {
        Ok(sqlx::query_as(
            "SELECT t.* FROM task_dependencies d
             JOIN tasks t ON t.id = d.blocked_id
             WHERE d.blocker_id = ?
             ORDER BY t.created_at ASC, t.id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Reachability over the transitive-blockers relation, bounded at 100
    /// hops. `true` when `target` appears among the (transitive) blockers
    /// of `from` — the cycle test for a proposed `target -> from` edge.
    pub async fn blocker_reachable(&self, from: &str, target: &str) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(
            "WITH RECURSIVE reach(id, depth) AS (
                 SELECT blocker_id, 1 FROM task_dependencies WHERE blocked_id = ?
                 UNION
                 SELECT d.blocker_id, r.depth + 1
                 FROM task_dependencies d
                 JOIN reach r ON d.blocked_id = r.id
                 WHERE r.depth < 100
             )
             SELECT EXISTS(SELECT 1 FROM reach WHERE id = ?)",
        )
        .bind(from)
        .bind(target)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 != 0)
    }

    // ─── Batch assembly ───────────────────────────────────────────────────────

    /// Decorate `tasks` with their four derived fields in three batch
    /// queries total (blockers, blocked, children) — never per-task.
    pub async fn with_deps(
        &self,
        tasks: Vec<Task>,
        ready_statuses: &[TaskStatus],
    ) -> Result<Vec<TaskWithDeps>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();

        let mut blockers = self.keyed_in(
            "SELECT d.blocked_id AS key, t.* FROM task_dependencies d
             JOIN tasks t ON t.id = d.blocker_id
             WHERE d.blocked_id IN ({in})
             ORDER BY t.created_at ASC, t.id ASC",
            &ids,
        )
        .await?;
        let mut blocks = self.keyed_in(
            "SELECT d.blocker_id AS key, t.* FROM task_dependencies d
             JOIN tasks t ON t.id = d.blocked_id
             WHERE d.blocker_id IN ({in})
             ORDER BY t.created_at ASC, t.id ASC",
            &ids,
        )
        .await?;
        let mut children = self.keyed_in(
            "SELECT t.parent_id AS key, t.* FROM tasks t
             WHERE t.parent_id IN ({in})
             ORDER BY t.created_at ASC, t.id ASC",
            &ids,
        )
        .await?;

        Ok(tasks
            .into_iter()
            .map(|task| {
                let blocked_by: Vec<Task> = blockers
                    .remove(task.id.as_str())
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|b| b.status != TaskStatus::Done)
                    .collect();
                let blocks = blocks.remove(task.id.as_str()).unwrap_or_default();
                let children = children.remove(task.id.as_str()).unwrap_or_default();
                let is_ready = blocked_by.is_empty() && ready_statuses.contains(&task.status);
                TaskWithDeps {
                    task,
                    blocked_by,
                    blocks,
                    children,
                    is_ready,
                }
            })
            .collect())
    }

    /// Run a `{in}`-templated keyed query against an id list and group the
    /// resulting tasks by key.
    async fn keyed_in(
        &self,
        sql_template: &str,
        ids: &[&str],
    ) -> Result<HashMap<String, Vec<Task>>> {
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = sql_template.replace("{in}", &placeholders);
        let mut query = sqlx::query_as::<_, KeyedTask>(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut grouped: HashMap<String, Vec<Task>> = HashMap::new();
        for row in rows {
            grouped.entry(row.key).or_default().push(row.task);
        }
        Ok(grouped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::tasks::model::TaskStatus;
    use chrono::Utc;

    async fn mk_store() -> (TaskStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("tx.db")).await.unwrap();
        (TaskStore::new(storage.pool()), dir)
    }

    fn mk_task(id: &str, status: TaskStatus) -> Task {
        let now = Utc::now().to_rfc3339();
        Task {
            id: id.to_string(),
            title: format!("task {id}"),
            description: String::new(),
            status,
            parent_id: None,
            score: 0,
            metadata: "{}".to_string(),
            assignee_type: None,
            assignee_id: None,
            assigned_at: None,
            assigned_by: None,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn insert_get_roundtrip() {
        let (store, _dir) = mk_store().await;
        let task = mk_task("tx-aaaa1111", TaskStatus::Backlog);
        store.insert(&task).await.unwrap();

        let got = store.get("tx-aaaa1111").await.unwrap().unwrap();
        assert_eq!(got.title, task.title);
        assert_eq!(got.status, TaskStatus::Backlog);
    }

    #[tokio::test]
    async fn with_deps_filters_done_blockers_and_flags_ready() {
        let (store, _dir) = mk_store().await;
        let now = Utc::now().to_rfc3339();

        let a = mk_task("tx-aaaa0001", TaskStatus::Ready);
        let b = mk_task("tx-bbbb0002", TaskStatus::Done);
        let c = mk_task("tx-cccc0003", TaskStatus::Ready);
        for t in [&a, &b, &c] {
            store.insert(t).await.unwrap();
        }
        // b (done) and c (ready) both block a.
        store.add_dependency(&b.id, &a.id, &now).await.unwrap();
        store.add_dependency(&c.id, &a.id, &now).await.unwrap();

        let views = store
            .with_deps(vec![a.clone()], &[TaskStatus::Ready])
            .await
            .unwrap();
        assert_eq!(views.len(), 1);
        // Only the non-done blocker remains.
        assert_eq!(views[0].blocked_by.len(), 1);
        assert_eq!(views[0].blocked_by[0].id, c.id);
        assert!(!views[0].is_ready);

        // Once c is done, a becomes ready.
        let mut c_done = c.clone();
        c_done.status = TaskStatus::Done;
        c_done.completed_at = Some(now.clone());
        store.update_row(&c_done).await.unwrap();

        let views = store.with_deps(vec![a], &[TaskStatus::Ready]).await.unwrap();
        assert!(views[0].blocked_by.is_empty());
        assert!(views[0].is_ready);
    }

    #[tokio::test]
    async fn delete_nulls_children_and_cascades_deps() {
        let (store, _dir) = mk_store().await;
        let now = Utc::now().to_rfc3339();

        let parent = mk_task("tx-par00001", TaskStatus::Backlog);
        let mut child = mk_task("tx-chi00001", TaskStatus::Backlog);
        child.parent_id = Some(parent.id.clone());
        let other = mk_task("tx-oth00001", TaskStatus::Backlog);
        for t in [&parent, &child, &other] {
            store.insert(t).await.unwrap();
        }
        store.add_dependency(&parent.id, &other.id, &now).await.unwrap();

        assert!(store.delete(&parent.id).await.unwrap());

        let child = store.get(&child.id).await.unwrap().unwrap();
        assert_eq!(child.parent_id, None);
        assert!(store.dependencies_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocker_reachability_is_transitive() {
        let (store, _dir) = mk_store().await;
        let now = Utc::now().to_rfc3339();
        let a = mk_task("tx-ra000001", TaskStatus::Backlog);
        let b = mk_task("tx-rb000002", TaskStatus::Backlog);
        let c = mk_task("tx-rc000003", TaskStatus::Backlog);
        for t in [&a, &b, &c] {
            store.insert(t).await.unwrap();
        }
        // a blocks b, b blocks c: blockers of c are {b, a}.
        store.add_dependency(&a.id, &b.id, &now).await.unwrap();
        store.add_dependency(&b.id, &c.id, &now).await.unwrap();

        assert!(store.blocker_reachable(&c.id, &a.id).await.unwrap());
        assert!(store.blocker_reachable(&c.id, &b.id).await.unwrap());
        assert!(!store.blocker_reachable(&a.id, &c.id).await.unwrap());
    }

    #[tokio::test]
    async fn dependency_ops_are_set_like() {
        let (store, _dir) = mk_store().await;
        let now = Utc::now().to_rfc3339();
        let a = mk_task("tx-sa000001", TaskStatus::Backlog);
        let b = mk_task("tx-sb000002", TaskStatus::Backlog);
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        assert!(store.add_dependency(&a.id, &b.id, &now).await.unwrap());
        // Duplicate add is ignored.
        assert!(!store.add_dependency(&a.id, &b.id, &now).await.unwrap());
        assert!(store.remove_dependency(&a.id, &b.id).await.unwrap());
        // Removing again is a no-op.
        assert!(!store.remove_dependency(&a.id, &b.id).await.unwrap());
    }
}
