//! Parent/child subtree and ancestor views.
//!
//! Imports can introduce corrupt parent pointers (self-parents, loops,
//! orphans), so every traversal carries a visited set and a depth bound.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use sqlx::SqlitePool;

use crate::errors::{Result, TxError};
use crate::tasks::model::Task;
use crate::tasks::storage::TaskStore;

/// Hard backstop on ancestor walks, matching the SQL recursion cap.
const MAX_ANCESTOR_DEPTH: usize = 100;

pub const DEFAULT_TREE_DEPTH: i64 = 10;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTree {
    #[serde(flatten)]
    pub task: Task,
    pub depth: i64,
    pub children: Vec<TaskTree>,
}

#[derive(Debug, sqlx::FromRow)]
struct SubtreeRow {
    depth: i64,
    #[sqlx(flatten)]
    task: Task,
}

#[derive(Clone)]
pub struct HierarchyService {
    pool: SqlitePool,
    store: TaskStore,
}

impl HierarchyService {
    pub fn new(pool: SqlitePool) -> Self {
        let store = TaskStore::new(pool.clone());
        Self { pool, store }
    }

    /// Build the subtree rooted at `root`, at most `max_depth` levels deep.
    /// Each id appears at most once even when parent pointers form loops.
    pub async fn get_tree(&self, root: &str, max_depth: Option<i64>) -> Result<TaskTree> {
        let max_depth = max_depth
            .unwrap_or(DEFAULT_TREE_DEPTH)
            .clamp(0, MAX_ANCESTOR_DEPTH as i64);

        let rows: Vec<SubtreeRow> = sqlx::query_as(
            "WITH RECURSIVE subtree(id, depth) AS (
                 SELECT id, 0 FROM tasks WHERE id = ?
                 UNION
                 SELECT t.id, s.depth + 1 FROM tasks t
                 JOIN subtree s ON t.parent_id = s.id
                 WHERE s.depth < ?
             )
             SELECT s.depth AS depth, t.* FROM tasks t
             JOIN subtree s ON s.id = t.id
             ORDER BY s.depth ASC, t.created_at ASC, t.id ASC",
        )
        .bind(root)
        .bind(max_depth)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(TxError::TaskNotFound {
                id: root.to_string(),
            });
        }

        // Assemble bottom-up: visit each id once, shallowest depth wins.
        let mut visited: HashSet<String> = HashSet::new();
        let mut nodes: Vec<TaskTree> = Vec::new();
        for row in rows {
            if !visited.insert(row.task.id.clone()) {
                continue;
            }
            nodes.push(TaskTree {
                task: row.task,
                depth: row.depth,
                children: Vec::new(),
            });
        }

        // Index by id, then fold children into parents deepest-first so each
        // node is complete before it is attached.
        let mut by_id: HashMap<String, TaskTree> = nodes
            .into_iter()
            .map(|n| (n.task.id.clone(), n))
            .collect();
        let mut order: Vec<(String, Option<String>)> = by_id
            .values()
            .map(|n| (n.task.id.clone(), n.task.parent_id.clone()))
            .collect();
        order.sort_by_key(|(id, _)| std::cmp::Reverse(by_id[id].depth));

        for (id, parent_id) in order {
            if id == root {
                continue;
            }
            let Some(parent_id) = parent_id else { continue };
            if parent_id == id {
                continue;
            }
            if let Some(node) = by_id.remove(&id) {
                if let Some(parent) = by_id.get_mut(&parent_id) {
                    parent.children.push(node);
                } else {
                    // Parent fell outside the visited set (loop); drop.
                    continue;
                }
            }
        }

        by_id.remove(root).ok_or_else(|| TxError::TaskNotFound {
            id: root.to_string(),
        })
    }

    /// Distance from `id` to its topmost reachable ancestor. A task with no
    /// parent (or a self-referencing one) is at depth 0.
    pub async fn get_depth(&self, id: &str) -> Result<i64> {
        let mut current = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| TxError::TaskNotFound { id: id.to_string() })?;

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(current.id.clone());
        let mut depth: i64 = 0;

        while let Some(parent_id) = current.parent_id.clone() {
            if !visited.insert(parent_id.clone()) {
                break; // cyclic parent pointer
            }
            if depth as usize >= MAX_ANCESTOR_DEPTH {
                break;
            }
            match self.store.get(&parent_id).await? {
                Some(parent) => {
                    depth += 1;
                    current = parent;
                }
                None => break, // orphan: dangling parent pointer
            }
        }
        Ok(depth)
    }

    /// Tasks whose parent is NULL. Orphans (dangling parent ids) are not
    /// roots by design.
    pub async fn get_roots(&self) -> Result<Vec<Task>> {
        Ok(sqlx::query_as(
            "SELECT * FROM tasks WHERE parent_id IS NULL
             ORDER BY score DESC, created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}
