//! Task graph service: create/update/delete with status-transition
//! enforcement and the `TaskWithDeps` canonical view.

use chrono::Utc;
use serde_json::json;
use tracing::debug;

use crate::errors::{Result, TxError};
use crate::events::{EventStore, EventType, NewEvent};
use crate::ids;
use crate::tasks::model::{
    is_valid_transition, CreateTaskInput, Task, TaskFilter, TaskStatus, TaskWithDeps,
    UpdateTaskPatch,
};
use crate::tasks::storage::TaskStore;

#[derive(Clone)]
pub struct TaskService {
    store: TaskStore,
    events: EventStore,
    ready_statuses: Vec<TaskStatus>,
}

impl TaskService {
    pub fn new(store: TaskStore, events: EventStore, ready_statuses: Vec<TaskStatus>) -> Self {
        Self {
            store,
            events,
            ready_statuses,
        }
    }

    pub async fn create(&self, input: CreateTaskInput) -> Result<TaskWithDeps> {
        let title = input.title.trim();
        if title.is_empty() {
            return Err(TxError::validation("title", "must not be empty"));
        }
        if let Some(ref parent_id) = input.parent_id {
            if self.store.get(parent_id).await?.is_none() {
                return Err(TxError::TaskNotFound {
                    id: parent_id.clone(),
                });
            }
        }

        let now = Utc::now().to_rfc3339();
        let task = Task {
            id: ids::new_task_id(),
            title: title.to_string(),
            description: input.description,
            status: TaskStatus::Backlog,
            parent_id: input.parent_id,
            score: input.score.unwrap_or(0),
            metadata: input
                .metadata
                .map(|v| v.to_string())
                .unwrap_or_else(|| "{}".to_string()),
            assignee_type: None,
            assignee_id: None,
            assigned_at: None,
            assigned_by: None,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
        };
        self.store.insert(&task).await?;
        self.events
            .append(
                NewEvent::of(EventType::TaskCreated)
                    .task(&task.id)
                    .content(&task.title),
            )
            .await?;
        debug!(task_id = %task.id, "task created");

        self.view(task).await
    }

    pub async fn get(&self, id: &str) -> Result<Task> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| TxError::TaskNotFound { id: id.to_string() })
    }

    pub async fn get_with_deps(&self, id: &str) -> Result<TaskWithDeps> {
        let task = self.get(id).await?;
        self.view(task).await
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.store.list(filter).await
    }

    pub async fn list_with_deps(&self, filter: &TaskFilter) -> Result<Vec<TaskWithDeps>> {
        let tasks = self.store.list(filter).await?;
        self.store.with_deps(tasks, &self.ready_statuses).await
    }

    pub async fn update(&self, id: &str, patch: UpdateTaskPatch) -> Result<TaskWithDeps> {
        let mut task = self.get(id).await?;
        let now = Utc::now().to_rfc3339();
        let mut completed = false;

        if let Some(title) = patch.title {
            let title = title.trim().to_string();
            if title.is_empty() {
                return Err(TxError::validation("title", "must not be empty"));
            }
            task.title = title;
        }
        if let Some(description) = patch.description {
            task.description = description;
        }
        if let Some(status) = patch.status {
            if !is_valid_transition(task.status, status) {
                return Err(TxError::InvalidTransition {
                    from: task.status.to_string(),
                    to: status.to_string(),
                });
            }
            if status != task.status {
                completed = status == TaskStatus::Done;
                task.status = status;
                // completed_at is non-null iff status is done.
                task.completed_at = if completed { Some(now.clone()) } else { None };
            }
        }
        if let Some(parent_id) = patch.parent_id {
            if let Some(ref pid) = parent_id {
                if pid == id {
                    return Err(TxError::validation("parentId", "task cannot parent itself"));
                }
                if self.store.get(pid).await?.is_none() {
                    return Err(TxError::TaskNotFound { id: pid.clone() });
                }
            }
            task.parent_id = parent_id;
        }
        if let Some(score) = patch.score {
            task.score = score;
        }
        if let Some(metadata) = patch.metadata {
            task.metadata = metadata.to_string();
        }
        if patch.assignee_type.is_some() || patch.assignee_id.is_some() {
            task.assignee_type = patch.assignee_type.or(task.assignee_type);
            task.assignee_id = patch.assignee_id.or(task.assignee_id);
            task.assigned_at = Some(now.clone());
            task.assigned_by = patch.assigned_by.or(task.assigned_by);
        }
        task.updated_at = now;

        if !self.store.update_row(&task).await? {
            return Err(TxError::TaskNotFound { id: id.to_string() });
        }

        self.events
            .append(
                NewEvent::of(if completed {
                    EventType::TaskCompleted
                } else {
                    EventType::TaskUpdated
                })
                .task(id)
                .content(&task.title),
            )
            .await?;

        self.view(task).await
    }

    /// Bring a done task back into play. The only sanctioned exit from the
    /// terminal status.
    pub async fn revive(&self, id: &str) -> Result<TaskWithDeps> {
        let mut task = self.get(id).await?;
        if task.status != TaskStatus::Done {
            return Err(TxError::InvalidTransition {
                from: task.status.to_string(),
                to: "revive".to_string(),
            });
        }
        task.status = TaskStatus::Ready;
        task.completed_at = None;
        task.updated_at = Utc::now().to_rfc3339();
        self.store.update_row(&task).await?;
        self.events
            .append(
                NewEvent::of(EventType::TaskUpdated)
                    .task(id)
                    .content("revived"),
            )
            .await?;
        self.view(task).await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        if !self.store.delete(id).await? {
            return Err(TxError::TaskNotFound { id: id.to_string() });
        }
        debug!(task_id = %id, "task removed");
        Ok(())
    }

    /// Per-status counts plus a total, as a JSON object.
    pub async fn summary(&self) -> Result<serde_json::Value> {
        let counts = self.store.count_by_status().await?;
        let total: i64 = counts.values().sum();
        let mut by_status = serde_json::Map::new();
        for status in TaskStatus::ALL {
            by_status.insert(
                status.as_str().to_string(),
                json!(counts.get(&status).copied().unwrap_or(0)),
            );
        }
        Ok(json!({ "total": total, "byStatus": by_status }))
    }

    async fn view(&self, task: Task) -> Result<TaskWithDeps> {
        let mut views = self
            .store
            .with_deps(vec![task], &self.ready_statuses)
            .await?;
        Ok(views.remove(0))
    }
}
