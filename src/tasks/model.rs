//! Task data model: statuses, the transition table, and the canonical
//! `TaskWithDeps` response shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jsontext;

// ─── Status ───────────────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Ready,
    Planning,
    Active,
    Blocked,
    Review,
    HumanNeedsToReview,
    Done,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Backlog,
        TaskStatus::Ready,
        TaskStatus::Planning,
        TaskStatus::Active,
        TaskStatus::Blocked,
        TaskStatus::Review,
        TaskStatus::HumanNeedsToReview,
        TaskStatus::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Ready => "ready",
            TaskStatus::Planning => "planning",
            TaskStatus::Active => "active",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Review => "review",
            TaskStatus::HumanNeedsToReview => "human_needs_to_review",
            TaskStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The status transition DAG. A pair `(from, targets)` lists every status
/// reachable from `from` in one update. `done` is terminal; the only way
/// out is the explicit revive operation on the task service.
pub static VALID_TRANSITIONS: &[(TaskStatus, &[TaskStatus])] = &[
    (
        TaskStatus::Backlog,
        &[TaskStatus::Ready, TaskStatus::Planning, TaskStatus::Active],
    ),
    (
        TaskStatus::Ready,
        &[
            TaskStatus::Backlog,
            TaskStatus::Planning,
            TaskStatus::Active,
            TaskStatus::Blocked,
        ],
    ),
    (
        TaskStatus::Planning,
        &[TaskStatus::Ready, TaskStatus::Active, TaskStatus::Blocked],
    ),
    (
        TaskStatus::Active,
        &[
            TaskStatus::Ready,
            TaskStatus::Blocked,
            TaskStatus::Review,
            TaskStatus::HumanNeedsToReview,
            TaskStatus::Done,
        ],
    ),
    (
        TaskStatus::Blocked,
        &[TaskStatus::Ready, TaskStatus::Planning, TaskStatus::Active],
    ),
    (
        TaskStatus::Review,
        &[
            TaskStatus::Active,
            TaskStatus::HumanNeedsToReview,
            TaskStatus::Done,
        ],
    ),
    (
        TaskStatus::HumanNeedsToReview,
        &[TaskStatus::Ready, TaskStatus::Active, TaskStatus::Done],
    ),
    (TaskStatus::Done, &[]),
];

/// True when `from -> to` appears in [`VALID_TRANSITIONS`].
/// A no-op transition (`from == to`) is always allowed.
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    if from == to {
        return true;
    }
    VALID_TRANSITIONS
        .iter()
        .find(|(f, _)| *f == from)
        .map(|(_, targets)| targets.contains(&to))
        .unwrap_or(false)
}

// ─── Assignment ───────────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AssigneeKind {
    Human,
    Agent,
}

impl AssigneeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssigneeKind::Human => "human",
            AssigneeKind::Agent => "agent",
        }
    }
}

// ─── Task ─────────────────────────────────────────────────────────────────────

/// One row of the `tasks` table. Timestamps are RFC-3339 strings; metadata
/// is JSON text in storage but serializes as an object on the API surface.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub parent_id: Option<String>,
    pub score: i64,
    #[serde(with = "jsontext::json_object")]
    pub metadata: String,
    pub assignee_type: Option<AssigneeKind>,
    pub assignee_id: Option<String>,
    pub assigned_at: Option<String>,
    pub assigned_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl Task {
    /// Decode the metadata JSON (empty object when unparseable).
    pub fn metadata_value(&self) -> Value {
        serde_json::from_str(&self.metadata).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

/// The canonical task response shape. No surface may return a bare [`Task`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskWithDeps {
    #[serde(flatten)]
    pub task: Task,
    /// Blockers whose status is not yet `done`.
    pub blocked_by: Vec<Task>,
    /// Tasks this one blocks.
    pub blocks: Vec<Task>,
    /// Tasks whose parent is this one.
    pub children: Vec<Task>,
    /// Status permits execution AND `blocked_by` is empty.
    pub is_ready: bool,
}

// ─── Inputs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskInput {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub parent_id: Option<String>,
    pub score: Option<i64>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    /// `Some(None)` clears the parent.
    #[serde(default, with = "double_option")]
    pub parent_id: Option<Option<String>>,
    pub score: Option<i64>,
    pub metadata: Option<Value>,
    pub assignee_type: Option<AssigneeKind>,
    pub assignee_id: Option<String>,
    pub assigned_by: Option<String>,
}

/// Distinguishes an absent patch field from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub parent_id: Option<String>,
    pub assignee_id: Option<String>,
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
