//! Closed error taxonomy for the engine.
//!
//! Every service returns `Result<T, TxError>`. Variants carry structured
//! fields so front-ends can map them to surface codes (HTTP status, RPC
//! error code) without parsing message strings.

use serde::Serialize;

/// Coarse classification used by adapters to pick a surface code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller-supplied data invalid (400-equivalent).
    Validation,
    /// Entity missing (404-equivalent).
    NotFound,
    /// State precondition failed (409-equivalent).
    Conflict,
    /// Storage failure (500-equivalent).
    Database,
    /// Pluggable dependency missing; callers degrade gracefully.
    Unavailable,
    /// On-disk data violates an invariant.
    Corruption,
}

#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    #[error("run not found: {id}")]
    RunNotFound { id: String },

    #[error("worker not found: {id}")]
    WorkerNotFound { id: String },

    #[error("learning not found: {id}")]
    LearningNotFound { id: i64 },

    #[error("anchor not found: {id}")]
    AnchorNotFound { id: i64 },

    #[error("edge not found: {id}")]
    EdgeNotFound { id: i64 },

    #[error("claim not found: {id}")]
    ClaimNotFound { id: i64 },

    #[error("validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("invalid date in {field}: {value:?}")]
    InvalidDate { field: String, value: String },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("blocker {blocker_id} on {blocked_id} would create a dependency cycle")]
    CircularDependency {
        blocked_id: String,
        blocker_id: String,
    },

    #[error("task {task_id} already claimed by worker {claimed_by}")]
    AlreadyClaimed {
        task_id: String,
        claimed_by: String,
    },

    #[error("claim on task {task_id} is not owned by worker {worker_id}")]
    ClaimNotOwned { task_id: String, worker_id: String },

    #[error("llm backend unavailable: {reason}")]
    LlmUnavailable { reason: String },

    #[error("extraction backend unavailable: {reason}")]
    ExtractionUnavailable { reason: String },

    #[error("embedding backend unavailable: {reason}")]
    EmbeddingUnavailable { reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TxError {
    /// Shorthand for a [`TxError::Validation`].
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TaskNotFound { .. }
            | Self::RunNotFound { .. }
            | Self::WorkerNotFound { .. }
            | Self::LearningNotFound { .. }
            | Self::AnchorNotFound { .. }
            | Self::EdgeNotFound { .. }
            | Self::ClaimNotFound { .. } => ErrorKind::NotFound,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::InvalidDate { .. } => ErrorKind::Corruption,
            Self::InvalidTransition { .. }
            | Self::CircularDependency { .. }
            | Self::AlreadyClaimed { .. }
            | Self::ClaimNotOwned { .. } => ErrorKind::Conflict,
            Self::LlmUnavailable { .. }
            | Self::ExtractionUnavailable { .. }
            | Self::EmbeddingUnavailable { .. } => ErrorKind::Unavailable,
            Self::Database(_) | Self::Io(_) | Self::Json(_) => ErrorKind::Database,
        }
    }

    /// True when the underlying sqlx error is a UNIQUE constraint violation.
    /// The claim coordinator uses this to convert an insert race loss into
    /// [`TxError::AlreadyClaimed`].
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

pub type Result<T, E = TxError> = std::result::Result<T, E>;
