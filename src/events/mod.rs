//! Append-only activity event log.
//!
//! Rows are never mutated after insert. The run lifecycle and the reaper
//! append inside their own transactions via [`EventStore::append_tx`] so a
//! rolled-back operation leaves no trace; everything else uses
//! [`EventStore::append`].

use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};

use crate::errors::Result;
use crate::jsontext;

// ─── Types ────────────────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunCompleted,
    RunFailed,
    RunCancelled,
    TaskCreated,
    TaskUpdated,
    TaskCompleted,
    ToolCall,
    ToolResult,
    Error,
    LearningCaptured,
    Metric,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunStarted => "run_started",
            EventType::RunCompleted => "run_completed",
            EventType::RunFailed => "run_failed",
            EventType::RunCancelled => "run_cancelled",
            EventType::TaskCreated => "task_created",
            EventType::TaskUpdated => "task_updated",
            EventType::TaskCompleted => "task_completed",
            EventType::ToolCall => "tool_call",
            EventType::ToolResult => "tool_result",
            EventType::Error => "error",
            EventType::LearningCaptured => "learning_captured",
            EventType::Metric => "metric",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    pub timestamp: String,
    pub event_type: EventType,
    pub run_id: Option<String>,
    pub task_id: Option<String>,
    pub agent: Option<String>,
    pub tool_name: Option<String>,
    pub content: String,
    #[serde(with = "jsontext::json_object")]
    pub metadata: String,
    pub duration_ms: Option<i64>,
}

/// A not-yet-persisted event. `timestamp` is stamped at append time.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub event_type: Option<EventType>,
    pub run_id: Option<String>,
    pub task_id: Option<String>,
    pub agent: Option<String>,
    pub tool_name: Option<String>,
    pub content: String,
    pub metadata: Option<String>,
    pub duration_ms: Option<i64>,
}

impl NewEvent {
    pub fn of(event_type: EventType) -> Self {
        Self {
            event_type: Some(event_type),
            ..Default::default()
        }
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub event_type: Option<EventType>,
    pub run_id: Option<String>,
    pub task_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<i64>,
}

// ─── Store ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, event: NewEvent) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        Self::append_on(&mut conn, event).await
    }

    /// Append inside a caller-held transaction so the event commits (or
    /// rolls back) with the surrounding write.
    pub async fn append_tx(conn: &mut SqliteConnection, event: NewEvent) -> Result<i64> {
        Self::append_on(conn, event).await
    }

    async fn append_on(conn: &mut SqliteConnection, event: NewEvent) -> Result<i64> {
        let event_type = event.event_type.unwrap_or(EventType::Metric);
        let result = sqlx::query(
            "INSERT INTO events
             (timestamp, event_type, run_id, task_id, agent, tool_name, content, metadata, duration_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(event_type)
        .bind(&event.run_id)
        .bind(&event.task_id)
        .bind(&event.agent)
        .bind(&event.tool_name)
        .bind(&event.content)
        .bind(event.metadata.as_deref().unwrap_or("{}"))
        .bind(event.duration_ms)
        .execute(&mut *conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn query(&self, params: &EventQuery) -> Result<Vec<Event>> {
        let limit = params.limit.unwrap_or(100).min(1000);
        let mut rows: Vec<Event> =
            sqlx::query_as("SELECT * FROM events ORDER BY timestamp DESC, id DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;

        if let Some(et) = params.event_type {
            rows.retain(|e| e.event_type == et);
        }
        if let Some(ref run_id) = params.run_id {
            rows.retain(|e| e.run_id.as_deref() == Some(run_id.as_str()));
        }
        if let Some(ref task_id) = params.task_id {
            rows.retain(|e| e.task_id.as_deref() == Some(task_id.as_str()));
        }
        if let Some(ref since) = params.since {
            rows.retain(|e| e.timestamp.as_str() >= since.as_str());
        }
        Ok(rows)
    }

    /// Delete events older than `retention_days`. Pass `0` to skip pruning.
    pub async fn prune(&self, retention_days: u32) -> Result<u64> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff =
            (chrono::Utc::now() - chrono::Duration::days(retention_days as i64)).to_rfc3339();
        let result = sqlx::query("DELETE FROM events WHERE timestamp < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
