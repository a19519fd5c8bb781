//! Run data model and the log-capture contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jsontext;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent invocation. Transcript/stdout/stderr/context paths are opaque
/// strings; the engine never opens them.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub task_id: Option<String>,
    pub agent: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: RunStatus,
    pub exit_code: Option<i64>,
    pub pid: Option<i64>,
    pub transcript_path: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub context_path: Option<String>,
    pub summary: Option<String>,
    pub error: Option<String>,
    #[serde(with = "jsontext::json_object")]
    pub metadata: String,
}

impl Run {
    pub fn metadata_value(&self) -> Value {
        serde_json::from_str(&self.metadata).unwrap_or_else(|_| Value::Object(Default::default()))
    }

    /// The `metadata.logCapture` block, when the launcher reported one.
    pub fn log_capture(&self) -> Option<LogCapture> {
        let meta = self.metadata_value();
        serde_json::from_value(meta.get("logCapture")?.clone()).ok()
    }
}

// ─── Log capture contract ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCaptureState {
    Captured,
    NotReported,
    Unreadable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStreamCapture {
    pub path: Option<String>,
    pub state: LogCaptureState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Per-stream capture status recorded by the run launcher. The run-detail
/// view surfaces this without mutating the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogCapture {
    pub stdout: LogStreamCapture,
    pub stderr: LogStreamCapture,
}

// ─── Inputs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub task_id: Option<String>,
    pub agent: String,
    pub pid: Option<i64>,
    pub transcript_path: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub context_path: Option<String>,
    pub metadata: Option<Value>,
    pub log_capture: Option<LogCapture>,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub task_id: Option<String>,
    pub limit: Option<i64>,
}

/// The run-detail response: the row plus its decoded log-capture block.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub log_capture: Option<LogCapture>,
}
