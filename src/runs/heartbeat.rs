//! Per-run progress heartbeats and the stalled-run reaper.
//!
//! Heartbeat ingestion is a single upsert — it never waits on the reaper.
//! Classification reads the heartbeat row as the sole source of truth:
//! `transcript_idle` when the transcript stopped growing, `heartbeat_stale`
//! when the monitor itself went quiet (only when a lag threshold is given).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::errors::{Result, TxError};
use crate::events::{EventStore, EventType, NewEvent};
use crate::runs::model::{Run, RunStatus};

/// Exit code recorded on reaped runs (SIGKILL convention).
pub const REAPED_EXIT_CODE: i64 = 137;

// ─── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatState {
    pub run_id: String,
    pub last_check_at: String,
    pub last_activity_at: Option<String>,
    pub stdout_bytes: i64,
    pub stderr_bytes: i64,
    pub transcript_bytes: i64,
    pub last_delta_bytes: i64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatInput {
    pub run_id: String,
    #[serde(default)]
    pub stdout_bytes: i64,
    #[serde(default)]
    pub stderr_bytes: i64,
    #[serde(default)]
    pub transcript_bytes: i64,
    #[serde(default)]
    pub delta_bytes: i64,
    /// When the monitor took the sample; defaults to now.
    pub check_at: Option<String>,
    /// When output last grew, if known.
    pub activity_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StallReason {
    TranscriptIdle,
    HeartbeatStale,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StalledRun {
    pub run: Run,
    pub state: HeartbeatState,
    pub reason: StallReason,
    pub idle_secs: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct StallThresholds {
    pub transcript_idle_seconds: i64,
    /// Heartbeat-lag classification is disabled when unset.
    pub heartbeat_lag_seconds: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReapOptions {
    pub thresholds: StallThresholds,
    pub reset_task: bool,
    pub dry_run: bool,
    /// Attempt OS signal delivery to recorded pids (Unix only).
    pub terminate_processes: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapedRun {
    pub id: String,
    pub task_id: Option<String>,
    pub task_reset: bool,
    pub process_terminated: bool,
}

impl StallThresholds {
    fn validate(&self) -> Result<()> {
        if self.transcript_idle_seconds < 1 {
            return Err(TxError::validation(
                "transcriptIdleSeconds",
                "must be at least 1",
            ));
        }
        if let Some(lag) = self.heartbeat_lag_seconds {
            if lag < 1 {
                return Err(TxError::validation(
                    "heartbeatLagSeconds",
                    "must be at least 1",
                ));
            }
        }
        Ok(())
    }
}

fn parse_instant(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TxError::InvalidDate {
            field: field.to_string(),
            value: value.to_string(),
        })
}

// ─── Monitor ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HeartbeatMonitor {
    pool: SqlitePool,
}

impl HeartbeatMonitor {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a progress sample. One upsert, O(1), non-blocking.
    pub async fn heartbeat(&self, input: HeartbeatInput) -> Result<HeartbeatState> {
        let check_at = match input.check_at {
            Some(ref raw) => parse_instant("checkAt", raw)?.to_rfc3339(),
            None => Utc::now().to_rfc3339(),
        };
        let activity_at = match input.activity_at {
            Some(ref raw) => Some(parse_instant("activityAt", raw)?.to_rfc3339()),
            None => None,
        };

        let run_exists: (i64,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM runs WHERE id = ?)")
            .bind(&input.run_id)
            .fetch_one(&self.pool)
            .await?;
        if run_exists.0 == 0 {
            return Err(TxError::RunNotFound {
                id: input.run_id.clone(),
            });
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO run_heartbeats
             (run_id, last_check_at, last_activity_at, stdout_bytes, stderr_bytes,
              transcript_bytes, last_delta_bytes, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(run_id) DO UPDATE SET
                 last_check_at = excluded.last_check_at,
                 last_activity_at = COALESCE(excluded.last_activity_at, run_heartbeats.last_activity_at),
                 stdout_bytes = excluded.stdout_bytes,
                 stderr_bytes = excluded.stderr_bytes,
                 transcript_bytes = excluded.transcript_bytes,
                 last_delta_bytes = excluded.last_delta_bytes,
                 updated_at = excluded.updated_at",
        )
        .bind(&input.run_id)
        .bind(&check_at)
        .bind(&activity_at)
        .bind(input.stdout_bytes)
        .bind(input.stderr_bytes)
        .bind(input.transcript_bytes)
        .bind(input.delta_bytes)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.state(&input.run_id).await?.ok_or(TxError::RunNotFound {
            id: input.run_id.clone(),
        })
    }

    pub async fn state(&self, run_id: &str) -> Result<Option<HeartbeatState>> {
        Ok(
            sqlx::query_as("SELECT * FROM run_heartbeats WHERE run_id = ?")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Classify every running run that has a heartbeat row. When both
    /// reasons apply, `transcript_idle` wins for reporting.
    pub async fn list_stalled(&self, thresholds: StallThresholds) -> Result<Vec<StalledRun>> {
        thresholds.validate()?;
        let now = Utc::now();

        let rows: Vec<(Run, HeartbeatState)> = {
            #[derive(sqlx::FromRow)]
            struct Joined {
                #[sqlx(flatten)]
                run: Run,
                #[sqlx(flatten)]
                state: HeartbeatState,
            }
            sqlx::query_as::<_, Joined>(
                "SELECT r.*, h.* FROM runs r
                 JOIN run_heartbeats h ON h.run_id = r.id
                 WHERE r.status = ?
                 ORDER BY r.started_at ASC",
            )
            .bind(RunStatus::Running)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|j| (j.run, j.state))
            .collect()
        };

        let mut stalled = Vec::new();
        for (run, state) in rows {
            let check_at = match parse_instant("lastCheckAt", &state.last_check_at) {
                Ok(dt) => dt,
                Err(_) => {
                    warn!(run_id = %run.id, "corrupt last_check_at; skipping classification");
                    continue;
                }
            };
            // A run that never reported activity is idle since its last check.
            let activity_at = state
                .last_activity_at
                .as_deref()
                .and_then(|raw| parse_instant("lastActivityAt", raw).ok())
                .unwrap_or(check_at);

            let transcript_idle_for = (now - activity_at).num_seconds();
            let heartbeat_lag_for = (now - check_at).num_seconds();

            if transcript_idle_for > thresholds.transcript_idle_seconds {
                stalled.push(StalledRun {
                    run,
                    state,
                    reason: StallReason::TranscriptIdle,
                    idle_secs: transcript_idle_for,
                });
            } else if let Some(lag) = thresholds.heartbeat_lag_seconds {
                if heartbeat_lag_for > lag {
                    stalled.push(StalledRun {
                        run,
                        state,
                        reason: StallReason::HeartbeatStale,
                        idle_secs: heartbeat_lag_for,
                    });
                }
            }
        }
        Ok(stalled)
    }

    /// Cancel stalled runs (`exit_code=137`), expire their claims, and
    /// optionally reset their tasks back to `ready`.
    pub async fn reap_stalled(&self, options: ReapOptions) -> Result<Vec<ReapedRun>> {
        let stalled = self.list_stalled(options.thresholds).await?;
        if options.dry_run {
            return Ok(stalled
                .into_iter()
                .map(|s| ReapedRun {
                    id: s.run.id,
                    task_id: s.run.task_id,
                    task_reset: false,
                    process_terminated: false,
                })
                .collect());
        }

        let mut reaped = Vec::new();
        for candidate in stalled {
            let run = candidate.run;
            let now = Utc::now().to_rfc3339();
            let mut tx = self.pool.begin().await?;

            let updated = sqlx::query(
                "UPDATE runs
                 SET status = 'cancelled', exit_code = ?, ended_at = ?, error = ?
                 WHERE id = ? AND status = 'running'",
            )
            .bind(REAPED_EXIT_CODE)
            .bind(&now)
            .bind(format!(
                "reaped: {} for {}s",
                match candidate.reason {
                    StallReason::TranscriptIdle => "transcript idle",
                    StallReason::HeartbeatStale => "heartbeat stale",
                },
                candidate.idle_secs
            ))
            .bind(&run.id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                // Someone finished the run between classification and reap.
                continue;
            }

            let mut task_reset = false;
            if let Some(ref task_id) = run.task_id {
                sqlx::query(
                    "UPDATE claims SET status = 'expired'
                     WHERE task_id = ? AND status = 'active'",
                )
                .bind(task_id)
                .execute(&mut *tx)
                .await?;

                if options.reset_task {
                    let reset = sqlx::query(
                        "UPDATE tasks
                         SET status = 'ready', completed_at = NULL, updated_at = ?
                         WHERE id = ?",
                    )
                    .bind(&now)
                    .bind(task_id)
                    .execute(&mut *tx)
                    .await?;
                    task_reset = reset.rows_affected() > 0;
                }
            }

            let mut event = NewEvent::of(EventType::RunCancelled)
                .run(&run.id)
                .agent(&run.agent)
                .content("reaped after stall");
            if let Some(ref task_id) = run.task_id {
                event = event.task(task_id);
            }
            EventStore::append_tx(&mut tx, event).await?;
            tx.commit().await?;

            let process_terminated = if options.terminate_processes {
                deliver_kill(run.pid)
            } else {
                false
            };
            info!(
                run_id = %run.id,
                reason = ?candidate.reason,
                task_reset,
                process_terminated,
                "stalled run reaped"
            );
            reaped.push(ReapedRun {
                id: run.id,
                task_id: run.task_id,
                task_reset,
                process_terminated,
            });
        }

        debug!(count = reaped.len(), "reap pass finished");
        Ok(reaped)
    }
}

/// Advisory SIGKILL. Reports only what was observed: `true` iff the signal
/// was delivered.
#[cfg(unix)]
fn deliver_kill(pid: Option<i64>) -> bool {
    match pid {
        Some(pid) if pid > 0 => unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) == 0 },
        _ => false,
    }
}

#[cfg(not(unix))]
fn deliver_kill(_pid: Option<i64>) -> bool {
    false
}
