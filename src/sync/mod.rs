//! JSONL replication: export, import, compact, status.
//!
//! Each entity kind (tasks+deps, learnings, file-learnings, attempts) gets
//! its own line-delimited log under the sync directory. Export serializes
//! every row as an upsert op stamped with the row's own timestamp; import
//! reduces last-writer-wins and applies deterministically; compact rewrites
//! a log to its minimal surviving form. All writes are atomic
//! (temp file + rename), and a missing file reads as empty.

pub mod ops;

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::errors::{Result, TxError};
use crate::knowledge::file_learnings::{FileLearning, FileLearningStore};
use crate::knowledge::learnings::LearningStore;
use crate::knowledge::model::{Learning, LearningSource};
use crate::tasks::attempts::{Attempt, AttemptOutcome, AttemptStore};
use crate::tasks::model::{AssigneeKind, Task, TaskStatus};
use crate::tasks::storage::TaskStore;
use ops::{parse_lines, reduce_ops, render_file, sort_ops, OpKind, SyncOp};

pub const TASKS_FILE: &str = "tasks.jsonl";
pub const LEARNINGS_FILE: &str = "learnings.jsonl";
pub const FILE_LEARNINGS_FILE: &str = "file-learnings.jsonl";
pub const ATTEMPTS_FILE: &str = "attempts.jsonl";

// ─── Reports ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: u32,
    pub skipped: u32,
    pub conflicts: u32,
    pub parse_errors: u32,
}

impl ImportReport {
    fn merge(&mut self, other: &ImportReport) {
        self.imported += other.imported;
        self.skipped += other.skipped;
        self.conflicts += other.conflicts;
        self.parse_errors += other.parse_errors;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactReport {
    pub before: usize,
    pub after: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub db_rows: u64,
    pub file_ops: usize,
    pub dirty: bool,
    pub last_export: Option<String>,
    pub last_import: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusAll {
    pub tasks: SyncStatus,
    pub learnings: SyncStatus,
    pub file_learnings: SyncStatus,
    pub attempts: SyncStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportAllReport {
    pub tasks: usize,
    pub learnings: usize,
    pub file_learnings: usize,
    pub attempts: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportAllReport {
    pub tasks: ImportReport,
    pub learnings: ImportReport,
    pub file_learnings: ImportReport,
    pub attempts: ImportReport,
    pub total: ImportReport,
}

// ─── Payloads ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TaskData {
    title: String,
    description: String,
    status: Option<String>,
    parent_id: Option<String>,
    score: i64,
    metadata: Option<Value>,
    assignee_type: Option<String>,
    assignee_id: Option<String>,
    assigned_at: Option<String>,
    assigned_by: Option<String>,
    created_at: Option<String>,
    completed_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LearningData {
    content: String,
    source_type: Option<String>,
    source_ref: Option<String>,
    keywords: Vec<String>,
    category: Option<String>,
    usage_count: i64,
    last_used_at: Option<String>,
    outcome_score: f64,
    run_id: Option<String>,
    created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileLearningData {
    file_path: String,
    learning_id: i64,
    relevance: f64,
    created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AttemptData {
    task_id: String,
    run_id: Option<String>,
    worker_id: Option<String>,
    outcome: Option<String>,
    summary: Option<String>,
    created_at: Option<String>,
}

// ─── Service ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SyncService {
    pool: SqlitePool,
    dir: PathBuf,
    tasks: TaskStore,
    attempts: AttemptStore,
    file_learnings: FileLearningStore,
    learnings: LearningStore,
}

impl SyncService {
    pub fn new(pool: SqlitePool, dir: PathBuf, learnings: LearningStore) -> Self {
        Self {
            tasks: TaskStore::new(pool.clone()),
            attempts: AttemptStore::new(pool.clone()),
            file_learnings: FileLearningStore::new(pool.clone()),
            learnings,
            pool,
            dir,
        }
    }

    fn default_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    // ─── Sync config ──────────────────────────────────────────────────────────

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM sync_config WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_config (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn auto_sync(&self) -> Result<bool> {
        Ok(self.get_config("auto_sync").await?.as_deref() == Some("true"))
    }

    pub async fn set_auto_sync(&self, enabled: bool) -> Result<()> {
        self.set_config("auto_sync", if enabled { "true" } else { "false" })
            .await
    }

    async fn stamp(&self, key: &str) -> Result<()> {
        self.set_config(key, &Utc::now().to_rfc3339()).await
    }

    // ─── Tasks ────────────────────────────────────────────────────────────────

    pub async fn export_tasks(&self, path: Option<&Path>) -> Result<usize> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| self.default_path(TASKS_FILE));

        let mut out: Vec<SyncOp> = Vec::new();
        for task in self.tasks.all().await? {
            out.push(SyncOp::upsert(
                OpKind::Upsert,
                json!(task.id),
                task.updated_at.clone(),
                task_data_value(&task),
            ));
        }
        for dep in self.tasks.dependencies_all().await? {
            out.push(SyncOp::dep(
                OpKind::DepAdd,
                dep.blocker_id,
                dep.blocked_id,
                dep.created_at,
            ));
        }
        sort_ops(&mut out);
        write_atomic(&path, &render_file(&out)).await?;
        self.stamp("last_export").await?;
        debug!(path = %path.display(), ops = out.len(), "tasks exported");
        Ok(out.len())
    }

    pub async fn import_tasks(&self, path: Option<&Path>) -> Result<ImportReport> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| self.default_path(TASKS_FILE));
        let content = read_or_empty(&path).await?;
        let (ops, errors) = parse_lines(&content);
        let reduced = reduce_ops(ops);
        let mut report = ImportReport {
            parse_errors: errors.len() as u32,
            ..Default::default()
        };
        for err in &errors {
            warn!(line = err.line, reason = %err.reason, "skipping malformed jsonl line");
        }

        // Entity ops first so dep ops can see freshly imported tasks.
        for op in reduced.iter().filter(|o| !matches!(o.op, OpKind::DepAdd | OpKind::DepRemove)) {
            match op.op {
                OpKind::Upsert => {
                    let Some(id) = op.id_string() else { continue };
                    let Some(task) = task_from_op(op) else {
                        report.parse_errors += 1;
                        continue;
                    };
                    match self.tasks.get(&id).await? {
                        None => {
                            self.tasks.upsert(&task).await?;
                            report.imported += 1;
                        }
                        Some(existing) => match cmp_ts(&op.ts, &existing.updated_at) {
                            Ordering::Greater => {
                                self.tasks.upsert(&task).await?;
                                report.imported += 1;
                            }
                            Ordering::Equal => report.skipped += 1,
                            Ordering::Less => report.conflicts += 1,
                        },
                    }
                }
                OpKind::Delete => {
                    let Some(id) = op.id_string() else { continue };
                    if self.tasks.delete(&id).await? {
                        report.imported += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                _ => {
                    // Foreign op kind in the tasks file: report, keep going.
                    report.parse_errors += 1;
                }
            }
        }

        for op in reduced.iter().filter(|o| matches!(o.op, OpKind::DepAdd | OpKind::DepRemove)) {
            let (Some(blocker), Some(blocked)) =
                (op.blocker_id.as_deref(), op.blocked_id.as_deref())
            else {
                continue;
            };
            match op.op {
                OpKind::DepAdd => {
                    let both_exist = self.tasks.get(blocker).await?.is_some()
                        && self.tasks.get(blocked).await?.is_some();
                    if both_exist && self.tasks.add_dependency(blocker, blocked, &op.ts).await? {
                        report.imported += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                OpKind::DepRemove => {
                    if self.tasks.remove_dependency(blocker, blocked).await? {
                        report.imported += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                _ => unreachable!(),
            }
        }

        self.stamp("last_import").await?;
        Ok(report)
    }

    // ─── Learnings ────────────────────────────────────────────────────────────

    pub async fn export_learnings(&self, path: Option<&Path>) -> Result<usize> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path(LEARNINGS_FILE));
        let mut out: Vec<SyncOp> = Vec::new();
        for learning in self.learnings.all().await? {
            out.push(SyncOp::upsert(
                OpKind::LearningUpsert,
                json!(learning.id),
                learning.updated_at.clone(),
                learning_data_value(&learning),
            ));
        }
        sort_ops(&mut out);
        write_atomic(&path, &render_file(&out)).await?;
        self.stamp("last_export").await?;
        Ok(out.len())
    }

    pub async fn import_learnings(&self, path: Option<&Path>) -> Result<ImportReport> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path(LEARNINGS_FILE));
        let content = read_or_empty(&path).await?;
        let (ops, errors) = parse_lines(&content);
        let reduced = reduce_ops(ops);
        let mut report = ImportReport {
            parse_errors: errors.len() as u32,
            ..Default::default()
        };

        for op in &reduced {
            match op.op {
                OpKind::LearningUpsert => {
                    let Some(id) = op.id_i64() else {
                        report.parse_errors += 1;
                        continue;
                    };
                    let Some(learning) = learning_from_op(id, op) else {
                        report.parse_errors += 1;
                        continue;
                    };
                    let existing: Option<Learning> =
                        sqlx::query_as("SELECT * FROM learnings WHERE id = ?")
                            .bind(id)
                            .fetch_optional(&self.pool)
                            .await?;
                    match existing {
                        None => {
                            self.learnings.upsert(&learning).await?;
                            report.imported += 1;
                        }
                        Some(existing) => match cmp_ts(&op.ts, &existing.updated_at) {
                            Ordering::Greater => {
                                self.learnings.upsert(&learning).await?;
                                report.imported += 1;
                            }
                            Ordering::Equal => report.skipped += 1,
                            Ordering::Less => report.conflicts += 1,
                        },
                    }
                }
                OpKind::Delete => {
                    let Some(id) = op.id_i64() else {
                        report.parse_errors += 1;
                        continue;
                    };
                    if self.learnings.delete(id).await? {
                        report.imported += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                _ => report.parse_errors += 1,
            }
        }

        self.stamp("last_import").await?;
        Ok(report)
    }

    // ─── File learnings ───────────────────────────────────────────────────────

    pub async fn export_file_learnings(&self, path: Option<&Path>) -> Result<usize> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path(FILE_LEARNINGS_FILE));
        let mut out: Vec<SyncOp> = Vec::new();
        for row in self.file_learnings.all().await? {
            out.push(SyncOp::upsert(
                OpKind::FileLearningUpsert,
                json!(row.id),
                row.updated_at.clone(),
                json!({
                    "filePath": row.file_path,
                    "learningId": row.learning_id,
                    "relevance": row.relevance,
                    "createdAt": row.created_at,
                }),
            ));
        }
        sort_ops(&mut out);
        write_atomic(&path, &render_file(&out)).await?;
        self.stamp("last_export").await?;
        Ok(out.len())
    }

    pub async fn import_file_learnings(&self, path: Option<&Path>) -> Result<ImportReport> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path(FILE_LEARNINGS_FILE));
        let content = read_or_empty(&path).await?;
        let (ops, errors) = parse_lines(&content);
        let reduced = reduce_ops(ops);
        let mut report = ImportReport {
            parse_errors: errors.len() as u32,
            ..Default::default()
        };

        for op in &reduced {
            match op.op {
                OpKind::FileLearningUpsert => {
                    let (Some(id), Some(data)) = (op.id_i64(), op.data.as_ref()) else {
                        report.parse_errors += 1;
                        continue;
                    };
                    let Ok(data) = serde_json::from_value::<FileLearningData>(data.clone()) else {
                        report.parse_errors += 1;
                        continue;
                    };
                    if data.file_path.is_empty() {
                        report.parse_errors += 1;
                        continue;
                    }
                    let row = FileLearning {
                        id,
                        file_path: data.file_path,
                        learning_id: data.learning_id,
                        relevance: if data.relevance > 0.0 { data.relevance } else { 1.0 },
                        created_at: data.created_at.unwrap_or_else(|| op.ts.clone()),
                        updated_at: op.ts.clone(),
                    };
                    let existing: Option<FileLearning> =
                        sqlx::query_as("SELECT * FROM file_learnings WHERE id = ?")
                            .bind(id)
                            .fetch_optional(&self.pool)
                            .await?;
                    match existing {
                        None => {
                            if self.file_learnings.upsert(&row).await? {
                                report.imported += 1;
                            } else {
                                report.skipped += 1;
                            }
                        }
                        Some(existing) => match cmp_ts(&op.ts, &existing.updated_at) {
                            Ordering::Greater => {
                                if self.file_learnings.upsert(&row).await? {
                                    report.imported += 1;
                                } else {
                                    report.skipped += 1;
                                }
                            }
                            Ordering::Equal => report.skipped += 1,
                            Ordering::Less => report.conflicts += 1,
                        },
                    }
                }
                OpKind::Delete => {
                    let Some(id) = op.id_i64() else {
                        report.parse_errors += 1;
                        continue;
                    };
                    if self.file_learnings.unlink(id).await? {
                        report.imported += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                _ => report.parse_errors += 1,
            }
        }

        self.stamp("last_import").await?;
        Ok(report)
    }

    // ─── Attempts ─────────────────────────────────────────────────────────────

    pub async fn export_attempts(&self, path: Option<&Path>) -> Result<usize> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path(ATTEMPTS_FILE));
        let mut out: Vec<SyncOp> = Vec::new();
        for attempt in self.attempts.all().await? {
            out.push(SyncOp::upsert(
                OpKind::AttemptUpsert,
                json!(attempt.id),
                attempt.updated_at.clone(),
                json!({
                    "taskId": attempt.task_id,
                    "runId": attempt.run_id,
                    "workerId": attempt.worker_id,
                    "outcome": attempt.outcome,
                    "summary": attempt.summary,
                    "createdAt": attempt.created_at,
                }),
            ));
        }
        sort_ops(&mut out);
        write_atomic(&path, &render_file(&out)).await?;
        self.stamp("last_export").await?;
        Ok(out.len())
    }

    pub async fn import_attempts(&self, path: Option<&Path>) -> Result<ImportReport> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path(ATTEMPTS_FILE));
        let content = read_or_empty(&path).await?;
        let (ops, errors) = parse_lines(&content);
        let reduced = reduce_ops(ops);
        let mut report = ImportReport {
            parse_errors: errors.len() as u32,
            ..Default::default()
        };

        for op in &reduced {
            match op.op {
                OpKind::AttemptUpsert => {
                    let (Some(id), Some(data)) = (op.id_i64(), op.data.as_ref()) else {
                        report.parse_errors += 1;
                        continue;
                    };
                    let Ok(data) = serde_json::from_value::<AttemptData>(data.clone()) else {
                        report.parse_errors += 1;
                        continue;
                    };
                    if data.task_id.is_empty() {
                        report.parse_errors += 1;
                        continue;
                    }
                    let outcome = data
                        .outcome
                        .as_deref()
                        .and_then(parse_outcome)
                        .unwrap_or(AttemptOutcome::Unknown);
                    let row = Attempt {
                        id,
                        task_id: data.task_id,
                        run_id: data.run_id,
                        worker_id: data.worker_id,
                        outcome,
                        summary: data.summary,
                        created_at: data.created_at.unwrap_or_else(|| op.ts.clone()),
                        updated_at: op.ts.clone(),
                    };
                    let existing = self.attempts.get(id).await?;
                    match existing {
                        None => {
                            if self.attempts.upsert(&row).await? {
                                report.imported += 1;
                            } else {
                                report.skipped += 1;
                            }
                        }
                        Some(existing) => match cmp_ts(&op.ts, &existing.updated_at) {
                            Ordering::Greater => {
                                if self.attempts.upsert(&row).await? {
                                    report.imported += 1;
                                } else {
                                    report.skipped += 1;
                                }
                            }
                            Ordering::Equal => report.skipped += 1,
                            Ordering::Less => report.conflicts += 1,
                        },
                    }
                }
                OpKind::Delete => {
                    let Some(id) = op.id_i64() else {
                        report.parse_errors += 1;
                        continue;
                    };
                    if self.attempts.delete(id).await? {
                        report.imported += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                _ => report.parse_errors += 1,
            }
        }

        self.stamp("last_import").await?;
        Ok(report)
    }

    // ─── Compaction ───────────────────────────────────────────────────────────

    /// Reduce a log to the latest op per key, drop tombstones, and rewrite
    /// it atomically. Entity-agnostic.
    pub async fn compact(&self, path: &Path) -> Result<CompactReport> {
        let content = read_or_empty(path).await?;
        let (parsed, _errors) = parse_lines(&content);
        let before = parsed.len();
        let survivors: Vec<SyncOp> = reduce_ops(parsed)
            .into_iter()
            .filter(|op| !op.op.is_tombstone())
            .collect();
        let after = survivors.len();
        write_atomic(path, &render_file(&survivors)).await?;
        Ok(CompactReport { before, after })
    }

    pub async fn compact_tasks(&self, path: Option<&Path>) -> Result<CompactReport> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| self.default_path(TASKS_FILE));
        self.compact(&path).await
    }

    pub async fn compact_learnings(&self, path: Option<&Path>) -> Result<CompactReport> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path(LEARNINGS_FILE));
        self.compact(&path).await
    }

    pub async fn compact_file_learnings(&self, path: Option<&Path>) -> Result<CompactReport> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path(FILE_LEARNINGS_FILE));
        self.compact(&path).await
    }

    pub async fn compact_attempts(&self, path: Option<&Path>) -> Result<CompactReport> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path(ATTEMPTS_FILE));
        self.compact(&path).await
    }

    // ─── Status ───────────────────────────────────────────────────────────────

    /// `table` is one of our own constants, never caller input.
    async fn status_for(&self, table: &str, default_file: &str, path: Option<&Path>) -> Result<SyncStatus> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path(default_file));
        let db_rows: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        let content = read_or_empty(&path).await?;
        let (parsed, _) = parse_lines(&content);

        let last_export = self.get_config("last_export").await?;
        let dirty = match last_export {
            Some(ref cutoff) => {
                let row: (i64,) = sqlx::query_as(&format!(
                    "SELECT EXISTS(SELECT 1 FROM {table} WHERE updated_at > ?)"
                ))
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?;
                row.0 != 0
            }
            None => db_rows.0 > 0,
        };

        Ok(SyncStatus {
            db_rows: db_rows.0 as u64,
            file_ops: parsed.len(),
            dirty,
            last_export,
            last_import: self.get_config("last_import").await?,
        })
    }

    pub async fn status_tasks(&self, path: Option<&Path>) -> Result<SyncStatus> {
        self.status_for("tasks", TASKS_FILE, path).await
    }

    pub async fn status_learnings(&self, path: Option<&Path>) -> Result<SyncStatus> {
        self.status_for("learnings", LEARNINGS_FILE, path).await
    }

    pub async fn status_file_learnings(&self, path: Option<&Path>) -> Result<SyncStatus> {
        self.status_for("file_learnings", FILE_LEARNINGS_FILE, path)
            .await
    }

    pub async fn status_attempts(&self, path: Option<&Path>) -> Result<SyncStatus> {
        self.status_for("attempts", ATTEMPTS_FILE, path).await
    }

    pub async fn status_all(&self) -> Result<SyncStatusAll> {
        Ok(SyncStatusAll {
            tasks: self.status_tasks(None).await?,
            learnings: self.status_learnings(None).await?,
            file_learnings: self.status_file_learnings(None).await?,
            attempts: self.status_attempts(None).await?,
        })
    }

    // ─── Composition ──────────────────────────────────────────────────────────

    pub async fn export_all(&self) -> Result<ExportAllReport> {
        let report = ExportAllReport {
            tasks: self.export_tasks(None).await?,
            learnings: self.export_learnings(None).await?,
            file_learnings: self.export_file_learnings(None).await?,
            attempts: self.export_attempts(None).await?,
        };
        Ok(report)
    }

    pub async fn import_all(&self) -> Result<ImportAllReport> {
        // Learnings land before file-learnings so links can resolve.
        let tasks = self.import_tasks(None).await?;
        let learnings = self.import_learnings(None).await?;
        let file_learnings = self.import_file_learnings(None).await?;
        let attempts = self.import_attempts(None).await?;

        let mut total = ImportReport::default();
        for part in [&tasks, &learnings, &file_learnings, &attempts] {
            total.merge(part);
        }
        Ok(ImportAllReport {
            tasks,
            learnings,
            file_learnings,
            attempts,
            total,
        })
    }
}

// ─── Row/op conversion ────────────────────────────────────────────────────────

fn task_data_value(task: &Task) -> Value {
    json!({
        "title": task.title,
        "description": task.description,
        "status": task.status,
        "parentId": task.parent_id,
        "score": task.score,
        "metadata": serde_json::from_str::<Value>(&task.metadata)
            .unwrap_or_else(|_| json!({})),
        "assigneeType": task.assignee_type,
        "assigneeId": task.assignee_id,
        "assignedAt": task.assigned_at,
        "assignedBy": task.assigned_by,
        "createdAt": task.created_at,
        "completedAt": task.completed_at,
    })
}

fn task_from_op(op: &SyncOp) -> Option<Task> {
    let id = op.id_string()?;
    let data: TaskData = serde_json::from_value(op.data.clone()?).ok()?;
    if data.title.trim().is_empty() {
        return None;
    }
    let status = match data.status.as_deref() {
        Some(raw) => TaskStatus::parse(raw)?,
        None => TaskStatus::Backlog,
    };
    let assignee_type = match data.assignee_type.as_deref() {
        None => None,
        Some("human") => Some(AssigneeKind::Human),
        Some("agent") => Some(AssigneeKind::Agent),
        Some(_) => return None,
    };
    // Normalize the completion invariant on the way in.
    let completed_at = if status == TaskStatus::Done {
        Some(data.completed_at.unwrap_or_else(|| op.ts.clone()))
    } else {
        None
    };
    Some(Task {
        id,
        title: data.title,
        description: data.description,
        status,
        parent_id: data.parent_id,
        score: data.score,
        metadata: data
            .metadata
            .map(|v| v.to_string())
            .unwrap_or_else(|| "{}".to_string()),
        assignee_type,
        assignee_id: data.assignee_id,
        assigned_at: data.assigned_at,
        assigned_by: data.assigned_by,
        created_at: data.created_at.unwrap_or_else(|| op.ts.clone()),
        updated_at: op.ts.clone(),
        completed_at,
    })
}

fn learning_data_value(learning: &Learning) -> Value {
    json!({
        "content": learning.content,
        "sourceType": learning.source_type,
        "sourceRef": learning.source_ref,
        "keywords": learning.keyword_list(),
        "category": learning.category,
        "usageCount": learning.usage_count,
        "lastUsedAt": learning.last_used_at,
        "outcomeScore": learning.outcome_score,
        "runId": learning.run_id,
        "createdAt": learning.created_at,
    })
}

fn learning_from_op(id: i64, op: &SyncOp) -> Option<Learning> {
    let data: LearningData = serde_json::from_value(op.data.clone()?).ok()?;
    if data.content.trim().is_empty() {
        return None;
    }
    let source_type = match data.source_type.as_deref() {
        None => LearningSource::Manual,
        Some("compaction") => LearningSource::Compaction,
        Some("run") => LearningSource::Run,
        Some("manual") => LearningSource::Manual,
        Some("claude_md") => LearningSource::ClaudeMd,
        Some(_) => return None,
    };
    Some(Learning {
        id,
        content: data.content,
        source_type,
        source_ref: data.source_ref,
        keywords: serde_json::to_string(&data.keywords).unwrap_or_else(|_| "[]".into()),
        category: data.category,
        usage_count: data.usage_count,
        last_used_at: data.last_used_at,
        outcome_score: data.outcome_score,
        embedding: None,
        run_id: data.run_id,
        created_at: data.created_at.unwrap_or_else(|| op.ts.clone()),
        updated_at: op.ts.clone(),
    })
}

fn parse_outcome(raw: &str) -> Option<AttemptOutcome> {
    match raw {
        "success" => Some(AttemptOutcome::Success),
        "failure" => Some(AttemptOutcome::Failure),
        "abandoned" => Some(AttemptOutcome::Abandoned),
        "unknown" => Some(AttemptOutcome::Unknown),
        _ => None,
    }
}

/// Compare an op timestamp against a row timestamp. An unparseable row
/// timestamp (corrupt) loses to any valid op.
fn cmp_ts(op_ts: &str, row_ts: &str) -> Ordering {
    match (ops::parse_ts(op_ts), ops::parse_ts(row_ts)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

// ─── File helpers ─────────────────────────────────────────────────────────────

async fn read_or_empty(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(TxError::Io(err)),
    }
}

/// Write via temp file + rename in the destination directory, so readers
/// never observe a torn file.
async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&parent).await?;

    let path = path.to_path_buf();
    let content = content.to_string();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| TxError::Io(std::io::Error::other(e)))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStore;
    use crate::knowledge::model::CreateLearningInput;
    use crate::llm::embeddings::NoopEmbedding;
    use crate::storage::Storage;
    use crate::tasks::model::CreateTaskInput;
    use crate::tasks::service::TaskService;
    use std::sync::Arc;

    struct Fixture {
        sync: SyncService,
        tasks: TaskService,
        store: TaskStore,
        learnings: LearningStore,
        dir: tempfile::TempDir,
    }

    async fn mk() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("tx.db")).await.unwrap();
        let learnings = LearningStore::new(
            storage.pool(),
            EventStore::new(storage.pool()),
            Arc::new(NoopEmbedding),
        );
        Fixture {
            sync: SyncService::new(
                storage.pool(),
                dir.path().join(".tx"),
                learnings.clone(),
            ),
            tasks: TaskService::new(
                TaskStore::new(storage.pool()),
                EventStore::new(storage.pool()),
                vec![TaskStatus::Ready],
            ),
            store: TaskStore::new(storage.pool()),
            learnings,
            dir,
        }
    }

    #[tokio::test]
    async fn export_then_reimport_is_all_skips() {
        let f = mk().await;
        let a = f
            .tasks
            .create(CreateTaskInput {
                title: "first".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let b = f
            .tasks
            .create(CreateTaskInput {
                title: "second".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        f.store
            .add_dependency(&a.task.id, &b.task.id, &Utc::now().to_rfc3339())
            .await
            .unwrap();

        let exported = f.sync.export_tasks(None).await.unwrap();
        assert_eq!(exported, 3); // two upserts + one dep_add

        let report = f.sync.import_tasks(None).await.unwrap();
        assert_eq!(report.imported, 0);
        assert_eq!(report.conflicts, 0);
        assert_eq!(report.skipped, 3);
        assert_eq!(report.parse_errors, 0);
    }

    #[tokio::test]
    async fn import_applies_latest_writer_only() {
        let f = mk().await;
        let path = f.dir.path().join("replay.jsonl");
        let lines = [
            r#"{"v":1,"op":"upsert","ts":"2024-01-02T00:00:00Z","id":"tx-replay01","data":{"title":"middle","score":2}}"#,
            r#"{"v":1,"op":"upsert","ts":"2024-01-03T00:00:00Z","id":"tx-replay01","data":{"title":"latest","score":3}}"#,
            r#"{"v":1,"op":"upsert","ts":"2024-01-01T00:00:00Z","id":"tx-replay01","data":{"title":"oldest","score":1}}"#,
        ];
        tokio::fs::write(&path, lines.join("\n")).await.unwrap();

        let report = f.sync.import_tasks(Some(&path)).await.unwrap();
        assert_eq!(report.imported, 1);

        let task = f.store.get("tx-replay01").await.unwrap().unwrap();
        assert_eq!(task.title, "latest");
        assert_eq!(task.score, 3);
        assert_eq!(task.updated_at, "2024-01-03T00:00:00Z");

        // Idempotent: replaying changes nothing.
        let report = f.sync.import_tasks(Some(&path)).await.unwrap();
        assert_eq!(report.imported, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn older_ops_count_as_conflicts() {
        let f = mk().await;
        let path = f.dir.path().join("old.jsonl");
        tokio::fs::write(
            &path,
            r#"{"v":1,"op":"upsert","ts":"2024-01-03T00:00:00Z","id":"tx-conflict1","data":{"title":"new"}}"#,
        )
        .await
        .unwrap();
        f.sync.import_tasks(Some(&path)).await.unwrap();

        tokio::fs::write(
            &path,
            r#"{"v":1,"op":"upsert","ts":"2024-01-01T00:00:00Z","id":"tx-conflict1","data":{"title":"stale"}}"#,
        )
        .await
        .unwrap();
        let report = f.sync.import_tasks(Some(&path)).await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(
            f.store.get("tx-conflict1").await.unwrap().unwrap().title,
            "new"
        );
    }

    #[tokio::test]
    async fn bad_lines_are_counted_not_fatal() {
        let f = mk().await;
        let path = f.dir.path().join("mixed.jsonl");
        let lines = [
            r#"{"v":1,"op":"upsert","ts":"2024-01-01T00:00:00Z","id":"tx-good0001","data":{"title":"ok"}}"#,
            "garbage",
            r#"{"v":1,"op":"nonsense","ts":"2024-01-01T00:00:00Z","id":"x"}"#,
        ];
        tokio::fs::write(&path, lines.join("\n")).await.unwrap();

        let report = f.sync.import_tasks(Some(&path)).await.unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(report.parse_errors, 2);
        assert!(f.store.get("tx-good0001").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_only_existing_rows() {
        let f = mk().await;
        let path = f.dir.path().join("del.jsonl");
        let lines = [
            r#"{"v":1,"op":"upsert","ts":"2024-01-01T00:00:00Z","id":"tx-del00001","data":{"title":"doomed"}}"#,
            r#"{"v":1,"op":"delete","ts":"2024-01-02T00:00:00Z","id":"tx-del00001"}"#,
            r#"{"v":1,"op":"delete","ts":"2024-01-02T00:00:00Z","id":"tx-never001"}"#,
        ];
        tokio::fs::write(&path, lines.join("\n")).await.unwrap();

        let report = f.sync.import_tasks(Some(&path)).await.unwrap();
        // The delete superseded the upsert in reduction; both deletes apply
        // to absent rows.
        assert_eq!(report.imported, 0);
        assert_eq!(report.skipped, 2);
        assert!(f.store.get("tx-del00001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn compact_drops_tombstones_and_shrinks() {
        let f = mk().await;
        let path = f.dir.path().join("compact.jsonl");
        let lines = [
            r#"{"v":1,"op":"upsert","ts":"2024-01-01T00:00:00Z","id":"tx-keep0001","data":{"title":"v1"}}"#,
            r#"{"v":1,"op":"upsert","ts":"2024-01-02T00:00:00Z","id":"tx-keep0001","data":{"title":"v2"}}"#,
            r#"{"v":1,"op":"upsert","ts":"2024-01-01T00:00:00Z","id":"tx-gone0001","data":{"title":"x"}}"#,
            r#"{"v":1,"op":"delete","ts":"2024-01-02T00:00:00Z","id":"tx-gone0001"}"#,
        ];
        tokio::fs::write(&path, lines.join("\n")).await.unwrap();

        let report = f.sync.compact(&path).await.unwrap();
        assert_eq!(report.before, 4);
        assert_eq!(report.after, 1);

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("v2"));
        assert!(!content.contains("tx-gone0001"));
        assert!(content.ends_with('\n'));
    }

    #[tokio::test]
    async fn learnings_round_trip_through_jsonl() {
        let f = mk().await;
        f.learnings
            .create(CreateLearningInput {
                content: "avoid N+1 queries in list endpoints".into(),
                keywords: vec!["sql".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        let exported = f.sync.export_learnings(None).await.unwrap();
        assert_eq!(exported, 1);

        let report = f.sync.import_learnings(None).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.imported, 0);
    }

    #[tokio::test]
    async fn status_reports_dirty_until_export() {
        let f = mk().await;
        f.tasks
            .create(CreateTaskInput {
                title: "dirty".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let status = f.sync.status_tasks(None).await.unwrap();
        assert!(status.dirty);
        assert_eq!(status.db_rows, 1);
        assert_eq!(status.file_ops, 0);

        f.sync.export_tasks(None).await.unwrap();
        let status = f.sync.status_tasks(None).await.unwrap();
        assert!(!status.dirty);
        assert_eq!(status.file_ops, 1);
        assert!(status.last_export.is_some());
    }

    #[tokio::test]
    async fn export_all_import_all_compose() {
        let f = mk().await;
        f.tasks
            .create(CreateTaskInput {
                title: "t".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        f.learnings
            .create(CreateLearningInput {
                content: "l".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let exported = f.sync.export_all().await.unwrap();
        assert_eq!(exported.tasks, 1);
        assert_eq!(exported.learnings, 1);

        let imported = f.sync.import_all().await.unwrap();
        assert_eq!(imported.total.imported, 0);
        assert_eq!(imported.total.skipped, 2);
    }

    #[tokio::test]
    async fn missing_file_imports_as_empty() {
        let f = mk().await;
        let report = f.sync.import_tasks(None).await.unwrap();
        assert_eq!(report, ImportReport::default());
    }
}
