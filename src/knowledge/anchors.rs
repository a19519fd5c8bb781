//! Anchors: typed bindings from learnings to file locations.
//!
//! Creation validates the kind-specific fields; verification recomputes the
//! anchor's truth against the file system. Verification is non-destructive:
//! an unreadable file never downgrades status, only genuine drift evidence
//! does.

use std::path::Path;

use chrono::Utc;
use globset::GlobBuilder;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::debug;

use crate::errors::{Result, TxError};
use crate::knowledge::model::{Anchor, AnchorKind, AnchorStatus, CreateAnchorInput};

static HASH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{64}$").unwrap());
static SYMBOL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.+::[A-Za-z_][A-Za-z0-9_]*$").unwrap());

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySummary {
    pub valid: u32,
    pub drifted: u32,
    pub invalid: u32,
}

#[derive(Clone)]
pub struct AnchorService {
    pool: SqlitePool,
}

impl AnchorService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ─── Creation ─────────────────────────────────────────────────────────────

    pub async fn create_anchor(&self, input: CreateAnchorInput) -> Result<Anchor> {
        let kind = input.kind.unwrap_or(AnchorKind::Glob);
        if input.file_path.trim().is_empty() {
            return Err(TxError::validation("filePath", "must not be empty"));
        }

        let learning_exists: (i64,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM learnings WHERE id = ?)")
                .bind(input.learning_id)
                .fetch_one(&self.pool)
                .await?;
        if learning_exists.0 == 0 {
            return Err(TxError::LearningNotFound {
                id: input.learning_id,
            });
        }

        let mut content_hash: Option<String> = None;
        let mut symbol_fqname: Option<String> = None;
        let mut line_start = input.line_start;
        let mut line_end = input.line_end;

        match kind {
            AnchorKind::Glob => {
                if input.value.trim().is_empty() {
                    return Err(TxError::validation("value", "glob pattern must not be empty"));
                }
                line_start = None;
                line_end = None;
            }
            AnchorKind::Hash => {
                if !HASH_RE.is_match(&input.value) {
                    return Err(TxError::validation(
                        "value",
                        "must be 64 lowercase hex chars (sha-256)",
                    ));
                }
                content_hash = Some(input.value.clone());
                validate_line_range(line_start, line_end, false)?;
            }
            AnchorKind::Symbol => {
                let fqname = input.symbol_fqname.as_deref().unwrap_or(&input.value);
                if !SYMBOL_RE.is_match(fqname) {
                    return Err(TxError::validation(
                        "symbolFqname",
                        "must have the form <path>::<name>",
                    ));
                }
                symbol_fqname = Some(fqname.to_string());
                line_start = None;
                line_end = None;
            }
            AnchorKind::LineRange => {
                validate_line_range(line_start, line_end, true)?;
            }
        }

        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO anchors
             (learning_id, kind, file_path, value, content_hash, symbol_fqname,
              line_start, line_end, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'valid', ?, ?)",
        )
        .bind(input.learning_id)
        .bind(kind)
        .bind(&input.file_path)
        .bind(&input.value)
        .bind(&content_hash)
        .bind(&symbol_fqname)
        .bind(line_start)
        .bind(line_end)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        debug!(anchor_id = result.last_insert_rowid(), ?kind, "anchor created");
        self.get(result.last_insert_rowid()).await
    }

    pub async fn get(&self, id: i64) -> Result<Anchor> {
        sqlx::query_as("SELECT * FROM anchors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TxError::AnchorNotFound { id })
    }

    /// Soft delete: the row stays, status drops to `invalid`.
    pub async fn remove(&self, id: i64) -> Result<()> {
        self.update_anchor_status(id, AnchorStatus::Invalid).await
    }

    pub async fn update_anchor_status(&self, id: i64, status: AnchorStatus) -> Result<()> {
        let result = sqlx::query("UPDATE anchors SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TxError::AnchorNotFound { id });
        }
        Ok(())
    }

    // ─── Queries ──────────────────────────────────────────────────────────────

    pub async fn find_anchors_for_file(&self, path: &str) -> Result<Vec<Anchor>> {
        Ok(
            sqlx::query_as("SELECT * FROM anchors WHERE file_path = ? ORDER BY id ASC")
                .bind(path)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn find_anchors_for_learning(&self, learning_id: i64) -> Result<Vec<Anchor>> {
        Ok(
            sqlx::query_as("SELECT * FROM anchors WHERE learning_id = ? ORDER BY id ASC")
                .bind(learning_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn find_drifted(&self) -> Result<Vec<Anchor>> {
        Ok(
            sqlx::query_as("SELECT * FROM anchors WHERE status = 'drifted' ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn find_invalid(&self) -> Result<Vec<Anchor>> {
        Ok(
            sqlx::query_as("SELECT * FROM anchors WHERE status = 'invalid' ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    // ─── Verification ─────────────────────────────────────────────────────────

    /// Recompute one anchor's status against the file system.
    pub async fn verify_anchor(&self, id: i64) -> Result<Anchor> {
        let anchor = self.get(id).await?;
        let next = self.recheck(&anchor).await;
        let now = Utc::now().to_rfc3339();
        match next {
            Some(status) => {
                sqlx::query(
                    "UPDATE anchors SET status = ?, updated_at = ?, last_verified_at = ? WHERE id = ?",
                )
                .bind(status)
                .bind(&now)
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                // I/O failure: leave status as-is, only stamp the attempt.
                sqlx::query("UPDATE anchors SET last_verified_at = ? WHERE id = ?")
                    .bind(&now)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        self.get(id).await
    }

    /// Verify every anchor bound to `path`; returns counts by resulting
    /// status.
    pub async fn verify_anchors_for_file(&self, path: &str) -> Result<VerifySummary> {
        let anchors = self.find_anchors_for_file(path).await?;
        let mut summary = VerifySummary::default();
        for anchor in anchors {
            let verified = self.verify_anchor(anchor.id).await?;
            match verified.status {
                AnchorStatus::Valid => summary.valid += 1,
                AnchorStatus::Drifted => summary.drifted += 1,
                AnchorStatus::Invalid => summary.invalid += 1,
            }
        }
        Ok(summary)
    }

    /// `Some(status)` when the file system gave an answer, `None` on an
    /// unreadable file (non-destructive).
    async fn recheck(&self, anchor: &Anchor) -> Option<AnchorStatus> {
        match anchor.kind {
            AnchorKind::Glob => {
                let glob = match GlobBuilder::new(&anchor.value)
                    .literal_separator(true)
                    .build()
                {
                    Ok(g) => g.compile_matcher(),
                    Err(_) => return Some(AnchorStatus::Invalid),
                };
                if !glob.is_match(&anchor.file_path) {
                    return Some(AnchorStatus::Drifted);
                }
                match tokio::fs::try_exists(&anchor.file_path).await {
                    Ok(true) => Some(AnchorStatus::Valid),
                    Ok(false) => Some(AnchorStatus::Drifted),
                    Err(_) => None,
                }
            }
            AnchorKind::Hash => {
                let expected = anchor.content_hash.as_deref()?;
                match read_file(&anchor.file_path).await {
                    FileRead::Content(text) => {
                        let subject = match (anchor.line_start, anchor.line_end) {
                            (Some(start), Some(end)) => {
                                slice_lines(&text, start, end).unwrap_or_default()
                            }
                            _ => text,
                        };
                        let digest = hex::encode(Sha256::digest(subject.as_bytes()));
                        Some(if digest == expected {
                            AnchorStatus::Valid
                        } else {
                            AnchorStatus::Drifted
                        })
                    }
                    FileRead::Missing => Some(AnchorStatus::Drifted),
                    FileRead::Unreadable => None,
                }
            }
            AnchorKind::Symbol => {
                let fqname = anchor.symbol_fqname.as_deref().unwrap_or(&anchor.value);
                let name = fqname.rsplit("::").next().unwrap_or(fqname);
                match read_file(&anchor.file_path).await {
                    FileRead::Content(text) => Some(if text.contains(name) {
                        AnchorStatus::Valid
                    } else {
                        AnchorStatus::Drifted
                    }),
                    FileRead::Missing => Some(AnchorStatus::Drifted),
                    FileRead::Unreadable => None,
                }
            }
            AnchorKind::LineRange => {
                let end = anchor.line_end?;
                match read_file(&anchor.file_path).await {
                    FileRead::Content(text) => {
                        let lines = text.lines().count() as i64;
                        Some(if lines >= end {
                            AnchorStatus::Valid
                        } else {
                            AnchorStatus::Drifted
                        })
                    }
                    FileRead::Missing => Some(AnchorStatus::Drifted),
                    FileRead::Unreadable => None,
                }
            }
        }
    }
}

fn validate_line_range(start: Option<i64>, end: Option<i64>, required: bool) -> Result<()> {
    match (start, end) {
        (None, None) if !required => Ok(()),
        (Some(s), Some(e)) => {
            if s < 1 {
                Err(TxError::validation("lineStart", "must be at least 1"))
            } else if e < s {
                Err(TxError::validation("lineEnd", "must be >= lineStart"))
            } else {
                Ok(())
            }
        }
        _ => Err(TxError::validation(
            "lineStart",
            "lineStart and lineEnd must be provided together",
        )),
    }
}

/// 1-based inclusive line slice, joined with newlines.
fn slice_lines(text: &str, start: i64, end: i64) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = usize::try_from(start).ok()?.checked_sub(1)?;
    let end = usize::try_from(end).ok()?;
    if start >= lines.len() {
        return None;
    }
    Some(lines[start..end.min(lines.len())].join("\n"))
}

enum FileRead {
    Content(String),
    Missing,
    Unreadable,
}

async fn read_file(path: &str) -> FileRead {
    match tokio::fs::read_to_string(Path::new(path)).await {
        Ok(text) => FileRead::Content(text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => FileRead::Missing,
        Err(_) => FileRead::Unreadable,
    }
}
