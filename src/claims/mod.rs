//! Claim coordinator: at most one worker owns a task at a time.
//!
//! The winner is decided by the database. A claim transaction fails fast
//! when an active claim is visible, and the partial unique index on
//! `claims(task_id) WHERE status = 'active'` closes the TOCTOU window
//! between the read and the insert: the racer that loses the insert gets a
//! constraint violation, which is surfaced as `AlreadyClaimed` with the
//! winner's worker id.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use crate::errors::{Result, TxError};

/// Default lease window: 30 minutes.
pub const DEFAULT_LEASE_SECS: i64 = 30 * 60;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ClaimStatus {
    Active,
    Released,
    Expired,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub id: i64,
    pub task_id: String,
    pub worker_id: String,
    pub claimed_at: String,
    pub lease_expires_at: String,
    pub renewed_count: i64,
    pub status: ClaimStatus,
    pub released_at: Option<String>,
}

#[derive(Clone)]
pub struct ClaimCoordinator {
    pool: SqlitePool,
    lease_secs: i64,
}

impl ClaimCoordinator {
    pub fn new(pool: SqlitePool, lease_secs: i64) -> Self {
        Self { pool, lease_secs }
    }

    /// Acquire an exclusive claim on `task_id` for `worker_id`.
    ///
    /// Under any number of concurrent callers exactly one receives a fresh
    /// active claim; the rest fail with [`TxError::AlreadyClaimed`] carrying
    /// the winning worker id.
    pub async fn claim(&self, task_id: &str, worker_id: &str) -> Result<Claim> {
        // A losing racer surfaces as a unique violation on the partial
        // index or as a stale-snapshot write error, depending on when the
        // winner commits. Either way: if a winner is visible, name it;
        // otherwise retry — the next attempt sees the winner or takes the
        // claim itself.
        const ATTEMPTS: u32 = 3;
        for attempt in 1..=ATTEMPTS {
            match self.try_claim(task_id, worker_id).await {
                Ok(claim) => return Ok(claim),
                Err(err @ TxError::Database(_)) => {
                    if let Some(winner) = self.active_claim(task_id).await? {
                        return Err(TxError::AlreadyClaimed {
                            task_id: task_id.to_string(),
                            claimed_by: winner.worker_id,
                        });
                    }
                    if attempt == ATTEMPTS {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("claim attempts always return")
    }

    async fn try_claim(&self, task_id: &str, worker_id: &str) -> Result<Claim> {
        let mut tx = self.pool.begin().await?;

        let task_exists: (i64,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?)")
                .bind(task_id)
                .fetch_one(&mut *tx)
                .await?;
        if task_exists.0 == 0 {
            return Err(TxError::TaskNotFound {
                id: task_id.to_string(),
            });
        }

        // Fail fast when an active claim is already visible.
        let existing: Option<Claim> =
            sqlx::query_as("SELECT * FROM claims WHERE task_id = ? AND status = 'active'")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(existing) = existing {
            return Err(TxError::AlreadyClaimed {
                task_id: task_id.to_string(),
                claimed_by: existing.worker_id,
            });
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO claims
             (task_id, worker_id, claimed_at, lease_expires_at, renewed_count, status)
             VALUES (?, ?, ?, ?, 0, 'active')",
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(now.to_rfc3339())
        .bind((now + Duration::seconds(self.lease_secs)).to_rfc3339())
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();
        tx.commit().await?;

        debug!(task_id = %task_id, worker_id = %worker_id, claim_id = id, "task claimed");
        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Claim> {
        sqlx::query_as("SELECT * FROM claims WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TxError::ClaimNotFound { id })
    }

    pub async fn active_claim(&self, task_id: &str) -> Result<Option<Claim>> {
        Ok(
            sqlx::query_as("SELECT * FROM claims WHERE task_id = ? AND status = 'active'")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn claims_for_task(&self, task_id: &str) -> Result<Vec<Claim>> {
        Ok(
            sqlx::query_as("SELECT * FROM claims WHERE task_id = ? ORDER BY claimed_at ASC, id ASC")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Extend the lease of an active claim the caller owns.
    pub async fn renew(&self, claim_id: i64, worker_id: &str) -> Result<Claim> {
        let claim = self.get(claim_id).await?;
        let expires = (Utc::now() + Duration::seconds(self.lease_secs)).to_rfc3339();
        let result = sqlx::query(
            "UPDATE claims
             SET lease_expires_at = ?, renewed_count = renewed_count + 1
             WHERE id = ? AND worker_id = ? AND status = 'active'",
        )
        .bind(&expires)
        .bind(claim_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TxError::ClaimNotOwned {
                task_id: claim.task_id,
                worker_id: worker_id.to_string(),
            });
        }
        self.get(claim_id).await
    }

    /// Release the caller's active claim on a task.
    pub async fn release(&self, task_id: &str, worker_id: &str) -> Result<Claim> {
        let result = sqlx::query(
            "UPDATE claims
             SET status = 'released', released_at = ?
             WHERE task_id = ? AND worker_id = ? AND status = 'active'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(TxError::ClaimNotOwned {
                task_id: task_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        // The row just released is the latest one for this worker.
        Ok(sqlx::query_as(
            "SELECT * FROM claims WHERE task_id = ? AND worker_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(task_id)
        .bind(worker_id)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Mark a claim expired. Expiring a released/expired claim is a no-op.
    pub async fn expire(&self, claim_id: i64) -> Result<()> {
        // Existence check first so a bad id is still an error.
        self.get(claim_id).await?;
        sqlx::query("UPDATE claims SET status = 'expired' WHERE id = ? AND status = 'active'")
            .bind(claim_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Expire the active claim on a task, if any. Returns the expired claim.
    pub async fn expire_active_for_task(&self, task_id: &str) -> Result<Option<Claim>> {
        let active = self.active_claim(task_id).await?;
        if let Some(ref claim) = active {
            self.expire(claim.id).await?;
        }
        Ok(active)
    }

    /// Expire every active claim whose lease has lapsed.
    /// Returns the number of claims expired.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE claims SET status = 'expired'
             WHERE status = 'active' AND lease_expires_at < ?",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::tasks::model::{Task, TaskStatus};
    use crate::tasks::storage::TaskStore;

    async fn mk() -> (ClaimCoordinator, TaskStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("tx.db")).await.unwrap();
        (
            ClaimCoordinator::new(storage.pool(), DEFAULT_LEASE_SECS),
            TaskStore::new(storage.pool()),
            dir,
        )
    }

    async fn seed(store: &TaskStore, id: &str) {
        let now = Utc::now().to_rfc3339();
        store
            .insert(&Task {
                id: id.to_string(),
                title: id.to_string(),
                description: String::new(),
                status: TaskStatus::Ready,
                parent_id: None,
                score: 0,
                metadata: "{}".into(),
                assignee_type: None,
                assignee_id: None,
                assigned_at: None,
                assigned_by: None,
                created_at: now.clone(),
                updated_at: now,
                completed_at: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn second_claim_names_the_winner() {
        let (claims, store, _dir) = mk().await;
        seed(&store, "tx-clm0000a").await;

        let won = claims.claim("tx-clm0000a", "w1").await.unwrap();
        assert_eq!(won.status, ClaimStatus::Active);
        assert_eq!(won.renewed_count, 0);

        let err = claims.claim("tx-clm0000a", "w2").await.unwrap_err();
        match err {
            TxError::AlreadyClaimed { claimed_by, .. } => assert_eq!(claimed_by, "w1"),
            other => panic!("expected AlreadyClaimed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn released_and_expired_tasks_can_be_reclaimed() {
        let (claims, store, _dir) = mk().await;
        seed(&store, "tx-clm0000b").await;

        claims.claim("tx-clm0000b", "w1").await.unwrap();
        let released = claims.release("tx-clm0000b", "w1").await.unwrap();
        assert_eq!(released.status, ClaimStatus::Released);
        assert!(released.released_at.is_some());

        let second = claims.claim("tx-clm0000b", "w2").await.unwrap();
        claims.expire(second.id).await.unwrap();
        // Expire is idempotent.
        claims.expire(second.id).await.unwrap();

        claims.claim("tx-clm0000b", "w3").await.unwrap();
        let history = claims.claims_for_task("tx-clm0000b").await.unwrap();
        assert_eq!(history.len(), 3);
        let active: Vec<_> = history
            .iter()
            .filter(|c| c.status == ClaimStatus::Active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].worker_id, "w3");
    }

    #[tokio::test]
    async fn renew_extends_and_counts() {
        let (claims, store, _dir) = mk().await;
        seed(&store, "tx-clm0000c").await;
        let claim = claims.claim("tx-clm0000c", "w1").await.unwrap();

        let renewed = claims.renew(claim.id, "w1").await.unwrap();
        assert_eq!(renewed.renewed_count, 1);
        assert!(renewed.lease_expires_at >= claim.lease_expires_at);

        // A stranger cannot renew.
        assert!(matches!(
            claims.renew(claim.id, "w2").await.unwrap_err(),
            TxError::ClaimNotOwned { .. }
        ));

        // Nor can the owner after release.
        claims.release("tx-clm0000c", "w1").await.unwrap();
        assert!(matches!(
            claims.renew(claim.id, "w1").await.unwrap_err(),
            TxError::ClaimNotOwned { .. }
        ));
    }

    #[tokio::test]
    async fn release_requires_ownership() {
        let (claims, store, _dir) = mk().await;
        seed(&store, "tx-clm0000d").await;
        claims.claim("tx-clm0000d", "w1").await.unwrap();

        assert!(matches!(
            claims.release("tx-clm0000d", "w2").await.unwrap_err(),
            TxError::ClaimNotOwned { .. }
        ));
    }

    #[tokio::test]
    async fn sweep_expires_lapsed_leases_only() {
        let (claims, store, _dir) = mk().await;
        seed(&store, "tx-clm0000e").await;
        seed(&store, "tx-clm0000f").await;

        let lapsed = claims.claim("tx-clm0000e", "w1").await.unwrap();
        claims.claim("tx-clm0000f", "w2").await.unwrap();

        // Backdate one lease past expiry.
        sqlx::query("UPDATE claims SET lease_expires_at = ? WHERE id = ?")
            .bind((Utc::now() - Duration::seconds(10)).to_rfc3339())
            .bind(lapsed.id)
            .execute(&claims.pool)
            .await
            .unwrap();

        assert_eq!(claims.sweep_expired().await.unwrap(), 1);
        assert_eq!(claims.get(lapsed.id).await.unwrap().status, ClaimStatus::Expired);
        assert!(claims.active_claim("tx-clm0000f").await.unwrap().is_some());

        // The lapsed task is claimable again.
        claims.claim("tx-clm0000e", "w3").await.unwrap();
    }

    #[tokio::test]
    async fn claim_race_has_exactly_one_winner() {
        let (claims, store, _dir) = mk().await;
        seed(&store, "tx-race0001").await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let claims = claims.clone();
            handles.push(tokio::spawn(async move {
                claims.claim("tx-race0001", &format!("w{i}")).await
            }));
        }

        let mut winners = 0;
        let mut losers = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(TxError::AlreadyClaimed { .. }) => losers += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(losers, 4);

        let active: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM claims WHERE task_id = 'tx-race0001' AND status = 'active'",
        )
        .fetch_one(&claims.pool)
        .await
        .unwrap();
        assert_eq!(active.0, 1);
    }
}
