pub mod migrations;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::errors::Result;
use self::migrations::MigrationRunner;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Embedded SQLite store shared by every repository.
///
/// WAL journal mode gives readers a consistent snapshot while one writer
/// commits; `busy_timeout` serializes concurrent writers at the storage
/// layer. Foreign keys are ON so the cascade/set-null ownership rules in
/// the schema are enforced by the database itself.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (creating if missing) the database at `db_path` and bring the
    /// schema current. Migration failure is fatal: no repository may touch
    /// a database that is behind the latest schema version.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))
                .map_err(sqlx::Error::from)?
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(BUSY_TIMEOUT)
                .foreign_keys(true)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await.map_err(sqlx::Error::from)?;
        MigrationRunner::new(pool.clone()).run().await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    /// Repositories share the same underlying SQLite connections.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Run SQLite VACUUM to reclaim disk space after pruning.
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_db_and_applies_schema() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("tx.db")).await.unwrap();

        // A core table from the first migration must exist.
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(&storage.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("tx.db")).await.unwrap();

        let result = sqlx::query(
            "INSERT INTO task_dependencies (blocker_id, blocked_id, created_at)
             VALUES ('tx-missing1', 'tx-missing2', '2024-01-01T00:00:00Z')",
        )
        .execute(&storage.pool())
        .await;
        assert!(result.is_err(), "orphan dependency row must be rejected");
    }

    #[tokio::test]
    async fn reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.db");
        drop(Storage::open(&path).await.unwrap());
        // Second open re-runs the migration runner against an up-to-date db.
        Storage::open(&path).await.unwrap();
    }
}
