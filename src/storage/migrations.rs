//! Ordered forward schema migrations.
//!
//! Every migration is additive-only and runs in its own transaction; the
//! `schema_version` table records what has been applied (`INSERT OR IGNORE`
//! makes re-runs idempotent). `Storage::open` invokes [`MigrationRunner::run`]
//! before any repository is handed out — a database behind the latest
//! version is unusable.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::Result;

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

/// The full ordered migration list. Destructive changes require a new
/// version; existing entries are frozen once shipped.
pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "tasks and task_dependencies",
        sql: r#"
CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY,
    title         TEXT NOT NULL,
    description   TEXT NOT NULL DEFAULT '',
    status        TEXT NOT NULL DEFAULT 'backlog'
                  CHECK (status IN ('backlog','ready','planning','active','blocked',
                                    'review','human_needs_to_review','done')),
    parent_id     TEXT,
    score         INTEGER NOT NULL DEFAULT 0,
    metadata      TEXT NOT NULL DEFAULT '{}',
    assignee_type TEXT CHECK (assignee_type IN ('human','agent')),
    assignee_id   TEXT,
    assigned_at   TEXT,
    assigned_by   TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    completed_at  TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);

CREATE TABLE IF NOT EXISTS task_dependencies (
    blocker_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    blocked_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    PRIMARY KEY (blocker_id, blocked_id),
    CHECK (blocker_id <> blocked_id)
);

CREATE INDEX IF NOT EXISTS idx_deps_blocked ON task_dependencies(blocked_id);
CREATE INDEX IF NOT EXISTS idx_deps_blocker ON task_dependencies(blocker_id);
"#,
    },
    Migration {
        version: 2,
        description: "workers and claims",
        sql: r#"
CREATE TABLE IF NOT EXISTS workers (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    hostname          TEXT NOT NULL DEFAULT '',
    pid               INTEGER,
    status            TEXT NOT NULL DEFAULT 'starting'
                      CHECK (status IN ('starting','idle','busy','stopping','dead')),
    registered_at     TEXT NOT NULL,
    last_heartbeat_at TEXT NOT NULL,
    current_task_id   TEXT,
    capabilities      TEXT NOT NULL DEFAULT '[]',
    metadata          TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS claims (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id          TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    worker_id        TEXT NOT NULL,
    claimed_at       TEXT NOT NULL,
    lease_expires_at TEXT NOT NULL,
    renewed_count    INTEGER NOT NULL DEFAULT 0,
    status           TEXT NOT NULL DEFAULT 'active'
                     CHECK (status IN ('active','released','expired')),
    released_at      TEXT
);

-- At most one active claim per task, enforced by the database.
CREATE UNIQUE INDEX IF NOT EXISTS idx_claims_one_active
    ON claims(task_id) WHERE status = 'active';
CREATE INDEX IF NOT EXISTS idx_claims_task ON claims(task_id, status);
CREATE INDEX IF NOT EXISTS idx_claims_lease ON claims(lease_expires_at)
    WHERE status = 'active';
"#,
    },
    Migration {
        version: 3,
        description: "runs and events",
        sql: r#"
CREATE TABLE IF NOT EXISTS runs (
    id              TEXT PRIMARY KEY,
    task_id         TEXT REFERENCES tasks(id) ON DELETE SET NULL,
    agent           TEXT NOT NULL,
    started_at      TEXT NOT NULL,
    ended_at        TEXT,
    status          TEXT NOT NULL DEFAULT 'running'
                    CHECK (status IN ('running','completed','failed','timeout','cancelled')),
    exit_code       INTEGER,
    pid             INTEGER,
    transcript_path TEXT,
    stdout_path     TEXT,
    stderr_path     TEXT,
    context_path    TEXT,
    summary         TEXT,
    error           TEXT,
    metadata        TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_runs_task ON runs(task_id);

CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT NOT NULL,
    event_type  TEXT NOT NULL
                CHECK (event_type IN ('run_started','run_completed','run_failed',
                                      'run_cancelled','task_created','task_updated',
                                      'task_completed','tool_call','tool_result',
                                      'error','learning_captured','metric')),
    run_id      TEXT,
    task_id     TEXT,
    agent       TEXT,
    tool_name   TEXT,
    content     TEXT NOT NULL DEFAULT '',
    metadata    TEXT NOT NULL DEFAULT '{}',
    duration_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id);
CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id);
"#,
    },
    Migration {
        version: 4,
        description: "learnings with fts5 mirror",
        sql: r#"
CREATE TABLE IF NOT EXISTS learnings (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    content       TEXT NOT NULL CHECK (length(trim(content)) > 0),
    source_type   TEXT NOT NULL DEFAULT 'manual'
                  CHECK (source_type IN ('compaction','run','manual','claude_md')),
    source_ref    TEXT,
    keywords      TEXT NOT NULL DEFAULT '[]',
    category      TEXT,
    usage_count   INTEGER NOT NULL DEFAULT 0,
    last_used_at  TEXT,
    outcome_score REAL NOT NULL DEFAULT 0,
    embedding     BLOB,
    run_id        TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_learnings_source ON learnings(source_type);
CREATE INDEX IF NOT EXISTS idx_learnings_run ON learnings(run_id);

CREATE VIRTUAL TABLE IF NOT EXISTS learnings_fts USING fts5(
    content, keywords, category,
    content='learnings', content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS learnings_fts_ai AFTER INSERT ON learnings BEGIN
    INSERT INTO learnings_fts(rowid, content, keywords, category)
    VALUES (new.id, new.content, new.keywords, coalesce(new.category, ''));
END;

CREATE TRIGGER IF NOT EXISTS learnings_fts_ad AFTER DELETE ON learnings BEGIN
    INSERT INTO learnings_fts(learnings_fts, rowid, content, keywords, category)
    VALUES ('delete', old.id, old.content, old.keywords, coalesce(old.category, ''));
END;

CREATE TRIGGER IF NOT EXISTS learnings_fts_au AFTER UPDATE ON learnings BEGIN
    INSERT INTO learnings_fts(learnings_fts, rowid, content, keywords, category)
    VALUES ('delete', old.id, old.content, old.keywords, coalesce(old.category, ''));
    INSERT INTO learnings_fts(rowid, content, keywords, category)
    VALUES (new.id, new.content, new.keywords, coalesce(new.category, ''));
END;
"#,
    },
    Migration {
        version: 5,
        description: "anchors and edges",
        sql: r#"
CREATE TABLE IF NOT EXISTS anchors (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    learning_id      INTEGER NOT NULL REFERENCES learnings(id) ON DELETE CASCADE,
    kind             TEXT NOT NULL CHECK (kind IN ('glob','hash','symbol','line_range')),
    file_path        TEXT NOT NULL,
    value            TEXT NOT NULL,
    content_hash     TEXT,
    symbol_fqname    TEXT,
    line_start       INTEGER,
    line_end         INTEGER,
    status           TEXT NOT NULL DEFAULT 'valid'
                     CHECK (status IN ('valid','drifted','invalid')),
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    last_verified_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_anchors_learning ON anchors(learning_id);
CREATE INDEX IF NOT EXISTS idx_anchors_file ON anchors(file_path);
CREATE INDEX IF NOT EXISTS idx_anchors_status ON anchors(status);

CREATE TABLE IF NOT EXISTS edges (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    source_kind TEXT NOT NULL CHECK (source_kind IN ('learning','file','run','task')),
    source_id   TEXT NOT NULL,
    target_kind TEXT NOT NULL CHECK (target_kind IN ('learning','file','run','task')),
    target_id   TEXT NOT NULL,
    edge_type   TEXT NOT NULL,
    weight      REAL NOT NULL DEFAULT 1.0 CHECK (weight > 0 AND weight <= 1.0),
    metadata    TEXT,
    valid       INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_kind, source_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_kind, target_id);
CREATE INDEX IF NOT EXISTS idx_edges_type ON edges(edge_type);
"#,
    },
    Migration {
        version: 6,
        description: "attempts and file_learnings",
        sql: r#"
CREATE TABLE IF NOT EXISTS attempts (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id    TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    run_id     TEXT,
    worker_id  TEXT,
    outcome    TEXT NOT NULL DEFAULT 'unknown'
               CHECK (outcome IN ('success','failure','abandoned','unknown')),
    summary    TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attempts_task ON attempts(task_id);

CREATE TABLE IF NOT EXISTS file_learnings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path   TEXT NOT NULL,
    learning_id INTEGER NOT NULL REFERENCES learnings(id) ON DELETE CASCADE,
    relevance   REAL NOT NULL DEFAULT 1.0,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_file_learnings_pair
    ON file_learnings(file_path, learning_id);
CREATE INDEX IF NOT EXISTS idx_file_learnings_file ON file_learnings(file_path);
"#,
    },
    Migration {
        version: 7,
        description: "run heartbeat state",
        sql: r#"
CREATE TABLE IF NOT EXISTS run_heartbeats (
    run_id           TEXT PRIMARY KEY REFERENCES runs(id) ON DELETE CASCADE,
    last_check_at    TEXT NOT NULL,
    last_activity_at TEXT,
    stdout_bytes     INTEGER NOT NULL DEFAULT 0,
    stderr_bytes     INTEGER NOT NULL DEFAULT 0,
    transcript_bytes INTEGER NOT NULL DEFAULT 0,
    last_delta_bytes INTEGER NOT NULL DEFAULT 0,
    updated_at       TEXT NOT NULL
);
"#,
    },
    Migration {
        version: 8,
        description: "sync_config and learnings_config",
        sql: r#"
CREATE TABLE IF NOT EXISTS sync_config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR IGNORE INTO sync_config (key, value) VALUES ('auto_sync', 'false');

CREATE TABLE IF NOT EXISTS learnings_config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR IGNORE INTO learnings_config (key, value) VALUES
    ('recall_weight_fts', '0.4'),
    ('recall_weight_vector', '0.4'),
    ('recall_weight_recency', '0.2');
"#,
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub current: i64,
    pub latest: i64,
    pub pending: Vec<i64>,
}

impl MigrationStatus {
    pub fn is_current(&self) -> bool {
        self.pending.is_empty()
    }
}

pub struct MigrationRunner {
    pool: SqlitePool,
}

impl MigrationRunner {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn ensure_version_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                 version     INTEGER PRIMARY KEY,
                 description TEXT NOT NULL,
                 applied_at  TEXT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<MigrationStatus> {
        self.ensure_version_table().await?;
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(version) FROM schema_version")
            .fetch_one(&self.pool)
            .await?;
        let current = row.0.unwrap_or(0);
        let latest = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
        let pending = MIGRATIONS
            .iter()
            .filter(|m| m.version > current)
            .map(|m| m.version)
            .collect();
        Ok(MigrationStatus {
            current,
            latest,
            pending,
        })
    }

    /// Apply every migration whose version is above the current one, in
    /// ascending order, each inside its own transaction.
    /// Returns the number of migrations applied.
    pub async fn run(&self) -> Result<u32> {
        self.ensure_version_table().await?;
        let status = self.status().await?;
        let mut applied = 0u32;

        for migration in MIGRATIONS.iter().filter(|m| m.version > status.current) {
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
            sqlx::query(
                "INSERT OR IGNORE INTO schema_version (version, description, applied_at)
                 VALUES (?, ?, ?)",
            )
            .bind(migration.version)
            .bind(migration.description)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            info!(
                version = migration.version,
                description = migration.description,
                "applied schema migration"
            );
            applied += 1;
        }

        Ok(applied)
    }
}
