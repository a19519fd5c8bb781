//! Engine configuration.
//!
//! Priority: env var > `{data_dir}/config.toml` > built-in default. All
//! fields in the TOML file are optional overrides.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{error, warn};

use crate::claims::DEFAULT_LEASE_SECS;
use crate::tasks::model::TaskStatus;
use crate::tasks::ready::DEFAULT_READY_STATUSES;

const DB_FILE: &str = "tx.db";
const DEFAULT_EVENT_RETENTION_DAYS: u32 = 30;
const DEFAULT_WORKER_STALE_SECS: i64 = 300;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Claim lease window in seconds (default: 1800).
    lease_duration_secs: Option<i64>,
    /// Statuses the ready service treats as work-capable (default: ["ready"]).
    ready_statuses: Option<Vec<String>>,
    /// Additional edge types beyond the built-in vocabulary.
    extra_edge_types: Option<Vec<String>>,
    /// How many days of events to keep before pruning (default: 30; 0 = never).
    event_retention_days: Option<u32>,
    /// Seconds without a heartbeat before a worker is swept dead (default: 300).
    worker_stale_secs: Option<i64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── EngineConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the database, config file, and sync logs.
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// Where the JSONL replication logs live (defaults to `data_dir`).
    pub sync_dir: PathBuf,
    pub lease_duration_secs: i64,
    pub ready_statuses: Vec<TaskStatus>,
    pub extra_edge_types: Vec<String>,
    pub event_retention_days: u32,
    pub worker_stale_secs: i64,
}

impl EngineConfig {
    /// Standard layout: everything under `<project root>/.tx/`.
    pub fn for_project(root: &Path) -> Self {
        let data_dir = match std::env::var("TX_DATA_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => root.join(".tx"),
        };
        Self::with_data_dir(data_dir)
    }

    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        let toml = load_toml(&data_dir).unwrap_or_default();

        let lease_duration_secs = std::env::var("TX_LEASE_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .or(toml.lease_duration_secs)
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_LEASE_SECS);

        let ready_statuses = match toml.ready_statuses {
            Some(raw) => {
                let parsed: Vec<TaskStatus> = raw
                    .iter()
                    .filter_map(|s| {
                        let status = TaskStatus::parse(s);
                        if status.is_none() {
                            warn!(status = %s, "ignoring unknown ready status in config.toml");
                        }
                        status
                    })
                    .collect();
                if parsed.is_empty() {
                    DEFAULT_READY_STATUSES.to_vec()
                } else {
                    parsed
                }
            }
            None => DEFAULT_READY_STATUSES.to_vec(),
        };

        Self {
            db_path: data_dir.join(DB_FILE),
            sync_dir: data_dir.clone(),
            lease_duration_secs,
            ready_statuses,
            extra_edge_types: toml.extra_edge_types.unwrap_or_default(),
            event_retention_days: toml
                .event_retention_days
                .unwrap_or(DEFAULT_EVENT_RETENTION_DAYS),
            worker_stale_secs: toml
                .worker_stale_secs
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_WORKER_STALE_SECS),
            data_dir,
        }
    }
}
