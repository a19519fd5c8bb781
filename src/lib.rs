//! tx coordination engine: the persistent backbone for AI coding agents.
//!
//! Tracks tasks and their dependency graph, arbitrates exclusive task
//! ownership through time-bounded claims, books agent runs with
//! progress-idle reaping, captures learnings into a searchable knowledge
//! graph, and replicates everything through git-friendly JSONL logs.
//! Front-ends (CLI, tool servers, HTTP, SDKs) are thin shells over
//! [`Engine`].

pub mod claims;
pub mod config;
pub mod errors;
pub mod events;
pub mod ids;
pub mod jsontext;
pub mod knowledge;
pub mod llm;
pub mod runs;
pub mod storage;
pub mod sync;
pub mod tasks;
pub mod workers;

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use claims::ClaimCoordinator;
use config::EngineConfig;
use errors::Result;
use events::EventStore;
use knowledge::anchors::AnchorService;
use knowledge::edges::EdgeService;
use knowledge::expand::GraphExpansion;
use knowledge::file_learnings::FileLearningStore;
use knowledge::learnings::LearningStore;
use llm::embeddings::{EmbeddingProvider, NoopEmbedding};
use llm::{LlmClient, NoopLlm};
use runs::heartbeat::HeartbeatMonitor;
use runs::service::RunService;
use storage::Storage;
use sync::SyncService;
use tasks::attempts::AttemptStore;
use tasks::deps::DependencyService;
use tasks::hierarchy::HierarchyService;
use tasks::ready::ReadyService;
use tasks::service::TaskService;
use tasks::storage::TaskStore;
use workers::WorkerRegistry;

/// What startup recovery cleaned up.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub expired_claims: u64,
    pub recovered_runs: u64,
    pub dead_workers: Vec<String>,
}

/// The service graph, constructed once at startup. Every field is cheap to
/// clone (pool-backed); the database connection is the only process-wide
/// resource.
#[derive(Clone)]
pub struct Engine {
    pub config: Arc<EngineConfig>,
    pub storage: Arc<Storage>,
    pub events: EventStore,
    pub tasks: TaskService,
    pub deps: DependencyService,
    pub ready: ReadyService,
    pub hierarchy: HierarchyService,
    pub claims: ClaimCoordinator,
    pub workers: WorkerRegistry,
    pub runs: RunService,
    pub heartbeats: HeartbeatMonitor,
    pub learnings: LearningStore,
    pub anchors: AnchorService,
    pub edges: EdgeService,
    pub expansion: GraphExpansion,
    pub file_learnings: FileLearningStore,
    pub attempts: AttemptStore,
    pub sync: SyncService,
    pub llm: Arc<dyn LlmClient>,
    pub embeddings: Arc<dyn EmbeddingProvider>,
}

impl Engine {
    /// Open the engine with the no-op LLM and embedding fallbacks.
    pub async fn init(config: EngineConfig) -> Result<Self> {
        Self::init_with(config, Arc::new(NoopLlm), Arc::new(NoopEmbedding)).await
    }

    /// Open the engine with host-provided pluggable backends. Runs all
    /// pending schema migrations before any service is handed out.
    pub async fn init_with(
        config: EngineConfig,
        llm: Arc<dyn LlmClient>,
        embeddings: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config.db_path).await?);
        let pool = storage.pool();

        let events = EventStore::new(pool.clone());
        let task_store = TaskStore::new(pool.clone());
        let learnings = LearningStore::new(pool.clone(), events.clone(), embeddings.clone());
        let edges = EdgeService::new(pool.clone(), &config.extra_edge_types);

        let engine = Self {
            tasks: TaskService::new(
                task_store.clone(),
                events.clone(),
                config.ready_statuses.clone(),
            ),
            deps: DependencyService::new(task_store),
            ready: ReadyService::new(pool.clone(), config.ready_statuses.clone()),
            hierarchy: HierarchyService::new(pool.clone()),
            claims: ClaimCoordinator::new(pool.clone(), config.lease_duration_secs),
            workers: WorkerRegistry::new(pool.clone()),
            runs: RunService::new(pool.clone()),
            heartbeats: HeartbeatMonitor::new(pool.clone()),
            anchors: AnchorService::new(pool.clone()),
            expansion: GraphExpansion::new(pool.clone(), edges.clone()),
            file_learnings: FileLearningStore::new(pool.clone()),
            attempts: AttemptStore::new(pool.clone()),
            sync: SyncService::new(pool, config.sync_dir.clone(), learnings.clone()),
            edges,
            learnings,
            events,
            storage,
            config: Arc::new(config),
            llm,
            embeddings,
        };
        info!(db = %engine.config.db_path.display(), "engine initialized");
        Ok(engine)
    }

    /// Clean up after a previous process: expire lapsed claims, fail
    /// orphaned `running` runs, and sweep silent workers.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let expired_claims = self.claims.sweep_expired().await?;
        let recovered_runs = self.runs.recover_orphaned().await?;
        let dead_workers = self
            .workers
            .sweep_stale(self.config.worker_stale_secs)
            .await?;
        if expired_claims + recovered_runs + dead_workers.len() as u64 > 0 {
            info!(
                expired_claims,
                recovered_runs,
                dead_workers = dead_workers.len(),
                "startup recovery finished"
            );
        }
        Ok(RecoveryReport {
            expired_claims,
            recovered_runs,
            dead_workers,
        })
    }

    /// Periodic housekeeping: prune old events, reclaim disk.
    pub async fn maintain(&self) -> Result<u64> {
        let pruned = self
            .events
            .prune(self.config.event_retention_days)
            .await?;
        if pruned > 0 {
            self.storage.vacuum().await?;
        }
        Ok(pruned)
    }
}
