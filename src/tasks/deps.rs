//! Blocker management with cycle prevention.

use chrono::Utc;
use tracing::debug;

use crate::errors::{Result, TxError};
use crate::tasks::model::Task;
use crate::tasks::storage::TaskStore;

#[derive(Clone)]
pub struct DependencyService {
    store: TaskStore,
}

impl DependencyService {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }

    /// Make `blocker_id` block `blocked_id`.
    ///
    /// Rejects self-blocks, missing tasks, and any edge that would close a
    /// directed cycle: if `blocked_id` is already a transitive blocker of
    /// `blocker_id`, the new edge completes a loop.
    pub async fn add_blocker(&self, blocked_id: &str, blocker_id: &str) -> Result<()> {
        if blocked_id == blocker_id {
            return Err(TxError::validation(
                "blockerId",
                "a task cannot block itself",
            ));
        }
        for id in [blocked_id, blocker_id] {
            if self.store.get(id).await?.is_none() {
                return Err(TxError::TaskNotFound { id: id.to_string() });
            }
        }
        if self.store.blocker_reachable(blocker_id, blocked_id).await? {
            return Err(TxError::CircularDependency {
                blocked_id: blocked_id.to_string(),
                blocker_id: blocker_id.to_string(),
            });
        }

        self.store
            .add_dependency(blocker_id, blocked_id, &Utc::now().to_rfc3339())
            .await?;
        debug!(blocker = %blocker_id, blocked = %blocked_id, "blocker added");
        Ok(())
    }

    /// Idempotent removal; an absent pair is not an error.
    pub async fn remove_blocker(&self, blocked_id: &str, blocker_id: &str) -> Result<()> {
        self.store.remove_dependency(blocker_id, blocked_id).await?;
        Ok(())
    }

    /// Tasks blocking `id` (any status).
    pub async fn blockers(&self, id: &str) -> Result<Vec<Task>> {
        if self.store.get(id).await?.is_none() {
            return Err(TxError::TaskNotFound { id: id.to_string() });
        }
        self.store.blockers_of(id).await
    }

    /// Tasks that `id` blocks.
    pub async fn blocking(&self, id: &str) -> Result<Vec<Task>> {
        if self.store.get(id).await?.is_none() {
            return Err(TxError::TaskNotFound { id: id.to_string() });
        }
        self.store.blocked_by(id).await
    }
}
