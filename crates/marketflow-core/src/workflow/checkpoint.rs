//! Checkpoint manager for execution snapshots.
//!
//! Wraps a `PersistenceStore` to record append-only snapshots of an
//! execution. A checkpoint is taken when an execution starts and immediately
//! before every rollback attempt; the most recent one is authoritative.

use std::sync::Arc;

use chrono::Utc;
use marketflow_types::execution::{Checkpoint, CheckpointReason, CheckpointSnapshot};
use uuid::Uuid;

use crate::repository::workflow::PersistenceStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Records and retrieves execution checkpoints.
///
/// Generic over `S: PersistenceStore` so it works with any storage backend.
pub struct CheckpointManager<S: PersistenceStore> {
    store: Arc<S>,
}

impl<S: PersistenceStore> CheckpointManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Persist a snapshot and return the new checkpoint id.
    pub async fn create_checkpoint(
        &self,
        execution_id: Uuid,
        snapshot: CheckpointSnapshot,
    ) -> Result<Uuid, CheckpointError> {
        let checkpoint = Checkpoint {
            id: Uuid::now_v7(),
            execution_id,
            snapshot,
            created_at: Utc::now(),
        };

        self.store
            .append_checkpoint(&checkpoint)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %execution_id,
            checkpoint_id = %checkpoint.id,
            reason = ?checkpoint.snapshot.reason,
            completed = checkpoint.snapshot.completed_steps.len(),
            "checkpoint created"
        );

        Ok(checkpoint.id)
    }

    /// The most recent checkpoint of an execution.
    pub async fn latest(&self, execution_id: Uuid) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.list(execution_id).await?.pop())
    }

    /// The most recent checkpoint not taken for a rollback attempt.
    ///
    /// This is the state a `checkpoint` rollback target restores.
    pub async fn latest_baseline(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .list(execution_id)
            .await?
            .into_iter()
            .rev()
            .find(|c| c.snapshot.reason != CheckpointReason::PreRollback))
    }

    /// Historical retrieval by checkpoint id.
    pub async fn get(&self, checkpoint_id: Uuid) -> Result<Option<Checkpoint>, CheckpointError> {
        self.store
            .get_checkpoint(&checkpoint_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// All checkpoints of an execution, oldest first.
    pub async fn list(&self, execution_id: Uuid) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.store
            .list_checkpoints(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("checkpoint not found: {0}")]
    NotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
