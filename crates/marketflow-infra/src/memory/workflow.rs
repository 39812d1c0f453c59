//! In-memory workflow store.
//!
//! Implements `PersistenceStore` from `marketflow-core` on `DashMap`s.
//! Definitions are kept per id in a version-ordered map, executions are
//! upserted whole, and checkpoints are appended per execution with a side
//! index for lookup by checkpoint id. Nothing survives the process.

use std::collections::BTreeMap;

use dashmap::DashMap;
use marketflow_core::repository::PersistenceStore;
use marketflow_types::error::RepositoryError;
use marketflow_types::execution::{Checkpoint, Execution};
use marketflow_types::workflow::WorkflowDefinition;
use uuid::Uuid;

/// `DashMap`-backed implementation of `PersistenceStore`.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    definitions: DashMap<Uuid, BTreeMap<u32, WorkflowDefinition>>,
    executions: DashMap<Uuid, Execution>,
    /// execution id -> checkpoints, oldest first
    checkpoints: DashMap<Uuid, Vec<Checkpoint>>,
    /// checkpoint id -> execution id
    checkpoint_owners: DashMap<Uuid, Uuid>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored executions.
    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }
}

impl PersistenceStore for InMemoryWorkflowStore {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut versions = self.definitions.entry(def.id).or_default();
        if versions.contains_key(&def.version) {
            return Err(RepositoryError::Conflict(format!(
                "workflow {} version {} already exists",
                def.id, def.version
            )));
        }
        versions.insert(def.version, def.clone());
        tracing::debug!(workflow_id = %def.id, version = def.version, "stored workflow definition");
        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .definitions
            .get(id)
            .and_then(|versions| versions.get(&version).cloned()))
    }

    async fn get_latest_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .definitions
            .get(id)
            .and_then(|versions| versions.values().next_back().cloned()))
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut latest: Vec<WorkflowDefinition> = self
            .definitions
            .iter()
            .filter_map(|entry| entry.value().values().next_back().cloned())
            .collect();
        latest.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(latest)
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    async fn save_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.get(id).map(|e| e.value().clone()))
    }

    async fn list_executions(&self, workflow_id: &Uuid, limit: u32) -> Result<Vec<Execution>, RepositoryError> {
        let mut matching: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| e.workflow_id == *workflow_id)
            .map(|e| e.value().clone())
            .collect();
        // v7 ids sort by creation time
        matching.sort_by(|a, b| b.id.cmp(&a.id));
        matching.truncate(limit as usize);
        Ok(matching)
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        if self.checkpoint_owners.contains_key(&checkpoint.id) {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {} already exists",
                checkpoint.id
            )));
        }
        self.checkpoint_owners
            .insert(checkpoint.id, checkpoint.execution_id);
        self.checkpoints
            .entry(checkpoint.execution_id)
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        let Some(execution_id) = self.checkpoint_owners.get(id).map(|owner| *owner.value()) else {
            return Ok(None);
        };
        Ok(self
            .checkpoints
            .get(&execution_id)
            .and_then(|list| list.iter().find(|c| c.id == *id).cloned()))
    }

    async fn list_checkpoints(&self, execution_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        Ok(self
            .checkpoints
            .get(execution_id)
            .map(|list| list.value().clone())
            .unwrap_or_default())
    }
}
