//! Workflow persistence port.
//!
//! Defines the storage interface for workflow definitions, executions and
//! checkpoints. The infrastructure layer (marketflow-infra) implements it.

use marketflow_types::error::RepositoryError;
use marketflow_types::execution::{Checkpoint, Execution};
use marketflow_types::workflow::WorkflowDefinition;
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Definitions:** versioned; a save never overwrites an existing version.
/// - **Executions:** full-record upserts written by the coordinator.
/// - **Checkpoints:** append-only snapshots per execution.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait PersistenceStore: Send + Sync + 'static {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Store a definition version. Fails with `Conflict` if `(id, version)`
    /// already exists.
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a specific version of a definition.
    fn get_definition(
        &self,
        id: &Uuid,
        version: u32,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Get the highest stored version of a definition.
    fn get_latest_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Latest version of every stored definition.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Insert or replace an execution record.
    fn save_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Executions of a workflow, newest first.
    fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Append a checkpoint.
    fn append_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_checkpoint(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// All checkpoints of an execution, oldest first.
    fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;
}
