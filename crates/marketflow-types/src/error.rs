use thiserror::Error;

use crate::execution::{ExecutionStatus, StepStatus};

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage unavailable")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// An illegal state-machine edge was requested.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid execution transition: {from} -> {to}")]
    Execution {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("invalid step transition for '{step_id}': {from} -> {to}")]
    Step {
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("unknown step '{0}'")]
    UnknownStep(String),
}
