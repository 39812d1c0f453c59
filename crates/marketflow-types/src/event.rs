//! Lifecycle notifications emitted by the engine.
//!
//! The set is closed: sinks can match exhaustively.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::StepStatus;
use crate::recovery::{EscalationAction, StepFailure};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: Uuid,
        workflow_name: String,
        workflow_version: u32,
    },
    /// A step reached a terminal status (completed, failed or skipped).
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    ExecutionCompleted {
        execution_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    ExecutionFailed {
        execution_id: Uuid,
        error: String,
    },
    ExecutionCancelled {
        execution_id: Uuid,
        reason: String,
    },
    RollbackCompleted {
        execution_id: Uuid,
        success: bool,
        steps_rolled_back: usize,
    },
    /// A critical failure forced the execution to `failed`.
    EmergencyRecovery {
        execution_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
        reason: String,
    },
    Escalation {
        execution_id: Uuid,
        step_id: String,
        action: EscalationAction,
        failure: StepFailure,
    },
}

impl WorkflowEvent {
    pub fn execution_id(&self) -> Uuid {
        match self {
            WorkflowEvent::ExecutionStarted { execution_id, .. }
            | WorkflowEvent::StepCompleted { execution_id, .. }
            | WorkflowEvent::ExecutionCompleted { execution_id, .. }
            | WorkflowEvent::ExecutionFailed { execution_id, .. }
            | WorkflowEvent::ExecutionCancelled { execution_id, .. }
            | WorkflowEvent::RollbackCompleted { execution_id, .. }
            | WorkflowEvent::EmergencyRecovery { execution_id, .. }
            | WorkflowEvent::Escalation { execution_id, .. } => *execution_id,
        }
    }

    /// Short event name used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::ExecutionStarted { .. } => "execution_started",
            WorkflowEvent::StepCompleted { .. } => "step_completed",
            WorkflowEvent::ExecutionCompleted { .. } => "execution_completed",
            WorkflowEvent::ExecutionFailed { .. } => "execution_failed",
            WorkflowEvent::ExecutionCancelled { .. } => "execution_cancelled",
            WorkflowEvent::RollbackCompleted { .. } => "rollback_completed",
            WorkflowEvent::EmergencyRecovery { .. } => "emergency_recovery",
            WorkflowEvent::Escalation { .. } => "escalation",
        }
    }
}
