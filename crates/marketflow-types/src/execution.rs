//! Execution state for MarketFlow workflows.
//!
//! An [`Execution`] is one run of a [`WorkflowDefinition`] version. It is
//! owned and mutated by a single coordinator task; every status change goes
//! through [`Execution::transition`] or the step helpers so that illegal
//! edges are rejected and recorded transitions stay complete.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TransitionError;
use crate::recovery::{ErrorKind, Severity, StepFailure};
use crate::workflow::{CompensatingAction, RollbackKind, StepKind, WorkflowDefinition};

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::RolledBack => "rolled_back",
        }
    }

    /// Whether the execution has stopped making forward progress.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    /// Whether a rollback may be requested from this status.
    pub fn is_rollback_eligible(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Failed | ExecutionStatus::Cancelled | ExecutionStatus::Running
        )
    }

    /// Legal edges of the execution state machine.
    ///
    /// `failed`/`cancelled` may still move to `rolled_back` (or `failed`, for
    /// an unsuccessful rollback of a cancelled run).
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, RolledBack)
                | (Failed, RolledBack)
                | (Cancelled, RolledBack)
                | (Cancelled, Failed)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One run of a workflow definition version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: u32,
    pub workflow_name: String,
    pub actor_id: String,
    pub session_id: String,
    pub params: Value,
    /// Ambient context resolved at start.
    #[serde(default)]
    pub context: Value,
    pub status: ExecutionStatus,
    /// Results keyed by step id, one per step including group members.
    pub step_results: BTreeMap<String, StepResult>,
    #[serde(default)]
    pub error_log: Vec<ErrorLogEntry>,
    #[serde(default)]
    pub rollback_history: Vec<RollbackRecord>,
    #[serde(default)]
    pub rollback_attempts: Vec<RollbackAttempt>,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Next completion sequence number handed to a completing step.
    #[serde(default)]
    completion_counter: u64,
}

impl Execution {
    /// A pending execution with a pending result for every step.
    pub fn new(
        definition: &WorkflowDefinition,
        actor_id: impl Into<String>,
        session_id: impl Into<String>,
        params: Value,
    ) -> Self {
        let step_results = definition
            .all_steps()
            .into_iter()
            .map(|s| (s.id.clone(), StepResult::new(&s.id)))
            .collect();

        Self {
            id: Uuid::now_v7(),
            workflow_id: definition.id,
            workflow_version: definition.version,
            workflow_name: definition.name.clone(),
            actor_id: actor_id.into(),
            session_id: session_id.into(),
            params,
            context: Value::Null,
            status: ExecutionStatus::Pending,
            step_results,
            error_log: Vec::new(),
            rollback_history: Vec::new(),
            rollback_attempts: Vec::new(),
            metrics: ExecutionMetrics::default(),
            cancel_reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            completion_counter: 0,
        }
    }

    /// Move the execution to `next`, recording the transition.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Execution {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        self.metrics.transitions.push(StatusTransition {
            from: self.status,
            to: next,
            at: now,
        });
        self.status = next;

        if next == ExecutionStatus::Running {
            self.started_at = Some(now);
        } else if next.is_terminal() {
            self.completed_at = Some(now);
            if let Some(started) = self.started_at {
                self.metrics.total_duration_ms =
                    Some((now - started).num_milliseconds().max(0) as u64);
            }
        }
        Ok(())
    }

    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.get(step_id)
    }

    fn step_mut(&mut self, step_id: &str) -> Result<&mut StepResult, TransitionError> {
        self.step_results
            .get_mut(step_id)
            .ok_or_else(|| TransitionError::UnknownStep(step_id.to_string()))
    }

    /// Status of a step, `None` if the id is unknown.
    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_results.get(step_id).map(|r| r.status)
    }

    pub fn mark_step_running(&mut self, step_id: &str) -> Result<(), TransitionError> {
        let result = self.step_mut(step_id)?;
        result.transition(StepStatus::Running)?;
        result.started_at = Some(Utc::now());
        self.metrics.step_transitions += 1;
        Ok(())
    }

    /// Record a successful outcome and assign the next completion sequence.
    pub fn complete_step(
        &mut self,
        step_id: &str,
        output: Value,
        resource_usage: Option<ResourceUsage>,
        retry_count: u32,
        fallback_used: bool,
    ) -> Result<(), TransitionError> {
        let seq = self.completion_counter;
        let result = self.step_mut(step_id)?;
        result.transition(StepStatus::Completed)?;
        result.finish();
        result.output = Some(output);
        result.resource_usage = resource_usage;
        result.retry_count = retry_count;
        result.fallback_used = fallback_used;
        result.completion_seq = Some(seq);

        self.completion_counter += 1;
        self.metrics.steps_completed += 1;
        self.metrics.total_retries += u64::from(retry_count);
        self.metrics.step_transitions += 1;
        Ok(())
    }

    /// Record a terminal failure. The failure is also appended to the error log.
    pub fn fail_step(
        &mut self,
        step_id: &str,
        failure: StepFailure,
        retry_count: u32,
        fallback_used: bool,
    ) -> Result<(), TransitionError> {
        let result = self.step_mut(step_id)?;
        result.transition(StepStatus::Failed)?;
        result.finish();
        result.error = Some(failure.clone());
        result.retry_count = retry_count;
        result.fallback_used = fallback_used;

        self.metrics.steps_failed += 1;
        self.metrics.total_retries += u64::from(retry_count);
        self.metrics.step_transitions += 1;
        self.record_error(Some(step_id), &failure);
        Ok(())
    }

    pub fn skip_step(&mut self, step_id: &str) -> Result<(), TransitionError> {
        let result = self.step_mut(step_id)?;
        result.transition(StepStatus::Skipped)?;
        result.finish();
        self.metrics.steps_skipped += 1;
        self.metrics.step_transitions += 1;
        Ok(())
    }

    pub fn roll_back_step(&mut self, step_id: &str) -> Result<(), TransitionError> {
        let result = self.step_mut(step_id)?;
        result.transition(StepStatus::RolledBack)?;
        self.metrics.steps_rolled_back += 1;
        self.metrics.step_transitions += 1;
        Ok(())
    }

    /// Ids of steps currently `completed`, ordered by completion time.
    pub fn completed_in_order(&self) -> Vec<&StepResult> {
        let mut completed: Vec<&StepResult> = self
            .step_results
            .values()
            .filter(|r| r.status == StepStatus::Completed)
            .collect();
        completed.sort_by_key(|r| r.completion_seq);
        completed
    }

    /// Completed step ids in completion order.
    pub fn completed_step_ids(&self) -> Vec<String> {
        self.completed_in_order()
            .into_iter()
            .map(|r| r.step_id.clone())
            .collect()
    }

    /// Append an entry to the error log.
    pub fn record_error(&mut self, step_id: Option<&str>, failure: &StepFailure) {
        self.error_log.push(ErrorLogEntry {
            step_id: step_id.map(str::to_string),
            kind: failure.kind,
            severity: failure.severity,
            message: failure.message.clone(),
            at: Utc::now(),
        });
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    RolledBack,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    /// A step reaches a terminal state once; `completed -> rolled_back` is the
    /// only edge out of a terminal state. `pending -> failed` covers steps that
    /// never obtained a resource permit.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Skipped)
                | (Completed, RolledBack)
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step outcome record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
    /// Position in the execution's completion order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_seq: Option<u64>,
    /// Every status the step has held, oldest first.
    pub history: Vec<StepStatus>,
}

impl StepResult {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            output: None,
            error: None,
            retry_count: 0,
            fallback_used: false,
            resource_usage: None,
            completion_seq: None,
            history: vec![StepStatus::Pending],
        }
    }

    fn transition(&mut self, next: StepStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Step {
                step_id: self.step_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.history.push(next);
        Ok(())
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.ended_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
    }
}

/// Resource usage sample reported for a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
}

/// Successful executor result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}

impl StepOutcome {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            resource_usage: None,
        }
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.resource_usage = Some(usage);
        self
    }
}

// ---------------------------------------------------------------------------
// Error log and metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub steps_completed: u64,
    pub steps_failed: u64,
    pub steps_skipped: u64,
    pub steps_rolled_back: u64,
    pub total_retries: u64,
    /// Count of step status changes.
    pub step_transitions: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
    /// Execution status changes, oldest first.
    #[serde(default)]
    pub transitions: Vec<StatusTransition>,
}

impl ExecutionMetrics {
    /// The status sequence, starting from `pending`.
    pub fn status_sequence(&self) -> Vec<ExecutionStatus> {
        let mut seq = vec![ExecutionStatus::Pending];
        seq.extend(self.transitions.iter().map(|t| t.to));
        seq
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

/// What state a rollback should restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RollbackTarget {
    /// Undo every completed rollback-capable step.
    Initial,
    /// Undo steps completed after a checkpoint. Without an id the latest
    /// checkpoint taken before the rollback request is used.
    Checkpoint {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint_id: Option<Uuid>,
    },
    /// Undo only the listed steps.
    Custom { step_ids: Vec<String> },
}

/// Ordered compensation plan for one rollback attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub target: RollbackTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_checkpoint: Option<Uuid>,
    /// Sorted by ascending `order`.
    pub steps: Vec<RollbackStep>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackStep {
    /// Lower runs first; the most recently completed step has order 0.
    pub order: u32,
    pub kind: RollbackKind,
    pub target_step_id: String,
    pub step_kind: StepKind,
    pub actions: Vec<CompensatingAction>,
    pub critical: bool,
}

/// One compensating action as it was executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub attempt_id: Uuid,
    pub order: u32,
    pub target_step_id: String,
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub critical: bool,
    pub at: DateTime<Utc>,
}

/// Summary of one rollback invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackAttempt {
    pub id: Uuid,
    pub target: RollbackTarget,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub planned_steps: usize,
    /// Emergency recovery was triggered by a critical failure.
    #[serde(default)]
    pub emergency: bool,
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Immutable snapshot of an execution at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub snapshot: CheckpointSnapshot,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub definition: WorkflowDefinition,
    pub params: Value,
    #[serde(default)]
    pub context: Value,
    /// Step ids completed at snapshot time, in completion order.
    pub completed_steps: Vec<String>,
    pub status: ExecutionStatus,
    pub reason: CheckpointReason,
}

impl CheckpointSnapshot {
    /// Capture the current state of `execution`.
    pub fn capture(
        definition: &WorkflowDefinition,
        execution: &Execution,
        reason: CheckpointReason,
    ) -> Self {
        Self {
            definition: definition.clone(),
            params: execution.params.clone(),
            context: execution.context.clone(),
            completed_steps: execution.completed_step_ids(),
            status: execution.status,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    ExecutionStart,
    PreRollback,
}
