//! Test doubles shared by the core unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marketflow_types::error::RepositoryError;
use marketflow_types::event::WorkflowEvent;
use marketflow_types::execution::{Checkpoint, Execution, StepOutcome};
use marketflow_types::recovery::StepFailure;
use marketflow_types::workflow::WorkflowDefinition;
use serde_json::json;
use uuid::Uuid;

use crate::event::NotificationSink;
use crate::repository::PersistenceStore;
use crate::workflow::executor::{InvocationMode, StepExecutor, StepInvocation};

// ---------------------------------------------------------------------------
// MockStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockStore {
    definitions: Mutex<HashMap<(Uuid, u32), WorkflowDefinition>>,
    executions: Mutex<HashMap<Uuid, Execution>>,
    checkpoints: Mutex<Vec<Checkpoint>>,
}

impl PersistenceStore for MockStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut defs = self.definitions.lock().unwrap();
        if defs.contains_key(&(def.id, def.version)) {
            return Err(RepositoryError::Conflict(format!("{} v{}", def.id, def.version)));
        }
        defs.insert((def.id, def.version), def.clone());
        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.lock().unwrap().get(&(*id, version)).cloned())
    }

    async fn get_latest_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .definitions
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.id == *id)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.lock().unwrap().values().cloned().collect())
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        self.executions
            .lock()
            .unwrap()
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.lock().unwrap().get(id).cloned())
    }

    async fn list_executions(&self, workflow_id: &Uuid, limit: u32) -> Result<Vec<Execution>, RepositoryError> {
        Ok(self
            .executions
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.workflow_id == *workflow_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        self.checkpoints.lock().unwrap().push(checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == *id)
            .cloned())
    }

    async fn list_checkpoints(&self, execution_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.execution_id == *execution_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

/// One recorded executor call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorCall {
    pub step_id: String,
    /// Compensating operation, `None` for forward runs.
    pub compensation: Option<String>,
    pub attempt: u32,
}

/// Executor whose failures are scripted per step id.
#[derive(Clone)]
pub struct ScriptedExecutor {
    name: String,
    delay: Duration,
    /// step id -> (remaining failures, failure to return)
    failures: Arc<Mutex<HashMap<String, (u32, StepFailure)>>>,
    failing_compensations: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<Vec<ExecutorCall>>>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedExecutor {
    pub fn succeeding(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            failures: Arc::default(),
            failing_compensations: Arc::default(),
            calls: Arc::default(),
            in_flight: Arc::default(),
            peak: Arc::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail forward runs of `step_id` the first `times` attempts.
    pub fn failing(self, step_id: &str, times: u32, failure: StepFailure) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(step_id.to_string(), (times, failure));
        self
    }

    pub fn always_failing(self, step_id: &str, failure: StepFailure) -> Self {
        self.failing(step_id, u32::MAX, failure)
    }

    /// Fail every compensation using `operation`.
    pub fn failing_compensation(self, operation: &str) -> Self {
        self.failing_compensations
            .lock()
            .unwrap()
            .push(operation.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn forward_calls(&self, step_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.step_id == step_id && c.compensation.is_none())
            .count()
    }

    pub fn compensations(&self) -> Vec<ExecutorCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.compensation.is_some())
            .collect()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl StepExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, invocation: &StepInvocation) -> Result<StepOutcome, StepFailure> {
        let step_id = invocation.step.id.clone();
        let compensation = match &invocation.mode {
            InvocationMode::Forward => None,
            InvocationMode::Compensation { action } => Some(action.operation.clone()),
        };
        self.calls.lock().unwrap().push(ExecutorCall {
            step_id: step_id.clone(),
            compensation: compensation.clone(),
            attempt: invocation.attempt,
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(op) = &compensation {
            if self.failing_compensations.lock().unwrap().contains(op) {
                return Err(StepFailure::agent_failure(format!("compensation '{op}' failed")));
            }
            return Ok(StepOutcome::new(json!({ "compensated": op })));
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some((remaining, failure)) = failures.get_mut(&step_id) {
                if *remaining > 0 {
                    *remaining = remaining.saturating_sub(1);
                    return Err(failure.clone());
                }
            }
        }

        Ok(StepOutcome::new(json!({
            "executor": self.name,
            "step": step_id,
            "attempt": invocation.attempt,
        })))
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

#[derive(Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<WorkflowEvent>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.name()).collect()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, event: WorkflowEvent) {
        self.events.lock().unwrap().push(event);
    }
}
