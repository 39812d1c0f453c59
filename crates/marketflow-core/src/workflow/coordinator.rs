//! Execution coordinator.
//!
//! `WorkflowEngine` owns every live execution. Each execution is driven by a
//! single tokio task that walks the top-level steps in declaration order,
//! consults the dependency resolver, dispatches parallel groups through the
//! resource limiter and routes failures through the recovery engine before
//! recording a step result. All mutation of an [`Execution`] happens under
//! its slot mutex, which is never held across an executor call.
//!
//! Execution flow:
//! 1. `start` validates the definition, resolves context, checks
//!    preconditions, persists the execution and takes the start checkpoint
//! 2. The driver moves the execution to `running` and loops over ready steps
//! 3. Blocked steps are skipped; unresolved failures fail the execution at
//!    the end, an emergency stop fails it immediately
//! 4. An unresolved failure of a rollback-capable step compensates every
//!    completed step and stops the execution
//! 5. `cancel` flips the status and signals the driver's token
//! 6. `rollback` quiesces the driver, checkpoints, plans and runs compensation
//!
//! A slot leaves the live map once its driver has persisted the final state;
//! later lookups rebuild it from the store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use marketflow_types::config::{EngineConfig, LimiterScope};
use marketflow_types::error::{RepositoryError, TransitionError};
use marketflow_types::event::WorkflowEvent;
use marketflow_types::execution::{
    CheckpointReason, CheckpointSnapshot, Execution, ExecutionStatus, RollbackTarget, StepOutcome, StepStatus,
};
use marketflow_types::recovery::{Severity, StepFailure};
use marketflow_types::workflow::{
    GroupFailurePolicy, ParallelStrategy, StepDefinition, StepKind, StepParams, WorkflowDefinition,
};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::{BoxContextProvider, ContextError, StaticContext};
use super::dag;
use super::definition::{self, OptimizationReport, WorkflowError};
use super::executor::{ExecutorRegistry, StepInvocation};
use super::expression;
use super::limiter::ResourceLimiter;
use super::recovery::{RecoveryEngine, RecoveryOutcome};
use super::retry::RetrySchedule;
use super::rollback::{RollbackExecutor, RollbackPlanner};
use super::step_runner::StepRunner;
use crate::event::NotificationSink;
use crate::repository::PersistenceStore;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("no executor registered for step kinds: {0}")]
    MissingExecutor(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

// ---------------------------------------------------------------------------
// ExecutionHandle
// ---------------------------------------------------------------------------

/// Caller's view of a started execution.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pub execution_id: Uuid,
    status: watch::Receiver<ExecutionStatus>,
    done: watch::Receiver<bool>,
}

impl ExecutionHandle {
    pub fn current(&self) -> ExecutionStatus {
        *self.status.borrow()
    }

    /// A receiver notified on every status change.
    pub fn watch(&self) -> watch::Receiver<ExecutionStatus> {
        self.status.clone()
    }

    /// Wait until the driver has stopped and return the status it left.
    pub async fn wait(&self) -> ExecutionStatus {
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
        self.current()
    }
}

// ---------------------------------------------------------------------------
// Engine internals
// ---------------------------------------------------------------------------

/// One execution and the channels around it.
struct ExecutionSlot {
    id: Uuid,
    definition: Arc<WorkflowDefinition>,
    state: Mutex<Execution>,
    cancel: CancellationToken,
    status_tx: watch::Sender<ExecutionStatus>,
    done_tx: watch::Sender<bool>,
    rolling_back: AtomicBool,
}

impl ExecutionSlot {
    fn new(definition: Arc<WorkflowDefinition>, execution: Execution, finished: bool) -> Self {
        let (status_tx, _) = watch::channel(execution.status);
        let (done_tx, _) = watch::channel(finished);
        Self {
            id: execution.id,
            definition,
            state: Mutex::new(execution),
            cancel: CancellationToken::new(),
            status_tx,
            done_tx,
            rolling_back: AtomicBool::new(false),
        }
    }

    fn handle(&self) -> ExecutionHandle {
        ExecutionHandle {
            execution_id: self.id,
            status: self.status_tx.subscribe(),
            done: self.done_tx.subscribe(),
        }
    }

    fn publish_status(&self, status: ExecutionStatus) {
        self.status_tx.send_replace(status);
    }
}

/// Result of running one step to a final outcome.
struct StepRun {
    step_id: String,
    result: Result<StepOutcome, StepFailure>,
    retries: u32,
    fallback_used: bool,
    compensated: bool,
    emergency: bool,
    /// Ended in error after its cancellation token fired.
    interrupted: bool,
}

impl StepRun {
    fn finished(step_id: String, result: Result<StepOutcome, StepFailure>) -> Self {
        Self {
            step_id,
            result,
            retries: 0,
            fallback_used: false,
            compensated: false,
            emergency: false,
            interrupted: false,
        }
    }

    fn recovered(step_id: String, outcome: RecoveryOutcome) -> Self {
        Self {
            step_id,
            compensated: outcome.compensated,
            emergency: outcome.emergency_stop,
            retries: outcome.retries,
            fallback_used: outcome.fallback_used,
            interrupted: false,
            result: outcome.result,
        }
    }

    /// Failed with nothing absorbing the failure.
    fn unresolved(&self) -> bool {
        self.result.is_err() && !self.compensated && !self.interrupted
    }

    /// Executor calls this run made.
    fn attempts_used(&self) -> u32 {
        self.retries + 1 + u32::from(self.fallback_used)
    }
}

/// Why the driver stopped early.
struct EmergencyStop {
    step_id: Option<String>,
    reason: String,
}

#[derive(Default)]
struct Progress {
    unresolved: Vec<String>,
    emergency: Option<EmergencyStop>,
    /// Completed work was compensated after a failure; nothing more runs.
    compensated: bool,
}

impl Progress {
    fn stopped(&self) -> bool {
        self.emergency.is_some() || self.compensated
    }
}

impl Progress {
    fn absorb(&mut self, run: &StepRun) {
        if run.emergency {
            self.emergency = Some(EmergencyStop {
                step_id: Some(run.step_id.clone()),
                reason: run
                    .result
                    .as_ref()
                    .err()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "emergency stop".to_string()),
            });
        } else if run.unresolved() {
            self.unresolved.push(run.step_id.clone());
        }
    }
}

/// A group member waiting for dispatch. `previous` holds the failed first
/// run of a member queued for a `retry_failed` pass.
struct QueuedMember {
    step: StepDefinition,
    previous: Option<StepRun>,
}

#[derive(Default)]
struct GroupPass {
    deferred: Vec<QueuedMember>,
    halted: bool,
    failed: usize,
    emergency: Option<EmergencyStop>,
}

/// How a parallel group reacts to member failures.
#[derive(Debug, Clone, Copy)]
struct GroupRules {
    strategy: ParallelStrategy,
    policy: GroupFailurePolicy,
    members: usize,
}

impl GroupRules {
    /// Whether `failed` member failures already rule out the strategy.
    fn unreachable(&self, failed: usize) -> bool {
        match self.strategy {
            ParallelStrategy::AllSuccess => failed > 0,
            ParallelStrategy::MajoritySuccess => failed * 2 >= self.members,
            ParallelStrategy::AnySuccess => failed >= self.members,
            ParallelStrategy::BestEffort => false,
        }
    }

    fn satisfied(&self, completed: usize) -> bool {
        match self.strategy {
            ParallelStrategy::AllSuccess => completed == self.members,
            ParallelStrategy::AnySuccess => completed > 0,
            ParallelStrategy::MajoritySuccess => completed * 2 > self.members,
            ParallelStrategy::BestEffort => true,
        }
    }
}

struct EngineInner<S: PersistenceStore> {
    store: Arc<S>,
    checkpoints: CheckpointManager<S>,
    runner: StepRunner,
    recovery: RecoveryEngine,
    sink: Arc<dyn NotificationSink>,
    context: BoxContextProvider,
    config: EngineConfig,
    /// Shared limiter when the scope is engine-wide.
    engine_limiter: Option<ResourceLimiter>,
    executions: DashMap<Uuid, Arc<ExecutionSlot>>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// The orchestration engine. Cheap to clone; clones share all state.
pub struct WorkflowEngine<S: PersistenceStore> {
    inner: Arc<EngineInner<S>>,
}

impl<S: PersistenceStore> Clone for WorkflowEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: PersistenceStore> WorkflowEngine<S> {
    /// An engine with an empty ambient context.
    pub fn new(
        store: Arc<S>,
        registry: ExecutorRegistry,
        sink: Arc<dyn NotificationSink>,
        config: EngineConfig,
    ) -> Self {
        Self::with_context(
            store,
            registry,
            sink,
            config,
            BoxContextProvider::new(StaticContext::default()),
        )
    }

    pub fn with_context(
        store: Arc<S>,
        registry: ExecutorRegistry,
        sink: Arc<dyn NotificationSink>,
        config: EngineConfig,
        context: BoxContextProvider,
    ) -> Self {
        let runner = StepRunner::new(
            Arc::new(registry),
            Duration::from_secs(config.default_step_timeout_secs),
        );
        let engine_limiter = (config.limiter_scope == LimiterScope::EngineWide)
            .then(|| ResourceLimiter::new(config.max_concurrency));

        Self {
            inner: Arc::new(EngineInner {
                checkpoints: CheckpointManager::new(Arc::clone(&store)),
                store,
                runner,
                recovery: RecoveryEngine::new(config.recovery.clone()),
                sink,
                context,
                config,
                engine_limiter,
                executions: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Validate, persist and start an execution of `definition`.
    ///
    /// Validation and precondition failures are returned before any
    /// execution exists.
    pub async fn start(
        &self,
        definition: WorkflowDefinition,
        actor_id: &str,
        session_id: &str,
        params: Value,
    ) -> Result<ExecutionHandle, EngineError> {
        definition::validate_definition(&definition)?;

        let missing = self.inner.runner.registry().missing_kinds(&definition);
        if !missing.is_empty() {
            let kinds: Vec<&str> = missing.iter().map(StepKind::as_str).collect();
            return Err(EngineError::MissingExecutor(kinds.join(", ")));
        }

        let context = self.inner.context.resolve(actor_id, session_id).await?;

        let scope = expression::precondition_context(&params, &context);
        for condition in &definition.conditions {
            match expression::evaluate(&condition.expression, &scope) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(EngineError::Validation(format!(
                        "precondition '{}' not met",
                        condition.name
                    )));
                }
                Err(e) => {
                    return Err(EngineError::Validation(format!(
                        "precondition '{}': {e}",
                        condition.name
                    )));
                }
            }
        }

        let store = &self.inner.store;
        if store
            .get_definition(&definition.id, definition.version)
            .await?
            .is_none()
        {
            match store.save_definition(&definition).await {
                Ok(()) | Err(RepositoryError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut execution = Execution::new(&definition, actor_id, session_id, params);
        execution.context = context;
        store.save_execution(&execution).await?;
        self.inner
            .checkpoints
            .create_checkpoint(
                execution.id,
                CheckpointSnapshot::capture(&definition, &execution, CheckpointReason::ExecutionStart),
            )
            .await?;

        let execution_id = execution.id;
        let slot = Arc::new(ExecutionSlot::new(Arc::new(definition), execution, false));
        let handle = slot.handle();
        self.inner.executions.insert(execution_id, Arc::clone(&slot));

        self.inner.sink.notify(WorkflowEvent::ExecutionStarted {
            execution_id,
            workflow_id: slot.definition.id,
            workflow_name: slot.definition.name.clone(),
            workflow_version: slot.definition.version,
        });
        tracing::info!(
            execution_id = %execution_id,
            workflow = slot.definition.name.as_str(),
            version = slot.definition.version,
            actor_id,
            "execution started"
        );

        tokio::spawn(Arc::clone(&self.inner).drive(slot));
        Ok(handle)
    }

    /// Current state of an execution.
    pub async fn status(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let live = self
            .inner
            .executions
            .get(&execution_id)
            .map(|slot| Arc::clone(slot.value()));
        if let Some(slot) = live {
            return Ok(slot.state.lock().await.clone());
        }
        self.inner
            .store
            .get_execution(&execution_id)
            .await?
            .ok_or(EngineError::NotFound(execution_id))
    }

    /// Handle for an execution known to this engine.
    pub async fn handle(&self, execution_id: Uuid) -> Result<ExecutionHandle, EngineError> {
        let slot = self.inner.slot(execution_id).await?;
        let handle = slot.handle();
        self.inner.release(&slot);
        Ok(handle)
    }

    /// Executions currently held in memory.
    pub fn live_executions(&self) -> usize {
        self.inner.executions.len()
    }

    /// Cancel a pending or running execution.
    ///
    /// Returns `false`, changing nothing, when the execution is already
    /// terminal. No rollback happens.
    pub async fn cancel(&self, execution_id: Uuid, reason: &str) -> Result<bool, EngineError> {
        let slot = self.inner.slot(execution_id).await?;
        let cancelled = self.inner.cancel_slot(&slot, reason).await;
        self.inner.release(&slot);
        cancelled
    }

    /// Roll an execution back to `target`.
    ///
    /// Returns `Ok(false)` when the status does not permit a rollback, when
    /// another rollback is in progress, or when the rollback did not fully
    /// succeed. An unknown id is an error and mutates nothing.
    pub async fn rollback(&self, execution_id: Uuid, target: RollbackTarget) -> Result<bool, EngineError> {
        let slot = self.inner.slot(execution_id).await?;

        let status = slot.state.lock().await.status;
        if !status.is_rollback_eligible() {
            tracing::info!(
                execution_id = %execution_id,
                status = status.as_str(),
                "rollback not permitted"
            );
            self.inner.release(&slot);
            return Ok(false);
        }
        if slot.rolling_back.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        // keep the slot reachable while the driver winds down
        self.inner
            .executions
            .entry(execution_id)
            .or_insert_with(|| Arc::clone(&slot));

        let result = self.inner.rollback_slot(&slot, target).await;
        slot.rolling_back.store(false, Ordering::SeqCst);
        self.inner.release(&slot);
        result
    }

    /// Parse, validate and store a YAML definition.
    ///
    /// The first stored definition of an id gets version 1; later ones get
    /// the next version.
    pub async fn create_workflow_from_spec(&self, yaml: &str) -> Result<WorkflowDefinition, EngineError> {
        let mut def = definition::parse_workflow_yaml(yaml)?;
        definition::validate_definition(&def)?;

        def.version = match self.inner.store.get_latest_definition(&def.id).await? {
            Some(latest) => latest.version + 1,
            None => 1,
        };
        self.inner.store.save_definition(&def).await?;

        tracing::info!(
            workflow_id = %def.id,
            workflow = def.name.as_str(),
            version = def.version,
            "workflow created"
        );
        Ok(def)
    }

    /// Store `def` as the next version of an existing workflow.
    ///
    /// Running executions keep the version they started with.
    pub async fn update_workflow(&self, mut def: WorkflowDefinition) -> Result<WorkflowDefinition, EngineError> {
        definition::validate_definition(&def)?;

        let latest = self
            .inner
            .store
            .get_latest_definition(&def.id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(def.id))?;
        def.version = latest.version + 1;
        self.inner.store.save_definition(&def).await?;

        tracing::info!(workflow_id = %def.id, version = def.version, "workflow updated");
        Ok(def)
    }

    /// Analyze the latest version of a workflow. Nothing is stored.
    pub async fn optimize_workflow(&self, workflow_id: Uuid) -> Result<OptimizationReport, EngineError> {
        let def = self
            .inner
            .store
            .get_latest_definition(&workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        Ok(definition::optimize_definition(
            &def,
            self.inner.config.default_step_timeout_secs,
        )?)
    }

    /// Most recent executions of a workflow.
    pub async fn list_executions(&self, workflow_id: Uuid, limit: u32) -> Result<Vec<Execution>, EngineError> {
        Ok(self.inner.store.list_executions(&workflow_id, limit).await?)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

impl<S: PersistenceStore> EngineInner<S> {
    /// Live slot, or one rebuilt from the store.
    async fn slot(&self, execution_id: Uuid) -> Result<Arc<ExecutionSlot>, EngineError> {
        let live = self
            .executions
            .get(&execution_id)
            .map(|slot| Arc::clone(slot.value()));
        if let Some(slot) = live {
            return Ok(slot);
        }

        let execution = self
            .store
            .get_execution(&execution_id)
            .await?
            .ok_or(EngineError::NotFound(execution_id))?;
        let definition = self
            .store
            .get_definition(&execution.workflow_id, execution.workflow_version)
            .await?
            .ok_or(EngineError::WorkflowNotFound(execution.workflow_id))?;

        let slot = Arc::new(ExecutionSlot::new(Arc::new(definition), execution, true));
        Ok(Arc::clone(
            self.executions.entry(execution_id).or_insert(slot).value(),
        ))
    }

    /// Drop `slot` from the live map once its driver is done and no rollback
    /// holds it.
    fn release(&self, slot: &Arc<ExecutionSlot>) {
        self.executions.remove_if(&slot.id, |_, live| {
            Arc::ptr_eq(live, slot) && *live.done_tx.borrow() && !live.rolling_back.load(Ordering::SeqCst)
        });
    }

    async fn persist(&self, execution: &Execution) -> Result<(), EngineError> {
        self.store.save_execution(execution).await?;
        Ok(())
    }

    fn notify_step(&self, execution: &Execution, step_id: &str) {
        if let Some(result) = execution.step(step_id) {
            self.sink.notify(WorkflowEvent::StepCompleted {
                execution_id: execution.id,
                step_id: step_id.to_string(),
                status: result.status,
                duration_ms: result.duration_ms,
            });
        }
    }

    async fn drive(self: Arc<Self>, slot: Arc<ExecutionSlot>) {
        if let Err(e) = self.run_to_completion(&slot).await {
            tracing::error!(execution_id = %slot.id, error = %e, "execution driver failed");
            self.force_fail(&slot, &e.to_string()).await;
        }
        // final state is persisted; a rollback in progress releases the slot itself
        self.executions.remove_if(&slot.id, |_, live| {
            Arc::ptr_eq(live, &slot) && !live.rolling_back.load(Ordering::SeqCst)
        });
        slot.done_tx.send_replace(true);
    }

    async fn run_to_completion(self: &Arc<Self>, slot: &Arc<ExecutionSlot>) -> Result<(), EngineError> {
        {
            let mut exec = slot.state.lock().await;
            if exec.status != ExecutionStatus::Pending {
                drop(exec);
                return self.finish(slot, Progress::default()).await;
            }
            exec.transition(ExecutionStatus::Running)?;
            self.persist(&exec).await?;
            slot.publish_status(exec.status);
        }

        let steps = &slot.definition.steps;
        let mut progress = Progress::default();

        loop {
            if slot.cancel.is_cancelled() || progress.stopped() {
                break;
            }

            let (ready, skipped_any) = {
                let mut exec = slot.state.lock().await;
                let blocked: Vec<(String, String)> = dag::blocked_steps(steps, &exec.step_results)
                    .into_iter()
                    .map(|(s, dep)| (s.id.clone(), dep))
                    .collect();
                for (step_id, dependency) in &blocked {
                    exec.skip_step(step_id)?;
                    tracing::debug!(
                        execution_id = %slot.id,
                        step_id = step_id.as_str(),
                        dependency = dependency.as_str(),
                        "dependency not satisfied, skipping step"
                    );
                    self.notify_step(&exec, step_id);
                }
                if !blocked.is_empty() {
                    self.persist(&exec).await?;
                }
                let ready: Vec<StepDefinition> = dag::ready_steps(steps, &exec.step_results)
                    .into_iter()
                    .cloned()
                    .collect();
                (ready, !blocked.is_empty())
            };

            if ready.is_empty() {
                if skipped_any {
                    continue;
                }
                break;
            }

            for step in &ready {
                if slot.cancel.is_cancelled() || progress.stopped() {
                    break;
                }
                // an earlier step in this batch may have skipped it
                if slot.state.lock().await.step_status(&step.id) != Some(StepStatus::Pending) {
                    continue;
                }
                self.run_top_level(slot, step, &mut progress).await?;
            }
        }

        self.finish(slot, progress).await
    }

    async fn run_top_level(
        self: &Arc<Self>,
        slot: &Arc<ExecutionSlot>,
        step: &StepDefinition,
        progress: &mut Progress,
    ) -> Result<(), EngineError> {
        if let Some(guard) = &step.condition {
            let scope = {
                let exec = slot.state.lock().await;
                expression::step_context(&exec.params, &exec.context, &exec.step_results)
            };
            match expression::evaluate(guard, &scope) {
                Ok(true) => {}
                Ok(false) => {
                    let mut exec = slot.state.lock().await;
                    exec.skip_step(&step.id)?;
                    tracing::debug!(execution_id = %slot.id, step_id = step.id.as_str(), "condition false, skipping step");
                    self.notify_step(&exec, &step.id);
                    return self.persist(&exec).await;
                }
                Err(e) => {
                    let failure = StepFailure::validation(format!("condition for step '{}': {e}", step.id));
                    let mut exec = slot.state.lock().await;
                    exec.fail_step(&step.id, failure, 0, false)?;
                    self.notify_step(&exec, &step.id);
                    progress.unresolved.push(step.id.clone());
                    return self.persist(&exec).await;
                }
            }
        }

        if step.kind == StepKind::ParallelGroup {
            return self.run_group(slot, step, progress).await;
        }

        let invocation = self.begin_step(slot, step, &slot.cancel).await?;
        let run = self.invoke(invocation).await;
        self.record_step(slot, &run).await?;
        progress.absorb(&run);

        if run.unresolved() && !run.emergency && step.is_rollback_capable() {
            tracing::info!(
                execution_id = %slot.id,
                step_id = step.id.as_str(),
                "rollback-capable step failed, compensating completed steps"
            );
            self.compensate_completed(slot, &step.id, RollbackTarget::Initial, progress)
                .await?;
            progress.compensated = true;
            return Ok(());
        }

        if step.kind == StepKind::Conditional {
            if let Ok(outcome) = &run.result {
                self.skip_unselected(slot, &outcome.output).await?;
            }
        }
        Ok(())
    }

    /// Skip the branch a conditional step did not select.
    async fn skip_unselected(&self, slot: &ExecutionSlot, output: &Value) -> Result<(), EngineError> {
        let Some(skipped) = output.get("skipped_steps").and_then(Value::as_array) else {
            return Ok(());
        };
        let mut exec = slot.state.lock().await;
        for step_id in skipped.iter().filter_map(Value::as_str) {
            if exec.step_status(step_id) == Some(StepStatus::Pending) {
                exec.skip_step(step_id)?;
                self.notify_step(&exec, step_id);
            }
        }
        self.persist(&exec).await
    }

    /// Mark a step running and build its first invocation.
    async fn begin_step(
        &self,
        slot: &ExecutionSlot,
        step: &StepDefinition,
        token: &CancellationToken,
    ) -> Result<StepInvocation, EngineError> {
        let mut exec = slot.state.lock().await;
        exec.mark_step_running(&step.id)?;
        self.persist(&exec).await?;
        Ok(Self::invocation_for(&exec, step, token))
    }

    fn invocation_for(exec: &Execution, step: &StepDefinition, token: &CancellationToken) -> StepInvocation {
        let scope = expression::step_context(&exec.params, &exec.context, &exec.step_results);
        StepInvocation::forward(exec.id, step.clone(), exec.params.clone(), exec.context.clone())
            .with_steps(scope["steps"].clone())
            .with_cancellation(token.clone())
    }

    /// Run one step to its final outcome, recovering on failure.
    async fn invoke(&self, invocation: StepInvocation) -> StepRun {
        let step_id = invocation.step.id.clone();
        let primary = match self.runner.primary_executor(&invocation.step) {
            Ok(executor) => executor,
            Err(failure) => return StepRun::finished(step_id, Err(failure)),
        };

        let mut run = match self.runner.run_once(&primary, &invocation).await {
            Ok(outcome) => StepRun::finished(step_id, Ok(outcome)),
            Err(failure) if invocation.cancellation.is_cancelled() => StepRun::finished(step_id, Err(failure)),
            Err(failure) => {
                let outcome = self
                    .recovery
                    .recover(&self.runner, &primary, &invocation, failure, &*self.sink)
                    .await;
                StepRun::recovered(step_id, outcome)
            }
        };
        run.interrupted = run.result.is_err() && invocation.cancellation.is_cancelled();
        run
    }

    async fn record_step(&self, slot: &ExecutionSlot, run: &StepRun) -> Result<(), EngineError> {
        let mut exec = slot.state.lock().await;
        match &run.result {
            Ok(outcome) => exec.complete_step(
                &run.step_id,
                outcome.output.clone(),
                outcome.resource_usage,
                run.retries,
                run.fallback_used,
            )?,
            Err(_) if run.interrupted => exec.skip_step(&run.step_id)?,
            Err(failure) => {
                exec.fail_step(&run.step_id, failure.clone(), run.retries, run.fallback_used)?;
                tracing::warn!(
                    execution_id = %slot.id,
                    step_id = run.step_id.as_str(),
                    error = %failure,
                    retries = run.retries,
                    compensated = run.compensated,
                    "step failed"
                );
            }
        }
        self.notify_step(&exec, &run.step_id);
        self.persist(&exec).await
    }

    // -----------------------------------------------------------------------
    // Parallel groups
    // -----------------------------------------------------------------------

    async fn run_group(
        self: &Arc<Self>,
        slot: &Arc<ExecutionSlot>,
        group: &StepDefinition,
        progress: &mut Progress,
    ) -> Result<(), EngineError> {
        let StepParams::ParallelGroup {
            members,
            strategy,
            on_failure,
            max_concurrency,
        } = &group.params
        else {
            return Ok(());
        };

        {
            let mut exec = slot.state.lock().await;
            exec.mark_step_running(&group.id)?;
            self.persist(&exec).await?;
        }

        let limiter = self.engine_limiter.clone().unwrap_or_else(|| {
            let weights: Vec<_> = members.iter().map(|m| m.resources).collect();
            ResourceLimiter::for_weights(
                &weights,
                &self.config.budget,
                max_concurrency.unwrap_or(self.config.max_concurrency),
            )
        });
        let token = slot.cancel.child_token();
        let rules = GroupRules {
            strategy: *strategy,
            policy: *on_failure,
            members: members.len(),
        };

        let mut ordered: Vec<&StepDefinition> = members.iter().collect();
        ordered.sort_by(|a, b| b.resources.priority().total_cmp(&a.resources.priority()));

        tracing::debug!(
            execution_id = %slot.id,
            group_id = group.id.as_str(),
            members = members.len(),
            concurrency = limiter.capacity(),
            "dispatching parallel group"
        );

        let queue = ordered
            .into_iter()
            .map(|step| QueuedMember {
                step: step.clone(),
                previous: None,
            })
            .collect();
        let mut pass = self
            .dispatch_members(slot, queue, &limiter, &token, rules, true)
            .await?;

        if !pass.deferred.is_empty() {
            tracing::info!(
                execution_id = %slot.id,
                group_id = group.id.as_str(),
                retrying = pass.deferred.len(),
                "re-dispatching failed group members"
            );
            let retry = std::mem::take(&mut pass.deferred).into_iter().collect();
            let second = self
                .dispatch_members(slot, retry, &limiter, &token, rules, false)
                .await?;
            pass.emergency = pass.emergency.or(second.emergency);
        }

        self.finish_group(slot, group, rules, pass, progress).await
    }

    /// Dispatch queued members through the limiter until all have finished.
    async fn dispatch_members(
        self: &Arc<Self>,
        slot: &Arc<ExecutionSlot>,
        mut queue: VecDeque<QueuedMember>,
        limiter: &ResourceLimiter,
        token: &CancellationToken,
        rules: GroupRules,
        first_pass: bool,
    ) -> Result<GroupPass, EngineError> {
        let mut tasks: JoinSet<StepRun> = JoinSet::new();
        let mut pass = GroupPass::default();

        loop {
            if pass.halted || token.is_cancelled() {
                for member in queue.drain(..) {
                    match member.previous {
                        Some(previous) => self.record_step(slot, &previous).await?,
                        None => {
                            let mut exec = slot.state.lock().await;
                            exec.skip_step(&member.step.id)?;
                            self.notify_step(&exec, &member.step.id);
                        }
                    }
                }
            }

            let Some(next) = queue.front() else {
                match tasks.join_next().await {
                    Some(joined) => {
                        self.on_joined(slot, joined, token, rules, first_pass, &mut pass).await?;
                        continue;
                    }
                    None => break,
                }
            };

            let weights = next.step.resources;
            let timeout = self.runner.timeout_for(&next.step);
            let acquire = limiter.acquire_timeout(weights, timeout);
            tokio::pin!(acquire);

            let acquired = loop {
                tokio::select! {
                    biased;
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        self.on_joined(slot, joined, token, rules, first_pass, &mut pass).await?;
                        if pass.halted {
                            break None;
                        }
                    }
                    _ = token.cancelled() => break None,
                    result = &mut acquire => break Some(result),
                }
            };

            let Some(result) = acquired else {
                continue;
            };
            let Some(member) = queue.pop_front() else {
                continue;
            };

            match result {
                Ok(permit) => {
                    let (invocation, prior) = match &member.previous {
                        None => (self.begin_step(slot, &member.step, token).await?, None),
                        Some(previous) => {
                            let exec = slot.state.lock().await;
                            let mut inv = Self::invocation_for(&exec, &member.step, token);
                            inv.attempt = previous.attempts_used() + 1;
                            (inv, Some((previous.retries + 1, previous.fallback_used)))
                        }
                    };
                    let inner = Arc::clone(self);
                    tasks.spawn(async move {
                        let mut run = inner.invoke(invocation).await;
                        drop(permit);
                        if let Some((retries, fallback_used)) = prior {
                            run.retries += retries;
                            run.fallback_used |= fallback_used;
                        }
                        run
                    });
                }
                Err(e) => {
                    let failure = StepFailure::timeout(format!(
                        "resource starvation for step '{}': {e}",
                        member.step.id
                    ));
                    let run = match member.previous {
                        Some(mut previous) => {
                            previous.result = Err(failure);
                            previous
                        }
                        None => StepRun::finished(member.step.id.clone(), Err(failure)),
                    };
                    self.on_member_finished(slot, run, None, token, rules, false, &mut pass)
                        .await?;
                }
            }
        }

        Ok(pass)
    }

    async fn on_joined(
        &self,
        slot: &ExecutionSlot,
        joined: Result<StepRun, JoinError>,
        token: &CancellationToken,
        rules: GroupRules,
        first_pass: bool,
        pass: &mut GroupPass,
    ) -> Result<(), EngineError> {
        match joined {
            Ok(run) => {
                let step = slot.definition.find_step(&run.step_id).cloned();
                self.on_member_finished(slot, run, step, token, rules, first_pass, pass)
                    .await
            }
            Err(e) => {
                tracing::error!(execution_id = %slot.id, error = %e, "group member task failed");
                let mut exec = slot.state.lock().await;
                exec.record_error(None, &StepFailure::system(format!("group member task failed: {e}")));
                pass.failed += 1;
                Self::halt_if_lost(rules, token, pass);
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_member_finished(
        &self,
        slot: &ExecutionSlot,
        run: StepRun,
        step: Option<StepDefinition>,
        token: &CancellationToken,
        rules: GroupRules,
        first_pass: bool,
        pass: &mut GroupPass,
    ) -> Result<(), EngineError> {
        if run.emergency {
            self.record_step(slot, &run).await?;
            pass.emergency = Some(EmergencyStop {
                step_id: Some(run.step_id.clone()),
                reason: run
                    .result
                    .as_ref()
                    .err()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            });
            pass.halted = true;
            token.cancel();
            return Ok(());
        }

        if run.unresolved() && first_pass && rules.policy == GroupFailurePolicy::RetryFailed {
            if let Some(step) = step.filter(|s| self.attempts_remain(s, &run)) {
                pass.deferred.push(QueuedMember {
                    step,
                    previous: Some(run),
                });
                return Ok(());
            }
        }

        self.record_step(slot, &run).await?;
        if run.unresolved() {
            pass.failed += 1;
            Self::halt_if_lost(rules, token, pass);
        }
        Ok(())
    }

    /// Stop dispatching once the group strategy can no longer be met.
    fn halt_if_lost(rules: GroupRules, token: &CancellationToken, pass: &mut GroupPass) {
        if !rules.unreachable(pass.failed) {
            return;
        }
        match rules.policy {
            GroupFailurePolicy::AbortAll => {
                pass.halted = true;
                token.cancel();
            }
            GroupFailurePolicy::RollbackAll => pass.halted = true,
            GroupFailurePolicy::ContinuePartial | GroupFailurePolicy::RetryFailed => {}
        }
    }

    /// Whether the member's retry budget allows one more call.
    fn attempts_remain(&self, step: &StepDefinition, run: &StepRun) -> bool {
        let Err(failure) = &run.result else {
            return false;
        };
        let max_attempts = match self.recovery.strategy_for(failure.kind) {
            Some(strategy) => RetrySchedule::resolve(step.retry.as_ref(), strategy).max_attempts,
            None => step.retry.as_ref().map_or(1, |policy| policy.max_attempts.max(1)),
        };
        run.attempts_used() < max_attempts
    }

    async fn finish_group(
        &self,
        slot: &ExecutionSlot,
        group: &StepDefinition,
        rules: GroupRules,
        pass: GroupPass,
        progress: &mut Progress,
    ) -> Result<(), EngineError> {
        let member_ids: Vec<String> = group.group_members().iter().map(|m| m.id.clone()).collect();

        let completed = {
            let mut exec = slot.state.lock().await;
            for id in &member_ids {
                if exec.step_status(id) == Some(StepStatus::Running) {
                    exec.fail_step(id, StepFailure::system("group member did not report a result"), 0, false)?;
                    self.notify_step(&exec, id);
                }
            }
            member_ids
                .iter()
                .filter(|id| exec.step_status(id) == Some(StepStatus::Completed))
                .count()
        };

        if let Some(emergency) = pass.emergency {
            progress.emergency = Some(emergency);
        }

        if slot.cancel.is_cancelled() {
            let mut exec = slot.state.lock().await;
            exec.skip_step(&group.id)?;
            self.notify_step(&exec, &group.id);
            return self.persist(&exec).await;
        }

        let satisfied = rules.satisfied(completed);
        if !satisfied && rules.policy == GroupFailurePolicy::RollbackAll {
            let target = RollbackTarget::Custom {
                step_ids: member_ids.clone(),
            };
            self.compensate_completed(slot, &group.id, target, progress).await?;
        }

        let mut exec = slot.state.lock().await;
        let statuses: Vec<(String, StepStatus)> = member_ids
            .iter()
            .filter_map(|id| exec.step_status(id).map(|s| (id.clone(), s)))
            .collect();
        let with_status = |wanted: StepStatus| -> Vec<&str> {
            statuses
                .iter()
                .filter(|(_, s)| *s == wanted)
                .map(|(id, _)| id.as_str())
                .collect()
        };

        if satisfied {
            let output = json!({
                "completed": with_status(StepStatus::Completed),
                "failed": with_status(StepStatus::Failed),
                "skipped": with_status(StepStatus::Skipped),
            });
            exec.complete_step(&group.id, output, None, 0, false)?;
        } else {
            let failure = StepFailure::agent_failure(format!(
                "parallel group '{}' failed: {completed} of {} members succeeded",
                group.id, rules.members
            ));
            exec.fail_step(&group.id, failure, 0, false)?;
            progress.unresolved.push(group.id.clone());
        }
        self.notify_step(&exec, &group.id);
        self.persist(&exec).await
    }

    /// Compensate completed steps within `target` while the execution runs.
    ///
    /// Takes the pre-rollback checkpoint, applies the report and turns a
    /// critical compensation failure into an emergency stop.
    async fn compensate_completed(
        &self,
        slot: &ExecutionSlot,
        origin: &str,
        target: RollbackTarget,
        progress: &mut Progress,
    ) -> Result<(), EngineError> {
        let snapshot = slot.state.lock().await.clone();
        self.checkpoints
            .create_checkpoint(
                slot.id,
                CheckpointSnapshot::capture(&slot.definition, &snapshot, CheckpointReason::PreRollback),
            )
            .await?;

        let plan = RollbackPlanner::plan(&slot.definition, &snapshot, &target, None);
        let report = RollbackExecutor::new(&self.runner)
            .execute(&plan, &slot.definition, &snapshot.params, &snapshot.context)
            .await;

        let mut exec = slot.state.lock().await;
        report.apply(&mut exec)?;
        for id in &report.rolled_back {
            self.notify_step(&exec, id);
        }
        self.persist(&exec).await?;
        self.sink.notify(WorkflowEvent::RollbackCompleted {
            execution_id: slot.id,
            success: report.success(),
            steps_rolled_back: report.rolled_back.len(),
        });
        tracing::info!(
            execution_id = %slot.id,
            step_id = origin,
            planned = plan.steps.len(),
            rolled_back = report.rolled_back.len(),
            success = report.success(),
            "compensated completed steps"
        );

        if let Some(reason) = report.emergency {
            progress.emergency = Some(EmergencyStop {
                step_id: Some(origin.to_string()),
                reason,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    async fn finish(&self, slot: &ExecutionSlot, progress: Progress) -> Result<(), EngineError> {
        let mut exec = slot.state.lock().await;

        let pending: Vec<String> = exec
            .step_results
            .values()
            .filter(|r| r.status == StepStatus::Pending)
            .map(|r| r.step_id.clone())
            .collect();
        for step_id in &pending {
            exec.skip_step(step_id)?;
            self.notify_step(&exec, step_id);
        }

        if exec.status == ExecutionStatus::Cancelled {
            tracing::info!(execution_id = %slot.id, skipped = pending.len(), "cancelled execution settled");
            return self.persist(&exec).await;
        }

        // an interrupting rollback owns the terminal transition
        if exec.status == ExecutionStatus::Running
            && slot.cancel.is_cancelled()
            && slot.rolling_back.load(Ordering::SeqCst)
        {
            tracing::info!(execution_id = %slot.id, skipped = pending.len(), "execution interrupted for rollback");
            return self.persist(&exec).await;
        }

        if let Some(emergency) = progress.emergency {
            exec.record_error(
                emergency.step_id.as_deref(),
                &StepFailure::system(format!("emergency stop: {}", emergency.reason))
                    .with_severity(Severity::Critical),
            );
            exec.transition(ExecutionStatus::Failed)?;
            self.sink.notify(WorkflowEvent::EmergencyRecovery {
                execution_id: slot.id,
                step_id: emergency.step_id,
                reason: emergency.reason.clone(),
            });
            self.sink.notify(WorkflowEvent::ExecutionFailed {
                execution_id: slot.id,
                error: emergency.reason,
            });
        } else if !progress.unresolved.is_empty() {
            exec.transition(ExecutionStatus::Failed)?;
            self.sink.notify(WorkflowEvent::ExecutionFailed {
                execution_id: slot.id,
                error: format!("unresolved failures in steps: {}", progress.unresolved.join(", ")),
            });
        } else {
            exec.transition(ExecutionStatus::Completed)?;
            self.sink.notify(WorkflowEvent::ExecutionCompleted {
                execution_id: slot.id,
                duration_ms: exec.metrics.total_duration_ms,
            });
        }

        self.persist(&exec).await?;
        slot.publish_status(exec.status);
        tracing::info!(
            execution_id = %slot.id,
            status = exec.status.as_str(),
            completed = exec.metrics.steps_completed,
            failed = exec.metrics.steps_failed,
            skipped = exec.metrics.steps_skipped,
            "execution finished"
        );
        Ok(())
    }

    /// Last resort when the driver itself errors.
    async fn force_fail(&self, slot: &ExecutionSlot, reason: &str) {
        let mut exec = slot.state.lock().await;
        exec.record_error(None, &StepFailure::system(reason));
        if exec.status.can_transition_to(ExecutionStatus::Failed) {
            let _ = exec.transition(ExecutionStatus::Failed);
            self.sink.notify(WorkflowEvent::ExecutionFailed {
                execution_id: slot.id,
                error: reason.to_string(),
            });
        }
        if let Err(e) = self.persist(&exec).await {
            tracing::warn!(execution_id = %slot.id, error = %e, "failed to persist failed execution");
        }
        slot.publish_status(exec.status);
    }

    async fn cancel_slot(&self, slot: &ExecutionSlot, reason: &str) -> Result<bool, EngineError> {
        let mut exec = slot.state.lock().await;
        if exec.status.is_terminal() {
            return Ok(false);
        }

        exec.transition(ExecutionStatus::Cancelled)?;
        exec.cancel_reason = Some(reason.to_string());
        self.persist(&exec).await?;
        slot.cancel.cancel();
        slot.publish_status(exec.status);

        self.sink.notify(WorkflowEvent::ExecutionCancelled {
            execution_id: slot.id,
            reason: reason.to_string(),
        });
        tracing::info!(execution_id = %slot.id, reason, "execution cancelled");
        Ok(true)
    }

    /// Roll back a quiesced execution.
    ///
    /// A running execution is interrupted without passing through
    /// `cancelled` and moves straight to `rolled_back` or `failed`.
    async fn rollback_slot(&self, slot: &ExecutionSlot, target: RollbackTarget) -> Result<bool, EngineError> {
        if slot.state.lock().await.status == ExecutionStatus::Running {
            tracing::info!(execution_id = %slot.id, "interrupting running execution for rollback");
            slot.cancel.cancel();
        }
        let mut done = slot.done_tx.subscribe();
        let _ = done.wait_for(|finished| *finished).await;

        let snapshot = slot.state.lock().await.clone();
        // the driver may have finished before the interrupt landed
        if !snapshot.status.is_rollback_eligible() {
            tracing::info!(
                execution_id = %slot.id,
                status = snapshot.status.as_str(),
                "rollback not permitted"
            );
            return Ok(false);
        }

        let baseline = match &target {
            RollbackTarget::Checkpoint {
                checkpoint_id: Some(checkpoint_id),
            } => Some(
                self.checkpoints
                    .get(*checkpoint_id)
                    .await?
                    .filter(|c| c.execution_id == slot.id)
                    .ok_or(CheckpointError::NotFound(*checkpoint_id))?,
            ),
            RollbackTarget::Checkpoint { checkpoint_id: None } => {
                self.checkpoints.latest_baseline(slot.id).await?
            }
            _ => None,
        };

        self.checkpoints
            .create_checkpoint(
                slot.id,
                CheckpointSnapshot::capture(&slot.definition, &snapshot, CheckpointReason::PreRollback),
            )
            .await?;

        let plan = RollbackPlanner::plan(&slot.definition, &snapshot, &target, baseline.as_ref());
        tracing::info!(
            execution_id = %slot.id,
            target = ?target,
            planned = plan.steps.len(),
            "rolling back execution"
        );
        let report = RollbackExecutor::new(&self.runner)
            .execute(&plan, &slot.definition, &snapshot.params, &snapshot.context)
            .await;

        let mut exec = slot.state.lock().await;
        report.apply(&mut exec)?;

        if report.success() {
            exec.transition(ExecutionStatus::RolledBack)?;
        } else {
            if exec.status != ExecutionStatus::Failed {
                exec.transition(ExecutionStatus::Failed)?;
            }
            match &report.emergency {
                Some(reason) => {
                    exec.record_error(
                        None,
                        &StepFailure::system(reason.clone()).with_severity(Severity::Critical),
                    );
                    let step_id = report
                        .records
                        .iter()
                        .find(|r| r.critical && !r.success)
                        .map(|r| r.target_step_id.clone());
                    self.sink.notify(WorkflowEvent::EmergencyRecovery {
                        execution_id: slot.id,
                        step_id,
                        reason: reason.clone(),
                    });
                }
                None => exec.record_error(None, &StepFailure::system("rollback completed with failures")),
            }
        }

        self.persist(&exec).await?;
        slot.publish_status(exec.status);
        self.sink.notify(WorkflowEvent::RollbackCompleted {
            execution_id: slot.id,
            success: report.success(),
            steps_rolled_back: report.rolled_back.len(),
        });
        Ok(report.success())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockStore, RecordingSink, ScriptedExecutor};
    use marketflow_types::execution::CheckpointReason;
    use marketflow_types::recovery::{EscalationAction, EscalationCondition, RecoveryStrategy, RemediationKind};
    use marketflow_types::workflow::{
        CompensatingAction, DependencyType, ResourceWeights, RetryPolicy, RollbackStrategy,
    };

    struct Harness {
        engine: WorkflowEngine<MockStore>,
        store: Arc<MockStore>,
        sink: RecordingSink,
        agent: ScriptedExecutor,
    }

    fn harness_with(agent: ScriptedExecutor, config: EngineConfig) -> Harness {
        let store = Arc::new(MockStore::default());
        let sink = RecordingSink::default();
        let registry = ExecutorRegistry::with_builtins().with_executor(StepKind::Task, agent.clone());
        let engine = WorkflowEngine::new(Arc::clone(&store), registry, Arc::new(sink.clone()), config);
        Harness {
            engine,
            store,
            sink,
            agent,
        }
    }

    fn harness(agent: ScriptedExecutor) -> Harness {
        harness_with(agent, EngineConfig::default())
    }

    fn task(id: &str) -> StepDefinition {
        StepDefinition::new(id, StepParams::task("agent", id))
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }

    fn undo(id: &str) -> RollbackStrategy {
        RollbackStrategy::compensate(vec![CompensatingAction::new(format!("undo_{id}"))])
    }

    async fn run(h: &Harness, def: WorkflowDefinition) -> Execution {
        let handle = h.engine.start(def, "actor", "session", json!({})).await.unwrap();
        handle.wait().await;
        h.engine.status(handle.execution_id).await.unwrap()
    }

    #[tokio::test]
    async fn sequential_steps_complete_in_order() {
        let h = harness(ScriptedExecutor::succeeding("agent"));
        let def = WorkflowDefinition::new("welcome")
            .with_step(task("a"))
            .with_step(task("b").depends_on(&["a"]));

        let exec = run(&h, def).await;

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(
            exec.metrics.status_sequence(),
            vec![
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Completed
            ]
        );
        assert_eq!(exec.completed_step_ids(), vec!["a", "b"]);
        let a = exec.step("a").unwrap();
        let b = exec.step("b").unwrap();
        assert!(b.started_at.unwrap() >= a.ended_at.unwrap());
        assert_eq!(
            h.sink.names(),
            vec![
                "execution_started",
                "step_completed",
                "step_completed",
                "execution_completed"
            ]
        );

        let stored = h.store.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn failed_dependency_skips_success_only_dependents() {
        let h = harness(
            ScriptedExecutor::succeeding("agent").always_failing("a", StepFailure::agent_failure("crm down")),
        );
        let def = WorkflowDefinition::new("dependents")
            .with_step(task("a").with_retry(no_retry()))
            .with_step(task("b").depends_on(&["a"]))
            .with_step(
                task("c")
                    .depends_on(&["a"])
                    .with_dependency_type(DependencyType::AnyTerminal),
            );

        let exec = run(&h, def).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.step_status("a"), Some(StepStatus::Failed));
        assert_eq!(exec.step_status("b"), Some(StepStatus::Skipped));
        assert_eq!(exec.step_status("c"), Some(StepStatus::Completed));
        assert_eq!(h.agent.forward_calls("b"), 0);
        assert!(!exec.error_log.is_empty());
        assert!(h.sink.names().contains(&"execution_failed"));
    }

    #[tokio::test]
    async fn precondition_rejects_before_execution_exists() {
        let h = harness(ScriptedExecutor::succeeding("agent"));
        let def = WorkflowDefinition::new("gated")
            .with_condition("has-email", "params.email != null")
            .with_step(task("a"));
        let workflow_id = def.id;

        let err = h.engine.start(def, "actor", "s", json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(msg) if msg.contains("has-email")));
        assert!(h.engine.list_executions(workflow_id, 10).await.unwrap().is_empty());
        assert!(h.sink.events().is_empty());
    }

    #[tokio::test]
    async fn cyclic_definition_rejected() {
        let h = harness(ScriptedExecutor::succeeding("agent"));
        let def = WorkflowDefinition::new("loop")
            .with_step(task("a").depends_on(&["b"]))
            .with_step(task("b").depends_on(&["a"]));

        let err = h.engine.start(def, "actor", "s", json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::Workflow(WorkflowError::CycleDetected(_))));
    }

    #[tokio::test]
    async fn missing_executor_rejected() {
        let store = Arc::new(MockStore::default());
        let engine = WorkflowEngine::new(
            store,
            ExecutorRegistry::with_builtins(),
            Arc::new(RecordingSink::default()),
            EngineConfig::default(),
        );
        let def = WorkflowDefinition::new("needs-agent").with_step(task("a"));

        let err = engine.start(def, "actor", "s", json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingExecutor(kinds) if kinds == "task"));
    }

    #[tokio::test]
    async fn guard_and_conditional_branches_skip_steps() {
        let h = harness(ScriptedExecutor::succeeding("agent"));
        let def = WorkflowDefinition::new("routing")
            .with_step(StepDefinition::new(
                "route",
                StepParams::Conditional {
                    condition: "params.vip == true".to_string(),
                    then_steps: vec!["call".to_string()],
                    else_steps: vec!["email".to_string()],
                },
            ))
            .with_step(task("call").depends_on(&["route"]))
            .with_step(task("email").depends_on(&["route"]))
            .with_step(task("survey").with_condition("params.survey == true"));

        let handle = h
            .engine
            .start(def, "actor", "s", json!({"vip": true, "survey": false}))
            .await
            .unwrap();
        assert_eq!(handle.wait().await, ExecutionStatus::Completed);

        let exec = h.engine.status(handle.execution_id).await.unwrap();
        assert_eq!(exec.step_status("call"), Some(StepStatus::Completed));
        assert_eq!(exec.step_status("email"), Some(StepStatus::Skipped));
        assert_eq!(exec.step_status("survey"), Some(StepStatus::Skipped));
        assert_eq!(h.agent.forward_calls("email"), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let h = harness(ScriptedExecutor::succeeding("agent"));
        let def = WorkflowDefinition::new("slow")
            .with_step(StepDefinition::new("pause", StepParams::Wait { duration_secs: 3600 }).with_timeout(7200))
            .with_step(task("after").depends_on(&["pause"]));

        let handle = h.engine.start(def, "actor", "s", json!({})).await.unwrap();
        assert!(h.engine.cancel(handle.execution_id, "customer unsubscribed").await.unwrap());
        assert_eq!(handle.wait().await, ExecutionStatus::Cancelled);

        let before = h.engine.status(handle.execution_id).await.unwrap();
        assert!(!h.engine.cancel(handle.execution_id, "again").await.unwrap());
        let after = h.engine.status(handle.execution_id).await.unwrap();
        assert_eq!(before, after);

        assert_eq!(after.cancel_reason.as_deref(), Some("customer unsubscribed"));
        assert_eq!(after.step_status("after"), Some(StepStatus::Skipped));
        assert!(matches!(
            after.step_status("pause"),
            Some(StepStatus::Skipped)
        ));
        assert_eq!(h.agent.forward_calls("after"), 0);
    }

    #[tokio::test]
    async fn unknown_execution_not_found() {
        let h = harness(ScriptedExecutor::succeeding("agent"));
        let id = Uuid::now_v7();
        assert!(matches!(
            h.engine.rollback(id, RollbackTarget::Initial).await,
            Err(EngineError::NotFound(missing)) if missing == id
        ));
        assert!(matches!(h.engine.cancel(id, "x").await, Err(EngineError::NotFound(_))));
        assert!(matches!(h.engine.status(id).await, Err(EngineError::NotFound(_))));
        assert!(h.sink.events().is_empty());
    }

    #[tokio::test]
    async fn group_rollback_all_compensates_completed_members() {
        let h = harness(
            ScriptedExecutor::succeeding("agent").always_failing("m2", StepFailure::agent_failure("bounce")),
        );
        let members = vec![
            task("m1").with_rollback(undo("m1")),
            task("m2").with_rollback(undo("m2")).with_retry(no_retry()),
            task("m3").with_rollback(undo("m3")),
        ];
        let def = WorkflowDefinition::new("fanout").with_step(StepDefinition::new("blast", StepParams::group(members)));

        let exec = run(&h, def).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.rollback_history.len(), 2);
        assert_eq!(exec.step_status("m1"), Some(StepStatus::RolledBack));
        assert_eq!(exec.step_status("m3"), Some(StepStatus::RolledBack));
        assert_eq!(exec.step_status("m2"), Some(StepStatus::Failed));
        assert_eq!(exec.step_status("blast"), Some(StepStatus::Failed));

        assert_eq!(exec.rollback_history[0].order, 0);
        assert!(exec.completed_in_order().is_empty());
        assert!(h.sink.names().contains(&"rollback_completed"));
    }

    #[tokio::test]
    async fn group_continue_partial_with_best_effort_completes() {
        let h = harness(
            ScriptedExecutor::succeeding("agent").always_failing("m1", StepFailure::agent_failure("bounce")),
        );
        let def = WorkflowDefinition::new("fanout").with_step(StepDefinition::new(
            "blast",
            StepParams::ParallelGroup {
                members: vec![task("m1").with_retry(no_retry()), task("m2"), task("m3")],
                strategy: ParallelStrategy::BestEffort,
                on_failure: GroupFailurePolicy::ContinuePartial,
                max_concurrency: Some(1),
            },
        ));

        let exec = run(&h, def).await;

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.step_status("m1"), Some(StepStatus::Failed));
        assert_eq!(exec.step_status("m3"), Some(StepStatus::Completed));
        let output = exec.step("blast").unwrap().output.clone().unwrap();
        assert_eq!(output["failed"], json!(["m1"]));
    }

    #[tokio::test]
    async fn group_abort_all_skips_undispatched_members() {
        let h = harness(
            ScriptedExecutor::succeeding("agent").always_failing("m1", StepFailure::agent_failure("bounce")),
        );
        let def = WorkflowDefinition::new("fanout").with_step(StepDefinition::new(
            "blast",
            StepParams::ParallelGroup {
                members: vec![
                    task("m1").with_retry(no_retry()).with_resources(ResourceWeights::new(0.5, 0.1, 0.1)),
                    task("m2"),
                    task("m3"),
                ],
                strategy: ParallelStrategy::AllSuccess,
                on_failure: GroupFailurePolicy::AbortAll,
                max_concurrency: Some(1),
            },
        ));

        let exec = run(&h, def).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.step_status("m2"), Some(StepStatus::Skipped));
        assert_eq!(exec.step_status("m3"), Some(StepStatus::Skipped));
        assert_eq!(h.agent.forward_calls("m2"), 0);
    }

    #[tokio::test]
    async fn group_retry_failed_respects_attempt_budget() {
        let h = harness(
            ScriptedExecutor::succeeding("agent")
                .failing("m2", 1, StepFailure::system("queue full"))
                .always_failing("m3", StepFailure::system("queue full")),
        );
        let two_attempts = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let def = WorkflowDefinition::new("fanout").with_step(StepDefinition::new(
            "blast",
            StepParams::ParallelGroup {
                members: vec![
                    task("m1"),
                    task("m2").with_retry(two_attempts),
                    task("m3").with_retry(no_retry()),
                ],
                strategy: ParallelStrategy::BestEffort,
                on_failure: GroupFailurePolicy::RetryFailed,
                max_concurrency: None,
            },
        ));

        let exec = run(&h, def).await;

        assert_eq!(exec.status, ExecutionStatus::Completed);

        // second dispatch is the member's last allowed attempt
        assert_eq!(h.agent.forward_calls("m2"), 2);
        let attempts: Vec<u32> = h
            .agent
            .calls()
            .iter()
            .filter(|c| c.step_id == "m2")
            .map(|c| c.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2]);
        let m2 = exec.step("m2").unwrap();
        assert_eq!(m2.status, StepStatus::Completed);
        assert_eq!(m2.retry_count, 1);
        assert_eq!(
            m2.history,
            vec![StepStatus::Pending, StepStatus::Running, StepStatus::Completed]
        );

        // single-attempt member is not dispatched again
        assert_eq!(h.agent.forward_calls("m3"), 1);
        assert_eq!(exec.step_status("m3"), Some(StepStatus::Failed));
    }

    fn sequential_group(members: Vec<StepDefinition>, strategy: ParallelStrategy) -> WorkflowDefinition {
        WorkflowDefinition::new("fanout").with_step(StepDefinition::new(
            "blast",
            StepParams::ParallelGroup {
                members,
                strategy,
                on_failure: GroupFailurePolicy::RollbackAll,
                max_concurrency: Some(1),
            },
        ))
    }

    #[tokio::test]
    async fn any_success_group_keeps_dispatching_after_failure() {
        let h = harness(
            ScriptedExecutor::succeeding("agent").always_failing("m1", StepFailure::agent_failure("bounce")),
        );
        let members = vec![
            task("m1").with_retry(no_retry()).with_rollback(undo("m1")),
            task("m2").with_rollback(undo("m2")),
            task("m3").with_rollback(undo("m3")),
        ];

        let exec = run(&h, sequential_group(members, ParallelStrategy::AnySuccess)).await;

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.step_status("m1"), Some(StepStatus::Failed));
        assert_eq!(exec.step_status("m2"), Some(StepStatus::Completed));
        assert_eq!(exec.step_status("m3"), Some(StepStatus::Completed));
        assert_eq!(exec.step_status("blast"), Some(StepStatus::Completed));
        assert!(h.agent.compensations().is_empty());
        assert!(!h.sink.names().contains(&"rollback_completed"));
    }

    #[tokio::test]
    async fn majority_success_group_halts_once_majority_lost() {
        let members = || {
            vec![
                task("m1").with_retry(no_retry()).with_rollback(undo("m1")),
                task("m2").with_retry(no_retry()).with_rollback(undo("m2")),
                task("m3").with_rollback(undo("m3")),
            ]
        };

        // one failure out of three still leaves a majority
        let h = harness(
            ScriptedExecutor::succeeding("agent").always_failing("m1", StepFailure::agent_failure("bounce")),
        );
        let exec = run(&h, sequential_group(members(), ParallelStrategy::MajoritySuccess)).await;
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.step_status("m2"), Some(StepStatus::Completed));
        assert_eq!(exec.step_status("m3"), Some(StepStatus::Completed));

        // two failures out of three rule it out
        let h = harness(
            ScriptedExecutor::succeeding("agent")
                .always_failing("m1", StepFailure::agent_failure("bounce"))
                .always_failing("m2", StepFailure::agent_failure("bounce")),
        );
        let exec = run(&h, sequential_group(members(), ParallelStrategy::MajoritySuccess)).await;
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.step_status("m3"), Some(StepStatus::Skipped));
        assert_eq!(h.agent.forward_calls("m3"), 0);
        assert_eq!(exec.step_status("blast"), Some(StepStatus::Failed));
    }

    #[tokio::test]
    async fn group_concurrency_bounded_by_limiter() {
        let h = harness(ScriptedExecutor::succeeding("agent").with_delay(Duration::from_millis(20)));
        let members: Vec<_> = (0..6).map(|i| task(&format!("m{i}"))).collect();
        let def = WorkflowDefinition::new("fanout").with_step(StepDefinition::new(
            "blast",
            StepParams::ParallelGroup {
                members,
                strategy: ParallelStrategy::AllSuccess,
                on_failure: GroupFailurePolicy::RollbackAll,
                max_concurrency: Some(2),
            },
        ));

        let exec = run(&h, def).await;
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(h.agent.peak() <= 2);
        assert!(h.agent.peak() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn starved_member_fails_with_timeout() {
        let h = harness(ScriptedExecutor::succeeding("agent").with_delay(Duration::from_secs(10)));
        let def = WorkflowDefinition::new("fanout").with_step(StepDefinition::new(
            "blast",
            StepParams::ParallelGroup {
                members: vec![task("slow").with_timeout(60), task("starved").with_timeout(2)],
                strategy: ParallelStrategy::BestEffort,
                on_failure: GroupFailurePolicy::ContinuePartial,
                max_concurrency: Some(1),
            },
        ));

        let exec = run(&h, def).await;

        let starved = exec.step("starved").unwrap();
        assert_eq!(starved.status, StepStatus::Failed);
        let error = starved.error.as_ref().unwrap();
        assert_eq!(error.kind, marketflow_types::recovery::ErrorKind::Timeout);
        assert!(error.message.contains("starvation"));
        assert_eq!(h.agent.forward_calls("starved"), 0);
    }

    #[tokio::test]
    async fn rollback_failed_execution_to_initial() {
        let h = harness(
            ScriptedExecutor::succeeding("agent").always_failing("c", StepFailure::agent_failure("payment declined")),
        );
        let def = WorkflowDefinition::new("checkout")
            .with_step(task("a").with_rollback(undo("a")))
            .with_step(task("b").depends_on(&["a"]).with_rollback(undo("b")))
            .with_step(task("c").depends_on(&["b"]).with_retry(no_retry()));

        let exec = run(&h, def).await;
        assert_eq!(exec.status, ExecutionStatus::Failed);

        assert!(h.engine.rollback(exec.id, RollbackTarget::Initial).await.unwrap());
        let exec = h.engine.status(exec.id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::RolledBack);
        let undone: Vec<_> = h.agent.compensations().into_iter().map(|c| c.step_id).collect();
        assert_eq!(undone, vec!["b", "a"]);

        let checkpoints = h.store.list_checkpoints(&exec.id).await.unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[1].snapshot.reason, CheckpointReason::PreRollback);

        // rolled_back is terminal for rollback purposes
        assert!(!h.engine.rollback(exec.id, RollbackTarget::Initial).await.unwrap());
    }

    #[tokio::test]
    async fn completed_execution_not_rollback_eligible() {
        let h = harness(ScriptedExecutor::succeeding("agent"));
        let exec = run(&h, WorkflowDefinition::new("done").with_step(task("a").with_rollback(undo("a")))).await;

        assert!(!h.engine.rollback(exec.id, RollbackTarget::Initial).await.unwrap());
        assert_eq!(h.engine.status(exec.id).await.unwrap().status, ExecutionStatus::Completed);
        assert_eq!(h.engine.live_executions(), 0);
    }

    #[tokio::test]
    async fn critical_rollback_failure_triggers_emergency() {
        let h = harness(
            ScriptedExecutor::succeeding("agent")
                .always_failing("b", StepFailure::agent_failure("nope"))
                .failing_compensation("undo_a"),
        );
        let def = WorkflowDefinition::new("ledger")
            .with_step(task("a").with_rollback(undo("a").critical()))
            .with_step(task("b").depends_on(&["a"]).with_retry(no_retry()));

        let exec = run(&h, def).await;
        assert!(!h.engine.rollback(exec.id, RollbackTarget::Initial).await.unwrap());

        let exec = h.engine.status(exec.id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.rollback_attempts[0].emergency);
        assert!(!exec.rollback_attempts[0].success);
        assert!(h.sink.names().contains(&"emergency_recovery"));
    }

    #[tokio::test]
    async fn failed_rollback_capable_step_compensates_completed_steps() {
        let h = harness(
            ScriptedExecutor::succeeding("agent").always_failing("b", StepFailure::agent_failure("crm rejected")),
        );
        let def = WorkflowDefinition::new("checkout")
            .with_step(task("a").with_rollback(undo("a")))
            .with_step(
                task("b")
                    .depends_on(&["a"])
                    .with_rollback(undo("b"))
                    .with_retry(no_retry()),
            )
            .with_step(task("c").depends_on(&["a"]));

        let exec = run(&h, def).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.step_status("a"), Some(StepStatus::RolledBack));
        assert_eq!(exec.step_status("b"), Some(StepStatus::Failed));
        assert_eq!(exec.step_status("c"), Some(StepStatus::Skipped));
        assert_eq!(h.agent.forward_calls("c"), 0);

        let undone: Vec<_> = h.agent.compensations().into_iter().map(|c| c.step_id).collect();
        assert_eq!(undone, vec!["a"]);
        assert_eq!(exec.rollback_history.len(), 1);

        let checkpoints = h.store.list_checkpoints(&exec.id).await.unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[1].snapshot.reason, CheckpointReason::PreRollback);

        let names = h.sink.names();
        assert!(names.contains(&"rollback_completed"));
        assert_eq!(names.last(), Some(&"execution_failed"));
    }

    #[tokio::test]
    async fn failed_step_without_rollback_leaves_completed_steps() {
        let h = harness(
            ScriptedExecutor::succeeding("agent").always_failing("b", StepFailure::agent_failure("crm rejected")),
        );
        let def = WorkflowDefinition::new("checkout")
            .with_step(task("a").with_rollback(undo("a")))
            .with_step(task("b").depends_on(&["a"]).with_retry(no_retry()));

        let exec = run(&h, def).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.step_status("a"), Some(StepStatus::Completed));
        assert!(exec.rollback_history.is_empty());
        assert!(h.agent.compensations().is_empty());
    }

    #[tokio::test]
    async fn finished_executions_leave_live_map() {
        let h = harness(
            ScriptedExecutor::succeeding("agent").always_failing("b", StepFailure::agent_failure("nope")),
        );
        let def = WorkflowDefinition::new("checkout")
            .with_step(task("a").with_rollback(undo("a")))
            .with_step(task("b").depends_on(&["a"]).with_retry(no_retry()));

        let exec = run(&h, def).await;
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(h.engine.live_executions(), 0);

        let handle = h.engine.handle(exec.id).await.unwrap();
        assert_eq!(handle.current(), ExecutionStatus::Failed);
        assert!(!h.engine.cancel(exec.id, "late").await.unwrap());
        assert_eq!(h.engine.live_executions(), 0);

        assert!(h.engine.rollback(exec.id, RollbackTarget::Initial).await.unwrap());
        assert_eq!(h.engine.live_executions(), 0);
        assert_eq!(h.engine.status(exec.id).await.unwrap().status, ExecutionStatus::RolledBack);
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_interrupts_running_execution_without_cancelling() {
        let h = harness(ScriptedExecutor::succeeding("agent").with_delay(Duration::from_secs(5)));
        let def = WorkflowDefinition::new("checkout")
            .with_step(task("a").with_rollback(undo("a")))
            .with_step(task("b").depends_on(&["a"]))
            .with_step(task("c").depends_on(&["b"]));

        let handle = h.engine.start(def, "actor", "session", json!({})).await.unwrap();
        let id = handle.execution_id;
        while h.engine.status(id).await.unwrap().step_status("b") != Some(StepStatus::Running) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(h.engine.rollback(id, RollbackTarget::Initial).await.unwrap());

        let exec = h.engine.status(id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::RolledBack);
        assert_eq!(
            exec.metrics.status_sequence(),
            vec![
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::RolledBack
            ]
        );
        assert_eq!(exec.step_status("a"), Some(StepStatus::RolledBack));
        assert_eq!(exec.step_status("c"), Some(StepStatus::Skipped));
        assert!(exec.cancel_reason.is_none());

        let names = h.sink.names();
        assert!(!names.contains(&"execution_cancelled"));
        assert!(names.contains(&"rollback_completed"));
        assert_eq!(h.engine.live_executions(), 0);
    }

    #[tokio::test]
    async fn critical_step_failure_stops_execution() {
        let failure = StepFailure::system("ledger corrupted").with_severity(Severity::Critical);
        let h = harness(ScriptedExecutor::succeeding("agent").always_failing("a", failure));
        let def = WorkflowDefinition::new("ledger")
            .with_step(task("a"))
            .with_step(task("b"));

        let exec = run(&h, def).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.step_status("b"), Some(StepStatus::Skipped));
        let names = h.sink.names();
        assert!(names.contains(&"escalation"));
        assert!(names.contains(&"emergency_recovery"));
    }

    #[tokio::test]
    async fn configured_fallback_resolves_agent_failure() {
        let agent = ScriptedExecutor::succeeding("agent").always_failing("a", StepFailure::agent_failure("quota"));
        let config = EngineConfig {
            recovery: vec![
                RecoveryStrategy::fallback(marketflow_types::recovery::ErrorKind::AgentFailure, "backup"),
                RecoveryStrategy::new(None, RemediationKind::Escalate)
                    .with_escalation(EscalationCondition::RetriesExhausted, EscalationAction::NotifyAdmin),
            ],
            ..EngineConfig::default()
        };
        let store = Arc::new(MockStore::default());
        let registry = ExecutorRegistry::with_builtins()
            .with_executor(StepKind::Task, agent)
            .with_named(ScriptedExecutor::succeeding("backup"));
        let engine = WorkflowEngine::new(store, registry, Arc::new(RecordingSink::default()), config);

        let handle = engine
            .start(WorkflowDefinition::new("fb").with_step(task("a")), "actor", "s", json!({}))
            .await
            .unwrap();
        assert_eq!(handle.wait().await, ExecutionStatus::Completed);

        let exec = engine.status(handle.execution_id).await.unwrap();
        let a = exec.step("a").unwrap();
        assert!(a.fallback_used);
        assert_eq!(a.output.as_ref().unwrap()["executor"], "backup");
    }

    #[tokio::test]
    async fn definitions_are_versioned() {
        let h = harness(ScriptedExecutor::succeeding("agent"));
        let yaml = r#"
name: nurture
steps:
  - id: a
    name: A
    type: task
    operation: draft
    params:
      type: task
      agent: writer
      instructions: draft
  - id: b
    name: B
    type: task
    operation: send
    depends_on: [a]
    params:
      type: task
      agent: writer
      instructions: send
"#;
        let v1 = h.engine.create_workflow_from_spec(yaml).await.unwrap();
        assert_eq!(v1.version, 1);

        let v2 = h.engine.update_workflow(v1.clone()).await.unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.id, v1.id);

        let report = h.engine.optimize_workflow(v1.id).await.unwrap();
        assert_eq!(report.waves, vec![vec!["a".to_string()], vec!["b".to_string()]]);

        let unknown = WorkflowDefinition::new("ghost").with_step(task("a"));
        assert!(matches!(
            h.engine.update_workflow(unknown).await,
            Err(EngineError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn engine_wide_limiter_shared_across_groups() {
        let config = EngineConfig {
            limiter_scope: LimiterScope::EngineWide,
            max_concurrency: 1,
            ..EngineConfig::default()
        };
        let h = harness_with(ScriptedExecutor::succeeding("agent").with_delay(Duration::from_millis(5)), config);
        let def = WorkflowDefinition::new("fanout").with_step(StepDefinition::new(
            "blast",
            StepParams::group(vec![task("m1"), task("m2"), task("m3")]),
        ));

        let exec = run(&h, def).await;
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(h.agent.peak(), 1);
    }
}
