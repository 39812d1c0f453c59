//! Step executor port, its object-safe wrapper, and the executor registry.
//!
//! Follows the same blanket-impl pattern as the engine's other ports:
//! 1. `StepExecutor` uses RPITIT async methods
//! 2. `StepExecutorDyn` is the object-safe twin with boxed futures
//! 3. `BoxStepExecutor` wraps `Box<dyn StepExecutorDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use marketflow_types::execution::StepOutcome;
use marketflow_types::recovery::StepFailure;
use marketflow_types::workflow::{CompensatingAction, StepDefinition, StepKind, WorkflowDefinition};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Whether a step is being run forward or compensated.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationMode {
    Forward,
    /// Undo a previously completed run of the step.
    Compensation { action: CompensatingAction },
}

/// Everything an executor receives for one attempt.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub execution_id: Uuid,
    pub step: StepDefinition,
    pub mode: InvocationMode,
    /// 1-based attempt number.
    pub attempt: u32,
    pub params: Value,
    pub context: Value,
    /// `steps.<id>.{status, output}` at dispatch time.
    pub steps: Value,
    /// Cancelled when the execution is cancelled or its group aborts.
    pub cancellation: CancellationToken,
}

impl StepInvocation {
    /// A forward invocation for the first attempt.
    pub fn forward(execution_id: Uuid, step: StepDefinition, params: Value, context: Value) -> Self {
        Self {
            execution_id,
            step,
            mode: InvocationMode::Forward,
            attempt: 1,
            params,
            context,
            steps: json!({}),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_steps(mut self, steps: Value) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// A compensation invocation for `action`, derived from this one.
    pub fn compensation(&self, action: CompensatingAction) -> Self {
        Self {
            mode: InvocationMode::Compensation { action },
            attempt: 1,
            ..self.clone()
        }
    }

    pub fn is_compensation(&self) -> bool {
        matches!(self.mode, InvocationMode::Compensation { .. })
    }

    /// `{ params, context, steps }` for expression evaluation.
    pub fn scope(&self) -> Value {
        json!({
            "params": self.params,
            "context": self.context,
            "steps": self.steps,
        })
    }
}

// ---------------------------------------------------------------------------
// StepExecutor trait
// ---------------------------------------------------------------------------

/// Runs one kind of step.
///
/// Executors must be idempotent under retry; the engine passes the attempt
/// number so implementations can derive idempotency keys.
pub trait StepExecutor: Send + Sync + 'static {
    /// Registered name, used for fallback lookup and logging.
    fn name(&self) -> &str;

    fn execute(
        &self,
        invocation: &StepInvocation,
    ) -> impl Future<Output = Result<StepOutcome, StepFailure>> + Send;
}

/// Object-safe version of [`StepExecutor`] with boxed futures.
pub trait StepExecutorDyn: Send + Sync {
    fn name(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        invocation: &'a StepInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, StepFailure>> + Send + 'a>>;
}

impl<T: StepExecutor> StepExecutorDyn for T {
    fn name(&self) -> &str {
        StepExecutor::name(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        invocation: &'a StepInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, StepFailure>> + Send + 'a>> {
        Box::pin(self.execute(invocation))
    }
}

/// Type-erased step executor for runtime registration.
pub struct BoxStepExecutor {
    inner: Box<dyn StepExecutorDyn + Send + Sync>,
}

impl BoxStepExecutor {
    pub fn new<T: StepExecutor>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn execute(&self, invocation: &StepInvocation) -> Result<StepOutcome, StepFailure> {
        self.inner.execute_boxed(invocation).await
    }
}

impl std::fmt::Debug for BoxStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepExecutor")
            .field("name", &self.name())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Executors by step kind, plus named executors available as fallbacks.
///
/// Built once at engine construction and read-only afterwards.
#[derive(Debug, Default)]
pub struct ExecutorRegistry {
    by_kind: HashMap<StepKind, Arc<BoxStepExecutor>>,
    named: HashMap<String, Arc<BoxStepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `wait` and `conditional` executors.
    pub fn with_builtins() -> Self {
        Self::new()
            .with_executor(StepKind::Wait, super::step_runner::WaitExecutor)
            .with_executor(StepKind::Conditional, super::step_runner::ConditionalExecutor)
    }

    /// Register the executor for a step kind, replacing any previous one.
    ///
    /// The executor is also reachable by name.
    pub fn with_executor<T: StepExecutor>(mut self, kind: StepKind, executor: T) -> Self {
        self.register(kind, executor);
        self
    }

    /// Register an executor usable only as a fallback.
    pub fn with_named<T: StepExecutor>(mut self, executor: T) -> Self {
        let boxed = Arc::new(BoxStepExecutor::new(executor));
        self.named.insert(boxed.name().to_string(), boxed);
        self
    }

    pub fn register<T: StepExecutor>(&mut self, kind: StepKind, executor: T) {
        let boxed = Arc::new(BoxStepExecutor::new(executor));
        self.named.insert(boxed.name().to_string(), Arc::clone(&boxed));
        self.by_kind.insert(kind, boxed);
    }

    pub fn for_kind(&self, kind: StepKind) -> Option<Arc<BoxStepExecutor>> {
        self.by_kind.get(&kind).cloned()
    }

    pub fn named(&self, name: &str) -> Option<Arc<BoxStepExecutor>> {
        self.named.get(name).cloned()
    }

    /// Step kinds used by `def` with no registered executor.
    ///
    /// `parallel_group` is dispatched by the coordinator itself.
    pub fn missing_kinds(&self, def: &WorkflowDefinition) -> Vec<StepKind> {
        let mut missing: Vec<StepKind> = def
            .all_steps()
            .into_iter()
            .map(|s| s.kind)
            .filter(|k| *k != StepKind::ParallelGroup && !self.by_kind.contains_key(k))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}
