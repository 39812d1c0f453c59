//! Recovery strategy engine.
//!
//! Maps a failure's [`ErrorKind`] to a [`RecoveryStrategy`] and runs its
//! remediation. When the remediation leaves the failure unresolved, the
//! strategy's escalation rules are evaluated in order and the first match
//! runs. The strategy table is fixed at construction.

use marketflow_types::event::WorkflowEvent;
use marketflow_types::execution::StepOutcome;
use marketflow_types::recovery::{
    ErrorKind, EscalationAction, EscalationCondition, RecoveryStrategy, RemediationKind, StepFailure,
};
use marketflow_types::workflow::CompensatingAction;

use super::executor::{BoxStepExecutor, StepInvocation};
use super::retry::{RetryHandler, RetrySchedule};
use super::step_runner::StepRunner;
use crate::event::NotificationSink;

/// The built-in strategy table.
///
/// Every entry escalates critical failures to an emergency stop and notifies
/// an administrator otherwise.
pub fn default_strategies() -> Vec<RecoveryStrategy> {
    let with_rules = |s: RecoveryStrategy| {
        s.with_escalation(EscalationCondition::CriticalError, EscalationAction::EmergencyStop)
            .with_escalation(EscalationCondition::RetriesExhausted, EscalationAction::NotifyAdmin)
    };
    vec![
        with_rules(RecoveryStrategy::new(Some(ErrorKind::AgentFailure), RemediationKind::Retry)),
        with_rules(RecoveryStrategy::new(Some(ErrorKind::Timeout), RemediationKind::Retry)),
        with_rules(RecoveryStrategy::new(Some(ErrorKind::System), RemediationKind::Escalate)),
        with_rules(RecoveryStrategy::new(Some(ErrorKind::Validation), RemediationKind::Escalate)),
        with_rules(RecoveryStrategy::new(None, RemediationKind::Retry)),
    ]
}

// ---------------------------------------------------------------------------
// RecoveryOutcome
// ---------------------------------------------------------------------------

/// What recovery did for one failed step.
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    /// Final result of the step after remediation.
    pub result: Result<StepOutcome, StepFailure>,
    /// Re-attempts made by the `retry` remediation.
    pub retries: u32,
    pub fallback_used: bool,
    /// Compensation ran to completion for a failure that stays failed.
    pub compensated: bool,
    /// An `emergency_stop` escalation fired.
    pub emergency_stop: bool,
    pub escalations: Vec<EscalationAction>,
    /// Last attempt number used.
    attempt: u32,
}

impl RecoveryOutcome {
    fn unresolved(failure: StepFailure, attempt: u32) -> Self {
        Self {
            result: Err(failure),
            retries: 0,
            fallback_used: false,
            compensated: false,
            emergency_stop: false,
            escalations: Vec::new(),
            attempt,
        }
    }

    /// Whether the execution may continue past this step.
    pub fn resolved(&self) -> bool {
        self.result.is_ok() || self.compensated
    }

    fn failure(&self) -> Option<&StepFailure> {
        self.result.as_ref().err()
    }

    fn next_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }
}

// ---------------------------------------------------------------------------
// RecoveryEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    strategies: Vec<RecoveryStrategy>,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl RecoveryEngine {
    /// An engine over `strategies`; an empty table means [`default_strategies`].
    pub fn new(strategies: Vec<RecoveryStrategy>) -> Self {
        let strategies = if strategies.is_empty() {
            default_strategies()
        } else {
            strategies
        };
        Self { strategies }
    }

    /// The strategy for `kind`, falling back to the default entry.
    pub fn strategy_for(&self, kind: ErrorKind) -> Option<&RecoveryStrategy> {
        self.strategies
            .iter()
            .find(|s| s.error_kind == Some(kind))
            .or_else(|| self.strategies.iter().find(|s| s.error_kind.is_none()))
    }

    /// Try to recover a failed forward invocation.
    ///
    /// Never panics and never propagates: an unresolved failure comes back in
    /// `result`.
    pub async fn recover(
        &self,
        runner: &StepRunner,
        primary: &BoxStepExecutor,
        invocation: &StepInvocation,
        failure: StepFailure,
        sink: &dyn NotificationSink,
    ) -> RecoveryOutcome {
        let step_id = invocation.step.id.as_str();
        let mut outcome = RecoveryOutcome::unresolved(failure, invocation.attempt);

        let Some(strategy) = outcome.failure().and_then(|f| self.strategy_for(f.kind)) else {
            tracing::error!(
                execution_id = %invocation.execution_id,
                step_id,
                "no recovery strategy configured"
            );
            return outcome;
        };

        if invocation.cancellation.is_cancelled() {
            return outcome;
        }

        tracing::info!(
            execution_id = %invocation.execution_id,
            step_id,
            remediation = ?strategy.remediation,
            "recovering step"
        );

        match strategy.remediation {
            RemediationKind::Retry => {
                self.retry(runner, primary, invocation, strategy, &mut outcome).await;
            }
            RemediationKind::Fallback => match &strategy.parameters.fallback_executor {
                Some(name) => self.fallback(runner, name, invocation, &mut outcome).await,
                None => tracing::warn!(step_id, "fallback strategy names no executor"),
            },
            RemediationKind::Compensate => {
                let actions = &strategy.parameters.compensation;
                self.compensate(runner, primary, invocation, actions, &mut outcome).await;
            }
            RemediationKind::Escalate => {
                self.emit_escalation(invocation, EscalationAction::NotifyAdmin, sink, &mut outcome);
            }
        }

        if outcome.resolved() || invocation.cancellation.is_cancelled() {
            return outcome;
        }

        self.escalate(runner, invocation, strategy, sink, &mut outcome).await;
        outcome
    }

    async fn retry(
        &self,
        runner: &StepRunner,
        primary: &BoxStepExecutor,
        invocation: &StepInvocation,
        strategy: &RecoveryStrategy,
        outcome: &mut RecoveryOutcome,
    ) {
        let schedule = RetrySchedule::resolve(invocation.step.retry.as_ref(), strategy);

        while RetryHandler::should_retry(&schedule, outcome.attempt) {
            let delay = RetryHandler::delay_for(&schedule, outcome.attempt);
            tracing::debug!(
                execution_id = %invocation.execution_id,
                step_id = invocation.step.id.as_str(),
                attempt = outcome.attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying step after backoff"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = invocation.cancellation.cancelled() => return,
            }

            let retry = StepInvocation {
                attempt: outcome.next_attempt(),
                ..invocation.clone()
            };
            outcome.retries += 1;
            outcome.result = runner.run_once(primary, &retry).await;
            if outcome.result.is_ok() {
                return;
            }
        }
    }

    async fn fallback(
        &self,
        runner: &StepRunner,
        executor_name: &str,
        invocation: &StepInvocation,
        outcome: &mut RecoveryOutcome,
    ) {
        let Some(executor) = runner.registry().named(executor_name) else {
            tracing::warn!(
                step_id = invocation.step.id.as_str(),
                executor = executor_name,
                "fallback executor not registered"
            );
            return;
        };

        let attempt = StepInvocation {
            attempt: outcome.next_attempt(),
            ..invocation.clone()
        };
        outcome.fallback_used = true;
        outcome.result = runner.run_once(&executor, &attempt).await;
    }

    async fn compensate(
        &self,
        runner: &StepRunner,
        primary: &BoxStepExecutor,
        invocation: &StepInvocation,
        actions: &[CompensatingAction],
        outcome: &mut RecoveryOutcome,
    ) {
        if actions.is_empty() {
            tracing::warn!(
                step_id = invocation.step.id.as_str(),
                "compensate strategy declares no actions"
            );
            return;
        }

        for action in actions {
            let comp = invocation.compensation(action.clone());
            if let Err(e) = runner.run_once(primary, &comp).await {
                tracing::warn!(
                    step_id = invocation.step.id.as_str(),
                    operation = action.operation.as_str(),
                    error = %e,
                    "compensation action failed"
                );
                return;
            }
        }
        outcome.compensated = true;
    }

    /// Evaluate escalation rules in order; the first match runs.
    async fn escalate(
        &self,
        runner: &StepRunner,
        invocation: &StepInvocation,
        strategy: &RecoveryStrategy,
        sink: &dyn NotificationSink,
        outcome: &mut RecoveryOutcome,
    ) {
        let Some(failure) = outcome.failure().cloned() else {
            return;
        };
        let Some(rule) = strategy.escalation.iter().find(|r| r.condition.matches(&failure)) else {
            return;
        };

        match &rule.action {
            EscalationAction::NotifyAdmin => {
                if !outcome.escalations.contains(&EscalationAction::NotifyAdmin) {
                    self.emit_escalation(invocation, EscalationAction::NotifyAdmin, sink, outcome);
                }
            }
            EscalationAction::SwitchToFallback { executor } => {
                self.emit_escalation(invocation, rule.action.clone(), sink, outcome);
                self.fallback(runner, executor, invocation, outcome).await;
            }
            EscalationAction::EmergencyStop => {
                self.emit_escalation(invocation, EscalationAction::EmergencyStop, sink, outcome);
                outcome.emergency_stop = true;
            }
        }
    }

    fn emit_escalation(
        &self,
        invocation: &StepInvocation,
        action: EscalationAction,
        sink: &dyn NotificationSink,
        outcome: &mut RecoveryOutcome,
    ) {
        let Some(failure) = outcome.failure().cloned() else {
            return;
        };
        tracing::warn!(
            execution_id = %invocation.execution_id,
            step_id = invocation.step.id.as_str(),
            action = ?action,
            error = %failure,
            "escalating step failure"
        );
        sink.notify(WorkflowEvent::Escalation {
            execution_id: invocation.execution_id,
            step_id: invocation.step.id.clone(),
            action: action.clone(),
            failure,
        });
        outcome.escalations.push(action);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
