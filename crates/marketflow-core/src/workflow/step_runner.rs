//! Single-attempt step execution and the built-in executors.
//!
//! `StepRunner` applies the step timeout and success criteria around one
//! executor call. Retries, fallbacks and escalation are the recovery
//! engine's job.

use std::sync::Arc;
use std::time::Duration;

use marketflow_types::execution::StepOutcome;
use marketflow_types::recovery::StepFailure;
use marketflow_types::workflow::{StepDefinition, StepParams};
use serde_json::json;

use super::executor::{BoxStepExecutor, ExecutorRegistry, StepExecutor, StepInvocation};
use super::expression;

/// Default step timeout in seconds.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

pub struct StepRunner {
    registry: Arc<ExecutorRegistry>,
    default_timeout: Duration,
}

impl StepRunner {
    pub fn new(registry: Arc<ExecutorRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn timeout_for(&self, step: &StepDefinition) -> Duration {
        step.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// The executor registered for the step's kind.
    pub fn primary_executor(&self, step: &StepDefinition) -> Result<Arc<BoxStepExecutor>, StepFailure> {
        self.registry.for_kind(step.kind).ok_or_else(|| {
            StepFailure::system(format!("no executor registered for step kind '{}'", step.kind))
        })
    }

    /// Run one attempt under the step timeout.
    ///
    /// For forward invocations the step's success criteria are checked
    /// against the output; a miss is an `agent_failure`.
    pub async fn run_once(
        &self,
        executor: &BoxStepExecutor,
        invocation: &StepInvocation,
    ) -> Result<StepOutcome, StepFailure> {
        let step = &invocation.step;
        let timeout = self.timeout_for(step);

        tracing::debug!(
            execution_id = %invocation.execution_id,
            step_id = step.id.as_str(),
            executor = executor.name(),
            attempt = invocation.attempt,
            compensation = invocation.is_compensation(),
            "running step"
        );

        let outcome = match tokio::time::timeout(timeout, executor.execute(invocation)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StepFailure::timeout(format!(
                    "step '{}' exceeded {}s timeout",
                    step.id,
                    timeout.as_secs()
                )));
            }
        };

        if invocation.is_compensation() {
            return Ok(outcome);
        }

        if let Some(criteria) = &step.success_criteria {
            let ctx = expression::output_context(&outcome.output);
            match expression::evaluate(&criteria.expression, &ctx) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(StepFailure::agent_failure(format!(
                        "success criteria not met: {}",
                        criteria.expression
                    )));
                }
                Err(e) => {
                    return Err(StepFailure::agent_failure(format!(
                        "success criteria could not be evaluated: {e}"
                    )));
                }
            }
        }

        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Built-in executors
// ---------------------------------------------------------------------------

/// Sleeps for a `wait` step's duration. Cancellation ends the wait early.
pub struct WaitExecutor;

impl StepExecutor for WaitExecutor {
    fn name(&self) -> &str {
        "wait"
    }

    async fn execute(&self, invocation: &StepInvocation) -> Result<StepOutcome, StepFailure> {
        if invocation.is_compensation() {
            return Ok(StepOutcome::new(json!({ "compensated": true })));
        }

        let StepParams::Wait { duration_secs } = &invocation.step.params else {
            return Err(StepFailure::validation(format!(
                "step '{}' is not a wait step",
                invocation.step.id
            )));
        };

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(*duration_secs)) => {
                Ok(StepOutcome::new(json!({ "waited_secs": duration_secs })))
            }
            _ = invocation.cancellation.cancelled() => {
                Err(StepFailure::agent_failure("wait interrupted by cancellation"))
            }
        }
    }
}

/// Evaluates a `conditional` step and reports the selected branch.
///
/// Output: `{ condition_met, selected_steps, skipped_steps }`.
pub struct ConditionalExecutor;

impl StepExecutor for ConditionalExecutor {
    fn name(&self) -> &str {
        "conditional"
    }

    async fn execute(&self, invocation: &StepInvocation) -> Result<StepOutcome, StepFailure> {
        if invocation.is_compensation() {
            return Ok(StepOutcome::new(json!({ "compensated": true })));
        }

        let StepParams::Conditional {
            condition,
            then_steps,
            else_steps,
        } = &invocation.step.params
        else {
            return Err(StepFailure::validation(format!(
                "step '{}' is not a conditional step",
                invocation.step.id
            )));
        };

        let condition_met = expression::evaluate(condition, &invocation.scope())
            .map_err(|e| StepFailure::validation(format!("condition '{condition}': {e}")))?;

        let (selected, skipped) = if condition_met {
            (then_steps, else_steps)
        } else {
            (else_steps, then_steps)
        };

        Ok(StepOutcome::new(json!({
            "condition_met": condition_met,
            "selected_steps": selected,
            "skipped_steps": skipped,
        })))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedExecutor;
    use marketflow_types::recovery::ErrorKind;
    use uuid::Uuid;

    fn runner() -> StepRunner {
        StepRunner::new(
            Arc::new(ExecutorRegistry::with_builtins()),
            Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
        )
    }

    fn invocation(step: StepDefinition, params: serde_json::Value) -> StepInvocation {
        StepInvocation::forward(Uuid::now_v7(), step, params, json!({}))
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_becomes_timeout_failure() {
        let slow = BoxStepExecutor::new(ScriptedExecutor::succeeding("slow").with_delay(Duration::from_secs(10)));
        let step = StepDefinition::new("a", StepParams::task("bot", "x")).with_timeout(2);

        let err = runner().run_once(&slow, &invocation(step, json!({}))).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.message.contains("2s"));
    }

    #[tokio::test]
    async fn success_criteria_checked_on_output() {
        let exec = BoxStepExecutor::new(ScriptedExecutor::succeeding("crm"));
        let ok = StepDefinition::new("a", StepParams::task("bot", "x"))
            .with_success_criteria("output.executor == 'crm'");
        assert!(runner().run_once(&exec, &invocation(ok, json!({}))).await.is_ok());

        let miss = StepDefinition::new("b", StepParams::task("bot", "x"))
            .with_success_criteria("output.delivered == true");
        let err = runner().run_once(&exec, &invocation(miss, json!({}))).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AgentFailure);
        assert!(err.message.contains("success criteria not met"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_executor_sleeps_for_duration() {
        let runner = runner();
        let step = StepDefinition::new("pause", StepParams::Wait { duration_secs: 30 }).with_timeout(60);
        let exec = runner.primary_executor(&step).unwrap();

        let start = tokio::time::Instant::now();
        let outcome = runner.run_once(&exec, &invocation(step, json!({}))).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(outcome.output["waited_secs"], 30);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_executor_honours_cancellation() {
        let step = StepDefinition::new("pause", StepParams::Wait { duration_secs: 3600 });
        let inv = invocation(step, json!({}));
        inv.cancellation.cancel();

        let err = WaitExecutor.execute(&inv).await.unwrap_err();
        assert!(err.message.contains("cancellation"));
    }

    #[tokio::test]
    async fn conditional_executor_selects_branch() {
        let step = StepDefinition::new(
            "route",
            StepParams::Conditional {
                condition: "params.vip == true".to_string(),
                then_steps: vec!["call".to_string()],
                else_steps: vec!["email".to_string()],
            },
        );

        let vip = ConditionalExecutor
            .execute(&invocation(step.clone(), json!({"vip": true})))
            .await
            .unwrap();
        assert_eq!(vip.output["condition_met"], true);
        assert_eq!(vip.output["selected_steps"], json!(["call"]));
        assert_eq!(vip.output["skipped_steps"], json!(["email"]));

        let regular = ConditionalExecutor
            .execute(&invocation(step, json!({"vip": false})))
            .await
            .unwrap();
        assert_eq!(regular.output["selected_steps"], json!(["email"]));
    }

    #[tokio::test]
    async fn missing_executor_is_system_failure() {
        let step = StepDefinition::new("a", StepParams::task("bot", "x"));
        let err = runner().primary_executor(&step).unwrap_err();
        assert_eq!(err.kind, ErrorKind::System);
    }
}
