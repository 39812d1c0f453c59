//! Rollback planning and execution.
//!
//! The planner turns completed, rollback-capable steps into an ordered
//! [`RollbackPlan`]: the most recently completed step gets order 0 and runs
//! first. The executor runs the plan once through the step executors in
//! compensation mode and reports what happened; applying the report to the
//! execution is the coordinator's job.

use std::collections::HashSet;

use chrono::Utc;
use marketflow_types::error::TransitionError;
use marketflow_types::execution::{
    Checkpoint, Execution, RollbackAttempt, RollbackPlan, RollbackRecord, RollbackStep, RollbackTarget,
};
use marketflow_types::workflow::{CompensatingAction, RollbackKind, StepDefinition, WorkflowDefinition};
use serde_json::{json, Value};
use uuid::Uuid;

use super::executor::StepInvocation;
use super::step_runner::StepRunner;

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

pub struct RollbackPlanner;

impl RollbackPlanner {
    /// Build the plan for `target`.
    ///
    /// `baseline` is the checkpoint a `checkpoint` target restores; steps it
    /// already lists as completed are kept. Without a baseline every completed
    /// step is eligible.
    pub fn plan(
        definition: &WorkflowDefinition,
        execution: &Execution,
        target: &RollbackTarget,
        baseline: Option<&Checkpoint>,
    ) -> RollbackPlan {
        let keep: HashSet<&str> = match (target, baseline) {
            (RollbackTarget::Checkpoint { .. }, Some(cp)) => {
                cp.snapshot.completed_steps.iter().map(String::as_str).collect()
            }
            _ => HashSet::new(),
        };

        let eligible: Vec<&StepDefinition> = execution
            .completed_in_order()
            .into_iter()
            .filter(|r| match target {
                RollbackTarget::Initial => true,
                RollbackTarget::Checkpoint { .. } => !keep.contains(r.step_id.as_str()),
                RollbackTarget::Custom { step_ids } => step_ids.contains(&r.step_id),
            })
            .filter_map(|r| definition.find_step(&r.step_id))
            .filter(|s| s.is_rollback_capable())
            .collect();

        let steps = eligible
            .into_iter()
            .rev()
            .enumerate()
            .filter_map(|(order, step)| {
                let strategy = step.rollback.as_ref()?;
                Some(RollbackStep {
                    order: order as u32,
                    kind: strategy.kind,
                    target_step_id: step.id.clone(),
                    step_kind: step.kind,
                    actions: compensating_actions(step),
                    critical: strategy.critical,
                })
            })
            .collect();

        RollbackPlan {
            id: Uuid::now_v7(),
            execution_id: execution.id,
            target: target.clone(),
            baseline_checkpoint: baseline.map(|c| c.id),
            steps,
            created_at: Utc::now(),
        }
    }
}

/// Declared actions, or a single implicit action undoing the step's operation.
fn compensating_actions(step: &StepDefinition) -> Vec<CompensatingAction> {
    let Some(strategy) = &step.rollback else {
        return Vec::new();
    };
    if !strategy.actions.is_empty() {
        return strategy.actions.clone();
    }
    let verb = match strategy.kind {
        RollbackKind::Revert => "revert",
        _ => "compensate",
    };
    vec![CompensatingAction {
        operation: verb.to_string(),
        parameters: json!({ "operation": step.operation }),
    }]
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Result of running one rollback plan.
#[derive(Debug, Clone)]
pub struct RollbackReport {
    pub attempt: RollbackAttempt,
    pub records: Vec<RollbackRecord>,
    /// Steps whose every action succeeded, in execution order.
    pub rolled_back: Vec<String>,
    /// Reason for emergency recovery, set when a critical step failed.
    pub emergency: Option<String>,
}

impl RollbackReport {
    pub fn success(&self) -> bool {
        self.attempt.success
    }

    /// Record the attempt on `execution` and mark rolled-back steps.
    pub fn apply(&self, execution: &mut Execution) -> Result<(), TransitionError> {
        for step_id in &self.rolled_back {
            execution.roll_back_step(step_id)?;
        }
        execution.rollback_history.extend(self.records.iter().cloned());
        execution.rollback_attempts.push(self.attempt.clone());
        Ok(())
    }
}

pub struct RollbackExecutor<'a> {
    runner: &'a StepRunner,
}

impl<'a> RollbackExecutor<'a> {
    pub fn new(runner: &'a StepRunner) -> Self {
        Self { runner }
    }

    /// Run `plan` in ascending order, once.
    ///
    /// A failed critical step aborts the rest; other failures are recorded
    /// and the sequence continues.
    pub async fn execute(
        &self,
        plan: &RollbackPlan,
        definition: &WorkflowDefinition,
        params: &Value,
        context: &Value,
    ) -> RollbackReport {
        let mut steps: Vec<&RollbackStep> = plan.steps.iter().collect();
        steps.sort_by_key(|s| s.order);

        let started_at = Utc::now();
        let mut records = Vec::new();
        let mut rolled_back = Vec::new();
        let mut emergency = None;
        let mut failed = false;

        'plan: for rb in steps {
            let Some(step) = definition.find_step(&rb.target_step_id) else {
                tracing::warn!(step_id = rb.target_step_id.as_str(), "rollback target not in definition");
                failed = true;
                continue;
            };
            let base = StepInvocation::forward(plan.execution_id, step.clone(), params.clone(), context.clone());

            let mut step_ok = true;
            for action in &rb.actions {
                let result = match self.runner.registry().for_kind(rb.step_kind) {
                    Some(executor) => self
                        .runner
                        .run_once(&executor, &base.compensation(action.clone()))
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string()),
                    None => Err(format!("no executor registered for step kind '{}'", rb.step_kind)),
                };

                records.push(RollbackRecord {
                    attempt_id: plan.id,
                    order: rb.order,
                    target_step_id: rb.target_step_id.clone(),
                    action: action.operation.clone(),
                    success: result.is_ok(),
                    error: result.as_ref().err().cloned(),
                    critical: rb.critical,
                    at: Utc::now(),
                });

                if let Err(error) = result {
                    step_ok = false;
                    failed = true;
                    tracing::warn!(
                        execution_id = %plan.execution_id,
                        step_id = rb.target_step_id.as_str(),
                        action = action.operation.as_str(),
                        critical = rb.critical,
                        error = error.as_str(),
                        "compensating action failed"
                    );
                    if rb.critical {
                        emergency = Some(format!(
                            "critical rollback of step '{}' failed: {error}",
                            rb.target_step_id
                        ));
                        break 'plan;
                    }
                    break;
                }
            }

            if step_ok {
                rolled_back.push(rb.target_step_id.clone());
            }
        }

        tracing::info!(
            execution_id = %plan.execution_id,
            planned = plan.steps.len(),
            rolled_back = rolled_back.len(),
            success = !failed,
            "rollback finished"
        );

        RollbackReport {
            attempt: RollbackAttempt {
                id: plan.id,
                target: plan.target.clone(),
                started_at,
                completed_at: Some(Utc::now()),
                success: !failed,
                planned_steps: plan.steps.len(),
                emergency: emergency.is_some(),
            },
            records,
            rolled_back,
            emergency,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::test_support::ScriptedExecutor;
    use crate::workflow::executor::ExecutorRegistry;
    use marketflow_types::execution::{CheckpointReason, CheckpointSnapshot, StepStatus};
    use marketflow_types::workflow::{RollbackStrategy, StepKind, StepParams};
    use proptest::prelude::*;

    fn task(id: &str) -> StepDefinition {
        StepDefinition::new(id, StepParams::task("crm", id)).with_operation(format!("create_{id}"))
    }

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new("onboarding")
            .with_step(task("contact").with_rollback(RollbackStrategy::compensate(vec![
                CompensatingAction::new("delete_contact"),
            ])))
            .with_step(task("deal").with_rollback(RollbackStrategy::revert()))
            .with_step(task("note"))
            .with_step(task("invoice").with_rollback(
                RollbackStrategy::compensate(vec![CompensatingAction::new("void_invoice")]).critical(),
            ))
    }

    fn completed(def: &WorkflowDefinition, order: &[&str]) -> Execution {
        let mut exec = Execution::new(def, "actor", "session", json!({}));
        for id in order {
            exec.mark_step_running(id).unwrap();
            exec.complete_step(id, json!({}), None, 0, false).unwrap();
        }
        exec
    }

    fn runner(exec: ScriptedExecutor) -> StepRunner {
        StepRunner::new(
            Arc::new(ExecutorRegistry::with_builtins().with_executor(StepKind::Task, exec)),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn plan_reverses_completion_order() {
        let def = definition();
        let exec = completed(&def, &["contact", "note", "deal", "invoice"]);
        let plan = RollbackPlanner::plan(&def, &exec, &RollbackTarget::Initial, None);

        let ids: Vec<_> = plan.steps.iter().map(|s| s.target_step_id.as_str()).collect();
        assert_eq!(ids, vec!["invoice", "deal", "contact"]);
        let orders: Vec<_> = plan.steps.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
        assert!(plan.steps[0].critical);
        assert_eq!(plan.steps[1].kind, RollbackKind::Revert);
        assert_eq!(plan.steps[1].actions[0].operation, "revert");
        assert_eq!(plan.steps[1].actions[0].parameters["operation"], "create_deal");
    }

    #[test]
    fn checkpoint_target_keeps_baseline_steps() {
        let def = definition();
        let exec = completed(&def, &["contact", "deal", "invoice"]);
        let mut baseline_exec = completed(&def, &["contact"]);
        baseline_exec.id = exec.id;
        let baseline = Checkpoint {
            id: Uuid::now_v7(),
            execution_id: exec.id,
            snapshot: CheckpointSnapshot::capture(&def, &baseline_exec, CheckpointReason::ExecutionStart),
            created_at: Utc::now(),
        };

        let plan = RollbackPlanner::plan(
            &def,
            &exec,
            &RollbackTarget::Checkpoint { checkpoint_id: None },
            Some(&baseline),
        );
        let ids: Vec<_> = plan.steps.iter().map(|s| s.target_step_id.as_str()).collect();
        assert_eq!(ids, vec!["invoice", "deal"]);
        assert_eq!(plan.baseline_checkpoint, Some(baseline.id));
    }

    #[test]
    fn custom_target_filters_steps() {
        let def = definition();
        let exec = completed(&def, &["contact", "deal", "invoice"]);
        let plan = RollbackPlanner::plan(
            &def,
            &exec,
            &RollbackTarget::Custom {
                step_ids: vec!["contact".into(), "note".into()],
            },
            None,
        );
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].target_step_id, "contact");
        assert_eq!(plan.steps[0].order, 0);
    }

    #[tokio::test]
    async fn executor_runs_plan_and_applies() {
        let def = definition();
        let mut exec = completed(&def, &["contact", "deal"]);
        let crm = ScriptedExecutor::succeeding("crm");
        let runner = runner(crm.clone());

        let plan = RollbackPlanner::plan(&def, &exec, &RollbackTarget::Initial, None);
        let report = RollbackExecutor::new(&runner)
            .execute(&plan, &def, &exec.params.clone(), &Value::Null)
            .await;

        assert!(report.success());
        assert_eq!(report.rolled_back, vec!["deal", "contact"]);
        let ops: Vec<_> = crm.compensations().into_iter().map(|c| c.step_id).collect();
        assert_eq!(ops, vec!["deal", "contact"]);

        report.apply(&mut exec).unwrap();
        assert_eq!(exec.step_status("deal"), Some(StepStatus::RolledBack));
        assert_eq!(exec.rollback_history.len(), 2);
        assert_eq!(exec.rollback_attempts.len(), 1);
        assert_eq!(exec.metrics.steps_rolled_back, 2);
    }

    #[tokio::test]
    async fn non_critical_failure_continues() {
        let def = definition();
        let exec = completed(&def, &["contact", "deal"]);
        let runner = runner(ScriptedExecutor::succeeding("crm").failing_compensation("revert"));

        let plan = RollbackPlanner::plan(&def, &exec, &RollbackTarget::Initial, None);
        let report = RollbackExecutor::new(&runner)
            .execute(&plan, &def, &Value::Null, &Value::Null)
            .await;

        assert!(!report.success());
        assert!(report.emergency.is_none());
        assert_eq!(report.rolled_back, vec!["contact"]);
        assert_eq!(report.records.len(), 2);
        assert!(!report.records[0].success);
        assert!(report.records[1].success);
    }

    #[tokio::test]
    async fn critical_failure_aborts_and_flags_emergency() {
        let def = definition();
        let exec = completed(&def, &["contact", "deal", "invoice"]);
        let runner = runner(ScriptedExecutor::succeeding("crm").failing_compensation("void_invoice"));

        let plan = RollbackPlanner::plan(&def, &exec, &RollbackTarget::Initial, None);
        let report = RollbackExecutor::new(&runner)
            .execute(&plan, &def, &Value::Null, &Value::Null)
            .await;

        assert!(!report.success());
        assert!(report.attempt.emergency);
        assert!(report.emergency.as_deref().unwrap().contains("invoice"));
        assert_eq!(report.records.len(), 1);
        assert!(report.rolled_back.is_empty());
    }

    proptest! {
        /// Planning twice over the same completed set yields the same order.
        #[test]
        fn plan_is_deterministic(order in Just(vec!["contact", "deal", "note", "invoice"]).prop_shuffle()) {
            let def = definition();
            let exec = completed(&def, &order);
            let first = RollbackPlanner::plan(&def, &exec, &RollbackTarget::Initial, None);
            let second = RollbackPlanner::plan(&def, &exec, &RollbackTarget::Initial, None);

            prop_assert_eq!(&first.steps, &second.steps);
            let expected: Vec<&str> = order
                .iter()
                .rev()
                .copied()
                .filter(|id| *id != "note")
                .collect();
            let ids: Vec<&str> = first.steps.iter().map(|s| s.target_step_id.as_str()).collect();
            prop_assert_eq!(ids, expected);
        }
    }
}
