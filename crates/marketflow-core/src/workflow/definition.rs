//! Workflow definition parsing, validation and optimization analysis.
//!
//! Converts between YAML and the canonical `WorkflowDefinition`, validates
//! structural constraints before any execution may reference a definition,
//! and produces read-only optimization reports.

use std::collections::HashSet;

use marketflow_types::workflow::{StepDefinition, StepParams, WorkflowDefinition};
use serde::Serialize;
use thiserror::Error;

use super::dag;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while parsing or validating a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn invalid(msg: impl Into<String>) -> WorkflowError {
    WorkflowError::ValidationError(msg.into())
}

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumeric characters and hyphens
/// - At least one step exists
/// - Step ids are unique across top-level steps and group members
/// - Each step's `type` matches its `params` variant
/// - Parallel groups are non-empty and their members declare no dependencies
/// - Conditional branches reference top-level steps
/// - Timeouts are > 0 and retry policies allow at least one attempt
/// - Top-level dependencies exist and form a DAG
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.is_empty() {
        return Err(invalid("workflow name must not be empty"));
    }
    if !def.name.chars().all(|c| c.is_alphanumeric() || c == '-') {
        return Err(invalid(format!(
            "workflow name '{}' contains invalid characters (only alphanumeric and hyphens allowed)",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(invalid("workflow must have at least one step"));
    }

    let mut seen_ids = HashSet::new();
    for step in def.all_steps() {
        if step.id.is_empty() {
            return Err(invalid("step id must not be empty"));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(invalid(format!("duplicate step ID: '{}'", step.id)));
        }
        validate_step(step)?;
    }

    let top_level: HashSet<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &def.steps {
        match &step.params {
            StepParams::ParallelGroup { members, .. } => {
                if members.is_empty() {
                    return Err(invalid(format!(
                        "parallel group '{}' has no members",
                        step.id
                    )));
                }
                for member in members {
                    if !member.depends_on.is_empty() {
                        return Err(invalid(format!(
                            "group member '{}' must not declare dependencies",
                            member.id
                        )));
                    }
                    if !member.group_members().is_empty() {
                        return Err(invalid(format!(
                            "group member '{}' cannot itself be a parallel group",
                            member.id
                        )));
                    }
                }
            }
            StepParams::Conditional {
                then_steps,
                else_steps,
                ..
            } => {
                for ref_id in then_steps.iter().chain(else_steps.iter()) {
                    if !top_level.contains(ref_id.as_str()) {
                        return Err(invalid(format!(
                            "conditional step '{}' references unknown step '{}'",
                            step.id, ref_id
                        )));
                    }
                    if ref_id == &step.id {
                        return Err(invalid(format!(
                            "conditional step '{}' references itself",
                            step.id
                        )));
                    }
                }
            }
            _ => {}
        }
    }

    dag::validate_dag(&def.steps)
}

fn validate_step(step: &StepDefinition) -> Result<(), WorkflowError> {
    if step.kind != step.params.kind() {
        return Err(invalid(format!(
            "step '{}' declares type '{}' but has '{}' params",
            step.id,
            step.kind,
            step.params.kind()
        )));
    }
    if step.timeout_secs == Some(0) {
        return Err(invalid(format!("step '{}': timeout must be > 0", step.id)));
    }
    if let Some(retry) = &step.retry {
        if retry.max_attempts < 1 {
            return Err(invalid(format!(
                "step '{}': retry max_attempts must be >= 1",
                step.id
            )));
        }
    }
    if let StepParams::ParallelGroup {
        max_concurrency: Some(0),
        ..
    } = &step.params
    {
        return Err(invalid(format!(
            "parallel group '{}': max_concurrency must be >= 1",
            step.id
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Optimization analysis
// ---------------------------------------------------------------------------

/// A dependency edge implied by another dependency of the same step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedundantDependency {
    pub step_id: String,
    pub depends_on: String,
}

/// Read-only analysis of a definition's dependency structure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationReport {
    /// Top-level step ids grouped into waves that could run together.
    pub waves: Vec<Vec<String>>,
    /// Largest wave size, counting group members.
    pub max_parallelism: usize,
    pub redundant_dependencies: Vec<RedundantDependency>,
    /// Longest chain of dependent steps by estimated duration.
    pub critical_path: Vec<String>,
    pub estimated_duration_secs: u64,
    /// The input definition with redundant edges removed. Not persisted.
    pub proposed: WorkflowDefinition,
}

/// Estimated wall time of one step.
fn estimate_secs(step: &StepDefinition, default_timeout_secs: u64) -> u64 {
    match &step.params {
        StepParams::Wait { duration_secs } => *duration_secs,
        StepParams::ParallelGroup { members, .. } => members
            .iter()
            .map(|m| estimate_secs(m, default_timeout_secs))
            .max()
            .unwrap_or(0),
        _ => step.timeout_secs.unwrap_or(default_timeout_secs),
    }
}

/// Analyze a definition without modifying it.
pub fn optimize_definition(
    def: &WorkflowDefinition,
    default_timeout_secs: u64,
) -> Result<OptimizationReport, WorkflowError> {
    validate_definition(def)?;

    let waves = dag::build_execution_plan(&def.steps)?;
    let max_parallelism = waves
        .iter()
        .map(|wave| {
            wave.iter()
                .map(|s| s.group_members().len().max(1))
                .sum::<usize>()
        })
        .max()
        .unwrap_or(0);
    let waves: Vec<Vec<String>> = waves
        .into_iter()
        .map(|wave| wave.into_iter().map(|s| s.id.clone()).collect())
        .collect();

    let redundant: Vec<RedundantDependency> = dag::redundant_dependencies(&def.steps)
        .into_iter()
        .map(|(step_id, depends_on)| RedundantDependency {
            step_id,
            depends_on,
        })
        .collect();

    let (critical_path, estimated_duration_secs) =
        dag::critical_path(&def.steps, |s| estimate_secs(s, default_timeout_secs))?;

    let mut proposed = def.clone();
    for step in &mut proposed.steps {
        step.depends_on.retain(|dep| {
            !redundant
                .iter()
                .any(|r| r.step_id == step.id && &r.depends_on == dep)
        });
    }

    Ok(OptimizationReport {
        waves,
        max_parallelism,
        redundant_dependencies: redundant,
        critical_path,
        estimated_duration_secs,
        proposed,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
