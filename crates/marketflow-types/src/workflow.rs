//! Workflow definition types for MarketFlow.
//!
//! `WorkflowDefinition` is the canonical, versioned description of a business
//! process. Definitions are authored as YAML (or built programmatically) and
//! are read-only to the engine once an execution references them; edits
//! produce a new `version`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A versioned workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 identity. Stable across versions.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Human-readable workflow name (alphanumeric and hyphens).
    pub name: String,
    /// Monotonic version number, starting at 1.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered list of steps. Declaration order is the scheduling order.
    pub steps: Vec<StepDefinition>,
    /// Preconditions that must all hold before an execution starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<WorkflowCondition>,
    /// Authoring metadata.
    #[serde(default)]
    pub metadata: WorkflowMetadata,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Create an empty definition with a fresh id at version 1.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            version: default_version(),
            description: None,
            steps: Vec::new(),
            conditions: Vec::new(),
            metadata: WorkflowMetadata::default(),
        }
    }

    /// Append a step and return `self` for chaining.
    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Append a precondition.
    pub fn with_condition(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.conditions.push(WorkflowCondition {
            name: name.into(),
            expression: expression.into(),
        });
        self
    }

    /// All steps, including parallel group members, in declaration order.
    ///
    /// A group is listed before its members.
    pub fn all_steps(&self) -> Vec<&StepDefinition> {
        fn collect<'a>(steps: &'a [StepDefinition], out: &mut Vec<&'a StepDefinition>) {
            for step in steps {
                out.push(step);
                if let StepParams::ParallelGroup { members, .. } = &step.params {
                    collect(members, out);
                }
            }
        }

        let mut out = Vec::new();
        collect(&self.steps, &mut out);
        out
    }

    /// Find a step (top level or group member) by id.
    pub fn find_step(&self, id: &str) -> Option<&StepDefinition> {
        self.all_steps().into_iter().find(|s| s.id == id)
    }
}

/// A named precondition expression evaluated at execution start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCondition {
    pub name: String,
    /// JEXL expression over `params` and `context`.
    pub expression: String,
}

/// Authoring metadata attached to a definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    /// Step kinds or integrations the workflow needs (e.g. "email", "crm").
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
    /// Author's estimate of a full run, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<u64>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single unit of work in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step id, unique within the whole definition (group members included).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// The kind of step. Must agree with the `params` variant.
    #[serde(rename = "type")]
    pub kind: StepKind,
    /// Operation name passed to the step executor (e.g. "send_welcome_email").
    pub operation: String,
    /// Ids of top-level steps this step waits for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// What terminal state of a dependency satisfies it.
    #[serde(default)]
    pub dependency_type: DependencyType,
    /// Optional JEXL guard; when false the step is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Step timeout in seconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<SuccessCriteria>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackStrategy>,
    /// Declared resource weights, used for parallel dispatch.
    #[serde(default)]
    pub resources: ResourceWeights,
    /// Kind-specific parameters.
    pub params: StepParams,
}

impl StepDefinition {
    /// Create a step whose kind is derived from `params`.
    ///
    /// Name and operation default to the id.
    pub fn new(id: impl Into<String>, params: StepParams) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            operation: id.clone(),
            id,
            kind: params.kind(),
            depends_on: Vec::new(),
            dependency_type: DependencyType::default(),
            condition: None,
            timeout_secs: None,
            retry: None,
            success_criteria: None,
            rollback: None,
            resources: ResourceWeights::default(),
            params,
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_dependency_type(mut self, dependency_type: DependencyType) -> Self {
        self.dependency_type = dependency_type;
        self
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.condition = Some(expression.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_success_criteria(mut self, expression: impl Into<String>) -> Self {
        self.success_criteria = Some(SuccessCriteria {
            expression: expression.into(),
        });
        self
    }

    pub fn with_rollback(mut self, rollback: RollbackStrategy) -> Self {
        self.rollback = Some(rollback);
        self
    }

    pub fn with_resources(mut self, resources: ResourceWeights) -> Self {
        self.resources = resources;
        self
    }

    /// Whether a completed run of this step can be undone.
    pub fn is_rollback_capable(&self) -> bool {
        self.rollback
            .as_ref()
            .is_some_and(|r| r.enabled && r.kind != RollbackKind::Ignore)
    }

    /// Members of a parallel group, or an empty slice for other kinds.
    pub fn group_members(&self) -> &[StepDefinition] {
        match &self.params {
            StepParams::ParallelGroup { members, .. } => members,
            _ => &[],
        }
    }
}

/// The kind of step in a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Task,
    Call,
    Decision,
    Wait,
    ParallelGroup,
    Conditional,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Task => "task",
            StepKind::Call => "call",
            StepKind::Decision => "decision",
            StepKind::Wait => "wait",
            StepKind::ParallelGroup => "parallel_group",
            StepKind::Conditional => "conditional",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which terminal dependency states satisfy a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Every dependency must have completed successfully.
    #[default]
    SuccessOnly,
    /// Any terminal dependency state satisfies the step.
    AnyTerminal,
}

/// Step-specific parameter payload, tagged by `type`.
///
/// ```yaml
/// params:
///   type: call
///   channel: email
///   recipient: "{{ contact.email }}"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepParams {
    /// Hand a task to an agent.
    Task {
        agent: String,
        instructions: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
    },
    /// Outbound call over a messaging channel or API.
    Call {
        channel: CallChannel,
        recipient: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        variables: HashMap<String, String>,
    },
    /// Choose one of several outcomes.
    Decision {
        expression: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        outcomes: Vec<String>,
    },
    /// Pause for a fixed duration.
    Wait { duration_secs: u64 },
    /// Run member steps concurrently under the resource limiter.
    ParallelGroup {
        members: Vec<StepDefinition>,
        #[serde(default)]
        strategy: ParallelStrategy,
        #[serde(default)]
        on_failure: GroupFailurePolicy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
    },
    /// Select one of two branches of top-level steps.
    Conditional {
        condition: String,
        #[serde(default)]
        then_steps: Vec<String>,
        #[serde(default)]
        else_steps: Vec<String>,
    },
}

impl StepParams {
    /// The step kind this parameter variant belongs to.
    pub fn kind(&self) -> StepKind {
        match self {
            StepParams::Task { .. } => StepKind::Task,
            StepParams::Call { .. } => StepKind::Call,
            StepParams::Decision { .. } => StepKind::Decision,
            StepParams::Wait { .. } => StepKind::Wait,
            StepParams::ParallelGroup { .. } => StepKind::ParallelGroup,
            StepParams::Conditional { .. } => StepKind::Conditional,
        }
    }

    /// Shorthand for a task payload.
    pub fn task(agent: impl Into<String>, instructions: impl Into<String>) -> Self {
        StepParams::Task {
            agent: agent.into(),
            instructions: instructions.into(),
            assignee: None,
        }
    }

    /// Shorthand for a parallel group with the default strategy and policy.
    pub fn group(members: Vec<StepDefinition>) -> Self {
        StepParams::ParallelGroup {
            members,
            strategy: ParallelStrategy::default(),
            on_failure: GroupFailurePolicy::default(),
            max_concurrency: None,
        }
    }
}

/// Outbound channel for `call` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallChannel {
    Email,
    Sms,
    Whatsapp,
    Api,
}

/// When a parallel group counts as successful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelStrategy {
    #[default]
    AllSuccess,
    AnySuccess,
    MajoritySuccess,
    BestEffort,
}

/// What a parallel group does when a member fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupFailurePolicy {
    /// Stop dispatching and signal running members to stop.
    AbortAll,
    /// Keep dispatching; the strategy decides the group outcome.
    ContinuePartial,
    /// Re-dispatch failed members once after the first pass.
    RetryFailed,
    /// Stop dispatching and roll back completed members.
    #[default]
    RollbackAll,
}

// ---------------------------------------------------------------------------
// Retry, success criteria, rollback, resources
// ---------------------------------------------------------------------------

/// Retry configuration for a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Base delay in milliseconds (default 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

pub(crate) fn default_max_attempts() -> u32 {
    3
}

pub(crate) fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffKind::default(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`
    #[default]
    Exponential,
}

/// Post-condition a successful executor outcome must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessCriteria {
    /// JEXL expression over `output`.
    pub expression: String,
}

/// How a completed step is undone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackStrategy {
    pub enabled: bool,
    #[serde(default)]
    pub kind: RollbackKind,
    /// Ordered compensating actions. A `revert` with no actions reverts the
    /// step's own operation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<CompensatingAction>,
    /// A failed critical rollback aborts the remaining rollback.
    #[serde(default)]
    pub critical: bool,
}

impl RollbackStrategy {
    /// Enabled compensation with the given actions.
    pub fn compensate(actions: Vec<CompensatingAction>) -> Self {
        Self {
            enabled: true,
            kind: RollbackKind::Compensate,
            actions,
            critical: false,
        }
    }

    /// Enabled revert of the step's own operation.
    pub fn revert() -> Self {
        Self {
            enabled: true,
            kind: RollbackKind::Revert,
            actions: Vec::new(),
            critical: false,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackKind {
    Revert,
    #[default]
    Compensate,
    Ignore,
}

/// An operation that semantically undoes a step's effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensatingAction {
    pub operation: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

impl CompensatingAction {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            parameters: serde_json::Value::Null,
        }
    }
}

/// Declared resource weights of a step, as fractions of the global budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceWeights {
    #[serde(default = "default_weight")]
    pub cpu: f64,
    #[serde(default = "default_weight")]
    pub memory: f64,
    #[serde(default = "default_weight")]
    pub network: f64,
}

fn default_weight() -> f64 {
    0.1
}

impl ResourceWeights {
    pub fn new(cpu: f64, memory: f64, network: f64) -> Self {
        Self { cpu, memory, network }
    }

    /// Dispatch priority: heavier steps go first.
    pub fn priority(&self) -> f64 {
        self.cpu + self.memory + self.network
    }
}

impl Default for ResourceWeights {
    fn default() -> Self {
        Self {
            cpu: default_weight(),
            memory: default_weight(),
            network: default_weight(),
        }
    }
}
