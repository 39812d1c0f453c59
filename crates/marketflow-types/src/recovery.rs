//! Error taxonomy and recovery strategy types.
//!
//! Every step failure carries an [`ErrorKind`] and a [`Severity`]. The
//! recovery engine maps the kind to a [`RecoveryStrategy`]; when the
//! remediation does not resolve the failure, the strategy's
//! [`EscalationRule`]s are evaluated in order.

use serde::{Deserialize, Serialize};

use crate::workflow::{default_base_delay_ms, default_max_attempts, BackoffKind, CompensatingAction};

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad definition or parameters, rejected before execution starts.
    Validation,
    /// Step or resource wait exceeded its budget.
    Timeout,
    /// The step executor reported a failure.
    AgentFailure,
    /// Engine-internal failure.
    System,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AgentFailure => "agent_failure",
            ErrorKind::System => "system",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A classified step failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error ({severity}): {message}")]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: ErrorKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
        }
    }

    pub fn agent_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AgentFailure, Severity::Medium, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, Severity::Medium, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, Severity::High, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, Severity::High, message)
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

// ---------------------------------------------------------------------------
// Recovery strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationKind {
    Retry,
    Fallback,
    Compensate,
    Escalate,
}

/// Remediation policy for one error kind.
///
/// A strategy without `error_kind` is the `default` entry used when no
/// kind-specific strategy exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub remediation: RemediationKind,
    #[serde(default)]
    pub parameters: RecoveryParameters,
    /// Attempts including the first, used by `retry` when the step declares
    /// no retry policy of its own.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Evaluated in order when the remediation fails; first match wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub escalation: Vec<EscalationRule>,
}

impl RecoveryStrategy {
    /// A strategy for `kind` with default attempts and backoff.
    pub fn new(error_kind: Option<ErrorKind>, remediation: RemediationKind) -> Self {
        Self {
            error_kind,
            remediation,
            parameters: RecoveryParameters::default(),
            max_attempts: default_max_attempts(),
            backoff: BackoffKind::default(),
            base_delay_ms: default_base_delay_ms(),
            escalation: Vec::new(),
        }
    }

    /// A `fallback` strategy that switches to the named executor.
    pub fn fallback(error_kind: ErrorKind, executor: impl Into<String>) -> Self {
        let mut strategy = Self::new(Some(error_kind), RemediationKind::Fallback);
        strategy.parameters.fallback_executor = Some(executor.into());
        strategy
    }

    pub fn with_escalation(mut self, condition: EscalationCondition, action: EscalationAction) -> Self {
        self.escalation.push(EscalationRule { condition, action });
        self
    }
}

/// Typed parameters for the remediation kinds that need them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryParameters {
    /// Registered executor name used by `fallback`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_executor: Option<String>,
    /// Actions run in order by `compensate`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensation: Vec<CompensatingAction>,
}

/// Condition -> action pair evaluated after a failed remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRule {
    pub condition: EscalationCondition,
    pub action: EscalationAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationCondition {
    /// Always matches once remediation has failed.
    RetriesExhausted,
    /// Matches failures with `Severity::Critical`.
    CriticalError,
    /// Matches failures of the given kind.
    ErrorKind { kind: ErrorKind },
}

impl EscalationCondition {
    pub fn matches(&self, failure: &StepFailure) -> bool {
        match self {
            EscalationCondition::RetriesExhausted => true,
            EscalationCondition::CriticalError => failure.is_critical(),
            EscalationCondition::ErrorKind { kind } => failure.kind == *kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationAction {
    NotifyAdmin,
    SwitchToFallback { executor: String },
    EmergencyStop,
}
