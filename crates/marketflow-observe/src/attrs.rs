//! Span and event attribute names for workflow instrumentation.
//!
//! Engine code logs with the short field names (`execution_id`, `step_id`);
//! exporters that need dotted names map them with [`qualified`].

/// Service name reported to OpenTelemetry.
pub const SERVICE_NAME: &str = "marketflow";

// --- Execution ---

pub const EXECUTION_ID: &str = "marketflow.execution.id";
pub const EXECUTION_STATUS: &str = "marketflow.execution.status";
pub const WORKFLOW_NAME: &str = "marketflow.workflow.name";
pub const WORKFLOW_VERSION: &str = "marketflow.workflow.version";

// --- Steps ---

pub const STEP_ID: &str = "marketflow.step.id";
pub const STEP_KIND: &str = "marketflow.step.kind";
pub const STEP_ATTEMPT: &str = "marketflow.step.attempt";

// --- Recovery and rollback ---

pub const ERROR_KIND: &str = "marketflow.error.kind";
pub const RECOVERY_REMEDIATION: &str = "marketflow.recovery.remediation";
pub const ROLLBACK_STEPS: &str = "marketflow.rollback.steps";

/// Dotted attribute name for a short tracing field name, if one is defined.
pub fn qualified(field: &str) -> Option<&'static str> {
    Some(match field {
        "execution_id" => EXECUTION_ID,
        "status" => EXECUTION_STATUS,
        "workflow" => WORKFLOW_NAME,
        "version" => WORKFLOW_VERSION,
        "step_id" => STEP_ID,
        "kind" => STEP_KIND,
        "attempt" => STEP_ATTEMPT,
        "error_kind" => ERROR_KIND,
        "remediation" => RECOVERY_REMEDIATION,
        "planned" => ROLLBACK_STEPS,
        _ => return None,
    })
}
