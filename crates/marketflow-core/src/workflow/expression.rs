//! JEXL condition evaluation for preconditions, step guards, conditional
//! branches and success criteria.
//!
//! Payloads are always passed as context objects, never interpolated into
//! expression strings. An evaluator is built per evaluation and never held
//! across an `.await`.

use std::collections::BTreeMap;

use marketflow_types::execution::StepResult;
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the standard transforms registered.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context)
            .map(|v| value_to_bool(&v))
    }

    /// Evaluate and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Evaluate `expression` once against `context`.
pub fn evaluate(expression: &str, context: &Value) -> Result<bool, ExpressionError> {
    ConditionEvaluator::new().evaluate_bool(expression, context)
}

// ---------------------------------------------------------------------------
// Context builders
// ---------------------------------------------------------------------------

/// `{ params, context }`, used for workflow preconditions.
pub fn precondition_context(params: &Value, context: &Value) -> Value {
    json!({
        "params": params,
        "context": context,
    })
}

/// `{ params, context, steps }` where `steps.<id>` holds `status` and `output`.
pub fn step_context(params: &Value, context: &Value, results: &BTreeMap<String, StepResult>) -> Value {
    let mut steps = serde_json::Map::new();
    for (id, result) in results {
        steps.insert(
            id.clone(),
            json!({
                "status": result.status.as_str(),
                "output": result.output.clone().unwrap_or(Value::Null),
            }),
        );
    }

    json!({
        "params": params,
        "context": context,
        "steps": steps,
    })
}

/// `{ output }`, used for success criteria.
pub fn output_context(output: &Value) -> Value {
    json!({ "output": output })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
