//! JEXL expression evaluator for step transition conditions and event
//! trigger `when` clauses.
//!
//! Payloads are always passed as context objects, never interpolated into
//! expression strings.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("Expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("Expression did not evaluate to a boolean: got {result}")]
    NotBoolean { result: Value },

    #[error("Invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// WorkflowEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with string, search and length transforms registered.
///
/// Transition conditions see `{result, context, input}`; trigger `when`
/// clauses see `{event}`.
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(|v| v.as_str()).unwrap_or("")
}

impl WorkflowEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = str_arg(args, 0).split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).contains(str_arg(args, 1))))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            // Substring match, not regex.
            .with_transform("match", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).contains(str_arg(args, 1))))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate `expression` and coerce the result with JS-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        let result = self.evaluate_value(expression, context)?;
        Ok(value_to_bool(&result))
    }

    /// Evaluate `expression` and require a literal boolean result.
    pub fn evaluate_strict_bool(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<bool, ExpressionError> {
        match self.evaluate_value(expression, context)? {
            Value::Bool(b) => Ok(b),
            result => Err(ExpressionError::NotBoolean { result }),
        }
    }

    /// Evaluate `expression` and return the raw JSON value.
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

    /// Evaluate a step transition condition over the step's output, the
    /// run's context and its input.
    pub fn evaluate_transition(
        &self,
        condition: &str,
        result: &Value,
        context: &Value,
        input: &Value,
    ) -> Result<bool, ExpressionError> {
        let scope = json!({
            "result": result,
            "context": context,
            "input": input,
        });
        self.evaluate_bool(condition, &scope)
    }
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkflowEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEvaluator").finish_non_exhaustive()
    }
}

/// JavaScript-like truthiness.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
