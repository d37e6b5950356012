//! Data flow between steps: dotted-path lookup, input mapping and output
//! mapping over a run's `WorkflowContext`.

use flowline_types::workflow::{StepDefinition, WorkflowContext, WorkflowInstance};
use serde_json::{Map, Value, json};

/// Maximum size of a single stored step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Resolve a dotted path such as `results.validate.total` or `items.0.sku`.
///
/// Numeric segments index into arrays. An empty path yields `root`.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// The scope input mappings resolve against: `{input, context, results}`.
pub fn mapping_scope(instance: &WorkflowInstance) -> Value {
    json!({
        "input": instance.input,
        "context": instance.context.to_value(),
        "results": instance.context.results,
    })
}

/// Build the agent input for `step`.
///
/// Without an input mapping the workflow input is passed through. Unresolved
/// paths map to `null`. A step `action` is merged in under the `action` key;
/// a non-object input is wrapped as `{"input": ..., "action": ...}`.
pub fn build_step_input(step: &StepDefinition, instance: &WorkflowInstance) -> Value {
    let mut input = if step.input_mapping.is_empty() {
        instance.input.clone()
    } else {
        let scope = mapping_scope(instance);
        let mapped: Map<String, Value> = step
            .input_mapping
            .iter()
            .map(|(key, path)| {
                let value = lookup_path(&scope, path).cloned().unwrap_or_else(|| {
                    tracing::debug!(step_id = %step.id, key, path, "input mapping path unresolved");
                    Value::Null
                });
                (key.clone(), value)
            })
            .collect();
        Value::Object(mapped)
    };

    if let Some(action) = &step.action {
        input = match input {
            Value::Object(mut map) => {
                map.insert("action".to_string(), json!(action));
                Value::Object(map)
            }
            Value::Null => json!({ "action": action }),
            other => json!({ "input": other, "action": action }),
        };
    }
    input
}

/// Store `output` as the step's raw result and apply its output mapping into
/// `context.variables`.
pub fn record_step_output(step: &StepDefinition, output: &Value, context: &mut WorkflowContext) {
    for (variable, path) in &step.output_mapping {
        let value = lookup_path(output, path).cloned().unwrap_or(Value::Null);
        context.variables.insert(variable.clone(), value);
    }
    context
        .results
        .insert(step.id.clone(), bounded_output(&step.id, output));
}

fn bounded_output(step_id: &str, output: &Value) -> Value {
    let size = serde_json::to_string(output).map(|s| s.len()).unwrap_or(0);
    if size <= MAX_STEP_OUTPUT_SIZE {
        return output.clone();
    }
    tracing::warn!(
        step_id,
        size,
        max = MAX_STEP_OUTPUT_SIZE,
        "step output exceeds size limit, truncating"
    );
    json!({
        "_truncated": true,
        "_original_size": size,
    })
}
