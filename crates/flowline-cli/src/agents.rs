//! Built-in demo agents for `flowline run` and `flowline schedule`.
//!
//! - `echo`: returns its input, tagged with the caller
//! - `fail`: always fails; `{"recoverable": true}` in the input makes the
//!   failure retryable, `"code"` overrides the error code

use std::sync::Arc;

use flowline_core::agent::{Agent, InMemoryAgentRegistry};
use flowline_types::agent::AgentResult;
use flowline_types::error::ExecutionError;
use serde_json::{Value, json};

pub struct EchoAgent;

impl Agent for EchoAgent {
    fn id(&self) -> &str {
        "echo"
    }

    async fn execute(&self, input: Value, caller_id: &str) -> AgentResult {
        tracing::debug!(caller_id, "echo agent invoked");
        AgentResult::ok(json!({ "echo": input, "caller_id": caller_id }))
    }
}

pub struct FailAgent;

impl Agent for FailAgent {
    fn id(&self) -> &str {
        "fail"
    }

    async fn execute(&self, input: Value, _caller_id: &str) -> AgentResult {
        let code = input["code"].as_str().unwrap_or("E_DEMO_FAILURE");
        let recoverable = input["recoverable"].as_bool().unwrap_or(false);
        AgentResult::failure(ExecutionError::new(
            code,
            "demo agent failed as requested",
            recoverable,
        ))
    }
}

/// Registry preloaded with the demo agents.
pub fn demo_registry() -> Arc<InMemoryAgentRegistry> {
    let registry = InMemoryAgentRegistry::new();
    registry.register(EchoAgent);
    registry.register(FailAgent);
    Arc::new(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::agent::AgentRegistry;

    #[tokio::test]
    async fn test_demo_agents() {
        let registry = demo_registry();
        assert_eq!(registry.list_ids(), vec!["echo", "fail"]);

        let echo = registry.get_agent("echo").unwrap();
        let result = echo.execute(json!({ "n": 1 }), "run-1").await;
        assert!(result.success);
        assert_eq!(result.data, Some(json!({ "echo": { "n": 1 }, "caller_id": "run-1" })));

        let fail = registry.get_agent("fail").unwrap();
        let result = fail.execute(json!({ "recoverable": true }), "run-1").await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.recoverable);
        assert_eq!(error.code, "E_DEMO_FAILURE");
    }
}
