//! BoxAgent -- object-safe dynamic dispatch wrapper for `Agent`.
//!
//! 1. Define an object-safe `AgentDyn` trait with boxed futures
//! 2. Blanket-impl `AgentDyn` for all `T: Agent`
//! 3. `BoxAgent` wraps `Box<dyn AgentDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use flowline_types::agent::AgentResult;
use serde_json::Value;

use super::Agent;

/// Object-safe version of [`Agent`] with boxed futures.
pub trait AgentDyn: Send + Sync {
    fn id(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        input: Value,
        caller_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = AgentResult> + Send + 'a>>;
}

impl<T: Agent> AgentDyn for T {
    fn id(&self) -> &str {
        Agent::id(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        input: Value,
        caller_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = AgentResult> + Send + 'a>> {
        Box::pin(self.execute(input, caller_id))
    }
}

/// Type-erased agent for runtime lookup.
///
/// Since `Agent` uses RPITIT it cannot be a trait object directly; `BoxAgent`
/// provides the same methods over an inner `AgentDyn`.
pub struct BoxAgent {
    inner: Box<dyn AgentDyn + Send + Sync>,
}

impl BoxAgent {
    pub fn new<T: Agent + 'static>(agent: T) -> Self {
        Self {
            inner: Box::new(agent),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub async fn execute(&self, input: Value, caller_id: &str) -> AgentResult {
        self.inner.execute_boxed(input, caller_id).await
    }
}

impl std::fmt::Debug for BoxAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgent").field("id", &self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    impl Agent for Upper {
        fn id(&self) -> &str {
            "upper"
        }

        async fn execute(&self, input: Value, caller_id: &str) -> AgentResult {
            let text = input["text"].as_str().unwrap_or_default().to_uppercase();
            AgentResult::ok(json!({ "text": text, "caller": caller_id }))
        }
    }

    #[tokio::test]
    async fn box_agent_delegates() {
        let agent = BoxAgent::new(Upper);
        assert_eq!(agent.id(), "upper");
        let result = agent.execute(json!({"text": "hi"}), "wf-1").await;
        assert!(result.success);
        assert_eq!(result.data.unwrap(), json!({"text": "HI", "caller": "wf-1"}));
    }
}
