//! Agent contract consumed by the workflow engine and the scheduler.
//!
//! - `Agent`: RPITIT trait implemented by concrete executors
//! - `BoxAgent`: object-safe wrapper for dynamic dispatch
//! - `AgentRegistry`: id-indexed lookup used at step execution time

pub mod box_agent;
pub mod registry;

pub use box_agent::{AgentDyn, BoxAgent};
pub use registry::{AgentRegistry, InMemoryAgentRegistry};

use flowline_types::agent::AgentResult;
use serde_json::Value;

/// An external executor performing one business action.
///
/// Uses native async fn in traits (RPITIT). Agents report business failures
/// through `AgentResult::error` rather than panicking; the engine races every
/// call against a timeout.
pub trait Agent: Send + Sync {
    /// Registry id of this agent (e.g. "payments").
    fn id(&self) -> &str;

    /// Execute with the mapped step input. `caller_id` identifies the
    /// workflow instance or job instance making the call.
    fn execute(
        &self,
        input: Value,
        caller_id: &str,
    ) -> impl std::future::Future<Output = AgentResult> + Send;
}
