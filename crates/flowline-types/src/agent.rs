//! Result shape of the external agent contract.
//!
//! The agent trait itself lives in `flowline-core`; this crate only carries
//! the data that crosses the boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExecutionError;

/// Outcome of one `Agent::execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Wall-clock time the agent reports for the call.
    #[serde(default)]
    pub execution_time_ms: u64,
}

impl AgentResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            execution_time_ms: 0,
        }
    }

    pub fn failure(error: ExecutionError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            execution_time_ms: 0,
        }
    }

    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.execution_time_ms = ms;
        self
    }

    /// Collapse into a `Result`, synthesizing an error when an agent reports
    /// failure without one.
    pub fn into_result(self) -> Result<Value, ExecutionError> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| {
                ExecutionError::fatal(
                    crate::error::codes::AGENT_ERROR,
                    "agent reported failure without an error",
                )
            }))
        }
    }
}
