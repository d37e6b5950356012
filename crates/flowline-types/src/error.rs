use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known error codes synthesized by the engine, queue and scheduler.
///
/// Agents are free to use their own codes; these are the ones Flowline
/// produces itself.
pub mod codes {
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const AGENT_NOT_FOUND: &str = "AGENT_NOT_FOUND";
    pub const AGENT_ERROR: &str = "AGENT_ERROR";
    pub const APPROVAL_REJECTED: &str = "APPROVAL_REJECTED";
    pub const WORKFLOW_TIMEOUT: &str = "WORKFLOW_TIMEOUT";
    pub const STEP_NOT_FOUND: &str = "STEP_NOT_FOUND";
    pub const STEP_FAILED: &str = "STEP_FAILED";
    pub const EXPRESSION_ERROR: &str = "EXPRESSION_ERROR";
    pub const JOB_FAILED: &str = "JOB_FAILED";
    pub const PROCESSOR_ERROR: &str = "PROCESSOR_ERROR";
    pub const QUEUE_STOPPED: &str = "QUEUE_STOPPED";
    pub const QUEUE_FULL: &str = "QUEUE_FULL";
    pub const UNKNOWN: &str = "UNKNOWN";
}

// ---------------------------------------------------------------------------
// ExecutionError
// ---------------------------------------------------------------------------

/// Failure of a single unit of work (a workflow step or a scheduled job).
///
/// External collaborator failures (rate limits, HTTP-like 429/502/503/504)
/// are normalized into this shape before they reach any recovery logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ExecutionError {
    /// Machine-readable code (e.g. `"TIMEOUT"`, `"RATE_LIMIT"`, `"429"`).
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Whether retrying the same work may succeed.
    pub recoverable: bool,
    /// Optional structured details (stack, upstream response, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// A failed workflow step.
pub type StepError = ExecutionError;

/// A failed scheduled job.
pub type JobError = ExecutionError;

impl ExecutionError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recoverable,
            details: None,
        }
    }

    /// A failure that is worth retrying.
    pub fn recoverable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message, true)
    }

    /// A failure that retrying will not fix.
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message, false)
    }

    /// The error synthesized when a call races past its deadline.
    pub fn timeout(what: &str, after_ms: u64) -> Self {
        Self::recoverable(codes::TIMEOUT, format!("{what} timed out after {after_ms}ms"))
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ---------------------------------------------------------------------------
// WorkflowError
// ---------------------------------------------------------------------------

/// Terminal failure of a workflow instance.
///
/// Same shape as [`ExecutionError`] plus the id of the step that caused the
/// run to abort (absent for run-level failures such as a global timeout).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl WorkflowError {
    /// Wrap the error of the step that aborted the run.
    pub fn from_step(step_id: impl Into<String>, error: &ExecutionError) -> Self {
        Self {
            code: error.code.clone(),
            message: error.message.clone(),
            recoverable: error.recoverable,
            failed_step_id: Some(step_id.into()),
            details: error.details.clone(),
        }
    }

    /// A failure of the run itself rather than of one step.
    pub fn run_level(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recoverable: false,
            failed_step_id: None,
            details: None,
        }
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failed_step_id {
            Some(step) => write!(f, "step '{step}' failed: {}: {}", self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for WorkflowError {}
