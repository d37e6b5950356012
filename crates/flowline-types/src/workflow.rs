//! Workflow domain types for Flowline.
//!
//! A `WorkflowDefinition` is the immutable shape of a process (a graph of
//! steps connected by conditional transitions). A `WorkflowInstance` is one
//! execution of that shape, mutated only by the engine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{StepError, WorkflowError};
use crate::retry::RetryConfig;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// `(id, version)` identifies a definition; "latest" is the highest version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable workflow identifier (e.g. "order-fulfilment").
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Monotonic definition version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Steps forming the workflow graph.
    pub steps: Vec<StepDefinition>,
    /// Entry point of the graph.
    pub start_step_id: String,
    /// Deadline for the whole run in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_timeout_ms: Option<u64>,
    /// What to do when a step fails after its own retries.
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    /// Disabled definitions cannot be started.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How the workflow can be triggered.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

/// Workflow-level reaction to a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Abort the run.
    #[default]
    Stop,
    /// Advance past the failed step.
    Skip,
    /// Rely on the step's own retry loop, then abort.
    Retry,
    /// Follow the failed step's default transition.
    Fallback,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step, delegated to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within a workflow (e.g. "charge-card").
    pub id: String,
    pub name: String,
    /// Agent resolved through the registry at execution time.
    pub agent_id: String,
    /// Action passed to the agent alongside the mapped input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Agent input key -> dotted path over `{input, context, results}`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub input_mapping: HashMap<String, String>,
    /// Context variable -> dotted path over the agent output.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub output_mapping: HashMap<String, String>,
    /// Outgoing edges, evaluated in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<StepTransition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Per-call agent timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Optional steps may be skipped when they fail or their agent is missing.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Suspend the run before this step until an approval decision arrives.
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_prompt: Option<String>,
}

impl StepDefinition {
    /// A required step with no mappings, transitions or retry.
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent_id: agent_id.into(),
            action: None,
            input_mapping: HashMap::new(),
            output_mapping: HashMap::new(),
            transitions: Vec::new(),
            retry: None,
            timeout_ms: None,
            required: true,
            requires_approval: false,
            approval_prompt: None,
        }
    }

    /// The transition flagged `is_default`, if any.
    pub fn default_transition(&self) -> Option<&StepTransition> {
        self.transitions.iter().find(|t| t.is_default)
    }
}

/// A directed edge out of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTransition {
    /// JEXL condition over `{result, context, input}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Target step id.
    pub target: String,
    #[serde(default)]
    pub is_default: bool,
}

impl StepTransition {
    /// Unconditional edge.
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            condition: None,
            target: target.into(),
            is_default: true,
        }
    }

    /// Conditional edge.
    pub fn when(condition: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            condition: Some(condition.into()),
            target: target.into(),
            is_default: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger Configuration
// ---------------------------------------------------------------------------

/// How a workflow can be triggered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Started explicitly through the runner or CLI.
    Manual {},
    /// Started by the cron scheduler.
    Schedule {
        /// Cron expression or human-readable alias.
        cron: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// Started when a matching event is handled by the runner.
    Event {
        event_type: String,
        /// Optional JEXL filter over `{event}`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<String>,
    },
}

/// Provenance of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerInfo {
    Manual,
    Schedule { job_id: String },
    Event { event_type: String, payload: Value },
}

impl TriggerInfo {
    /// Short label for logs ("manual", "schedule", "event").
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerInfo::Manual => "manual",
            TriggerInfo::Schedule { .. } => "schedule",
            TriggerInfo::Event { .. } => "event",
        }
    }
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Status of a workflow instance. Mirrors its state machine's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    WaitingApproval,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Instances in these states count against the engine's capacity.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::WaitingApproval => "waiting_approval",
        };
        f.write_str(s)
    }
}

/// Status of a single step within an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

/// Mutable data a run accumulates as it walks the step graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// Values written by output mappings.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Step id -> raw step output.
    #[serde(default)]
    pub results: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowContext {
    /// JSON view used for expression evaluation and input mapping.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "variables": self.variables,
            "results": self.results,
            "metadata": self.metadata,
        })
    }
}

/// Latest attempt of one step within an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Number of retries performed before this outcome.
    #[serde(default)]
    pub retry_count: u32,
}

/// One execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: Uuid,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub status: WorkflowStatus,
    /// Step being executed, or the one to resume from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub input: Value,
    pub context: WorkflowContext,
    #[serde(default)]
    pub step_results: HashMap<String, StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowError>,
    #[serde(default)]
    pub retry_count: u32,
    pub trigger: TriggerInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl WorkflowInstance {
    /// A fresh PENDING instance of `def`.
    pub fn new(def: &WorkflowDefinition, input: Value, trigger: TriggerInfo) -> Self {
        let now = Utc::now();
        Self {
            instance_id: Uuid::now_v7(),
            workflow_id: def.id.clone(),
            workflow_version: def.version,
            status: WorkflowStatus::Pending,
            current_step_id: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            input,
            context: WorkflowContext::default(),
            step_results: HashMap::new(),
            error: None,
            retry_count: 0,
            trigger,
            correlation_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_workflow() -> WorkflowDefinition {
        let mut validate = StepDefinition::new("validate", "validator");
        validate.transitions = vec![
            StepTransition::when("result.valid == true", "charge"),
            StepTransition::to("reject"),
        ];
        let mut charge = StepDefinition::new("charge", "payments");
        charge.retry = Some(RetryConfig::new(2, 100));
        let mut reject = StepDefinition::new("reject", "notifier");
        reject.required = false;

        WorkflowDefinition {
            id: "order".to_string(),
            name: "Order".to_string(),
            description: None,
            version: 2,
            steps: vec![validate, charge, reject],
            start_step_id: "validate".to_string(),
            global_timeout_ms: Some(60_000),
            error_strategy: ErrorStrategy::Stop,
            enabled: true,
            triggers: vec![
                TriggerConfig::Manual {},
                TriggerConfig::Event {
                    event_type: "order:placed".to_string(),
                    when: Some("event.total > 10".to_string()),
                },
            ],
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_workflow_definition_json_roundtrip() {
        let def = sample_workflow();
        let json = serde_json::to_string(&def).unwrap();
        let parsed: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "order");
        assert_eq!(parsed.version, 2);
        assert_eq!(parsed.steps.len(), 3);
        assert_eq!(parsed.triggers, def.triggers);
        assert!(!parsed.step("reject").unwrap().required);
    }

    #[test]
    fn test_minimal_yaml_applies_defaults() {
        let yaml = r#"
id: hello
name: Hello
start_step_id: greet
steps:
  - id: greet
    name: Greet
    agent_id: echo
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.version, 1);
        assert!(def.enabled);
        assert_eq!(def.error_strategy, ErrorStrategy::Stop);
        let step = def.step("greet").unwrap();
        assert!(step.required);
        assert!(!step.requires_approval);
        assert!(step.transitions.is_empty());
    }

    #[test]
    fn test_trigger_config_tagged_yaml() {
        let yaml = r#"
- type: schedule
  cron: "*/5 * * * *"
- type: event
  event_type: workflow:completed
"#;
        let triggers: Vec<TriggerConfig> = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(
            triggers[0],
            TriggerConfig::Schedule {
                cron: "*/5 * * * *".to_string(),
                timezone: None
            }
        );
        assert!(matches!(&triggers[1], TriggerConfig::Event { when: None, .. }));
    }

    #[test]
    fn test_default_transition_lookup() {
        let def = sample_workflow();
        let validate = def.step("validate").unwrap();
        assert_eq!(validate.default_transition().unwrap().target, "reject");
        assert!(def.step("charge").unwrap().default_transition().is_none());
    }

    #[test]
    fn test_status_terminality() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::WaitingApproval.is_terminal());
        assert!(WorkflowStatus::Paused.is_active());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Waiting.is_terminal());
        assert_eq!(WorkflowStatus::WaitingApproval.to_string(), "waiting_approval");
    }

    #[test]
    fn test_new_instance_is_pending() {
        let def = sample_workflow();
        let instance = WorkflowInstance::new(&def, json!({"order_id": 1}), TriggerInfo::Manual);
        assert_eq!(instance.status, WorkflowStatus::Pending);
        assert_eq!(instance.workflow_version, 2);
        assert!(instance.step_results.is_empty());
        assert_eq!(instance.trigger.kind(), "manual");
    }
}
