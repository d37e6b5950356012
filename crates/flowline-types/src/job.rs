//! Scheduled job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::JobError;
use crate::retry::RetryPolicyConfig;

// ---------------------------------------------------------------------------
// Job Definition
// ---------------------------------------------------------------------------

/// A cron-scheduled unit of work targeting an agent or a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    /// 5-field cron expression or human-readable alias ("every 5 minutes").
    pub cron_expr: String,
    /// "UTC" or a fixed offset such as "+05:30".
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub target: JobTarget,
    /// Action passed to agent targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub input_data: Value,
    /// Queue priority; lower numbers run first.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Every condition must pass for a scheduled fire to run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<JobCondition>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_priority() -> u8 {
    5
}

fn default_true() -> bool {
    true
}

/// What a job runs when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTarget {
    Agent { agent_id: String },
    Workflow { workflow_id: String },
}

impl JobTarget {
    pub fn id(&self) -> &str {
        match self {
            JobTarget::Agent { agent_id } => agent_id,
            JobTarget::Workflow { workflow_id } => workflow_id,
        }
    }
}

/// Gate evaluated at fire time; a failing condition skips the fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobCondition {
    /// Monday to Friday in the job's timezone.
    BusinessDaysOnly,
    /// Veto on Saturday and Sunday in the job's timezone.
    ExcludeWeekends,
    /// Predicate registered on the scheduler under `name`.
    Custom { name: String },
}

// ---------------------------------------------------------------------------
// Schedule / instance state
// ---------------------------------------------------------------------------

/// Derived schedule of a registered job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleInfo {
    pub job_id: String,
    /// Normalized 5-field expression.
    pub cron_expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_run: Option<DateTime<Utc>>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// One fire (scheduled or manual) of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    pub instance_id: Uuid,
    pub job_id: String,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Started through `run_now` rather than the cron gate.
    #[serde(default)]
    pub manual: bool,
    /// Set for workflow targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_instance_id: Option<Uuid>,
}

impl JobInstance {
    pub fn new(job_id: impl Into<String>, input: Value, manual: bool) -> Self {
        Self {
            instance_id: Uuid::now_v7(),
            job_id: job_id.into(),
            status: JobStatus::Scheduled,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            input,
            output: None,
            error: None,
            manual,
            workflow_instance_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_definition_yaml_defaults() {
        let yaml = r#"
id: nightly-report
name: Nightly report
cron_expr: "0 2 * * *"
target:
  type: agent
  agent_id: reporter
conditions:
  - type: business_days_only
  - type: custom
    name: quiet-hours
"#;
        let job: JobDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(job.timezone, "UTC");
        assert_eq!(job.priority, 5);
        assert!(job.enabled);
        assert!(job.retry.is_none());
        assert_eq!(job.target.id(), "reporter");
        assert_eq!(job.conditions.len(), 2);
        assert_eq!(
            job.conditions[1],
            JobCondition::Custom {
                name: "quiet-hours".to_string()
            }
        );
    }

    #[test]
    fn test_new_job_instance_is_scheduled() {
        let instance = JobInstance::new("nightly-report", Value::Null, true);
        assert_eq!(instance.status, JobStatus::Scheduled);
        assert!(instance.manual);
        assert!(!instance.status.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
