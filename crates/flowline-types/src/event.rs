//! Event types for the Flowline event bus.
//!
//! `FlowEvent` is the single notification type broadcast by the engine, the
//! scheduler and the recovery manager. It is Clone + Send + Sync for use with
//! tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What happened. Serialized as `"<subject>:<verb>"` (e.g. `"workflow:started"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "workflow:started")]
    WorkflowStarted,
    #[serde(rename = "workflow:completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow:failed")]
    WorkflowFailed,
    #[serde(rename = "workflow:paused")]
    WorkflowPaused,
    #[serde(rename = "workflow:resumed")]
    WorkflowResumed,
    #[serde(rename = "workflow:cancelled")]
    WorkflowCancelled,

    #[serde(rename = "step:started")]
    StepStarted,
    #[serde(rename = "step:completed")]
    StepCompleted,
    #[serde(rename = "step:failed")]
    StepFailed,
    #[serde(rename = "step:skipped")]
    StepSkipped,
    #[serde(rename = "step:retrying")]
    StepRetrying,

    #[serde(rename = "approval:requested")]
    ApprovalRequested,
    #[serde(rename = "approval:received")]
    ApprovalReceived,

    #[serde(rename = "job:registered")]
    JobRegistered,
    #[serde(rename = "job:unregistered")]
    JobUnregistered,
    #[serde(rename = "job:scheduled")]
    JobScheduled,
    #[serde(rename = "job:started")]
    JobStarted,
    #[serde(rename = "job:completed")]
    JobCompleted,
    #[serde(rename = "job:failed")]
    JobFailed,
    #[serde(rename = "job:retrying")]
    JobRetrying,

    #[serde(rename = "scheduler:started")]
    SchedulerStarted,
    #[serde(rename = "scheduler:stopped")]
    SchedulerStopped,
    #[serde(rename = "scheduler:paused")]
    SchedulerPaused,
    #[serde(rename = "scheduler:resumed")]
    SchedulerResumed,

    #[serde(rename = "recovery:retry")]
    RecoveryRetry,
    #[serde(rename = "recovery:skip")]
    RecoverySkip,
    #[serde(rename = "recovery:escalate")]
    RecoveryEscalate,
    #[serde(rename = "recovery:fallback")]
    RecoveryFallback,
    #[serde(rename = "recovery:abort")]
    RecoveryAbort,
}

impl EventKind {
    /// Wire name, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::WorkflowStarted => "workflow:started",
            EventKind::WorkflowCompleted => "workflow:completed",
            EventKind::WorkflowFailed => "workflow:failed",
            EventKind::WorkflowPaused => "workflow:paused",
            EventKind::WorkflowResumed => "workflow:resumed",
            EventKind::WorkflowCancelled => "workflow:cancelled",
            EventKind::StepStarted => "step:started",
            EventKind::StepCompleted => "step:completed",
            EventKind::StepFailed => "step:failed",
            EventKind::StepSkipped => "step:skipped",
            EventKind::StepRetrying => "step:retrying",
            EventKind::ApprovalRequested => "approval:requested",
            EventKind::ApprovalReceived => "approval:received",
            EventKind::JobRegistered => "job:registered",
            EventKind::JobUnregistered => "job:unregistered",
            EventKind::JobScheduled => "job:scheduled",
            EventKind::JobStarted => "job:started",
            EventKind::JobCompleted => "job:completed",
            EventKind::JobFailed => "job:failed",
            EventKind::JobRetrying => "job:retrying",
            EventKind::SchedulerStarted => "scheduler:started",
            EventKind::SchedulerStopped => "scheduler:stopped",
            EventKind::SchedulerPaused => "scheduler:paused",
            EventKind::SchedulerResumed => "scheduler:resumed",
            EventKind::RecoveryRetry => "recovery:retry",
            EventKind::RecoverySkip => "recovery:skip",
            EventKind::RecoveryEscalate => "recovery:escalate",
            EventKind::RecoveryFallback => "recovery:fallback",
            EventKind::RecoveryAbort => "recovery:abort",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub id: Uuid,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl FlowEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            workflow_id: None,
            instance_id: None,
            step_id: None,
            job_id: None,
            timestamp: Utc::now(),
            payload: Value::Null,
        }
    }

    /// Event about a workflow instance.
    pub fn workflow(kind: EventKind, workflow_id: &str, instance_id: Uuid) -> Self {
        Self {
            workflow_id: Some(workflow_id.to_string()),
            instance_id: Some(instance_id),
            ..Self::new(kind)
        }
    }

    /// Event about a scheduled job.
    pub fn job(kind: EventKind, job_id: &str) -> Self {
        Self {
            job_id: Some(job_id.to_string()),
            ..Self::new(kind)
        }
    }

    pub fn with_step(mut self, step_id: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self
    }

    pub fn with_instance(mut self, instance_id: Uuid) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_wire_name_matches_serde() {
        for kind in [
            EventKind::WorkflowStarted,
            EventKind::StepRetrying,
            EventKind::ApprovalRequested,
            EventKind::JobUnregistered,
            EventKind::SchedulerPaused,
            EventKind::RecoveryEscalate,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_workflow_event_builder() {
        let id = Uuid::now_v7();
        let event = FlowEvent::workflow(EventKind::StepFailed, "order", id)
            .with_step("charge")
            .with_payload(json!({"code": "TIMEOUT"}));
        assert_eq!(event.instance_id, Some(id));
        assert_eq!(event.step_id.as_deref(), Some("charge"));
        assert!(event.job_id.is_none());

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "step:failed");
        assert_eq!(json["payload"]["code"], "TIMEOUT");
    }
}
