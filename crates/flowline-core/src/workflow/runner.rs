//! Workflow runner: a thin layer over [`WorkflowEngine`] that parks requests
//! while the engine is full and starts workflows from events.
//!
//! Event triggers are matched by exact event type. An optional `when` clause
//! is evaluated against `{ "event": <payload>, "trigger": {...} }` before the
//! workflow is launched.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowline_types::event::{EventKind, FlowEvent};
use flowline_types::workflow::{TriggerConfig, TriggerInfo, WorkflowDefinition, WorkflowInstance};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::engine::{EngineError, StartOptions, WorkflowEngine};
use super::expression::WorkflowEvaluator;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Engine at capacity and the pending queue is full too.
    #[error("pending queue full ({max} requests)")]
    PendingQueueFull { max: usize },

    #[error("trigger registration failed: {0}")]
    RegistrationFailed(String),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A start request waiting for engine capacity.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub workflow_id: String,
    pub input: Value,
    pub trigger: TriggerInfo,
    pub queued_at: DateTime<Utc>,
}

/// Result of [`WorkflowRunner::run`].
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Started(WorkflowInstance),
    /// Parked until an instance finishes. `position` is 1-based.
    Queued { position: usize },
}

impl RunOutcome {
    pub fn instance(&self) -> Option<&WorkflowInstance> {
        match self {
            RunOutcome::Started(instance) => Some(instance),
            RunOutcome::Queued { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
struct EventTrigger {
    workflow_id: String,
    event_type: String,
    when: Option<String>,
}

// ---------------------------------------------------------------------------
// WorkflowRunner
// ---------------------------------------------------------------------------

struct RunnerInner {
    engine: WorkflowEngine,
    evaluator: WorkflowEvaluator,
    triggers: RwLock<Vec<EventTrigger>>,
    pending: Mutex<VecDeque<PendingRequest>>,
    max_pending: usize,
}

/// Cheaply cloneable; clones share triggers and the pending queue.
#[derive(Clone)]
pub struct WorkflowRunner {
    inner: Arc<RunnerInner>,
}

impl WorkflowRunner {
    pub fn new(engine: WorkflowEngine) -> Self {
        let max_pending = engine.config().pending_queue_size;
        Self {
            inner: Arc::new(RunnerInner {
                engine,
                evaluator: WorkflowEvaluator::new(),
                triggers: RwLock::new(Vec::new()),
                pending: Mutex::new(VecDeque::new()),
                max_pending,
            }),
        }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.inner.engine
    }

    /// Start `workflow_id`, parking the request if the engine is full.
    pub async fn run(
        &self,
        workflow_id: &str,
        input: Value,
        trigger: TriggerInfo,
    ) -> Result<RunOutcome, RunnerError> {
        let options = StartOptions::default().with_trigger(trigger.clone());
        match self
            .inner
            .engine
            .start_workflow(workflow_id, input.clone(), options)
            .await
        {
            Ok(instance) => Ok(RunOutcome::Started(instance)),
            Err(EngineError::AtCapacity { .. }) => {
                let mut pending = self.inner.pending.lock();
                if pending.len() >= self.inner.max_pending {
                    tracing::warn!(workflow_id, max = self.inner.max_pending, "pending queue full, dropping request");
                    return Err(RunnerError::PendingQueueFull {
                        max: self.inner.max_pending,
                    });
                }
                pending.push_back(PendingRequest {
                    workflow_id: workflow_id.to_string(),
                    input,
                    trigger,
                    queued_at: Utc::now(),
                });
                let position = pending.len();
                tracing::info!(workflow_id, position, "engine at capacity, request queued");
                Ok(RunOutcome::Queued { position })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.inner.pending.lock().iter().cloned().collect()
    }

    /// Start parked requests in arrival order until the engine is full again.
    ///
    /// Requests that fail for any other reason are dropped with a warning.
    /// Returns how many were started.
    pub async fn drain_pending(&self) -> usize {
        let mut started = 0;
        loop {
            let Some(request) = self.inner.pending.lock().pop_front() else {
                break;
            };
            let options = StartOptions::default().with_trigger(request.trigger.clone());
            match self
                .inner
                .engine
                .start_workflow(&request.workflow_id, request.input.clone(), options)
                .await
            {
                Ok(instance) => {
                    started += 1;
                    tracing::debug!(
                        instance_id = %instance.instance_id,
                        workflow_id = %request.workflow_id,
                        "pending request started"
                    );
                }
                Err(EngineError::AtCapacity { .. }) => {
                    self.inner.pending.lock().push_front(request);
                    break;
                }
                Err(e) => {
                    tracing::warn!(workflow_id = %request.workflow_id, error = %e, "dropping pending request");
                }
            }
        }
        started
    }

    // -----------------------------------------------------------------------
    // Event triggers
    // -----------------------------------------------------------------------

    /// Record the `Event` triggers of `def`, replacing earlier ones for the
    /// same workflow. Returns how many were registered.
    pub fn register_triggers(&self, def: &WorkflowDefinition) -> Result<usize, RunnerError> {
        let mut registrations = Vec::new();
        for trigger in &def.triggers {
            if let TriggerConfig::Event { event_type, when } = trigger {
                if event_type.trim().is_empty() {
                    return Err(RunnerError::RegistrationFailed(format!(
                        "workflow '{}' has an event trigger with an empty event type",
                        def.id
                    )));
                }
                registrations.push(EventTrigger {
                    workflow_id: def.id.clone(),
                    event_type: event_type.clone(),
                    when: when.clone(),
                });
            }
        }

        let count = registrations.len();
        let mut triggers = self.inner.triggers.write();
        triggers.retain(|t| t.workflow_id != def.id);
        triggers.extend(registrations);
        tracing::info!(workflow_id = %def.id, trigger_count = count, "registered event triggers");
        Ok(count)
    }

    pub fn unregister_triggers(&self, workflow_id: &str) -> usize {
        let mut triggers = self.inner.triggers.write();
        let before = triggers.len();
        triggers.retain(|t| t.workflow_id != workflow_id);
        before - triggers.len()
    }

    pub fn trigger_count(&self) -> usize {
        self.inner.triggers.read().len()
    }

    /// Start every workflow with a trigger on `event_type` whose `when`
    /// clause passes. A clause that fails to evaluate suppresses the trigger.
    pub async fn handle_event(&self, event_type: &str, payload: Value) -> Vec<RunOutcome> {
        let matching: Vec<EventTrigger> = self
            .inner
            .triggers
            .read()
            .iter()
            .filter(|t| t.event_type == event_type)
            .cloned()
            .collect();
        if matching.is_empty() {
            return Vec::new();
        }

        let eval_ctx = json!({
            "event": payload,
            "trigger": { "type": "event", "event_type": event_type },
        });

        let mut outcomes = Vec::new();
        for trigger in matching {
            if let Some(when) = &trigger.when {
                match self.inner.evaluator.evaluate_bool(when, &eval_ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(workflow_id = %trigger.workflow_id, event_type, "when clause suppressed trigger");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(workflow_id = %trigger.workflow_id, event_type, error = %e, "when clause failed to evaluate");
                        continue;
                    }
                }
            }

            let info = TriggerInfo::Event {
                event_type: event_type.to_string(),
                payload: payload.clone(),
            };
            match self.run(&trigger.workflow_id, payload.clone(), info).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::warn!(workflow_id = %trigger.workflow_id, event_type, error = %e, "event trigger failed to start workflow");
                }
            }
        }
        outcomes
    }

    /// Follow the engine's event bus: drain pending requests whenever an
    /// instance finishes, and feed every event to [`Self::handle_event`] so
    /// workflows can chain on `workflow:completed` and friends.
    ///
    /// The task ends when the bus is dropped.
    pub fn spawn_event_listener(&self) -> JoinHandle<()> {
        let runner = self.clone();
        let mut rx = self.inner.engine.event_bus().subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => runner.on_bus_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "runner event listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("runner event listener stopped");
        })
    }

    async fn on_bus_event(&self, event: FlowEvent) {
        let finished = matches!(
            event.kind,
            EventKind::WorkflowCompleted | EventKind::WorkflowFailed | EventKind::WorkflowCancelled
        );
        if finished && self.pending_count() > 0 {
            self.drain_pending().await;
        }

        let event_type = event.kind.as_str();
        let payload = serde_json::to_value(&event).unwrap_or(Value::Null);
        self.handle_event(event_type, payload).await;
    }
}

impl std::fmt::Debug for WorkflowRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRunner")
            .field("triggers", &self.trigger_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
