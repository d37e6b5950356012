//! Workflow engine: sequential step-graph execution with approval gates,
//! per-step retry and error-strategy handling.
//!
//! Each instance owns a workflow-level `StateMachine`. The instance's
//! `status` is only ever written together with the machine, under the
//! instance lock, so the two never disagree.
//!
//! # Execution flow
//!
//! 1. `start_workflow` resolves the definition, checks capacity and stores a
//!    PENDING instance.
//! 2. The run fires `start`, then walks from `start_step_id`. Every iteration
//!    first checks for an external pause or cancel.
//! 3. Each step optionally waits for approval, invokes its agent under a
//!    timeout, and retries in a bounded loop while recovery recommends it.
//! 4. The next step is the first transition whose condition holds (or that
//!    is the default). No match completes the run.
//! 5. A finally-failed step is resolved through the workflow's
//!    `ErrorStrategy`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use flowline_types::config::EngineConfig;
use flowline_types::error::{ExecutionError, StepError, WorkflowError, codes};
use flowline_types::event::{EventKind, FlowEvent};
use flowline_types::workflow::{
    StepDefinition, StepResult, StepStatus, TriggerInfo, WorkflowDefinition, WorkflowInstance,
    WorkflowStatus,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentRegistry;
use crate::event::EventBus;
use crate::recovery::{ErrorRecoveryManager, RecoveryAction};
use crate::state_machine::{StateMachine, StepEvent, WorkflowEvent, step_machine, workflow_machine};

use super::context::{build_step_input, record_step_output};
use super::definition::{DefinitionError, validate_definition};
use super::expression::WorkflowEvaluator;

// ---------------------------------------------------------------------------
// Errors and options
// ---------------------------------------------------------------------------

/// Synchronous failures of engine entry points.
///
/// Business failures never surface here; they end up on the instance.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow '{id}' has no version {version}")]
    VersionNotFound { id: String, version: u32 },

    #[error("workflow '{0}' is disabled")]
    WorkflowDisabled(String),

    #[error("workflow '{id}' version {version} is already registered")]
    DuplicateVersion { id: String, version: u32 },

    #[error("engine at capacity ({max} concurrent workflows)")]
    AtCapacity { max: usize },

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error(transparent)]
    InvalidDefinition(#[from] DefinitionError),
}

/// Options for [`WorkflowEngine::start_workflow`].
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Await the run instead of spawning it.
    pub sync: bool,
    pub trigger: TriggerInfo,
    /// Pin a definition version instead of using the highest enabled one.
    pub version: Option<u32>,
    pub correlation_id: Option<String>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            sync: false,
            trigger: TriggerInfo::Manual,
            version: None,
            correlation_id: None,
        }
    }
}

impl StartOptions {
    pub fn sync() -> Self {
        Self {
            sync: true,
            ..Self::default()
        }
    }

    pub fn with_trigger(mut self, trigger: TriggerInfo) -> Self {
        self.trigger = trigger;
        self
    }
}

/// Filter for [`WorkflowEngine::list_instances`]. Empty matches everything.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub workflow_id: Option<String>,
    pub status: Option<WorkflowStatus>,
}

impl InstanceFilter {
    fn matches(&self, instance: &WorkflowInstance) -> bool {
        self.workflow_id
            .as_ref()
            .is_none_or(|id| *id == instance.workflow_id)
            && self.status.is_none_or(|s| s == instance.status)
    }
}

// ---------------------------------------------------------------------------
// Per-instance state
// ---------------------------------------------------------------------------

struct InstanceState {
    instance: WorkflowInstance,
    machine: StateMachine<WorkflowStatus, WorkflowEvent, ()>,
    /// Whether a task is currently driving the step loop.
    loop_active: bool,
    deadline: Option<Instant>,
    pending_approval: Option<(String, oneshot::Sender<bool>)>,
}

struct InstanceSlot {
    definition: Arc<WorkflowDefinition>,
    state: Mutex<InstanceState>,
    status: watch::Sender<WorkflowStatus>,
    cancel: CancellationToken,
}

impl InstanceSlot {
    fn new(definition: Arc<WorkflowDefinition>, instance: WorkflowInstance) -> Self {
        let (status, _) = watch::channel(instance.status);
        Self {
            definition,
            state: Mutex::new(InstanceState {
                instance,
                machine: workflow_machine(),
                loop_active: false,
                deadline: None,
                pending_approval: None,
            }),
            status,
            cancel: CancellationToken::new(),
        }
    }

    fn id(&self) -> Uuid {
        self.state.lock().instance.instance_id
    }

    fn snapshot(&self) -> WorkflowInstance {
        self.state.lock().instance.clone()
    }

    fn status(&self) -> WorkflowStatus {
        *self.status.borrow()
    }

    /// Drive the machine and mirror the result onto the instance.
    fn fire(&self, state: &mut InstanceState, event: WorkflowEvent) -> bool {
        if !state.machine.transition(event) {
            return false;
        }
        let status = state.machine.current();
        let now = Utc::now();
        state.instance.status = status;
        state.instance.updated_at = now;
        if status.is_terminal() {
            state.instance.completed_at = Some(now);
            state.loop_active = false;
            state.pending_approval = None;
        }
        self.status.send_replace(status);
        true
    }

    fn store_step_result(&self, result: StepResult) {
        let mut state = self.state.lock();
        state.instance.updated_at = Utc::now();
        state
            .instance
            .step_results
            .insert(result.step_id.clone(), result);
    }
}

/// How a single step ended.
enum StepOutcome {
    Completed(Value),
    Skipped,
    Failed(StepError),
    /// Paused or cancelled from outside; the loop re-checks status.
    Interrupted,
}

/// Why the step loop returned.
enum LoopExit {
    Completed,
    Failed(WorkflowError),
    /// Paused or cancelled; the instance is left as is.
    Suspended,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

struct EngineInner {
    config: EngineConfig,
    registry: Arc<dyn AgentRegistry>,
    recovery: Arc<ErrorRecoveryManager>,
    event_bus: EventBus,
    evaluator: WorkflowEvaluator,
    definitions: RwLock<HashMap<String, BTreeMap<u32, Arc<WorkflowDefinition>>>>,
    instances: DashMap<Uuid, Arc<InstanceSlot>>,
    /// Serializes the capacity check with instance insertion.
    start_lock: Mutex<()>,
}

/// Cheaply cloneable handle to a shared engine.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig, registry: Arc<dyn AgentRegistry>, event_bus: EventBus) -> Self {
        let recovery = Arc::new(ErrorRecoveryManager::new(event_bus.clone()));
        Self::with_recovery(config, registry, event_bus, recovery)
    }

    pub fn with_recovery(
        config: EngineConfig,
        registry: Arc<dyn AgentRegistry>,
        event_bus: EventBus,
        recovery: Arc<ErrorRecoveryManager>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                registry,
                recovery,
                event_bus,
                evaluator: WorkflowEvaluator::new(),
                definitions: RwLock::new(HashMap::new()),
                instances: DashMap::new(),
                start_lock: Mutex::new(()),
            }),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    pub fn recovery(&self) -> &Arc<ErrorRecoveryManager> {
        &self.inner.recovery
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Definition registry
    // -----------------------------------------------------------------------

    /// Validate and store `def` under `(id, version)`.
    pub fn register_workflow(&self, def: WorkflowDefinition) -> Result<(), EngineError> {
        validate_definition(&def)?;
        let mut definitions = self.inner.definitions.write();
        let versions = definitions.entry(def.id.clone()).or_default();
        if versions.contains_key(&def.version) {
            return Err(EngineError::DuplicateVersion {
                id: def.id,
                version: def.version,
            });
        }
        tracing::info!(workflow_id = %def.id, version = def.version, "workflow registered");
        versions.insert(def.version, Arc::new(def));
        Ok(())
    }

    /// Remove one version, or every version when `version` is `None`.
    pub fn unregister_workflow(&self, id: &str, version: Option<u32>) -> bool {
        let mut definitions = self.inner.definitions.write();
        let removed = match version {
            None => definitions.remove(id).is_some(),
            Some(v) => {
                let removed = definitions
                    .get_mut(id)
                    .is_some_and(|versions| versions.remove(&v).is_some());
                if definitions.get(id).is_some_and(|versions| versions.is_empty()) {
                    definitions.remove(id);
                }
                removed
            }
        };
        if removed {
            tracing::info!(workflow_id = id, ?version, "workflow unregistered");
        }
        removed
    }

    /// A specific version, or the latest when `version` is `None`.
    pub fn get_workflow(&self, id: &str, version: Option<u32>) -> Option<Arc<WorkflowDefinition>> {
        let definitions = self.inner.definitions.read();
        let versions = definitions.get(id)?;
        match version {
            Some(v) => versions.get(&v).cloned(),
            None => versions.values().next_back().cloned(),
        }
    }

    /// Latest version of every registered workflow, sorted by id.
    pub fn list_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        let definitions = self.inner.definitions.read();
        let mut latest: Vec<Arc<WorkflowDefinition>> = definitions
            .values()
            .filter_map(|versions| versions.values().next_back().cloned())
            .collect();
        latest.sort_by(|a, b| a.id.cmp(&b.id));
        latest
    }

    /// The requested version, or the highest enabled one when `version` is
    /// `None`.
    fn resolve(&self, id: &str, version: Option<u32>) -> Result<Arc<WorkflowDefinition>, EngineError> {
        let definitions = self.inner.definitions.read();
        let versions = definitions
            .get(id)
            .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()))?;
        let def = match version {
            Some(v) => versions.get(&v).cloned().ok_or_else(|| EngineError::VersionNotFound {
                id: id.to_string(),
                version: v,
            })?,
            None => versions
                .values()
                .rev()
                .find(|d| d.enabled)
                .cloned()
                .ok_or_else(|| EngineError::WorkflowDisabled(id.to_string()))?,
        };
        if !def.enabled {
            return Err(EngineError::WorkflowDisabled(id.to_string()));
        }
        Ok(def)
    }

    // -----------------------------------------------------------------------
    // Starting runs
    // -----------------------------------------------------------------------

    /// Start a run of `workflow_id` and return the instance snapshot.
    ///
    /// With `options.sync` the snapshot is the terminal (or suspended) state;
    /// otherwise it is the freshly stored PENDING instance.
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        input: Value,
        options: StartOptions,
    ) -> Result<WorkflowInstance, EngineError> {
        let def = self.resolve(workflow_id, options.version)?;

        let slot = {
            let _guard = self.inner.start_lock.lock();
            let max = self.inner.config.max_concurrent_workflows;
            if self.running_count() >= max {
                tracing::warn!(workflow_id, max, "workflow start rejected, engine at capacity");
                return Err(EngineError::AtCapacity { max });
            }
            let mut instance = WorkflowInstance::new(&def, input, options.trigger);
            instance.correlation_id = options.correlation_id;
            let slot = Arc::new(InstanceSlot::new(Arc::clone(&def), instance));
            self.inner.instances.insert(slot.id(), Arc::clone(&slot));
            slot
        };

        let instance_id = slot.id();
        tracing::info!(
            instance_id = %instance_id,
            workflow_id,
            version = def.version,
            sync = options.sync,
            "starting workflow"
        );

        if options.sync {
            run_instance(Arc::clone(&self.inner), Arc::clone(&slot)).await;
        } else {
            let snapshot = slot.snapshot();
            tokio::spawn(run_instance(Arc::clone(&self.inner), slot));
            return Ok(snapshot);
        }
        Ok(slot.snapshot())
    }

    // -----------------------------------------------------------------------
    // Instance control
    // -----------------------------------------------------------------------

    fn slot(&self, instance_id: Uuid) -> Option<Arc<InstanceSlot>> {
        self.inner
            .instances
            .get(&instance_id)
            .map(|e| Arc::clone(e.value()))
    }

    /// Request a pause. Takes effect before the next step starts.
    pub fn pause(&self, instance_id: Uuid) -> bool {
        let Some(slot) = self.slot(instance_id) else {
            return false;
        };
        let paused = {
            let mut state = slot.state.lock();
            slot.fire(&mut state, WorkflowEvent::Pause)
        };
        if paused {
            tracing::info!(instance_id = %instance_id, "workflow paused");
            self.inner.publish(&slot, EventKind::WorkflowPaused, Value::Null);
        }
        paused
    }

    /// Resume a paused instance from its `current_step_id`.
    pub fn resume(&self, instance_id: Uuid) -> bool {
        let Some(slot) = self.slot(instance_id) else {
            return false;
        };
        let spawn_loop = {
            let mut state = slot.state.lock();
            if !slot.fire(&mut state, WorkflowEvent::Resume) {
                return false;
            }
            // A loop that has not yet observed the pause keeps going.
            let spawn = !state.loop_active;
            state.loop_active = true;
            spawn
        };
        tracing::info!(instance_id = %instance_id, "workflow resumed");
        self.inner.publish(&slot, EventKind::WorkflowResumed, Value::Null);
        if spawn_loop {
            tokio::spawn(run_loop(Arc::clone(&self.inner), slot));
        }
        true
    }

    /// Cancel a non-terminal instance. A pending approval wait ends at once.
    pub fn cancel(&self, instance_id: Uuid) -> bool {
        let Some(slot) = self.slot(instance_id) else {
            return false;
        };
        let cancelled = {
            let mut state = slot.state.lock();
            slot.fire(&mut state, WorkflowEvent::Cancel)
        };
        if cancelled {
            slot.cancel.cancel();
            tracing::info!(instance_id = %instance_id, "workflow cancelled");
            self.inner
                .publish(&slot, EventKind::WorkflowCancelled, Value::Null);
        }
        cancelled
    }

    /// Deliver an approval decision for `step_id`.
    ///
    /// Returns false when the instance is not waiting on that step.
    pub fn approve(&self, instance_id: Uuid, step_id: &str, approved: bool) -> bool {
        let Some(slot) = self.slot(instance_id) else {
            return false;
        };
        let sender = {
            let mut state = slot.state.lock();
            match state.pending_approval.take() {
                Some((waiting_on, sender)) if waiting_on == step_id => {
                    let event = if approved {
                        WorkflowEvent::Approve
                    } else {
                        WorkflowEvent::Reject
                    };
                    if !slot.fire(&mut state, event) {
                        state.pending_approval = Some((waiting_on, sender));
                        return false;
                    }
                    sender
                }
                other => {
                    state.pending_approval = other;
                    return false;
                }
            }
        };
        let _ = sender.send(approved);
        tracing::info!(instance_id = %instance_id, step_id, approved, "approval received");
        self.inner.event_bus.publish(
            FlowEvent::workflow(
                EventKind::ApprovalReceived,
                &slot.definition.id,
                instance_id,
            )
            .with_step(step_id)
            .with_payload(json!({ "approved": approved })),
        );
        true
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_instance(&self, instance_id: Uuid) -> Option<WorkflowInstance> {
        self.slot(instance_id).map(|slot| slot.snapshot())
    }

    /// Matching instances, oldest first.
    pub fn list_instances(&self, filter: &InstanceFilter) -> Vec<WorkflowInstance> {
        let slots: Vec<Arc<InstanceSlot>> = self
            .inner
            .instances
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let mut instances: Vec<WorkflowInstance> = slots
            .iter()
            .map(|slot| slot.snapshot())
            .filter(|i| filter.matches(i))
            .collect();
        instances.sort_by_key(|i| i.created_at);
        instances
    }

    /// Instances counting against capacity (every non-terminal status).
    pub fn running_count(&self) -> usize {
        self.inner
            .instances
            .iter()
            .filter(|e| e.value().status().is_active())
            .count()
    }

    /// Wait until the instance reaches a terminal status.
    pub async fn wait_for_completion(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let slot = self
            .slot(instance_id)
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        let mut rx = slot.status.subscribe();
        // The sender lives in the slot we hold, so this cannot fail.
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        Ok(slot.snapshot())
    }

    /// Drop terminal instances that finished more than `older_than` ago.
    pub fn cleanup_instances(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let stale: Vec<Uuid> = self
            .inner
            .instances
            .iter()
            .filter_map(|e| {
                let instance = e.value().snapshot();
                let finished_before = instance
                    .completed_at
                    .is_some_and(|at| instance.status.is_terminal() && at < cutoff);
                finished_before.then_some(instance.instance_id)
            })
            .collect();
        for id in &stale {
            self.inner.instances.remove(id);
        }
        if !stale.is_empty() {
            tracing::debug!(removed = stale.len(), "cleaned up finished instances");
        }
        stale.len()
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflows", &self.inner.definitions.read().len())
            .field("instances", &self.inner.instances.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

impl EngineInner {
    fn publish(&self, slot: &InstanceSlot, kind: EventKind, payload: Value) {
        self.event_bus.publish(
            FlowEvent::workflow(kind, &slot.definition.id, slot.id()).with_payload(payload),
        );
    }

    fn publish_step(&self, slot: &InstanceSlot, kind: EventKind, step_id: &str, payload: Value) {
        self.event_bus.publish(
            FlowEvent::workflow(kind, &slot.definition.id, slot.id())
                .with_step(step_id)
                .with_payload(payload),
        );
    }

    /// First transition whose condition holds or that is the default.
    fn select_next(&self, slot: &InstanceSlot, step: &StepDefinition, output: &Value) -> Option<String> {
        let (context, input) = {
            let state = slot.state.lock();
            (state.instance.context.to_value(), state.instance.input.clone())
        };
        step.transitions.iter().find_map(|transition| {
            let matched = match &transition.condition {
                None => true,
                Some(condition) => self
                    .evaluator
                    .evaluate_transition(condition, output, &context, &input)
                    .unwrap_or_else(|e| {
                        tracing::warn!(
                            step_id = %step.id,
                            condition = condition.as_str(),
                            error = %e,
                            "transition condition failed to evaluate, treating as false"
                        );
                        false
                    }),
            };
            (matched || transition.is_default).then(|| transition.target.clone())
        })
    }

    fn step_timeout(&self, slot: &InstanceSlot, step: &StepDefinition) -> u64 {
        step.timeout_ms
            .or(slot.definition.global_timeout_ms)
            .unwrap_or(self.config.default_step_timeout_ms)
    }
}

/// Fire `start` and drive the loop. Used for fresh instances.
async fn run_instance(inner: Arc<EngineInner>, slot: Arc<InstanceSlot>) {
    let started = {
        let mut state = slot.state.lock();
        if slot.fire(&mut state, WorkflowEvent::Start) {
            state.instance.started_at = Some(Utc::now());
            state.instance.current_step_id = Some(slot.definition.start_step_id.clone());
            state.deadline = slot
                .definition
                .global_timeout_ms
                .map(|ms| Instant::now() + Duration::from_millis(ms));
            state.loop_active = true;
            true
        } else {
            false
        }
    };
    if !started {
        tracing::debug!(instance_id = %slot.id(), "instance left pending before it started");
        return;
    }
    inner.publish(
        &slot,
        EventKind::WorkflowStarted,
        json!({ "version": slot.definition.version }),
    );
    run_loop(inner, slot).await;
}

/// Drive the step loop under the run's deadline and settle the outcome.
async fn run_loop(inner: Arc<EngineInner>, slot: Arc<InstanceSlot>) {
    let deadline = slot.state.lock().deadline;
    let exit = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, drive(&inner, &slot))
            .await
            .unwrap_or_else(|_| {
                let ms = slot.definition.global_timeout_ms.unwrap_or_default();
                LoopExit::Failed(WorkflowError::run_level(
                    codes::WORKFLOW_TIMEOUT,
                    format!("workflow exceeded its {ms}ms timeout"),
                ))
            }),
        None => drive(&inner, &slot).await,
    };

    match exit {
        LoopExit::Completed => finish_completed(&inner, &slot),
        LoopExit::Failed(error) => finish_failed(&inner, &slot, error),
        LoopExit::Suspended => {}
    }
}

fn finish_completed(inner: &EngineInner, slot: &InstanceSlot) {
    let duration_ms = {
        let mut state = slot.state.lock();
        if !slot.fire(&mut state, WorkflowEvent::Complete) {
            // Paused during the last step; resume will complete it.
            state.loop_active = false;
            return;
        }
        state.instance.current_step_id = None;
        elapsed_ms(&state.instance)
    };
    tracing::info!(instance_id = %slot.id(), workflow_id = %slot.definition.id, duration_ms, "workflow completed");
    inner.publish(slot, EventKind::WorkflowCompleted, json!({ "duration_ms": duration_ms }));
}

fn finish_failed(inner: &EngineInner, slot: &InstanceSlot, error: WorkflowError) {
    {
        let mut state = slot.state.lock();
        if !slot.fire(&mut state, WorkflowEvent::Fail) {
            state.loop_active = false;
            return;
        }
        state.instance.error = Some(error.clone());
    }
    tracing::error!(
        instance_id = %slot.id(),
        workflow_id = %slot.definition.id,
        error = %error,
        "workflow failed"
    );
    inner.publish(slot, EventKind::WorkflowFailed, json!({ "error": error }));
}

fn elapsed_ms(instance: &WorkflowInstance) -> u64 {
    instance
        .started_at
        .map(|at| (Utc::now() - at).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}

/// The step loop proper.
async fn drive(inner: &EngineInner, slot: &InstanceSlot) -> LoopExit {
    let def = Arc::clone(&slot.definition);
    loop {
        let current = {
            let mut state = slot.state.lock();
            if state.instance.status != WorkflowStatus::Running {
                state.loop_active = false;
                return LoopExit::Suspended;
            }
            state.instance.current_step_id.clone()
        };

        let Some(step_id) = current else {
            return LoopExit::Completed;
        };
        let Some(step) = def.step(&step_id) else {
            return LoopExit::Failed(WorkflowError::run_level(
                codes::STEP_NOT_FOUND,
                format!("step '{step_id}' is not part of workflow '{}'", def.id),
            ));
        };

        let next = match execute_step(inner, slot, step).await {
            StepOutcome::Completed(output) => inner.select_next(slot, step, &output),
            StepOutcome::Skipped => inner.select_next(slot, step, &Value::Null),
            StepOutcome::Interrupted => continue,
            StepOutcome::Failed(error) => {
                let snapshot = slot.snapshot();
                let recovery = &inner.recovery;
                let decision = if step.required {
                    None
                } else {
                    match recovery.determine_recovery_action(&error, step, &snapshot) {
                        RecoveryAction::Retry { .. } => {
                            Some(recovery.get_fallback_action(recovery.classify(&error), step))
                        }
                        other => Some(other),
                    }
                };
                let action = match decision {
                    Some(action @ (RecoveryAction::Skip | RecoveryAction::Fallback)) => action,
                    _ => recovery.get_action_from_strategy(def.error_strategy),
                };
                recovery.execute_recovery_action(action, &error, step, &snapshot);

                match action {
                    RecoveryAction::Skip => {
                        tracing::warn!(step_id = %step.id, "failed step skipped");
                        inner.select_next(slot, step, &Value::Null)
                    }
                    RecoveryAction::Fallback => match step.default_transition() {
                        Some(transition) => Some(transition.target.clone()),
                        None => return LoopExit::Failed(WorkflowError::from_step(&step.id, &error)),
                    },
                    RecoveryAction::Retry { .. } | RecoveryAction::Escalate | RecoveryAction::Abort => {
                        return LoopExit::Failed(WorkflowError::from_step(&step.id, &error));
                    }
                }
            }
        };

        let mut state = slot.state.lock();
        state.instance.current_step_id = next;
        state.instance.updated_at = Utc::now();
    }
}

/// Suspend until an approval decision for `step` arrives.
///
/// `None` means the wait was interrupted (paused before it began, or
/// cancelled while waiting).
async fn await_approval(inner: &EngineInner, slot: &InstanceSlot, step: &StepDefinition) -> Option<bool> {
    let receiver = {
        let mut state = slot.state.lock();
        if !slot.fire(&mut state, WorkflowEvent::RequestApproval) {
            return None;
        }
        let (sender, receiver) = oneshot::channel();
        state.pending_approval = Some((step.id.clone(), sender));
        receiver
    };

    tracing::info!(instance_id = %slot.id(), step_id = %step.id, "waiting for approval");
    inner.publish_step(
        slot,
        EventKind::ApprovalRequested,
        &step.id,
        json!({ "prompt": step.approval_prompt }),
    );

    tokio::select! {
        decision = receiver => decision.ok(),
        _ = slot.cancel.cancelled() => None,
    }
}

/// Run one step to completion, including its approval gate and retries.
async fn execute_step(inner: &EngineInner, slot: &InstanceSlot, step: &StepDefinition) -> StepOutcome {
    let instance_id = slot.id();
    let mut machine = step_machine();
    let mut retry_count = 0u32;
    let started_at = Utc::now();

    if step.requires_approval {
        match await_approval(inner, slot, step).await {
            Some(true) => {}
            Some(false) => {
                machine.transition(StepEvent::Wait);
                machine.transition(StepEvent::Fail);
                let error = ExecutionError::fatal(
                    codes::APPROVAL_REJECTED,
                    format!("approval rejected for step '{}'", step.id),
                );
                return fail_step(inner, slot, step, &machine, started_at, 0, error);
            }
            None => return StepOutcome::Interrupted,
        }
    }

    let Some(agent) = inner.registry.get_agent(&step.agent_id) else {
        if !step.required {
            machine.transition(StepEvent::Skip);
            slot.store_step_result(StepResult {
                step_id: step.id.clone(),
                status: machine.current(),
                started_at,
                completed_at: Some(Utc::now()),
                execution_time_ms: 0,
                output: None,
                error: None,
                retry_count: 0,
            });
            tracing::warn!(instance_id = %instance_id, step_id = %step.id, agent_id = %step.agent_id, "agent not found, optional step skipped");
            inner.publish_step(
                slot,
                EventKind::StepSkipped,
                &step.id,
                json!({ "reason": "agent_not_found" }),
            );
            return StepOutcome::Skipped;
        }
        machine.transition(StepEvent::Start);
        machine.transition(StepEvent::Fail);
        let error = ExecutionError::fatal(
            codes::AGENT_NOT_FOUND,
            format!("agent '{}' is not registered", step.agent_id),
        );
        return fail_step(inner, slot, step, &machine, started_at, 0, error);
    };

    let timeout_ms = inner.step_timeout(slot, step);
    let caller_id = instance_id.to_string();

    loop {
        machine.transition(StepEvent::Start);
        let attempt_started = Utc::now();
        let input = {
            let state = slot.state.lock();
            build_step_input(step, &state.instance)
        };
        slot.store_step_result(StepResult {
            step_id: step.id.clone(),
            status: machine.current(),
            started_at: attempt_started,
            completed_at: None,
            execution_time_ms: 0,
            output: None,
            error: None,
            retry_count,
        });
        tracing::debug!(instance_id = %instance_id, step_id = %step.id, attempt = retry_count + 1, "step started");
        inner.publish_step(
            slot,
            EventKind::StepStarted,
            &step.id,
            json!({ "attempt": retry_count + 1 }),
        );

        let clock = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            agent.execute(input, &caller_id),
        )
        .await;
        let execution_time_ms = clock.elapsed().as_millis() as u64;

        let error = match result {
            Ok(agent_result) => match agent_result.into_result() {
                Ok(output) => {
                    machine.transition(StepEvent::Complete);
                    {
                        let mut state = slot.state.lock();
                        record_step_output(step, &output, &mut state.instance.context);
                        state.instance.step_results.insert(
                            step.id.clone(),
                            StepResult {
                                step_id: step.id.clone(),
                                status: machine.current(),
                                started_at: attempt_started,
                                completed_at: Some(Utc::now()),
                                execution_time_ms,
                                output: Some(output.clone()),
                                error: None,
                                retry_count,
                            },
                        );
                        state.instance.updated_at = Utc::now();
                    }
                    tracing::debug!(instance_id = %instance_id, step_id = %step.id, execution_time_ms, "step completed");
                    inner.publish_step(
                        slot,
                        EventKind::StepCompleted,
                        &step.id,
                        json!({ "execution_time_ms": execution_time_ms, "retry_count": retry_count }),
                    );
                    return StepOutcome::Completed(output);
                }
                Err(error) => error,
            },
            Err(_) => ExecutionError::timeout(&format!("step '{}'", step.id), timeout_ms),
        };

        machine.transition(StepEvent::Fail);
        let snapshot = {
            let mut state = slot.state.lock();
            state.instance.step_results.insert(
                step.id.clone(),
                StepResult {
                    step_id: step.id.clone(),
                    status: machine.current(),
                    started_at: attempt_started,
                    completed_at: Some(Utc::now()),
                    execution_time_ms,
                    output: None,
                    error: Some(error.clone()),
                    retry_count,
                },
            );
            state.instance.updated_at = Utc::now();
            state.instance.clone()
        };

        let retry_allowed = step
            .retry
            .as_ref()
            .is_some_and(|retry| retry_count < retry.max_retries);
        if retry_allowed {
            let action = inner
                .recovery
                .determine_recovery_action(&error, step, &snapshot);
            if let RecoveryAction::Retry { delay } = action {
                inner
                    .recovery
                    .execute_recovery_action(action, &error, step, &snapshot);
                tracing::warn!(
                    instance_id = %instance_id,
                    step_id = %step.id,
                    retry_count = retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "step failed, retrying"
                );
                inner.publish_step(
                    slot,
                    EventKind::StepRetrying,
                    &step.id,
                    json!({ "retry_count": retry_count + 1, "delay_ms": delay.as_millis() as u64, "error": error }),
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = slot.cancel.cancelled() => return StepOutcome::Interrupted,
                }
                retry_count += 1;
                slot.state.lock().instance.retry_count += 1;
                machine.transition(StepEvent::Retry);
                continue;
            }
        }

        return fail_step(inner, slot, step, &machine, attempt_started, retry_count, error);
    }
}

/// Record a terminal step failure and announce it.
fn fail_step(
    inner: &EngineInner,
    slot: &InstanceSlot,
    step: &StepDefinition,
    machine: &StateMachine<StepStatus, StepEvent, ()>,
    started_at: chrono::DateTime<Utc>,
    retry_count: u32,
    error: StepError,
) -> StepOutcome {
    {
        let mut state = slot.state.lock();
        let entry = state
            .instance
            .step_results
            .entry(step.id.clone())
            .or_insert_with(|| StepResult {
                step_id: step.id.clone(),
                status: StepStatus::Failed,
                started_at,
                completed_at: None,
                execution_time_ms: 0,
                output: None,
                error: None,
                retry_count,
            });
        entry.status = machine.current();
        entry.completed_at.get_or_insert_with(Utc::now);
        entry.error = Some(error.clone());
        entry.retry_count = retry_count;
    }
    tracing::warn!(instance_id = %slot.id(), step_id = %step.id, code = %error.code, error = %error.message, "step failed");
    inner.publish_step(slot, EventKind::StepFailed, &step.id, json!({ "error": error }));
    StepOutcome::Failed(error)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, InMemoryAgentRegistry};
    use flowline_types::agent::AgentResult;
    use flowline_types::retry::RetryConfig;
    use flowline_types::workflow::{ErrorStrategy, StepTransition};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Echo;

    impl Agent for Echo {
        fn id(&self) -> &str {
            "echo"
        }

        async fn execute(&self, input: Value, _caller_id: &str) -> AgentResult {
            AgentResult::ok(input)
        }
    }

    struct Sleepy(u64);

    impl Agent for Sleepy {
        fn id(&self) -> &str {
            "sleepy"
        }

        async fn execute(&self, _input: Value, _caller_id: &str) -> AgentResult {
            tokio::time::sleep(Duration::from_millis(self.0)).await;
            AgentResult::ok(json!({ "slept": self.0 }))
        }
    }

    struct Broken(Arc<AtomicU32>);

    impl Agent for Broken {
        fn id(&self) -> &str {
            "broken"
        }

        async fn execute(&self, _input: Value, _caller_id: &str) -> AgentResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            AgentResult::failure(ExecutionError::fatal("E_DECLINED", "card declined"))
        }
    }

    struct Flaky(Arc<AtomicU32>);

    impl Agent for Flaky {
        fn id(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _input: Value, _caller_id: &str) -> AgentResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            AgentResult::failure(ExecutionError::recoverable("E_UPSTREAM", "upstream busy"))
        }
    }

    fn workflow(id: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            version: 1,
            start_step_id: steps[0].id.clone(),
            steps,
            global_timeout_ms: None,
            error_strategy: ErrorStrategy::Stop,
            enabled: true,
            triggers: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    fn step(id: &str, agent: &str, next: Option<&str>) -> StepDefinition {
        let mut s = StepDefinition::new(id, agent);
        if let Some(next) = next {
            s.transitions.push(StepTransition::to(next));
        }
        s
    }

    fn engine_with(max: usize, broken_calls: Arc<AtomicU32>) -> WorkflowEngine {
        let registry = InMemoryAgentRegistry::new();
        registry.register(Echo);
        registry.register(Sleepy(50));
        registry.register(Broken(broken_calls.clone()));
        registry.register(Flaky(broken_calls));
        WorkflowEngine::new(
            EngineConfig {
                max_concurrent_workflows: max,
                ..EngineConfig::default()
            },
            Arc::new(registry),
            EventBus::new(256),
        )
    }

    fn engine() -> WorkflowEngine {
        engine_with(10, Arc::new(AtomicU32::new(0)))
    }

    // -------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------

    #[test]
    fn test_register_versions_and_latest() {
        let engine = engine();
        let mut v1 = workflow("orders", vec![step("a", "echo", None)]);
        engine.register_workflow(v1.clone()).unwrap();
        v1.version = 3;
        engine.register_workflow(v1.clone()).unwrap();

        assert_eq!(engine.get_workflow("orders", None).unwrap().version, 3);
        assert_eq!(engine.get_workflow("orders", Some(1)).unwrap().version, 1);
        assert!(matches!(
            engine.register_workflow(v1),
            Err(EngineError::DuplicateVersion { version: 3, .. })
        ));
        assert_eq!(engine.list_workflows().len(), 1);

        assert!(engine.unregister_workflow("orders", Some(3)));
        assert_eq!(engine.get_workflow("orders", None).unwrap().version, 1);
        assert!(engine.unregister_workflow("orders", None));
        assert!(engine.get_workflow("orders", None).is_none());
    }

    #[tokio::test]
    async fn test_start_uses_highest_enabled_version() {
        let engine = engine();
        let v1 = workflow("orders", vec![step("a", "echo", None)]);
        engine.register_workflow(v1.clone()).unwrap();
        let mut v2 = v1.clone();
        v2.version = 2;
        v2.enabled = false;
        engine.register_workflow(v2).unwrap();

        let instance = engine
            .start_workflow("orders", json!({}), StartOptions::sync())
            .await
            .unwrap();
        assert_eq!(instance.workflow_version, 1);
        assert_eq!(instance.status, WorkflowStatus::Completed);

        let pinned = StartOptions {
            version: Some(2),
            ..StartOptions::sync()
        };
        assert!(matches!(
            engine.start_workflow("orders", json!({}), pinned).await,
            Err(EngineError::WorkflowDisabled(_))
        ));
    }

    #[test]
    fn test_register_rejects_invalid_definition() {
        let engine = engine();
        let mut def = workflow("bad", vec![step("a", "echo", Some("ghost"))]);
        def.start_step_id = "a".to_string();
        assert!(matches!(
            engine.register_workflow(def),
            Err(EngineError::InvalidDefinition(_))
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_and_disabled() {
        let engine = engine();
        assert!(matches!(
            engine.start_workflow("nope", json!({}), StartOptions::sync()).await,
            Err(EngineError::WorkflowNotFound(_))
        ));
        let mut def = workflow("off", vec![step("a", "echo", None)]);
        def.enabled = false;
        engine.register_workflow(def).unwrap();
        assert!(matches!(
            engine.start_workflow("off", json!({}), StartOptions::sync()).await,
            Err(EngineError::WorkflowDisabled(_))
        ));
    }

    // -------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_linear_run_completes_and_maps_output() {
        let engine = engine();
        let mut first = step("first", "echo", Some("second"));
        first.output_mapping.insert("who".to_string(), "name".to_string());
        let mut second = step("second", "echo", None);
        second.input_mapping.insert("greeting".to_string(), "context.variables.who".to_string());
        engine
            .register_workflow(workflow("hello", vec![first, second]))
            .unwrap();

        let instance = engine
            .start_workflow("hello", json!({ "name": "ada" }), StartOptions::sync())
            .await
            .unwrap();

        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert_eq!(instance.step_results["first"].status, StepStatus::Completed);
        assert_eq!(instance.context.results["second"], json!({ "greeting": "ada" }));
        assert!(instance.completed_at.is_some());
        assert!(instance.current_step_id.is_none());
    }

    #[tokio::test]
    async fn test_conditional_transition_picks_first_match() {
        let engine = engine();
        let mut check = StepDefinition::new("check", "echo");
        check.transitions = vec![
            StepTransition::when("result.amount > 100", "big"),
            StepTransition::to("small"),
        ];
        engine
            .register_workflow(workflow(
                "route",
                vec![check, step("big", "echo", None), step("small", "echo", None)],
            ))
            .unwrap();

        let big = engine
            .start_workflow("route", json!({ "amount": 500.0 }), StartOptions::sync())
            .await
            .unwrap();
        assert!(big.step_results.contains_key("big"));
        assert!(!big.step_results.contains_key("small"));

        let small = engine
            .start_workflow("route", json!({ "amount": 5.0 }), StartOptions::sync())
            .await
            .unwrap();
        assert!(small.step_results.contains_key("small"));
    }

    #[tokio::test]
    async fn test_missing_agent_optional_skips_required_fails() {
        let engine = engine();
        let mut optional = step("notify", "mailer", Some("done"));
        optional.required = false;
        engine
            .register_workflow(workflow("opt", vec![optional, step("done", "echo", None)]))
            .unwrap();
        let instance = engine
            .start_workflow("opt", json!({}), StartOptions::sync())
            .await
            .unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert_eq!(instance.step_results["notify"].status, StepStatus::Skipped);

        engine
            .register_workflow(workflow("req", vec![step("notify", "mailer", None)]))
            .unwrap();
        let instance = engine
            .start_workflow("req", json!({}), StartOptions::sync())
            .await
            .unwrap();
        assert_eq!(instance.status, WorkflowStatus::Failed);
        let error = instance.error.unwrap();
        assert_eq!(error.code, codes::AGENT_NOT_FOUND);
        assert_eq!(error.failed_step_id.as_deref(), Some("notify"));
    }

    #[tokio::test]
    async fn test_skip_strategy_advances_past_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine_with(10, calls.clone());
        let mut def = workflow(
            "lenient",
            vec![step("charge", "broken", Some("ship")), step("ship", "echo", None)],
        );
        def.error_strategy = ErrorStrategy::Skip;
        engine.register_workflow(def).unwrap();

        let instance = engine
            .start_workflow("lenient", json!({}), StartOptions::sync())
            .await
            .unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert_eq!(instance.step_results["charge"].status, StepStatus::Failed);
        assert_eq!(instance.step_results["ship"].status, StepStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_strategy_follows_default_transition() {
        let engine = engine();
        let mut charge = StepDefinition::new("charge", "broken");
        charge.transitions = vec![
            StepTransition::when("result.ok == true", "ship"),
            StepTransition::to("refund"),
        ];
        let mut def = workflow(
            "fallback",
            vec![charge, step("ship", "echo", None), step("refund", "echo", None)],
        );
        def.error_strategy = ErrorStrategy::Fallback;
        engine.register_workflow(def).unwrap();

        let instance = engine
            .start_workflow("fallback", json!({}), StartOptions::sync())
            .await
            .unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert!(instance.step_results.contains_key("refund"));
        assert!(!instance.step_results.contains_key("ship"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_synthesizes_timeout_error() {
        let engine = engine();
        let mut slow = step("slow", "sleepy", None);
        slow.timeout_ms = Some(10);
        engine.register_workflow(workflow("slow", vec![slow])).unwrap();

        let instance = engine
            .start_workflow("slow", json!({}), StartOptions::sync())
            .await
            .unwrap();
        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert_eq!(instance.error.unwrap().code, codes::TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_timeout_fails_run() {
        let engine = engine();
        let mut def = workflow(
            "deadline",
            vec![
                step("one", "sleepy", Some("two")),
                step("two", "sleepy", Some("three")),
                step("three", "sleepy", None),
            ],
        );
        def.global_timeout_ms = Some(120);
        engine.register_workflow(def).unwrap();

        let instance = engine
            .start_workflow("deadline", json!({}), StartOptions::sync())
            .await
            .unwrap();
        assert_eq!(instance.status, WorkflowStatus::Failed);
        let error = instance.error.unwrap();
        assert_eq!(error.code, codes::WORKFLOW_TIMEOUT);
        assert!(error.failed_step_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine_with(10, calls.clone());
        let mut charge = step("charge", "broken", None);
        // E_DECLINED matches no retry pattern and is not recoverable.
        charge.retry = Some(RetryConfig::new(3, 10));
        engine.register_workflow(workflow("pay", vec![charge])).unwrap();

        let instance = engine
            .start_workflow("pay", json!({}), StartOptions::sync())
            .await
            .unwrap();
        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(instance.step_results["charge"].retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_counts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine_with(10, calls.clone());
        let mut fetch = step("fetch", "flaky", None);
        fetch.retry = Some(RetryConfig::new(2, 10));
        engine.register_workflow(workflow("fetch", vec![fetch])).unwrap();

        let instance = engine
            .start_workflow("fetch", json!({}), StartOptions::sync())
            .await
            .unwrap();
        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(instance.step_results["fetch"].retry_count, 2);
        assert_eq!(instance.retry_count, 2);
        assert_eq!(instance.error.unwrap().code, "E_UPSTREAM");
        assert_eq!(engine.recovery().stats().successes, 2);
    }

    // -------------------------------------------------------------------
    // Control
    // -------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_continue_from_next_step() {
        let engine = engine();
        engine
            .register_workflow(workflow(
                "long",
                vec![step("one", "sleepy", Some("two")), step("two", "echo", None)],
            ))
            .unwrap();
        let mut events = engine.event_bus().subscribe();

        let started = engine
            .start_workflow("long", json!({}), StartOptions::default())
            .await
            .unwrap();
        let id = started.instance_id;
        loop {
            if events.recv().await.unwrap().kind == EventKind::StepStarted {
                break;
            }
        }

        assert!(engine.pause(id));
        assert!(!engine.pause(id));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let paused = engine.get_instance(id).unwrap();
        assert_eq!(paused.status, WorkflowStatus::Paused);
        assert_eq!(paused.current_step_id.as_deref(), Some("two"));
        assert!(!paused.step_results.contains_key("two"));

        assert!(engine.resume(id));
        let done = engine.wait_for_completion(id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert!(done.step_results.contains_key("two"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_on_terminal_instance_is_noop() {
        let engine = engine();
        engine
            .register_workflow(workflow("quick", vec![step("a", "echo", None)]))
            .unwrap();
        let instance = engine
            .start_workflow("quick", json!({}), StartOptions::sync())
            .await
            .unwrap();
        let id = instance.instance_id;
        assert!(!engine.pause(id));
        assert!(!engine.resume(id));
        assert!(!engine.cancel(id));
        assert_eq!(engine.get_instance(id).unwrap().status, WorkflowStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_limit_and_running_count() {
        let engine = engine_with(1, Arc::new(AtomicU32::new(0)));
        engine
            .register_workflow(workflow("slow", vec![step("a", "sleepy", None)]))
            .unwrap();

        let first = engine
            .start_workflow("slow", json!({}), StartOptions::default())
            .await
            .unwrap();
        assert_eq!(engine.running_count(), 1);
        assert!(matches!(
            engine.start_workflow("slow", json!({}), StartOptions::default()).await,
            Err(EngineError::AtCapacity { max: 1 })
        ));

        engine.wait_for_completion(first.instance_id).await.unwrap();
        assert_eq!(engine.running_count(), 0);
        assert!(
            engine
                .start_workflow("slow", json!({}), StartOptions::sync())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_list_filter_and_cleanup() {
        let engine = engine();
        engine
            .register_workflow(workflow("a", vec![step("s", "echo", None)]))
            .unwrap();
        engine
            .register_workflow(workflow("b", vec![step("s", "broken", None)]))
            .unwrap();
        engine.start_workflow("a", json!({}), StartOptions::sync()).await.unwrap();
        engine.start_workflow("b", json!({}), StartOptions::sync()).await.unwrap();

        let failed = engine.list_instances(&InstanceFilter {
            status: Some(WorkflowStatus::Failed),
            ..InstanceFilter::default()
        });
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].workflow_id, "b");
        assert_eq!(engine.list_instances(&InstanceFilter::default()).len(), 2);

        assert_eq!(engine.cleanup_instances(Duration::from_secs(3600)), 0);
        assert_eq!(engine.cleanup_instances(Duration::ZERO), 2);
        assert!(engine.list_instances(&InstanceFilter::default()).is_empty());
    }
}
