//! Cron scheduler for agent and workflow jobs.
//!
//! `CronScheduler` keeps registered `JobDefinition`s with their derived
//! `ScheduleInfo` and fires due jobs from a fixed-interval tick:
//!
//! - Jobs with `next_run <= now` that are enabled and not already in flight
//!   are checked against their conditions; a veto only advances `next_run`.
//! - Agent jobs run through a `JobQueue` that bounds concurrency, each with
//!   its own `RetryPolicy`.
//! - Workflow jobs start a synchronous run on the attached `WorkflowEngine`.
//! - Settled `JobInstance`s move to a bounded, age-pruned history.
//!
//! `tick()` is public so tests and the CLI can drive a tick explicitly.

pub mod schedule;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc, Weekday};
use dashmap::DashMap;
use flowline_types::config::{QueueConfig, SchedulerConfig};
use flowline_types::error::{ExecutionError, JobError, codes};
use flowline_types::event::{EventKind, FlowEvent};
use flowline_types::job::{
    JobCondition, JobDefinition, JobInstance, JobStatus, JobTarget, ScheduleInfo,
};
use flowline_types::retry::RetryPolicyConfig;
use flowline_types::workflow::{TriggerInfo, WorkflowStatus};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentRegistry;
use crate::event::EventBus;
use crate::queue::{EnqueueOptions, JobQueue, QueueOutcome};
use crate::retry::RetryPolicy;
use crate::workflow::{StartOptions, WorkflowEngine};

pub use schedule::{CronSchedule, normalize_schedule, parse_timezone};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Invalid cron expression or schedule alias.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid timezone: '{0}'")]
    InvalidTimezone(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job already registered: {0}")]
    DuplicateJob(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    /// A fire of this job is still running.
    #[error("job '{0}' is already running")]
    JobInFlight(String),

    #[error("scheduler is stopped")]
    Stopped,

    /// Firing or starting was attempted outside a tokio runtime.
    #[error("no tokio runtime to run jobs on")]
    NoRuntime,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Custom fire-time predicate, registered by name and referenced from
/// `JobCondition::Custom`. Returning false vetoes the fire.
pub type ConditionFn = Arc<dyn Fn(&JobDefinition, DateTime<Utc>) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    /// Constructed; ticks only when driven explicitly.
    Idle,
    Running,
    Paused,
    Stopped,
}

/// Payload of the agent-job queue.
#[derive(Debug, Clone)]
struct AgentJob {
    job_id: String,
    instance_id: Uuid,
    agent_id: String,
    input: Value,
    retry: RetryPolicyConfig,
    attempt_timeout_ms: u64,
}

struct JobEntry {
    def: JobDefinition,
    schedule: CronSchedule,
    info: ScheduleInfo,
}

struct SchedulerState {
    jobs: HashMap<String, JobEntry>,
    /// Job id -> the running fire. At most one per job.
    in_flight: HashMap<String, JobInstance>,
    history: VecDeque<JobInstance>,
    status: SchedulerStatus,
    ticker: Option<CancellationToken>,
    /// Policy for agent jobs that declare none.
    default_retry: RetryPolicyConfig,
}

struct SchedulerInner {
    config: SchedulerConfig,
    state: Arc<Mutex<SchedulerState>>,
    conditions: DashMap<String, ConditionFn>,
    queue: JobQueue<AgentJob, Value>,
    engine: Option<WorkflowEngine>,
    event_bus: EventBus,
}

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle; clones share jobs, history and the tick loop.
#[derive(Clone)]
pub struct CronScheduler {
    inner: Arc<SchedulerInner>,
}

impl CronScheduler {
    /// Create an idle scheduler. `engine` is required for workflow jobs.
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<dyn AgentRegistry>,
        event_bus: EventBus,
        engine: Option<WorkflowEngine>,
    ) -> Self {
        let state = Arc::new(Mutex::new(SchedulerState {
            jobs: HashMap::new(),
            in_flight: HashMap::new(),
            history: VecDeque::new(),
            status: SchedulerStatus::Idle,
            ticker: None,
            default_retry: RetryPolicyConfig::none(),
        }));

        let queue_config = QueueConfig {
            concurrency: config.concurrency.max(1),
            retry: RetryPolicyConfig::none(),
            ..QueueConfig::default()
        };
        let queue = {
            let state = Arc::clone(&state);
            let bus = event_bus.clone();
            JobQueue::new(queue_config, move |job: AgentJob| {
                run_agent_job(Arc::clone(&registry), Arc::clone(&state), bus.clone(), job)
            })
        };

        Self {
            inner: Arc::new(SchedulerInner {
                config,
                state,
                conditions: DashMap::new(),
                queue,
                engine,
                event_bus,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Job registry
    // -----------------------------------------------------------------------

    /// Validate and register `def`, computing its first `next_run`.
    pub fn register_job(&self, mut def: JobDefinition) -> Result<ScheduleInfo, SchedulerError> {
        if def.id.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("job id must not be empty".to_string()));
        }
        if def.target.id().trim().is_empty() {
            return Err(SchedulerError::InvalidJob(format!(
                "job '{}' has an empty target id",
                def.id
            )));
        }
        if def.timeout_ms == Some(0) {
            return Err(SchedulerError::InvalidJob(format!(
                "job '{}' timeout must be > 0",
                def.id
            )));
        }
        if def.timezone.trim().is_empty() {
            def.timezone = self.inner.config.default_timezone.clone();
        }
        let schedule = CronSchedule::parse(&def.cron_expr, &def.timezone)?;

        let info = ScheduleInfo {
            job_id: def.id.clone(),
            cron_expr: schedule.expr().to_string(),
            next_run: def
                .enabled
                .then(|| schedule.next_after(Utc::now()))
                .flatten(),
            previous_run: None,
            enabled: def.enabled,
        };

        {
            let mut state = self.inner.state.lock();
            if state.jobs.contains_key(&def.id) {
                return Err(SchedulerError::DuplicateJob(def.id));
            }
            state.jobs.insert(
                def.id.clone(),
                JobEntry {
                    def: def.clone(),
                    schedule,
                    info: info.clone(),
                },
            );
        }

        tracing::info!(
            job_id = %def.id,
            cron = %info.cron_expr,
            timezone = %def.timezone,
            next_run = ?info.next_run,
            "job registered"
        );
        self.inner.event_bus.publish(
            FlowEvent::job(EventKind::JobRegistered, &def.id)
                .with_payload(json!({ "cron_expr": info.cron_expr, "next_run": info.next_run })),
        );
        Ok(info)
    }

    /// Remove a job. A fire already in flight runs to completion.
    pub fn unregister_job(&self, job_id: &str) -> bool {
        let removed = self.inner.state.lock().jobs.remove(job_id).is_some();
        if removed {
            tracing::info!(job_id, "job unregistered");
            self.inner
                .event_bus
                .publish(FlowEvent::job(EventKind::JobUnregistered, job_id));
        }
        removed
    }

    pub fn enable_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.set_enabled(job_id, true)
    }

    pub fn disable_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.set_enabled(job_id, false)
    }

    fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<(), SchedulerError> {
        let next_run = {
            let mut state = self.inner.state.lock();
            let entry = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
            entry.def.enabled = enabled;
            entry.info.enabled = enabled;
            entry.info.next_run = if enabled {
                entry.schedule.next_after(Utc::now())
            } else {
                None
            };
            entry.info.next_run
        };
        tracing::info!(job_id, enabled, "job toggled");
        if enabled {
            self.publish_scheduled(job_id, next_run);
        }
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Option<JobDefinition> {
        self.inner.state.lock().jobs.get(job_id).map(|e| e.def.clone())
    }

    /// All jobs, sorted by id.
    pub fn list_jobs(&self) -> Vec<JobDefinition> {
        let mut jobs: Vec<JobDefinition> = self
            .inner
            .state
            .lock()
            .jobs
            .values()
            .map(|e| e.def.clone())
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn get_schedule(&self, job_id: &str) -> Option<ScheduleInfo> {
        self.inner.state.lock().jobs.get(job_id).map(|e| e.info.clone())
    }

    pub fn list_schedules(&self) -> Vec<ScheduleInfo> {
        let mut schedules: Vec<ScheduleInfo> = self
            .inner
            .state
            .lock()
            .jobs
            .values()
            .map(|e| e.info.clone())
            .collect();
        schedules.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        schedules
    }

    /// Retry policy applied to agent jobs without their own `retry`.
    /// Defaults to no retries.
    pub fn set_default_retry(&self, retry: RetryPolicyConfig) {
        self.inner.state.lock().default_retry = retry;
    }

    /// Register a named predicate for `JobCondition::Custom`.
    pub fn register_condition<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&JobDefinition, DateTime<Utc>) -> bool + Send + Sync + 'static,
    {
        self.inner.conditions.insert(name.into(), Arc::new(predicate));
    }

    pub fn remove_condition(&self, name: &str) -> bool {
        self.inner.conditions.remove(name).is_some()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Settled job instances, oldest first, optionally for one job.
    pub fn history(&self, job_id: Option<&str>) -> Vec<JobInstance> {
        self.inner
            .state
            .lock()
            .history
            .iter()
            .filter(|i| job_id.is_none_or(|id| i.job_id == id))
            .cloned()
            .collect()
    }

    pub fn in_flight_jobs(&self) -> Vec<JobInstance> {
        self.inner.state.lock().in_flight.values().cloned().collect()
    }

    pub fn status(&self) -> SchedulerStatus {
        self.inner.state.lock().status
    }

    /// Preview the next `count` fire times of a cron expression or alias.
    pub fn next_runs(
        cron: &str,
        timezone: &str,
        count: usize,
    ) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
        schedule::next_runs(cron, timezone, count)
    }

    /// Fires each enabled job would have had between `since` and now.
    pub fn missed_runs(&self, since: DateTime<Utc>) -> Vec<(String, Vec<DateTime<Utc>>)> {
        let now = Utc::now();
        let mut missed: Vec<(String, Vec<DateTime<Utc>>)> = {
            let state = self.inner.state.lock();
            state
                .jobs
                .values()
                .filter(|e| e.def.enabled)
                .map(|e| (e.def.id.clone(), e.schedule.between(since, now)))
                .filter(|(_, runs)| !runs.is_empty())
                .collect()
        };
        missed.sort_by(|a, b| a.0.cmp(&b.0));
        for (job_id, runs) in &missed {
            tracing::warn!(job_id = %job_id, count = runs.len(), "detected missed cron runs");
        }
        missed
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the tick loop (first tick immediately) and the agent queue.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        {
            let mut state = self.inner.state.lock();
            if matches!(state.status, SchedulerStatus::Running | SchedulerStatus::Paused) {
                return Ok(());
            }
            state.status = SchedulerStatus::Running;
            state.ticker = Some(self.spawn_ticker(&runtime));
        }
        self.inner.queue.start();
        tracing::info!(
            tick_interval_secs = self.inner.config.tick_interval_secs,
            "cron scheduler started"
        );
        self.inner.event_bus.emit(EventKind::SchedulerStarted);
        Ok(())
    }

    /// Tear down the tick loop and stop the queue. Running fires finish.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.status == SchedulerStatus::Stopped {
                return;
            }
            state.status = SchedulerStatus::Stopped;
            if let Some(ticker) = state.ticker.take() {
                ticker.cancel();
            }
        }
        self.inner.queue.stop();
        tracing::info!("cron scheduler stopped");
        self.inner.event_bus.emit(EventKind::SchedulerStopped);
    }

    pub fn pause(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.status != SchedulerStatus::Running {
                return false;
            }
            state.status = SchedulerStatus::Paused;
            if let Some(ticker) = state.ticker.take() {
                ticker.cancel();
            }
        }
        self.inner.queue.pause();
        tracing::info!("cron scheduler paused");
        self.inner.event_bus.emit(EventKind::SchedulerPaused);
        true
    }

    pub fn resume(&self) -> Result<bool, SchedulerError> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        {
            let mut state = self.inner.state.lock();
            if state.status != SchedulerStatus::Paused {
                return Ok(false);
            }
            state.status = SchedulerStatus::Running;
            state.ticker = Some(self.spawn_ticker(&runtime));
        }
        self.inner.queue.resume();
        tracing::info!("cron scheduler resumed");
        self.inner.event_bus.emit(EventKind::SchedulerResumed);
        Ok(true)
    }

    fn spawn_ticker(&self, runtime: &Handle) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let scheduler = self.clone();
        let period = Duration::from_secs(self.inner.config.tick_interval_secs.max(1));
        runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.tick() {
                            tracing::warn!(error = %e, "scheduler tick failed");
                        }
                    }
                }
            }
            tracing::debug!("scheduler tick loop exited");
        });
        token
    }

    // -----------------------------------------------------------------------
    // Firing
    // -----------------------------------------------------------------------

    /// Fire every due job now. Returns the ids of the job instances started.
    pub fn tick(&self) -> Result<Vec<Uuid>, SchedulerError> {
        self.tick_at(Utc::now())
    }

    /// Fire every job due at `now`.
    ///
    /// Errors without touching any schedule when called outside a tokio
    /// runtime.
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, SchedulerError> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let due: Vec<(JobDefinition, CronSchedule)> = {
            let state = self.inner.state.lock();
            if matches!(state.status, SchedulerStatus::Paused | SchedulerStatus::Stopped) {
                return Ok(Vec::new());
            }
            state
                .jobs
                .values()
                .filter(|e| e.def.enabled && e.info.next_run.is_some_and(|at| at <= now))
                .filter(|e| !state.in_flight.contains_key(&e.def.id))
                .map(|e| (e.def.clone(), e.schedule.clone()))
                .collect()
        };

        let mut started = Vec::new();
        for (def, schedule) in due {
            if !self.conditions_pass(&def, &schedule, now) {
                let next_run = self.advance(&def.id, now);
                tracing::info!(job_id = %def.id, next_run = ?next_run, "job fire vetoed by condition");
                continue;
            }
            match self.begin(&def, def.input_data.clone(), false, Some(now)) {
                Ok(instance) => {
                    started.push(instance.instance_id);
                    let scheduler = self.clone();
                    runtime.spawn(async move {
                        scheduler.execute(def, instance).await;
                    });
                }
                Err(e) => tracing::debug!(job_id = %def.id, error = %e, "job not fired"),
            }
        }
        if !started.is_empty() {
            tracing::debug!(count = started.len(), "tick fired jobs");
        }
        Ok(started)
    }

    /// Run a job immediately, bypassing its schedule and conditions, and
    /// wait for it to settle.
    pub async fn run_now(
        &self,
        job_id: &str,
        input_override: Option<Value>,
    ) -> Result<JobInstance, SchedulerError> {
        if self.status() == SchedulerStatus::Stopped {
            return Err(SchedulerError::Stopped);
        }
        let def = self
            .get_job(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        let input = input_override.unwrap_or_else(|| def.input_data.clone());
        let instance = self.begin(&def, input, true, None)?;
        Ok(self.execute(def, instance).await)
    }

    fn conditions_pass(&self, def: &JobDefinition, schedule: &CronSchedule, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&schedule.offset());
        let weekend = matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
        def.conditions.iter().all(|condition| match condition {
            JobCondition::BusinessDaysOnly | JobCondition::ExcludeWeekends => !weekend,
            JobCondition::Custom { name } => {
                let predicate = self.inner.conditions.get(name).map(|p| Arc::clone(p.value()));
                match predicate {
                    Some(predicate) => predicate(def, now),
                    None => {
                        tracing::warn!(job_id = %def.id, condition = %name, "unknown custom condition, vetoing fire");
                        false
                    }
                }
            }
        })
    }

    /// Move `next_run` past `now`, recording `now` as the previous fire.
    fn advance(&self, job_id: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next_run = {
            let mut state = self.inner.state.lock();
            let entry = state.jobs.get_mut(job_id)?;
            entry.info.next_run = entry.schedule.next_after(now);
            entry.info.next_run
        };
        self.publish_scheduled(job_id, next_run);
        next_run
    }

    /// Claim the job's in-flight slot and create a RUNNING instance.
    ///
    /// `fired_at` is set for cron fires and advances the schedule.
    fn begin(
        &self,
        def: &JobDefinition,
        input: Value,
        manual: bool,
        fired_at: Option<DateTime<Utc>>,
    ) -> Result<JobInstance, SchedulerError> {
        let instance = {
            let mut state = self.inner.state.lock();
            if state.in_flight.contains_key(&def.id) {
                return Err(SchedulerError::JobInFlight(def.id.clone()));
            }
            if let (Some(at), Some(entry)) = (fired_at, state.jobs.get_mut(&def.id)) {
                entry.info.previous_run = Some(at);
                entry.info.next_run = entry.schedule.next_after(at);
            }
            let mut instance = JobInstance::new(&def.id, input, manual);
            if let Some(at) = fired_at {
                instance.scheduled_at = at;
            }
            instance.status = JobStatus::Running;
            instance.started_at = Some(Utc::now());
            state.in_flight.insert(def.id.clone(), instance.clone());
            instance
        };

        tracing::info!(job_id = %def.id, instance_id = %instance.instance_id, manual, "job started");
        self.inner.event_bus.publish(
            FlowEvent::job(EventKind::JobStarted, &def.id)
                .with_instance(instance.instance_id)
                .with_payload(json!({ "manual": manual, "target": def.target })),
        );
        Ok(instance)
    }

    /// Dispatch to the job's target and settle the instance.
    async fn execute(&self, def: JobDefinition, instance: JobInstance) -> JobInstance {
        let result = match &def.target {
            JobTarget::Agent { agent_id } => self.execute_agent(&def, agent_id, &instance).await,
            JobTarget::Workflow { workflow_id } => {
                self.execute_workflow(&def, workflow_id, &instance).await
            }
        };
        self.settle(&def.id, result)
    }

    async fn execute_agent(
        &self,
        def: &JobDefinition,
        agent_id: &str,
        instance: &JobInstance,
    ) -> Result<(Value, Option<Uuid>), JobError> {
        if self.status() == SchedulerStatus::Idle {
            self.inner.queue.start();
        }

        let retry = match &def.retry {
            Some(retry) => retry.clone(),
            None => self.inner.state.lock().default_retry.clone(),
        };
        let attempt_timeout_ms = def.timeout_ms.unwrap_or(QueueConfig::default().default_timeout_ms);
        let attempts = u64::from(retry.max_retries) + 1;
        let budget_ms = attempt_timeout_ms
            .saturating_mul(attempts)
            .saturating_add(retry.max_delay_ms.saturating_mul(attempts - 1));

        let mut input = instance.input.clone();
        if let Some(action) = &def.action {
            input = match input {
                Value::Object(mut map) => {
                    map.insert("action".to_string(), json!(action));
                    Value::Object(map)
                }
                Value::Null => json!({ "action": action }),
                other => json!({ "input": other, "action": action }),
            };
        }

        let job = AgentJob {
            job_id: def.id.clone(),
            instance_id: instance.instance_id,
            agent_id: agent_id.to_string(),
            input,
            retry,
            attempt_timeout_ms,
        };
        let options = EnqueueOptions {
            timeout: Some(Duration::from_millis(budget_ms)),
            ..EnqueueOptions::default()
        };
        let (_, outcome) = self
            .inner
            .queue
            .enqueue_tracked(job, def.priority, options)
            .map_err(|e| ExecutionError::fatal(codes::JOB_FAILED, e.to_string()))?;

        match outcome.await {
            Ok(QueueOutcome::Completed(output)) => Ok((output, None)),
            Ok(QueueOutcome::Failed(error)) => Err(error),
            Ok(QueueOutcome::Expired) => Err(ExecutionError::fatal(
                codes::JOB_FAILED,
                "job expired before it started",
            )),
            Ok(QueueOutcome::Cancelled) | Err(_) => Err(ExecutionError::fatal(
                codes::QUEUE_STOPPED,
                "job was removed from the queue",
            )),
        }
    }

    async fn execute_workflow(
        &self,
        def: &JobDefinition,
        workflow_id: &str,
        instance: &JobInstance,
    ) -> Result<(Value, Option<Uuid>), JobError> {
        let Some(engine) = &self.inner.engine else {
            return Err(ExecutionError::fatal(
                codes::JOB_FAILED,
                "no workflow engine attached to the scheduler",
            ));
        };
        let options = StartOptions {
            sync: true,
            trigger: TriggerInfo::Schedule {
                job_id: def.id.clone(),
            },
            correlation_id: Some(instance.instance_id.to_string()),
            ..StartOptions::default()
        };
        let mut run = engine
            .start_workflow(workflow_id, instance.input.clone(), options)
            .await
            .map_err(|e| ExecutionError::fatal(codes::JOB_FAILED, e.to_string()))?;

        if !run.status.is_terminal() {
            run = engine
                .wait_for_completion(run.instance_id)
                .await
                .map_err(|e| ExecutionError::fatal(codes::JOB_FAILED, e.to_string()))?;
        }

        let workflow_instance_id = Some(run.instance_id);
        match run.error {
            None if run.status == WorkflowStatus::Completed => Ok((
                json!({ "instance_id": run.instance_id, "results": run.context.results }),
                workflow_instance_id,
            )),
            Some(error) => Err(ExecutionError::new(error.code, error.message, error.recoverable)
                .with_details(json!({ "workflow_instance_id": run.instance_id }))),
            None => Err(ExecutionError::fatal(
                codes::JOB_FAILED,
                format!("workflow run ended as {}", run.status),
            )
            .with_details(json!({ "workflow_instance_id": run.instance_id }))),
        }
    }

    /// Release the in-flight slot, move the instance to history and announce
    /// the outcome.
    fn settle(&self, job_id: &str, result: Result<(Value, Option<Uuid>), JobError>) -> JobInstance {
        let now = Utc::now();
        let (instance, next_run) = {
            let mut state = self.inner.state.lock();
            let mut instance = state
                .in_flight
                .remove(job_id)
                .unwrap_or_else(|| JobInstance::new(job_id, Value::Null, false));
            instance.completed_at = Some(now);
            match &result {
                Ok((output, workflow_instance_id)) => {
                    instance.status = JobStatus::Completed;
                    instance.output = Some(output.clone());
                    instance.workflow_instance_id = *workflow_instance_id;
                }
                Err(error) => {
                    instance.status = JobStatus::Failed;
                    instance.error = Some(error.clone());
                    instance.workflow_instance_id = error
                        .details
                        .as_ref()
                        .and_then(|d| d.get("workflow_instance_id"))
                        .and_then(|v| serde_json::from_value(v.clone()).ok());
                }
            }

            // A fire that outlived its next occurrence moves the schedule on.
            let next_run = state.jobs.get_mut(job_id).and_then(|entry| {
                if entry.def.enabled && entry.info.next_run.is_some_and(|at| at <= now) {
                    entry.info.next_run = entry.schedule.next_after(now);
                }
                entry.info.next_run
            });

            state.history.push_back(instance.clone());
            prune_history(&mut state.history, &self.inner.config, now);
            (instance, next_run)
        };

        let duration_ms = instance
            .started_at
            .map(|at| (now - at).num_milliseconds().max(0))
            .unwrap_or(0);
        match &instance.error {
            None => {
                tracing::info!(job_id, instance_id = %instance.instance_id, duration_ms, "job completed");
                self.inner.event_bus.publish(
                    FlowEvent::job(EventKind::JobCompleted, job_id)
                        .with_instance(instance.instance_id)
                        .with_payload(json!({ "duration_ms": duration_ms, "next_run": next_run })),
                );
            }
            Some(error) => {
                tracing::error!(job_id, instance_id = %instance.instance_id, code = %error.code, error = %error.message, "job failed");
                self.inner.event_bus.publish(
                    FlowEvent::job(EventKind::JobFailed, job_id)
                        .with_instance(instance.instance_id)
                        .with_payload(json!({ "error": error, "next_run": next_run })),
                );
            }
        }
        instance
    }

    fn publish_scheduled(&self, job_id: &str, next_run: Option<DateTime<Utc>>) {
        self.inner.event_bus.publish(
            FlowEvent::job(EventKind::JobScheduled, job_id)
                .with_payload(json!({ "next_run": next_run })),
        );
    }
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CronScheduler")
            .field("status", &state.status)
            .field("jobs", &state.jobs.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

/// Drop entries older than `history_max_age_secs`, then the oldest beyond
/// `history_limit`.
fn prune_history(history: &mut VecDeque<JobInstance>, config: &SchedulerConfig, now: DateTime<Utc>) {
    let max_age = i64::try_from(config.history_max_age_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX);
    history.retain(|i| i.completed_at.is_none_or(|at| now - at <= max_age));
    while history.len() > config.history_limit {
        history.pop_front();
    }
}

/// Queue processor for agent jobs: resolve the agent and run it under the
/// job's retry policy, each attempt raced against its timeout.
async fn run_agent_job(
    registry: Arc<dyn AgentRegistry>,
    state: Arc<Mutex<SchedulerState>>,
    bus: EventBus,
    job: AgentJob,
) -> anyhow::Result<Value> {
    let agent = registry.get_agent(&job.agent_id).ok_or_else(|| {
        ExecutionError::fatal(
            codes::AGENT_NOT_FOUND,
            format!("agent '{}' is not registered", job.agent_id),
        )
    })?;
    let caller_id = job.instance_id.to_string();
    let policy = RetryPolicy::new(job.retry.clone());

    let result = policy
        .execute(|attempt| {
            if attempt > 0 {
                if let Some(instance) = state.lock().in_flight.get_mut(&job.job_id) {
                    instance.status = JobStatus::Retrying;
                    instance.retry_count = attempt;
                }
                bus.publish(
                    FlowEvent::job(EventKind::JobRetrying, &job.job_id)
                        .with_instance(job.instance_id)
                        .with_payload(json!({ "retry_count": attempt })),
                );
            }
            let agent = Arc::clone(&agent);
            let input = job.input.clone();
            let caller_id = caller_id.clone();
            let timeout_ms = job.attempt_timeout_ms;
            async move {
                match tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    agent.execute(input, &caller_id),
                )
                .await
                {
                    Ok(result) => result.into_result().map_err(anyhow::Error::from),
                    Err(_) => Err(ExecutionError::timeout("agent job", timeout_ms).into()),
                }
            }
        })
        .await;

    if let Some(instance) = state.lock().in_flight.get_mut(&job.job_id) {
        instance.status = JobStatus::Running;
    }
    result.map_err(anyhow::Error::from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
