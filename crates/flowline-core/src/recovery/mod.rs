//! Error classification and recovery decisions for failed steps.
//!
//! `ErrorRecoveryManager` maps a `StepError` to an [`ErrorCategory`] through an
//! ordered [`ErrorPattern`] table and decides a [`RecoveryAction`] for the
//! step that produced it. Per-step handlers registered by callers take
//! precedence over the table.

pub mod circuit_breaker;
pub mod patterns;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use patterns::{ErrorCategory, ErrorPattern, RecoveryAction, default_patterns};

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use flowline_types::error::StepError;
use flowline_types::event::{EventKind, FlowEvent};
use flowline_types::workflow::{ErrorStrategy, StepDefinition, WorkflowInstance};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::event::EventBus;

/// Retry ceiling applied to pattern-recommended retries when the step has no
/// `RetryConfig` of its own.
const DEFAULT_RETRY_CEILING: u32 = 3;

/// Caller-supplied decision for one step. An `Err` falls back to the table.
pub type RecoveryHandler = Arc<
    dyn Fn(&StepError, &StepDefinition, &WorkflowInstance) -> Result<RecoveryAction, String>
        + Send
        + Sync,
>;

/// Counters maintained by [`ErrorRecoveryManager::execute_recovery_action`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub escalations: u64,
    pub by_category: HashMap<ErrorCategory, u64>,
}

pub struct ErrorRecoveryManager {
    patterns: RwLock<Vec<ErrorPattern>>,
    handlers: DashMap<String, RecoveryHandler>,
    stats: Mutex<RecoveryStats>,
    event_bus: EventBus,
}

impl ErrorRecoveryManager {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            patterns: RwLock::new(default_patterns()),
            handlers: DashMap::new(),
            stats: Mutex::new(RecoveryStats::default()),
            event_bus,
        }
    }

    /// Insert `pattern` ahead of every existing one.
    pub fn add_pattern(&self, pattern: ErrorPattern) {
        self.patterns.write().insert(0, pattern);
    }

    /// Register a handler that decides recovery for `step_id`.
    pub fn register_handler<F>(&self, step_id: impl Into<String>, handler: F)
    where
        F: Fn(&StepError, &StepDefinition, &WorkflowInstance) -> Result<RecoveryAction, String>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(step_id.into(), Arc::new(handler));
    }

    pub fn remove_handler(&self, step_id: &str) -> bool {
        self.handlers.remove(step_id).is_some()
    }

    /// Category of the first matching pattern, or `Unknown`.
    pub fn classify(&self, error: &StepError) -> ErrorCategory {
        self.first_match(error)
            .map(|(category, _)| category)
            .unwrap_or(ErrorCategory::Unknown)
    }

    fn first_match(&self, error: &StepError) -> Option<(ErrorCategory, RecoveryAction)> {
        self.patterns
            .read()
            .iter()
            .find(|p| p.matches(error))
            .map(|p| (p.category, p.default_action))
    }

    /// Decide how to recover from `error` raised by `step`.
    ///
    /// The attempt count is the `retry_count` of the step's latest result in
    /// `instance`.
    pub fn determine_recovery_action(
        &self,
        error: &StepError,
        step: &StepDefinition,
        instance: &WorkflowInstance,
    ) -> RecoveryAction {
        let handler = self.handlers.get(&step.id).map(|h| Arc::clone(h.value()));
        if let Some(handler) = handler {
            match handler(error, step, instance) {
                Ok(action) => return action,
                Err(e) => {
                    tracing::warn!(
                        step_id = %step.id,
                        error = %e,
                        "custom recovery handler failed, using pattern table"
                    );
                }
            }
        }

        let attempts = instance
            .step_results
            .get(&step.id)
            .map(|r| r.retry_count)
            .unwrap_or(0);

        if let Some(retry) = &step.retry {
            if error.recoverable && attempts < retry.max_retries {
                return RecoveryAction::Retry {
                    delay: retry.delay_for(attempts),
                };
            }
        }

        let Some((category, action)) = self.first_match(error) else {
            return self.get_fallback_action(ErrorCategory::Unknown, step);
        };
        match action {
            RecoveryAction::Retry { .. } => {
                let ceiling = step
                    .retry
                    .as_ref()
                    .map(|r| r.max_retries)
                    .unwrap_or(DEFAULT_RETRY_CEILING);
                if attempts < ceiling {
                    action
                } else {
                    self.get_fallback_action(category, step)
                }
            }
            other => other,
        }
    }

    /// Last-resort decision once retrying is off the table.
    ///
    /// Required steps escalate whatever the category; optional steps are
    /// skipped.
    pub fn get_fallback_action(&self, category: ErrorCategory, step: &StepDefinition) -> RecoveryAction {
        let action = if step.required {
            RecoveryAction::Escalate
        } else {
            RecoveryAction::Skip
        };
        tracing::debug!(step_id = %step.id, category = %category, action = action.as_str(), "fallback recovery");
        action
    }

    /// Map a workflow's error strategy to the action taken once a step has
    /// finally failed.
    pub fn get_action_from_strategy(&self, strategy: ErrorStrategy) -> RecoveryAction {
        match strategy {
            ErrorStrategy::Stop | ErrorStrategy::Retry => RecoveryAction::Abort,
            ErrorStrategy::Skip => RecoveryAction::Skip,
            ErrorStrategy::Fallback => RecoveryAction::Fallback,
        }
    }

    /// Record that `action` is being taken and publish the matching
    /// `recovery:*` event.
    pub fn execute_recovery_action(
        &self,
        action: RecoveryAction,
        error: &StepError,
        step: &StepDefinition,
        instance: &WorkflowInstance,
    ) {
        let category = self.classify(error);
        {
            let mut stats = self.stats.lock();
            stats.attempts += 1;
            *stats.by_category.entry(category).or_default() += 1;
            match action {
                RecoveryAction::Retry { .. } | RecoveryAction::Skip | RecoveryAction::Fallback => {
                    stats.successes += 1
                }
                RecoveryAction::Abort => stats.failures += 1,
                RecoveryAction::Escalate => stats.escalations += 1,
            }
        }

        let kind = match action {
            RecoveryAction::Retry { .. } => EventKind::RecoveryRetry,
            RecoveryAction::Skip => EventKind::RecoverySkip,
            RecoveryAction::Escalate => EventKind::RecoveryEscalate,
            RecoveryAction::Fallback => EventKind::RecoveryFallback,
            RecoveryAction::Abort => EventKind::RecoveryAbort,
        };
        let delay_ms = match action {
            RecoveryAction::Retry { delay } => Some(delay.as_millis() as u64),
            _ => None,
        };

        if matches!(action, RecoveryAction::Escalate | RecoveryAction::Abort) {
            tracing::warn!(
                instance_id = %instance.instance_id,
                step_id = %step.id,
                category = %category,
                action = action.as_str(),
                code = %error.code,
                "step failure not recovered"
            );
        } else {
            tracing::debug!(
                instance_id = %instance.instance_id,
                step_id = %step.id,
                category = %category,
                action = action.as_str(),
                "recovery action selected"
            );
        }

        self.event_bus.publish(
            FlowEvent::workflow(kind, &instance.workflow_id, instance.instance_id)
                .with_step(&step.id)
                .with_payload(serde_json::json!({
                    "category": category,
                    "action": action.as_str(),
                    "delay_ms": delay_ms,
                    "error": error,
                })),
        );
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = RecoveryStats::default();
    }
}

impl std::fmt::Debug for ErrorRecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRecoveryManager")
            .field("patterns", &self.patterns.read().len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
