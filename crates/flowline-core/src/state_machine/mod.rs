//! Generic finite-state machine with guards, actions and transition history.
//!
//! A `StateMachine<S, E, C>` holds its current state `S`, a context payload
//! `C`, and a shared set of transition rules keyed by event `E`. Rules are
//! evaluated in declaration order; the first rule whose `from` set contains
//! the current state, whose event matches and whose guard passes, fires.
//!
//! The two configurations the engine uses live in [`machines`].

pub mod machines;

pub use machines::{StepEvent, WorkflowEvent, step_machine, workflow_machine};

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Guard evaluated against the context before a rule may fire.
pub type Guard<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;

/// Side effect run after the state has moved.
pub type Action<C> = Arc<dyn Fn(&mut C) -> Result<(), String> + Send + Sync>;

/// Trait alias for types usable as states and events.
pub trait MachineValue: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> MachineValue for T {}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    /// `set_state` targeted a state no rule can ever reach.
    #[error("state {0} is not reachable from the declared transitions")]
    UnreachableState(String),
}

// ---------------------------------------------------------------------------
// Rules and configuration
// ---------------------------------------------------------------------------

/// One transition rule.
pub struct TransitionRule<S, E, C> {
    pub from: Vec<S>,
    pub to: S,
    pub event: E,
    pub guard: Option<Guard<C>>,
    pub action: Option<Action<C>>,
}

impl<S: MachineValue, E: MachineValue, C> TransitionRule<S, E, C> {
    pub fn new(from: impl Into<Vec<S>>, event: E, to: S) -> Self {
        Self {
            from: from.into(),
            to,
            event,
            guard: None,
            action: None,
        }
    }

    pub fn with_guard(mut self, guard: impl Fn(&C) -> bool + Send + Sync + 'static) -> Self {
        self.guard = Some(Arc::new(guard));
        self
    }

    pub fn with_action(
        mut self,
        action: impl Fn(&mut C) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.action = Some(Arc::new(action));
        self
    }

    fn matches(&self, current: S, event: E, context: &C) -> bool {
        self.event == event
            && self.from.contains(&current)
            && self.guard.as_ref().is_none_or(|g| g(context))
    }
}

/// Immutable description of a machine, shareable between instances.
pub struct StateMachineConfig<S, E, C> {
    pub initial: S,
    pub rules: Vec<TransitionRule<S, E, C>>,
    pub final_states: Vec<S>,
}

// ---------------------------------------------------------------------------
// Notifications and history
// ---------------------------------------------------------------------------

/// Entry in a machine's transition history.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRecord<S, E> {
    pub from: S,
    pub to: S,
    /// `None` for administrative `set_state` overrides.
    pub event: Option<E>,
    pub at: DateTime<Utc>,
}

/// Broadcast to subscribers of a machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineNotice<S, E> {
    Transitioned { from: S, to: S, event: E },
    Terminal { state: S },
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

pub struct StateMachine<S, E, C> {
    config: Arc<StateMachineConfig<S, E, C>>,
    current: S,
    previous: Option<S>,
    entered_at: DateTime<Utc>,
    history: Vec<TransitionRecord<S, E>>,
    context: C,
    notifier: broadcast::Sender<MachineNotice<S, E>>,
}

impl<S: MachineValue, E: MachineValue, C> StateMachine<S, E, C> {
    pub fn new(config: Arc<StateMachineConfig<S, E, C>>, context: C) -> Self {
        let (notifier, _) = broadcast::channel(64);
        Self {
            current: config.initial,
            config,
            previous: None,
            entered_at: Utc::now(),
            history: Vec::new(),
            context,
            notifier,
        }
    }

    /// Fire `event`. Returns false (and changes nothing) when no rule matches
    /// or the matching rule's guard rejects.
    pub fn transition(&mut self, event: E) -> bool {
        let Some(rule) = self
            .config
            .rules
            .iter()
            .find(|r| r.matches(self.current, event, &self.context))
        else {
            return false;
        };

        let from = self.current;
        let to = rule.to;
        let action = rule.action.clone();
        self.move_to(to, Some(event));

        if let Some(action) = action {
            if let Err(e) = action(&mut self.context) {
                tracing::warn!(?from, ?to, ?event, error = %e, "state machine action failed");
            }
        }

        let _ = self
            .notifier
            .send(MachineNotice::Transitioned { from, to, event });
        if self.is_final() {
            let _ = self.notifier.send(MachineNotice::Terminal { state: to });
        }
        true
    }

    /// Whether `event` would fire from the current state.
    pub fn can_transition(&self, event: E) -> bool {
        self.config
            .rules
            .iter()
            .any(|r| r.matches(self.current, event, &self.context))
    }

    /// Events that would fire from the current state, in rule order.
    pub fn available_events(&self) -> Vec<E> {
        let mut events = Vec::new();
        for rule in &self.config.rules {
            if rule.matches(self.current, rule.event, &self.context) && !events.contains(&rule.event)
            {
                events.push(rule.event);
            }
        }
        events
    }

    /// Administrative override of the current state.
    ///
    /// Rejects states that are neither the initial state nor the target of
    /// any rule.
    pub fn set_state(&mut self, state: S) -> Result<(), StateMachineError> {
        let reachable =
            state == self.config.initial || self.config.rules.iter().any(|r| r.to == state);
        if !reachable {
            return Err(StateMachineError::UnreachableState(format!("{state:?}")));
        }
        self.move_to(state, None);
        Ok(())
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn previous(&self) -> Option<S> {
        self.previous
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn history(&self) -> &[TransitionRecord<S, E>] {
        &self.history
    }

    pub fn is_final(&self) -> bool {
        self.config.final_states.contains(&self.current)
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MachineNotice<S, E>> {
        self.notifier.subscribe()
    }

    fn move_to(&mut self, to: S, event: Option<E>) {
        let now = Utc::now();
        self.history.push(TransitionRecord {
            from: self.current,
            to,
            event,
            at: now,
        });
        self.previous = Some(self.current);
        self.current = to;
        self.entered_at = now;
    }
}

impl<S: Debug, E, C> Debug for StateMachine<S, E, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current)
            .field("previous", &self.previous)
            .field("history_len", &self.history.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
