//! Broadcast bus carrying every `FlowEvent` the engine, the scheduler and the
//! recovery manager emit.
//!
//! Delivery is fire-and-forget: an event published with no subscriber is
//! dropped, and a subscriber that falls more than `capacity` events behind
//! loses the oldest ones. [`EventFilter`] narrows a subscription to the kinds,
//! run or job a consumer cares about.

use flowline_types::event::{EventKind, FlowEvent};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

/// Multi-consumer event bus for workflow, job and scheduler events.
///
/// Wraps a `tokio::sync::broadcast` channel. Cloning the bus clones the
/// sender, allowing multiple producers and consumers.
pub struct EventBus {
    sender: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: FlowEvent) {
        tracing::trace!(kind = %event.kind, "publishing event");
        let _ = self.sender.send(event);
    }

    /// Shorthand for publishing a bare event of `kind`.
    pub fn emit(&self, kind: EventKind) {
        self.publish(FlowEvent::new(kind));
    }

    /// Subscribe to the events accepted by `filter` only.
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

// ---------------------------------------------------------------------------
// Filtered subscriptions
// ---------------------------------------------------------------------------

/// Predicate over `FlowEvent`s. Empty criteria accept everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    kinds: Vec<EventKind>,
    instance_id: Option<Uuid>,
    job_id: Option<String>,
}

impl EventFilter {
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Only events of one workflow instance.
    pub fn for_instance(mut self, instance_id: Uuid) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    /// Only events of one scheduled job.
    pub fn for_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn matches(&self, event: &FlowEvent) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&event.kind))
            && self
                .instance_id
                .is_none_or(|id| event.instance_id == Some(id))
            && self
                .job_id
                .as_deref()
                .is_none_or(|id| event.job_id.as_deref() == Some(id))
    }
}

/// Receiver yielding only the events its [`EventFilter`] accepts.
///
/// Lag is logged and skipped rather than surfaced to the caller.
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<FlowEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Next matching event, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<FlowEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
