//! Bounded-concurrency job queue with priority ordering and retry.
//!
//! `JobQueue<T, R>` owns waiting items of payload `T` and drains them into a
//! single registered processor `T -> anyhow::Result<R>`, never running more
//! than `concurrency` invocations at once. Failures are classified into
//! `ExecutionError`s and re-inserted after a backoff delay while the
//! `RetryPolicy` allows it.
//!
//! A retry keeps its slot while it waits out its backoff, so waiting plus
//! parked items never exceed `max_size`. A retry whose delay elapses while
//! the queue is stopped lands back in the queue and waits for `start()`.
//! A panicking processor fails its item like any other error.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowline_types::config::{QueueConfig, QueueMode};
use flowline_types::error::{ExecutionError, JobError, codes};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::retry::{RetryPolicy, classify_error};

/// Processor invoked for every dispatched item.
pub type Processor<T, R> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue already holds `max_size` waiting items.
    #[error("queue is full (max size {max_size})")]
    Full { max_size: usize },
}

// ---------------------------------------------------------------------------
// Items, options, outcomes
// ---------------------------------------------------------------------------

/// A waiting unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem<T> {
    pub id: Uuid,
    pub payload: T,
    /// Lower numbers run first in priority mode.
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Processor timeout overriding the queue default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl<T> QueueItem<T> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Per-item options for [`JobQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Drop the item if it has not started within this window.
    pub expires_in: Option<Duration>,
    /// Processor timeout for this item.
    pub timeout: Option<Duration>,
    pub metadata: HashMap<String, Value>,
}

/// Terminal outcome delivered to [`JobQueue::enqueue_tracked`] callers.
#[derive(Debug)]
pub enum QueueOutcome<R> {
    Completed(R),
    Failed(JobError),
    Expired,
    Cancelled,
}

/// Notification broadcast by the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued { id: Uuid, priority: u8 },
    Started { id: Uuid, attempt: u32 },
    Completed { id: Uuid, duration_ms: u64 },
    Failed { id: Uuid, error: JobError },
    Retrying { id: Uuid, retry_count: u32, delay_ms: u64 },
    Expired { id: Uuid },
}

/// Counters since creation (or the last `clear`, which does not reset them).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub expired: u64,
    pub size: usize,
    /// Retries waiting out their backoff.
    pub parked: usize,
    pub in_flight: usize,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct QueueState<T> {
    items: VecDeque<QueueItem<T>>,
    /// Retries holding a slot while their delay runs.
    parked: usize,
    in_flight: usize,
    running: bool,
    paused: bool,
    stats: QueueStats,
}

impl<T> QueueState<T> {
    fn occupied(&self) -> usize {
        self.items.len() + self.parked
    }
}

struct Shared<T, R> {
    config: QueueConfig,
    policy: RetryPolicy,
    processor: Processor<T, R>,
    state: Mutex<QueueState<T>>,
    waiters: DashMap<Uuid, oneshot::Sender<QueueOutcome<R>>>,
    events: broadcast::Sender<QueueEvent>,
}

impl<T, R> Shared<T, R> {
    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn resolve(&self, id: Uuid, outcome: QueueOutcome<R>) {
        if let Some((_, tx)) = self.waiters.remove(&id) {
            let _ = tx.send(outcome);
        }
    }

    fn insert(&self, state: &mut QueueState<T>, item: QueueItem<T>) {
        match self.config.mode {
            QueueMode::Fifo => state.items.push_back(item),
            QueueMode::Priority => {
                let pos = state
                    .items
                    .iter()
                    .position(|existing| existing.priority > item.priority)
                    .unwrap_or(state.items.len());
                state.items.insert(pos, item);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

pub struct JobQueue<T, R> {
    shared: Arc<Shared<T, R>>,
}

impl<T, R> Clone for JobQueue<T, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, R> JobQueue<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    /// Create a stopped queue around `processor`.
    pub fn new<F, Fut>(config: QueueConfig, processor: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let processor: Processor<T, R> = Arc::new(move |payload| Box::pin(processor(payload)));
        let (events, _) = broadcast::channel(256);
        let policy = RetryPolicy::new(config.retry.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                policy,
                processor,
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    parked: 0,
                    in_flight: 0,
                    running: false,
                    paused: false,
                    stats: QueueStats::default(),
                }),
                waiters: DashMap::new(),
                events,
            }),
        }
    }

    /// Add an item. Errors when `max_size` items are already waiting or
    /// parked for retry.
    pub fn enqueue(
        &self,
        payload: T,
        priority: u8,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        let id = self.insert_new(payload, priority, options, None)?;
        self.drain();
        Ok(id)
    }

    /// Like [`enqueue`](Self::enqueue), also returning a receiver resolved
    /// with the item's terminal outcome.
    pub fn enqueue_tracked(
        &self,
        payload: T,
        priority: u8,
        options: EnqueueOptions,
    ) -> Result<(Uuid, oneshot::Receiver<QueueOutcome<R>>), QueueError> {
        let (tx, rx) = oneshot::channel();
        let id = self.insert_new(payload, priority, options, Some(tx))?;
        self.drain();
        Ok((id, rx))
    }

    fn insert_new(
        &self,
        payload: T,
        priority: u8,
        options: EnqueueOptions,
        waiter: Option<oneshot::Sender<QueueOutcome<R>>>,
    ) -> Result<Uuid, QueueError> {
        let now = Utc::now();
        let item = QueueItem {
            id: Uuid::now_v7(),
            payload,
            priority,
            created_at: now,
            expires_at: options
                .expires_in
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| now + d),
            retry_count: 0,
            last_attempt_at: None,
            timeout_ms: options.timeout.map(|d| d.as_millis() as u64),
            metadata: options.metadata,
        };
        let id = item.id;

        {
            let mut state = self.shared.state.lock();
            if state.occupied() >= self.shared.config.max_size {
                return Err(QueueError::Full {
                    max_size: self.shared.config.max_size,
                });
            }
            if let Some(tx) = waiter {
                self.shared.waiters.insert(id, tx);
            }
            self.shared.insert(&mut state, item);
            state.stats.enqueued += 1;
        }

        tracing::debug!(item_id = %id, priority, "item enqueued");
        self.shared.emit(QueueEvent::Enqueued { id, priority });
        Ok(id)
    }

    /// Remove a not-yet-started item. Returns false if it is unknown or
    /// already running.
    pub fn dequeue(&self, id: Uuid) -> bool {
        let removed = {
            let mut state = self.shared.state.lock();
            match state.items.iter().position(|i| i.id == id) {
                Some(pos) => state.items.remove(pos).is_some(),
                None => false,
            }
        };
        if removed {
            self.shared.resolve(id, QueueOutcome::Cancelled);
        }
        removed
    }

    /// Begin draining. Idempotent.
    pub fn start(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.running {
                return;
            }
            state.running = true;
        }
        tracing::info!("job queue started");
        self.drain();
    }

    /// Halt draining. In-flight items finish; pending retries keep their
    /// remaining delay and wait in the queue for the next `start()`.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if !state.running {
            return;
        }
        state.running = false;
        tracing::info!(
            waiting = state.items.len(),
            parked = state.parked,
            "job queue stopped"
        );
    }

    /// Keep the queue alive but withhold dispatch.
    pub fn pause(&self) {
        self.shared.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.shared.state.lock().paused = false;
        self.drain();
    }

    /// Drop every waiting item, resolving tracked ones as cancelled.
    pub fn clear(&self) {
        let drained: Vec<Uuid> = {
            let mut state = self.shared.state.lock();
            state.items.drain(..).map(|i| i.id).collect()
        };
        for id in drained {
            self.shared.resolve(id, QueueOutcome::Cancelled);
        }
    }

    pub fn size(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    /// Snapshot of waiting items in dispatch order.
    pub fn items(&self) -> Vec<QueueItem<T>> {
        self.shared.state.lock().items.iter().cloned().collect()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        QueueStats {
            size: state.items.len(),
            parked: state.parked,
            in_flight: state.in_flight,
            ..state.stats.clone()
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Drain loop
    // -----------------------------------------------------------------------

    fn drain(&self) {
        drain(&self.shared);
    }
}

/// Dispatch as many items as the concurrency bound allows.
fn drain<T, R>(shared: &Arc<Shared<T, R>>)
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("job queue drain requested outside a tokio runtime");
        return;
    };

    let now = Utc::now();
    let mut expired = Vec::new();
    let mut dispatch = Vec::new();
    {
        let mut state = shared.state.lock();
        while state.running
            && !state.paused
            && state.in_flight < shared.config.concurrency
            && !state.items.is_empty()
        {
            let Some(item) = state.items.pop_front() else {
                break;
            };
            if item.is_expired(now) {
                state.stats.expired += 1;
                expired.push(item.id);
                continue;
            }
            state.in_flight += 1;
            dispatch.push(item);
        }
    }

    for id in expired {
        tracing::debug!(item_id = %id, "queue item expired before dispatch");
        shared.emit(QueueEvent::Expired { id });
        shared.resolve(id, QueueOutcome::Expired);
    }

    for item in dispatch {
        runtime.spawn(run_item(Arc::clone(shared), item));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "processor panicked".to_string())
}

async fn run_item<T, R>(shared: Arc<Shared<T, R>>, mut item: QueueItem<T>)
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    let id = item.id;
    shared.emit(QueueEvent::Started {
        id,
        attempt: item.retry_count + 1,
    });

    let timeout_ms = item.timeout_ms.unwrap_or(shared.config.default_timeout_ms);
    let started = Instant::now();
    let payload = item.payload.clone();
    let processor = Arc::clone(&shared.processor);
    let call = AssertUnwindSafe(async move { processor(payload).await }).catch_unwind();
    let result = tokio::time::timeout(Duration::from_millis(timeout_ms), call).await;

    let error = match result {
        Ok(Ok(Ok(value))) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            shared.state.lock().stats.completed += 1;
            tracing::debug!(item_id = %id, duration_ms, "queue item completed");
            shared.emit(QueueEvent::Completed { id, duration_ms });
            shared.resolve(id, QueueOutcome::Completed(value));
            None
        }
        Ok(Ok(Err(err))) => Some(classify_error(&err, codes::PROCESSOR_ERROR)),
        Ok(Err(cause)) => {
            let message = panic_message(cause.as_ref());
            tracing::error!(item_id = %id, panic = %message, "queue processor panicked");
            Some(ExecutionError::fatal(
                codes::PROCESSOR_ERROR,
                format!("processor panicked: {message}"),
            ))
        }
        Err(_) => Some(ExecutionError::timeout("queue item", timeout_ms)),
    };

    if let Some(error) = error {
        let retryable = shared.policy.should_retry(&error, item.retry_count);
        let parked = retryable && {
            let mut state = shared.state.lock();
            let has_room = state.occupied() < shared.config.max_size;
            if has_room {
                state.parked += 1;
                state.stats.retried += 1;
            }
            has_room
        };

        if parked {
            let delay = shared.policy.get_delay(item.retry_count);
            item.retry_count += 1;
            item.last_attempt_at = Some(Utc::now());
            tracing::warn!(
                item_id = %id,
                retry_count = item.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "queue item failed, scheduling retry"
            );
            shared.emit(QueueEvent::Retrying {
                id,
                retry_count: item.retry_count,
                delay_ms: delay.as_millis() as u64,
            });

            let retry_shared = Arc::clone(&shared);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                {
                    let mut state = retry_shared.state.lock();
                    state.parked -= 1;
                    retry_shared.insert(&mut state, item);
                }
                drain(&retry_shared);
            });
        } else {
            let error = if retryable {
                ExecutionError::fatal(
                    codes::QUEUE_FULL,
                    format!("no room to retry after: {}", error.message),
                )
            } else {
                error
            };
            shared.state.lock().stats.failed += 1;
            tracing::error!(item_id = %id, error = %error, "queue item failed");
            shared.emit(QueueEvent::Failed {
                id,
                error: error.clone(),
            });
            shared.resolve(id, QueueOutcome::Failed(error));
        }
    }

    shared.state.lock().in_flight -= 1;
    drain(&shared);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::retry::RetryPolicyConfig;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn config(concurrency: usize, max_size: usize, mode: QueueMode) -> QueueConfig {
        QueueConfig {
            concurrency,
            max_size,
            mode,
            default_timeout_ms: 1_000,
            retry: RetryPolicyConfig {
                max_retries: 2,
                initial_delay_ms: 10,
                exponential_backoff: false,
                ..RetryPolicyConfig::default()
            },
        }
    }

    fn echo_queue(cfg: QueueConfig) -> JobQueue<u32, u32> {
        JobQueue::new(cfg, |n: u32| async move { Ok(n) })
    }

    fn flaky_first_call(calls: Arc<AtomicU32>, cfg: QueueConfig) -> JobQueue<u32, u32> {
        JobQueue::new(cfg, move |n| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("network unreachable");
                }
                Ok(n)
            }
        })
    }

    fn slow_retry_config(max_size: usize) -> QueueConfig {
        QueueConfig {
            retry: RetryPolicyConfig {
                max_retries: 3,
                initial_delay_ms: 1_000,
                exponential_backoff: false,
                ..RetryPolicyConfig::default()
            },
            ..config(1, max_size, QueueMode::Fifo)
        }
    }

    #[tokio::test]
    async fn enqueue_beyond_max_size_errors_and_keeps_size() {
        let queue = echo_queue(config(1, 10, QueueMode::Fifo));
        for n in 0..10 {
            queue.enqueue(n, 5, EnqueueOptions::default()).unwrap();
        }
        let err = queue.enqueue(10, 5, EnqueueOptions::default()).unwrap_err();
        assert!(matches!(err, QueueError::Full { max_size: 10 }));
        assert_eq!(queue.size(), 10);
    }

    #[tokio::test]
    async fn priority_mode_orders_stably() {
        let queue = echo_queue(config(1, 100, QueueMode::Priority));
        let a = queue.enqueue(1, 5, EnqueueOptions::default()).unwrap();
        let b = queue.enqueue(2, 1, EnqueueOptions::default()).unwrap();
        let c = queue.enqueue(3, 5, EnqueueOptions::default()).unwrap();
        let d = queue.enqueue(4, 1, EnqueueOptions::default()).unwrap();
        let e = queue.enqueue(5, 9, EnqueueOptions::default()).unwrap();

        let order: Vec<Uuid> = queue.items().iter().map(|i| i.id).collect();
        assert_eq!(order, vec![b, d, a, c, e]);
        let priorities: Vec<u8> = queue.items().iter().map(|i| i.priority).collect();
        assert!(priorities.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn fifo_mode_keeps_arrival_order() {
        let queue = echo_queue(config(1, 100, QueueMode::Fifo));
        queue.enqueue(1, 9, EnqueueOptions::default()).unwrap();
        queue.enqueue(2, 1, EnqueueOptions::default()).unwrap();
        let payloads: Vec<u32> = queue.items().iter().map(|i| i.payload).collect();
        assert_eq!(payloads, vec![1, 2]);
    }

    #[tokio::test]
    async fn tracked_item_completes() {
        let queue = echo_queue(config(2, 10, QueueMode::Priority));
        queue.start();
        let (_, rx) = queue
            .enqueue_tracked(7, 5, EnqueueOptions::default())
            .unwrap();
        match rx.await.unwrap() {
            QueueOutcome::Completed(v) => assert_eq!(v, 7),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(queue.stats().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_concurrency() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (c, p) = (current.clone(), peak.clone());
        let queue: JobQueue<u32, ()> = JobQueue::new(config(3, 100, QueueMode::Fifo), move |_n| {
            let (c, p) = (c.clone(), p.clone());
            async move {
                let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                c.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let mut receivers = Vec::new();
        for n in 0..12 {
            let (_, rx) = queue
                .enqueue_tracked(n, 5, EnqueueOptions::default())
                .unwrap();
            receivers.push(rx);
        }
        queue.start();
        assert!(queue.in_flight() <= 3);
        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), QueueOutcome::Completed(())));
        }
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let queue: JobQueue<u32, u32> = JobQueue::new(config(1, 10, QueueMode::Fifo), move |n| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("connection reset");
                }
                Ok(n)
            }
        });
        queue.start();
        let (_, rx) = queue.enqueue_tracked(3, 5, EnqueueOptions::default()).unwrap();
        assert!(matches!(rx.await.unwrap(), QueueOutcome::Completed(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.stats().retried, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn typed_fatal_error_is_not_retried() {
        let queue: JobQueue<u32, u32> = JobQueue::new(config(1, 10, QueueMode::Fifo), |_n| async {
            Err(anyhow::Error::new(ExecutionError::fatal("VALIDATION", "timeout field missing")))
        });
        queue.start();
        let (_, rx) = queue.enqueue_tracked(1, 5, EnqueueOptions::default()).unwrap();
        match rx.await.unwrap() {
            QueueOutcome::Failed(err) => {
                assert_eq!(err.code, "VALIDATION");
                assert!(!err.recoverable);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn processor_timeout_synthesizes_timeout_error() {
        let queue: JobQueue<u32, u32> = JobQueue::new(
            QueueConfig {
                retry: RetryPolicyConfig::none(),
                ..config(1, 10, QueueMode::Fifo)
            },
            |_n| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(0)
            },
        );
        queue.start();
        let (_, rx) = queue
            .enqueue_tracked(
                1,
                5,
                EnqueueOptions {
                    timeout: Some(Duration::from_millis(100)),
                    ..EnqueueOptions::default()
                },
            )
            .unwrap();
        match rx.await.unwrap() {
            QueueOutcome::Failed(err) => assert_eq!(err.code, codes::TIMEOUT),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_item_is_purged_not_run() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let queue: JobQueue<u32, u32> = JobQueue::new(config(1, 10, QueueMode::Fifo), move |n| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n) }
        });
        let (_, rx) = queue
            .enqueue_tracked(
                1,
                5,
                EnqueueOptions {
                    expires_in: Some(Duration::from_millis(0)),
                    ..EnqueueOptions::default()
                },
            )
            .unwrap();
        queue.start();
        assert!(matches!(rx.await.unwrap(), QueueOutcome::Expired));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().expired, 1);
    }

    #[tokio::test]
    async fn pause_withholds_dispatch_and_dequeue_cancels() {
        let queue = echo_queue(config(1, 10, QueueMode::Fifo));
        queue.start();
        queue.pause();
        assert!(queue.is_paused());
        let (id, rx) = queue.enqueue_tracked(1, 5, EnqueueOptions::default()).unwrap();
        assert_eq!(queue.size(), 1);
        assert!(queue.dequeue(id));
        assert!(matches!(rx.await.unwrap(), QueueOutcome::Cancelled));
        assert_eq!(queue.size(), 0);

        let (_, rx) = queue.enqueue_tracked(2, 5, EnqueueOptions::default()).unwrap();
        queue.resume();
        assert!(matches!(rx.await.unwrap(), QueueOutcome::Completed(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_stop_is_parked_until_restart() {
        let calls = Arc::new(AtomicU32::new(0));
        let queue = flaky_first_call(calls.clone(), slow_retry_config(10));
        let mut events = queue.subscribe();
        queue.start();
        let (_, rx) = queue.enqueue_tracked(9, 5, EnqueueOptions::default()).unwrap();

        loop {
            if let QueueEvent::Retrying { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        queue.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(queue.size(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        queue.start();
        assert!(matches!(rx.await.unwrap(), QueueOutcome::Completed(9)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn parked_retry_holds_its_slot() {
        let calls = Arc::new(AtomicU32::new(0));
        let queue = flaky_first_call(calls.clone(), slow_retry_config(1));
        let mut events = queue.subscribe();
        queue.start();
        let (_, rx) = queue.enqueue_tracked(1, 5, EnqueueOptions::default()).unwrap();

        loop {
            if let QueueEvent::Retrying { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert_eq!(queue.stats().parked, 1);
        assert!(matches!(
            queue.enqueue(2, 5, EnqueueOptions::default()),
            Err(QueueError::Full { max_size: 1 })
        ));

        assert!(matches!(rx.await.unwrap(), QueueOutcome::Completed(1)));
        assert_eq!(queue.stats().parked, 0);
        assert!(queue.size() <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_without_room_fails_as_queue_full() {
        let queue: JobQueue<u32, u32> = JobQueue::new(slow_retry_config(1), |n| async move {
            if n == 1 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                anyhow::bail!("connection refused");
            }
            Ok(n)
        });
        queue.start();
        let (_, first) = queue.enqueue_tracked(1, 5, EnqueueOptions::default()).unwrap();
        let (_, second) = queue.enqueue_tracked(2, 5, EnqueueOptions::default()).unwrap();

        match first.await.unwrap() {
            QueueOutcome::Failed(err) => {
                assert_eq!(err.code, codes::QUEUE_FULL);
                assert!(!err.recoverable);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(second.await.unwrap(), QueueOutcome::Completed(2)));
        assert_eq!(queue.stats().retried, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_keeps_remaining_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let queue = flaky_first_call(calls.clone(), slow_retry_config(10));
        let mut events = queue.subscribe();
        queue.start();
        let (_, rx) = queue.enqueue_tracked(4, 5, EnqueueOptions::default()).unwrap();

        loop {
            if let QueueEvent::Retrying { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        queue.stop();
        queue.start();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().parked, 1);

        assert!(matches!(rx.await.unwrap(), QueueOutcome::Completed(4)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_processor_fails_item_and_frees_slot() {
        let queue: JobQueue<u32, u32> = JobQueue::new(config(1, 10, QueueMode::Fifo), |n| async move {
            if n == 0 {
                panic!("boom");
            }
            Ok(n)
        });
        queue.start();

        let (_, rx) = queue.enqueue_tracked(0, 5, EnqueueOptions::default()).unwrap();
        match rx.await.unwrap() {
            QueueOutcome::Failed(err) => {
                assert_eq!(err.code, codes::PROCESSOR_ERROR);
                assert!(err.message.contains("boom"));
                assert!(!err.recoverable);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let (_, rx) = queue.enqueue_tracked(1, 5, EnqueueOptions::default()).unwrap();
        assert!(matches!(rx.await.unwrap(), QueueOutcome::Completed(1)));
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn clear_cancels_waiting_items() {
        let queue = echo_queue(config(1, 10, QueueMode::Fifo));
        let (_, rx) = queue.enqueue_tracked(1, 5, EnqueueOptions::default()).unwrap();
        queue.clear();
        assert_eq!(queue.size(), 0);
        assert!(matches!(rx.await.unwrap(), QueueOutcome::Cancelled));
        assert!(!queue.is_running());
    }
}
