//! Global configuration types for Flowline.
//!
//! `FlowlineConfig` represents the top-level `flowline.toml`. Every field has
//! a default so a partial (or empty) file is valid.

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicyConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowlineConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Default retry policy for jobs without their own.
    #[serde(default)]
    pub retry: RetryPolicyConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Non-terminal instances allowed at once (default 10).
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,
    /// Agent call timeout when neither step nor workflow sets one (default 30000).
    #[serde(default = "default_timeout_ms")]
    pub default_step_timeout_ms: u64,
    /// Runner requests parked while the engine is at capacity (default 100).
    #[serde(default = "default_pending_queue_size")]
    pub pending_queue_size: usize,
}

fn default_max_concurrent_workflows() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_pending_queue_size() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            default_step_timeout_ms: default_timeout_ms(),
            pending_queue_size: default_pending_queue_size(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between due-job checks (default 60).
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Agent jobs running at once (default 5).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Finished job instances retained (default 100).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Finished job instances older than this are pruned (default 86400).
    #[serde(default = "default_history_max_age_secs")]
    pub history_max_age_secs: u64,
    /// Timezone for jobs that do not name one (default "UTC").
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_concurrency() -> usize {
    5
}

fn default_history_limit() -> usize {
    100
}

fn default_history_max_age_secs() -> u64 {
    86_400
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            concurrency: default_concurrency(),
            history_limit: default_history_limit(),
            history_max_age_secs: default_history_max_age_secs(),
            default_timezone: default_timezone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Ordering discipline of a job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    Fifo,
    /// Lower priority number first; equal priorities keep arrival order.
    #[default]
    Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Processor invocations in flight at once (default 5).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Waiting items allowed (default 1000).
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default)]
    pub mode: QueueMode,
    /// Processor timeout for items without their own (default 30000).
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicyConfig,
}

fn default_max_size() -> usize {
    1_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_size: default_max_size(),
            mode: QueueMode::default(),
            default_timeout_ms: default_timeout_ms(),
            retry: RetryPolicyConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast channel capacity (default 1024).
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}
