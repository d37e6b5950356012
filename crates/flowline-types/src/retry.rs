//! Retry configuration shared by the job queue, the scheduler and the
//! workflow engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RetryPolicyConfig
// ---------------------------------------------------------------------------

/// Configuration for a `RetryPolicy` (queue items and scheduled jobs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Maximum number of retries after the first attempt (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds (default 1000).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any computed delay in milliseconds (default 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Grow the delay geometrically (default true).
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
    /// Growth factor per retry (default 2.0).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// When set, only error codes matching one of these entries are retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_list: Option<Vec<String>>,
    /// Error codes matching one of these entries are never retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny_list: Option<Vec<String>>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_backoff: true,
            backoff_multiplier: default_backoff_multiplier(),
            allow_list: None,
            deny_list: None,
        }
    }
}

impl RetryPolicyConfig {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// RetryConfig (per step)
// ---------------------------------------------------------------------------

/// Retry configuration attached to a single workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay between attempts in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub retry_delay_ms: u64,
    /// Multiply the delay by `backoff_multiplier` per attempt.
    #[serde(default)]
    pub exponential_backoff: bool,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Cap for the computed delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

impl RetryConfig {
    pub fn new(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            max_retries,
            retry_delay_ms,
            exponential_backoff: false,
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: None,
        }
    }

    /// Delay before retry number `retry_count` (0-based), without jitter.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base = self.retry_delay_ms as f64;
        let ms = if self.exponential_backoff {
            base * self.backoff_multiplier.powi(retry_count as i32)
        } else {
            base
        };
        let ms = match self.max_delay_ms {
            Some(max) => ms.min(max as f64),
            None => ms,
        };
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let config = RetryPolicyConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay_ms, 1_000);
        assert_eq!(config.max_delay_ms, 30_000);
        assert!(config.exponential_backoff);
        assert!((config.backoff_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retry_policy_partial_deserialize() {
        let config: RetryPolicyConfig = serde_json::from_str(r#"{"max_retries": 5}"#).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_delay_ms, 1_000);
        assert!(config.deny_list.is_none());
    }

    #[test]
    fn test_step_retry_fixed_delay() {
        let config = RetryConfig::new(2, 10);
        assert_eq!(config.delay_for(0), Duration::from_millis(10));
        assert_eq!(config.delay_for(5), Duration::from_millis(10));
    }

    #[test]
    fn test_step_retry_exponential_delay_capped() {
        let config = RetryConfig {
            max_retries: 5,
            retry_delay_ms: 100,
            exponential_backoff: true,
            backoff_multiplier: 3.0,
            max_delay_ms: Some(500),
        };
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(300));
        assert_eq!(config.delay_for(2), Duration::from_millis(500));
    }
}
