//! Circuit breaker for guarding calls to a flaky collaborator.
//!
//! Closed counts consecutive failures; reaching the threshold opens the
//! circuit. After `reset_timeout` an open circuit is reported as half-open
//! and admits probe calls; `half_open_requests` consecutive successes close it
//! again and any failure re-opens it.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward threshold.
    Closed { consecutive_failures: u32 },
    /// Calls are rejected until `reset_timeout` has elapsed since `opened_at`.
    Open { opened_at: Instant },
    /// Probing recovery.
    HalfOpen { consecutive_successes: u32 },
}

impl CircuitState {
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed { .. } => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening (default 5).
    pub failure_threshold: u32,
    /// Time spent open before probing (default 60s).
    pub reset_timeout: Duration,
    /// Consecutive half-open successes needed to close (default 3).
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_requests: 3,
        }
    }
}

/// Counters reported by [`CircuitBreaker::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub state: &'static str,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub times_opened: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    total_calls: u64,
    total_failures: u64,
    total_successes: u64,
    times_opened: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed {
                    consecutive_failures: 0,
                },
                total_calls: 0,
                total_failures: 0,
                total_successes: 0,
                times_opened: 0,
            }),
        }
    }

    /// Whether a call may proceed right now. Never changes state.
    pub fn can_execute(&self) -> bool {
        let inner = self.inner.lock();
        !matches!(self.effective(inner.state), CircuitState::Open { .. })
    }

    /// Current state, materializing an expired open period as half-open.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        inner.state = self.effective(inner.state);
        inner.state
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.total_successes += 1;

        inner.state = match self.effective(inner.state) {
            CircuitState::HalfOpen {
                consecutive_successes,
            } => {
                let successes = consecutive_successes + 1;
                if successes >= self.config.half_open_requests {
                    tracing::info!("circuit closed after successful probes");
                    CircuitState::Closed {
                        consecutive_failures: 0,
                    }
                } else {
                    CircuitState::HalfOpen {
                        consecutive_successes: successes,
                    }
                }
            }
            CircuitState::Closed { .. } => CircuitState::Closed {
                consecutive_failures: 0,
            },
            // A success while open came from a call admitted before opening.
            open @ CircuitState::Open { .. } => open,
        };
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.total_failures += 1;

        let next = match self.effective(inner.state) {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    tracing::warn!(failures, "circuit opened");
                    Some(CircuitState::Open {
                        opened_at: Instant::now(),
                    })
                } else {
                    Some(CircuitState::Closed {
                        consecutive_failures: failures,
                    })
                }
            }
            CircuitState::HalfOpen { .. } => {
                tracing::warn!("probe failed, circuit re-opened");
                Some(CircuitState::Open {
                    opened_at: Instant::now(),
                })
            }
            CircuitState::Open { .. } => None,
        };

        if let Some(next) = next {
            if matches!(next, CircuitState::Open { .. }) {
                inner.times_opened += 1;
            }
            inner.state = next;
        }
    }

    /// Force the circuit closed.
    pub fn reset(&self) {
        self.inner.lock().state = CircuitState::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        CircuitStats {
            state: self.effective(inner.state).name(),
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            times_opened: inner.times_opened,
        }
    }

    fn effective(&self, state: CircuitState) -> CircuitState {
        match state {
            CircuitState::Open { opened_at } if opened_at.elapsed() >= self.config.reset_timeout => {
                CircuitState::HalfOpen {
                    consecutive_successes: 0,
                }
            }
            other => other,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(10),
            half_open_requests: 2,
        })
    }

    #[test]
    fn test_new_breaker_is_closed() {
        let cb = breaker();
        assert!(cb.can_execute());
        assert_eq!(
            cb.state(),
            CircuitState::Closed {
                consecutive_failures: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_failures() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        assert!(cb.can_execute());
        cb.record_failure();
        assert!(!cb.can_execute());
        assert_eq!(cb.stats().times_opened, 1);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert!(cb.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout_then_closes() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        // can_execute does not materialize the transition.
        assert!(cb.can_execute());
        assert_eq!(
            cb.state(),
            CircuitState::HalfOpen {
                consecutive_successes: 0
            }
        );

        cb.record_success();
        assert!(matches!(cb.state(), CircuitState::HalfOpen { .. }));
        cb.record_success();
        assert_eq!(
            cb.state(),
            CircuitState::Closed {
                consecutive_failures: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_in_half_open_reopens() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        cb.record_failure();
        assert!(!cb.can_execute());
        assert_eq!(cb.stats().times_opened, 2);
        assert_eq!(cb.stats().state, "open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        cb.reset();
        assert!(cb.can_execute());
        assert_eq!(cb.stats().total_failures, 3);
    }
}
