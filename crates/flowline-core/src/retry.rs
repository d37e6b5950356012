//! Retry policy with exponential backoff and jitter.
//!
//! `RetryPolicy` is a stateless decision object: given an error and the number
//! of retries already performed, it decides whether to try again and how long
//! to wait. The job queue, the scheduler and `RetryPolicy::execute` share it.

use std::future::Future;
use std::time::Duration;

use flowline_types::error::{ExecutionError, codes};
use flowline_types::retry::RetryPolicyConfig;
use rand::Rng;

/// Substrings that mark a failure as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "rate limit",
    "503",
    "429",
    "retry",
];

/// Shared heuristic: does this error text describe a transient failure?
///
/// Case-insensitive substring match against timeout, network, connection,
/// rate-limit, 503/429 and "retry" markers.
pub fn is_transient_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Normalize an arbitrary failure into an `ExecutionError`.
///
/// A typed `ExecutionError` keeps its own `recoverable` flag; anything else is
/// classified with [`is_transient_failure`] over its full error chain.
pub fn classify_error(err: &anyhow::Error, fallback_code: &str) -> ExecutionError {
    if let Some(exec) = err.downcast_ref::<ExecutionError>() {
        return exec.clone();
    }
    let message = format!("{err:#}");
    let recoverable = is_transient_failure(&message);
    ExecutionError::new(fallback_code, message, recoverable)
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryPolicyConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryPolicyConfig {
        &self.config
    }

    /// Decide whether the work that produced `error` should run again.
    ///
    /// `retry_count` is the number of retries already performed (0 after the
    /// first failed attempt).
    pub fn should_retry(&self, error: &ExecutionError, retry_count: u32) -> bool {
        if retry_count >= self.config.max_retries || !error.recoverable {
            return false;
        }
        if let Some(deny) = &self.config.deny_list {
            if code_matches(&error.code, deny) {
                return false;
            }
        }
        if let Some(allow) = &self.config.allow_list {
            return code_matches(&error.code, allow);
        }
        error.recoverable
    }

    /// Delay before retry number `retry_count`.
    ///
    /// Fixed `initial_delay_ms` without backoff; otherwise
    /// `initial × multiplier^retry_count` with ±20% uniform jitter, clamped
    /// to `max_delay_ms`.
    pub fn get_delay(&self, retry_count: u32) -> Duration {
        if !self.config.exponential_backoff {
            return Duration::from_millis(self.config.initial_delay_ms);
        }
        let base = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(retry_count as i32);
        let jitter: f64 = rand::thread_rng().gen_range(0.8..=1.2);
        let ms = (base * jitter).min(self.config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(ms as u64)
    }

    /// Run `op` until it succeeds or the policy gives up.
    ///
    /// `op` receives the 0-based attempt number. Failures are classified with
    /// [`classify_error`]; the last error is returned once retries are
    /// exhausted or the failure is not recoverable.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, ExecutionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut retry_count = 0u32;
        loop {
            match op(retry_count).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let error = classify_error(&err, codes::UNKNOWN);
                    if !self.should_retry(&error, retry_count) {
                        return Err(error);
                    }
                    let delay = self.get_delay(retry_count);
                    tracing::warn!(
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        code = error.code.as_str(),
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
            }
        }
    }
}

/// Case-insensitive substring match in either direction.
fn code_matches(code: &str, list: &[String]) -> bool {
    let code = code.to_lowercase();
    list.iter().any(|entry| {
        let entry = entry.to_lowercase();
        code.contains(&entry) || entry.contains(&code)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryPolicyConfig::default())
    }

    fn transient() -> ExecutionError {
        ExecutionError::recoverable("NETWORK", "connection reset")
    }

    // -------------------------------------------------------------------
    // should_retry
    // -------------------------------------------------------------------

    #[test]
    fn test_should_retry_recoverable_below_limit() {
        let p = policy();
        assert!(p.should_retry(&transient(), 0));
        assert!(p.should_retry(&transient(), 2));
    }

    #[test]
    fn test_should_not_retry_at_limit_regardless_of_flag() {
        let p = policy();
        assert!(!p.should_retry(&transient(), 3));
        assert!(!p.should_retry(&ExecutionError::fatal("X", "y"), 3));
    }

    #[test]
    fn test_should_not_retry_fatal() {
        assert!(!policy().should_retry(&ExecutionError::fatal("VALIDATION", "bad"), 0));
    }

    #[test]
    fn test_deny_list_matches_substring_either_direction() {
        let p = RetryPolicy::new(RetryPolicyConfig {
            deny_list: Some(vec!["auth".to_string(), "RATE_LIMIT_EXCEEDED".to_string()]),
            ..RetryPolicyConfig::default()
        });
        assert!(!p.should_retry(&ExecutionError::recoverable("AUTH_FAILED", "x"), 0));
        assert!(!p.should_retry(&ExecutionError::recoverable("rate_limit", "x"), 0));
        assert!(p.should_retry(&ExecutionError::recoverable("NETWORK", "x"), 0));
    }

    #[test]
    fn test_allow_list_restricts_retries() {
        let p = RetryPolicy::new(RetryPolicyConfig {
            allow_list: Some(vec!["TIMEOUT".to_string()]),
            ..RetryPolicyConfig::default()
        });
        assert!(p.should_retry(&ExecutionError::recoverable("timeout", "x"), 0));
        assert!(!p.should_retry(&ExecutionError::recoverable("NETWORK", "x"), 0));
    }

    // -------------------------------------------------------------------
    // get_delay
    // -------------------------------------------------------------------

    #[test]
    fn test_fixed_delay_without_backoff() {
        let p = RetryPolicy::new(RetryPolicyConfig {
            exponential_backoff: false,
            initial_delay_ms: 250,
            ..RetryPolicyConfig::default()
        });
        assert_eq!(p.get_delay(0), Duration::from_millis(250));
        assert_eq!(p.get_delay(7), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_delay_within_jitter_bounds() {
        let p = policy();
        for n in 0..6u32 {
            let base = 1000.0 * 2f64.powi(n as i32);
            let lower = (0.8 * base).min(30_000.0);
            let upper = (1.2 * base).min(30_000.0);
            for _ in 0..50 {
                let d = p.get_delay(n).as_millis() as f64;
                assert!(d >= lower - 1.0 && d <= upper, "n={n} delay={d}");
            }
        }
    }

    #[test]
    fn test_delay_clamped_to_max() {
        let p = RetryPolicy::new(RetryPolicyConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            ..RetryPolicyConfig::default()
        });
        for _ in 0..20 {
            assert!(p.get_delay(10) <= Duration::from_millis(5000));
        }
    }

    // -------------------------------------------------------------------
    // classification
    // -------------------------------------------------------------------

    #[test]
    fn test_is_transient_failure_markers() {
        assert!(is_transient_failure("Request Timeout"));
        assert!(is_transient_failure("upstream returned 503"));
        assert!(is_transient_failure("Rate limit exceeded"));
        assert!(is_transient_failure("please retry later"));
        assert!(!is_transient_failure("invalid order id"));
    }

    #[test]
    fn test_classify_keeps_typed_flag() {
        let err = anyhow::Error::new(ExecutionError::fatal("NETWORK", "connection refused"));
        let classified = classify_error(&err, codes::UNKNOWN);
        assert_eq!(classified.code, "NETWORK");
        assert!(!classified.recoverable);
    }

    #[test]
    fn test_classify_untyped_uses_heuristic() {
        let err = anyhow::anyhow!("connection reset by peer");
        let classified = classify_error(&err, codes::PROCESSOR_ERROR);
        assert_eq!(classified.code, codes::PROCESSOR_ERROR);
        assert!(classified.recoverable);

        let err = anyhow::anyhow!("missing field");
        assert!(!classify_error(&err, codes::UNKNOWN).recoverable);
    }

    // -------------------------------------------------------------------
    // execute
    // -------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = policy()
            .execute(move |_attempt| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        anyhow::bail!("network unreachable")
                    }
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_stops_on_non_recoverable() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = policy()
            .execute(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("invalid payload")
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = policy()
            .execute(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("request timeout")
                }
            })
            .await;
        let err = result.unwrap_err();
        assert!(err.recoverable);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
