//! Ordered error classification table.

use std::time::Duration;

use flowline_types::error::ExecutionError;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Broad family of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Business,
    System,
    Timeout,
    External,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Business => "business",
            ErrorCategory::System => "system",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::External => "external",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do about a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry { delay: Duration },
    Skip,
    Escalate,
    Fallback,
    Abort,
}

impl RecoveryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryAction::Retry { .. } => "retry",
            RecoveryAction::Skip => "skip",
            RecoveryAction::Escalate => "escalate",
            RecoveryAction::Fallback => "fallback",
            RecoveryAction::Abort => "abort",
        }
    }
}

/// One row of the classification table.
///
/// A pattern matches when its code regex matches the error code or its
/// message regex matches the error message. Both are case-insensitive.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub code_pattern: Option<Regex>,
    pub message_pattern: Option<Regex>,
    pub category: ErrorCategory,
    pub default_action: RecoveryAction,
}

impl ErrorPattern {
    pub fn new(
        code_pattern: Option<&str>,
        message_pattern: Option<&str>,
        category: ErrorCategory,
        default_action: RecoveryAction,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            code_pattern: code_pattern.map(compile).transpose()?,
            message_pattern: message_pattern.map(compile).transpose()?,
            category,
            default_action,
        })
    }

    pub fn matches(&self, error: &ExecutionError) -> bool {
        self.code_pattern
            .as_ref()
            .is_some_and(|re| re.is_match(&error.code))
            || self
                .message_pattern
                .as_ref()
                .is_some_and(|re| re.is_match(&error.message))
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

struct Rule {
    code: &'static str,
    message: &'static str,
    category: ErrorCategory,
    action: RecoveryAction,
}

const fn retry_after(ms: u64) -> RecoveryAction {
    RecoveryAction::Retry {
        delay: Duration::from_millis(ms),
    }
}

const DEFAULT_RULES: &[Rule] = &[
    Rule {
        code: r"ECONNRESET|ETIMEDOUT|ECONNREFUSED|NETWORK|CONNECTION",
        message: r"connection (reset|refused|timed out)|network|socket hang up",
        category: ErrorCategory::Transient,
        action: retry_after(1_000),
    },
    Rule {
        code: r"RATE_?LIMIT|TOO_MANY_REQUESTS|SERVICE_UNAVAILABLE|(?:^|\D)(?:429|503)(?:\D|$)",
        message: r"rate.?limit|too many requests|service unavailable|(?:^|\D)(?:429|503)(?:\D|$)",
        category: ErrorCategory::Transient,
        action: retry_after(5_000),
    },
    Rule {
        code: r"TIMEOUT|DEADLINE",
        message: r"time(d)? ?out|deadline exceeded",
        category: ErrorCategory::Timeout,
        action: retry_after(2_000),
    },
    Rule {
        code: r"EXTERNAL|BAD_GATEWAY|GATEWAY_TIMEOUT|(?:^|\D)(?:502|504)(?:\D|$)",
        message: r"external service|bad gateway|gateway timeout|(?:^|\D)(?:502|504)(?:\D|$)",
        category: ErrorCategory::External,
        action: retry_after(3_000),
    },
    Rule {
        code: r"VALIDATION|BUSINESS",
        message: r"validation|business rule",
        category: ErrorCategory::Business,
        action: RecoveryAction::Skip,
    },
    Rule {
        code: r"INTERNAL|FATAL|CRITICAL",
        message: r"internal error|fatal|critical",
        category: ErrorCategory::System,
        action: RecoveryAction::Escalate,
    },
];

/// The built-in table, in match order.
pub fn default_patterns() -> Vec<ErrorPattern> {
    DEFAULT_RULES
        .iter()
        .filter_map(|rule| {
            ErrorPattern::new(Some(rule.code), Some(rule.message), rule.category, rule.action)
                .map_err(|e| tracing::error!(error = %e, "invalid built-in error pattern"))
                .ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_match(error: &ExecutionError) -> Option<ErrorCategory> {
        default_patterns()
            .into_iter()
            .find(|p| p.matches(error))
            .map(|p| p.category)
    }

    #[test]
    fn test_default_table_compiles_fully() {
        assert_eq!(default_patterns().len(), DEFAULT_RULES.len());
    }

    #[test]
    fn test_classification_by_code_and_message() {
        let cases = [
            (ExecutionError::recoverable("ECONNRESET", "x"), ErrorCategory::Transient),
            (ExecutionError::recoverable("HTTP", "Too Many Requests"), ErrorCategory::Transient),
            (ExecutionError::recoverable("TIMEOUT", "step took too long"), ErrorCategory::Timeout),
            (ExecutionError::recoverable("UPSTREAM", "Bad Gateway"), ErrorCategory::External),
            (ExecutionError::fatal("validation_failed", "missing sku"), ErrorCategory::Business),
            (ExecutionError::fatal("E1", "Critical disk failure"), ErrorCategory::System),
        ];
        for (error, expected) in cases {
            assert_eq!(first_match(&error), Some(expected), "{error}");
        }
    }

    #[test]
    fn test_status_codes_match_inside_identifiers() {
        let cases = [
            (ExecutionError::recoverable("HTTP_429", "x"), ErrorCategory::Transient),
            (ExecutionError::recoverable("E503", "x"), ErrorCategory::Transient),
            (ExecutionError::recoverable("UPSTREAM_502", "x"), ErrorCategory::External),
            (ExecutionError::recoverable("E1", "status=504"), ErrorCategory::External),
        ];
        for (error, expected) in cases {
            assert_eq!(first_match(&error), Some(expected), "{}", error.code);
        }
        assert_eq!(first_match(&ExecutionError::fatal("E4290", "order 15030")), None);
    }

    #[test]
    fn test_unmatched_error() {
        assert_eq!(first_match(&ExecutionError::fatal("E42", "order declined")), None);
    }

    #[test]
    fn test_invalid_custom_pattern_is_rejected() {
        let result = ErrorPattern::new(Some("("), None, ErrorCategory::Business, RecoveryAction::Skip);
        assert!(result.is_err());
    }
}
