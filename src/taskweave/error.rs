//! Error types for taskweave.
//!
//! Every fallible operation in the crate returns [`Result`]. The [`Error`]
//! enum mirrors the failure taxonomy of the orchestrator: budget denials and
//! open circuit breakers surface to the caller without retry, upstream
//! timeouts and 5xx responses are retryable with backoff, 4xx responses and
//! decode failures surface with a body excerpt, persistence failures are
//! warn-only, and cancellation propagates through every awaited step.
//!
//! Use [`Error::is_retryable`] to drive retry decisions instead of matching
//! variants at call sites.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum number of characters of an upstream body kept in an error.
const BODY_EXCERPT_LEN: usize = 240;

/// Main error type for the orchestrator core.
#[derive(Error, Debug)]
pub enum Error {
    /// A budget check rejected the step. Surfaced to the caller, never retried.
    #[error("budget denied: {0}")]
    BudgetDenied(String),

    /// The per-user circuit breaker is open; the current step fails fast.
    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    /// Upstream service answered with a non-success status.
    ///
    /// 5xx and 429 are retryable; other 4xx surface as-is with a body excerpt.
    #[error("upstream returned HTTP {status}: {excerpt}")]
    UpstreamStatus { status: u16, excerpt: String },

    /// An activity exceeded its configured deadline. Retryable unless the
    /// activity is marked fatal by its caller.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level HTTP failure (connect, TLS, body read).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A response arrived but could not be interpreted; callers fall back to a
    /// simpler path and log the (truncated) raw body.
    #[error("decode failure in {context}: {excerpt}")]
    Decode { context: String, excerpt: String },

    /// Write-behind persistence failure. Never fails a workflow step.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A backing store (vector, session, key-value, relational) failed.
    #[error("store error: {0}")]
    Store(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid input supplied by a caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The workflow was canceled; outstanding I/O is aborted and the cancel
    /// surfaces upward through every awaited activity.
    #[error("workflow canceled")]
    Canceled,

    /// Other errors.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a budget-denied error.
    pub fn budget_denied(msg: impl Into<String>) -> Self {
        Error::BudgetDenied(msg.into())
    }

    /// Create a circuit-open error for the given scope (usually a user id).
    pub fn circuit_open(scope: impl Into<String>) -> Self {
        Error::CircuitOpen(scope.into())
    }

    /// Create an upstream-status error, truncating the body to an excerpt.
    pub fn upstream(status: u16, body: &str) -> Self {
        Error::UpstreamStatus {
            status,
            excerpt: excerpt(body),
        }
    }

    /// Create a decode error, truncating the raw body to an excerpt.
    pub fn decode(context: impl Into<String>, body: &str) -> Self {
        Error::Decode {
            context: context.into(),
            excerpt: excerpt(body),
        }
    }

    /// Create a persistence error.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Error::Persistence(msg.into())
    }

    /// Create a store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Error::Store(msg.into())
    }

    /// Create a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an invalid-input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create an other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Whether a bounded retry with backoff is appropriate for this error.
    ///
    /// Timeouts, transport failures, 429 and 5xx statuses are transient.
    /// Everything else (budget denials, open breakers, 4xx, decode failures,
    /// cancellation) must surface to the caller unchanged.
    ///
    /// ```
    /// use taskweave::error::Error;
    /// use std::time::Duration;
    ///
    /// assert!(Error::Timeout(Duration::from_secs(30)).is_retryable());
    /// assert!(Error::upstream(503, "unavailable").is_retryable());
    /// assert!(Error::upstream(429, "slow down").is_retryable());
    /// assert!(!Error::upstream(400, "bad request").is_retryable());
    /// assert!(!Error::budget_denied("task budget exhausted").is_retryable());
    /// assert!(!Error::Canceled.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Http(_) => true,
            Error::UpstreamStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Short stable identifier of the error kind, used in structured failure
    /// reports and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BudgetDenied(_) => "budget_denied",
            Error::CircuitOpen(_) => "circuit_open",
            Error::UpstreamStatus { status, .. } if *status >= 500 => "upstream_5xx",
            Error::UpstreamStatus { .. } => "upstream_4xx",
            Error::Timeout(_) => "timeout",
            Error::Http(_) => "http",
            Error::Json(_) | Error::Decode { .. } => "decode",
            Error::Persistence(_) => "persistence",
            Error::Store(_) => "store",
            Error::Config(_) => "config",
            Error::InvalidInput(_) => "invalid_input",
            Error::Canceled => "canceled",
            Error::Other(_) => "other",
        }
    }
}

/// Truncate an upstream body for inclusion in errors and logs.
fn excerpt(body: &str) -> String {
    if body.len() <= BODY_EXCERPT_LEN {
        body.to_string()
    } else {
        let mut cut = BODY_EXCERPT_LEN;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &body[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_denied_surface() {
        let err = Error::budget_denied("session budget exhausted");
        assert!(matches!(err, Error::BudgetDenied(_)));
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "budget_denied");
    }

    #[test]
    fn test_upstream_classification() {
        assert!(Error::upstream(500, "boom").is_retryable());
        assert!(Error::upstream(503, "boom").is_retryable());
        assert!(Error::upstream(429, "rate").is_retryable());
        assert!(!Error::upstream(404, "missing").is_retryable());
        assert!(!Error::upstream(422, "bad").is_retryable());
        assert_eq!(Error::upstream(502, "x").kind(), "upstream_5xx");
        assert_eq!(Error::upstream(400, "x").kind(), "upstream_4xx");
    }

    #[test]
    fn test_body_excerpt_truncated() {
        let long = "x".repeat(1000);
        match Error::upstream(500, &long) {
            Error::UpstreamStatus { excerpt, .. } => {
                assert!(excerpt.chars().count() <= BODY_EXCERPT_LEN + 1);
                assert!(excerpt.ends_with('…'));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_canceled_propagates() {
        let err = Error::Canceled;
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "canceled");
        assert_eq!(err.to_string(), "workflow canceled");
    }

    #[test]
    fn test_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert_eq!(err.kind(), "decode");
    }
}
