//! Domain-specific error types
//!
//! `QuoteError` is the only error that can reach a quote caller, and only for
//! the chunk that failed. Candle building and persistence absorb their own
//! failures (see `data` and `storage`).

use std::time::Duration;
use thiserror::Error;

/// Failure of a guarded quote fetch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuoteError {
    /// Upstream answered with a non-success HTTP status
    #[error("upstream returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The request did not complete within the configured timeout
    #[error("quote request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection reset, refused, broken pipe, etc.
    #[error("connection error: {0}")]
    Connection(String),

    /// Synthetic: the circuit breaker is open, no I/O was attempted
    #[error("circuit breaker open for another {remaining:?}")]
    BreakerOpen { remaining: Duration },

    /// Anything the upstream reports that is not known to be transient
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The guard was shut down before the task ran
    #[error("quote guard stopped")]
    Stopped,
}

/// Message fragments that identify a dropped or reset connection
const CONNECTION_MARKERS: &[&str] = &[
    "econnreset",
    "connection reset",
    "socket hang up",
    "broken pipe",
    "econnrefused",
    "connection refused",
    "epipe",
    "eai_again",
];

/// Message fragments that identify a timeout
const TIMEOUT_MARKERS: &[&str] = &["etimedout", "timed out", "timeout"];

impl QuoteError {
    /// Transient failures worth retrying: 429, 5xx, timeouts and connection resets
    pub fn is_retryable(&self) -> bool {
        match self {
            QuoteError::Http { status, .. } => *status == 429 || (500..=599).contains(status),
            QuoteError::Timeout(_) | QuoteError::Connection(_) => true,
            QuoteError::BreakerOpen { .. } | QuoteError::Upstream(_) | QuoteError::Stopped => {
                false
            }
        }
    }

    /// Build an error from whatever a client could extract (status code and/or message)
    pub fn classify(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        if let Some(status) = status {
            return QuoteError::Http { status, message };
        }

        let lower = message.to_ascii_lowercase();
        if TIMEOUT_MARKERS.iter().any(|m| lower.contains(m)) {
            return QuoteError::Timeout(Duration::ZERO);
        }
        if CONNECTION_MARKERS.iter().any(|m| lower.contains(m)) {
            return QuoteError::Connection(message);
        }
        QuoteError::Upstream(message)
    }
}

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid UTC offset '{0}', expected e.g. \"+05:30\"")]
    BadOffset(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
