//! Error types for the registry/config node
//!
//! Provides structured error types for the registry store, replication,
//! configuration snapshot store, change notification and the API layer.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the node
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Lookup / Versioning Errors
    // =========================================================================
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("Conflict on {resource}: expected version {expected}, found {actual}")]
    Conflict {
        resource: String,
        expected: u64,
        actual: u64,
    },

    // =========================================================================
    // Availability Errors
    // =========================================================================
    #[error("{target} unavailable: {reason}")]
    Unavailable { target: String, reason: String },

    #[error("Peer push to {peer} failed: {reason}")]
    PeerPush { peer: String, reason: String },

    #[error("Delivery to {client_id} failed: {reason}")]
    Delivery { client_id: String, reason: String },

    /// The remote end answered, and will keep refusing the same request
    #[error("{target} rejected the request with status {status}")]
    Rejected { target: String, status: u16 },

    // =========================================================================
    // Payload Errors
    // =========================================================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // Transport / IO Errors
    // =========================================================================
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action a background retry loop should take after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Re-read current state, then retry
    RetryAfterReread,
    /// Retry after a fixed delay
    RetryAfter(Duration),
    /// Give up
    NoRetry,
}

impl Error {
    /// Shorthand for a `NotFound` error
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Shorthand for an `Unavailable` error
    pub fn unavailable(target: impl Into<String>, reason: impl ToString) -> Self {
        Error::Unavailable {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Error for a non-2xx response from a peer or webhook
    ///
    /// Client errors other than 408 and 429 will not succeed on retry and
    /// become [`Error::Rejected`]; everything else goes through `transient`.
    pub fn from_status(
        target: impl Into<String>,
        status: u16,
        transient: impl FnOnce(String) -> Error,
    ) -> Self {
        let permanent = (400..500).contains(&status) && status != 408 && status != 429;
        if permanent {
            Error::Rejected {
                target: target.into(),
                status,
            }
        } else {
            transient(format!("responded with {}", status))
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Unavailable { .. }
            | Error::PeerPush { .. }
            | Error::Delivery { .. }
            | Error::Http(_)
            | Error::Io(_) => ErrorAction::RetryWithBackoff,

            // Lost a version race - caller must re-read
            Error::Conflict { .. } => ErrorAction::RetryAfterReread,

            Error::Internal(_) => ErrorAction::RetryAfter(Duration::from_secs(5)),

            // Caller errors - don't retry automatically
            Error::NotFound { .. }
            | Error::Rejected { .. }
            | Error::Validation(_)
            | Error::Configuration(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRetry,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryWithBackoff)
    }

    /// Short machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::Rejected { .. } => "rejected",
            Error::Unavailable { .. } | Error::PeerPush { .. } | Error::Delivery { .. } => {
                "unavailable"
            }
            Error::Validation(_) | Error::JsonParse(_) | Error::YamlParse(_) => "validation_failed",
            Error::Configuration(_) => "configuration_error",
            Error::Http(_) | Error::Io(_) | Error::Internal(_) => "internal_error",
        }
    }
}

/// Result type alias for the node
pub type Result<T> = std::result::Result<T, Error>;
