//! Error types for the reconciliation engine.
//!
//! The taxonomy follows how an error is handled by the controller rather than
//! where it came from: not-found is absorbed, transient failures are
//! re-queued, and external pipeline failures never surface here at all (they
//! become terminal `Failed` states on the records instead).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::ObjectKey;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ApheleiaError>;

/// The main error type for apheleia operations.
#[derive(Debug, Error)]
pub enum ApheleiaError {
    /// The object does not exist in the store.
    #[error("{key} not found")]
    NotFound {
        /// The missing object.
        key: ObjectKey,
    },

    /// An object with the same key already exists.
    #[error("{key} already exists")]
    AlreadyExists {
        /// The conflicting object.
        key: ObjectKey,
    },

    /// An optimistic concurrency check failed.
    #[error("conflict updating {key}: expected resource version {expected}, found {actual}")]
    Conflict {
        /// The object being written.
        key: ObjectKey,
        /// The resource version the writer read.
        expected: u64,
        /// The resource version currently stored.
        actual: u64,
    },

    /// The store or the pipeline backend is temporarily unavailable.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// A reconcile exceeded its deadline.
    #[error("reconcile of {key} timed out after {seconds}s")]
    Timeout {
        /// The key being reconciled.
        key: ObjectKey,
        /// The deadline that was exceeded.
        seconds: u64,
    },

    /// An internal invariant did not hold (e.g. a missing owner reference).
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A GAV coordinate could not be parsed.
    #[error("invalid GAV '{0}'")]
    InvalidGav(String),

    /// The pipeline backend rejected a request.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApheleiaError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(key: ObjectKey) -> Self {
        Self::NotFound { key }
    }

    /// Creates an invariant violation.
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    /// Returns true if the error means the object is gone.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the error means a concurrent create won the race.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true if the reconcile should be re-queued with backoff.
    ///
    /// Invariant violations are retried as well: they are logged, never
    /// allowed to take down a worker. A not-found that reaches the caller
    /// names a related record that vanished mid-reconcile, so it is retried
    /// too.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Conflict { .. }
                | Self::Unavailable(_)
                | Self::Timeout { .. }
                | Self::Invariant(_)
                | Self::Pipeline(_)
                | Self::Io(_)
        )
    }

    /// Stable machine-readable code for the error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::Conflict { .. } => "CONFLICT",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Invariant(_) => "INVARIANT",
            Self::InvalidGav(_) => "INVALID_GAV",
            Self::Pipeline(_) => "PIPELINE",
            Self::Config(_) => "CONFIG",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Io(_) => "IO",
        }
    }

    /// Converts to a report suitable for structured logs and status messages.
    #[must_use]
    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            context: HashMap::new(),
        }
    }
}

/// Serializable summary of an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ErrorReport {
    /// Error code (e.g., "CONFLICT").
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the controller will retry.
    pub retryable: bool,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorReport {
    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}
