//! Error types and result aliases shared across windlass components.
//!
//! Errors are structured for programmatic handling: callers branch on the
//! variant (`PreconditionFailed` is a recoverable race, `Transient` is
//! retryable, `DuplicateChecksum` is a fatal protocol error) rather than on
//! message text.

use std::fmt;

/// The result type used throughout windlass.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in control-plane and staging operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A storage operation failed in a non-retryable way.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A storage operation failed transiently (throttling, network blip).
    ///
    /// Retried locally with bounded exponential backoff; surfaces only
    /// after retries are exhausted.
    #[error("transient store error: {message}")]
    Transient {
        /// Description of the transient failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The requested object or record was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional write lost its race or observed unexpected state.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// Re-registration of an existing window with a different checksum.
    ///
    /// This is a protocol error: the producer staged different bytes under
    /// an already-registered window key. Requires operator attention.
    #[error("duplicate registration with different checksum for {vault_id}/{sort_key}")]
    DuplicateChecksum {
        /// The vault the conflicting entry belongs to.
        vault_id: String,
        /// The conflicting entry's sort key.
        sort_key: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration was missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An internal error that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new transient store error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new precondition failure.
    #[must_use]
    pub fn precondition(message: impl fmt::Display) -> Self {
        Self::PreconditionFailed {
            message: message.to_string(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl fmt::Display) -> Self {
        Self::Serialization {
            message: message.to_string(),
        }
    }

    /// Returns whether this error is worth retrying locally.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns whether this error is a lost conditional-write race.
    #[must_use]
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }
}
