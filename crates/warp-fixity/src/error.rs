//! Error types for fixity operations
//!
//! Verification outcomes such as a missing object or a digest that could not
//! be generated are *results* and are recorded as [`crate::FixityState`]
//! values. The variants below cover failures of the engine itself.

use crate::record::{RecordId, RevisionId};

/// Result type for fixity operations
pub type Result<T> = std::result::Result<T, Error>;

/// Fixity engine errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A write would break a record invariant. Always a caller bug.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The operation is not permitted in the record's current state
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Another writer changed the record, or completed its current
    /// revision, since it was loaded
    #[error("record {record_id} changed concurrently: loaded at revision {expected}, stored at revision {actual}")]
    Conflict {
        /// Record that was being written
        record_id: RecordId,
        /// Revision the writer loaded
        expected: RevisionId,
        /// Revision currently stored
        actual: RevisionId,
    },

    /// Reading the candidate population failed
    #[error("enumeration failed: {0}")]
    Enumeration(String),

    /// Work queue operation failed
    #[error("work queue error: {0}")]
    Queue(String),

    /// Record store operation failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Hash algorithm name is not supported
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Candidate source identifier is not registered
    #[error("unknown candidate source: {0}")]
    UnknownSource(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Embedded database error
    #[error("database error: {0}")]
    Sled(#[from] sled::Error),

    /// Internal error (task join failures and the like)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error signals a programming error rather than bad input
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::InvariantViolation(_))
    }

    /// Check if repeating the operation may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. } | Error::Enumeration(_) | Error::Queue(_) | Error::Io(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
