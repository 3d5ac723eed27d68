//! Storage error types.
//!
//! Defines errors that can occur during key repository operations:
//! - `NotFound`: Requested key doesn't exist
//! - `Conflict`: Write would break a repository invariant (second Active key,
//!   reused version, stale rotation)
//! - `Serialization`: Failed to encode/decode a record
//! - `Io`: Underlying storage system errors

use thiserror::Error;

/// Errors that can occur during key repository operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No key for this conversation (and version, if given)
    #[error("key not found: conversation {conversation_id}, version {version:?}")]
    NotFound {
        /// Conversation that was queried
        conversation_id: String,
        /// Version that was queried (`None` for the Active key)
        version: Option<u64>,
    },

    /// Write rejected because it would violate a repository invariant.
    ///
    /// Raised when a second key would become Active, when a version is
    /// reused, or when a rotation's expected Active version is stale.
    #[error("storage conflict: {reason}")]
    Conflict {
        /// What was violated
        reason: String,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// Returns true if the caller may retry the same request with backoff.
    ///
    /// I/O failures are transient. A conflict means another writer got there
    /// first; re-reading state and retrying is safe. Missing keys and corrupt
    /// records never fix themselves.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Conflict { .. })
    }

    /// Returns true if the requested record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict { reason: reason.into() }
    }
}
