//! Engine error taxonomy.
//!
//! Every failure reaches the caller with a specific kind. Storage failures are
//! the only transient ones; everything else is permanent for the given input
//! and key. Lower-layer errors are folded in here so callers match on one
//! enum.

use keyward_crypto::CryptoError;
use thiserror::Error;

use crate::{
    key::TransitionError,
    storage::StorageError,
    validator::{SecurityError, ValidationError},
};

/// Errors returned by [`EncryptionEngine`](crate::EncryptionEngine).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No usable key exists for the conversation (or version). Provision or
    /// rotate before retrying.
    #[error("key not found: conversation {conversation_id}, version {version:?}")]
    KeyNotFound {
        /// Conversation that was queried
        conversation_id: String,
        /// Requested version (`None` for the Active key)
        version: Option<u64>,
    },

    /// Key exists but was revoked
    #[error("key {conversation_id} v{version} is revoked")]
    KeyRevoked {
        /// Conversation the key belongs to
        conversation_id: String,
        /// Key version
        version: u64,
    },

    /// Retiring key is past its grace deadline
    #[error("key {conversation_id} v{version} expired at {deadline}")]
    KeyExpired {
        /// Conversation the key belongs to
        conversation_id: String,
        /// Key version
        version: u64,
        /// Grace deadline (unix seconds)
        deadline: u64,
    },

    /// Active key has used up its message cap and a fresh key could not take
    /// over. Only happens with a cap of zero.
    #[error("key {conversation_id} v{version} reached its message cap")]
    KeyExhausted {
        /// Conversation the key belongs to
        conversation_id: String,
        /// Key version
        version: u64,
    },

    /// Caller is not a participant of the conversation
    #[error("{participant} is not a participant of {conversation_id}")]
    MembershipMismatch {
        /// Conversation that was accessed
        conversation_id: String,
        /// Caller identity
        participant: String,
    },

    /// Envelope failed authentication. Never retry with the same bytes.
    #[error("integrity check failed for {conversation_id} v{key_version}")]
    IntegrityFailure {
        /// Conversation the envelope was presented for
        conversation_id: String,
        /// Version claimed by the envelope
        key_version: u64,
    },

    /// Primitive rejected its input (malformed nonce or tag length)
    #[error("crypto failure: {0}")]
    CryptoFailure(CryptoError),

    /// Repository failure other than a missing key
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Message body rejected
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// State machine violation (a bug in the caller or a corrupt record)
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

impl EngineError {
    /// Returns true if retrying with backoff may succeed.
    ///
    /// Only storage I/O failures and lost storage races are transient. Key,
    /// membership, integrity and validation failures never fix themselves.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Returns true for failures that must also go to the security audit.
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, Self::IntegrityFailure { .. } | Self::MembershipMismatch { .. })
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { conversation_id, version } => {
                Self::KeyNotFound { conversation_id, version }
            },
            other => Self::Storage(other),
        }
    }
}

impl From<SecurityError> for EngineError {
    fn from(err: SecurityError) -> Self {
        match err {
            SecurityError::KeyRevoked { conversation_id, version } => {
                Self::KeyRevoked { conversation_id, version }
            },
            SecurityError::KeyExpired { conversation_id, version, deadline } => {
                Self::KeyExpired { conversation_id, version, deadline }
            },
            SecurityError::MembershipMismatch { conversation_id, participant } => {
                Self::MembershipMismatch { conversation_id, participant }
            },
            // A key that is not yet (or no longer) usable for this operation
            // is, to the caller, no key at all.
            SecurityError::KeyUnusable { conversation_id, version, .. } => {
                Self::KeyNotFound { conversation_id, version: Some(version) }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{key::KeyState, validator::Operation};

    #[test]
    fn storage_not_found_becomes_key_not_found() {
        let err: EngineError =
            StorageError::NotFound { conversation_id: "c".into(), version: Some(2) }.into();

        assert_eq!(err, EngineError::KeyNotFound { conversation_id: "c".into(), version: Some(2) });
        assert!(!err.is_transient());
    }

    #[test]
    fn io_is_transient() {
        let err: EngineError = StorageError::Io("disk full".into()).into();
        assert!(err.is_transient());
        assert!(!err.is_security_relevant());
    }

    #[test]
    fn pending_key_reads_as_missing() {
        let err: EngineError = SecurityError::KeyUnusable {
            conversation_id: "c".into(),
            version: 4,
            state: KeyState::Pending,
            operation: Operation::Decrypt,
        }
        .into();

        assert_eq!(err, EngineError::KeyNotFound { conversation_id: "c".into(), version: Some(4) });
    }

    #[test]
    fn security_relevance() {
        assert!(
            EngineError::IntegrityFailure { conversation_id: "c".into(), key_version: 1 }
                .is_security_relevant()
        );
        assert!(
            EngineError::MembershipMismatch { conversation_id: "c".into(), participant: "e".into() }
                .is_security_relevant()
        );
        assert!(!EngineError::KeyRevoked { conversation_id: "c".into(), version: 1 }.is_security_relevant());
    }

    #[test]
    fn exhaustion_is_permanent() {
        let err = EngineError::KeyExhausted { conversation_id: "c".into(), version: 2 };

        assert!(!err.is_transient());
        assert!(!err.is_security_relevant());
        insta::assert_snapshot!(err.to_string(), @"key c v2 reached its message cap");
    }

    #[test]
    fn display() {
        let err = EngineError::CryptoFailure(CryptoError::InvalidNonceLength { expected: 24, actual: 12 });
        insta::assert_snapshot!(err.to_string(), @"crypto failure: invalid nonce length: expected 24, got 12");

        let err = EngineError::IntegrityFailure { conversation_id: "conv-42".into(), key_version: 3 };
        insta::assert_snapshot!(err.to_string(), @"integrity check failed for conv-42 v3");
    }
}
