//! Key usability and caller authorization checks.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{
    key::{KeyMetadata, KeyState},
    membership::Membership,
};

/// What a key is about to be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Sealing a new message
    Encrypt,
    /// Opening a received envelope
    Decrypt,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
        })
    }
}

/// Key or caller rejected by [`SecurityValidator`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// Key has been revoked
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

    /// Caller is not a current participant of the conversation
    #[error("{participant} is not a participant of {conversation_id}")]
    MembershipMismatch {
        /// Conversation that was accessed
        conversation_id: String,
        /// Caller identity
        participant: String,
    },

    /// Key exists but its state does not allow the operation (a Pending key,
    /// or a Retiring key asked to encrypt)
    #[error("key {conversation_id} v{version} is {state}, cannot {operation}")]
    KeyUnusable {
        /// Conversation the key belongs to
        conversation_id: String,
        /// Key version
        version: u64,
        /// Current state
        state: KeyState,
        /// Requested operation
        operation: Operation,
    },
}

/// Decides whether a key may be used for an operation and whether the caller
/// may touch the conversation at all.
///
/// Only ever sees [`KeyMetadata`], never key bytes. Membership is delegated
/// to the external [`Membership`] collaborator.
#[derive(Clone)]
pub struct SecurityValidator {
    membership: Arc<dyn Membership>,
}

impl SecurityValidator {
    /// Create a validator backed by a membership source.
    pub fn new(membership: Arc<dyn Membership>) -> Self {
        Self { membership }
    }

    /// Reject callers that are not current participants.
    pub fn check_membership(
        &self,
        participant: &str,
        conversation_id: &str,
    ) -> Result<(), SecurityError> {
        if self.membership.is_participant(conversation_id, participant) {
            Ok(())
        } else {
            Err(SecurityError::MembershipMismatch {
                conversation_id: conversation_id.to_owned(),
                participant: participant.to_owned(),
            })
        }
    }

    /// Whether `key` may be used for `operation` at `now` (unix seconds).
    ///
    /// - Encrypt: Active only
    /// - Decrypt: Active, or Retiring before its grace deadline
    /// - Revoked always fails with `KeyRevoked`
    pub fn check(
        &self,
        key: &KeyMetadata,
        operation: Operation,
        now: u64,
    ) -> Result<(), SecurityError> {
        match (key.state, operation) {
            (KeyState::Active, _) => Ok(()),
            (KeyState::Revoked, _) => Err(SecurityError::KeyRevoked {
                conversation_id: key.conversation_id.clone(),
                version: key.version,
            }),
            (KeyState::Retiring, Operation::Decrypt) => match key.grace_deadline {
                Some(deadline) if now >= deadline => Err(SecurityError::KeyExpired {
                    conversation_id: key.conversation_id.clone(),
                    version: key.version,
                    deadline,
                }),
                _ => Ok(()),
            },
            (state @ (KeyState::Pending | KeyState::Retiring), _) => {
                Err(SecurityError::KeyUnusable {
                    conversation_id: key.conversation_id.clone(),
                    version: key.version,
                    state,
                    operation,
                })
            },
        }
    }
}

impl fmt::Debug for SecurityValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityValidator").finish_non_exhaustive()
    }
}
