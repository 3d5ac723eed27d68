//! Conversation key records and their state machine.
//!
//! A key moves linearly `Pending → Active → Retiring → Revoked`. The only
//! shortcut is the compromise path `Active → Revoked`. Revoked is terminal
//! and revoking a key wipes its secret immediately.

use std::{fmt, time::Duration};

use keyward_crypto::KeyMaterial;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a conversation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyState {
    /// Generated and persisted, not yet promoted
    Pending,
    /// The one key new messages are encrypted under
    Active,
    /// Demoted by a rotation, still decrypts backlog until its grace deadline
    Retiring,
    /// Unusable, secret destroyed
    Revoked,
}

impl KeyState {
    /// Whether `self → next` is an allowed transition.
    pub fn can_transition_to(self, next: KeyState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active)
                | (Self::Active, Self::Retiring)
                | (Self::Retiring, Self::Revoked)
                | (Self::Active, Self::Revoked)
        )
    }

    /// True for states that may still decrypt (Active, Retiring).
    pub fn can_decrypt(self) -> bool {
        matches!(self, Self::Active | Self::Retiring)
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Retiring => "retiring",
            Self::Revoked => "revoked",
        };
        f.write_str(name)
    }
}

/// Rejected state transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid key transition for {conversation_id} v{version}: {from} -> {to}")]
pub struct TransitionError {
    /// Conversation the key belongs to
    pub conversation_id: String,
    /// Key version
    pub version: u64,
    /// State the key was in
    pub from: KeyState,
    /// State that was requested
    pub to: KeyState,
}

/// Byte-free view of a key: everything validators, audit and logs may see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    /// Unique key identifier (hex)
    pub id: String,
    /// Conversation this key belongs to
    pub conversation_id: String,
    /// Monotonic per-conversation version, starting at 1
    pub version: u64,
    /// Current lifecycle state
    pub state: KeyState,
    /// Unix seconds when the key was generated
    pub created_at: u64,
    /// Unix seconds when the key was demoted to Retiring
    pub retiring_at: Option<u64>,
    /// Unix seconds when the key was revoked
    pub revoked_at: Option<u64>,
    /// Unix seconds after which a Retiring key no longer decrypts
    pub grace_deadline: Option<u64>,
    /// Nonce counters issued under this key. While Active this is a
    /// high-water mark reserved ahead of use; exact once demoted.
    pub messages_encrypted: u64,
}

/// A conversation key record: metadata plus the secret, if not yet destroyed.
///
/// `Debug` never prints the secret.
#[derive(Debug, Clone)]
pub struct EncryptionKey {
    meta: KeyMetadata,
    material: Option<KeyMaterial>,
}

impl EncryptionKey {
    /// New key in state Pending.
    pub fn pending(
        id: String,
        conversation_id: &str,
        version: u64,
        material: KeyMaterial,
        created_at: u64,
    ) -> Self {
        Self {
            meta: KeyMetadata {
                id,
                conversation_id: conversation_id.to_owned(),
                version,
                state: KeyState::Pending,
                created_at,
                retiring_at: None,
                revoked_at: None,
                grace_deadline: None,
                messages_encrypted: 0,
            },
            material: Some(material),
        }
    }

    /// Reassemble a record loaded from storage.
    pub fn from_parts(meta: KeyMetadata, material: Option<KeyMaterial>) -> Self {
        Self { meta, material }
    }

    /// Byte-free metadata.
    pub fn metadata(&self) -> &KeyMetadata {
        &self.meta
    }

    /// Mutable metadata for storage adapters and counters.
    ///
    /// State changes must go through the transition methods.
    pub(crate) fn metadata_mut(&mut self) -> &mut KeyMetadata {
        &mut self.meta
    }

    /// Conversation this key belongs to.
    pub fn conversation_id(&self) -> &str {
        &self.meta.conversation_id
    }

    /// Key version.
    pub fn version(&self) -> u64 {
        self.meta.version
    }

    /// Current state.
    pub fn state(&self) -> KeyState {
        self.meta.state
    }

    /// The secret, or `None` once revoked.
    pub fn material(&self) -> Option<&KeyMaterial> {
        self.material.as_ref()
    }

    /// True if the secret has been destroyed.
    pub fn is_tombstoned(&self) -> bool {
        self.material.is_none()
    }

    /// `Pending → Active`.
    pub fn activate(&mut self) -> Result<(), TransitionError> {
        self.transition(KeyState::Active)
    }

    /// `Active → Retiring`, decrypting backlog until `now + grace`.
    pub fn retire(&mut self, now: u64, grace: Duration) -> Result<(), TransitionError> {
        self.transition(KeyState::Retiring)?;
        self.meta.retiring_at = Some(now);
        self.meta.grace_deadline = Some(now.saturating_add(grace.as_secs()));
        Ok(())
    }

    /// `Active → Revoked` or `Retiring → Revoked`. Wipes the secret.
    pub fn revoke(&mut self, now: u64) -> Result<(), TransitionError> {
        self.transition(KeyState::Revoked)?;
        self.meta.revoked_at = Some(now);
        if let Some(mut material) = self.material.take() {
            material.wipe();
        }
        Ok(())
    }

    /// Whether a Retiring key's grace period has run out at `now`.
    pub fn grace_expired(&self, now: u64) -> bool {
        self.meta.state == KeyState::Retiring
            && self.meta.grace_deadline.is_some_and(|deadline| now >= deadline)
    }

    fn transition(&mut self, to: KeyState) -> Result<(), TransitionError> {
        if !self.meta.state.can_transition_to(to) {
            return Err(TransitionError {
                conversation_id: self.meta.conversation_id.clone(),
                version: self.meta.version,
                from: self.meta.state,
                to,
            });
        }

        self.meta.state = to;
        Ok(())
    }
}
