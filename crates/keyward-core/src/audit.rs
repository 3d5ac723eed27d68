//! Security audit reporting.
//!
//! Integrity failures, membership mismatches and compromise revocations are
//! surfaced to the caller as errors *and* reported to a [`SecurityAudit`]
//! sink. Events carry metadata only.

use std::sync::{Mutex, PoisonError};

/// A security-relevant event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    /// An envelope failed authentication (tampered, corrupted, or addressed
    /// to the wrong conversation)
    IntegrityFailure {
        /// Conversation the envelope was presented for
        conversation_id: String,
        /// Version claimed by the envelope
        key_version: u64,
    },

    /// A caller outside the conversation tried to use its keys
    MembershipMismatch {
        /// Conversation that was accessed
        conversation_id: String,
        /// Caller identity
        participant: String,
    },

    /// An Active key was revoked on the compromise path
    KeyCompromised {
        /// Conversation affected
        conversation_id: String,
        /// Version that was revoked
        revoked_version: u64,
        /// Version promoted in its place
        new_version: u64,
    },
}

/// Sink for [`AuditEvent`]s.
pub trait SecurityAudit: Send + Sync {
    /// Record an event. Must not block for long; called on the request path.
    fn record(&self, event: &AuditEvent);
}

/// Default sink: emits `warn!` events on the `keyward::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAudit;

impl SecurityAudit for TracingAudit {
    fn record(&self, event: &AuditEvent) {
        match event {
            AuditEvent::IntegrityFailure { conversation_id, key_version } => {
                tracing::warn!(
                    target: "keyward::audit",
                    conversation_id = %conversation_id,
                    key_version,
                    "integrity failure"
                );
            },
            AuditEvent::MembershipMismatch { conversation_id, participant } => {
                tracing::warn!(
                    target: "keyward::audit",
                    conversation_id = %conversation_id,
                    participant = %participant,
                    "membership mismatch"
                );
            },
            AuditEvent::KeyCompromised { conversation_id, revoked_version, new_version } => {
                tracing::warn!(
                    target: "keyward::audit",
                    conversation_id = %conversation_id,
                    revoked_version,
                    new_version,
                    "key revoked on compromise"
                );
            },
        }
    }
}

/// Sink that keeps every event in memory. For tests and simulations.
#[derive(Debug, Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAudit {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl SecurityAudit for RecordingAudit {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event.clone());
    }
}
