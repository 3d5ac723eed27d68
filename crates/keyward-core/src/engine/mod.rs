//! Encryption engine: validate → fetch key → transform.
//!
//! The engine is the only component that sees key bytes and the only one that
//! changes key state. Everything else (repository, validators, membership,
//! audit) is a collaborator it consults.
//!
//! # Concurrency
//!
//! - Conversations are independent: separate cache slots, separate rotation
//!   locks.
//! - Within a conversation, encrypts and decrypts run in parallel. Each
//!   encrypt reserves a unique counter for its nonce. Counters are covered by
//!   a high-water mark in storage before use, one block per write.
//! - An encrypt that finds the Active key at its message cap rotates it and
//!   retries once, so the cap is never exceeded.
//! - Rotations are serialized per conversation and block encrypts only while
//!   the storage commit and cache swap happen.

mod cache;
mod rotation;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLockReadGuard},
};

use keyward_crypto::{
    KeyMaterial, NONCE_RANDOM_SIZE, SecureBuffer, build_nonce, open_in_place, seal_in_place,
};
pub use rotation::RotationTrigger;

use self::cache::{ActiveKeyCache, CachedKey, KeySlot};
use crate::{
    audit::{AuditEvent, SecurityAudit, TracingAudit},
    config::EngineConfig,
    env::Environment,
    envelope::{CiphertextEnvelope, EnvelopeError},
    error::EngineError,
    key::EncryptionKey,
    membership::Membership,
    storage::KeyRepository,
    validator::{MessageValidator, Operation, SecurityValidator},
};

/// Outcome of one sealing attempt.
enum Seal {
    Done(CiphertextEnvelope),
    /// The Active key at this version has no counters left
    Exhausted(u64),
}

/// Per-conversation key lifecycle and message encryption.
///
/// Generic over the repository and environment so tests run against
/// [`MemoryRepository`](crate::MemoryRepository) and [`SimEnv`](crate::SimEnv)
/// while production uses [`RedbRepository`](crate::RedbRepository) and
/// [`SystemEnv`](crate::SystemEnv).
pub struct EncryptionEngine<R: KeyRepository, E: Environment> {
    repository: R,
    env: E,
    config: EngineConfig,
    messages: MessageValidator,
    security: SecurityValidator,
    audit: Arc<dyn SecurityAudit>,
    cache: ActiveKeyCache,
    rotation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<R: KeyRepository, E: Environment> EncryptionEngine<R, E> {
    /// Create an engine. Audit events go to [`TracingAudit`] until
    /// [`with_audit`](Self::with_audit) says otherwise.
    pub fn new(
        repository: R,
        env: E,
        membership: Arc<dyn Membership>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repository,
            env,
            messages: MessageValidator::new(config.message_limits),
            security: SecurityValidator::new(membership),
            config,
            audit: Arc::new(TracingAudit),
            cache: ActiveKeyCache::default(),
            rotation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn SecurityAudit>) -> Self {
        self.audit = audit;
        self
    }

    /// Underlying repository.
    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validator callers should run on bodies before [`encrypt`](Self::encrypt).
    pub fn message_validator(&self) -> &MessageValidator {
        &self.messages
    }

    /// Version of the Active key currently held in memory, if any.
    pub fn cached_version(&self, conversation_id: &str) -> Option<u64> {
        self.cache.cached_version(conversation_id)
    }

    /// Decode an envelope with the body limit this engine was configured
    /// with.
    pub fn decode_envelope(&self, bytes: &[u8]) -> Result<CiphertextEnvelope, EnvelopeError> {
        CiphertextEnvelope::decode_with_limit(bytes, self.config.message_limits.max_body_size)
    }

    /// Seal `plaintext` under the conversation's Active key.
    ///
    /// `plaintext` is wiped before this returns, on success and on every
    /// error path. If the Active key has reached
    /// [`max_messages_per_key`](EngineConfig::max_messages_per_key) it is
    /// rotated first.
    ///
    /// # Errors
    ///
    /// - `Validation`: empty or oversized body
    /// - `MembershipMismatch`: `caller` is not a participant (audited)
    /// - `KeyNotFound`: the conversation has no Active key
    /// - `KeyRevoked`: the Active key was revoked underneath us
    /// - `KeyExhausted`: the cap was reached and rotating did not help
    /// - `CryptoFailure`: primitive rejected the input
    /// - `Storage`: loading the key, reserving counters or rotating failed
    ///   (transient)
    pub fn encrypt(
        &self,
        caller: &str,
        conversation_id: &str,
        plaintext: &mut SecureBuffer,
    ) -> Result<CiphertextEnvelope, EngineError> {
        self.encrypt_with_associated_data(caller, conversation_id, plaintext, &[])
    }

    /// [`encrypt`](Self::encrypt), also authenticating `associated_data`.
    ///
    /// The bytes are carried in the clear in the envelope and bound into the
    /// tag after the conversation and version, so altering or stripping them
    /// makes decryption fail.
    ///
    /// # Errors
    ///
    /// As [`encrypt`](Self::encrypt), plus `Validation` if `associated_data`
    /// exceeds [`MAX_ASSOCIATED_DATA_SIZE`](crate::validator::MAX_ASSOCIATED_DATA_SIZE).
    pub fn encrypt_with_associated_data(
        &self,
        caller: &str,
        conversation_id: &str,
        plaintext: &mut SecureBuffer,
        associated_data: &[u8],
    ) -> Result<CiphertextEnvelope, EngineError> {
        let mut plaintext = plaintext.wipe_on_drop();

        self.messages.check_bounds(plaintext.len())?;
        self.messages.check_associated_data(associated_data.len())?;
        self.authorize(caller, conversation_id)?;

        let exhausted = match self.seal(conversation_id, &mut plaintext, associated_data)? {
            Seal::Done(envelope) => return Ok(envelope),
            Seal::Exhausted(version) => version,
        };

        self.rotate_exhausted(conversation_id, exhausted)?;

        match self.seal(conversation_id, &mut plaintext, associated_data)? {
            Seal::Done(envelope) => Ok(envelope),
            Seal::Exhausted(version) => Err(EngineError::KeyExhausted {
                conversation_id: conversation_id.to_owned(),
                version,
            }),
        }
    }

    /// Open an envelope with the key version it names.
    ///
    /// The version need not be Active: Retiring keys decrypt backlog until
    /// their grace deadline. Plaintext is only returned after the tag
    /// verifies; on failure nothing is returned and the working buffer is
    /// wiped.
    ///
    /// # Errors
    ///
    /// - `IntegrityFailure`: tag mismatch, or the envelope names another
    ///   conversation (audited)
    /// - `MembershipMismatch`: `caller` is not a participant (audited)
    /// - `KeyNotFound`: version never existed, was purged, or is Pending
    /// - `KeyRevoked` / `KeyExpired`: version exists but may not decrypt
    /// - `Validation`: body or associated data over the configured limits
    /// - `CryptoFailure`: malformed nonce or tag length
    /// - `Storage`: loading the key failed (transient)
    pub fn decrypt(
        &self,
        caller: &str,
        conversation_id: &str,
        envelope: &CiphertextEnvelope,
    ) -> Result<SecureBuffer, EngineError> {
        if envelope.conversation_id != conversation_id {
            return Err(self.integrity_failure(conversation_id, envelope.key_version));
        }

        self.authorize(caller, conversation_id)?;
        self.messages.check_bounds(envelope.ciphertext.len())?;
        self.messages.check_associated_data(envelope.associated_data.len())?;

        let version = envelope.key_version;
        let now = self.env.wall_clock_secs();
        let mut buffer = SecureBuffer::from_slice(&envelope.ciphertext);

        if let Some(slot) = self.cache.get(conversation_id) {
            let current = slot.read();
            if let Some(key) = current.as_ref().filter(|key| key.meta().version == version) {
                self.security.check(key.meta(), Operation::Decrypt, now)?;
                self.open(key.material(), envelope, &mut buffer)?;
                return Ok(buffer);
            }
        }

        let record = self.repository.get_by_version(conversation_id, version)?;
        self.security.check(record.metadata(), Operation::Decrypt, now)?;

        let Some(material) = record.material() else {
            return Err(EngineError::KeyRevoked {
                conversation_id: conversation_id.to_owned(),
                version,
            });
        };

        self.open(material, envelope, &mut buffer)?;
        Ok(buffer)
    }

    /// One attempt at sealing under the cached Active key. Leaves `plaintext`
    /// untouched unless a counter was reserved.
    fn seal(
        &self,
        conversation_id: &str,
        plaintext: &mut SecureBuffer,
        associated_data: &[u8],
    ) -> Result<Seal, EngineError> {
        let slot = self.cache.slot(conversation_id);
        let current = self.active_entry(&slot, conversation_id)?;
        let Some(key) = current.as_ref() else {
            return Err(EngineError::KeyNotFound {
                conversation_id: conversation_id.to_owned(),
                version: None,
            });
        };

        let version = key.meta().version;
        self.security.check(key.meta(), Operation::Encrypt, self.env.wall_clock_secs())?;

        let limit = self.config.max_messages_per_key;
        let Some(counter) = key.reserve_counter(limit) else {
            return Ok(Seal::Exhausted(version));
        };
        key.ensure_reserved(counter, limit, |mark| self.persist_reservation(key, mark))?;

        let mut suffix = [0u8; NONCE_RANDOM_SIZE];
        self.env.random_bytes(&mut suffix);
        let nonce = build_nonce(version, counter, suffix);

        let tag = seal_in_place(
            key.material(),
            conversation_id,
            version,
            &nonce,
            associated_data,
            plaintext,
        )
        .map_err(EngineError::CryptoFailure)?;

        Ok(Seal::Done(CiphertextEnvelope {
            conversation_id: conversation_id.to_owned(),
            key_version: version,
            nonce: nonce.to_vec(),
            ciphertext: plaintext.as_slice().to_vec(),
            integrity_tag: tag.to_vec(),
            associated_data: associated_data.to_vec(),
        }))
    }

    /// Write a new counter high-water mark for the Active key.
    ///
    /// Runs under the slot's read lock, so it cannot interleave with the
    /// rotation that demotes this key.
    fn persist_reservation(&self, key: &CachedKey, mark: u64) -> Result<(), EngineError> {
        let mut meta = key.meta().clone();
        meta.messages_encrypted = mark;

        let record = EncryptionKey::from_parts(meta, Some(key.material().clone()));
        self.repository.save(&record)?;

        tracing::debug!(
            conversation_id = record.conversation_id(),
            version = record.version(),
            reserved = mark,
            "reserved nonce counters"
        );
        Ok(())
    }

    /// Read guard over a populated slot, loading the Active key on a miss.
    fn active_entry<'a>(
        &self,
        slot: &'a KeySlot,
        conversation_id: &str,
    ) -> Result<RwLockReadGuard<'a, Option<CachedKey>>, EngineError> {
        let current = slot.read();
        if current.is_some() {
            return Ok(current);
        }
        drop(current);

        {
            let mut current = slot.write();
            if current.is_none() {
                let key = self.repository.get_active(conversation_id)?;
                *current = CachedKey::new(&key);
                tracing::debug!(
                    conversation_id,
                    version = key.version(),
                    "cached active key"
                );
            }
        }

        Ok(slot.read())
    }

    fn open(
        &self,
        material: &KeyMaterial,
        envelope: &CiphertextEnvelope,
        buffer: &mut SecureBuffer,
    ) -> Result<(), EngineError> {
        open_in_place(
            material,
            &envelope.conversation_id,
            envelope.key_version,
            &envelope.nonce,
            &envelope.integrity_tag,
            &envelope.associated_data,
            buffer,
        )
        .map_err(|err| {
            if err.is_integrity_failure() {
                self.integrity_failure(&envelope.conversation_id, envelope.key_version)
            } else {
                EngineError::CryptoFailure(err)
            }
        })
    }

    fn authorize(&self, caller: &str, conversation_id: &str) -> Result<(), EngineError> {
        self.security.check_membership(caller, conversation_id).map_err(|err| {
            self.audit.record(&AuditEvent::MembershipMismatch {
                conversation_id: conversation_id.to_owned(),
                participant: caller.to_owned(),
            });
            err.into()
        })
    }

    fn integrity_failure(&self, conversation_id: &str, key_version: u64) -> EngineError {
        self.audit.record(&AuditEvent::IntegrityFailure {
            conversation_id: conversation_id.to_owned(),
            key_version,
        });
        EngineError::IntegrityFailure { conversation_id: conversation_id.to_owned(), key_version }
    }

    /// Mutex serializing rotations of one conversation.
    fn rotation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.rotation_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(conversation_id.to_owned()).or_default())
    }
}
