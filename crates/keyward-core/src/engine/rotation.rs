//! Key rotation, revocation and grace-period sweeps.
//!
//! All state transitions happen here, under the conversation's rotation lock.
//! A rotation is: generate → save Pending → demote previous Active →
//! `commit_rotation` → swap the cache entry. The cache slot's write lock is
//! held from the demotion to the swap, so encrypts see either the old key or
//! the new one.

use std::{sync::PoisonError, time::Duration};

use keyward_crypto::KeyMaterial;

use super::{EncryptionEngine, cache::CachedKey};
use crate::{
    audit::AuditEvent,
    config::RevokedKeyPolicy,
    env::Environment,
    error::EngineError,
    key::{EncryptionKey, KeyState},
    storage::{KeyRepository, Rotation},
};

/// Why a rotation was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationTrigger {
    /// Operator or client asked for it
    Explicit,
    /// Rotation interval elapsed or the per-key message cap was reached
    Scheduled,
    /// A participant left or was removed. Rotates before they can read
    /// anything sealed afterwards.
    ///
    /// The old key retires normally, so backlog sealed under it stays
    /// decryptable by the remaining members until its grace deadline. Use
    /// [`SuspectedCompromise`](Self::SuspectedCompromise) to cut that off.
    ParticipantRemoved {
        /// Who was removed
        participant: String,
    },
    /// Key may be exposed. Revokes immediately, skipping the grace period.
    SuspectedCompromise,
}

/// What happens to the outgoing Active key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Demotion {
    Retire,
    Revoke,
}

impl<R: KeyRepository, E: Environment> EncryptionEngine<R, E> {
    /// Promote a fresh key, demoting the current Active key to Retiring.
    ///
    /// Provisions v1 if the conversation has no key yet. Returns the new
    /// version.
    ///
    /// # Errors
    ///
    /// - `Storage`: any repository failure, including `Conflict` if the
    ///   Active key changed underneath us. Transient, nothing is promoted.
    pub fn rotate_key(&self, conversation_id: &str) -> Result<u64, EngineError> {
        let lock = self.rotation_lock(conversation_id);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.rotate_held(conversation_id, Demotion::Retire)
    }

    /// Compromise path: revoke the Active key outright and promote a fresh
    /// one. The revoked secret is wiped from the cache and tombstoned (or
    /// destroyed) in storage.
    pub fn revoke_and_rotate(&self, conversation_id: &str) -> Result<u64, EngineError> {
        let lock = self.rotation_lock(conversation_id);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.rotate_held(conversation_id, Demotion::Revoke)
    }

    /// Revoke one version.
    ///
    /// Revoking the Active key takes the compromise path and promotes a new
    /// key. Revoking a Retiring key ends its grace period early. Already
    /// revoked keys are left alone.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound`: version does not exist
    /// - `InvalidTransition`: version is still Pending
    pub fn revoke_version(&self, conversation_id: &str, version: u64) -> Result<(), EngineError> {
        let lock = self.rotation_lock(conversation_id);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let key = self.repository.get_by_version(conversation_id, version)?;
        match key.state() {
            KeyState::Active => self.rotate_held(conversation_id, Demotion::Revoke).map(|_| ()),
            KeyState::Revoked => Ok(()),
            KeyState::Pending | KeyState::Retiring => self.revoke_record(key),
        }
    }

    /// Act on a rotation trigger. Returns the new Active version.
    pub fn handle_trigger(
        &self,
        conversation_id: &str,
        trigger: &RotationTrigger,
    ) -> Result<u64, EngineError> {
        match trigger {
            RotationTrigger::Explicit | RotationTrigger::Scheduled => {
                self.rotate_key(conversation_id)
            },
            RotationTrigger::ParticipantRemoved { participant } => {
                tracing::info!(conversation_id, %participant, "rotating after participant removal");
                self.rotate_key(conversation_id)
            },
            RotationTrigger::SuspectedCompromise => self.revoke_and_rotate(conversation_id),
        }
    }

    /// `Some(Scheduled)` if the Active key is older than the rotation
    /// interval or has reached the per-key message cap.
    ///
    /// Without a cached counter the persisted high-water mark stands in for
    /// the message count, so a restarted process errs towards rotating
    /// early.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound`: the conversation has no Active key
    pub fn rotation_due(
        &self,
        conversation_id: &str,
    ) -> Result<Option<RotationTrigger>, EngineError> {
        let key = self.repository.get_active(conversation_id)?;
        let meta = key.metadata();

        let messages = self
            .cache
            .get(conversation_id)
            .and_then(|slot| {
                let current = slot.read();
                current
                    .as_ref()
                    .filter(|cached| cached.meta().version == meta.version)
                    .map(CachedKey::messages)
            })
            .unwrap_or(meta.messages_encrypted);

        let age = self.env.wall_clock_secs().saturating_sub(meta.created_at);
        let expired = Duration::from_secs(age) >= self.config.rotation_interval;
        let exhausted = messages >= self.config.max_messages_per_key;

        Ok((expired || exhausted).then_some(RotationTrigger::Scheduled))
    }

    /// Rotate if [`rotation_due`](Self::rotation_due) says so. Returns the new
    /// version, or `None` if nothing was due.
    pub fn rotate_if_due(&self, conversation_id: &str) -> Result<Option<u64>, EngineError> {
        match self.rotation_due(conversation_id)? {
            Some(trigger) => self.handle_trigger(conversation_id, &trigger).map(Some),
            None => Ok(None),
        }
    }

    /// Rotate because `version` ran out of nonce counters, unless a concurrent
    /// rotation already replaced it.
    pub(super) fn rotate_exhausted(
        &self,
        conversation_id: &str,
        version: u64,
    ) -> Result<(), EngineError> {
        let lock = self.rotation_lock(conversation_id);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.cache.cached_version(conversation_id) != Some(version) {
            return Ok(());
        }

        tracing::info!(
            conversation_id,
            version,
            cap = self.config.max_messages_per_key,
            "message cap reached, rotating"
        );
        self.rotate_held(conversation_id, Demotion::Retire).map(|_| ())
    }

    /// Revoke Retiring keys whose grace period has run out. Returns how many
    /// were revoked.
    pub fn sweep(&self, conversation_id: &str) -> Result<usize, EngineError> {
        let lock = self.rotation_lock(conversation_id);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let now = self.env.wall_clock_secs();
        let mut swept = 0;

        for key in self.repository.list_retiring(conversation_id)? {
            if key.grace_expired(now) {
                self.revoke_record(key)?;
                swept += 1;
            }
        }

        Ok(swept)
    }

    /// [`sweep`](Self::sweep) every known conversation.
    pub fn sweep_all(&self) -> Result<usize, EngineError> {
        let mut swept = 0;
        for conversation_id in self.repository.list_conversations()? {
            swept += self.sweep(&conversation_id)?;
        }
        Ok(swept)
    }

    /// Rotation body. Caller holds the conversation's rotation lock.
    fn rotate_held(&self, conversation_id: &str, demotion: Demotion) -> Result<u64, EngineError> {
        let previous = match self.repository.get_active(conversation_id) {
            Ok(key) => Some(key),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let version =
            self.repository.latest_version(conversation_id)?.map_or(1, |latest| latest + 1);
        let now = self.env.wall_clock_secs();

        let material = KeyMaterial::generate(|bytes| self.env.random_bytes(bytes));
        let id = format!("{:032x}", self.env.random_u128());
        let mut promoted = EncryptionKey::pending(id, conversation_id, version, material, now);
        self.repository.save(&promoted)?;
        promoted.activate()?;

        let slot = self.cache.slot(conversation_id);
        let mut current = slot.write();

        let demoted = match previous {
            Some(mut key) => {
                if let Some(cached) =
                    current.as_ref().filter(|cached| cached.meta().version == key.version())
                {
                    key.metadata_mut().messages_encrypted = cached.messages();
                }
                match demotion {
                    Demotion::Retire => key.retire(now, self.config.grace_period)?,
                    Demotion::Revoke => key.revoke(now)?,
                }
                Some(key)
            },
            None => None,
        };
        let previous_version = demoted.as_ref().map(EncryptionKey::version);

        let rotation =
            Rotation { conversation_id: conversation_id.to_owned(), promoted, demoted };
        self.repository.commit_rotation(&rotation)?;

        // Dropping the old entry zeroes its secret.
        *current = CachedKey::new(&rotation.promoted);
        drop(current);

        let revoked = demotion == Demotion::Revoke;
        tracing::info!(
            conversation_id,
            version,
            previous = ?previous_version,
            revoked,
            "rotated conversation key"
        );

        if let (Demotion::Revoke, Some(revoked_version)) = (demotion, previous_version) {
            self.audit.record(&AuditEvent::KeyCompromised {
                conversation_id: conversation_id.to_owned(),
                revoked_version,
                new_version: version,
            });
            self.apply_revoked_policy(conversation_id, revoked_version);
        }

        Ok(version)
    }

    /// Revoke a non-Active record, persist it, and apply the revoked-key
    /// policy.
    fn revoke_record(&self, mut key: EncryptionKey) -> Result<(), EngineError> {
        key.revoke(self.env.wall_clock_secs())?;
        self.repository.save(&key)?;

        tracing::info!(
            conversation_id = key.conversation_id(),
            version = key.version(),
            "revoked conversation key"
        );

        self.apply_revoked_policy(key.conversation_id(), key.version());
        Ok(())
    }

    /// Under `Destroy`, purge a revoked record.
    ///
    /// The record is already tombstoned, so a failed purge only leaves
    /// metadata behind and is logged rather than returned.
    fn apply_revoked_policy(&self, conversation_id: &str, version: u64) {
        if self.config.revoked_key_policy != RevokedKeyPolicy::Destroy {
            return;
        }

        if let Err(e) = self.repository.purge(conversation_id, version) {
            tracing::warn!(conversation_id, version, error = %e, "failed to purge revoked key");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use keyward_crypto::SecureBuffer;

    use super::*;
    use crate::{
        EngineConfig, audit::RecordingAudit, env::SimEnv, membership::StaticMembership,
        storage::MemoryRepository,
    };

    fn engine(config: EngineConfig) -> (EncryptionEngine<MemoryRepository, SimEnv>, SimEnv) {
        let membership = StaticMembership::new();
        membership.set("conv-1", ["alice"]);
        let env = SimEnv::with_seed(3);

        let engine = EncryptionEngine::new(
            MemoryRepository::new(),
            env.clone(),
            Arc::new(membership),
            config,
        );
        (engine, env)
    }

    #[test]
    fn first_rotation_provisions_v1() {
        let (engine, _) = engine(EngineConfig::default());

        assert_eq!(engine.rotate_key("conv-1").unwrap(), 1);
        assert_eq!(engine.repository().get_active("conv-1").unwrap().version(), 1);
        assert!(engine.repository().list_retiring("conv-1").unwrap().is_empty());
    }

    #[test]
    fn rotation_retires_previous_with_grace_deadline() {
        let (engine, env) = engine(EngineConfig::default());
        engine.rotate_key("conv-1").unwrap();
        env.advance(Duration::from_secs(10));

        assert_eq!(engine.rotate_key("conv-1").unwrap(), 2);

        let retiring = engine.repository().list_retiring("conv-1").unwrap();
        assert_eq!(retiring.len(), 1);
        assert_eq!(
            retiring[0].metadata().grace_deadline,
            Some(SimEnv::START_SECS + 10 + EngineConfig::DEFAULT_GRACE_PERIOD.as_secs())
        );
        assert_eq!(engine.cached_version("conv-1"), Some(2));
    }

    #[test]
    fn demotion_persists_message_count() {
        let (engine, _) = engine(EngineConfig::default());
        engine.rotate_key("conv-1").unwrap();

        for _ in 0..3 {
            engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("m")).unwrap();
        }
        engine.rotate_key("conv-1").unwrap();

        let old = engine.repository().get_by_version("conv-1", 1).unwrap();
        assert_eq!(old.metadata().messages_encrypted, 3);
    }

    #[test]
    fn compromise_revokes_and_audits() {
        let (engine, _) = engine(EngineConfig::default());
        let audit = Arc::new(RecordingAudit::new());
        let engine = engine.with_audit(audit.clone());
        engine.rotate_key("conv-1").unwrap();

        let version =
            engine.handle_trigger("conv-1", &RotationTrigger::SuspectedCompromise).unwrap();

        assert_eq!(version, 2);
        let old = engine.repository().get_by_version("conv-1", 1).unwrap();
        assert_eq!(old.state(), KeyState::Revoked);
        assert!(old.is_tombstoned());
        assert_eq!(
            audit.events(),
            vec![AuditEvent::KeyCompromised {
                conversation_id: "conv-1".into(),
                revoked_version: 1,
                new_version: 2,
            }]
        );
    }

    #[test]
    fn destroy_policy_purges_revoked_keys() {
        let config = EngineConfig {
            revoked_key_policy: RevokedKeyPolicy::Destroy,
            ..EngineConfig::default()
        };
        let (engine, _) = engine(config);
        engine.rotate_key("conv-1").unwrap();
        engine.revoke_and_rotate("conv-1").unwrap();

        assert!(engine.repository().get_by_version("conv-1", 1).unwrap_err().is_not_found());
        assert_eq!(engine.repository().latest_version("conv-1").unwrap(), Some(2));
    }

    #[test]
    fn revoke_version_of_retiring_key() {
        let (engine, _) = engine(EngineConfig::default());
        engine.rotate_key("conv-1").unwrap();
        engine.rotate_key("conv-1").unwrap();

        engine.revoke_version("conv-1", 1).unwrap();
        engine.revoke_version("conv-1", 1).unwrap();

        let old = engine.repository().get_by_version("conv-1", 1).unwrap();
        assert_eq!(old.state(), KeyState::Revoked);
        assert_eq!(engine.repository().get_active("conv-1").unwrap().version(), 2);
    }

    #[test]
    fn revoke_version_of_active_key_rotates() {
        let (engine, _) = engine(EngineConfig::default());
        engine.rotate_key("conv-1").unwrap();

        engine.revoke_version("conv-1", 1).unwrap();

        assert_eq!(engine.repository().get_active("conv-1").unwrap().version(), 2);
        assert!(engine.repository().list_retiring("conv-1").unwrap().is_empty());
    }

    #[test]
    fn revoke_unknown_version_is_not_found() {
        let (engine, _) = engine(EngineConfig::default());

        assert!(matches!(
            engine.revoke_version("conv-1", 9),
            Err(EngineError::KeyNotFound { version: Some(9), .. })
        ));
    }

    #[test]
    fn rotation_due_by_age_and_by_count() {
        let config = EngineConfig { max_messages_per_key: 2, ..EngineConfig::default() };
        let (engine, env) = engine(config);
        engine.rotate_key("conv-1").unwrap();
        assert_eq!(engine.rotation_due("conv-1").unwrap(), None);

        engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("a")).unwrap();
        engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("b")).unwrap();
        assert_eq!(engine.rotation_due("conv-1").unwrap(), Some(RotationTrigger::Scheduled));
        assert_eq!(engine.rotate_if_due("conv-1").unwrap(), Some(2));
        assert_eq!(engine.rotate_if_due("conv-1").unwrap(), None);

        env.advance(EngineConfig::DEFAULT_ROTATION_INTERVAL);
        assert_eq!(engine.rotate_if_due("conv-1").unwrap(), Some(3));
    }

    #[test]
    fn encrypt_at_cap_rotates_inline() {
        let config = EngineConfig { max_messages_per_key: 2, ..EngineConfig::default() };
        let (engine, _) = engine(config);
        engine.rotate_key("conv-1").unwrap();

        let versions: Vec<u64> = (0..5)
            .map(|_| engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("m")).unwrap())
            .map(|envelope| envelope.key_version)
            .collect();

        assert_eq!(versions, vec![1, 1, 2, 2, 3]);
        for version in [1, 2] {
            let old = engine.repository().get_by_version("conv-1", version).unwrap();
            assert_eq!(old.state(), KeyState::Retiring);
            assert_eq!(old.metadata().messages_encrypted, 2);
        }
    }

    #[test]
    fn zero_cap_is_exhausted() {
        let config = EngineConfig { max_messages_per_key: 0, ..EngineConfig::default() };
        let (engine, _) = engine(config);
        engine.rotate_key("conv-1").unwrap();
        let mut body = SecureBuffer::from("m");

        let err = engine.encrypt("alice", "conv-1", &mut body).unwrap_err();

        assert_eq!(err, EngineError::KeyExhausted { conversation_id: "conv-1".into(), version: 2 });
        assert!(body.is_wiped());
    }

    #[test]
    fn counters_are_reserved_in_storage_ahead_of_use() {
        use crate::engine::cache::COUNTER_BLOCK;

        let (engine, _) = engine(EngineConfig::default());
        engine.rotate_key("conv-1").unwrap();
        let stored = || {
            engine.repository().get_active("conv-1").unwrap().metadata().messages_encrypted
        };
        assert_eq!(stored(), 0);

        engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("m")).unwrap();
        assert_eq!(stored(), COUNTER_BLOCK);

        for _ in 1..COUNTER_BLOCK {
            engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("m")).unwrap();
        }
        assert_eq!(stored(), COUNTER_BLOCK);

        engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("m")).unwrap();
        assert_eq!(stored(), 2 * COUNTER_BLOCK);
    }

    #[test]
    fn sweep_revokes_only_expired() {
        let (engine, env) = engine(EngineConfig::default());
        engine.rotate_key("conv-1").unwrap();
        engine.rotate_key("conv-1").unwrap();
        env.advance(Duration::from_secs(60));
        engine.rotate_key("conv-1").unwrap();

        env.advance(EngineConfig::DEFAULT_GRACE_PERIOD - Duration::from_secs(30));
        assert_eq!(engine.sweep_all().unwrap(), 1);

        let retiring = engine.repository().list_retiring("conv-1").unwrap();
        let versions: Vec<u64> = retiring.iter().map(EncryptionKey::version).collect();
        assert_eq!(versions, vec![2]);

        env.advance(Duration::from_secs(30));
        assert_eq!(engine.sweep("conv-1").unwrap(), 1);
        assert_eq!(engine.sweep("conv-1").unwrap(), 0);
    }
}
