use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use super::{KeyRepository, Rotation, StorageError, check_rotation, check_save};
use crate::key::{EncryptionKey, KeyState};

/// In-memory key repository for tests, simulation and single-process use
///
/// Records are organized per conversation in a `BTreeMap` keyed by version, so
/// range queries come back ordered. The Active version and the highest version
/// ever allocated are tracked separately; the latter survives purges so a
/// destroyed version is never handed out again. All state lives behind one
/// `Arc<Mutex<>>`, which makes `commit_rotation` trivially atomic.
#[derive(Clone)]
pub struct MemoryRepository {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    /// Key records by conversation, then version
    keys: HashMap<String, BTreeMap<u64, EncryptionKey>>,

    /// Active version per conversation
    active: HashMap<String, u64>,

    /// Highest version ever allocated per conversation
    latest: HashMap<String, u64>,
}

impl Inner {
    fn record(&self, conversation_id: &str, version: u64) -> Option<&EncryptionKey> {
        self.keys.get(conversation_id).and_then(|versions| versions.get(&version))
    }

    fn insert(&mut self, key: EncryptionKey) {
        let conversation_id = key.conversation_id().to_owned();
        let version = key.version();

        if key.state() == KeyState::Active {
            self.active.insert(conversation_id.clone(), version);
        } else if self.active.get(&conversation_id) == Some(&version) {
            self.active.remove(&conversation_id);
        }

        let latest = self.latest.entry(conversation_id.clone()).or_insert(version);
        *latest = (*latest).max(version);

        self.keys.entry(conversation_id).or_default().insert(version, key);
    }
}

impl MemoryRepository {
    /// Create a new empty `MemoryRepository`
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(Inner::default())) }
    }

    /// Number of stored key records across all conversations, including
    /// tombstones.
    ///
    /// Useful for debugging and testing.
    pub fn record_count(&self) -> usize {
        self.lock().keys.values().map(BTreeMap::len).sum()
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (a thread panicked while
    /// holding the lock).
    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("Mutex poisoned")
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRepository for MemoryRepository {
    fn get_active(&self, conversation_id: &str) -> Result<EncryptionKey, StorageError> {
        let inner = self.lock();

        inner
            .active
            .get(conversation_id)
            .and_then(|&version| inner.record(conversation_id, version))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                conversation_id: conversation_id.to_owned(),
                version: None,
            })
    }

    fn get_by_version(
        &self,
        conversation_id: &str,
        version: u64,
    ) -> Result<EncryptionKey, StorageError> {
        self.lock().record(conversation_id, version).cloned().ok_or_else(|| {
            StorageError::NotFound {
                conversation_id: conversation_id.to_owned(),
                version: Some(version),
            }
        })
    }

    fn save(&self, key: &EncryptionKey) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let conversation_id = key.conversation_id();

        check_save(
            key,
            inner.record(conversation_id, key.version()).map(EncryptionKey::metadata),
            inner.active.get(conversation_id).copied(),
            inner.latest.get(conversation_id).copied(),
        )?;

        inner.insert(key.clone());
        Ok(())
    }

    fn list_retiring(&self, conversation_id: &str) -> Result<Vec<EncryptionKey>, StorageError> {
        let inner = self.lock();

        Ok(inner
            .keys
            .get(conversation_id)
            .map(|versions| {
                versions.values().filter(|key| key.state() == KeyState::Retiring).cloned().collect()
            })
            .unwrap_or_default())
    }

    fn commit_rotation(&self, rotation: &Rotation) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let conversation_id = rotation.conversation_id.as_str();

        check_rotation(
            rotation,
            inner
                .record(conversation_id, rotation.promoted.version())
                .map(EncryptionKey::metadata),
            inner.active.get(conversation_id).copied(),
        )?;

        // Demote first so `insert` does not clear the new Active pointer.
        if let Some(demoted) = &rotation.demoted {
            inner.insert(demoted.clone());
        }
        inner.insert(rotation.promoted.clone());

        debug_assert_eq!(inner.active.get(conversation_id), Some(&rotation.promoted.version()));
        Ok(())
    }

    fn latest_version(&self, conversation_id: &str) -> Result<Option<u64>, StorageError> {
        Ok(self.lock().latest.get(conversation_id).copied())
    }

    fn purge(&self, conversation_id: &str, version: u64) -> Result<(), StorageError> {
        let mut inner = self.lock();

        let Some(versions) = inner.keys.get_mut(conversation_id) else {
            return Err(StorageError::NotFound {
                conversation_id: conversation_id.to_owned(),
                version: Some(version),
            });
        };

        match versions.get(&version).map(EncryptionKey::state) {
            None => Err(StorageError::NotFound {
                conversation_id: conversation_id.to_owned(),
                version: Some(version),
            }),
            Some(KeyState::Revoked) => {
                versions.remove(&version);
                Ok(())
            },
            Some(state) => Err(StorageError::conflict(format!(
                "{conversation_id} v{version} is {state}, only revoked keys can be purged"
            ))),
        }
    }

    fn list_conversations(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.lock().latest.keys().cloned().collect())
    }
}
