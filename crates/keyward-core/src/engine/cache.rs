//! Process-wide cache of Active keys.
//!
//! One slot per conversation. A slot is populated on first use and replaced
//! only by a rotation, which holds the slot's write lock across the storage
//! commit. Encrypts hold the read lock for the duration of the seal, so a
//! rotation waits for in-flight encrypts and they never see a half-swapped
//! slot. Replaced entries drop here, which zeroes their key material.
//!
//! Nonce counters are handed out from a block reserved in storage: the
//! persisted `messages_encrypted` of an Active key is a high-water mark that
//! every counter issued so far stays below. A restarted process resumes from
//! that mark, so a counter is never issued twice and the message cap holds
//! across restarts.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use keyward_crypto::KeyMaterial;

use crate::key::{EncryptionKey, KeyMetadata};

/// Counters reserved per storage write.
pub(crate) const COUNTER_BLOCK: u64 = 1024;

/// An Active key resident in memory, with its nonce counter.
pub(crate) struct CachedKey {
    meta: KeyMetadata,
    material: KeyMaterial,
    /// Next counter to hand out
    counter: AtomicU64,
    /// Persisted high-water mark. Counters below it are covered by storage.
    reserved: Mutex<u64>,
}

impl CachedKey {
    /// Cache entry for a key record. `None` for tombstones.
    ///
    /// Counting resumes at the persisted mark, skipping whatever a previous
    /// process reserved but never used.
    pub(crate) fn new(key: &EncryptionKey) -> Option<Self> {
        let material = key.material()?.clone();
        let mark = key.metadata().messages_encrypted;

        Some(Self {
            meta: key.metadata().clone(),
            material,
            counter: AtomicU64::new(mark),
            reserved: Mutex::new(mark),
        })
    }

    pub(crate) fn meta(&self) -> &KeyMetadata {
        &self.meta
    }

    pub(crate) fn material(&self) -> &KeyMaterial {
        &self.material
    }

    /// Take the next counter, or `None` once `limit` counters are spent.
    pub(crate) fn reserve_counter(&self, limit: u64) -> Option<u64> {
        self.counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                (next < limit).then_some(next + 1)
            })
            .ok()
    }

    /// Make sure `counter`, taken from [`reserve_counter`](Self::reserve_counter)
    /// with the same `limit`, is below the persisted mark.
    ///
    /// If it is not, `persist` is called with a new mark (one block ahead,
    /// capped at `limit`) and the mark only moves once it returns `Ok`.
    /// Concurrent callers serialize here, and only one of them writes.
    pub(crate) fn ensure_reserved<E>(
        &self,
        counter: u64,
        limit: u64,
        persist: impl FnOnce(u64) -> Result<(), E>,
    ) -> Result<(), E> {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        if counter < *reserved {
            return Ok(());
        }

        let mark = counter.saturating_add(COUNTER_BLOCK).min(limit);
        persist(mark)?;
        *reserved = mark;
        Ok(())
    }

    /// Counters issued under this key so far, including any skipped after a
    /// restart.
    pub(crate) fn messages(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

/// One conversation's cache slot.
#[derive(Default)]
pub(crate) struct KeySlot {
    current: RwLock<Option<CachedKey>>,
}

impl KeySlot {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Option<CachedKey>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Option<CachedKey>> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub(crate) struct ActiveKeyCache {
    slots: RwLock<HashMap<String, Arc<KeySlot>>>,
}

impl ActiveKeyCache {
    /// Slot for a conversation, created empty on first use.
    pub(crate) fn slot(&self, conversation_id: &str) -> Arc<KeySlot> {
        if let Some(slot) = self.get(conversation_id) {
            return slot;
        }

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(conversation_id.to_owned()).or_default())
    }

    /// Existing slot, without creating one.
    pub(crate) fn get(&self, conversation_id: &str) -> Option<Arc<KeySlot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).get(conversation_id).cloned()
    }

    /// Version currently cached for a conversation.
    pub(crate) fn cached_version(&self, conversation_id: &str) -> Option<u64> {
        let slot = self.get(conversation_id)?;
        let current = slot.read();
        current.as_ref().map(|key| key.meta().version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_key(version: u64, messages: u64) -> EncryptionKey {
        let mut key = EncryptionKey::pending(
            "id".into(),
            "conv-1",
            version,
            KeyMaterial::generate(|b| b.fill(3)),
            0,
        );
        key.activate().unwrap();
        let mut meta = key.metadata().clone();
        meta.messages_encrypted = messages;
        EncryptionKey::from_parts(meta, key.material().cloned())
    }

    #[test]
    fn counter_resumes_from_persisted_mark() {
        let cached = CachedKey::new(&active_key(1, 41)).unwrap();

        assert_eq!(cached.reserve_counter(100), Some(41));
        assert_eq!(cached.reserve_counter(100), Some(42));
        assert_eq!(cached.messages(), 43);
    }

    #[test]
    fn counter_stops_at_limit() {
        let cached = CachedKey::new(&active_key(1, 0)).unwrap();

        assert_eq!(cached.reserve_counter(2), Some(0));
        assert_eq!(cached.reserve_counter(2), Some(1));
        assert_eq!(cached.reserve_counter(2), None);
        assert_eq!(cached.reserve_counter(2), None);
        assert_eq!(cached.messages(), 2);
    }

    #[test]
    fn reservation_writes_once_per_block() {
        let cached = CachedKey::new(&active_key(1, 0)).unwrap();
        let mut marks = Vec::new();

        for _ in 0..=COUNTER_BLOCK {
            let counter = cached.reserve_counter(u64::MAX).unwrap();
            cached
                .ensure_reserved(counter, u64::MAX, |mark| {
                    marks.push(mark);
                    Ok::<_, ()>(())
                })
                .unwrap();
        }

        assert_eq!(marks, vec![COUNTER_BLOCK, 2 * COUNTER_BLOCK]);
    }

    #[test]
    fn reservation_is_capped_at_limit() {
        let cached = CachedKey::new(&active_key(1, 0)).unwrap();
        let mut marks = Vec::new();

        let counter = cached.reserve_counter(3).unwrap();
        cached
            .ensure_reserved(counter, 3, |mark| {
                marks.push(mark);
                Ok::<_, ()>(())
            })
            .unwrap();

        assert_eq!(marks, vec![3]);
    }

    #[test]
    fn failed_reservation_is_retried() {
        let cached = CachedKey::new(&active_key(1, 0)).unwrap();

        let counter = cached.reserve_counter(10).unwrap();
        assert_eq!(cached.ensure_reserved(counter, 10, |_| Err("disk")), Err("disk"));

        let counter = cached.reserve_counter(10).unwrap();
        let mut written = None;
        cached
            .ensure_reserved(counter, 10, |mark| {
                written = Some(mark);
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(written, Some(10));
    }

    #[test]
    fn tombstones_are_not_cached() {
        let mut key = active_key(1, 0);
        key.revoke(10).unwrap();

        assert!(CachedKey::new(&key).is_none());
    }

    #[test]
    fn slots_are_shared_per_conversation() {
        let cache = ActiveKeyCache::default();
        assert!(cache.get("conv-1").is_none());

        let slot = cache.slot("conv-1");
        *slot.write() = CachedKey::new(&active_key(7, 0));

        assert_eq!(cache.cached_version("conv-1"), Some(7));
        assert!(Arc::ptr_eq(&slot, &cache.slot("conv-1")));
        assert_eq!(cache.cached_version("conv-2"), None);
    }
}
