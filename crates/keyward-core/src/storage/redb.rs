//! Redb-backed durable key repository.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Every
//! trait method runs in a single transaction, so a rotation's promotion and
//! demotion land together or not at all. All state survives restarts.

use std::{path::Path, sync::Arc};

use keyward_crypto::KeyMaterial;
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use super::{KeyRepository, Rotation, StorageError, check_rotation, check_save};
use crate::key::{EncryptionKey, KeyMetadata, KeyState};

/// Table: keys
/// Key: (conversation_id, version) as [len: 4 bytes BE][conversation_id][version: 8 bytes BE]
/// Value: CBOR-encoded `StoredRecord`
const KEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("keys");

/// Table: active
/// Key: conversation_id
/// Value: Active version
const ACTIVE: TableDefinition<&str, u64> = TableDefinition::new("active");

/// Table: latest
/// Key: conversation_id
/// Value: highest version ever allocated (kept after purge)
const LATEST: TableDefinition<&str, u64> = TableDefinition::new("latest");

/// On-disk form of a key record. `secret` is `None` for tombstones.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    meta: KeyMetadata,
    #[serde(with = "serde_bytes")]
    secret: Option<Vec<u8>>,
}

/// Durable key repository backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbRepository {
    db: Arc<Database>,
}

impl RedbRepository {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist (KEYS, ACTIVE, LATEST).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(KEYS).map_err(io)?;
            let _ = txn.open_table(ACTIVE).map_err(io)?;
            let _ = txn.open_table(LATEST).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl KeyRepository for RedbRepository {
    fn get_active(&self, conversation_id: &str) -> Result<EncryptionKey, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let active = txn.open_table(ACTIVE).map_err(io)?;
        let keys = txn.open_table(KEYS).map_err(io)?;

        let not_found =
            || StorageError::NotFound { conversation_id: conversation_id.to_owned(), version: None };

        let version = active.get(conversation_id).map_err(io)?.map(|v| v.value());
        let version = version.ok_or_else(not_found)?;

        load_record(&keys, conversation_id, version)?.ok_or_else(not_found)
    }

    fn get_by_version(
        &self,
        conversation_id: &str,
        version: u64,
    ) -> Result<EncryptionKey, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let keys = txn.open_table(KEYS).map_err(io)?;

        load_record(&keys, conversation_id, version)?.ok_or_else(|| StorageError::NotFound {
            conversation_id: conversation_id.to_owned(),
            version: Some(version),
        })
    }

    fn save(&self, key: &EncryptionKey) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;

        {
            let mut tables = WriteTables::open(&txn)?;
            let conversation_id = key.conversation_id();

            let existing = load_record(&tables.keys, conversation_id, key.version())?;
            check_save(
                key,
                existing.as_ref().map(EncryptionKey::metadata),
                tables.active_version(conversation_id)?,
                tables.latest_version(conversation_id)?,
            )?;

            tables.write(key)?;
        }

        txn.commit().map_err(io)?;
        Ok(())
    }

    fn list_retiring(&self, conversation_id: &str) -> Result<Vec<EncryptionKey>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let keys = txn.open_table(KEYS).map_err(io)?;

        let start = encode_key(conversation_id, 0);
        let end = encode_key(conversation_id, u64::MAX);

        let mut retiring = Vec::new();
        for result in keys.range(start.as_slice()..=end.as_slice()).map_err(io)? {
            let (_, value) = result.map_err(io)?;
            let key = decode_record(value.value())?;
            if key.state() == KeyState::Retiring {
                retiring.push(key);
            }
        }

        Ok(retiring)
    }

    fn commit_rotation(&self, rotation: &Rotation) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;

        {
            let mut tables = WriteTables::open(&txn)?;
            let conversation_id = rotation.conversation_id.as_str();

            let stored =
                load_record(&tables.keys, conversation_id, rotation.promoted.version())?;
            check_rotation(
                rotation,
                stored.as_ref().map(EncryptionKey::metadata),
                tables.active_version(conversation_id)?,
            )?;

            if let Some(demoted) = &rotation.demoted {
                tables.write(demoted)?;
            }
            tables.write(&rotation.promoted)?;
        }

        txn.commit().map_err(io)?;
        Ok(())
    }

    fn latest_version(&self, conversation_id: &str) -> Result<Option<u64>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let latest = txn.open_table(LATEST).map_err(io)?;

        Ok(latest.get(conversation_id).map_err(io)?.map(|v| v.value()))
    }

    fn purge(&self, conversation_id: &str, version: u64) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;

        {
            let mut keys = txn.open_table(KEYS).map_err(io)?;

            match load_record(&keys, conversation_id, version)?.map(|key| key.state()) {
                None => {
                    return Err(StorageError::NotFound {
                        conversation_id: conversation_id.to_owned(),
                        version: Some(version),
                    });
                },
                Some(KeyState::Revoked) => {
                    keys.remove(encode_key(conversation_id, version).as_slice()).map_err(io)?;
                },
                Some(state) => {
                    return Err(StorageError::conflict(format!(
                        "{conversation_id} v{version} is {state}, only revoked keys can be purged"
                    )));
                },
            }
        }

        txn.commit().map_err(io)?;
        Ok(())
    }

    fn list_conversations(&self) -> Result<Vec<String>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let latest = txn.open_table(LATEST).map_err(io)?;

        let mut conversations = Vec::new();
        for result in latest.iter().map_err(io)? {
            let (key, _) = result.map_err(io)?;
            conversations.push(key.value().to_owned());
        }

        Ok(conversations)
    }
}

/// The three tables opened inside one write transaction.
struct WriteTables<'txn> {
    keys: Table<'txn, &'static [u8], &'static [u8]>,
    active: Table<'txn, &'static str, u64>,
    latest: Table<'txn, &'static str, u64>,
}

impl<'txn> WriteTables<'txn> {
    fn open(txn: &'txn redb::WriteTransaction) -> Result<Self, StorageError> {
        Ok(Self {
            keys: txn.open_table(KEYS).map_err(io)?,
            active: txn.open_table(ACTIVE).map_err(io)?,
            latest: txn.open_table(LATEST).map_err(io)?,
        })
    }

    fn active_version(&self, conversation_id: &str) -> Result<Option<u64>, StorageError> {
        Ok(self.active.get(conversation_id).map_err(io)?.map(|v| v.value()))
    }

    fn latest_version(&self, conversation_id: &str) -> Result<Option<u64>, StorageError> {
        Ok(self.latest.get(conversation_id).map_err(io)?.map(|v| v.value()))
    }

    /// Write a record and keep the Active and latest pointers in step.
    fn write(&mut self, key: &EncryptionKey) -> Result<(), StorageError> {
        let conversation_id = key.conversation_id();
        let version = key.version();

        let bytes = encode_record(key)?;
        self.keys
            .insert(encode_key(conversation_id, version).as_slice(), bytes.as_slice())
            .map_err(io)?;

        if key.state() == KeyState::Active {
            self.active.insert(conversation_id, version).map_err(io)?;
        } else if self.active_version(conversation_id)? == Some(version) {
            self.active.remove(conversation_id).map_err(io)?;
        }

        if self.latest_version(conversation_id)?.is_none_or(|latest| version > latest) {
            self.latest.insert(conversation_id, version).map_err(io)?;
        }

        Ok(())
    }
}

fn load_record<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    conversation_id: &str,
    version: u64,
) -> Result<Option<EncryptionKey>, StorageError> {
    let key = encode_key(conversation_id, version);

    match table.get(key.as_slice()).map_err(io)? {
        Some(value) => decode_record(value.value()).map(Some),
        None => Ok(None),
    }
}

/// Serialize a record. The returned bytes contain the secret and are zeroed
/// on drop.
fn encode_record(key: &EncryptionKey) -> Result<Zeroizing<Vec<u8>>, StorageError> {
    let mut record = StoredRecord {
        meta: key.metadata().clone(),
        secret: key.material().map(|material| material.expose().to_vec()),
    };

    let mut bytes = Zeroizing::new(Vec::with_capacity(512));
    let result = ciborium::into_writer(&record, &mut *bytes);
    record.secret.zeroize();

    result.map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode_record(bytes: &[u8]) -> Result<EncryptionKey, StorageError> {
    let mut record: StoredRecord =
        ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;

    let material = record.secret.as_deref().map(KeyMaterial::from_slice).transpose();
    record.secret.zeroize();
    let material = material.map_err(|e| StorageError::Serialization(e.to_string()))?;

    Ok(EncryptionKey::from_parts(record.meta, material))
}

/// Encode (conversation_id, version) as a length-prefixed key.
///
/// Layout: [len: 4 bytes BE][conversation_id bytes][version: 8 bytes BE]
/// The length prefix keeps one conversation's range from overlapping another
/// whose id shares a prefix; within a conversation, lexicographic ordering
/// matches numeric version ordering.
fn encode_key(conversation_id: &str, version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + conversation_id.len() + 8);
    key.extend_from_slice(&(conversation_id.len() as u32).to_be_bytes());
    key.extend_from_slice(conversation_id.as_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn io(e: impl std::fmt::Display) -> StorageError {
    StorageError::Io(e.to_string())
}
