//! Key storage abstraction for keyward
//!
//! Trait-based abstraction for persisting conversation key records. The
//! repository owns persistence only: it holds no cryptographic logic and never
//! decides state transitions, but it does refuse writes that would break the
//! per-conversation invariants (one Active key, unique versions).
//!
//! The trait is synchronous (no async) to keep the engine free of a runtime.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticRepository;
pub use error::StorageError;
pub use memory::MemoryRepository;

pub use self::redb::RedbRepository;
use crate::key::{EncryptionKey, KeyMetadata, KeyState};

/// A promotion of a Pending key to Active, paired with the demotion of the
/// previous Active key.
///
/// Repositories apply both writes as one unit: readers observe either the
/// pre-rotation or the post-rotation state, never both keys Active or none.
#[derive(Debug, Clone)]
pub struct Rotation {
    /// Conversation being rotated
    pub conversation_id: String,
    /// New key, already transitioned to Active
    pub promoted: EncryptionKey,
    /// Previous Active key, transitioned to Retiring or Revoked. `None` when
    /// the conversation had no Active key (first provisioning).
    pub demoted: Option<EncryptionKey>,
}

impl Rotation {
    /// Active version the repository must currently hold for this rotation
    /// to apply.
    pub fn expected_active(&self) -> Option<u64> {
        self.demoted.as_ref().map(EncryptionKey::version)
    }
}

/// Storage abstraction for conversation key records
///
/// Must be Clone (shared between engine and maintenance tasks), Send + Sync
/// (thread-safe), and synchronous (no async methods). Implementations
/// typically share internal state via Arc, so clones access the same
/// underlying storage.
///
/// # Invariants
///
/// - At most one key per conversation is Active
/// - Versions are unique per conversation and never reused, even after a
///   record is purged
/// - [`commit_rotation`](Self::commit_rotation) is atomic
pub trait KeyRepository: Clone + Send + Sync + 'static {
    /// The Active key for a conversation.
    ///
    /// Returns `StorageError::NotFound` if the conversation has no Active key.
    fn get_active(&self, conversation_id: &str) -> Result<EncryptionKey, StorageError>;

    /// A key by version, in any state.
    ///
    /// Returns `StorageError::NotFound` if the version never existed or was
    /// purged.
    fn get_by_version(
        &self,
        conversation_id: &str,
        version: u64,
    ) -> Result<EncryptionKey, StorageError>;

    /// Insert or update a single key record.
    ///
    /// # Invariants
    ///
    /// - Pre: a new record's version is above every version ever stored for
    ///   the conversation
    /// - Pre: saving an Active record requires no other Active key (CAS on
    ///   `(conversation_id, Active)`)
    /// - Pre: the current Active key cannot be demoted through `save`, only
    ///   through `commit_rotation`
    /// - Post: record is persisted and `latest_version` covers it
    fn save(&self, key: &EncryptionKey) -> Result<(), StorageError>;

    /// Retiring keys of a conversation, ordered by version.
    ///
    /// Used to decrypt backlog and by grace-period sweeps.
    fn list_retiring(&self, conversation_id: &str) -> Result<Vec<EncryptionKey>, StorageError>;

    /// Atomically promote `rotation.promoted` and demote `rotation.demoted`.
    ///
    /// # Invariants
    ///
    /// - Pre: the promoted key is persisted as Pending
    /// - Pre: the current Active version equals `rotation.expected_active()`,
    ///   otherwise `StorageError::Conflict` and nothing is written
    /// - Post: both records are written, or neither
    fn commit_rotation(&self, rotation: &Rotation) -> Result<(), StorageError>;

    /// Highest version ever allocated for a conversation. `None` if the
    /// conversation has no keys.
    fn latest_version(&self, conversation_id: &str) -> Result<Option<u64>, StorageError>;

    /// Destroy a Revoked record.
    ///
    /// Returns `StorageError::Conflict` if the record is not Revoked and
    /// `StorageError::NotFound` if it does not exist.
    fn purge(&self, conversation_id: &str, version: u64) -> Result<(), StorageError>;

    /// All conversations with at least one allocated version.
    ///
    /// Order is not guaranteed.
    fn list_conversations(&self) -> Result<Vec<String>, StorageError>;
}

/// Validate a `save` against the current view of the conversation.
pub(crate) fn check_save(
    key: &EncryptionKey,
    existing: Option<&KeyMetadata>,
    active: Option<u64>,
    latest: Option<u64>,
) -> Result<(), StorageError> {
    let meta = key.metadata();

    match existing {
        Some(current) if current.id != meta.id => {
            return Err(StorageError::conflict(format!(
                "{} v{} already belongs to key {}",
                meta.conversation_id, meta.version, current.id
            )));
        },
        Some(current) if current.state == KeyState::Revoked && meta.state != KeyState::Revoked => {
            return Err(StorageError::conflict(format!(
                "{} v{} is revoked and cannot be restored",
                meta.conversation_id, meta.version
            )));
        },
        Some(_) => {},
        None => {
            if let Some(latest) = latest.filter(|&latest| meta.version <= latest) {
                return Err(StorageError::conflict(format!(
                    "{} v{} already allocated (latest v{latest})",
                    meta.conversation_id, meta.version
                )));
            }
        },
    }

    match active {
        Some(active) if meta.state == KeyState::Active && active != meta.version => {
            Err(StorageError::conflict(format!(
                "{} already has active key v{active}",
                meta.conversation_id
            )))
        },
        Some(active) if meta.state != KeyState::Active && active == meta.version => {
            Err(StorageError::conflict(format!(
                "{} v{active} is active and can only be demoted by a rotation",
                meta.conversation_id
            )))
        },
        _ => Ok(()),
    }
}

/// Validate a rotation against the stored promoted record and current Active
/// version.
pub(crate) fn check_rotation(
    rotation: &Rotation,
    stored_promoted: Option<&KeyMetadata>,
    active: Option<u64>,
) -> Result<(), StorageError> {
    let promoted = rotation.promoted.metadata();

    if promoted.state != KeyState::Active || promoted.conversation_id != rotation.conversation_id {
        return Err(StorageError::conflict(format!(
            "promoted key {} v{} is not an active key of {}",
            promoted.conversation_id, promoted.version, rotation.conversation_id
        )));
    }

    let persisted_pending = stored_promoted
        .is_some_and(|stored| stored.id == promoted.id && stored.state == KeyState::Pending);
    if !persisted_pending {
        return Err(StorageError::conflict(format!(
            "{} v{} must be persisted as pending before promotion",
            rotation.conversation_id, promoted.version
        )));
    }

    if let Some(demoted) = &rotation.demoted {
        let meta = demoted.metadata();
        if meta.conversation_id != rotation.conversation_id
            || !matches!(meta.state, KeyState::Retiring | KeyState::Revoked)
        {
            return Err(StorageError::conflict(format!(
                "demoted key {} v{} is not retiring or revoked",
                meta.conversation_id, meta.version
            )));
        }
    }

    if rotation.expected_active() != active {
        return Err(StorageError::conflict(format!(
            "stale rotation for {}: expected active {:?}, found {:?}",
            rotation.conversation_id,
            rotation.expected_active(),
            active
        )));
    }

    Ok(())
}
