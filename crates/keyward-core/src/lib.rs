//! Keyward core: conversation key lifecycle and message encryption.
//!
//! Generates, stores, rotates, validates and destroys the symmetric keys bound
//! to a conversation, and uses them to turn message bodies into
//! [`CiphertextEnvelope`]s and back.
//!
//! # Components
//!
//! - [`KeyRepository`]: persistence of key records, with in-memory, redb and
//!   fault-injecting backends
//! - [`SecurityValidator`]: decides whether a key may be used for an operation
//! - [`MessageValidator`]: structural checks on message bodies
//! - [`EncryptionEngine`]: validate → fetch key → transform, and the rotation
//!   state machine
//!
//! # Control Flow
//!
//! ```text
//! caller ─▶ MessageValidator::validate(body)
//!        ─▶ EncryptionEngine::encrypt(caller, conversation, body)
//!              ├─ SecurityValidator::check_membership
//!              ├─ Active key (cache, or KeyRepository::get_active)
//!              ├─ SecurityValidator::check(key, Encrypt)
//!              ├─ reserve nonce counter (rotate once if the key is at its cap)
//!              ├─ seal in place (XChaCha20-Poly1305)
//!              └─ wipe plaintext
//!        ◀─ CiphertextEnvelope
//! ```
//!
//! Decrypt is symmetric, keyed off the version carried in the envelope.
//!
//! # Key State Machine
//!
//! ```text
//! Pending ──▶ Active ──▶ Retiring ──▶ Revoked
//!                │                       ▲
//!                └──── compromise ───────┘
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod audit;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod env;
pub mod error;
pub mod key;
pub mod membership;
pub mod storage;
mod system_env;
pub mod validator;

pub use audit::{AuditEvent, RecordingAudit, SecurityAudit, TracingAudit};
pub use config::{EngineConfig, RetryPolicy, RevokedKeyPolicy};
pub use engine::{EncryptionEngine, RotationTrigger};
pub use env::{Environment, SimEnv};
pub use envelope::{CiphertextEnvelope, EnvelopeError};
pub use error::EngineError;
pub use key::{EncryptionKey, KeyMetadata, KeyState, TransitionError};
pub use keyward_crypto::{KeyMaterial, SecureBuffer};
pub use membership::{Membership, StaticMembership};
pub use storage::{
    ChaoticRepository, KeyRepository, MemoryRepository, RedbRepository, Rotation, StorageError,
};
pub use system_env::SystemEnv;
pub use validator::{
    BodyEncoding, MessageLimits, MessageValidator, Operation, SecurityError, SecurityValidator,
    ValidationError,
};
