//! Keyward Cryptographic Primitives
//!
//! Building blocks for per-conversation message encryption. Functions here are
//! pure: callers supply key material, nonces and random bytes, which keeps
//! every output reproducible under test.
//!
//! # Key Lifecycle
//!
//! Each conversation owns a lineage of versioned 32-byte key secrets. A secret
//! is never handed to the cipher directly. The AEAD key is derived per
//! (conversation, version) so a secret cannot be replayed under another
//! conversation or version.
//!
//! ```text
//! Key Secret (random, per conversation version)
//!        │
//!        ▼
//! HKDF-SHA256 (conversation_id, version) → AEAD Key
//!        │
//!        ▼
//! XChaCha20-Poly1305 (nonce, AAD = conversation_id || version)
//!        │
//!        ▼
//! Ciphertext + detached 16-byte tag
//! ```
//!
//! # Security
//!
//! Confidentiality and integrity:
//! - XChaCha20-Poly1305 AEAD, tag is verified before any plaintext is released
//! - Conversation id and key version are bound as associated data
//!
//! Nonce uniqueness:
//! - Nonce = version || per-key counter || random suffix
//! - The counter never repeats for a cached key, the random suffix covers
//!   counter resets after a restart
//!
//! Memory hygiene:
//! - [`SecureBuffer`] and [`KeyMaterial`] zero themselves on drop
//! - Wipes are verified; a wipe that leaves non-zero bytes aborts the process

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod derivation;
pub mod error;
pub mod secure;

pub use aead::{
    NONCE_RANDOM_SIZE, NONCE_SIZE, TAG_SIZE, associated_data, build_nonce, open_in_place,
    seal_in_place,
};
pub use derivation::derive_aead_key;
pub use error::CryptoError;
pub use secure::{KEY_SIZE, KeyMaterial, SecureBuffer, WipeGuard};
