//! Ciphertext envelope and its CBOR wire encoding.
//!
//! The envelope is self-describing: it names the conversation and key version
//! it was sealed under, so a receiver can pick the right key without any
//! out-of-band coordination. Both fields are bound into the integrity tag as
//! associated data, so editing either one makes decryption fail. Callers may
//! bind extra context of their own (a message id, a sender) the same way; it
//! travels in the clear next to the ciphertext.

use keyward_crypto::{NONCE_SIZE, TAG_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validator::DEFAULT_MAX_BODY_SIZE;

/// Room for everything but the ciphertext: header fields, nonce, tag and
/// associated data.
pub const ENVELOPE_OVERHEAD: usize = 64 * 1024;

/// Largest encoded envelope accepted by [`CiphertextEnvelope::decode`].
pub const MAX_ENCODED_SIZE: usize = DEFAULT_MAX_BODY_SIZE + ENVELOPE_OVERHEAD;

/// Envelope codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// CBOR encoding failed
    #[error("envelope encoding failed: {0}")]
    Encode(String),

    /// Bytes are not a valid envelope
    #[error("envelope decoding failed: {0}")]
    Decode(String),

    /// Encoded envelope exceeds the decode limit
    #[error("envelope too large: {size} bytes (max {max})")]
    TooLarge {
        /// Encoded size
        size: usize,
        /// Limit
        max: usize,
    },
}

/// Transmissible output of [`EncryptionEngine::encrypt`](crate::EncryptionEngine::encrypt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiphertextEnvelope {
    /// Conversation the message belongs to
    pub conversation_id: String,
    /// Version of the key it was sealed under
    pub key_version: u64,
    /// 24-byte `XChaCha20` nonce
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    /// Encrypted body (same length as the plaintext)
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    /// 16-byte Poly1305 tag
    #[serde(with = "serde_bytes")]
    pub integrity_tag: Vec<u8>,
    /// Caller context authenticated with the body but not encrypted. Empty
    /// unless sealed with
    /// [`encrypt_with_associated_data`](crate::EncryptionEngine::encrypt_with_associated_data).
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "serde_bytes")]
    pub associated_data: Vec<u8>,
}

impl CiphertextEnvelope {
    /// Whether nonce and tag have the lengths the cipher requires.
    ///
    /// A malformed envelope is still decodable; the engine reports it as a
    /// crypto failure rather than a codec error.
    pub fn is_well_formed(&self) -> bool {
        self.nonce.len() == NONCE_SIZE && self.integrity_tag.len() == TAG_SIZE
    }

    /// Encode to CBOR.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut bytes = Vec::with_capacity(self.ciphertext.len() + 128);
        ciborium::into_writer(self, &mut bytes).map_err(|e| EnvelopeError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    /// Decode from CBOR, sized for the default body limit.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Self::decode_with_limit(bytes, DEFAULT_MAX_BODY_SIZE)
    }

    /// Decode from CBOR, accepting bodies up to `max_body_size`.
    ///
    /// Use the same limit the sending engine was configured with, otherwise
    /// large messages it accepted are refused here.
    pub fn decode_with_limit(bytes: &[u8], max_body_size: usize) -> Result<Self, EnvelopeError> {
        let max = max_body_size.saturating_add(ENVELOPE_OVERHEAD);
        if bytes.len() > max {
            return Err(EnvelopeError::TooLarge { size: bytes.len(), max });
        }

        ciborium::from_reader(bytes).map_err(|e| EnvelopeError::Decode(e.to_string()))
    }
}
