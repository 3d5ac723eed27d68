//! Error types for cryptographic operations

use thiserror::Error;

/// Errors from sealing and opening message bodies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// Nonce has the wrong length for XChaCha20
    #[error("invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength {
        /// Expected nonce length
        expected: usize,
        /// Actual nonce length
        actual: usize,
    },

    /// Integrity tag has the wrong length for Poly1305
    #[error("invalid tag length: expected {expected}, got {actual}")]
    InvalidTagLength {
        /// Expected tag length
        expected: usize,
        /// Actual tag length
        actual: usize,
    },

    /// Tag did not verify: ciphertext, metadata or key do not match
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The cipher refused to encrypt (buffer too large for the primitive)
    #[error("encryption failed: {reason}")]
    EncryptionFailed {
        /// Reason reported for the failure
        reason: String,
    },
}

impl CryptoError {
    /// Returns true if this error means the ciphertext was tampered with or
    /// does not belong to the key.
    ///
    /// Every other variant is a malformed input, which points at a bug
    /// upstream rather than an attack on the message.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed)
    }
}
