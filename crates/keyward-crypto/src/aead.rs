//! Message body encryption using `XChaCha20-Poly1305`
//!
//! All functions are pure - nonces and random bytes must be provided by the
//! caller. Sealing and opening work in place on a [`SecureBuffer`] so the
//! plaintext never exists in more than one allocation.

use chacha20poly1305::{
    Tag, XChaCha20Poly1305, XNonce,
    aead::{AeadInPlace, KeyInit},
};

use crate::{
    derivation::derive_aead_key,
    error::CryptoError,
    secure::{KeyMaterial, SecureBuffer},
};

/// Size of the `XChaCha20` nonce (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Size of the random suffix in the nonce (8 bytes)
pub const NONCE_RANDOM_SIZE: usize = 8;

/// Poly1305 tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Build a 24-byte nonce for `XChaCha20`.
///
/// Structure:
/// - bytes 0-7: key version (big-endian)
/// - bytes 8-15: per-key message counter (big-endian)
/// - bytes 16-23: random suffix (caller-provided)
pub fn build_nonce(
    version: u64,
    counter: u64,
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];

    nonce[0..8].copy_from_slice(&version.to_be_bytes());
    nonce[8..16].copy_from_slice(&counter.to_be_bytes());
    nonce[16..24].copy_from_slice(&random_suffix);

    nonce
}

/// Associated data bound into every tag: `len(conversation_id) ||
/// conversation_id || version || extra`.
///
/// `extra` is caller-supplied context (message id, sender, headers). It goes
/// last so the fixed-layout prefix stays unambiguous.
pub fn associated_data(conversation_id: &str, version: u64, extra: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(4 + conversation_id.len() + 8 + extra.len());
    aad.extend_from_slice(&(conversation_id.len() as u32).to_be_bytes());
    aad.extend_from_slice(conversation_id.as_bytes());
    aad.extend_from_slice(&version.to_be_bytes());
    aad.extend_from_slice(extra);
    aad
}

/// Encrypt `buffer` in place and return the detached integrity tag.
///
/// On success `buffer` holds the ciphertext (same length as the plaintext).
/// On failure the buffer is wiped before returning. `extra_aad` is
/// authenticated but not encrypted; the same bytes must be passed to
/// [`open_in_place`].
///
/// # Security
///
/// - Caller MUST never reuse `nonce` with the same (secret, conversation,
///   version)
/// - The derived AEAD key is zeroed before this function returns
pub fn seal_in_place(
    secret: &KeyMaterial,
    conversation_id: &str,
    version: u64,
    nonce: &[u8; NONCE_SIZE],
    extra_aad: &[u8],
    buffer: &mut SecureBuffer,
) -> Result<[u8; TAG_SIZE], CryptoError> {
    let key = derive_aead_key(secret, conversation_id, version);
    let cipher = XChaCha20Poly1305::new((&*key).into());
    let aad = associated_data(conversation_id, version, extra_aad);

    match cipher.encrypt_in_place_detached(XNonce::from_slice(nonce), &aad, buffer.as_mut_slice()) {
        Ok(tag) => {
            let mut out = [0u8; TAG_SIZE];
            out.copy_from_slice(tag.as_slice());
            Ok(out)
        },
        Err(_) => {
            buffer.wipe();
            Err(CryptoError::EncryptionFailed { reason: "plaintext too large for cipher".into() })
        },
    }
}

/// Verify the tag and decrypt `buffer` in place.
///
/// On success `buffer` holds the plaintext. On any failure the buffer is
/// wiped, so no partial plaintext is ever observable.
///
/// # Errors
///
/// - `InvalidNonceLength` / `InvalidTagLength`: malformed envelope fields
/// - `AuthenticationFailed`: tag mismatch (tamper, wrong key, wrong metadata
///   or associated data)
pub fn open_in_place(
    secret: &KeyMaterial,
    conversation_id: &str,
    version: u64,
    nonce: &[u8],
    tag: &[u8],
    extra_aad: &[u8],
    buffer: &mut SecureBuffer,
) -> Result<(), CryptoError> {
    if nonce.len() != NONCE_SIZE {
        buffer.wipe();
        return Err(CryptoError::InvalidNonceLength { expected: NONCE_SIZE, actual: nonce.len() });
    }
    if tag.len() != TAG_SIZE {
        buffer.wipe();
        return Err(CryptoError::InvalidTagLength { expected: TAG_SIZE, actual: tag.len() });
    }

    let key = derive_aead_key(secret, conversation_id, version);
    let cipher = XChaCha20Poly1305::new((&*key).into());
    let aad = associated_data(conversation_id, version, extra_aad);

    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(nonce),
            &aad,
            buffer.as_mut_slice(),
            Tag::from_slice(tag),
        )
        .map_err(|_| {
            buffer.wipe();
            CryptoError::AuthenticationFailed
        })
}
