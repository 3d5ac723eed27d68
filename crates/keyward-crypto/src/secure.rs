//! Secure memory for key and plaintext material.
//!
//! Every buffer that holds a key secret or a message body goes through one of
//! the types here. They zero their contents on drop and expose an explicit
//! [`SecureBuffer::wipe`] for scoped cleanup while the buffer is still owned.
//!
//! A wipe is verified after it runs. If the bytes are not all zero afterwards
//! the process aborts: a secret left in memory cannot be recovered from at any
//! higher layer.

use std::{
    fmt,
    ops::{Deref, DerefMut},
};

use zeroize::Zeroize;

use crate::error::CryptoError;

/// Length of every conversation key secret (XChaCha20-Poly1305 key size).
pub const KEY_SIZE: usize = 32;

/// Heap buffer for plaintext or in-flight ciphertext that zeroes on drop.
///
/// Length is preserved by [`wipe`](Self::wipe) so callers can inspect the
/// zeroed region afterwards. Dropping zeroes the whole allocation.
#[derive(Default)]
pub struct SecureBuffer {
    bytes: Vec<u8>,
}

impl SecureBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Take ownership of an existing vector.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Copy a slice into a new exactly-sized buffer.
    ///
    /// Capacity equals the slice length so the copy never reallocates and
    /// leaves no stray plaintext behind.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buffer = Vec::with_capacity(bytes.len());
        buffer.extend_from_slice(bytes);
        Self { bytes: buffer }
    }

    /// Number of bytes held.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read-only view of the contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable view of the contents (used for in-place AEAD).
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Zero every byte in place, keeping the length.
    ///
    /// Aborts the process if the bytes are still non-zero afterwards.
    pub fn wipe(&mut self) {
        self.bytes.as_mut_slice().zeroize();
        if !self.is_wiped() {
            wipe_failed("secure buffer");
        }
    }

    /// True if every byte is zero.
    pub fn is_wiped(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    /// Guard that wipes this buffer when it goes out of scope.
    ///
    /// Covers every exit path of the holding function, including `?` returns
    /// and unwinding.
    pub fn wipe_on_drop(&mut self) -> WipeGuard<'_> {
        WipeGuard { buffer: self }
    }

    /// Move the bytes out without zeroing them.
    ///
    /// Only for data that is safe to release, such as ciphertext produced by
    /// an in-place seal.
    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl Deref for SecureBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for SecureBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for SecureBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_vec(bytes)
    }
}

impl From<&[u8]> for SecureBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self::from_slice(bytes)
    }
}

impl From<&str> for SecureBuffer {
    fn from(text: &str) -> Self {
        Self::from_slice(text.as_bytes())
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBuffer([REDACTED; {} bytes])", self.bytes.len())
    }
}

/// Scope guard returned by [`SecureBuffer::wipe_on_drop`].
pub struct WipeGuard<'a> {
    buffer: &'a mut SecureBuffer,
}

impl Deref for WipeGuard<'_> {
    type Target = SecureBuffer;

    fn deref(&self) -> &SecureBuffer {
        self.buffer
    }
}

impl DerefMut for WipeGuard<'_> {
    fn deref_mut(&mut self) -> &mut SecureBuffer {
        self.buffer
    }
}

impl Drop for WipeGuard<'_> {
    fn drop(&mut self) {
        self.buffer.wipe();
    }
}

/// A 32-byte conversation key secret.
///
/// Never printed, zeroed on drop. Bytes are only reachable through
/// [`expose`](Self::expose), which exists for the engine and for storage
/// adapters that must persist the secret.
#[derive(Clone)]
pub struct KeyMaterial {
    bytes: [u8; KEY_SIZE],
}

impl KeyMaterial {
    /// Generate a secret by letting `fill` write directly into the key storage.
    ///
    /// No intermediate copy of the secret exists. `fill` MUST be a
    /// cryptographically secure source in production.
    pub fn generate(fill: impl FnOnce(&mut [u8])) -> Self {
        let mut material = Self { bytes: [0u8; KEY_SIZE] };
        fill(&mut material.bytes);
        material
    }

    /// Rebuild a secret from persisted bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: bytes.len() });
        }

        let mut material = Self { bytes: [0u8; KEY_SIZE] };
        material.bytes.copy_from_slice(bytes);
        Ok(material)
    }

    /// Raw secret bytes.
    pub fn expose(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Zero the secret in place.
    pub fn wipe(&mut self) {
        self.bytes.zeroize();
        if !self.is_wiped() {
            wipe_failed("key material");
        }
    }

    /// True if every byte of the secret is zero.
    pub fn is_wiped(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        // Not constant time. Only used by tests and storage round-trip checks.
        self.bytes == other.bytes
    }
}

impl Eq for KeyMaterial {}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial([REDACTED])")
    }
}

#[cold]
fn wipe_failed(what: &'static str) -> ! {
    tracing::error!(what, "secure wipe left non-zero bytes, aborting");
    std::process::abort()
}
