//! AEAD key derivation using HKDF

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::secure::{KEY_SIZE, KeyMaterial};

/// Label used for conversation key derivation
const CONVERSATION_KEY_LABEL: &[u8] = b"keywardConversationV1";

/// Derive the AEAD key for one (conversation, version) pair from a stored
/// key secret.
///
/// The returned key zeroes itself on drop.
///
/// # Security
///
/// - Different conversations produce different keys even from one secret
/// - Different versions produce different keys (no cross-version replay)
/// - The conversation id is length-prefixed so `("ab", v)` and `("a", ...)`
///   can never share an info string
/// - Deterministic: same inputs always produce same output
pub fn derive_aead_key(
    secret: &KeyMaterial,
    conversation_id: &str,
    version: u64,
) -> Zeroizing<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, secret.expose());

    // label || len(conversation_id) || conversation_id || version
    let mut info = Vec::with_capacity(CONVERSATION_KEY_LABEL.len() + 4 + conversation_id.len() + 8);
    info.extend_from_slice(CONVERSATION_KEY_LABEL);
    info.extend_from_slice(&(conversation_id.len() as u32).to_be_bytes());
    info.extend_from_slice(conversation_id.as_bytes());
    info.extend_from_slice(&version.to_be_bytes());

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    let Ok(()) = hkdf.expand(&info, key.as_mut_slice()) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(byte: u8) -> KeyMaterial {
        KeyMaterial::generate(|b| b.fill(byte))
    }

    #[test]
    fn derive_is_deterministic() {
        let s = secret(7);
        assert_eq!(*derive_aead_key(&s, "conv-1", 3), *derive_aead_key(&s, "conv-1", 3));
    }

    #[test]
    fn different_versions_produce_different_keys() {
        let s = secret(7);
        assert_ne!(*derive_aead_key(&s, "conv-1", 1), *derive_aead_key(&s, "conv-1", 2));
    }

    #[test]
    fn different_conversations_produce_different_keys() {
        let s = secret(7);
        assert_ne!(*derive_aead_key(&s, "conv-1", 1), *derive_aead_key(&s, "conv-2", 1));
    }

    #[test]
    fn different_secrets_produce_different_keys() {
        assert_ne!(
            *derive_aead_key(&secret(1), "conv-1", 1),
            *derive_aead_key(&secret(2), "conv-1", 1)
        );
    }

    #[test]
    fn derived_key_differs_from_secret() {
        let s = secret(9);
        assert_ne!(&*derive_aead_key(&s, "conv-1", 1), s.expose());
    }
}
