//! Fuzz target for decrypt on tampered envelopes
//!
//! Seals a message with arbitrary associated data, applies an arbitrary
//! mutation to one envelope field, and decrypts.
//!
//! # Invariants
//!
//! - decrypt NEVER panics
//! - A mutated envelope never yields plaintext
//! - An unmutated envelope always yields the original plaintext

#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use keyward_core::{
    CiphertextEnvelope, EncryptionEngine, EngineConfig, MemoryRepository, SecureBuffer, SimEnv,
    StaticMembership, validator::MAX_ASSOCIATED_DATA_SIZE,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u64,
    body: Vec<u8>,
    associated_data: Vec<u8>,
    tamper: Tamper,
}

#[derive(Debug, Arbitrary)]
enum Tamper {
    None,
    FlipCiphertext { index: u16, mask: u8 },
    FlipTag { index: u8, mask: u8 },
    FlipNonce { index: u8, mask: u8 },
    ReplaceTag(Vec<u8>),
    ReplaceNonce(Vec<u8>),
    FlipAssociatedData { index: u16, mask: u8 },
    ReplaceAssociatedData(Vec<u8>),
    KeyVersion(u64),
    Truncate(u16),
}

/// Apply the mutation. Returns false if it turned out to be a no-op.
fn apply(envelope: &mut CiphertextEnvelope, tamper: &Tamper) -> bool {
    fn flip(bytes: &mut [u8], index: usize, mask: u8) -> bool {
        if bytes.is_empty() || mask == 0 {
            return false;
        }
        let len = bytes.len();
        bytes[index % len] ^= mask;
        true
    }

    match tamper {
        Tamper::None => false,
        Tamper::FlipCiphertext { index, mask } => {
            flip(&mut envelope.ciphertext, usize::from(*index), *mask)
        },
        Tamper::FlipTag { index, mask } => {
            flip(&mut envelope.integrity_tag, usize::from(*index), *mask)
        },
        Tamper::FlipNonce { index, mask } => flip(&mut envelope.nonce, usize::from(*index), *mask),
        Tamper::ReplaceTag(tag) => {
            let changed = *tag != envelope.integrity_tag;
            envelope.integrity_tag.clone_from(tag);
            changed
        },
        Tamper::ReplaceNonce(nonce) => {
            let changed = *nonce != envelope.nonce;
            envelope.nonce.clone_from(nonce);
            changed
        },
        Tamper::FlipAssociatedData { index, mask } => {
            flip(&mut envelope.associated_data, usize::from(*index), *mask)
        },
        Tamper::ReplaceAssociatedData(associated_data) => {
            let changed = *associated_data != envelope.associated_data;
            envelope.associated_data.clone_from(associated_data);
            changed
        },
        Tamper::KeyVersion(version) => {
            let changed = *version != envelope.key_version;
            envelope.key_version = *version;
            changed
        },
        Tamper::Truncate(len) => {
            let len = usize::from(*len);
            let changed = len < envelope.ciphertext.len();
            envelope.ciphertext.truncate(len);
            changed
        },
    }
}

fuzz_target!(|scenario: Scenario| {
    if scenario.body.is_empty() {
        return;
    }

    let membership = StaticMembership::new();
    membership.set("conv-1", ["alice"]);
    let config = EngineConfig {
        message_limits: keyward_core::MessageLimits {
            encoding: keyward_core::BodyEncoding::Binary,
            ..Default::default()
        },
        ..EngineConfig::default()
    };
    let engine = EncryptionEngine::new(
        MemoryRepository::new(),
        SimEnv::with_seed(scenario.seed),
        Arc::new(membership),
        config,
    );
    engine.rotate_key("conv-1").expect("provisioning in memory cannot fail");

    let limit = scenario.associated_data.len().min(MAX_ASSOCIATED_DATA_SIZE);
    let associated_data = &scenario.associated_data[..limit];

    let mut plaintext = SecureBuffer::from_slice(&scenario.body);
    let mut envelope = engine
        .encrypt_with_associated_data("alice", "conv-1", &mut plaintext, associated_data)
        .expect("encrypt");

    let tampered = apply(&mut envelope, &scenario.tamper);

    match engine.decrypt("alice", "conv-1", &envelope) {
        Ok(opened) => {
            assert!(!tampered, "tampered envelope decrypted: {:?}", scenario.tamper);
            assert_eq!(opened.as_slice(), scenario.body.as_slice());
        },
        Err(e) => assert!(tampered, "untouched envelope failed: {e}"),
    }
});
