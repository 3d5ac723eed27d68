//! Fuzz target for CiphertextEnvelope::decode
//!
//! Feeds arbitrary bytes to the envelope decoder:
//! - Malformed CBOR
//! - Wrong field types and missing fields
//! - Length prefixes far larger than the input
//!
//! The decoder should NEVER panic. Anything it accepts must re-encode and
//! decode to the same envelope.

#![no_main]

use keyward_core::CiphertextEnvelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = CiphertextEnvelope::decode(data) else {
        return;
    };

    let encoded = envelope.encode().expect("decoded envelope must re-encode");
    let again = CiphertextEnvelope::decode(&encoded).expect("re-encoded envelope must decode");
    assert_eq!(envelope, again);
});
