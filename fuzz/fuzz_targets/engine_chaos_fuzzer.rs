//! Fuzz target for the engine under storage failures
//!
//! Drives rotations, compromises, encrypts and sweeps against a
//! ChaoticRepository with a fuzzer-chosen failure rate.
//!
//! # Invariants
//!
//! - The engine NEVER panics on storage errors
//! - Storage errors surface as transient `Err`, not corruption
//! - At most one Active key per conversation
//! - An envelope that was handed out never fails its integrity check

#![no_main]

use std::{sync::Arc, time::Duration};

use arbitrary::Arbitrary;
use keyward_core::{
    ChaoticRepository, EncryptionEngine, EngineConfig, EngineError, KeyRepository, KeyState,
    MemoryRepository, RecordingAudit, RevokedKeyPolicy, SecureBuffer, SimEnv, StaticMembership,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct ChaosScenario {
    /// Seed for key generation and nonces
    seed: u64,
    /// Seed for the ChaoticRepository RNG
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    /// Destroy revoked keys instead of tombstoning them
    destroy: bool,
    operations: Vec<ChaosOperation>,
}

#[derive(Debug, Arbitrary)]
enum ChaosOperation {
    Rotate,
    Compromise,
    RevokeVersion(u8),
    Encrypt(Vec<u8>),
    DecryptLast,
    Sweep,
    AdvanceHours(u8),
}

fuzz_target!(|scenario: ChaosScenario| {
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;
    let repository =
        ChaoticRepository::with_seed(MemoryRepository::new(), failure_rate, scenario.chaos_seed);

    let membership = StaticMembership::new();
    membership.set("conv-1", ["alice"]);
    let env = SimEnv::with_seed(scenario.seed);
    let audit = Arc::new(RecordingAudit::new());
    let config = EngineConfig {
        revoked_key_policy: if scenario.destroy {
            RevokedKeyPolicy::Destroy
        } else {
            RevokedKeyPolicy::Tombstone
        },
        message_limits: keyward_core::MessageLimits {
            encoding: keyward_core::BodyEncoding::Binary,
            ..Default::default()
        },
        ..EngineConfig::default()
    };
    let engine = EncryptionEngine::new(repository, env.clone(), Arc::new(membership), config)
        .with_audit(audit.clone());

    let mut last = None;

    for op in scenario.operations.iter().take(256) {
        let result = match op {
            ChaosOperation::Rotate => engine.rotate_key("conv-1").map(drop),
            ChaosOperation::Compromise => engine.revoke_and_rotate("conv-1").map(drop),
            ChaosOperation::RevokeVersion(v) => engine.revoke_version("conv-1", u64::from(*v)),
            ChaosOperation::Encrypt(body) => {
                engine.encrypt("alice", "conv-1", &mut SecureBuffer::from_slice(body)).map(|e| {
                    last = Some(e);
                })
            },
            ChaosOperation::DecryptLast => match &last {
                Some(envelope) => engine.decrypt("alice", "conv-1", envelope).map(drop),
                None => Ok(()),
            },
            ChaosOperation::Sweep => engine.sweep("conv-1").map(drop),
            ChaosOperation::AdvanceHours(h) => {
                env.advance(Duration::from_secs(u64::from(*h) * 3600));
                Ok(())
            },
        };

        if let Err(e) = result {
            assert!(
                !matches!(e, EngineError::IntegrityFailure { .. } | EngineError::CryptoFailure(_)),
                "{op:?} corrupted state: {e}"
            );
        }

        let inner = engine.repository().inner();
        if let Ok(Some(latest)) = inner.latest_version("conv-1") {
            let active = (1..=latest)
                .filter_map(|v| inner.get_by_version("conv-1", v).ok())
                .filter(|key| key.state() == KeyState::Active)
                .count();
            assert!(active <= 1, "{active} Active keys");
        }
    }

    assert!(audit.events().iter().all(|event| {
        !matches!(event, keyward_core::AuditEvent::IntegrityFailure { .. })
    }));
});
