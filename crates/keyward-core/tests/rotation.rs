//! Rotation, revocation and grace-period behavior through the public engine
//! API.

mod common;

use std::{collections::HashSet, thread, time::Duration};

use common::Harness;
use keyward_core::{
    AuditEvent, EngineConfig, EngineError, KeyRepository, KeyState, RedbRepository,
    RotationTrigger, SecureBuffer, SimEnv,
};
use keyward_crypto::{CryptoError, open_in_place};

#[test]
fn encrypt_after_rotation_uses_new_version() {
    let h = Harness::new(1);
    h.conversation("conv-1", &["alice", "bob"]);

    let before = h.engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("one")).unwrap();
    assert_eq!(h.engine.rotate_key("conv-1").unwrap(), 2);
    let after = h.engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("two")).unwrap();

    assert_eq!(before.key_version, 1);
    assert_eq!(after.key_version, 2);

    // Backlog under the Retiring key still opens.
    assert_eq!(h.engine.decrypt("bob", "conv-1", &before).unwrap().as_slice(), b"one");
    assert_eq!(h.engine.decrypt("bob", "conv-1", &after).unwrap().as_slice(), b"two");
}

#[test]
fn compromised_key_never_decrypts_again() {
    let h = Harness::new(2);
    h.conversation("conv-1", &["alice"]);
    let envelope = h.engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("secret")).unwrap();

    assert_eq!(h.engine.handle_trigger("conv-1", &RotationTrigger::SuspectedCompromise).unwrap(), 2);

    assert_eq!(
        h.engine.decrypt("alice", "conv-1", &envelope).unwrap_err(),
        EngineError::KeyRevoked { conversation_id: "conv-1".into(), version: 1 }
    );

    let record = h.engine.repository().get_by_version("conv-1", 1).unwrap();
    assert_eq!(record.state(), KeyState::Revoked);
    assert!(record.is_tombstoned());

    assert_eq!(
        h.audit.events(),
        vec![AuditEvent::KeyCompromised {
            conversation_id: "conv-1".into(),
            revoked_version: 1,
            new_version: 2,
        }]
    );
}

#[test]
fn removed_participant_is_locked_out_of_new_messages() {
    let h = Harness::new(3);
    h.conversation("conv-1", &["alice", "bob"]);

    // Material bob could have held before removal.
    let old = h.engine.repository().get_active("conv-1").unwrap();
    let old_material = old.material().unwrap().clone();

    assert!(h.membership.remove("conv-1", "bob"));
    let trigger = RotationTrigger::ParticipantRemoved { participant: "bob".into() };
    assert_eq!(h.engine.handle_trigger("conv-1", &trigger).unwrap(), 2);

    let envelope = h.engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("after")).unwrap();
    assert_eq!(envelope.key_version, 2);

    assert_eq!(
        h.engine.decrypt("bob", "conv-1", &envelope).unwrap_err(),
        EngineError::MembershipMismatch {
            conversation_id: "conv-1".into(),
            participant: "bob".into(),
        }
    );
    assert_eq!(
        h.audit.events(),
        vec![AuditEvent::MembershipMismatch {
            conversation_id: "conv-1".into(),
            participant: "bob".into(),
        }]
    );

    // Even bypassing the engine, the old secret cannot open the new envelope.
    let mut buffer = SecureBuffer::from_slice(&envelope.ciphertext);
    let result = open_in_place(
        &old_material,
        "conv-1",
        envelope.key_version,
        &envelope.nonce,
        &envelope.integrity_tag,
        &envelope.associated_data,
        &mut buffer,
    );
    assert_eq!(result, Err(CryptoError::AuthenticationFailed));
    assert!(buffer.is_wiped());
}

#[test]
fn backlog_stays_readable_by_remaining_members_after_removal() {
    let h = Harness::new(19);
    h.conversation("conv-1", &["alice", "bob", "carol"]);
    let backlog = h.engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("old")).unwrap();

    assert!(h.membership.remove("conv-1", "bob"));
    let trigger = RotationTrigger::ParticipantRemoved { participant: "bob".into() };
    h.engine.handle_trigger("conv-1", &trigger).unwrap();

    assert_eq!(h.engine.decrypt("carol", "conv-1", &backlog).unwrap().as_slice(), b"old");

    h.env.advance(EngineConfig::DEFAULT_GRACE_PERIOD);
    assert!(matches!(
        h.engine.decrypt("carol", "conv-1", &backlog),
        Err(EngineError::KeyExpired { version: 1, .. })
    ));
}

#[test]
fn retiring_key_expires_then_sweeps_to_revoked() {
    let h = Harness::new(4);
    h.conversation("conv-1", &["alice"]);
    let backlog = h.engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("late")).unwrap();
    h.engine.rotate_key("conv-1").unwrap();

    let grace = h.engine.config().grace_period;
    let deadline = SimEnv::START_SECS + grace.as_secs();

    // Inside the grace period
    h.env.advance(grace - Duration::from_secs(1));
    assert!(h.engine.decrypt("alice", "conv-1", &backlog).is_ok());
    assert_eq!(h.engine.sweep("conv-1").unwrap(), 0);

    // At the deadline
    h.env.advance(Duration::from_secs(1));
    assert_eq!(
        h.engine.decrypt("alice", "conv-1", &backlog).unwrap_err(),
        EngineError::KeyExpired { conversation_id: "conv-1".into(), version: 1, deadline }
    );

    assert_eq!(h.engine.sweep_all().unwrap(), 1);
    assert_eq!(
        h.engine.decrypt("alice", "conv-1", &backlog).unwrap_err(),
        EngineError::KeyRevoked { conversation_id: "conv-1".into(), version: 1 }
    );

    // The Active key is unaffected.
    let fresh = h.engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("now")).unwrap();
    assert_eq!(h.engine.decrypt("alice", "conv-1", &fresh).unwrap().as_slice(), b"now");
}

#[test]
fn scheduled_rotation_after_interval() {
    let h = Harness::new(5);
    h.conversation("conv-1", &["alice"]);

    assert_eq!(h.engine.rotate_if_due("conv-1").unwrap(), None);

    h.env.advance(h.engine.config().rotation_interval);
    assert_eq!(h.engine.rotation_due("conv-1").unwrap(), Some(RotationTrigger::Scheduled));
    assert_eq!(h.engine.rotate_if_due("conv-1").unwrap(), Some(2));
    assert_eq!(h.engine.rotate_if_due("conv-1").unwrap(), None);
}

#[test]
fn message_cap_triggers_rotation() {
    let config = EngineConfig { max_messages_per_key: 3, ..EngineConfig::default() };
    let h = Harness::with_config(6, config);
    h.conversation("conv-1", &["alice"]);

    for _ in 0..3 {
        h.engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("m")).unwrap();
    }

    assert_eq!(h.engine.rotate_if_due("conv-1").unwrap(), Some(2));
    let retired = h.engine.repository().get_by_version("conv-1", 1).unwrap();
    assert_eq!(retired.metadata().messages_encrypted, 3);
}

#[test]
fn encrypt_never_exceeds_message_cap() {
    const CAP: u64 = 2;
    let config = EngineConfig { max_messages_per_key: CAP, ..EngineConfig::default() };
    let h = Harness::with_config(16, config);
    h.conversation("conv-1", &["alice", "bob"]);

    let envelopes: Vec<_> = (0..5)
        .map(|i| {
            let mut body = SecureBuffer::from(format!("m{i}").as_str());
            h.engine.encrypt("alice", "conv-1", &mut body).unwrap()
        })
        .collect();

    let versions: Vec<u64> = envelopes.iter().map(|e| e.key_version).collect();
    assert_eq!(versions, vec![1, 1, 2, 2, 3]);
    for version in 1..=2 {
        let key = h.engine.repository().get_by_version("conv-1", version).unwrap();
        assert!(key.metadata().messages_encrypted <= CAP);
    }

    // Backlog under the keys retired at the cap still opens.
    for (i, envelope) in envelopes.iter().enumerate() {
        let plaintext = h.engine.decrypt("bob", "conv-1", envelope).unwrap();
        assert_eq!(plaintext.as_slice(), format!("m{i}").as_bytes());
    }
}

#[test]
fn message_cap_holds_across_restart() {
    let config = EngineConfig { max_messages_per_key: 3, ..EngineConfig::default() };
    let h = Harness::with_config(17, config.clone());
    h.conversation("conv-1", &["alice"]);

    for _ in 0..2 {
        h.engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("m")).unwrap();
    }
    assert_eq!(h.engine.rotation_due("conv-1").unwrap(), None);

    let restarted = Harness::with(h.engine.repository().clone(), 18, config);
    restarted.membership.set("conv-1", ["alice"]);

    // The first process may have sealed up to its reservation, so the
    // restarted one treats the key as spent.
    assert_eq!(
        restarted.engine.rotation_due("conv-1").unwrap(),
        Some(RotationTrigger::Scheduled)
    );

    let envelope =
        restarted.engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("m")).unwrap();
    assert_eq!(envelope.key_version, 2);
    let retired = h.engine.repository().get_by_version("conv-1", 1).unwrap();
    assert_eq!(retired.state(), KeyState::Retiring);
}

#[test]
fn concurrent_encrypts_survive_rotation() {
    const WRITERS: usize = 4;
    const MESSAGES: usize = 250;
    const ROTATIONS: u64 = 25;

    let h = Harness::new(7);
    h.conversation("conv-1", &["alice", "bob"]);

    let envelopes = thread::scope(|s| {
        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let engine = &h.engine;
                s.spawn(move || {
                    (0..MESSAGES)
                        .map(|i| {
                            let mut body = SecureBuffer::from(format!("w{w}-{i}").as_str());
                            engine.encrypt("alice", "conv-1", &mut body).unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        s.spawn(|| {
            for _ in 0..ROTATIONS {
                h.engine.rotate_key("conv-1").unwrap();
                thread::yield_now();
            }
        });

        writers.into_iter().flat_map(|w| w.join().unwrap()).collect::<Vec<_>>()
    });

    assert_eq!(envelopes.len(), WRITERS * MESSAGES);
    assert_eq!(h.engine.repository().get_active("conv-1").unwrap().version(), ROTATIONS + 1);

    let nonces: HashSet<_> = envelopes.iter().map(|e| e.nonce.clone()).collect();
    assert_eq!(nonces.len(), envelopes.len());

    for envelope in &envelopes {
        assert!(h.engine.decrypt("bob", "conv-1", envelope).is_ok());
    }

    // Demote the last key too, so every count is persisted.
    h.engine.rotate_key("conv-1").unwrap();
    let persisted: u64 = (1..=ROTATIONS + 1)
        .map(|v| {
            h.engine.repository().get_by_version("conv-1", v).unwrap().metadata().messages_encrypted
        })
        .sum();
    assert_eq!(persisted, (WRITERS * MESSAGES) as u64);
}

#[test]
fn redb_backed_engine_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.redb");

    let (old, new) = {
        let h = Harness::with(RedbRepository::open(&path).unwrap(), 8, EngineConfig::default());
        h.conversation("conv-1", &["alice"]);
        let old = h.engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("before")).unwrap();
        h.engine.rotate_key("conv-1").unwrap();
        let new = h.engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("after")).unwrap();
        (old, new)
    };

    let h = Harness::with(RedbRepository::open(&path).unwrap(), 9, EngineConfig::default());
    h.membership.set("conv-1", ["alice"]);

    assert_eq!(h.engine.cached_version("conv-1"), None);
    assert_eq!(h.engine.decrypt("alice", "conv-1", &old).unwrap().as_slice(), b"before");
    assert_eq!(h.engine.decrypt("alice", "conv-1", &new).unwrap().as_slice(), b"after");

    let retired = h.engine.repository().get_by_version("conv-1", 1).unwrap();
    assert_eq!(retired.state(), KeyState::Retiring);
    assert_eq!(retired.metadata().messages_encrypted, 1);

    let next = h.engine.encrypt("alice", "conv-1", &mut SecureBuffer::from("again")).unwrap();
    assert_eq!(next.key_version, 2);
    assert_ne!(next.nonce[8..16], new.nonce[8..16]);
}
