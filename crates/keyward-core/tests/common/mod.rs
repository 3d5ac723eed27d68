//! Shared fixtures for keyward-core integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use keyward_core::{
    EncryptionEngine, EngineConfig, KeyRepository, MemoryRepository, RecordingAudit, SimEnv,
    StaticMembership,
};

/// Install a tracing subscriber once per test binary. Honors `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Engine plus handles on every collaborator a test may want to poke.
pub struct Harness<R: KeyRepository = MemoryRepository> {
    pub engine: EncryptionEngine<R, SimEnv>,
    pub env: SimEnv,
    pub membership: StaticMembership,
    pub audit: Arc<RecordingAudit>,
}

impl Harness<MemoryRepository> {
    /// In-memory engine with default config.
    pub fn new(seed: u64) -> Self {
        Self::with(MemoryRepository::new(), seed, EngineConfig::default())
    }

    /// In-memory engine with a custom config.
    pub fn with_config(seed: u64, config: EngineConfig) -> Self {
        Self::with(MemoryRepository::new(), seed, config)
    }
}

impl<R: KeyRepository> Harness<R> {
    /// Engine over any repository.
    pub fn with(repository: R, seed: u64, config: EngineConfig) -> Self {
        init_tracing();

        let env = SimEnv::with_seed(seed);
        let membership = StaticMembership::new();
        let audit = Arc::new(RecordingAudit::new());

        let engine =
            EncryptionEngine::new(repository, env.clone(), Arc::new(membership.clone()), config)
                .with_audit(audit.clone());

        Self { engine, env, membership, audit }
    }

    /// Register participants for a conversation and provision its first key.
    pub fn conversation(&self, conversation_id: &str, participants: &[&str]) -> u64 {
        self.membership.set(conversation_id, participants.iter().copied());
        self.engine.rotate_key(conversation_id).unwrap()
    }
}
