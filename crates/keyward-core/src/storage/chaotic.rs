//! Chaotic repository wrapper for fault injection testing
//!
//! Repository wrapper that randomly fails operations to test error handling
//! and recovery. Failures are injected before delegating, so a failed call
//! never leaves a partial write behind.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use super::{KeyRepository, Rotation, StorageError};
use crate::key::EncryptionKey;

/// Chaotic repository wrapper that randomly injects failures
///
/// Delegates to an underlying repository but fails operations with
/// `StorageError::Io` at the configured rate. Uses Arc<Mutex<>> for the RNG
/// state, making it Clone and thread-safe.
#[derive(Clone)]
pub struct ChaoticRepository<R: KeyRepository> {
    inner: R,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Operation counter
    operation_count: Arc<AtomicUsize>,
}

/// Simple deterministic RNG for chaos injection
///
/// Linear congruential generator, so chaos runs are reproducible from a seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<R: KeyRepository> ChaoticRepository<R> {
    /// Create a chaotic wrapper with a fixed default seed
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: R, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: R, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying repository (for checking invariants after chaos).
    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Total number of repository operations attempted, failed ones included.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Count the operation and decide whether it fails.
    fn inject(&self, operation: &'static str) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        #[allow(clippy::expect_used)]
        let fail = self.rng.lock().expect("ChaoticRng mutex poisoned").next() < self.failure_rate;

        if fail {
            tracing::debug!(operation, "injecting storage failure");
            return Err(StorageError::Io(format!("chaotic failure injection: {operation}")));
        }
        Ok(())
    }
}

impl<R: KeyRepository> KeyRepository for ChaoticRepository<R> {
    fn get_active(&self, conversation_id: &str) -> Result<EncryptionKey, StorageError> {
        self.inject("get_active")?;
        self.inner.get_active(conversation_id)
    }

    fn get_by_version(
        &self,
        conversation_id: &str,
        version: u64,
    ) -> Result<EncryptionKey, StorageError> {
        self.inject("get_by_version")?;
        self.inner.get_by_version(conversation_id, version)
    }

    fn save(&self, key: &EncryptionKey) -> Result<(), StorageError> {
        self.inject("save")?;
        self.inner.save(key)
    }

    fn list_retiring(&self, conversation_id: &str) -> Result<Vec<EncryptionKey>, StorageError> {
        self.inject("list_retiring")?;
        self.inner.list_retiring(conversation_id)
    }

    fn commit_rotation(&self, rotation: &Rotation) -> Result<(), StorageError> {
        self.inject("commit_rotation")?;
        self.inner.commit_rotation(rotation)
    }

    fn latest_version(&self, conversation_id: &str) -> Result<Option<u64>, StorageError> {
        self.inject("latest_version")?;
        self.inner.latest_version(conversation_id)
    }

    fn purge(&self, conversation_id: &str, version: u64) -> Result<(), StorageError> {
        self.inject("purge")?;
        self.inner.purge(conversation_id, version)
    }

    fn list_conversations(&self) -> Result<Vec<String>, StorageError> {
        self.inject("list_conversations")?;
        self.inner.list_conversations()
    }
}
