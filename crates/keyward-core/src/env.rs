//! Environment abstraction for deterministic testing.
//!
//! Decouples key lifecycle logic from system resources (time, randomness).
//! Enables deterministic simulation (manual clock, seeded RNG) and production
//! use with real system resources.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Abstract environment providing wall-clock time and randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion)
pub trait Environment: Clone + Send + Sync + 'static {
    /// Seconds since the Unix epoch.
    ///
    /// Used for key timestamps and grace deadlines, which are persisted and
    /// must survive restarts.
    fn wall_clock_secs(&self) -> u64;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    /// - Uses cryptographically secure RNG
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u128`.
    ///
    /// Used for key identifiers.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }
}

/// Deterministic environment for tests and simulation.
///
/// Randomness comes from a seeded `ChaCha20` stream and time only moves when
/// [`advance`](Self::advance) is called. Clones share both, so a test can hold
/// one handle and move the clock under an engine holding another.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
    clock_secs: Arc<AtomicU64>,
}

impl SimEnv {
    /// Default start time (2023-11-14T22:13:20Z).
    pub const START_SECS: u64 = 1_700_000_000;

    /// Create an environment from a seed, starting at [`Self::START_SECS`].
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            clock_secs: Arc::new(AtomicU64::new(Self::START_SECS)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.clock_secs.fetch_add(duration.as_secs(), Ordering::SeqCst);
    }

    /// Set the clock. Time never moves backwards, earlier values are ignored.
    pub fn set_time(&self, secs: u64) {
        self.clock_secs.fetch_max(secs, Ordering::SeqCst);
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl Environment for SimEnv {
    fn wall_clock_secs(&self) -> u64 {
        self.clock_secs.load(Ordering::SeqCst)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}
