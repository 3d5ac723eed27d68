//! Engine configuration and the caller-side retry policy.
//!
//! Configuration is plain data with conservative defaults. Loading it from
//! files or the environment is left to the embedding service.

use std::time::Duration;

use crate::{error::EngineError, validator::MessageLimits};

/// What happens to a key record once it is Revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevokedKeyPolicy {
    /// Keep the metadata, drop the secret. Lookups report `KeyRevoked`.
    #[default]
    Tombstone,
    /// Remove the record entirely. Lookups report `KeyNotFound`.
    Destroy,
}

/// Tunables for [`EncryptionEngine`](crate::EncryptionEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a Retiring key keeps decrypting backlog
    pub grace_period: Duration,
    /// Age after which the Active key is due for scheduled rotation
    pub rotation_interval: Duration,
    /// Messages after which the Active key is due for rotation
    pub max_messages_per_key: u64,
    /// Body limits enforced before encryption
    pub message_limits: MessageLimits,
    /// Fate of Revoked records
    pub revoked_key_policy: RevokedKeyPolicy,
}

impl EngineConfig {
    /// Default grace period (7 days)
    pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    /// Default rotation interval (24 hours)
    pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

    /// Default per-key message cap
    pub const DEFAULT_MAX_MESSAGES_PER_KEY: u64 = 10_000;
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grace_period: Self::DEFAULT_GRACE_PERIOD,
            rotation_interval: Self::DEFAULT_ROTATION_INTERVAL,
            max_messages_per_key: Self::DEFAULT_MAX_MESSAGES_PER_KEY,
            message_limits: MessageLimits::default(),
            revoked_key_policy: RevokedKeyPolicy::default(),
        }
    }
}

/// Exponential backoff for callers retrying transient failures.
///
/// The engine never retries internally. A caller that gets an error with
/// [`EngineError::is_transient`] set may consult this policy:
///
/// ```
/// # use keyward_core::RetryPolicy;
/// let policy = RetryPolicy::default();
/// let mut attempt = 1;
/// while let Some(delay) = policy.backoff(attempt) {
///     // sleep(delay), then retry
///     # let _ = delay;
///     attempt += 1;
/// }
/// assert_eq!(attempt, policy.max_attempts);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, after `attempt` attempts have failed.
    ///
    /// Doubles per attempt, capped at `max_backoff`. `None` once the budget
    /// is spent.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }

        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.initial_backoff.saturating_mul(factor).min(self.max_backoff))
    }

    /// Whether `error` is worth another attempt after `attempt` failures.
    pub fn should_retry(&self, error: &EngineError, attempt: u32) -> bool {
        error.is_transient() && self.backoff(attempt).is_some()
    }
}
