//! Per-identity exponential backoff.

use std::collections::HashMap;
use std::time::Duration;

use crate::model::ResourceKey;

/// Default first retry delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default ceiling as a multiple of the base delay.
pub const DEFAULT_MAX_FACTOR: u32 = 1000;

/// `delay = min(max, base * 2^failures)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::with_base(DEFAULT_BASE_DELAY)
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Base delay with the default `1000 x base` ceiling.
    pub fn with_base(base: Duration) -> Self {
        Self::new(base, base.saturating_mul(DEFAULT_MAX_FACTOR))
    }

    /// Delay for an identity that has already failed `failures` times.
    pub fn delay_for(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Failure counters keyed by identity.
#[derive(Debug, Default)]
pub(crate) struct FailureTracker {
    policy: BackoffPolicy,
    failures: HashMap<ResourceKey, u32>,
}

impl FailureTracker {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: HashMap::new(),
        }
    }

    /// Next delay for `key`; records one more failure.
    pub(crate) fn when(&mut self, key: &ResourceKey) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let delay = self.policy.delay_for(*failures);
        *failures = failures.saturating_add(1);
        delay
    }

    pub(crate) fn forget(&mut self, key: &ResourceKey) {
        self.failures.remove(key);
    }

    pub(crate) fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    pub(crate) fn policy(&self) -> BackoffPolicy {
        self.policy
    }
}
