//! Retry policy with exponential backoff
//!
//! The delay before attempt `k + 1` (after `k` failures) is
//! `min(base * 2^(k-1), max_delay) * (1 ± jitter)`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts before giving up.
    ///
    /// Default: 3 attempts
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff (in milliseconds).
    ///
    /// Default: 1000 milliseconds
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay (in milliseconds).
    ///
    /// Default: 300000 milliseconds (5 minutes)
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// Delays are randomized within ±`jitter_factor`.
    ///
    /// Default: 0.0 (exact delays)
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to apply after the `attempt`-th failure (1-indexed)
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = if exponent >= 63 {
            self.max_delay_ms
        } else {
            self.base_delay_ms
                .saturating_mul(1u64 << exponent)
                .min(self.max_delay_ms)
        };

        if self.jitter_factor <= 0.0 || delay == 0 {
            return Duration::from_millis(delay);
        }

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let jittered = {
            let range = (delay as f64) * self.jitter_factor;
            let jitter: f64 = rand::rng().random_range(-range..=range);
            ((delay as f64) + jitter).max(0.0) as u64
        };

        Duration::from_millis(jittered)
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        3
    }

    pub const fn base_delay_ms() -> u64 {
        1000
    }

    pub const fn max_delay_ms() -> u64 {
        300_000
    }

    pub const fn jitter_factor() -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 300_000);
        assert!(policy.jitter_factor.abs() < f64::EPSILON);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            base_delay_ms: 60,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.delay(1), Duration::from_millis(60));
        assert_eq!(policy.delay(2), Duration::from_millis(120));
        assert_eq!(policy.delay(3), Duration::from_millis(240));
        assert_eq!(policy.delay(4), Duration::from_millis(480));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            base_delay_ms: 60,
            max_delay_ms: 1000,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.delay(5), Duration::from_millis(960));
        assert_eq!(policy.delay(6), Duration::from_millis(1000));
        assert_eq!(policy.delay(64), Duration::from_millis(1000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        clippy::cast_possible_truncation
    )]
    fn test_backoff_with_jitter() {
        let policy = RetryPolicy {
            base_delay_ms: 60,
            jitter_factor: 0.2,
            ..RetryPolicy::default()
        };

        for _ in 0..50 {
            let delay = policy.delay(2).as_millis();
            assert!((96..=144).contains(&delay), "delay {delay} outside ±20% of 120");
        }
    }
}
