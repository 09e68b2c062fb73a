//! Canonical reconnect backoff policy.
//!
//! One policy for the whole client:
//! `delay = min(max_delay, base * multiplier^retry_count)`.
//! Jitter is off by default; when enabled it adds up to 20% of the computed
//! delay and the result is still capped at `max_delay`.

// Rust guideline compliant 2026-02

use std::time::Duration;

use crate::constants::{
    MAX_RETRY_ATTEMPTS, RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY, RECONNECT_MULTIPLIER,
};

/// Fraction of the computed delay added at most when jitter is enabled.
const JITTER_FRACTION: f64 = 0.2;

/// Exponential reconnect backoff with a bounded attempt budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Growth factor per failed attempt (>= 1.0).
    pub multiplier: f64,
    /// Cap for every delay.
    pub max_delay: Duration,
    /// Failed attempts tolerated before giving up.
    pub max_attempts: u32,
    /// Add bounded random jitter to each delay.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: RECONNECT_BASE_DELAY,
            multiplier: RECONNECT_MULTIPLIER,
            max_delay: RECONNECT_MAX_DELAY,
            max_attempts: MAX_RETRY_ATTEMPTS,
            jitter: false,
        }
    }
}

impl ReconnectPolicy {
    /// Deterministic delay for the given number of prior failures.
    ///
    /// Non-decreasing in `retry_count` and never above `max_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let base_ms = self.base.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (base_ms * self.multiplier.powi(exponent)).min(max_ms);
        Duration::from_millis(delay_ms as u64)
    }

    /// Delay to actually wait, jittered if enabled.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let delay = self.delay_for(retry_count);
        if !self.jitter {
            return delay;
        }
        let spread = (delay.as_millis() as f64 * JITTER_FRACTION) as u64;
        let extra = if spread == 0 {
            0
        } else {
            rand::random::<u64>() % (spread + 1)
        };
        (delay + Duration::from_millis(extra)).min(self.max_delay)
    }

    /// Whether `failures` consecutive failed attempts exceed the budget.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures > self.max_attempts
    }
}
