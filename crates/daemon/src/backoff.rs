//! Retry delay computation for failed encoder sessions.

use std::time::Duration;

/// The delay never grows past `base * MAX_DELAY_MULTIPLIER`.
pub const MAX_DELAY_MULTIPLIER: u64 = 60;

/// Exponential backoff with a fixed cap.
///
/// `delay(n) = min(base * 2^n, base * 60)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_delay_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base_delay_ms: u64) -> Self {
        Self { base_delay_ms }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    /// Delay in milliseconds before the next attempt after `retry_count`
    /// consecutive failures.
    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        let cap = self.base_delay_ms.saturating_mul(MAX_DELAY_MULTIPLIER);
        // 2^6 = 64 already exceeds the multiplier, so larger shifts only
        // risk overflow.
        if retry_count >= 6 {
            return cap;
        }
        self.base_delay_ms
            .saturating_mul(1u64 << retry_count)
            .min(cap)
    }

    pub fn delay(&self, retry_count: u32) -> Duration {
        Duration::from_millis(self.delay_ms(retry_count))
    }
}
