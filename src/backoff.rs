//! Retry policy for failed background renewals

use std::time::Duration;

/// Configuration for retrying a failed automatic renewal
///
/// The first retry is delayed by `initial_delay`; each subsequent retry
/// multiplies the previous delay by `multiplier`, capped at `max_delay`.
/// Once `max_retries` retries have failed, the renewal cycle stops until the
/// next explicit fetch.
#[derive(Clone, Debug)]
pub struct RenewalBackoffConfig {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
    max_retries: u32,
}

impl Default for RenewalBackoffConfig {
    /// Default backoff configuration
    ///
    /// Uses an initial delay of 100 ms with a multiplier of 2, capped at
    /// 15 seconds, and gives up after 5 retries.
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(15),
            multiplier: 2,
            max_retries: 5,
        }
    }
}

impl RenewalBackoffConfig {
    /// Constructs a new backoff configuration
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
        max_retries: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            max_retries,
        }
    }

    /// A configuration that never retries
    ///
    /// A renewal failure then stops the cycle immediately, leaving the last
    /// good credential cached.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based), or `None` once the
    /// retry budget is exhausted
    pub(crate) fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let factor = self.multiplier.saturating_pow(attempt);
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}
