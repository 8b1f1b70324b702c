//! Retry backoff policy for failed tasks.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a ceiling and uniform jitter.
///
/// `backoff(n) = min(cap, base * 2^(n-1)) + jitter`, jitter drawn from
/// `[0, base)`. Attempts are 1-indexed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retrying the given (1-indexed) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let scaled = self
            .base
            .as_millis()
            .saturating_mul(1u128 << exp)
            .min(self.cap.as_millis());
        let jitter = if self.base.as_millis() > 0 {
            rand::thread_rng().gen_range(0..self.base.as_millis())
        } else {
            0
        };
        let millis = (scaled + jitter).min(u64::MAX as u128) as u64;
        Duration::from_millis(millis)
    }
}
