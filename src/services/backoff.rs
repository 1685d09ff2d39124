//! Retry delay for connections that keep failing.

use std::time::Duration;

pub const BASE_DELAY: Duration = Duration::from_secs(5 * 60);
pub const MAX_DELAY: Duration = Duration::from_secs(4 * 60 * 60);

/// `BASE_DELAY * 2^(failures - 1)`, capped at `MAX_DELAY`.
///
/// Only called after the failure counter was incremented, so the smallest
/// meaningful input is 1. Zero is treated as 1.
pub fn backoff_delay(consecutive_failures: u32) -> Duration {
    debug_assert!(consecutive_failures > 0, "backoff requires at least one failure");
    let exponent = consecutive_failures.max(1) - 1;
    // 2^6 * 5min already exceeds the ceiling
    if exponent >= 6 {
        return MAX_DELAY;
    }
    BASE_DELAY.saturating_mul(1 << exponent).min(MAX_DELAY)
}

/// Epoch second at which the next attempt becomes due.
pub fn next_retry_at(now: i64, consecutive_failures: u32) -> i64 {
    now + backoff_delay(consecutive_failures).as_secs() as i64
}
