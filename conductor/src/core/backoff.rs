//! Exponential retry backoff between failed iterations.

use std::time::Duration;

/// Delay before the next attempt after `consecutive_failures` failures.
///
/// Doubles per failure starting from `base`, saturating at `cap`. Zero
/// failures (fresh agent, or right after a fallback switch) yields no delay.
pub fn retry_delay(consecutive_failures: u32, base: Duration, cap: Duration) -> Duration {
    if consecutive_failures == 0 {
        return Duration::ZERO;
    }
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(cap)
}
