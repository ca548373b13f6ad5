//! Cooperative cancellation for the build loop.
//!
//! The loop owns a per-stream lock, so dying mid-iteration with the lock held
//! is the single most damaging failure mode. Cancellation is therefore
//! cooperative: an interrupt flips the token, the loop observes it at the top
//! of each iteration and inside every blocking wait, finishes writing the
//! current iteration record, and unwinds through the lock guard.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared cancellation flag, cheap to clone across threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sleep for `duration`, waking early if the token is cancelled.
///
/// Returns `true` if the full duration elapsed, `false` on cancellation.
pub fn sleep_interruptible(duration: Duration, token: &CancelToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        std::thread::sleep(remaining.min(POLL_INTERVAL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn sleep_completes_when_not_cancelled() {
        let token = CancelToken::new();
        assert!(sleep_interruptible(Duration::from_millis(10), &token));
    }

    #[test]
    fn sleep_returns_early_when_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        let start = Instant::now();
        assert!(!sleep_interruptible(Duration::from_secs(10), &token));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
