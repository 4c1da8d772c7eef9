//! Delay between conflicting attempts
//!
//! After a conflict the executor backs off before re-running the body, so two
//! transactions fighting over the same reference do not keep invalidating each
//! other in lockstep. Non-transactional atomic operations use the same policy
//! while waiting for an exclusive lock.

use crossbeam_utils::Backoff;
use std::fmt;
use std::time::Duration;

/// Pluggable backoff between attempts
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    /// Delay the calling thread before attempt number `attempt` (1-based)
    fn delay(&self, attempt: usize);
}

/// Spin, then yield, then sleep for an exponentially growing period
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    min_delay: Duration,
    max_delay: Duration,
    spin_attempts: usize,
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        ExponentialBackoffPolicy {
            min_delay: Duration::from_micros(1),
            max_delay: Duration::from_millis(10),
            spin_attempts: 4,
        }
    }
}

impl ExponentialBackoffPolicy {
    /// Create a policy sleeping between `min_delay` and `max_delay`
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        ExponentialBackoffPolicy {
            min_delay,
            max_delay: max_delay.max(min_delay),
            ..Self::default()
        }
    }

    /// Sleep duration for a given attempt once spinning is over
    pub fn sleep_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(self.spin_attempts).min(20) as u32;
        self.min_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl BackoffPolicy for ExponentialBackoffPolicy {
    fn delay(&self, attempt: usize) {
        if attempt <= self.spin_attempts {
            let backoff = Backoff::new();
            for _ in 0..attempt {
                backoff.snooze();
            }
            return;
        }
        std::thread::sleep(self.sleep_for(attempt));
    }
}

/// Re-run immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffPolicy for NoBackoff {
    fn delay(&self, _attempt: usize) {}
}
