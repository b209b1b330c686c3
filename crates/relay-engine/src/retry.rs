//! Backoff policies for the engine's only local retry: lock acquisition.
//!
//! Business operations are never retried on the caller's behalf. The lock
//! helpers in [`crate::lock`] consult a [`LockPolicy`] to decide how often and
//! how patiently to try before surfacing `LockContention`.

use std::time::Duration;

/// Backoff policy controlling the delay between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// Fixed delay between attempts.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between attempts.
    None,
}

impl BackoffPolicy {
    /// Compute the delay after a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let factor = 2u64.saturating_pow(attempt.min(32) as u32);
                let millis = (base.as_millis() as u64).saturating_mul(factor);
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(25),
            max: Duration::from_secs(1),
        }
    }
}

/// How many times to try for an advisory lock, and how long to wait between
/// tries.
#[derive(Debug, Clone, PartialEq)]
pub struct LockPolicy {
    pub attempts: usize,
    pub backoff: BackoffPolicy,
}

impl LockPolicy {
    /// A single non-blocking attempt.
    pub fn no_wait() -> Self {
        Self {
            attempts: 1,
            backoff: BackoffPolicy::None,
        }
    }

    /// Upper bound on the total time spent sleeping between attempts.
    pub fn max_total_wait(&self) -> Duration {
        (0..self.attempts.saturating_sub(1))
            .map(|a| self.backoff.delay_for_attempt(a))
            .sum()
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_is_constant() {
        let policy = BackoffPolicy::Fixed(Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(100));
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(500));
    }

    #[test]
    fn none_policy_never_waits() {
        assert_eq!(BackoffPolicy::None.delay_for_attempt(5), Duration::ZERO);
    }

    #[test]
    fn lock_policy_total_wait_excludes_last_attempt() {
        let policy = LockPolicy {
            attempts: 3,
            backoff: BackoffPolicy::Fixed(Duration::from_millis(10)),
        };
        assert_eq!(policy.max_total_wait(), Duration::from_millis(20));
        assert_eq!(LockPolicy::no_wait().max_total_wait(), Duration::ZERO);
    }
}
