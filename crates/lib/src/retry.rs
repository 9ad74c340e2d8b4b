//! Exponential-backoff retry policy for stream recovery.
//!
//! The policy is a plain value consumed by a pure delay function; attempt
//! state lives on the stream's registry entry, not here.

use std::time::Duration;

/// Bounded exponential backoff: attempt N (1-based) waits
/// `base_delay * multiplier^(N-1)`; attempts past `max_attempts` are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based attempt, or None when the attempt
    /// exceeds the cap (the stream is abandoned, not retried).
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(self.base_delay * self.multiplier.pow(attempt - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_secs(8)));
    }

    #[test]
    fn fourth_attempt_is_refused() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(4), None);
        assert_eq!(policy.next_delay(0), None);
    }
}
