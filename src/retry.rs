//! Retry scheduling arithmetic.
//!
//! The retrier delays each entry `fail_count * RETRY_INTERVAL` minutes
//! before the attempt, so a message's waits grow linearly with its failure
//! history. `MAILER_RETRIES` caps fail_count; the first enqueue that would
//! exceed it dead-letters instead.

use std::time::Duration;

/// Per-message delay before a retry attempt.
pub fn delay_for(fail_count: u32, base_minutes: u64) -> Duration {
    Duration::from_secs(u64::from(fail_count) * base_minutes * 60)
}

/// Whether another attempt would exceed the retry cap.
pub fn retries_exhausted(fail_count: u32, max_retries: u32) -> bool {
    fail_count.saturating_add(1) > max_retries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_scales_with_fail_count() {
        assert_eq!(delay_for(0, 15), Duration::ZERO);
        assert_eq!(delay_for(1, 15), Duration::from_secs(900));
        assert_eq!(delay_for(3, 15), Duration::from_secs(2700));
    }

    #[test]
    fn test_delay_respects_base() {
        assert_eq!(delay_for(2, 1), Duration::from_secs(120));
    }

    #[test]
    fn test_retries_exhausted_boundary() {
        // fail_count=4, cap 5: attempt 5 is still allowed
        assert!(!retries_exhausted(4, 5));
        // fail_count=5, cap 5: attempt 6 would exceed the cap
        assert!(retries_exhausted(5, 5));
        assert!(retries_exhausted(6, 5));
    }

    #[test]
    fn test_retries_exhausted_no_overflow() {
        assert!(retries_exhausted(u32::MAX, 5));
    }
}
