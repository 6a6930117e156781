//! Backoff policy for connect and stream-creation retries.
//!
//! The policy is a fixed delay table indexed by a monotonic attempt counter.
//! Two independent counters exist per service instance: one for the shared
//! channel-connect loop and one per consumer for stream creation. A counter
//! resets to zero on success or when the collector signals a rebalance.

use std::time::Duration;

/// Delay table for channel-connect and stream-connect retries, in
/// milliseconds. Attempts past the end of the table reuse the last entry.
pub const CONNECT_BACKOFF_MS: [u64; 6] = [15_000, 15_000, 30_000, 60_000, 120_000, 300_000];

/// Fixed delay between send-loop attempts after a non-rebalance send failure,
/// in milliseconds.
pub const RETRY_DELAY_MS: u64 = 15_000;

/// Delay for the given attempt number, clamped to the last table entry.
pub fn delay_for_attempt(attempt: usize) -> Duration {
    let idx = attempt.min(CONNECT_BACKOFF_MS.len() - 1);
    Duration::from_millis(CONNECT_BACKOFF_MS[idx])
}

/// Attempt counter feeding [`delay_for_attempt`].
///
/// The counter saturates instead of wrapping, so a connect loop that fails
/// for days keeps waiting the final table entry.
#[derive(Debug, Clone, Default)]
pub struct BackoffState {
    attempt: usize,
}

impl BackoffState {
    /// Create a counter starting at attempt zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current attempt number.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Delay for the current attempt, advancing the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset the counter, after a success or a rebalance signal.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_follows_table() {
        let expected = [15_000, 15_000, 30_000, 60_000, 120_000, 300_000];
        for (attempt, ms) in expected.iter().enumerate() {
            assert_eq!(delay_for_attempt(attempt), Duration::from_millis(*ms));
        }
    }

    #[test]
    fn test_delay_is_non_decreasing() {
        let mut previous = Duration::ZERO;
        for attempt in 0..10 {
            let delay = delay_for_attempt(attempt);
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn test_delay_saturates_at_last_entry() {
        let last = Duration::from_millis(300_000);
        assert_eq!(delay_for_attempt(5), last);
        assert_eq!(delay_for_attempt(6), last);
        assert_eq!(delay_for_attempt(usize::MAX), last);
    }

    #[test]
    fn test_state_advances_and_resets() {
        let mut state = BackoffState::new();
        assert_eq!(state.next_delay(), Duration::from_millis(15_000));
        assert_eq!(state.next_delay(), Duration::from_millis(15_000));
        assert_eq!(state.next_delay(), Duration::from_millis(30_000));
        assert_eq!(state.attempt(), 3);

        state.reset();
        assert_eq!(state.attempt(), 0);
        assert_eq!(state.next_delay(), Duration::from_millis(15_000));
    }

    #[test]
    fn test_state_saturates_instead_of_overflowing() {
        let mut state = BackoffState { attempt: usize::MAX };
        assert_eq!(state.next_delay(), Duration::from_millis(300_000));
        assert_eq!(state.attempt(), usize::MAX);
    }
}
