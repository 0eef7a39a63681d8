//! # Fibonacci Backoff
//!
//! Progressive retry delays for unclassified reconcile errors. Grows more
//! slowly than exponential backoff, so a workspace stuck on a flaky API call
//! keeps being retried at a useful cadence.
//!
//! Values are kept in milliseconds and bounded by the controller's
//! configured start and maximum.
//!
//! ## Usage
//!
//! ```rust
//! use devworkspace_controller::controller::backoff::FibonacciBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = FibonacciBackoff::new(1000, 5000);
//! assert_eq!(backoff.next_backoff(), Duration::from_millis(1000));
//! assert_eq!(backoff.next_backoff(), Duration::from_millis(1000));
//! assert_eq!(backoff.next_backoff(), Duration::from_millis(2000));
//! assert_eq!(backoff.next_backoff(), Duration::from_millis(3000));
//! assert_eq!(backoff.next_backoff(), Duration::from_millis(5000));
//! ```

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each delay is the sum of the previous two, starting from `start_ms` and
/// capped at `max_ms`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    start_ms: u64,
    prev_ms: u64,
    current_ms: u64,
    max_ms: u64,
}

impl FibonacciBackoff {
    /// Create a backoff starting at `start_ms` and capped at `max_ms`
    ///
    /// A zero start is raised to one millisecond so the sequence grows.
    #[must_use]
    pub fn new(start_ms: u64, max_ms: u64) -> Self {
        let start_ms = start_ms.max(1);
        let max_ms = max_ms.max(start_ms);
        Self {
            start_ms,
            prev_ms: 0,
            current_ms: start_ms,
            max_ms,
        }
    }

    /// Next delay in milliseconds; advances the sequence
    pub fn next_backoff_ms(&mut self) -> u64 {
        let result = self.current_ms;
        let next = self.prev_ms.saturating_add(self.current_ms);
        self.prev_ms = self.current_ms;
        self.current_ms = next.min(self.max_ms);
        result
    }

    /// Next delay as a [`Duration`]; advances the sequence
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_millis(self.next_backoff_ms())
    }

    /// Back to the first delay, after a successful pass
    pub fn reset(&mut self) {
        self.prev_ms = 0;
        self.current_ms = self.start_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(1000, 30_000);
        let sequence: Vec<u64> = (0..10).map(|_| backoff.next_backoff_ms()).collect();
        assert_eq!(
            sequence,
            vec![1000, 1000, 2000, 3000, 5000, 8000, 13_000, 21_000, 30_000, 30_000]
        );
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(1000, 30_000);
        for _ in 0..4 {
            backoff.next_backoff_ms();
        }

        backoff.reset();

        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
    }

    #[test]
    fn test_fibonacci_backoff_degenerate_bounds() {
        let mut zero_start = FibonacciBackoff::new(0, 3);
        assert_eq!(zero_start.next_backoff_ms(), 1);
        assert_eq!(zero_start.next_backoff_ms(), 1);
        assert_eq!(zero_start.next_backoff_ms(), 2);
        assert_eq!(zero_start.next_backoff_ms(), 3);

        let mut max_below_start = FibonacciBackoff::new(500, 100);
        assert_eq!(max_below_start.next_backoff_ms(), 500);
        assert_eq!(max_below_start.next_backoff_ms(), 500);
        assert_eq!(max_below_start.next_backoff_ms(), 500);
    }

    #[test]
    fn test_fibonacci_backoff_per_resource_state() {
        let mut first = FibonacciBackoff::new(1000, 30_000);
        let mut second = FibonacciBackoff::new(1000, 30_000);

        for _ in 0..4 {
            first.next_backoff_ms();
        }
        assert_eq!(second.next_backoff_ms(), 1000);

        first.reset();
        assert_eq!(first.next_backoff_ms(), 1000);
        assert_eq!(second.next_backoff_ms(), 1000);
        assert_eq!(second.next_backoff_ms(), 2000);
    }
}
