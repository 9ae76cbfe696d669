//! Timeout utilities for driver operations
//!
//! Every hardware wait in the core is bounded by one of these contexts so a
//! wedged peripheral cannot hang its caller. The clock is injected, never
//! global.

use crate::time::Clock;

/// Default timeout for hardware operations (1 second)
pub const DEFAULT_TIMEOUT_US: u64 = 1_000_000;

/// Timeout budget for an IPMB master transmit verdict. 32 bytes at 100 kHz
/// would take ~2.6 ms on the wire, so 10 ms is well past any live transfer.
pub const SEND_VERDICT_TIMEOUT_US: u64 = 10_000;

/// Timeout context for tracking elapsed time
pub struct Timeout<'c> {
    clock: &'c dyn Clock,
    start_us: u64,
    timeout_us: u64,
}

impl<'c> Timeout<'c> {
    /// Create a new timeout context expiring `timeout_us` from now.
    pub fn new(clock: &'c dyn Clock, timeout_us: u64) -> Self {
        Self {
            clock,
            start_us: clock.now_us(),
            timeout_us,
        }
    }

    /// Check if the timeout has expired
    pub fn is_expired(&self) -> bool {
        self.elapsed_us() >= self.timeout_us
    }

    /// Get elapsed time in microseconds
    pub fn elapsed_us(&self) -> u64 {
        self.clock.now_us().saturating_sub(self.start_us)
    }

    /// Get remaining time in microseconds
    pub fn remaining_us(&self) -> u64 {
        self.timeout_us.saturating_sub(self.elapsed_us())
    }

    /// Spin until `condition` holds or the timeout expires.
    pub fn wait<F>(&self, mut condition: F) -> PollResult
    where
        F: FnMut() -> bool,
    {
        loop {
            if condition() {
                return PollResult::Ready;
            }
            if self.is_expired() {
                return PollResult::Expired;
            }
            core::hint::spin_loop();
        }
    }

    /// Reset the timeout to start from now
    pub fn reset(&mut self) {
        self.start_us = self.clock.now_us();
    }
}

/// Outcome of a bounded wait.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollResult {
    Ready,
    Expired,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::clock::MockClock;

    #[test]
    fn test_timeout_expiry() {
        let clock = MockClock::new();
        let timeout = Timeout::new(&clock, 100);
        assert!(!timeout.is_expired());
        clock.advance_us(150);
        assert!(timeout.is_expired());
        assert_eq!(timeout.remaining_us(), 0);
    }

    #[test]
    fn test_wait_success() {
        let clock = MockClock::new();
        let mut ready = false;
        let result = Timeout::new(&clock, 1_000_000).wait(|| {
            ready = true;
            ready
        });
        assert_eq!(result, PollResult::Ready);
    }

    #[test]
    fn test_wait_failure() {
        let clock = MockClock::with_auto_advance(10);
        let result = Timeout::new(&clock, 100).wait(|| false);
        assert_eq!(result, PollResult::Expired);
    }

    #[test]
    fn test_reset() {
        let clock = MockClock::new();
        let mut timeout = Timeout::new(&clock, 100);
        clock.advance_us(150);
        assert!(timeout.is_expired());
        timeout.reset();
        assert!(!timeout.is_expired());
    }
}
