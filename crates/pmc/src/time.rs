//! Injected time source.
//!
//! Every component that needs to measure time (send timeouts, event waits,
//! flush aging) receives a [`Clock`] at construction. On the target this is
//! backed by the RTOS tick or the global timer; on the host the mock clock
//! drives tests deterministically.

use alloc::sync::Arc;

/// Monotonic microsecond clock.
pub trait Clock: Send + Sync {
    /// Microseconds since an arbitrary epoch. Must never go backwards.
    fn now_us(&self) -> u64;
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }
}

/// Milliseconds to microseconds.
#[inline]
pub const fn ms_to_us(ms: u64) -> u64 {
    ms * 1_000
}
