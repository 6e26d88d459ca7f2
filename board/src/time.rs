//! Monotonic time and bounded waits.
//!
//! Every wait on this board is a deadline against a monotonic clock rather
//! than a loop counter, so a timeout means the same thing whatever the core
//! clock is running at.
use core::time::Duration;

/// Monotonic time source.
pub trait Clock: Sync {
    /// Microseconds since an arbitrary origin. Never goes backwards.
    fn now_us(&self) -> u64;

    /// Smallest step `now_us` advances by (1000 for a millisecond tick).
    fn resolution_us(&self) -> u64 {
        1
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }

    fn resolution_us(&self) -> u64 {
        (**self).resolution_us()
    }
}

/// Saturating conversion; `Duration::MAX` becomes "never".
pub const fn duration_us(duration: Duration) -> u64 {
    let us = duration.as_micros();
    if us > u64::MAX as u128 {
        u64::MAX
    } else {
        us as u64
    }
}

/// A point in time after which a wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at_us: u64,
}

impl Deadline {
    pub fn after<C: Clock + ?Sized>(clock: &C, timeout: Duration) -> Self {
        Self {
            at_us: clock.now_us().saturating_add(duration_us(timeout)),
        }
    }

    pub fn expired<C: Clock + ?Sized>(&self, clock: &C) -> bool {
        clock.now_us() >= self.at_us
    }
}

/// Busy-wait for at least `duration`.
///
/// One clock tick is added on top: with a coarse clock the first tick may
/// land right after we sample the start time.
pub fn delay<C: Clock + ?Sized>(clock: &C, duration: Duration) {
    let wait = duration_us(duration).saturating_add(clock.resolution_us());
    let start = clock.now_us();
    while clock.now_us().saturating_sub(start) < wait {
        core::hint::spin_loop();
    }
}
