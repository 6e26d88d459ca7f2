/// Fault signalling on the status LED.
use core::time::Duration;

use gungnir_board::drivers::sdmmc::{BlockRequest, CompletionEvent};
use gungnir_board::time::{self, Clock};

/// LED period when the boot sequence fails before hand-off.
pub const BOOT_FAILURE_BLINK: Duration = Duration::from_secs(4);
/// LED period after an unrecoverable SD link error.
pub const LINK_ERROR_BLINK: Duration = Duration::from_secs(1);
/// LED period after a panic.
pub const PANIC_BLINK: Duration = Duration::from_millis(250);

pub trait StatusLed {
    fn toggle(&mut self);
}

/// What happens when an in-flight request fails on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkErrorPolicy {
    /// Stop the board and blink `LINK_ERROR_BLINK`.
    Halt,
    /// Complete the request with zero bytes and leave the link in `Error`
    /// for the consumer to recover.
    Report,
}

impl LinkErrorPolicy {
    /// `Halt`, or `Report` when built with the `report-link-errors` feature.
    pub const DEFAULT: Self = if cfg!(feature = "report-link-errors") {
        Self::Report
    } else {
        Self::Halt
    };

    /// Act on a request failed by the link. Under `Report` this returns the
    /// completion to give the consumer; under `Halt` it never returns.
    pub fn on_failure<L, C>(self, request: &BlockRequest, led: &mut L, clock: &C) -> CompletionEvent
    where
        L: StatusLed + ?Sized,
        C: Clock + ?Sized,
    {
        match self {
            Self::Halt => halt(led, clock, LINK_ERROR_BLINK),
            Self::Report => CompletionEvent {
                direction: request.direction,
                buffer: request.buffer,
                byte_count: 0,
            },
        }
    }
}

impl Default for LinkErrorPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// One blink period: toggle, then wait.
pub fn blink<L, C>(led: &mut L, clock: &C, period: Duration)
where
    L: StatusLed + ?Sized,
    C: Clock + ?Sized,
{
    led.toggle();
    time::delay(clock, period);
}

/// Blink forever.
pub fn halt<L, C>(led: &mut L, clock: &C, period: Duration) -> !
where
    L: StatusLed + ?Sized,
    C: Clock + ?Sized,
{
    loop {
        blink(led, clock, period);
    }
}
