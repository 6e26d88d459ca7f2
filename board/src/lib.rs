//! Gungnir board support: SDRAM bring-up and the interrupt-driven SD driver.
//!
//! Everything in this crate runs underneath the consumer. The boot crate
//! drives `mem::sdram` and `mem::selftest`, publishes one `SdmmcDriver`, and
//! from then on the consumer submits block requests that complete from the
//! SDMMC interrupt.
//!
//! Hardware is reached through small traits (`SdramController`, `SdHost`,
//! `Clock`) so the sequencing and concurrency logic runs unchanged on the host
//! against the fakes in `mock`.
#![no_std]

#[cfg(any(test, feature = "mock"))]
extern crate alloc;

#[macro_use]
pub mod console;
pub mod drivers;
pub mod mem;
pub mod time;

#[cfg(any(test, feature = "mock"))]
pub mod mock;
