//! Gungnir boot: from reset to the consumer.
//!
//! The startup code (clocks, MPU, pins, UART) calls `board_main` in `ffi`,
//! which runs `sequence::run`: SDRAM bring-up, memory self-test, SD link
//! initialization, and finally the hand-off of the verified region to the
//! consumer. Every failure on that path is a typed `BootError`; what to do
//! about it (halt with a blink code, retry, carry on without storage) is
//! decided in one place by `BootPolicy` and `fault`.
#![no_std]

#[cfg(test)]
extern crate alloc;

pub mod fault;
pub mod sequence;

#[cfg(target_os = "none")]
mod ffi;

pub use sequence::{
    connect_storage, run, Board, BootError, BootPolicy, Consumer, LinkControl, LinkFailureAction,
    StorageStatus,
};

#[cfg(test)]
mod tests;
