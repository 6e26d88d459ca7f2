//! Post-init verification of external RAM.
//!
//! `Density::Signature` writes a short marker at the start of every stride
//! and reads it straight back: cheap, and enough to catch a dead chip, a
//! missing address line or a wrong geometry. `Density::Full` fills every byte
//! with an address-derived pattern, then checks it in a second pass, which
//! also catches aliasing between strides.
use core::fmt;

use crate::mem::region::{RegionAccess, MIB};

/// Marker written at each stride start.
pub const SIGNATURE: &[u8] = b"gungnir sdram probe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Density {
    Signature,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfTestConfig {
    pub stride: usize,
    pub density: Density,
}

impl SelfTestConfig {
    pub const DEFAULT: Self = Self {
        stride: MIB,
        density: Density::Signature,
    };
}

impl Default for SelfTestConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationFailure {
    /// First byte that read back wrong, as an offset into the region.
    Mismatch { offset: usize, expected: u8, found: u8 },
    InvalidStride(usize),
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch {
                offset,
                expected,
                found,
            } => write!(
                f,
                "memory mismatch at offset {:#x}: wrote {:#04x}, read {:#04x}",
                offset, expected, found
            ),
            Self::InvalidStride(stride) => write!(f, "invalid test stride {}", stride),
        }
    }
}

/// Verify `memory`. Returns the number of strides checked.
///
/// The region's previous contents are destroyed. A region whose size is not
/// a multiple of the stride gets a truncated last stride.
pub fn self_test<R>(memory: &mut R, config: &SelfTestConfig) -> Result<usize, VerificationFailure>
where
    R: RegionAccess + ?Sized,
{
    if config.stride == 0 {
        return Err(VerificationFailure::InvalidStride(config.stride));
    }
    let strides = memory.len().div_ceil(config.stride);
    match config.density {
        Density::Signature => signature_pass(memory, config.stride)?,
        Density::Full => {
            fill(memory);
            verify(memory)?;
        }
    }
    Ok(strides)
}

fn signature_pass<R: RegionAccess + ?Sized>(
    memory: &mut R,
    stride: usize,
) -> Result<(), VerificationFailure> {
    let len = memory.len();
    let mut start = 0;
    while start < len {
        let marker = &SIGNATURE[..SIGNATURE.len().min(len - start)];
        for (i, &byte) in marker.iter().enumerate() {
            memory.write_byte(start + i, byte);
        }
        for (i, &expected) in marker.iter().enumerate() {
            check(memory, start + i, expected)?;
        }
        start = match start.checked_add(stride) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(())
}

fn fill<R: RegionAccess + ?Sized>(memory: &mut R) {
    for offset in 0..memory.len() {
        memory.write_byte(offset, pattern(offset));
    }
}

fn verify<R: RegionAccess + ?Sized>(memory: &R) -> Result<(), VerificationFailure> {
    for offset in 0..memory.len() {
        check(memory, offset, pattern(offset))?;
    }
    Ok(())
}

fn check<R: RegionAccess + ?Sized>(
    memory: &R,
    offset: usize,
    expected: u8,
) -> Result<(), VerificationFailure> {
    let found = memory.read_byte(offset);
    if found != expected {
        return Err(VerificationFailure::Mismatch {
            offset,
            expected,
            found,
        });
    }
    Ok(())
}

/// Differs between neighbouring bytes and between 64 KiB pages, so both a
/// stuck data line and a dropped high address line show up.
fn pattern(offset: usize) -> u8 {
    (offset ^ (offset >> 8) ^ (offset >> 16)) as u8 ^ 0xA5
}
