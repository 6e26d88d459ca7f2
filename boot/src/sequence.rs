//! The boot sequence: memory, verification, storage, hand-off.
//!
//! Stages run strictly in order and each must succeed before the next
//! starts. The consumer is only entered with memory that passed the
//! self-test; storage may be offline at that point if the policy allows it.
use core::convert::Infallible;
use core::fmt;

use crate::fault::LinkErrorPolicy;
use gungnir_board::console_println;
use gungnir_board::drivers::sdmmc::{IoNotify, LinkInitFailure, SdHost, SdmmcDriver};
use gungnir_board::mem::{
    self, MemoryRegion, RegionAccess, SdramConfig, SdramController, SdramError, SelfTestConfig,
    VerificationFailure,
};
use gungnir_board::time::Clock;

/// Whatever runs on top of the board once boot is done.
pub trait Consumer {
    /// Take over `region`. Normally never returns.
    fn hand_off(&mut self, region: MemoryRegion);
}

/// The storage link, as the boot sequence brings it up.
pub trait LinkControl {
    fn connect(&self) -> Result<(), LinkInitFailure>;
}

impl<H: SdHost, C: Clock, N: IoNotify> LinkControl for SdmmcDriver<H, C, N> {
    fn connect(&self) -> Result<(), LinkInitFailure> {
        self.init_link().map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFailureAction {
    /// Stop booting.
    Abort,
    /// Try again up to `attempts` more times, then abort.
    Retry { attempts: u8 },
    /// Hand off anyway, with storage offline.
    Degrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootPolicy {
    /// When the link cannot be brought up at boot.
    pub on_link_failure: LinkFailureAction,
    /// When an in-flight request fails after hand-off.
    pub on_link_error: LinkErrorPolicy,
}

impl BootPolicy {
    pub const DEFAULT: Self = Self {
        on_link_failure: LinkFailureAction::Abort,
        on_link_error: LinkErrorPolicy::DEFAULT,
    };
}

impl Default for BootPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStatus {
    Online,
    Offline(LinkInitFailure),
}

impl fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline(err) => write!(f, "offline: {}", err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    Memory(SdramError),
    Verification(VerificationFailure),
    Link(LinkInitFailure),
    /// The consumer came back from `hand_off`.
    ConsumerReturned,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(err) => write!(f, "SDRAM bring-up failed: {}", err),
            Self::Verification(err) => write!(f, "SDRAM self-test failed: {}", err),
            Self::Link(err) => write!(f, "SD link failed: {}", err),
            Self::ConsumerReturned => write!(f, "consumer returned"),
        }
    }
}

impl From<SdramError> for BootError {
    fn from(err: SdramError) -> Self {
        Self::Memory(err)
    }
}

impl From<VerificationFailure> for BootError {
    fn from(err: VerificationFailure) -> Self {
        Self::Verification(err)
    }
}

/// The hardware the boot sequence works on.
pub struct Board<'a, F: ?Sized, C: ?Sized, R: ?Sized, L: ?Sized> {
    pub fmc: &'a mut F,
    pub clock: &'a C,
    pub sdram: SdramConfig,
    /// The SDRAM window, as the self-test and the consumer see it.
    pub memory: &'a mut R,
    pub self_test: SelfTestConfig,
    pub storage: &'a L,
    pub policy: BootPolicy,
}

/// Run the boot sequence. Only returns on failure.
pub fn run<F, C, R, L, K>(board: Board<'_, F, C, R, L>, consumer: &mut K) -> Result<Infallible, BootError>
where
    F: SdramController + ?Sized,
    C: Clock + ?Sized,
    R: RegionAccess + ?Sized,
    L: LinkControl + ?Sized,
    K: Consumer + ?Sized,
{
    mem::bring_up(board.fmc, board.clock, &board.sdram)?;

    let region = board.memory.region();
    let strides = mem::self_test(board.memory, &board.self_test)?;
    console_println!("[boot] {:?} verified ({} strides)", region, strides);

    let storage = connect_storage(board.storage, &board.policy)?;

    console_println!("[boot] handing off {:?}, storage {}", region, storage);
    consumer.hand_off(region);
    Err(BootError::ConsumerReturned)
}

/// Bring the storage link up as `policy` says.
pub fn connect_storage<L>(storage: &L, policy: &BootPolicy) -> Result<StorageStatus, BootError>
where
    L: LinkControl + ?Sized,
{
    let tries = match policy.on_link_failure {
        LinkFailureAction::Retry { attempts } => u32::from(attempts) + 1,
        LinkFailureAction::Abort | LinkFailureAction::Degrade => 1,
    };
    let mut attempt = 1;
    loop {
        let err = match storage.connect() {
            Ok(()) => return Ok(StorageStatus::Online),
            Err(err) => err,
        };
        console_println!("[boot] SD link attempt {}/{}: {}", attempt, tries, err);
        if attempt >= tries {
            return match policy.on_link_failure {
                LinkFailureAction::Degrade => Ok(StorageStatus::Offline(err)),
                _ => Err(BootError::Link(err)),
            };
        }
        attempt += 1;
    }
}
