//! SD card driver: link management and interrupt-driven block I/O.
//!
//! `SdmmcDriver` is the single object standing for the card link. Thread
//! context initializes it and submits requests; the SDMMC interrupt handler
//! calls `on_interrupt` on the same shared reference. The two sides meet only
//! through the per-direction request slots, whose state word is the sole
//! synchronization point: a completion is delivered exactly once, and only
//! for a request that was actually started.
//!
//! At most one request per direction is in flight. A second submission in
//! the same direction is refused with `SubmitFailure::Busy` until the first
//! one's completion callback has returned.
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU8};
use core::time::Duration;

mod card;
mod engine;
pub mod host;
mod irq;
mod link;

pub use card::{CardInfo, CardStatus, Cid, Csd, CsdVersion};
pub use engine::SubmitFailure;
pub use host::{Instance, Sdmmc};
pub use link::{LinkInitFailure, NotReady};

use engine::RequestSlot;

/// Fixed block size of every transfer.
pub const BLOCK_SIZE: u32 = 512;

/// Transfer direction. The discriminants are what the C ABI reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Direction {
    Read = 1,
    Write = 2,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Read, Direction::Write];

    const fn slot(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }
}

/// A block transfer as submitted by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub direction: Direction,
    /// Buffer address in the consumer's memory.
    pub buffer: usize,
    pub start_block: u32,
    pub block_count: u32,
}

impl BlockRequest {
    /// Transfer size in bytes, if it fits in 32 bits.
    pub fn byte_count(&self) -> Option<u32> {
        self.block_count.checked_mul(BLOCK_SIZE)
    }
}

/// Delivered to the consumer when a transfer has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    pub direction: Direction,
    pub buffer: usize,
    pub byte_count: u32,
}

/// The link as the consumer sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Uninitialized,
    Ready,
    Transferring,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEdge {
    Rising,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    One,
    Four,
}

/// Link parameters applied by `init_link`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub clock_edge: ClockEdge,
    pub bus_width: BusWidth,
    pub power_save: bool,
    pub hardware_flow_control: bool,
    /// Card clock divider during identification (must give <= 400 kHz).
    pub init_clock_divider: u16,
    /// Card clock divider once the card is selected.
    pub clock_divider: u16,
    /// Data timeout in card clock cycles.
    pub data_timeout_cycles: u32,
    /// How long to wait for the card to reach the transfer state.
    pub ready_timeout: Duration,
}

impl LinkConfig {
    pub const DEFAULT: Self = Self {
        clock_edge: ClockEdge::Rising,
        bus_width: BusWidth::Four,
        power_save: false,
        hardware_flow_control: true,
        init_clock_divider: 250,
        clock_divider: 23,
        data_timeout_cycles: u32::MAX,
        ready_timeout: Duration::from_millis(500),
    };
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Synchronous failures of the host controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    CommandTimeout(u8),
    CommandCrc(u8),
    /// The card answered but not the way an SD card should.
    UnexpectedResponse(u8),
    /// The card never finished powering up.
    PowerUpTimeout,
    /// A data transfer is already using the controller.
    Busy,
    AddressOutOfRange,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandTimeout(cmd) => write!(f, "CMD{} timed out", cmd),
            Self::CommandCrc(cmd) => write!(f, "CMD{} response CRC error", cmd),
            Self::UnexpectedResponse(cmd) => write!(f, "CMD{} unexpected response", cmd),
            Self::PowerUpTimeout => write!(f, "card power-up timed out"),
            Self::Busy => write!(f, "controller busy"),
            Self::AddressOutOfRange => write!(f, "block address out of range"),
        }
    }
}

/// Asynchronous failures, raised from the interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkError {
    DataCrc = 1,
    DataTimeout = 2,
    Underrun = 3,
    Overrun = 4,
    DmaTransfer = 5,
    StopFailed = 6,
}

impl LinkError {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::DataCrc),
            2 => Some(Self::DataTimeout),
            3 => Some(Self::Underrun),
            4 => Some(Self::Overrun),
            5 => Some(Self::DmaTransfer),
            6 => Some(Self::StopFailed),
            _ => None,
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataCrc => write!(f, "data CRC error"),
            Self::DataTimeout => write!(f, "data timeout"),
            Self::Underrun => write!(f, "transmit FIFO underrun"),
            Self::Overrun => write!(f, "receive FIFO overrun"),
            Self::DmaTransfer => write!(f, "DMA transfer error"),
            Self::StopFailed => write!(f, "stop transmission failed"),
        }
    }
}

/// What the host reports when its interrupt fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    TransferComplete(Direction),
    LinkError(LinkError),
}

/// Raw card registers captured during identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardRegisters {
    /// Long responses, most significant word first.
    pub cid: [u32; 4],
    pub csd: [u32; 4],
    pub rca: u16,
    pub high_capacity: bool,
}

/// The SD host controller, as the driver uses it.
///
/// Methods take `&self`: `service_interrupt` runs in interrupt context while
/// the rest runs in thread context, so implementations keep their mutable
/// state in atomics.
pub trait SdHost: Sync {
    fn name(&self) -> &'static str;

    /// Abort any transfer and power the bus down.
    fn reset(&self);

    /// Power up, run card identification at the init clock and select the card.
    fn identify(&self, config: &LinkConfig) -> Result<CardRegisters, HostError>;

    /// Switch to the operating bus width, clock edge and clock.
    fn configure_bus(&self, config: &LinkConfig) -> Result<(), HostError>;

    /// Card state (CMD13). Reports a data state without touching the bus
    /// while a transfer is active.
    fn card_status(&self) -> Result<CardStatus, HostError>;

    /// Start a transfer. Completion arrives through `service_interrupt`.
    fn start_read(&self, buffer: *mut u8, start_block: u32, block_count: u32)
        -> Result<(), HostError>;
    fn start_write(&self, buffer: *const u8, start_block: u32, block_count: u32)
        -> Result<(), HostError>;

    /// Acknowledge the pending interrupt. Interrupt context only.
    fn service_interrupt(&self) -> Option<HostEvent>;
}

/// The consumer's completion hooks. Both run in interrupt context.
pub trait IoNotify: Sync {
    fn io_complete(&self, event: CompletionEvent);

    /// A submitted request will not complete.
    fn io_failed(&self, request: BlockRequest, error: LinkError) {
        let _ = (request, error);
    }
}

impl<T: IoNotify + ?Sized> IoNotify for &T {
    fn io_complete(&self, event: CompletionEvent) {
        (**self).io_complete(event)
    }

    fn io_failed(&self, request: BlockRequest, error: LinkError) {
        (**self).io_failed(request, error)
    }
}

const LINK_UNINITIALIZED: u8 = 0;
const LINK_READY: u8 = 1;
const LINK_ERROR: u8 = 2;

/// The card link and its two request slots.
pub struct SdmmcDriver<H, C, N> {
    host: H,
    clock: C,
    notify: N,
    config: LinkConfig,
    link: AtomicU8,
    block_count: AtomicU32,
    slots: [RequestSlot; 2],
    last_error: AtomicU8,
    spurious: AtomicU32,
}

impl<H, C, N> SdmmcDriver<H, C, N> {
    pub const fn new(host: H, clock: C, notify: N, config: LinkConfig) -> Self {
        Self {
            host,
            clock,
            notify,
            config,
            link: AtomicU8::new(LINK_UNINITIALIZED),
            block_count: AtomicU32::new(0),
            slots: [RequestSlot::new(), RequestSlot::new()],
            last_error: AtomicU8::new(0),
            spurious: AtomicU32::new(0),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    fn slot(&self, direction: Direction) -> &RequestSlot {
        &self.slots[direction.slot()]
    }
}

#[cfg(test)]
mod tests;
