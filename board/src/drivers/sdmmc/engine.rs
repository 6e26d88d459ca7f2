//! Request submission and the per-direction slots.
//!
//! Slot states move IDLE -> ARMED -> IN_FLIGHT -> COMPLETING -> IDLE. Thread
//! context owns the first two transitions, the interrupt the last two. ARMED
//! reserves the slot while the request is checked and the card polled; the
//! host is only started after IN_FLIGHT is published, so a completion that
//! fires immediately still finds the request description in place.
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use super::link::NotReady;
use super::{
    BlockRequest, CardState, Direction, HostError, IoNotify, SdHost, SdmmcDriver, LINK_READY,
};
use crate::time::Clock;

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const IN_FLIGHT: u8 = 2;
const COMPLETING: u8 = 3;

/// The IDMA moves whole words.
const BUFFER_ALIGN: usize = 4;

pub(super) struct RequestSlot {
    state: AtomicU8,
    buffer: AtomicUsize,
    start_block: AtomicU32,
    block_count: AtomicU32,
}

impl RequestSlot {
    pub(super) const fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            buffer: AtomicUsize::new(0),
            start_block: AtomicU32::new(0),
            block_count: AtomicU32::new(0),
        }
    }

    fn arm(&self) -> bool {
        self.state
            .compare_exchange(IDLE, ARMED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Record the request and hand the slot to the interrupt side.
    fn launch(&self, request: &BlockRequest) {
        self.buffer.store(request.buffer, Ordering::Relaxed);
        self.start_block.store(request.start_block, Ordering::Relaxed);
        self.block_count.store(request.block_count, Ordering::Relaxed);
        self.state.store(IN_FLIGHT, Ordering::SeqCst);
    }

    /// Take back a launched request before the hardware sees it. Fails if the
    /// interrupt side already claimed it.
    fn withdraw(&self) -> bool {
        self.state
            .compare_exchange(IN_FLIGHT, IDLE, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// Claim the in-flight request for completion. Succeeds at most once per
    /// launch.
    pub(super) fn begin_completion(&self, direction: Direction) -> Option<BlockRequest> {
        self.state
            .compare_exchange(IN_FLIGHT, COMPLETING, Ordering::SeqCst, Ordering::Relaxed)
            .ok()?;
        Some(BlockRequest {
            direction,
            buffer: self.buffer.load(Ordering::Relaxed),
            start_block: self.start_block.load(Ordering::Relaxed),
            block_count: self.block_count.load(Ordering::Relaxed),
        })
    }

    pub(super) fn release(&self) {
        self.state.store(IDLE, Ordering::Release);
    }

    pub(super) fn is_idle(&self) -> bool {
        self.state.load(Ordering::Acquire) == IDLE
    }

    /// Started and not yet fully completed.
    pub(super) fn is_active(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), IN_FLIGHT | COMPLETING)
    }
}

/// Why a request was not started. Nothing was notified in any of these cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitFailure {
    /// The link is not `Ready` (never initialized, or failed).
    LinkDown(CardState),
    /// A request in this direction is still outstanding.
    Busy(Direction),
    NullBuffer,
    MisalignedBuffer(usize),
    EmptyRequest,
    OutOfRange { start_block: u32, block_count: u32 },
    /// The card did not reach the transfer state in time.
    NotReady(NotReady),
    /// The host refused to start the transfer.
    Rejected(HostError),
}

impl fmt::Display for SubmitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkDown(state) => write!(f, "link not ready ({:?})", state),
            Self::Busy(direction) => write!(f, "{:?} request already in flight", direction),
            Self::NullBuffer => write!(f, "null buffer"),
            Self::MisalignedBuffer(addr) => write!(f, "buffer {:#x} not word aligned", addr),
            Self::EmptyRequest => write!(f, "zero-block request"),
            Self::OutOfRange {
                start_block,
                block_count,
            } => write!(
                f,
                "blocks {}+{} past end of card",
                start_block, block_count
            ),
            Self::NotReady(not_ready) => write!(f, "{}", not_ready),
            Self::Rejected(err) => write!(f, "host rejected transfer: {}", err),
        }
    }
}

impl<H: SdHost, C: Clock, N: IoNotify> SdmmcDriver<H, C, N> {
    /// Start reading `block_count` blocks from `start_block` into `buffer`.
    ///
    /// On `Ok` exactly one `io_complete` (or `io_failed`) follows from
    /// interrupt context; on `Err` none does.
    ///
    /// # Safety
    /// `buffer` must be valid for writes of `block_count * 512` bytes, word
    /// aligned, and left untouched until the completion arrives.
    pub unsafe fn submit_read(
        &self,
        buffer: *mut u8,
        start_block: u32,
        block_count: u32,
    ) -> Result<(), SubmitFailure> {
        self.submit(BlockRequest {
            direction: Direction::Read,
            buffer: buffer as usize,
            start_block,
            block_count,
        })
    }

    /// Start writing `block_count` blocks from `buffer` at `start_block`.
    ///
    /// # Safety
    /// `buffer` must be valid for reads of `block_count * 512` bytes, word
    /// aligned, and not modified until the completion arrives.
    pub unsafe fn submit_write(
        &self,
        buffer: *const u8,
        start_block: u32,
        block_count: u32,
    ) -> Result<(), SubmitFailure> {
        self.submit(BlockRequest {
            direction: Direction::Write,
            buffer: buffer as usize,
            start_block,
            block_count,
        })
    }

    fn submit(&self, request: BlockRequest) -> Result<(), SubmitFailure> {
        if self.link.load(Ordering::Acquire) != LINK_READY {
            return Err(SubmitFailure::LinkDown(self.card_state()));
        }
        self.validate(&request)?;

        let slot = self.slot(request.direction);
        if !slot.arm() {
            return Err(SubmitFailure::Busy(request.direction));
        }
        if let Err(not_ready) = self.wait_ready(self.config.ready_timeout) {
            slot.release();
            return Err(SubmitFailure::NotReady(not_ready));
        }

        slot.launch(&request);
        // A link error may have landed while the card was polled above.
        if self.link.load(Ordering::SeqCst) != LINK_READY {
            if slot.withdraw() {
                return Err(SubmitFailure::LinkDown(self.card_state()));
            }
            // The interrupt side failed the request and reported it.
            return Ok(());
        }
        let started = match request.direction {
            Direction::Read => self.host.start_read(
                request.buffer as *mut u8,
                request.start_block,
                request.block_count,
            ),
            Direction::Write => self.host.start_write(
                request.buffer as *const u8,
                request.start_block,
                request.block_count,
            ),
        };
        match started {
            Err(err) if slot.withdraw() => Err(SubmitFailure::Rejected(err)),
            // Started, or already failed and reported by the interrupt side.
            _ => Ok(()),
        }
    }

    fn validate(&self, request: &BlockRequest) -> Result<(), SubmitFailure> {
        if request.buffer == 0 {
            return Err(SubmitFailure::NullBuffer);
        }
        if request.buffer % BUFFER_ALIGN != 0 {
            return Err(SubmitFailure::MisalignedBuffer(request.buffer));
        }
        if request.block_count == 0 {
            return Err(SubmitFailure::EmptyRequest);
        }
        let out_of_range = SubmitFailure::OutOfRange {
            start_block: request.start_block,
            block_count: request.block_count,
        };
        let end = request
            .start_block
            .checked_add(request.block_count)
            .ok_or(out_of_range)?;
        if end > self.block_count.load(Ordering::Relaxed) || request.byte_count().is_none() {
            return Err(out_of_range);
        }
        Ok(())
    }
}
