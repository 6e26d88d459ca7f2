//! Link bring-up, readiness polling and recovery.
use core::fmt;
use core::sync::atomic::Ordering;
use core::time::Duration;

use super::card::{CardInfo, CardStatus};
use super::{
    CardState, HostError, IoNotify, LinkError, SdHost, SdmmcDriver, BLOCK_SIZE, LINK_ERROR,
    LINK_READY, LINK_UNINITIALIZED,
};
use crate::time::{Clock, Deadline};

/// The card stayed out of the transfer state for the whole timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotReady {
    pub polls: u32,
    /// Last status read, or the error that stopped the last poll.
    pub last: Result<CardStatus, HostError>,
}

impl fmt::Display for NotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last {
            Ok(status) => write!(f, "card not ready after {} polls ({:?})", self.polls, status),
            Err(err) => write!(f, "card not ready after {} polls ({})", self.polls, err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkInitFailure {
    /// Requests are still outstanding; the link can't be reset under them.
    TransfersPending,
    /// Power-up or identification failed.
    Activation(HostError),
    /// The CSD describes a card we can't address.
    UnsupportedCard,
    /// Bus width or clock could not be applied.
    BusConfig(HostError),
    NotReady(NotReady),
}

impl fmt::Display for LinkInitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransfersPending => write!(f, "transfers still pending"),
            Self::Activation(err) => write!(f, "card activation failed: {}", err),
            Self::UnsupportedCard => write!(f, "unsupported CSD structure"),
            Self::BusConfig(err) => write!(f, "bus configuration failed: {}", err),
            Self::NotReady(not_ready) => write!(f, "{}", not_ready),
        }
    }
}

impl<H: SdHost, C: Clock, N: IoNotify> SdmmcDriver<H, C, N> {
    /// Power up and identify the card, then configure the bus.
    ///
    /// The link stays `Uninitialized` until everything succeeded, so no
    /// request can be submitted against a half-configured card.
    pub fn init_link(&self) -> Result<CardInfo, LinkInitFailure> {
        if self.slots.iter().any(|slot| !slot.is_idle()) {
            return Err(LinkInitFailure::TransfersPending);
        }
        self.link.store(LINK_UNINITIALIZED, Ordering::Release);
        self.block_count.store(0, Ordering::Relaxed);
        self.host.reset();

        let registers = self
            .host
            .identify(&self.config)
            .map_err(LinkInitFailure::Activation)?;
        let info = CardInfo::decode(&registers).ok_or(LinkInitFailure::UnsupportedCard)?;
        self.host
            .configure_bus(&self.config)
            .map_err(LinkInitFailure::BusConfig)?;
        let polls = self
            .wait_ready(self.config.ready_timeout)
            .map_err(LinkInitFailure::NotReady)?;

        let blocks = u32::try_from(info.block_count()).unwrap_or(u32::MAX);
        self.block_count.store(blocks, Ordering::Relaxed);
        self.last_error.store(0, Ordering::Relaxed);
        self.link.store(LINK_READY, Ordering::Release);

        console_println!("[sdmmc] {}: {}", self.host.name(), info);
        if polls > 1 {
            console_println!("[sdmmc] card ready after {} status polls", polls);
        }
        Ok(info)
    }

    /// Bring a failed link back. Same as `init_link`; exists so the error
    /// path reads as what it is.
    pub fn recover(&self) -> Result<CardInfo, LinkInitFailure> {
        if let Some(error) = self.last_link_error() {
            console_println!("[sdmmc] {}: recovering from {}", self.host.name(), error);
        }
        self.init_link()
    }

    /// Poll the card status until it reports the transfer state.
    ///
    /// Returns the number of polls it took. The timeout is measured on the
    /// monotonic clock; at least one poll is made even with a zero timeout.
    pub fn wait_ready(&self, timeout: Duration) -> Result<u32, NotReady> {
        let deadline = Deadline::after(&self.clock, timeout);
        let mut polls = 0u32;
        loop {
            polls = polls.saturating_add(1);
            let last = self.host.card_status();
            if matches!(last, Ok(status) if status.is_transfer()) {
                return Ok(polls);
            }
            if deadline.expired(&self.clock) {
                return Err(NotReady { polls, last });
            }
            core::hint::spin_loop();
        }
    }

    pub fn card_state(&self) -> CardState {
        match self.link.load(Ordering::Acquire) {
            LINK_READY if self.slots.iter().any(|slot| slot.is_active()) => {
                CardState::Transferring
            }
            LINK_READY => CardState::Ready,
            LINK_ERROR => CardState::Error,
            _ => CardState::Uninitialized,
        }
    }

    /// Card size in bytes; zero until the link is up.
    pub fn capacity(&self) -> u64 {
        u64::from(self.block_count.load(Ordering::Relaxed)) * u64::from(BLOCK_SIZE)
    }

    pub fn block_count(&self) -> u32 {
        self.block_count.load(Ordering::Relaxed)
    }

    pub fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    /// The error that took the link down, until the next successful init.
    pub fn last_link_error(&self) -> Option<LinkError> {
        LinkError::from_code(self.last_error.load(Ordering::Relaxed))
    }

    /// Completion interrupts that found no request in flight.
    pub fn spurious_completions(&self) -> u32 {
        self.spurious.load(Ordering::Relaxed)
    }
}
