/// Interrupt side of the driver.
use core::sync::atomic::Ordering;

use super::{
    CompletionEvent, Direction, HostEvent, IoNotify, LinkError, SdHost, SdmmcDriver, BLOCK_SIZE,
    LINK_ERROR,
};
use crate::time::Clock;

impl<H: SdHost, C: Clock, N: IoNotify> SdmmcDriver<H, C, N> {
    /// Call from the SDMMC interrupt vector, and from nowhere else.
    ///
    /// Ending a multi-block transfer sends CMD12 and polls for its response
    /// from here, for at most a couple of milliseconds. Nothing else in this
    /// path waits on the card.
    pub fn on_interrupt(&self) {
        match self.host.service_interrupt() {
            Some(HostEvent::TransferComplete(direction)) => self.complete(direction),
            Some(HostEvent::LinkError(error)) => self.fail(error),
            None => {}
        }
    }

    fn complete(&self, direction: Direction) {
        let slot = self.slot(direction);
        let Some(request) = slot.begin_completion(direction) else {
            self.spurious.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.notify.io_complete(CompletionEvent {
            direction,
            buffer: request.buffer,
            byte_count: request.block_count.wrapping_mul(BLOCK_SIZE),
        });
        slot.release();
    }

    /// Take the link down and fail whatever was in flight.
    fn fail(&self, error: LinkError) {
        self.last_error.store(error.code(), Ordering::Relaxed);
        self.link.store(LINK_ERROR, Ordering::SeqCst);
        for direction in Direction::ALL {
            let slot = self.slot(direction);
            if let Some(request) = slot.begin_completion(direction) {
                self.notify.io_failed(request, error);
                slot.release();
            }
        }
    }
}
