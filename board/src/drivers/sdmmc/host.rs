//! STM32H7 SDMMC host controller.
//!
//! Commands go through the command path state machine and are polled to
//! completion against the clock. Data moves by the internal DMA (IDMA)
//! directly between the card and the caller's buffer; the end of a transfer
//! raises DATAEND, which `service_interrupt` turns into a `HostEvent` after
//! stopping multi-block transfers with CMD12. That CMD12 is polled inside
//! the interrupt handler, bounded by `STOP_TIMEOUT`.
//!
//! The caller's buffer must be visible to the IDMA: either in non-cacheable
//! memory or cleaned and invalidated by the consumer around the transfer.
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use core::time::Duration;

use bitflags::bitflags;

use super::card::CardStatus;
use super::{
    BusWidth, CardRegisters, ClockEdge, Direction, HostError, HostEvent, LinkConfig, LinkError,
    SdHost, BLOCK_SIZE,
};
use crate::time::{self, Clock, Deadline};

mod regs {
    pub const POWER: usize = 0x00;
    pub const CLKCR: usize = 0x04;
    pub const ARGR: usize = 0x08;
    pub const CMDR: usize = 0x0C;
    pub const RESP1: usize = 0x14;
    pub const RESP2: usize = 0x18;
    pub const RESP3: usize = 0x1C;
    pub const RESP4: usize = 0x20;
    pub const DTIMER: usize = 0x24;
    pub const DLENR: usize = 0x28;
    pub const DCTRL: usize = 0x2C;
    pub const STAR: usize = 0x34;
    pub const ICR: usize = 0x38;
    pub const MASKR: usize = 0x3C;
    pub const IDMACTRLR: usize = 0x50;
    pub const IDMABASE0R: usize = 0x58;
}

bitflags! {
    /// STAR, ICR and MASKR share this layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        const CCRCFAIL = 1 << 0;
        const DCRCFAIL = 1 << 1;
        const CTIMEOUT = 1 << 2;
        const DTIMEOUT = 1 << 3;
        const TXUNDERR = 1 << 4;
        const RXOVERR = 1 << 5;
        const CMDREND = 1 << 6;
        const CMDSENT = 1 << 7;
        const DATAEND = 1 << 8;
        const DBCKEND = 1 << 10;
        const DABORT = 1 << 11;
        const DPSMACT = 1 << 12;
        const CPSMACT = 1 << 13;
        const BUSYD0END = 1 << 21;
        const IDMATE = 1 << 27;
    }
}

impl Status {
    const COMMAND: Self = Self::CCRCFAIL
        .union(Self::CTIMEOUT)
        .union(Self::CMDREND)
        .union(Self::CMDSENT)
        .union(Self::BUSYD0END);
    const DATA_ERRORS: Self = Self::DCRCFAIL
        .union(Self::DTIMEOUT)
        .union(Self::TXUNDERR)
        .union(Self::RXOVERR)
        .union(Self::IDMATE);
    const DATA: Self = Self::DATA_ERRORS
        .union(Self::DATAEND)
        .union(Self::DBCKEND)
        .union(Self::DABORT);
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct ClockControl: u32 {
        const PWRSAV = 1 << 12;
        const WIDBUS_4 = 1 << 14;
        const NEGEDGE = 1 << 16;
        const HWFC_EN = 1 << 17;
    }
}

const CLKDIV_MASK: u32 = 0x3FF;
const POWER_ON: u32 = 0b11;

const CMDR_CMDTRANS: u32 = 1 << 6;
const CMDR_CMDSTOP: u32 = 1 << 7;
const CMDR_CPSMEN: u32 = 1 << 12;

const DCTRL_DTDIR: u32 = 1 << 1;
/// log2(512) in DBLOCKSIZE.
const DCTRL_BLOCK_512: u32 = 9 << 4;
const IDMACTRLR_IDMAEN: u32 = 1 << 0;

mod cmd {
    pub const GO_IDLE_STATE: u8 = 0;
    pub const ALL_SEND_CID: u8 = 2;
    pub const SEND_RELATIVE_ADDR: u8 = 3;
    pub const SET_BUS_WIDTH: u8 = 6;
    pub const SELECT_CARD: u8 = 7;
    pub const SEND_IF_COND: u8 = 8;
    pub const SEND_CSD: u8 = 9;
    pub const STOP_TRANSMISSION: u8 = 12;
    pub const SEND_STATUS: u8 = 13;
    pub const SET_BLOCKLEN: u8 = 16;
    pub const READ_SINGLE_BLOCK: u8 = 17;
    pub const READ_MULTIPLE_BLOCK: u8 = 18;
    pub const WRITE_SINGLE_BLOCK: u8 = 24;
    pub const WRITE_MULTIPLE_BLOCK: u8 = 25;
    pub const SD_SEND_OP_COND: u8 = 41;
    pub const APP_CMD: u8 = 55;
}

/// CMD8 argument: 2.7-3.6 V, check pattern 0xAA.
const IF_COND_CHECK: u32 = 0x1AA;
/// ACMD41 argument: busy bit plus the 3.2-3.4 V window.
const OP_COND_VOLTAGE: u32 = 0x8010_0000;
const OCR_HCS: u32 = 1 << 30;
const OCR_POWERED_UP: u32 = 1 << 31;

const COMMAND_TIMEOUT: Duration = Duration::from_millis(100);
/// CMD12 is sent from the interrupt handler, which must not sit on the bus
/// for a full `COMMAND_TIMEOUT`. The R1 answer takes well under a
/// millisecond even at the identification clock.
pub(crate) const STOP_TIMEOUT: Duration = Duration::from_millis(2);
/// Cards get a full second to leave the busy state after ACMD41.
const POWER_UP_TIMEOUT: Duration = Duration::from_secs(1);
/// More than the 74 card clocks the card needs after power-on.
const POWER_ON_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Response {
    None,
    Short,
    /// R3 carries no valid CRC.
    ShortNoCrc,
    Long,
}

impl Response {
    const fn waitresp(self) -> u32 {
        let bits = match self {
            Response::None => 0b00,
            Response::Short => 0b01,
            Response::ShortNoCrc => 0b10,
            Response::Long => 0b11,
        };
        bits << 8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instance {
    Sdmmc1,
    Sdmmc2,
}

impl Instance {
    pub const fn base(self) -> usize {
        match self {
            Instance::Sdmmc1 => 0x5200_7000,
            Instance::Sdmmc2 => 0x4802_2400,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Instance::Sdmmc1 => "sdmmc1",
            Instance::Sdmmc2 => "sdmmc2",
        }
    }

    const fn index(self) -> usize {
        match self {
            Instance::Sdmmc1 => 0,
            Instance::Sdmmc2 => 1,
        }
    }
}

static CLAIMED: [AtomicBool; 2] = [AtomicBool::new(false), AtomicBool::new(false)];

const NO_TRANSFER: u8 = 0;

pub struct Sdmmc<C> {
    instance: Instance,
    base: *mut u8,
    clock: C,
    rca: AtomicU32,
    high_capacity: AtomicBool,
    data_timeout: AtomicU32,
    /// Direction of the active transfer, or `NO_TRANSFER`.
    transfer: AtomicU8,
    multi_block: AtomicBool,
    claimed: bool,
}

// SAFETY: the register block belongs to this value alone (see `claim`), and
// the mutable state shared with the interrupt is atomic.
unsafe impl<C: Send> Send for Sdmmc<C> {}
unsafe impl<C: Sync> Sync for Sdmmc<C> {}

impl<C: Clock> Sdmmc<C> {
    /// Take ownership of an SDMMC instance. `None` if it was already claimed.
    ///
    /// # Safety
    /// The instance's kernel clock must be running and its pins muxed, and
    /// the register block must be mapped as device memory.
    pub unsafe fn claim(instance: Instance, clock: C) -> Option<Self> {
        CLAIMED[instance.index()]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self {
            instance,
            base: instance.base() as *mut u8,
            clock,
            rca: AtomicU32::new(0),
            high_capacity: AtomicBool::new(false),
            data_timeout: AtomicU32::new(u32::MAX),
            transfer: AtomicU8::new(NO_TRANSFER),
            multi_block: AtomicBool::new(false),
            claimed: true,
        })
    }

    /// Drive a register block at `base` without claiming an instance.
    ///
    /// # Safety
    /// `base` must point to a writable register-sized block that outlives
    /// the returned value.
    #[cfg(test)]
    pub(crate) unsafe fn with_registers(base: *mut u8, clock: C) -> Self {
        Self {
            instance: Instance::Sdmmc2,
            base,
            clock,
            rca: AtomicU32::new(0),
            high_capacity: AtomicBool::new(false),
            data_timeout: AtomicU32::new(u32::MAX),
            transfer: AtomicU8::new(NO_TRANSFER),
            multi_block: AtomicBool::new(false),
            claimed: false,
        }
    }

    pub fn instance(&self) -> Instance {
        self.instance
    }

    fn read_reg32(&self, offset: usize) -> u32 {
        // SAFETY: offset is one of `regs`, inside the block we own.
        unsafe { core::ptr::read_volatile(self.base.add(offset) as *const u32) }
    }

    fn write_reg32(&self, offset: usize, value: u32) {
        // SAFETY: as for `read_reg32`.
        unsafe { core::ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
    }

    fn status(&self) -> Status {
        Status::from_bits_truncate(self.read_reg32(regs::STAR))
    }

    fn clear(&self, flags: Status) {
        self.write_reg32(regs::ICR, flags.bits());
    }

    fn send_command(
        &self,
        index: u8,
        argument: u32,
        response: Response,
        data: bool,
    ) -> Result<u32, HostError> {
        self.send_command_within(index, argument, response, data, COMMAND_TIMEOUT)
    }

    fn send_command_within(
        &self,
        index: u8,
        argument: u32,
        response: Response,
        data: bool,
        timeout: Duration,
    ) -> Result<u32, HostError> {
        self.clear(Status::COMMAND);
        self.write_reg32(regs::ARGR, argument);

        let mut cmdr = u32::from(index) & 0x3F | response.waitresp() | CMDR_CPSMEN;
        if data {
            cmdr |= CMDR_CMDTRANS;
        }
        if index == cmd::STOP_TRANSMISSION {
            cmdr |= CMDR_CMDSTOP;
        }
        self.write_reg32(regs::CMDR, cmdr);

        let done = match response {
            Response::None => Status::CMDSENT,
            _ => Status::CMDREND | Status::CCRCFAIL | Status::CTIMEOUT,
        };
        let deadline = Deadline::after(&self.clock, timeout);
        let status = loop {
            let status = self.status();
            if status.intersects(done) {
                break status;
            }
            if deadline.expired(&self.clock) {
                return Err(HostError::CommandTimeout(index));
            }
            core::hint::spin_loop();
        };
        self.clear(Status::COMMAND);

        if status.contains(Status::CTIMEOUT) {
            return Err(HostError::CommandTimeout(index));
        }
        if status.contains(Status::CCRCFAIL) && response != Response::ShortNoCrc {
            return Err(HostError::CommandCrc(index));
        }
        Ok(self.read_reg32(regs::RESP1))
    }

    fn app_command(&self, index: u8, argument: u32, response: Response) -> Result<u32, HostError> {
        let rca = self.rca.load(Ordering::Relaxed);
        self.send_command(cmd::APP_CMD, rca << 16, Response::Short, false)?;
        self.send_command(index, argument, response, false)
    }

    fn long_response(&self) -> [u32; 4] {
        [
            self.read_reg32(regs::RESP1),
            self.read_reg32(regs::RESP2),
            self.read_reg32(regs::RESP3),
            self.read_reg32(regs::RESP4),
        ]
    }

    /// Card address for a block: a block number for SDHC, bytes otherwise.
    fn card_address(&self, block: u32) -> Result<u32, HostError> {
        if self.high_capacity.load(Ordering::Relaxed) {
            Ok(block)
        } else {
            block
                .checked_mul(BLOCK_SIZE)
                .ok_or(HostError::AddressOutOfRange)
        }
    }

    fn start_transfer(
        &self,
        direction: Direction,
        buffer: usize,
        start_block: u32,
        block_count: u32,
    ) -> Result<(), HostError> {
        let length = block_count
            .checked_mul(BLOCK_SIZE)
            .ok_or(HostError::AddressOutOfRange)?;
        let address = self.card_address(start_block)?;
        self.transfer
            .compare_exchange(
                NO_TRANSFER,
                direction as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| HostError::Busy)?;
        self.multi_block.store(block_count > 1, Ordering::Relaxed);

        // The data path waits for the CMDTRANS command to start.
        self.write_reg32(regs::DCTRL, 0);
        self.clear(Status::DATA);
        self.write_reg32(regs::DTIMER, self.data_timeout.load(Ordering::Relaxed));
        self.write_reg32(regs::DLENR, length);
        self.write_reg32(regs::IDMABASE0R, buffer as u32);
        self.write_reg32(regs::IDMACTRLR, IDMACTRLR_IDMAEN);
        let dir = match direction {
            Direction::Read => DCTRL_DTDIR,
            Direction::Write => 0,
        };
        self.write_reg32(regs::DCTRL, DCTRL_BLOCK_512 | dir);

        let index = match (direction, block_count > 1) {
            (Direction::Read, false) => cmd::READ_SINGLE_BLOCK,
            (Direction::Read, true) => cmd::READ_MULTIPLE_BLOCK,
            (Direction::Write, false) => cmd::WRITE_SINGLE_BLOCK,
            (Direction::Write, true) => cmd::WRITE_MULTIPLE_BLOCK,
        };
        if let Err(err) = self.send_command(index, address, Response::Short, true) {
            self.stop_data_path();
            self.transfer.store(NO_TRANSFER, Ordering::Release);
            return Err(err);
        }

        // Unmasked only now: the interrupt must not run CMD12 while the
        // command above is still being polled.
        self.write_reg32(regs::MASKR, (Status::DATA_ERRORS | Status::DATAEND).bits());
        Ok(())
    }

    fn stop_data_path(&self) {
        self.write_reg32(regs::MASKR, 0);
        self.write_reg32(regs::IDMACTRLR, 0);
        self.write_reg32(regs::DCTRL, 0);
        let cmdr = self.read_reg32(regs::CMDR);
        self.write_reg32(regs::CMDR, cmdr & !CMDR_CMDTRANS);
        self.clear(Status::DATA);
    }

    /// Shut the data path down after DATAEND or an error.
    fn finish_transfer(&self) -> Result<(), HostError> {
        self.stop_data_path();
        let stop = if self.multi_block.swap(false, Ordering::Relaxed) {
            self.send_command_within(cmd::STOP_TRANSMISSION, 0, Response::Short, false, STOP_TIMEOUT)
                .map(|_| ())
        } else {
            Ok(())
        };
        self.transfer.store(NO_TRANSFER, Ordering::Release);
        stop
    }
}

fn link_error(errors: Status) -> LinkError {
    if errors.contains(Status::DCRCFAIL) {
        LinkError::DataCrc
    } else if errors.contains(Status::DTIMEOUT) {
        LinkError::DataTimeout
    } else if errors.contains(Status::TXUNDERR) {
        LinkError::Underrun
    } else if errors.contains(Status::RXOVERR) {
        LinkError::Overrun
    } else {
        LinkError::DmaTransfer
    }
}

impl<C: Clock> SdHost for Sdmmc<C> {
    fn name(&self) -> &'static str {
        self.instance.name()
    }

    fn reset(&self) {
        self.stop_data_path();
        self.write_reg32(regs::POWER, 0);
        self.write_reg32(regs::ICR, u32::MAX);
        self.transfer.store(NO_TRANSFER, Ordering::Release);
        self.multi_block.store(false, Ordering::Relaxed);
        self.rca.store(0, Ordering::Relaxed);
        self.high_capacity.store(false, Ordering::Relaxed);
    }

    fn identify(&self, config: &LinkConfig) -> Result<CardRegisters, HostError> {
        self.write_reg32(regs::CLKCR, u32::from(config.init_clock_divider) & CLKDIV_MASK);
        self.write_reg32(regs::POWER, POWER_ON);
        time::delay(&self.clock, POWER_ON_DELAY);

        self.send_command(cmd::GO_IDLE_STATE, 0, Response::None, false)?;

        // Version 1 cards don't answer CMD8.
        let v2 = match self.send_command(cmd::SEND_IF_COND, IF_COND_CHECK, Response::Short, false) {
            Ok(echo) if echo & 0xFFF == IF_COND_CHECK => true,
            Ok(_) => return Err(HostError::UnexpectedResponse(cmd::SEND_IF_COND)),
            Err(HostError::CommandTimeout(_)) => false,
            Err(err) => return Err(err),
        };
        let argument = if v2 {
            OP_COND_VOLTAGE | OCR_HCS
        } else {
            OP_COND_VOLTAGE
        };

        let deadline = Deadline::after(&self.clock, POWER_UP_TIMEOUT);
        let ocr = loop {
            let ocr = self.app_command(cmd::SD_SEND_OP_COND, argument, Response::ShortNoCrc)?;
            if ocr & OCR_POWERED_UP != 0 {
                break ocr;
            }
            if deadline.expired(&self.clock) {
                return Err(HostError::PowerUpTimeout);
            }
        };
        let high_capacity = ocr & OCR_HCS != 0;

        self.send_command(cmd::ALL_SEND_CID, 0, Response::Long, false)?;
        let cid = self.long_response();
        let rca = self.send_command(cmd::SEND_RELATIVE_ADDR, 0, Response::Short, false)? >> 16;
        self.rca.store(rca, Ordering::Relaxed);
        self.send_command(cmd::SEND_CSD, rca << 16, Response::Long, false)?;
        let csd = self.long_response();
        self.send_command(cmd::SELECT_CARD, rca << 16, Response::Short, false)?;

        self.high_capacity.store(high_capacity, Ordering::Relaxed);
        if !high_capacity {
            self.send_command(cmd::SET_BLOCKLEN, BLOCK_SIZE, Response::Short, false)?;
        }

        Ok(CardRegisters {
            cid,
            csd,
            rca: rca as u16,
            high_capacity,
        })
    }

    fn configure_bus(&self, config: &LinkConfig) -> Result<(), HostError> {
        let mut clkcr = ClockControl::empty();
        if config.bus_width == BusWidth::Four {
            self.app_command(cmd::SET_BUS_WIDTH, 0b10, Response::Short)?;
            clkcr |= ClockControl::WIDBUS_4;
        }
        if config.clock_edge == ClockEdge::Falling {
            clkcr |= ClockControl::NEGEDGE;
        }
        if config.power_save {
            clkcr |= ClockControl::PWRSAV;
        }
        if config.hardware_flow_control {
            clkcr |= ClockControl::HWFC_EN;
        }
        self.write_reg32(
            regs::CLKCR,
            clkcr.bits() | (u32::from(config.clock_divider) & CLKDIV_MASK),
        );
        self.data_timeout
            .store(config.data_timeout_cycles, Ordering::Relaxed);
        Ok(())
    }

    fn card_status(&self) -> Result<CardStatus, HostError> {
        // The command path belongs to the transfer until it has stopped.
        match self.transfer.load(Ordering::Acquire) {
            NO_TRANSFER => {}
            t if t == Direction::Read as u8 => return Ok(CardStatus::Sending),
            _ => return Ok(CardStatus::Receiving),
        }
        let rca = self.rca.load(Ordering::Relaxed);
        let r1 = self.send_command(cmd::SEND_STATUS, rca << 16, Response::Short, false)?;
        Ok(CardStatus::from_r1(r1))
    }

    fn start_read(&self, buffer: *mut u8, start_block: u32, block_count: u32) -> Result<(), HostError> {
        self.start_transfer(Direction::Read, buffer as usize, start_block, block_count)
    }

    fn start_write(
        &self,
        buffer: *const u8,
        start_block: u32,
        block_count: u32,
    ) -> Result<(), HostError> {
        self.start_transfer(Direction::Write, buffer as usize, start_block, block_count)
    }

    fn service_interrupt(&self) -> Option<HostEvent> {
        let status = self.status();
        let direction = match self.transfer.load(Ordering::Acquire) {
            t if t == Direction::Read as u8 => Direction::Read,
            t if t == Direction::Write as u8 => Direction::Write,
            _ => {
                // Stale flags with nothing running.
                self.write_reg32(regs::MASKR, 0);
                self.clear(Status::DATA);
                return None;
            }
        };

        let errors = status & Status::DATA_ERRORS;
        if !errors.is_empty() {
            let _ = self.finish_transfer();
            return Some(HostEvent::LinkError(link_error(errors)));
        }
        if status.contains(Status::DATAEND) {
            return Some(match self.finish_transfer() {
                Ok(()) => HostEvent::TransferComplete(direction),
                Err(_) => HostEvent::LinkError(LinkError::StopFailed),
            });
        }
        None
    }
}

impl<C> Drop for Sdmmc<C> {
    fn drop(&mut self) {
        if self.claimed {
            CLAIMED[self.instance.index()].store(false, Ordering::Release);
        }
    }
}
