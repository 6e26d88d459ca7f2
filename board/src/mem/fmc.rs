/// STM32H7 flexible memory controller (FMC), SDRAM side.
use bitflags::bitflags;

use crate::mem::sdram::{Bank, CommandMode, MemoryCommand, SdramConfig, SdramController};

pub const FMC_BASE: usize = 0x5200_4000;

mod regs {
    pub const BCR1: usize = 0x000;
    pub const SDCR1: usize = 0x140;
    pub const SDCR2: usize = 0x144;
    pub const SDTR1: usize = 0x148;
    pub const SDTR2: usize = 0x14C;
    pub const SDCMR: usize = 0x150;
    pub const SDRTR: usize = 0x154;
    pub const SDSR: usize = 0x158;
}

/// BCR1.FMCEN gates the whole controller, SDRAM included.
const BCR1_FMCEN: u32 = 1 << 31;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SdramStatus: u32 {
        const REFRESH_ERROR = 1 << 0;
        const BUSY = 1 << 5;
    }
}

/// SDCR bits that only exist in SDCR1 and apply to both banks.
const SDCR_SHARED_MASK: u32 = 0b1_1111 << 10;

/// SDTR fields that only exist in SDTR1 (TRC and TRP).
const SDTR_SHARED_MASK: u32 = 0xF << 12 | 0xF << 20;

pub struct Fmc {
    base: *mut u8,
}

// SAFETY: Fmc owns the controller's register block; nothing else aliases it.
unsafe impl Send for Fmc {}

impl Fmc {
    /// # Safety
    /// `base` must be the FMC register block, with its kernel clock running,
    /// and no other `Fmc` may exist for it.
    pub const unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }

    unsafe fn read_reg32(&self, offset: usize) -> u32 {
        core::ptr::read_volatile(self.base.add(offset) as *const u32)
    }

    unsafe fn write_reg32(&mut self, offset: usize, value: u32) {
        core::ptr::write_volatile(self.base.add(offset) as *mut u32, value)
    }

    pub fn status(&self) -> SdramStatus {
        // SAFETY: SDSR is a read-only status register.
        SdramStatus::from_bits_truncate(unsafe { self.read_reg32(regs::SDSR) })
    }
}

impl SdramController for Fmc {
    fn configure(&mut self, config: &SdramConfig) {
        let control = sdcr_value(config);
        let timing = sdtr_value(config);
        // SAFETY: register writes within the block we own.
        unsafe {
            match config.bank {
                Bank::One | Bank::Both => {
                    self.write_reg32(regs::SDCR1, control);
                    self.write_reg32(regs::SDTR1, timing);
                    if config.bank == Bank::Both {
                        self.write_reg32(regs::SDCR2, control & !SDCR_SHARED_MASK);
                        self.write_reg32(regs::SDTR2, timing & !SDTR_SHARED_MASK);
                    }
                }
                Bank::Two => {
                    let sdcr1 = self.read_reg32(regs::SDCR1) & !SDCR_SHARED_MASK;
                    self.write_reg32(regs::SDCR1, sdcr1 | (control & SDCR_SHARED_MASK));
                    self.write_reg32(regs::SDCR2, control & !SDCR_SHARED_MASK);
                    let sdtr1 = self.read_reg32(regs::SDTR1) & !SDTR_SHARED_MASK;
                    self.write_reg32(regs::SDTR1, sdtr1 | (timing & SDTR_SHARED_MASK));
                    self.write_reg32(regs::SDTR2, timing & !SDTR_SHARED_MASK);
                }
            }
            let bcr1 = self.read_reg32(regs::BCR1);
            self.write_reg32(regs::BCR1, bcr1 | BCR1_FMCEN);
        }
    }

    fn send_command(&mut self, command: &MemoryCommand) {
        // SAFETY: SDCMR write; the sequencer waits for BUSY to clear after.
        unsafe { self.write_reg32(regs::SDCMR, sdcmr_value(command)) }
    }

    fn is_busy(&self) -> bool {
        self.status().contains(SdramStatus::BUSY)
    }

    fn set_refresh_count(&mut self, count: u32) {
        // SAFETY: SDRTR read-modify-write, keeping the interrupt enable.
        unsafe {
            let sdrtr = self.read_reg32(regs::SDRTR) & !(0x1FFF << 1);
            self.write_reg32(regs::SDRTR, sdrtr | (count & 0x1FFF) << 1);
        }
    }
}

/// SDCR: geometry, CAS latency and SDRAM clock.
pub(crate) fn sdcr_value(config: &SdramConfig) -> u32 {
    let columns = u32::from(config.column_bits.saturating_sub(8)) & 0b11;
    let rows = u32::from(config.row_bits.saturating_sub(11)) & 0b11;
    let width = match config.data_width {
        8 => 0b00,
        16 => 0b01,
        _ => 0b10,
    };
    let banks = u32::from(config.internal_banks == 4);
    let cas = u32::from(config.mode_register.cas_latency as u8) & 0b11;

    columns
        | rows << 2
        | width << 4
        | banks << 6
        | cas << 7
        | u32::from(config.write_protect) << 9
        | (u32::from(config.clock_divider) & 0b11) << 10
        | u32::from(config.read_burst) << 12
        | (u32::from(config.read_pipe_delay) & 0b11) << 13
}

/// SDTR: every field holds its cycle count minus one.
pub(crate) fn sdtr_value(config: &SdramConfig) -> u32 {
    let t = &config.timing;
    let field = |cycles: u8, shift: u32| (u32::from(cycles.saturating_sub(1)) & 0xF) << shift;
    field(t.load_to_active, 0)
        | field(t.exit_self_refresh, 4)
        | field(t.self_refresh, 8)
        | field(t.row_cycle, 12)
        | field(t.write_recovery, 16)
        | field(t.precharge, 20)
        | field(t.row_to_column, 24)
}

/// SDCMR: mode, target bank(s), refresh count and mode register payload.
pub(crate) fn sdcmr_value(command: &MemoryCommand) -> u32 {
    let target = match command.target {
        Bank::One => 1 << 4,
        Bank::Two => 1 << 3,
        Bank::Both => 1 << 4 | 1 << 3,
    };
    let refresh = (u32::from(command.refresh_cycles.saturating_sub(1)) & 0xF) << 5;
    let mode_register = match command.mode {
        CommandMode::LoadModeRegister => (u32::from(command.mode_register.bits()) & 0x3FFF) << 9,
        _ => 0,
    };
    command.mode as u32 | target | refresh | mode_register
}
