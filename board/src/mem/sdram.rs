//! SDRAM command sequencer.
//!
//! Takes the external SDRAM from power-up to normal operation: program the
//! controller, enable the clock, wait out the power-up delay, precharge all
//! banks, run the auto-refresh cycles, load the mode register, and finally
//! start periodic refresh. Each command waits for the controller to go idle
//! against a monotonic deadline.
//!
//! `bring_up` runs once per power cycle. Running it again on a live SDRAM is
//! not harmless (the precharge drops open rows, the mode load can change CAS
//! latency under traffic), so callers must not retry it on success.
use core::fmt;
use core::time::Duration;

use crate::mem::region::{MemoryRegion, MIB};
use crate::time::{self, Clock, Deadline};

/// Lowest refresh count the controller accepts.
pub const MIN_REFRESH_COUNT: u32 = 41;
/// Width of the refresh timer field.
pub const MAX_REFRESH_COUNT: u32 = 0x1FFF;
/// Cycles subtracted from the per-row interval so a refresh request that
/// arrives during a read burst still lands inside the window.
pub const REFRESH_MARGIN: u32 = 20;

/// Command codes as the controller's mode field encodes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandMode {
    ClockEnable = 1,
    PrechargeAll = 2,
    AutoRefresh = 3,
    LoadModeRegister = 4,
}

/// Which SDRAM bank(s) of the controller a command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    One,
    Two,
    Both,
}

/// One command for the controller's command register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCommand {
    pub mode: CommandMode,
    pub target: Bank,
    /// Back-to-back auto-refresh cycles, 1..=16. Ignored by other modes.
    pub refresh_cycles: u8,
    /// Mode register payload. Only used by `LoadModeRegister`.
    pub mode_register: ModeRegister,
}

impl MemoryCommand {
    const fn simple(mode: CommandMode, target: Bank) -> Self {
        Self {
            mode,
            target,
            refresh_cycles: 1,
            mode_register: ModeRegister::EMPTY,
        }
    }

    pub const fn clock_enable(target: Bank) -> Self {
        Self::simple(CommandMode::ClockEnable, target)
    }

    pub const fn precharge_all(target: Bank) -> Self {
        Self::simple(CommandMode::PrechargeAll, target)
    }

    pub const fn auto_refresh(target: Bank, cycles: u8) -> Self {
        let cycles = if cycles == 0 {
            1
        } else if cycles > 16 {
            16
        } else {
            cycles
        };
        Self {
            refresh_cycles: cycles,
            ..Self::simple(CommandMode::AutoRefresh, target)
        }
    }

    pub const fn load_mode_register(target: Bank, mode_register: ModeRegister) -> Self {
        Self {
            mode_register,
            ..Self::simple(CommandMode::LoadModeRegister, target)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstLength {
    One,
    Two,
    Four,
    Eight,
    FullPage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstType {
    Sequential,
    Interleaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasLatency {
    Two = 2,
    Three = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBurst {
    Programmed,
    Single,
}

/// The SDRAM mode register (JEDEC layout, A0..A9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeRegister {
    pub burst_length: BurstLength,
    pub burst_type: BurstType,
    pub cas_latency: CasLatency,
    pub write_burst: WriteBurst,
}

impl ModeRegister {
    const EMPTY: Self = Self {
        burst_length: BurstLength::One,
        burst_type: BurstType::Sequential,
        cas_latency: CasLatency::Two,
        write_burst: WriteBurst::Programmed,
    };

    /// Encoded value. Operating mode bits (A8:A7) are always "standard".
    pub const fn bits(&self) -> u16 {
        let length = match self.burst_length {
            BurstLength::One => 0b000,
            BurstLength::Two => 0b001,
            BurstLength::Four => 0b010,
            BurstLength::Eight => 0b011,
            BurstLength::FullPage => 0b111,
        };
        let kind = match self.burst_type {
            BurstType::Sequential => 0,
            BurstType::Interleaved => 1 << 3,
        };
        let cas = (self.cas_latency as u16) << 4;
        let write = match self.write_burst {
            WriteBurst::Programmed => 0,
            WriteBurst::Single => 1 << 9,
        };
        length | kind | cas | write
    }
}

/// Timing parameters, in SDRAM clock cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdramTiming {
    pub load_to_active: u8,
    pub exit_self_refresh: u8,
    pub self_refresh: u8,
    pub row_cycle: u8,
    pub write_recovery: u8,
    pub precharge: u8,
    pub row_to_column: u8,
}

/// Everything the sequencer needs to know about one SDRAM device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdramConfig {
    pub bank: Bank,
    /// Where the device appears on the bus once initialized.
    pub base: usize,
    pub size: usize,

    pub column_bits: u8,
    pub row_bits: u8,
    pub data_width: u8,
    pub internal_banks: u8,
    /// SDRAM clock as a divider of the controller kernel clock (2 or 3).
    pub clock_divider: u8,
    pub read_burst: bool,
    pub read_pipe_delay: u8,
    pub write_protect: bool,
    pub timing: SdramTiming,

    pub mode_register: ModeRegister,
    pub auto_refresh_cycles: u8,
    /// Every row must be refreshed once per `refresh_period`.
    pub refresh_period: Duration,
    pub rows: u32,
    pub sdclk_hz: u32,

    pub power_up_delay: Duration,
    pub command_timeout: Duration,
}

impl SdramConfig {
    /// Winbond W9825G6KH-6 (32 MiB, 16-bit) on bank 1 at 108 MHz.
    pub const W9825G6KH: Self = Self {
        bank: Bank::One,
        base: 0xC000_0000,
        size: 32 * MIB,
        column_bits: 9,
        row_bits: 13,
        data_width: 16,
        internal_banks: 4,
        clock_divider: 2,
        read_burst: false,
        read_pipe_delay: 0,
        write_protect: false,
        timing: SdramTiming {
            load_to_active: 2,
            exit_self_refresh: 7,
            self_refresh: 4,
            row_cycle: 7,
            write_recovery: 3,
            precharge: 2,
            row_to_column: 2,
        },
        mode_register: ModeRegister {
            burst_length: BurstLength::Two,
            burst_type: BurstType::Sequential,
            cas_latency: CasLatency::Three,
            write_burst: WriteBurst::Single,
        },
        auto_refresh_cycles: 4,
        refresh_period: Duration::from_millis(64),
        rows: 8192,
        sdclk_hz: 108_000_000,
        power_up_delay: Duration::from_micros(100),
        command_timeout: Duration::from_millis(100),
    };

    pub const fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.base, self.size)
    }

    /// Refresh timer value: SDRAM cycles per row refresh, rounded to
    /// nearest, minus `REFRESH_MARGIN`.
    pub const fn refresh_count(&self) -> u32 {
        let rows = self.rows as u128;
        if rows == 0 {
            return 0;
        }
        let divisor = rows * 1_000_000;
        let cycles = (self.refresh_period.as_micros() * self.sdclk_hz as u128 + divisor / 2) / divisor;
        if cycles > u32::MAX as u128 {
            return u32::MAX;
        }
        (cycles as u32).saturating_sub(REFRESH_MARGIN)
    }
}

static_assertions::const_assert_eq!(SdramConfig::W9825G6KH.refresh_count(), 824);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdramError {
    /// The controller stayed busy past the command timeout.
    HardwareTimeout { command: CommandMode },
    /// The configured timing gives a refresh count the controller can't hold.
    RefreshCountOutOfRange { count: u32 },
}

impl fmt::Display for SdramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HardwareTimeout { command } => {
                write!(f, "SDRAM controller busy after {:?} command", command)
            }
            Self::RefreshCountOutOfRange { count } => write!(
                f,
                "refresh count {} outside {}..={}",
                count, MIN_REFRESH_COUNT, MAX_REFRESH_COUNT
            ),
        }
    }
}

/// The memory controller, as the sequencer drives it.
pub trait SdramController {
    /// Program geometry and timing for `config.bank` and enable the controller.
    fn configure(&mut self, config: &SdramConfig);
    fn send_command(&mut self, command: &MemoryCommand);
    fn is_busy(&self) -> bool;
    fn set_refresh_count(&mut self, count: u32);
}

/// Initialize the SDRAM described by `config`.
///
/// Precondition: the controller's kernel clock and pins are set up and the
/// device has not been initialized since power-up. On success the whole of
/// `config.region()` is usable memory.
pub fn bring_up<F, C>(fmc: &mut F, clock: &C, config: &SdramConfig) -> Result<(), SdramError>
where
    F: SdramController + ?Sized,
    C: Clock + ?Sized,
{
    let count = config.refresh_count();
    if !(MIN_REFRESH_COUNT..=MAX_REFRESH_COUNT).contains(&count) {
        return Err(SdramError::RefreshCountOutOfRange { count });
    }

    fmc.configure(config);

    let bank = config.bank;
    issue(fmc, clock, config, MemoryCommand::clock_enable(bank))?;
    time::delay(clock, config.power_up_delay);
    issue(fmc, clock, config, MemoryCommand::precharge_all(bank))?;
    issue(
        fmc,
        clock,
        config,
        MemoryCommand::auto_refresh(bank, config.auto_refresh_cycles),
    )?;
    issue(
        fmc,
        clock,
        config,
        MemoryCommand::load_mode_register(bank, config.mode_register),
    )?;

    fmc.set_refresh_count(count);

    console_println!(
        "[sdram] {} MiB at {:#010x}, refresh count {}",
        config.size / MIB,
        config.base,
        count
    );
    Ok(())
}

fn issue<F, C>(
    fmc: &mut F,
    clock: &C,
    config: &SdramConfig,
    command: MemoryCommand,
) -> Result<(), SdramError>
where
    F: SdramController + ?Sized,
    C: Clock + ?Sized,
{
    fmc.send_command(&command);
    let deadline = Deadline::after(clock, config.command_timeout);
    while fmc.is_busy() {
        if deadline.expired(clock) {
            return Err(SdramError::HardwareTimeout {
                command: command.mode,
            });
        }
        core::hint::spin_loop();
    }
    Ok(())
}
