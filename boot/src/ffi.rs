//! C ABI: the symbols the startup code and the consumer link against.
//!
//! Imported from C: the UART, the millisecond tick, the status LED, the
//! consumer's completion callback and its entry point. Exported: the board
//! entry point, the SDMMC2 interrupt vector and the block I/O calls.
use core::panic::PanicInfo;
use core::ptr::addr_of_mut;

use spin::Once;

use gungnir_board::console;
use gungnir_board::console_println;
use gungnir_board::drivers::sdmmc::{
    BlockRequest, CompletionEvent, Instance, IoNotify, LinkConfig, LinkError, Sdmmc,
    SdmmcDriver, SubmitFailure,
};
use gungnir_board::mem::{Fmc, MappedRegion, MemoryRegion, SdramConfig, SelfTestConfig, FMC_BASE};
use gungnir_board::time::Clock;

use crate::fault::{self, LinkErrorPolicy, StatusLed};
use crate::sequence::{self, Board, BootPolicy, Consumer};

extern "C" {
    fn board_putchar(byte: u8);
    fn board_ticks_ms() -> u64;
    fn board_led_toggle();
    fn notify_io_complete(direction: u32, buffer: *mut u8, byte_count: u32);
    fn hand_off(base: *mut u8, size: usize) -> !;
}

const POLICY: BootPolicy = BootPolicy::DEFAULT;

/// Return codes of the block I/O calls.
mod status {
    pub const OK: i32 = 0;
    pub const LINK_DOWN: i32 = -1;
    pub const BUSY: i32 = -2;
    pub const INVALID: i32 = -3;
    pub const NOT_READY: i32 = -4;
    pub const REJECTED: i32 = -5;
}

struct TickClock;

impl Clock for TickClock {
    fn now_us(&self) -> u64 {
        // SAFETY: plain read of the tick counter.
        unsafe { board_ticks_ms() }.saturating_mul(1000)
    }

    fn resolution_us(&self) -> u64 {
        1000
    }
}

struct Uart;

impl embedded_io::ErrorType for Uart {
    type Error = core::convert::Infallible;
}

impl embedded_io::Write for Uart {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        for &byte in buf {
            // SAFETY: blocking UART transmit.
            unsafe { board_putchar(byte) }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

static mut UART: Uart = Uart;

struct Led;

impl StatusLed for Led {
    fn toggle(&mut self) {
        // SAFETY: GPIO toggle, no shared state.
        unsafe { board_led_toggle() }
    }
}

struct ConsumerNotify {
    policy: LinkErrorPolicy,
}

impl IoNotify for ConsumerNotify {
    fn io_complete(&self, event: CompletionEvent) {
        report(event)
    }

    fn io_failed(&self, request: BlockRequest, _error: LinkError) {
        report(self.policy.on_failure(&request, &mut Led, &TickClock))
    }
}

/// A zero `byte_count` tells the consumer the request failed.
fn report(event: CompletionEvent) {
    // SAFETY: the consumer's callback is interrupt-safe by contract.
    unsafe {
        notify_io_complete(
            event.direction as u32,
            event.buffer as *mut u8,
            event.byte_count,
        )
    }
}

struct CConsumer;

impl Consumer for CConsumer {
    fn hand_off(&mut self, region: MemoryRegion) {
        // SAFETY: the region passed the self-test and nothing else uses it.
        unsafe { hand_off(region.as_ptr(), region.size()) }
    }
}

type Driver = SdmmcDriver<Sdmmc<TickClock>, TickClock, ConsumerNotify>;

static SDMMC: Once<Driver> = Once::new();

/// Board entry point, called by the startup code once clocks, MPU and pins
/// are set up.
#[no_mangle]
pub extern "C" fn board_main() -> ! {
    // SAFETY: the only reference ever taken to UART.
    console::init(unsafe { &mut *addr_of_mut!(UART) });
    console_println!("[boot] gungnir {}", env!("CARGO_PKG_VERSION"));

    let sdram = SdramConfig::W9825G6KH;
    // SAFETY: FMC_BASE is the controller's register block; this is the only
    // handle to it.
    let mut fmc = unsafe { Fmc::new(FMC_BASE as *mut u8) };
    // SAFETY: the SDRAM window is only touched through this handle until the
    // consumer takes it over.
    let mut memory = unsafe { MappedRegion::new(sdram.region()) };

    // SAFETY: the startup code enabled SDMMC2's clock and pins.
    let Some(host) = (unsafe { Sdmmc::claim(Instance::Sdmmc2, TickClock) }) else {
        console_println!("[boot] sdmmc2 already claimed");
        fault::halt(&mut Led, &TickClock, fault::BOOT_FAILURE_BLINK);
    };
    let storage = SDMMC.call_once(|| {
        SdmmcDriver::new(
            host,
            TickClock,
            ConsumerNotify {
                policy: POLICY.on_link_error,
            },
            LinkConfig::DEFAULT,
        )
    });

    let board = Board {
        fmc: &mut fmc,
        clock: &TickClock,
        sdram,
        memory: &mut memory,
        self_test: SelfTestConfig::DEFAULT,
        storage,
        policy: POLICY,
    };
    let err = match sequence::run(board, &mut CConsumer) {
        Ok(never) => match never {},
        Err(err) => err,
    };
    console_println!("[boot] {}", err);
    fault::halt(&mut Led, &TickClock, fault::BOOT_FAILURE_BLINK)
}

#[allow(non_snake_case)]
#[no_mangle]
pub extern "C" fn SDMMC2_IRQHandler() {
    if let Some(driver) = SDMMC.get() {
        driver.on_interrupt();
    }
}

fn status_code(result: Result<(), SubmitFailure>) -> i32 {
    match result {
        Ok(()) => status::OK,
        Err(SubmitFailure::LinkDown(_)) => status::LINK_DOWN,
        Err(SubmitFailure::Busy(_)) => status::BUSY,
        Err(SubmitFailure::NullBuffer)
        | Err(SubmitFailure::MisalignedBuffer(_))
        | Err(SubmitFailure::EmptyRequest)
        | Err(SubmitFailure::OutOfRange { .. }) => status::INVALID,
        Err(SubmitFailure::NotReady(_)) => status::NOT_READY,
        Err(SubmitFailure::Rejected(_)) => status::REJECTED,
    }
}

/// # Safety
/// `buffer` must hold `block_count * 512` writable bytes, word aligned, and
/// stay untouched until `notify_io_complete` reports it.
#[no_mangle]
pub unsafe extern "C" fn sdmmc_read_blocks_it(
    buffer: *mut u8,
    start_block: u32,
    block_count: u32,
) -> i32 {
    let Some(driver) = SDMMC.get() else {
        return status::LINK_DOWN;
    };
    status_code(driver.submit_read(buffer, start_block, block_count))
}

/// # Safety
/// `buffer` must hold `block_count * 512` readable bytes, word aligned, and
/// stay unmodified until `notify_io_complete` reports it.
#[no_mangle]
pub unsafe extern "C" fn sdmmc_write_blocks_it(
    buffer: *const u8,
    start_block: u32,
    block_count: u32,
) -> i32 {
    let Some(driver) = SDMMC.get() else {
        return status::LINK_DOWN;
    };
    status_code(driver.submit_write(buffer, start_block, block_count))
}

/// Card size in bytes, zero while the link is down.
#[no_mangle]
pub extern "C" fn get_sdcard_capacity() -> u64 {
    SDMMC.get().map_or(0, |driver| driver.capacity())
}

/// Re-initialize the link after an error. Zero on success.
#[no_mangle]
pub extern "C" fn sdmmc_recover() -> i32 {
    let Some(driver) = SDMMC.get() else {
        return status::LINK_DOWN;
    };
    match driver.recover() {
        Ok(_) => status::OK,
        Err(err) => {
            console_println!("[sdmmc] recovery failed: {}", err);
            status::LINK_DOWN
        }
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    // The console may be the thing that panicked.
    if let Some(mut console) = console::CONSOLE.try_lock() {
        use core::fmt::Write;
        let _ = writeln!(console, "[panic] {}", info);
    }
    fault::halt(&mut Led, &TickClock, fault::PANIC_BLINK)
}
