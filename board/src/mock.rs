//! Host-side fakes for the board traits.
//!
//! Enabled for this crate's own tests and, through the `mock` feature, for
//! the boot crate's.
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::convert::Infallible;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::drivers::sdmmc::{
    BlockRequest, CardRegisters, CardStatus, CompletionEvent, Direction, HostError, HostEvent,
    IoNotify, LinkConfig, LinkError, SdHost,
};
use crate::mem::sdram::{CommandMode, MemoryCommand, SdramConfig, SdramController};
use crate::time::Clock;

// ---- time ----

/// A clock that moves forward by a fixed step every time it is read.
pub struct StepClock {
    now: AtomicU64,
    step: u64,
}

impl StepClock {
    pub const fn new(step_us: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            step: step_us,
        }
    }

    /// Current time, without advancing.
    pub fn peek(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

impl Clock for StepClock {
    fn now_us(&self) -> u64 {
        self.now.fetch_add(self.step, Ordering::Relaxed)
    }

    fn resolution_us(&self) -> u64 {
        self.step.max(1)
    }
}

// ---- memory controller ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmcOp {
    Configure,
    Command(MemoryCommand),
    RefreshCount(u32),
}

/// Records what the sequencer asks of the controller.
#[derive(Default)]
pub struct FakeFmc {
    ops: Vec<FmcOp>,
    busy_polls: u32,
    remaining: AtomicU32,
    stuck: Option<CommandMode>,
    wedged: bool,
}

impl FakeFmc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report busy for `polls` polls after every command.
    pub fn busy_for(&mut self, polls: u32) {
        self.busy_polls = polls;
    }

    /// Stay busy forever once a command of this mode is sent.
    pub fn stick_on(&mut self, mode: CommandMode) {
        self.stuck = Some(mode);
    }

    pub fn ops(&self) -> Vec<FmcOp> {
        self.ops.clone()
    }
}

impl SdramController for FakeFmc {
    fn configure(&mut self, _config: &SdramConfig) {
        self.ops.push(FmcOp::Configure);
    }

    fn send_command(&mut self, command: &MemoryCommand) {
        self.ops.push(FmcOp::Command(*command));
        self.remaining.store(self.busy_polls, Ordering::Relaxed);
        if self.stuck == Some(command.mode) {
            self.wedged = true;
        }
    }

    fn is_busy(&self) -> bool {
        if self.wedged {
            return true;
        }
        self.remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn set_refresh_count(&mut self, count: u32) {
        self.ops.push(FmcOp::RefreshCount(count));
    }
}

// ---- SD host ----

struct FakeHostState {
    registers: CardRegisters,
    ready_after: u32,
    identify_error: Option<HostError>,
    start_error: Option<HostError>,
    started: Vec<BlockRequest>,
    pending: Option<HostEvent>,
    resets: u32,
}

/// An SD host with a scripted card behind it.
pub struct FakeSdHost {
    state: Mutex<FakeHostState>,
    polls: AtomicU32,
}

impl FakeSdHost {
    /// A high-capacity card of `block_count` blocks (a multiple of 1024).
    pub fn new(block_count: u64) -> Self {
        Self {
            state: Mutex::new(FakeHostState {
                registers: CardRegisters {
                    cid: fake_cid(),
                    csd: csd_v2(block_count),
                    rca: 0x1234,
                    high_capacity: true,
                },
                ready_after: 0,
                identify_error: None,
                start_error: None,
                started: Vec::new(),
                pending: None,
                resets: 0,
            }),
            polls: AtomicU32::new(0),
        }
    }

    /// The next `polls` status polls report the card busy programming.
    pub fn set_ready_after(&self, polls: u32) {
        self.state.lock().ready_after = polls;
        self.polls.store(0, Ordering::Relaxed);
    }

    /// The next identification fails with `error`.
    pub fn fail_identify(&self, error: HostError) {
        self.state.lock().identify_error = Some(error);
    }

    /// The next transfer start fails with `error`.
    pub fn reject_next_start(&self, error: HostError) {
        self.state.lock().start_error = Some(error);
    }

    /// Queue an event for the next `service_interrupt`.
    pub fn raise(&self, event: HostEvent) {
        self.state.lock().pending = Some(event);
    }

    pub fn started(&self) -> Vec<BlockRequest> {
        self.state.lock().started.clone()
    }

    pub fn status_polls(&self) -> u32 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn resets(&self) -> u32 {
        self.state.lock().resets
    }
}

impl SdHost for FakeSdHost {
    fn name(&self) -> &'static str {
        "fake-sdmmc"
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.resets += 1;
        state.pending = None;
    }

    fn identify(&self, _config: &LinkConfig) -> Result<CardRegisters, HostError> {
        let mut state = self.state.lock();
        match state.identify_error.take() {
            Some(err) => Err(err),
            None => Ok(state.registers),
        }
    }

    fn configure_bus(&self, _config: &LinkConfig) -> Result<(), HostError> {
        Ok(())
    }

    fn card_status(&self) -> Result<CardStatus, HostError> {
        let poll = self.polls.fetch_add(1, Ordering::Relaxed) + 1;
        if poll > self.state.lock().ready_after {
            Ok(CardStatus::Transfer)
        } else {
            Ok(CardStatus::Programming)
        }
    }

    fn start_read(&self, buffer: *mut u8, start_block: u32, block_count: u32) -> Result<(), HostError> {
        self.start(BlockRequest {
            direction: Direction::Read,
            buffer: buffer as usize,
            start_block,
            block_count,
        })
    }

    fn start_write(
        &self,
        buffer: *const u8,
        start_block: u32,
        block_count: u32,
    ) -> Result<(), HostError> {
        self.start(BlockRequest {
            direction: Direction::Write,
            buffer: buffer as usize,
            start_block,
            block_count,
        })
    }

    fn service_interrupt(&self) -> Option<HostEvent> {
        self.state.lock().pending.take()
    }
}

impl FakeSdHost {
    fn start(&self, request: BlockRequest) -> Result<(), HostError> {
        let mut state = self.state.lock();
        if let Some(err) = state.start_error.take() {
            return Err(err);
        }
        state.started.push(request);
        Ok(())
    }
}

/// Set bits `msb..=lsb` of a register held most significant word first.
pub fn set_field(raw: &mut [u32; 4], msb: u32, lsb: u32, value: u32) {
    for bit in lsb..=msb {
        let word = 3 - (bit / 32) as usize;
        let mask = 1 << (bit % 32);
        if value >> (bit - lsb) & 1 != 0 {
            raw[word] |= mask;
        } else {
            raw[word] &= !mask;
        }
    }
}

/// Version 2 CSD for a card of `block_count` blocks.
pub fn csd_v2(block_count: u64) -> [u32; 4] {
    let mut raw = [0; 4];
    set_field(&mut raw, 127, 126, 1);
    set_field(&mut raw, 103, 96, 0x32);
    set_field(&mut raw, 69, 48, (block_count / 1024).saturating_sub(1) as u32);
    raw
}

fn fake_cid() -> [u32; 4] {
    let mut raw = [0; 4];
    set_field(&mut raw, 127, 120, 0x03);
    set_field(&mut raw, 119, 104, u32::from(u16::from_be_bytes(*b"SD")));
    for (i, &c) in b"GUNGN".iter().enumerate() {
        let msb = 103 - 8 * i as u32;
        set_field(&mut raw, msb, msb - 7, u32::from(c));
    }
    set_field(&mut raw, 63, 56, 0x21);
    set_field(&mut raw, 55, 24, 0xDEAD_BEEF);
    set_field(&mut raw, 19, 12, 24);
    set_field(&mut raw, 11, 8, 6);
    raw
}

// ---- completion hooks ----

/// Remembers every completion and failure it is handed.
#[derive(Default)]
pub struct RecordingNotify {
    completions: Mutex<Vec<CompletionEvent>>,
    failures: Mutex<Vec<(BlockRequest, LinkError)>>,
}

impl RecordingNotify {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completions(&self) -> Vec<CompletionEvent> {
        self.completions.lock().clone()
    }

    pub fn failures(&self) -> Vec<(BlockRequest, LinkError)> {
        self.failures.lock().clone()
    }
}

impl IoNotify for RecordingNotify {
    fn io_complete(&self, event: CompletionEvent) {
        self.completions.lock().push(event);
    }

    fn io_failed(&self, request: BlockRequest, error: LinkError) {
        self.failures.lock().push((request, error));
    }
}

// ---- console ----

/// Console sink that keeps everything written to it.
pub struct CaptureSink {
    log: CaptureLog,
}

/// Shared view of a `CaptureSink`'s bytes.
#[derive(Clone, Default)]
pub struct CaptureLog(Arc<Mutex<Vec<u8>>>);

impl CaptureLog {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            log: CaptureLog::default(),
        }
    }

    pub fn log(&self) -> CaptureLog {
        self.log.clone()
    }
}

impl Default for CaptureSink {
    fn default() -> Self {
        Self::new()
    }
}

impl embedded_io::ErrorType for CaptureSink {
    type Error = Infallible;
}

impl embedded_io::Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.log.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
