use super::fault::{self, LinkErrorPolicy, StatusLed};
use super::*;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

use gungnir_board::drivers::sdmmc::{
    BlockRequest, CardState, CompletionEvent, Direction, HostError, LinkConfig, LinkInitFailure,
    SdmmcDriver,
};
use gungnir_board::mem::{
    CommandMode, MemoryRegion, RegionAccess, SdramConfig, SdramError, SelfTestConfig,
    VerificationFailure, MIB,
};
use gungnir_board::mock::{FakeFmc, FakeSdHost, RecordingNotify, StepClock};

#[derive(Default)]
struct RecordingConsumer {
    regions: Vec<MemoryRegion>,
}

impl Consumer for RecordingConsumer {
    fn hand_off(&mut self, region: MemoryRegion) {
        self.regions.push(region);
    }
}

/// Memory whose data lines are dead: every read returns zero.
struct DeadRam {
    size: usize,
}

impl RegionAccess for DeadRam {
    fn region(&self) -> MemoryRegion {
        MemoryRegion::new(0xC000_0000, self.size)
    }

    fn write_byte(&mut self, _offset: usize, _value: u8) {}

    fn read_byte(&self, _offset: usize) -> u8 {
        0
    }
}

/// Fails `failures` times, then connects.
struct FlakyLink {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyLink {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

const LINK_DOWN: LinkInitFailure = LinkInitFailure::Activation(HostError::PowerUpTimeout);

impl LinkControl for FlakyLink {
    fn connect(&self) -> Result<(), LinkInitFailure> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        if call < self.failures {
            Err(LINK_DOWN)
        } else {
            Ok(())
        }
    }
}

fn policy(on_link_failure: LinkFailureAction) -> BootPolicy {
    BootPolicy {
        on_link_failure,
        ..BootPolicy::DEFAULT
    }
}

// ---- full sequence ----

#[test]
fn boots_and_hands_off_32_mib() {
    let mut fmc = FakeFmc::new();
    let clock = StepClock::new(10);
    let mut ram = vec![0u8; 32 * MIB];
    let notify = RecordingNotify::new();
    let storage = SdmmcDriver::new(
        FakeSdHost::new(8 * 1024 * 1024),
        StepClock::new(1_000),
        &notify,
        LinkConfig::DEFAULT,
    );
    let mut consumer = RecordingConsumer::default();

    let board = Board {
        fmc: &mut fmc,
        clock: &clock,
        sdram: SdramConfig::W9825G6KH,
        memory: ram.as_mut_slice(),
        self_test: SelfTestConfig::DEFAULT,
        storage: &storage,
        policy: BootPolicy::DEFAULT,
    };
    assert_eq!(run(board, &mut consumer), Err(BootError::ConsumerReturned));

    let expected = MemoryRegion::new(ram.as_ptr() as usize, 32 * MIB);
    assert_eq!(consumer.regions, vec![expected]);
    assert_eq!(storage.card_state(), CardState::Ready);
    assert_eq!(storage.capacity(), 4 * 1024 * MIB as u64);
    assert!(!fmc.ops().is_empty());
}

#[test]
fn stuck_memory_controller_stops_boot() {
    let mut fmc = FakeFmc::new();
    fmc.stick_on(CommandMode::AutoRefresh);
    let clock = StepClock::new(1_000);
    let mut ram = vec![0u8; MIB];
    let storage = FlakyLink::new(0);
    let mut consumer = RecordingConsumer::default();

    let board = Board {
        fmc: &mut fmc,
        clock: &clock,
        sdram: SdramConfig::W9825G6KH,
        memory: ram.as_mut_slice(),
        self_test: SelfTestConfig::DEFAULT,
        storage: &storage,
        policy: BootPolicy::DEFAULT,
    };
    assert_eq!(
        run(board, &mut consumer),
        Err(BootError::Memory(SdramError::HardwareTimeout {
            command: CommandMode::AutoRefresh
        }))
    );
    assert!(consumer.regions.is_empty());
    assert_eq!(storage.calls(), 0);
    assert_eq!(ram[0], 0);
}

#[test]
fn failed_self_test_stops_boot() {
    let mut fmc = FakeFmc::new();
    let clock = StepClock::new(10);
    let mut ram = DeadRam { size: 32 * MIB };
    let storage = FlakyLink::new(0);
    let mut consumer = RecordingConsumer::default();

    let board = Board {
        fmc: &mut fmc,
        clock: &clock,
        sdram: SdramConfig::W9825G6KH,
        memory: &mut ram,
        self_test: SelfTestConfig::DEFAULT,
        storage: &storage,
        policy: BootPolicy::DEFAULT,
    };
    assert!(matches!(
        run(board, &mut consumer),
        Err(BootError::Verification(VerificationFailure::Mismatch { offset: 0, .. }))
    ));
    assert!(consumer.regions.is_empty());
    assert_eq!(storage.calls(), 0);
}

#[test]
fn link_failure_aborts_by_default() {
    let mut fmc = FakeFmc::new();
    let clock = StepClock::new(10);
    let mut ram = vec![0u8; 2 * MIB];
    let notify = RecordingNotify::new();
    let storage = SdmmcDriver::new(
        FakeSdHost::new(1024 * 1024),
        StepClock::new(1_000),
        &notify,
        LinkConfig::DEFAULT,
    );
    storage.host().fail_identify(HostError::CommandTimeout(0));
    let mut consumer = RecordingConsumer::default();

    let board = Board {
        fmc: &mut fmc,
        clock: &clock,
        sdram: SdramConfig::W9825G6KH,
        memory: ram.as_mut_slice(),
        self_test: SelfTestConfig::DEFAULT,
        storage: &storage,
        policy: BootPolicy::DEFAULT,
    };
    assert_eq!(
        run(board, &mut consumer),
        Err(BootError::Link(LinkInitFailure::Activation(
            HostError::CommandTimeout(0)
        )))
    );
    assert!(consumer.regions.is_empty());
    assert_eq!(storage.card_state(), CardState::Uninitialized);
}

#[test]
fn degraded_boot_hands_off_without_storage() {
    let mut fmc = FakeFmc::new();
    let clock = StepClock::new(10);
    let mut ram = vec![0u8; 2 * MIB];
    let storage = FlakyLink::new(u32::MAX);
    let mut consumer = RecordingConsumer::default();

    let board = Board {
        fmc: &mut fmc,
        clock: &clock,
        sdram: SdramConfig::W9825G6KH,
        memory: ram.as_mut_slice(),
        self_test: SelfTestConfig::DEFAULT,
        storage: &storage,
        policy: policy(LinkFailureAction::Degrade),
    };
    assert_eq!(run(board, &mut consumer), Err(BootError::ConsumerReturned));
    assert_eq!(consumer.regions.len(), 1);
    assert_eq!(storage.calls(), 1);
}

// ---- storage policy ----

#[test]
fn retry_until_link_comes_up() {
    let storage = FlakyLink::new(2);
    assert_eq!(
        connect_storage(&storage, &policy(LinkFailureAction::Retry { attempts: 2 })),
        Ok(StorageStatus::Online)
    );
    assert_eq!(storage.calls(), 3);
}

#[test]
fn retries_exhausted() {
    let storage = FlakyLink::new(5);
    assert_eq!(
        connect_storage(&storage, &policy(LinkFailureAction::Retry { attempts: 2 })),
        Err(BootError::Link(LINK_DOWN))
    );
    assert_eq!(storage.calls(), 3);
}

#[test]
fn abort_tries_once() {
    let storage = FlakyLink::new(1);
    assert_eq!(
        connect_storage(&storage, &BootPolicy::DEFAULT),
        Err(BootError::Link(LINK_DOWN))
    );
    assert_eq!(storage.calls(), 1);
}

#[test]
fn degrade_reports_offline() {
    let storage = FlakyLink::new(1);
    assert_eq!(
        connect_storage(&storage, &policy(LinkFailureAction::Degrade)),
        Ok(StorageStatus::Offline(LINK_DOWN))
    );
}

// ---- fault signalling ----

#[derive(Default)]
struct CountingLed {
    toggles: u32,
}

impl StatusLed for CountingLed {
    fn toggle(&mut self) {
        self.toggles += 1;
    }
}

#[test]
fn blink_toggles_then_waits_period() {
    let mut led = CountingLed::default();
    let clock = StepClock::new(1_000);
    fault::blink(&mut led, &clock, fault::LINK_ERROR_BLINK);
    fault::blink(&mut led, &clock, fault::LINK_ERROR_BLINK);
    assert_eq!(led.toggles, 2);
    assert!(clock.peek() >= 2 * 1_000_000);
}

#[test]
fn blink_periods() {
    assert_eq!(fault::BOOT_FAILURE_BLINK, Duration::from_secs(4));
    assert_eq!(fault::LINK_ERROR_BLINK, Duration::from_secs(1));
}

#[test]
#[cfg(not(feature = "report-link-errors"))]
fn link_errors_halt_by_default() {
    assert_eq!(LinkErrorPolicy::DEFAULT, LinkErrorPolicy::Halt);
    assert_eq!(BootPolicy::default().on_link_error, LinkErrorPolicy::Halt);
}

#[test]
#[cfg(feature = "report-link-errors")]
fn feature_selects_reporting() {
    assert_eq!(BootPolicy::default().on_link_error, LinkErrorPolicy::Report);
}

#[test]
fn reported_failure_completes_with_zero_bytes() {
    let mut led = CountingLed::default();
    let clock = StepClock::new(1_000);
    let request = BlockRequest {
        direction: Direction::Write,
        buffer: 0x2400_0000,
        start_block: 12,
        block_count: 4,
    };
    assert_eq!(
        LinkErrorPolicy::Report.on_failure(&request, &mut led, &clock),
        CompletionEvent {
            direction: Direction::Write,
            buffer: 0x2400_0000,
            byte_count: 0,
        }
    );
    assert_eq!(led.toggles, 0);
    assert_eq!(clock.peek(), 0);
}
