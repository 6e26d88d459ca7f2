use super::card::field;
use super::*;
use crate::mock::{csd_v2, set_field, FakeSdHost, RecordingNotify, StepClock};
use crate::time::duration_us;
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicPtr, Ordering};
use core::time::Duration;
use spin::Mutex;

/// 4 GiB card.
const CARD_BLOCKS: u64 = 8 * 1024 * 1024;

type TestDriver<'a> = SdmmcDriver<FakeSdHost, StepClock, &'a RecordingNotify>;

fn driver(notify: &RecordingNotify) -> TestDriver<'_> {
    SdmmcDriver::new(
        FakeSdHost::new(CARD_BLOCKS),
        StepClock::new(1_000),
        notify,
        LinkConfig::DEFAULT,
    )
}

fn ready_driver(notify: &RecordingNotify) -> TestDriver<'_> {
    let driver = driver(notify);
    driver.init_link().unwrap();
    driver
}

fn dma_buffer(blocks: usize) -> Vec<u32> {
    vec![0u32; blocks * BLOCK_SIZE as usize / 4]
}

// ---- card registers ----

#[test]
fn r1_current_state() {
    assert_eq!(CardStatus::from_r1(0x0000_0900), CardStatus::Transfer);
    assert_eq!(CardStatus::from_r1(7 << 9), CardStatus::Programming);
    assert_eq!(CardStatus::from_r1(15 << 9), CardStatus::Reserved(15));
    assert!(!CardStatus::from_r1(3 << 9).is_transfer());
}

#[test]
fn csd_v2_capacity() {
    let csd = Csd::decode(&csd_v2(CARD_BLOCKS)).unwrap();
    assert_eq!(csd.version, CsdVersion::V2);
    assert_eq!(csd.block_count, CARD_BLOCKS);
    assert_eq!(csd.max_transfer_rate, 0x32);
}

#[test]
fn csd_v1_capacity() {
    let mut raw = [0u32; 4];
    set_field(&mut raw, 83, 80, 10);
    set_field(&mut raw, 73, 62, 0xFFF);
    set_field(&mut raw, 49, 47, 7);
    let csd = Csd::decode(&raw).unwrap();
    assert_eq!(csd.version, CsdVersion::V1);
    // 4096 << 9 blocks of 1024 bytes: 2 GiB.
    assert_eq!(csd.block_count, 4 * 1024 * 1024);
}

#[test]
fn csd_reserved_structure_rejected() {
    let mut raw = [0u32; 4];
    set_field(&mut raw, 127, 126, 3);
    assert_eq!(Csd::decode(&raw), None);
}

#[test]
fn field_spans_words() {
    let mut raw = [0u32; 4];
    set_field(&mut raw, 69, 48, 0x2A_5A5A);
    assert_eq!(field(&raw, 69, 48), 0x2A_5A5A);
    assert_eq!(raw[1] & 0x3F, 0x2A);
}

#[test]
fn cid_decode() {
    let host = FakeSdHost::new(CARD_BLOCKS);
    let registers = host.identify(&LinkConfig::DEFAULT).unwrap();
    let cid = Cid::decode(&registers.cid);
    assert_eq!(cid.manufacturer_id, 3);
    assert_eq!(&cid.oem_id, b"SD");
    assert_eq!(cid.product_name(), "GUNGN");
    assert_eq!(cid.revision, (2, 1));
    assert_eq!(cid.serial, 0xDEAD_BEEF);
    assert_eq!((cid.manufactured_year, cid.manufactured_month), (2024, 6));
}

// ---- link ----

#[test]
fn init_link_brings_card_up() {
    let notify = RecordingNotify::new();
    let driver = driver(&notify);
    assert_eq!(driver.card_state(), CardState::Uninitialized);
    assert_eq!(driver.capacity(), 0);

    let info = driver.init_link().unwrap();
    assert_eq!(info.block_count(), CARD_BLOCKS);
    assert!(info.high_capacity);
    assert_eq!(driver.card_state(), CardState::Ready);
    assert_eq!(driver.capacity(), CARD_BLOCKS * 512);
    assert_eq!(driver.block_size(), 512);
    assert_eq!(driver.host().resets(), 1);
}

#[test]
fn init_link_failure_leaves_link_down() {
    let notify = RecordingNotify::new();
    let driver = driver(&notify);
    driver.host().fail_identify(HostError::CommandTimeout(8));
    assert_eq!(
        driver.init_link(),
        Err(LinkInitFailure::Activation(HostError::CommandTimeout(8)))
    );
    assert_eq!(driver.card_state(), CardState::Uninitialized);
    assert_eq!(driver.capacity(), 0);
}

#[test]
fn init_link_waits_for_transfer_state() {
    let notify = RecordingNotify::new();
    let driver = driver(&notify);
    driver.host().set_ready_after(3);
    driver.init_link().unwrap();
    assert_eq!(driver.host().status_polls(), 4);
}

#[test]
fn wait_ready_within_timeout() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    driver.host().set_ready_after(3);
    assert_eq!(driver.wait_ready(Duration::from_millis(10)), Ok(4));
}

#[test]
fn wait_ready_times_out_on_clock() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    driver.host().set_ready_after(50);
    let err = driver.wait_ready(Duration::from_millis(10)).unwrap_err();
    assert_eq!(err.last, Ok(CardStatus::Programming));
    // One poll per 1 ms clock step.
    assert!((9..=11).contains(&err.polls), "polls = {}", err.polls);
}

#[test]
fn wait_ready_polls_once_with_zero_timeout() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    driver.host().set_ready_after(0);
    assert_eq!(driver.wait_ready(Duration::ZERO), Ok(1));
}

// ---- submission ----

#[test]
fn submit_before_init_is_refused() {
    let notify = RecordingNotify::new();
    let driver = driver(&notify);
    let mut buf = dma_buffer(1);
    let result = unsafe { driver.submit_read(buf.as_mut_ptr().cast(), 0, 1) };
    assert_eq!(result, Err(SubmitFailure::LinkDown(CardState::Uninitialized)));
    assert!(driver.host().started().is_empty());
}

#[test]
fn write_completes_exactly_once() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    let buf = dma_buffer(16);
    let ptr = buf.as_ptr() as *const u8;

    unsafe { driver.submit_write(ptr, 1024, 16) }.unwrap();
    assert_eq!(
        driver.host().started(),
        vec![BlockRequest {
            direction: Direction::Write,
            buffer: ptr as usize,
            start_block: 1024,
            block_count: 16,
        }]
    );
    assert_eq!(driver.card_state(), CardState::Transferring);
    assert!(notify.completions().is_empty());

    driver.host().raise(HostEvent::TransferComplete(Direction::Write));
    driver.on_interrupt();
    assert_eq!(
        notify.completions(),
        vec![CompletionEvent {
            direction: Direction::Write,
            buffer: ptr as usize,
            byte_count: 8192,
        }]
    );
    assert_eq!(driver.card_state(), CardState::Ready);

    // A second completion for the same request is dropped.
    driver.host().raise(HostEvent::TransferComplete(Direction::Write));
    driver.on_interrupt();
    assert_eq!(notify.completions().len(), 1);
    assert_eq!(driver.spurious_completions(), 1);
}

#[test]
fn second_request_same_direction_is_busy() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    let mut first = dma_buffer(1);
    let mut second = dma_buffer(1);

    unsafe { driver.submit_read(first.as_mut_ptr().cast(), 0, 1) }.unwrap();
    assert_eq!(
        unsafe { driver.submit_read(second.as_mut_ptr().cast(), 8, 1) },
        Err(SubmitFailure::Busy(Direction::Read))
    );
    assert_eq!(driver.host().started().len(), 1);

    driver.host().raise(HostEvent::TransferComplete(Direction::Read));
    driver.on_interrupt();
    unsafe { driver.submit_read(second.as_mut_ptr().cast(), 8, 1) }.unwrap();
    assert_eq!(driver.host().started().len(), 2);
}

#[test]
fn completion_for_idle_direction_is_spurious() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    let mut buf = dma_buffer(1);
    unsafe { driver.submit_read(buf.as_mut_ptr().cast(), 0, 1) }.unwrap();

    driver.host().raise(HostEvent::TransferComplete(Direction::Write));
    driver.on_interrupt();
    assert!(notify.completions().is_empty());
    assert_eq!(driver.spurious_completions(), 1);
    assert_eq!(driver.card_state(), CardState::Transferring);
}

#[test]
fn interrupt_without_event_does_nothing() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    driver.on_interrupt();
    assert!(notify.completions().is_empty());
    assert_eq!(driver.spurious_completions(), 0);
}

#[test]
fn invalid_requests_rejected_before_hardware() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    let mut buf = dma_buffer(2);
    let ptr: *mut u8 = buf.as_mut_ptr().cast();
    let last = CARD_BLOCKS as u32 - 1;

    unsafe {
        assert_eq!(
            driver.submit_read(core::ptr::null_mut(), 0, 1),
            Err(SubmitFailure::NullBuffer)
        );
        assert_eq!(
            driver.submit_read(ptr.add(2), 0, 1),
            Err(SubmitFailure::MisalignedBuffer(ptr as usize + 2))
        );
        assert_eq!(driver.submit_read(ptr, 0, 0), Err(SubmitFailure::EmptyRequest));
        assert_eq!(
            driver.submit_read(ptr, last, 2),
            Err(SubmitFailure::OutOfRange {
                start_block: last,
                block_count: 2
            })
        );
        assert_eq!(
            driver.submit_write(ptr, u32::MAX, 2),
            Err(SubmitFailure::OutOfRange {
                start_block: u32::MAX,
                block_count: 2
            })
        );
        driver.submit_read(ptr, last, 1).unwrap();
    }
    assert_eq!(driver.host().started().len(), 1);
    assert_eq!(driver.host().status_polls(), 2);
}

#[test]
fn rejected_start_frees_slot() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    let mut buf = dma_buffer(4);
    driver.host().reject_next_start(HostError::CommandCrc(18));

    assert_eq!(
        unsafe { driver.submit_read(buf.as_mut_ptr().cast(), 0, 4) },
        Err(SubmitFailure::Rejected(HostError::CommandCrc(18)))
    );
    assert_eq!(driver.card_state(), CardState::Ready);
    unsafe { driver.submit_read(buf.as_mut_ptr().cast(), 0, 4) }.unwrap();
}

#[test]
fn card_not_ready_frees_slot() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    let buf = dma_buffer(1);
    driver.host().set_ready_after(10_000);

    let result = unsafe { driver.submit_write(buf.as_ptr().cast(), 0, 1) };
    assert!(matches!(result, Err(SubmitFailure::NotReady(_))));
    assert!(driver.host().started().is_empty());

    driver.host().set_ready_after(0);
    unsafe { driver.submit_write(buf.as_ptr().cast(), 0, 1) }.unwrap();
}

#[test]
fn read_and_write_in_flight_complete_independently() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    let mut rbuf = dma_buffer(4);
    let wbuf = dma_buffer(2);
    let rptr: *mut u8 = rbuf.as_mut_ptr().cast();
    let wptr: *const u8 = wbuf.as_ptr().cast();

    unsafe {
        driver.submit_read(rptr, 100, 4).unwrap();
        driver.submit_write(wptr, 200, 2).unwrap();
    }
    assert_eq!(driver.host().started().len(), 2);
    assert_eq!(driver.card_state(), CardState::Transferring);

    driver.host().raise(HostEvent::TransferComplete(Direction::Write));
    driver.on_interrupt();
    assert_eq!(
        notify.completions(),
        vec![CompletionEvent {
            direction: Direction::Write,
            buffer: wptr as usize,
            byte_count: 1024,
        }]
    );
    // The read is still outstanding.
    assert_eq!(driver.card_state(), CardState::Transferring);
    assert_eq!(
        unsafe { driver.submit_read(rptr, 0, 1) },
        Err(SubmitFailure::Busy(Direction::Read))
    );

    driver.host().raise(HostEvent::TransferComplete(Direction::Read));
    driver.on_interrupt();
    assert_eq!(
        notify.completions(),
        vec![
            CompletionEvent {
                direction: Direction::Write,
                buffer: wptr as usize,
                byte_count: 1024,
            },
            CompletionEvent {
                direction: Direction::Read,
                buffer: rptr as usize,
                byte_count: 2048,
            },
        ]
    );
    assert_eq!(driver.card_state(), CardState::Ready);
    assert_eq!(driver.spurious_completions(), 0);
    assert!(notify.failures().is_empty());
}

// ---- link errors ----

#[test]
fn link_error_fails_both_directions() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    let mut rbuf = dma_buffer(1);
    let wbuf = dma_buffer(3);
    let rptr: *mut u8 = rbuf.as_mut_ptr().cast();
    let wptr: *const u8 = wbuf.as_ptr().cast();
    unsafe {
        driver.submit_read(rptr, 7, 1).unwrap();
        driver.submit_write(wptr, 9, 3).unwrap();
    }

    driver.host().raise(HostEvent::LinkError(LinkError::Overrun));
    driver.on_interrupt();

    assert!(notify.completions().is_empty());
    assert_eq!(
        notify.failures(),
        vec![
            (
                BlockRequest {
                    direction: Direction::Read,
                    buffer: rptr as usize,
                    start_block: 7,
                    block_count: 1,
                },
                LinkError::Overrun
            ),
            (
                BlockRequest {
                    direction: Direction::Write,
                    buffer: wptr as usize,
                    start_block: 9,
                    block_count: 3,
                },
                LinkError::Overrun
            ),
        ]
    );
    assert_eq!(driver.card_state(), CardState::Error);
    driver.recover().unwrap();
    assert_eq!(driver.card_state(), CardState::Ready);
}

/// Fake host that runs the driver's interrupt handler from inside the next
/// status poll, as a transfer error would preempt a waiting submitter.
struct InterruptingHost {
    inner: FakeSdHost,
    driver: AtomicPtr<InterruptingDriver>,
    next: Mutex<Option<HostEvent>>,
}

type InterruptingDriver = SdmmcDriver<InterruptingHost, StepClock, &'static RecordingNotify>;

impl InterruptingHost {
    fn interrupt_on_next_status(&self, event: HostEvent) {
        *self.next.lock() = Some(event);
    }
}

impl SdHost for InterruptingHost {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn reset(&self) {
        self.inner.reset()
    }

    fn identify(&self, config: &LinkConfig) -> Result<CardRegisters, HostError> {
        self.inner.identify(config)
    }

    fn configure_bus(&self, config: &LinkConfig) -> Result<(), HostError> {
        self.inner.configure_bus(config)
    }

    fn card_status(&self) -> Result<CardStatus, HostError> {
        let next = self.next.lock().take();
        if let Some(event) = next {
            self.inner.raise(event);
            let driver = self.driver.load(Ordering::SeqCst);
            if !driver.is_null() {
                // Set by the test to a driver that outlives every call.
                unsafe { (*driver).on_interrupt() };
            }
        }
        self.inner.card_status()
    }

    fn start_read(&self, buffer: *mut u8, start_block: u32, block_count: u32) -> Result<(), HostError> {
        self.inner.start_read(buffer, start_block, block_count)
    }

    fn start_write(
        &self,
        buffer: *const u8,
        start_block: u32,
        block_count: u32,
    ) -> Result<(), HostError> {
        self.inner.start_write(buffer, start_block, block_count)
    }

    fn service_interrupt(&self) -> Option<HostEvent> {
        self.inner.service_interrupt()
    }
}

#[test]
fn link_error_while_waiting_for_card_refuses_submission() {
    let notify: &'static RecordingNotify = Box::leak(Box::new(RecordingNotify::new()));
    let driver: InterruptingDriver = SdmmcDriver::new(
        InterruptingHost {
            inner: FakeSdHost::new(CARD_BLOCKS),
            driver: AtomicPtr::new(core::ptr::null_mut()),
            next: Mutex::new(None),
        },
        StepClock::new(1_000),
        notify,
        LinkConfig::DEFAULT,
    );
    driver
        .host()
        .driver
        .store(&driver as *const InterruptingDriver as *mut _, Ordering::SeqCst);
    driver.init_link().unwrap();

    let mut rbuf = dma_buffer(1);
    let wbuf = dma_buffer(1);
    unsafe { driver.submit_read(rbuf.as_mut_ptr().cast(), 0, 1) }.unwrap();

    driver
        .host()
        .interrupt_on_next_status(HostEvent::LinkError(LinkError::DataCrc));
    assert_eq!(
        unsafe { driver.submit_write(wbuf.as_ptr().cast(), 0, 1) },
        Err(SubmitFailure::LinkDown(CardState::Error))
    );

    // Only the read reached the hardware, and only the read was failed.
    assert_eq!(driver.host().inner.started().len(), 1);
    assert_eq!(notify.failures().len(), 1);
    assert_eq!(notify.failures()[0].0.direction, Direction::Read);
    assert!(notify.completions().is_empty());
    assert_eq!(driver.card_state(), CardState::Error);

    // Neither slot is left behind, so the link comes back.
    driver.recover().unwrap();
    unsafe { driver.submit_write(wbuf.as_ptr().cast(), 0, 1) }.unwrap();
    assert_eq!(driver.host().inner.started().len(), 2);
}

#[test]
fn link_error_fails_request_and_recovers() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    let mut buf = dma_buffer(8);
    let ptr: *mut u8 = buf.as_mut_ptr().cast();
    unsafe { driver.submit_read(ptr, 64, 8) }.unwrap();

    driver.host().raise(HostEvent::LinkError(LinkError::DataCrc));
    driver.on_interrupt();

    assert!(notify.completions().is_empty());
    assert_eq!(
        notify.failures(),
        vec![(
            BlockRequest {
                direction: Direction::Read,
                buffer: ptr as usize,
                start_block: 64,
                block_count: 8,
            },
            LinkError::DataCrc
        )]
    );
    assert_eq!(driver.card_state(), CardState::Error);
    assert_eq!(driver.last_link_error(), Some(LinkError::DataCrc));
    assert_eq!(
        unsafe { driver.submit_read(ptr, 64, 8) },
        Err(SubmitFailure::LinkDown(CardState::Error))
    );

    driver.recover().unwrap();
    assert_eq!(driver.card_state(), CardState::Ready);
    assert_eq!(driver.last_link_error(), None);
    assert_eq!(driver.host().resets(), 2);
    unsafe { driver.submit_read(ptr, 64, 8) }.unwrap();
}

#[test]
fn late_completion_after_error_is_spurious() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    let buf = dma_buffer(1);
    unsafe { driver.submit_write(buf.as_ptr().cast(), 0, 1) }.unwrap();

    driver.host().raise(HostEvent::LinkError(LinkError::DataTimeout));
    driver.on_interrupt();
    driver.host().raise(HostEvent::TransferComplete(Direction::Write));
    driver.on_interrupt();

    assert_eq!(notify.failures().len(), 1);
    assert!(notify.completions().is_empty());
    assert_eq!(driver.spurious_completions(), 1);
}

#[test]
fn reinit_refused_while_transfer_pending() {
    let notify = RecordingNotify::new();
    let driver = ready_driver(&notify);
    let mut buf = dma_buffer(1);
    unsafe { driver.submit_read(buf.as_mut_ptr().cast(), 0, 1) }.unwrap();
    assert_eq!(driver.init_link(), Err(LinkInitFailure::TransfersPending));
    assert_eq!(driver.card_state(), CardState::Transferring);
}

#[test]
fn link_error_codes() {
    for error in [
        LinkError::DataCrc,
        LinkError::DataTimeout,
        LinkError::Underrun,
        LinkError::Overrun,
        LinkError::DmaTransfer,
        LinkError::StopFailed,
    ] {
        assert_eq!(LinkError::from_code(error.code()), Some(error));
    }
    assert_eq!(LinkError::from_code(0), None);
}

// ---- host controller ----

const STAR: usize = 0x34 / 4;
const CMDR: usize = 0x0C / 4;
const CMDREND: u32 = 1 << 6;
const DATAEND: u32 = 1 << 8;

/// Stands in for the SDMMC register block. Flags written to STAR stay set.
fn register_block() -> Vec<u32> {
    vec![0u32; 32]
}

#[test]
fn multi_block_read_stops_with_cmd12() {
    let mut block = register_block();
    let regs = block.as_mut_ptr();
    let host = unsafe { Sdmmc::with_registers(regs.cast(), StepClock::new(100)) };
    let mut buf = dma_buffer(4);

    unsafe { regs.add(STAR).write_volatile(CMDREND) };
    host.start_read(buf.as_mut_ptr().cast(), 0, 4).unwrap();
    assert_eq!(unsafe { regs.add(CMDR).read_volatile() } & 0x3F, 18);
    // The command path is the transfer's until it stops.
    assert_eq!(host.card_status(), Ok(CardStatus::Sending));

    unsafe { regs.add(STAR).write_volatile(CMDREND | DATAEND) };
    assert_eq!(
        host.service_interrupt(),
        Some(HostEvent::TransferComplete(Direction::Read))
    );
    assert_eq!(unsafe { regs.add(CMDR).read_volatile() } & 0x3F, 12);
    assert_eq!(host.service_interrupt(), None);
}

#[test]
fn single_block_write_needs_no_cmd12() {
    let mut block = register_block();
    let regs = block.as_mut_ptr();
    let host = unsafe { Sdmmc::with_registers(regs.cast(), StepClock::new(100)) };
    let buf = dma_buffer(1);

    unsafe { regs.add(STAR).write_volatile(CMDREND) };
    host.start_write(buf.as_ptr().cast(), 3, 1).unwrap();
    unsafe { regs.add(STAR).write_volatile(DATAEND) };
    assert_eq!(
        host.service_interrupt(),
        Some(HostEvent::TransferComplete(Direction::Write))
    );
    assert_eq!(unsafe { regs.add(CMDR).read_volatile() } & 0x3F, 24);
}

#[test]
fn unanswered_cmd12_fails_within_stop_timeout() {
    let mut block = register_block();
    let regs = block.as_mut_ptr();
    let clock = StepClock::new(100);
    let host = unsafe { Sdmmc::with_registers(regs.cast(), &clock) };
    let buf = dma_buffer(8);

    unsafe { regs.add(STAR).write_volatile(CMDREND) };
    host.start_write(buf.as_ptr().cast(), 0, 8).unwrap();

    // Data done, but the card never answers CMD12.
    unsafe { regs.add(STAR).write_volatile(DATAEND) };
    let before = clock.peek();
    assert_eq!(
        host.service_interrupt(),
        Some(HostEvent::LinkError(LinkError::StopFailed))
    );
    let waited = clock.peek() - before;
    assert!(waited >= duration_us(host::STOP_TIMEOUT));
    assert!(waited < duration_us(Duration::from_millis(10)));
}
