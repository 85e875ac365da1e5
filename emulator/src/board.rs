//! Host stand-ins for the board, the motor and both storage devices.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use taps_core::actuator::{Motor, Timestamp};
use taps_core::console::{ConsoleReply, LineBuffer, execute};
use taps_core::control::{Board, Fault};
use taps_core::gauge::{
    CalibrationInput, CalibrationSession, CalibrationStatus, Gauge, GaugeOutput, NUDGE_INTERVAL_MS,
};
use taps_core::mailbox::MAILBOX_CAPACITY;
use taps_core::nvstate::{
    FlashDevice, FlashError, GaugeCalibration, NvStore, PersistedRecord, Transport,
    TransportError,
};
use taps_core::sources::EventSources;
use taps_core::ticks::{TICK_MS, TickScheduler};

pub type Sources = EventSources<'static, MAILBOX_CAPACITY>;
pub type Scheduler = TickScheduler<Sources, 4>;

/// Emulated FRAM size.
pub const FRAM_SIZE: usize = 8 * 1024;
/// Emulated flash geometry, matching the STM32G0.
pub const FLASH_SIZE: usize = 64 * 1024;
pub const FLASH_PAGE: u32 = 2048;
pub const FLASH_WRITE_SIZE: u32 = 8;

/// Millisecond clock that fires the tick scheduler as it passes each tick
/// boundary, the way the hardware timer keeps running while the control
/// loop blocks.
pub struct VirtualClock {
    now: Cell<u64>,
    scheduler: &'static Scheduler,
    sources: &'static Sources,
}

impl VirtualClock {
    pub fn new(scheduler: &'static Scheduler, sources: &'static Sources) -> Self {
        Self {
            now: Cell::new(0),
            scheduler,
            sources,
        }
    }

    pub fn now(&self) -> u64 {
        self.now.get()
    }

    /// Milliseconds until the next tick fires.
    pub fn until_tick(&self) -> u64 {
        let tick = u64::from(TICK_MS);
        tick - self.now.get() % tick
    }

    pub fn advance(&self, ms: u64) {
        let tick = u64::from(TICK_MS);
        let end = self.now.get() + ms;
        let mut next = (self.now.get() / tick + 1) * tick;
        while next <= end {
            self.now.set(next);
            self.scheduler.tick(self.sources);
            next += tick;
        }
        self.now.set(end);
    }
}

/// Byte array shared between a device and the session, so it survives a
/// reboot.
pub type Memory = Rc<RefCell<Vec<u8>>>;

pub fn fram_memory() -> Memory {
    Rc::new(RefCell::new(vec![0; FRAM_SIZE]))
}

pub fn flash_memory() -> Memory {
    Rc::new(RefCell::new(vec![0xff; FLASH_SIZE]))
}

/// FRAM behind a 2-byte big-endian address.
pub struct MemFram {
    memory: Memory,
    present: bool,
}

impl MemFram {
    pub fn new(memory: Memory, present: bool) -> Self {
        Self { memory, present }
    }

    fn split(bytes: &[u8]) -> Result<(usize, &[u8]), TransportError> {
        match bytes {
            [high, low, rest @ ..] => Ok((usize::from(u16::from_be_bytes([*high, *low])), rest)),
            _ => Err(TransportError::TimeoutOrNack),
        }
    }
}

impl Transport for MemFram {
    fn is_available(&mut self) -> bool {
        self.present
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.present {
            return Err(TransportError::Unavailable);
        }
        let (address, data) = Self::split(bytes)?;
        let mut memory = self.memory.borrow_mut();
        let target = memory
            .get_mut(address..address + data.len())
            .ok_or(TransportError::TimeoutOrNack)?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn write_then_read(&mut self, write: &[u8], read: &mut [u8]) -> Result<(), TransportError> {
        if !self.present {
            return Err(TransportError::Unavailable);
        }
        let (address, _) = Self::split(write)?;
        let memory = self.memory.borrow();
        let source = memory
            .get(address..address + read.len())
            .ok_or(TransportError::TimeoutOrNack)?;
        read.copy_from_slice(source);
        Ok(())
    }
}

/// NOR flash: erase sets whole pages to 0xFF, programming only clears bits.
pub struct MemFlash {
    memory: Memory,
}

impl MemFlash {
    pub fn new(memory: Memory) -> Self {
        Self { memory }
    }

    fn range(&self, address: u32, len: usize) -> Result<std::ops::Range<usize>, FlashError> {
        let start = usize::try_from(address).map_err(|_| FlashError::OutOfBounds)?;
        let end = start.checked_add(len).ok_or(FlashError::OutOfBounds)?;
        if end > self.memory.borrow().len() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl FlashDevice for MemFlash {
    fn capacity(&self) -> u32 {
        u32::try_from(self.memory.borrow().len()).unwrap_or(u32::MAX)
    }

    fn sector_size(&self) -> u32 {
        FLASH_PAGE
    }

    fn write_size(&self) -> u32 {
        FLASH_WRITE_SIZE
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let range = self.range(address, buf.len())?;
        buf.copy_from_slice(&self.memory.borrow()[range]);
        Ok(())
    }

    fn erase(&mut self, address: u32, len: u32) -> Result<(), FlashError> {
        if address % FLASH_PAGE != 0 || len % FLASH_PAGE != 0 {
            return Err(FlashError::Unaligned);
        }
        let len = usize::try_from(len).map_err(|_| FlashError::OutOfBounds)?;
        let range = self.range(address, len)?;
        self.memory.borrow_mut()[range].fill(0xff);
        Ok(())
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let write_size = usize::try_from(FLASH_WRITE_SIZE).unwrap_or(1);
        if address % FLASH_WRITE_SIZE != 0 || data.len() % write_size != 0 {
            return Err(FlashError::Unaligned);
        }
        let range = self.range(address, data.len())?;
        for (cell, byte) in self.memory.borrow_mut()[range].iter_mut().zip(data) {
            *cell &= *byte;
        }
        Ok(())
    }
}

/// Motor that remembers the last drive command.
#[derive(Default)]
pub struct LoggingMotor {
    pub state: &'static str,
    pub commands: usize,
}

impl Motor for LoggingMotor {
    fn extend(&mut self) {
        self.state = "extending";
        self.commands += 1;
    }

    fn retract(&mut self) {
        self.state = "retracting";
        self.commands += 1;
    }

    fn brake(&mut self) {
        self.state = "braked";
        self.commands += 1;
    }
}

/// Needle position as a raw duty.
#[derive(Default)]
pub struct Meter {
    duty: f32,
    powered: bool,
}

impl Meter {
    pub fn powered(&self) -> bool {
        self.powered
    }
}

impl GaugeOutput for Meter {
    fn set_duty(&mut self, duty: f32) {
        self.duty = duty;
    }

    fn duty(&self) -> f32 {
        self.duty
    }

    fn set_powered(&mut self, powered: bool) {
        self.powered = powered;
    }
}

/// Board with a virtual clock. Console replies and notable board events are
/// collected for the session to print.
pub struct EmuBoard {
    clock: Rc<VirtualClock>,
    gauge: Gauge<Meter>,
    pub status_led: bool,
    pub heartbeat_led: bool,
    pub power_led: bool,
    pub faults: Vec<Fault>,
    calibration_inputs: VecDeque<CalibrationInput>,
    console: LineBuffer,
    outbox: Vec<String>,
}

impl EmuBoard {
    pub fn new(clock: Rc<VirtualClock>, calibration: GaugeCalibration) -> Self {
        Self {
            clock,
            gauge: Gauge::new(Meter::default(), calibration),
            status_led: false,
            heartbeat_led: false,
            power_led: false,
            faults: Vec::new(),
            calibration_inputs: VecDeque::new(),
            console: LineBuffer::new(),
            outbox: Vec::new(),
        }
    }

    pub fn gauge(&self) -> &Gauge<Meter> {
        &self.gauge
    }

    /// Queues operator input for the next configuration session.
    pub fn queue_calibration(&mut self, input: CalibrationInput, count: usize) {
        self.calibration_inputs
            .extend(std::iter::repeat_n(input, count));
    }

    pub fn queued_calibration(&self) -> usize {
        self.calibration_inputs.len()
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outbox)
    }
}

impl Board for EmuBoard {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.clock.now())
    }

    fn pause(&mut self, duration: Duration) {
        self.clock
            .advance(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
    }

    fn gauge_set(&mut self, percent: f32) {
        self.gauge.set(percent);
    }

    fn gauge_set_slow(&mut self, percent: f32) {
        let clock = &self.clock;
        self.gauge
            .set_slow(percent, |ms| clock.advance(u64::from(ms)));
    }

    fn gauge_get(&self) -> f32 {
        self.gauge.get()
    }

    fn gauge_enable(&mut self) {
        self.gauge.enable();
    }

    fn gauge_disable(&mut self) {
        self.gauge.disable();
    }

    fn status_led(&mut self, on: bool) {
        self.status_led = on;
    }

    fn toggle_status_led(&mut self) {
        self.status_led = !self.status_led;
    }

    fn toggle_heartbeat_led(&mut self) {
        self.heartbeat_led = !self.heartbeat_led;
    }

    fn power_led(&mut self, on: bool) {
        self.power_led = on;
    }

    fn signal_fault(&mut self, fault: Fault) {
        self.outbox.push(format!("FAULT: {fault}"));
        self.faults.push(fault);
    }

    fn wait_for_event(&mut self) {
        self.clock.advance(self.clock.until_tick());
    }

    fn configure(&mut self, record: &mut PersistedRecord) -> bool {
        let now = self.now();
        let mut session = CalibrationSession::new(record.gauge_calibration().get(), now);
        self.gauge.set_duty(session.duty());

        loop {
            self.clock.advance(u64::from(NUDGE_INTERVAL_MS));
            let input = self
                .calibration_inputs
                .pop_front()
                .unwrap_or(CalibrationInput::Abort);
            match session.apply(input, self.now()) {
                CalibrationStatus::InProgress(_) => self.gauge.set_duty(session.duty()),
                CalibrationStatus::Complete(points) => {
                    self.gauge.calibrate(points);
                    record.set_gauge_calibration(points);
                    self.outbox.push(format!("calibration accepted: {points:?}"));
                    return true;
                }
                CalibrationStatus::Rejected => {
                    self.outbox.push("calibration rejected".to_string());
                    return false;
                }
                CalibrationStatus::Aborted => {
                    self.outbox.push("calibration abandoned".to_string());
                    return false;
                }
            }
        }
    }

    fn user_command<S: NvStore>(&mut self, code: u8, store: &mut S) {
        match self.console.ingest(code) {
            None => {}
            Some(Ok(command)) => {
                let reply = execute(&command, store);
                if let ConsoleReply::Calibrated(points) = &reply {
                    self.gauge.calibrate(*points);
                }
                self.outbox
                    .extend(reply.to_string().lines().map(str::to_string));
            }
            Some(Err(err)) => self.outbox.push(err.to_string()),
        }
    }
}
