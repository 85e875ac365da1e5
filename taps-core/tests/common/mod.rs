#![allow(dead_code)]

use core::time::Duration;

use taps_core::actuator::{Motor, Timestamp};
use taps_core::console::{self, LineBuffer};
use taps_core::control::{Board, Fault};
use taps_core::nvstate::{
    FlashDevice, FlashError, GaugeCalibration, NvStore, PersistedRecord, Transport,
    TransportError,
};

pub const TRANSIT_MS: u32 = 2625;
pub const FLASH_CAPACITY: u32 = 64 * 1024;
pub const FLASH_SECTOR: u32 = 2048;

pub fn close(actual: f32, expected: f32, tolerance: f32) -> bool {
    actual >= expected - tolerance && actual <= expected + tolerance
}

/// NOR flash in RAM. Programming ANDs bits in, erase sets whole sectors to 0xFF.
#[derive(Clone)]
pub struct MockFlash {
    pub memory: Vec<u8>,
    pub sector: u32,
    pub write_size: u32,
    pub programs: usize,
    pub erases: usize,
    pub fail_programs: bool,
    /// Reject programming a unit that is not fully erased, as the STM32G0
    /// controller does.
    pub strict: bool,
}

impl MockFlash {
    pub fn new() -> Self {
        Self::with_geometry(FLASH_CAPACITY, FLASH_SECTOR, 1)
    }

    pub fn with_geometry(capacity: u32, sector: u32, write_size: u32) -> Self {
        Self {
            memory: vec![0xFF; capacity as usize],
            sector,
            write_size,
            programs: 0,
            erases: 0,
            fail_programs: false,
            strict: false,
        }
    }

    /// Double-word programming that refuses to touch a programmed unit.
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::with_geometry(FLASH_CAPACITY, FLASH_SECTOR, 8)
        }
    }

    pub fn flip_bit(&mut self, address: u32, bit: u8) {
        self.memory[address as usize] ^= 1 << bit;
    }

    fn range(&self, address: u32, len: usize) -> Result<core::ops::Range<usize>, FlashError> {
        let start = address as usize;
        let end = start.checked_add(len).ok_or(FlashError::OutOfBounds)?;
        if end > self.memory.len() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl FlashDevice for MockFlash {
    fn capacity(&self) -> u32 {
        self.memory.len() as u32
    }

    fn sector_size(&self) -> u32 {
        self.sector
    }

    fn write_size(&self) -> u32 {
        self.write_size
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let range = self.range(address, buf.len())?;
        buf.copy_from_slice(&self.memory[range]);
        Ok(())
    }

    fn erase(&mut self, address: u32, len: u32) -> Result<(), FlashError> {
        if address % self.sector != 0 || len % self.sector != 0 {
            return Err(FlashError::Unaligned);
        }
        let range = self.range(address, len as usize)?;
        self.memory[range].fill(0xFF);
        self.erases += 1;
        Ok(())
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        if self.fail_programs {
            return Err(FlashError::Device);
        }
        if address % self.write_size != 0 || data.len() as u32 % self.write_size != 0 {
            return Err(FlashError::Unaligned);
        }
        let range = self.range(address, data.len())?;
        if self.strict
            && self.memory[range.clone()]
                .chunks(self.write_size as usize)
                .any(|unit| unit.iter().any(|&byte| byte != 0xFF))
        {
            return Err(FlashError::Device);
        }
        for (cell, byte) in self.memory[range].iter_mut().zip(data) {
            *cell &= byte;
        }
        self.programs += 1;
        Ok(())
    }
}

/// FRAM behind an I²C-like transport, with fault injection.
#[derive(Clone)]
pub struct MockFram {
    pub memory: Vec<u8>,
    pub present: bool,
    /// Successful writes left before every further write NACKs.
    pub writes_before_failure: Option<usize>,
    pub writes: usize,
}

impl MockFram {
    pub fn new() -> Self {
        Self {
            memory: vec![0; 8 * 1024],
            present: true,
            writes_before_failure: None,
            writes: 0,
        }
    }

    pub fn absent() -> Self {
        Self {
            present: false,
            ..Self::new()
        }
    }
}

impl Transport for MockFram {
    fn is_available(&mut self) -> bool {
        self.present
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.present {
            return Err(TransportError::Unavailable);
        }
        if let Some(left) = self.writes_before_failure.as_mut() {
            if *left == 0 {
                return Err(TransportError::TimeoutOrNack);
            }
            *left -= 1;
        }
        let address = usize::from(u16::from_be_bytes([bytes[0], bytes[1]]));
        let data = &bytes[2..];
        self.memory[address..address + data.len()].copy_from_slice(data);
        self.writes += 1;
        Ok(())
    }

    fn write_then_read(&mut self, write: &[u8], read: &mut [u8]) -> Result<(), TransportError> {
        if !self.present {
            return Err(TransportError::Unavailable);
        }
        let address = usize::from(u16::from_be_bytes([write[0], write[1]]));
        read.copy_from_slice(&self.memory[address..address + read.len()]);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingMotor {
    pub commands: Vec<char>,
}

impl Motor for RecordingMotor {
    fn extend(&mut self) {
        self.commands.push('e');
    }

    fn retract(&mut self) {
        self.commands.push('r');
    }

    fn brake(&mut self) {
        self.commands.push('b');
    }
}

/// Board with a manual clock that records every output.
#[derive(Default)]
pub struct RecordingBoard {
    pub now_ms: u64,
    pub paused_ms: u64,
    pub gauge: f32,
    pub gauge_enabled: bool,
    pub slow_targets: Vec<f32>,
    pub status_led: bool,
    pub status_toggles: usize,
    pub heartbeat_toggles: usize,
    pub power_led: bool,
    pub faults: Vec<Fault>,
    pub waits: usize,
    /// Calibration handed back by `configure`, if any.
    pub calibration: Option<GaugeCalibration>,
    pub configure_calls: usize,
    pub console: LineBuffer,
    pub replies: Vec<String>,
}

impl RecordingBoard {
    pub fn advance(&mut self, ms: u64) {
        self.now_ms += ms;
    }
}

impl Board for RecordingBoard {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.now_ms)
    }

    fn pause(&mut self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.now_ms += ms;
        self.paused_ms += ms;
    }

    fn gauge_set(&mut self, percent: f32) {
        self.gauge = percent;
    }

    fn gauge_set_slow(&mut self, percent: f32) {
        self.gauge = percent;
        self.slow_targets.push(percent);
    }

    fn gauge_get(&self) -> f32 {
        self.gauge
    }

    fn gauge_enable(&mut self) {
        self.gauge_enabled = true;
    }

    fn gauge_disable(&mut self) {
        self.gauge_enabled = false;
    }

    fn status_led(&mut self, on: bool) {
        self.status_led = on;
    }

    fn toggle_status_led(&mut self) {
        self.status_led = !self.status_led;
        self.status_toggles += 1;
    }

    fn toggle_heartbeat_led(&mut self) {
        self.heartbeat_toggles += 1;
    }

    fn power_led(&mut self, on: bool) {
        self.power_led = on;
    }

    fn signal_fault(&mut self, fault: Fault) {
        self.faults.push(fault);
    }

    fn wait_for_event(&mut self) {
        self.waits += 1;
    }

    fn configure(&mut self, record: &mut PersistedRecord) -> bool {
        self.configure_calls += 1;
        match self.calibration {
            Some(points) => {
                record.set_gauge_calibration(points);
                true
            }
            None => false,
        }
    }

    fn user_command<S: NvStore>(&mut self, code: u8, store: &mut S) {
        if let Some(parsed) = self.console.ingest(code) {
            let reply = match parsed {
                Ok(command) => console::execute(&command, store).to_string(),
                Err(err) => err.to_string(),
            };
            self.replies.push(reply);
        }
    }
}
