//! FRAM backend.
//!
//! The FRAM part is a plain byte array behind an I²C transport with a
//! two-byte big-endian memory address. Each group of fields sits at a fixed
//! offset followed by its CRC. The percent and reason fields share one CRC
//! so a torn update of either one is caught at load.

use core::fmt;

use heapless::Vec;

use super::crc::{CRC_LEN, crc16, crc16_chain};
use super::{
    GaugeCalibration, NvStore, PersistedRecord, RAW_READ_MAX, RawCommand, RawResponse, SaveReason,
    StorageError, is_valid_calibration,
};

/// Seven-bit I²C address of the FRAM.
pub const FRAM_I2C_ADDRESS: u8 = 0x50;

/// Usable FRAM size in bytes.
pub const FRAM_SIZE: u32 = 8 * 1024;

const CALIBRATION_LEN: usize = 5 * 4;
const REASON_LEN: usize = 1;
const PERCENT_LEN: usize = 4;

pub const ADDR_GAUGE_CAL: u32 = 0;
pub const ADDR_GAUGE_CAL_CRC: u32 = ADDR_GAUGE_CAL + CALIBRATION_LEN as u32;
pub const ADDR_REASON: u32 = ADDR_GAUGE_CAL_CRC + CRC_LEN as u32;
pub const ADDR_ACTUATOR_PERCENT: u32 = ADDR_REASON + REASON_LEN as u32;
pub const ADDR_ACTUATOR_CRC: u32 = ADDR_ACTUATOR_PERCENT + PERCENT_LEN as u32;

/// Bytes covered by the offset table.
pub const FRAM_TABLE_LEN: usize = ADDR_ACTUATOR_CRC as usize + CRC_LEN;

const ADDRESS_LEN: usize = 2;
const WRITE_CHUNK: usize = 32;

/// Failures reported by the FRAM transport.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Nothing answers at the device address.
    Unavailable,
    /// The bus timed out or the device did not acknowledge.
    TimeoutOrNack,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Unavailable => f.write_str("device unavailable"),
            TransportError::TimeoutOrNack => f.write_str("timeout or NACK"),
        }
    }
}

/// Byte-oriented bus to the FRAM. Implementations bound every call with a
/// timeout.
pub trait Transport {
    /// Probes the device address.
    fn is_available(&mut self) -> bool;

    /// Writes `bytes` in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the transaction fails.
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Writes `write`, then reads `read.len()` bytes with a repeated start.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the transaction fails.
    fn write_then_read(&mut self, write: &[u8], read: &mut [u8]) -> Result<(), TransportError>;
}

fn encode_calibration(calibration: &GaugeCalibration) -> [u8; CALIBRATION_LEN] {
    let mut bytes = [0; CALIBRATION_LEN];
    for (chunk, value) in bytes.chunks_exact_mut(4).zip(calibration) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_calibration(bytes: &[u8]) -> GaugeCalibration {
    let mut calibration = [0.0; 5];
    for (value, chunk) in calibration.iter_mut().zip(bytes.chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    calibration
}

fn position_crc(percent: f32, reason: u8) -> u16 {
    crc16_chain(&[&percent.to_le_bytes(), &[reason]])
}

fn read_crc(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn field(table: &[u8], address: u32, len: usize) -> &[u8] {
    let start = address as usize;
    &table[start..start + len]
}

fn decode_position(table: &[u8]) -> Result<(f32, SaveReason), StorageError> {
    let raw_reason = field(table, ADDR_REASON, REASON_LEN)[0];
    let reason = SaveReason::from_raw(raw_reason).ok_or(StorageError::IntegrityCheckFailed)?;

    let percent_bytes = field(table, ADDR_ACTUATOR_PERCENT, PERCENT_LEN);
    let percent = f32::from_le_bytes([
        percent_bytes[0],
        percent_bytes[1],
        percent_bytes[2],
        percent_bytes[3],
    ]);
    if !(0.0..=100.0).contains(&percent) {
        return Err(StorageError::IntegrityCheckFailed);
    }

    let stored = read_crc(field(table, ADDR_ACTUATOR_CRC, CRC_LEN));
    if stored == position_crc(percent, raw_reason) {
        Ok((percent, reason))
    } else {
        Err(StorageError::IntegrityCheckFailed)
    }
}

fn decode_gauge_calibration(table: &[u8]) -> Result<GaugeCalibration, StorageError> {
    let bytes = field(table, ADDR_GAUGE_CAL, CALIBRATION_LEN);
    let calibration = decode_calibration(bytes);
    if !is_valid_calibration(&calibration) {
        return Err(StorageError::IntegrityCheckFailed);
    }

    let stored = read_crc(field(table, ADDR_GAUGE_CAL_CRC, CRC_LEN));
    if stored == crc16(bytes) {
        Ok(calibration)
    } else {
        Err(StorageError::IntegrityCheckFailed)
    }
}

/// Persisted state kept in external FRAM.
pub struct FramStore<T> {
    transport: T,
    record: PersistedRecord,
}

impl<T: Transport> FramStore<T> {
    /// Reads the offset table and validates each field group independently.
    pub fn load(transport: T) -> Self {
        let mut store = Self {
            transport,
            record: PersistedRecord::defaults(),
        };

        let mut table = [0_u8; FRAM_TABLE_LEN];
        if let Err(err) = store.read(0, &mut table) {
            warn!("fram: load failed: {}", err);
            return store;
        }

        match decode_position(&table) {
            Ok((percent, reason)) => {
                store.record.actuator_percent_mut().init(percent).set_was_valid(true);
                store.record.reason_mut().init(reason).set_was_valid(true);
            }
            Err(err) => warn!("fram: position {}, using defaults", err),
        }

        match decode_gauge_calibration(&table) {
            Ok(calibration) => {
                store
                    .record
                    .gauge_calibration_mut()
                    .init(calibration)
                    .set_was_valid(true);
            }
            Err(err) => warn!("fram: gauge calibration {}, using defaults", err),
        }

        store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Releases the transport, as on power-down.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Reads `buf.len()` bytes starting at `address`.
    ///
    /// # Errors
    ///
    /// Propagates the transport failure.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let prefix = (address as u16).to_be_bytes();
        self.transport.write_then_read(&prefix, buf)?;
        Ok(())
    }

    /// Writes `data` starting at `address`, split into bus-sized chunks.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failed chunk.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), StorageError> {
        let mut frame = [0_u8; ADDRESS_LEN + WRITE_CHUNK];
        let mut address = address;
        for chunk in data.chunks(WRITE_CHUNK) {
            frame[..ADDRESS_LEN].copy_from_slice(&(address as u16).to_be_bytes());
            frame[ADDRESS_LEN..ADDRESS_LEN + chunk.len()].copy_from_slice(chunk);
            self.transport.write(&frame[..ADDRESS_LEN + chunk.len()])?;
            address += chunk.len() as u32;
        }
        Ok(())
    }

    fn commit_calibration(&mut self) -> Result<(), StorageError> {
        if !self.record.gauge_calibration().changed() {
            return Ok(());
        }

        let bytes = encode_calibration(&self.record.gauge_calibration().get());
        self.write(ADDR_GAUGE_CAL, &bytes)?;
        self.write(ADDR_GAUGE_CAL_CRC, &crc16(&bytes).to_le_bytes())?;
        self.record.gauge_calibration_mut().clear_changed();
        Ok(())
    }

    fn commit_position(&mut self) -> Result<(), StorageError> {
        let percent_changed = self.record.actuator_percent().changed();
        let reason_changed = self.record.reason().changed();
        if !percent_changed && !reason_changed {
            return Ok(());
        }

        let percent = self.record.actuator_percent().get();
        let reason = self.record.reason().get().as_raw();
        if percent_changed {
            self.write(ADDR_ACTUATOR_PERCENT, &percent.to_le_bytes())?;
        }
        if reason_changed {
            self.write(ADDR_REASON, &[reason])?;
        }

        // The CRC always covers both current values.
        self.write(ADDR_ACTUATOR_CRC, &position_crc(percent, reason).to_le_bytes())?;
        self.record.actuator_percent_mut().clear_changed();
        self.record.reason_mut().clear_changed();
        Ok(())
    }
}

impl<T: Transport> NvStore for FramStore<T> {
    fn name(&self) -> &'static str {
        "FRAM"
    }

    fn record(&self) -> &PersistedRecord {
        &self.record
    }

    fn record_mut(&mut self) -> &mut PersistedRecord {
        &mut self.record
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let calibration = self.commit_calibration();
        let position = self.commit_position();
        if let Err(err) = calibration.and(position) {
            warn!("fram: commit failed: {}", err);
            return Err(err);
        }
        Ok(())
    }

    fn zap(&mut self) -> Result<(), StorageError> {
        let zeros = [0_u8; WRITE_CHUNK];
        let mut address = 0;
        while address < FRAM_SIZE {
            self.write(address, &zeros)?;
            address += WRITE_CHUNK as u32;
        }
        self.record.set_defaults();
        info!("fram: zapped {} bytes", FRAM_SIZE);
        Ok(())
    }

    fn unlimited_updates(&self) -> bool {
        true
    }

    fn raw_command(&mut self, command: RawCommand<'_>) -> Option<RawResponse> {
        let response = match command {
            RawCommand::Probe => RawResponse::Probed(self.transport.is_available()),
            RawCommand::Read { address, len } => {
                let mut bytes: Vec<u8, RAW_READ_MAX> = Vec::new();
                // Clamped to capacity, cannot fail.
                let _ = bytes.resize(len.min(RAW_READ_MAX), 0);
                match self.read(address, &mut bytes) {
                    Ok(()) => RawResponse::Bytes(bytes),
                    Err(err) => RawResponse::Failed(err),
                }
            }
            RawCommand::Write { address, bytes } => match self.write(address, bytes) {
                Ok(()) => RawResponse::Written(bytes.len()),
                Err(err) => RawResponse::Failed(err),
            },
            RawCommand::RegionStatus => return None,
        };
        Some(response)
    }
}
