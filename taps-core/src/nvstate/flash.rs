//! Wear-levelled flash backend.
//!
//! Two regions sit at the top of flash: the constant region (gauge
//! calibration) occupies the highest sectors and the changing region
//! (position and reason) sits directly below it. A region is an array of
//! fixed-size slots, each holding a payload followed by a little-endian
//! CRC-16. Saves append into the first erased slot; the region is erased
//! only when every slot has been used.

use core::fmt;

use heapless::Vec;

use super::crc::{CRC_LEN, crc16};
use super::{
    GaugeCalibration, NvStore, PersistedRecord, RAW_READ_MAX, RawCommand, RawResponse, SaveReason,
    StorageError, is_valid_calibration,
};

/// Value every byte reads as after an erase.
pub const ERASED_BYTE: u8 = 0xFF;

/// Largest region image staged in RAM during a save.
pub const STAGING_BYTES: usize = 4096;

/// Slot length of the constant region: five `f32` plus CRC.
pub const CONSTANT_SLOT: usize = 5 * 4 + CRC_LEN;

/// Slot length of the changing region: packed `u16` plus CRC.
pub const CHANGING_SLOT: usize = 2 + CRC_LEN;

pub type ConstantRegion = FlashRegion<CONSTANT_SLOT>;
pub type ChangingRegion = FlashRegion<CHANGING_SLOT>;

/// Failures reported by a [`FlashDevice`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// The access falls outside the device.
    OutOfBounds,
    /// Address or length violates the erase or program granularity.
    Unaligned,
    /// The controller reported a program or erase failure.
    Device,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::OutOfBounds => f.write_str("out of bounds"),
            FlashError::Unaligned => f.write_str("unaligned access"),
            FlashError::Device => f.write_str("device error"),
        }
    }
}

/// NOR flash with sector erase. Programming can only clear bits.
pub trait FlashDevice {
    /// Total size in bytes. Regions are placed relative to this.
    fn capacity(&self) -> u32;

    /// Erase granularity in bytes.
    fn sector_size(&self) -> u32;

    /// Program granularity in bytes. Slots are padded to a multiple of it so
    /// a fresh slot never shares a program unit with a used one.
    fn write_size(&self) -> u32 {
        1
    }

    /// # Errors
    ///
    /// Returns [`FlashError::OutOfBounds`] for accesses past the end.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// # Errors
    ///
    /// Returns [`FlashError`] for misaligned ranges or controller faults.
    fn erase(&mut self, address: u32, len: u32) -> Result<(), FlashError>;

    /// Programs `data` at `address`. Callers only program whole program
    /// units that are still erased.
    ///
    /// # Errors
    ///
    /// Returns [`FlashError`] for misaligned ranges or controller faults.
    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;
}

/// Where a save landed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SaveOutcome {
    /// Same CRC as the current slot, nothing written.
    Unchanged,
    /// Written into a previously erased slot.
    Appended { slot: u32 },
    /// Region was full, erased, and restarted at slot zero.
    Erased,
}

/// Diagnostic snapshot of one region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegionStatus {
    pub name: &'static str,
    pub base: u32,
    pub slots: u32,
    pub current_slot: u32,
    pub valid: bool,
    pub programs: u32,
    pub erases: u32,
}

const fn round_up(value: u32, multiple: u32) -> u32 {
    value.div_ceil(multiple) * multiple
}

/// Slot log over a whole number of sectors.
///
/// `SLOT` is the payload length plus [`CRC_LEN`].
#[derive(Clone, Debug)]
pub struct FlashRegion<const SLOT: usize> {
    name: &'static str,
    base: u32,
    size: u32,
    stride: u32,
    slots: u32,
    current: u32,
    valid: bool,
    current_crc: u16,
    programs: u32,
    erases: u32,
}

impl<const SLOT: usize> FlashRegion<SLOT> {
    const PAYLOAD: usize = SLOT - CRC_LEN;

    /// Lays out a region ending at `top` and scans it for the newest valid
    /// slot, from the last index backward.
    ///
    /// Returns the region and the payload of the current slot, if any.
    #[allow(clippy::cast_possible_truncation)]
    pub fn open<F: FlashDevice>(
        device: &mut F,
        name: &'static str,
        top: u32,
    ) -> (Self, Option<[u8; SLOT]>) {
        let sector = device.sector_size().max(1);
        let stride = round_up(SLOT as u32, device.write_size().max(1));
        let size = round_up(stride, sector);
        let staged = size.min(STAGING_BYTES as u32);

        let mut region = Self {
            name,
            base: top.saturating_sub(size),
            size,
            stride,
            slots: staged / stride,
            current: 0,
            valid: false,
            current_crc: 0,
            programs: 0,
            erases: 0,
        };

        let mut slot = [0_u8; SLOT];
        for index in (0..region.slots).rev() {
            if device.read(region.slot_address(index), &mut slot).is_err() {
                continue;
            }
            if let Some(crc) = Self::validate(&slot) {
                region.current = index;
                region.valid = true;
                region.current_crc = crc;
                debug!("flash: {} current slot {}", name, index);
                return (region, Some(slot));
            }
        }

        info!("flash: {} holds no valid slot", name);
        (region, None)
    }

    fn validate(slot: &[u8; SLOT]) -> Option<u16> {
        if slot.iter().all(|&byte| byte == ERASED_BYTE) {
            return None;
        }
        let (payload, crc) = slot.split_at(Self::PAYLOAD);
        let stored = u16::from_le_bytes([crc[0], crc[1]]);
        (stored == crc16(payload)).then_some(stored)
    }

    fn slot_address(&self, index: u32) -> u32 {
        self.base + index * self.stride
    }

    fn image_len(&self) -> usize {
        (self.slots * self.stride) as usize
    }

    /// Appends `payload` unless it matches the current slot.
    ///
    /// The region image is staged in `staging` to find the first erased slot.
    /// Only that slot is programmed, after erasing the region when no slot is
    /// free, with interrupts masked.
    ///
    /// # Errors
    ///
    /// Propagates device failures; the region state is left unchanged.
    pub fn save<F: FlashDevice>(
        &mut self,
        device: &mut F,
        staging: &mut [u8; STAGING_BYTES],
        payload: &[u8],
    ) -> Result<SaveOutcome, FlashError> {
        debug_assert_eq!(payload.len(), Self::PAYLOAD);
        let crc = crc16(payload);
        if self.valid && crc == self.current_crc {
            return Ok(SaveOutcome::Unchanged);
        }

        let stride = self.stride as usize;
        let image = &mut staging[..self.image_len()];
        device.read(self.base, image)?;

        let free = image
            .chunks_exact(stride)
            .position(|slot| slot.iter().all(|&byte| byte == ERASED_BYTE));
        let erase = free.is_none();
        if erase {
            image.fill(ERASED_BYTE);
        }

        #[allow(clippy::cast_possible_truncation)]
        let slot = free.unwrap_or(0) as u32;
        let start = slot as usize * stride;
        image[start..start + Self::PAYLOAD].copy_from_slice(payload);
        image[start + Self::PAYLOAD..start + SLOT].copy_from_slice(&crc.to_le_bytes());

        debug!(
            "flash: {} slot {} -> {} of {}",
            self.name, self.current, slot, self.slots
        );

        let (base, size) = (self.base, self.size);
        let target = self.slot_address(slot);
        let unit = &image[start..start + stride];
        critical_section::with(|_| {
            if erase {
                device.erase(base, size)?;
            }
            device.program(target, unit)
        })?;

        self.programs += 1;
        if erase {
            self.erases += 1;
            info!("flash: {} full, erased and restarted at slot 0", self.name);
        }
        self.current = slot;
        self.valid = true;
        self.current_crc = crc;

        Ok(if erase {
            SaveOutcome::Erased
        } else {
            SaveOutcome::Appended { slot }
        })
    }

    /// Erases the whole region.
    ///
    /// # Errors
    ///
    /// Propagates the device failure.
    pub fn zap<F: FlashDevice>(&mut self, device: &mut F) -> Result<(), FlashError> {
        let (base, size) = (self.base, self.size);
        critical_section::with(|_| device.erase(base, size))?;
        self.erases += 1;
        self.current = 0;
        self.valid = false;
        self.current_crc = 0;
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// First byte of the region.
    #[must_use]
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Region length in bytes, a whole number of sectors.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn slots(&self) -> u32 {
        self.slots
    }

    #[must_use]
    pub fn current_slot(&self) -> u32 {
        self.current
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    #[must_use]
    pub fn status(&self) -> RegionStatus {
        RegionStatus {
            name: self.name,
            base: self.base,
            slots: self.slots,
            current_slot: self.current,
            valid: self.valid,
            programs: self.programs,
            erases: self.erases,
        }
    }
}

const PERCENT_SCALE: f32 = 100.0;
const REASON_MASK: u16 = 0b11;

/// Packs reason into bits 0-1 and hundredths of a percent into bits 2-15.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn encode_position(percent: f32, reason: SaveReason) -> [u8; 2] {
    let percent = if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    };
    let hundredths = (percent * PERCENT_SCALE + 0.5) as u16;
    ((hundredths << 2) | u16::from(reason.as_raw())).to_le_bytes()
}

#[allow(clippy::cast_possible_truncation)]
fn decode_position(payload: &[u8]) -> Result<(f32, SaveReason), StorageError> {
    let packed = u16::from_le_bytes([payload[0], payload[1]]);
    let reason = SaveReason::from_raw((packed & REASON_MASK) as u8)
        .ok_or(StorageError::IntegrityCheckFailed)?;
    let percent = f32::from(packed >> 2) / PERCENT_SCALE;
    if percent > 100.0 {
        return Err(StorageError::IntegrityCheckFailed);
    }
    Ok((percent, reason))
}

fn encode_calibration(calibration: &GaugeCalibration) -> [u8; CONSTANT_SLOT - CRC_LEN] {
    let mut bytes = [0; CONSTANT_SLOT - CRC_LEN];
    for (chunk, value) in bytes.chunks_exact_mut(4).zip(calibration) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_calibration(payload: &[u8]) -> Result<GaugeCalibration, StorageError> {
    let mut calibration = [0.0; 5];
    for (value, chunk) in calibration.iter_mut().zip(payload.chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    if is_valid_calibration(&calibration) {
        Ok(calibration)
    } else {
        Err(StorageError::IntegrityCheckFailed)
    }
}

/// Persisted state kept in the on-chip flash log.
pub struct FlashStore<F> {
    device: F,
    constant: ConstantRegion,
    changing: ChangingRegion,
    record: PersistedRecord,
    staging: [u8; STAGING_BYTES],
}

impl<F: FlashDevice> FlashStore<F> {
    /// Scans both regions and loads whatever validates.
    pub fn load(mut device: F) -> Self {
        let top = device.capacity();
        let (constant, calibration) = ConstantRegion::open(&mut device, "constant", top);
        let (changing, position) = ChangingRegion::open(&mut device, "changing", constant.base());

        let mut record = PersistedRecord::defaults();

        match calibration
            .ok_or(StorageError::IntegrityCheckFailed)
            .and_then(|slot| decode_calibration(&slot[..CONSTANT_SLOT - CRC_LEN]))
        {
            Ok(calibration) => {
                record.gauge_calibration_mut().init(calibration).set_was_valid(true);
            }
            Err(err) => warn!("flash: gauge calibration {}, using defaults", err),
        }

        match position
            .ok_or(StorageError::IntegrityCheckFailed)
            .and_then(|slot| decode_position(&slot[..CHANGING_SLOT - CRC_LEN]))
        {
            Ok((percent, reason)) => {
                record.actuator_percent_mut().init(percent).set_was_valid(true);
                record.reason_mut().init(reason).set_was_valid(true);
            }
            Err(err) => warn!("flash: position {}, using defaults", err),
        }

        Self {
            device,
            constant,
            changing,
            record,
            staging: [ERASED_BYTE; STAGING_BYTES],
        }
    }

    pub fn device(&self) -> &F {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut F {
        &mut self.device
    }

    /// Releases the device, as on power-down.
    pub fn into_device(self) -> F {
        self.device
    }

    #[must_use]
    pub fn constant_region(&self) -> &ConstantRegion {
        &self.constant
    }

    #[must_use]
    pub fn changing_region(&self) -> &ChangingRegion {
        &self.changing
    }

    fn commit_position(&mut self) -> Result<(), StorageError> {
        if !self.record.actuator_percent().changed() && !self.record.reason().changed() {
            return Ok(());
        }

        let payload = encode_position(
            self.record.actuator_percent().get(),
            self.record.reason().get(),
        );
        self.changing
            .save(&mut self.device, &mut self.staging, &payload)?;
        self.record.actuator_percent_mut().clear_changed();
        self.record.reason_mut().clear_changed();
        Ok(())
    }

    fn commit_calibration(&mut self) -> Result<(), StorageError> {
        if !self.record.gauge_calibration().changed() {
            return Ok(());
        }

        let payload = encode_calibration(&self.record.gauge_calibration().get());
        self.constant
            .save(&mut self.device, &mut self.staging, &payload)?;
        self.record.gauge_calibration_mut().clear_changed();
        Ok(())
    }
}

impl<F: FlashDevice> NvStore for FlashStore<F> {
    fn name(&self) -> &'static str {
        "FLASH"
    }

    fn record(&self) -> &PersistedRecord {
        &self.record
    }

    fn record_mut(&mut self) -> &mut PersistedRecord {
        &mut self.record
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let position = self.commit_position();
        let calibration = self.commit_calibration();
        if let Err(err) = position.and(calibration) {
            warn!("flash: commit failed: {}", err);
            return Err(err);
        }
        Ok(())
    }

    fn zap(&mut self) -> Result<(), StorageError> {
        self.changing.zap(&mut self.device)?;
        self.constant.zap(&mut self.device)?;
        self.record.set_defaults();
        info!("flash: zapped both regions");
        Ok(())
    }

    fn unlimited_updates(&self) -> bool {
        false
    }

    fn raw_command(&mut self, command: RawCommand<'_>) -> Option<RawResponse> {
        let response = match command {
            RawCommand::RegionStatus => {
                RawResponse::Regions([self.constant.status(), self.changing.status()])
            }
            RawCommand::Read { address, len } => {
                let mut bytes: Vec<u8, RAW_READ_MAX> = Vec::new();
                // Clamped to capacity, cannot fail.
                let _ = bytes.resize(len.min(RAW_READ_MAX), 0);
                match self.device.read(address, &mut bytes) {
                    Ok(()) => RawResponse::Bytes(bytes),
                    Err(err) => RawResponse::Failed(err.into()),
                }
            }
            RawCommand::Probe | RawCommand::Write { .. } => return None,
        };
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_packing_keeps_hundredths() {
        let payload = encode_position(38.095, SaveReason::SavedPositionLazy);
        let (percent, reason) = decode_position(&payload).expect("valid packing");

        assert_eq!(reason, SaveReason::SavedPositionLazy);
        assert!(percent > 38.09 && percent < 38.11, "{percent}");
    }

    #[test]
    fn position_packing_clamps_out_of_range_input() {
        let (percent, reason) =
            decode_position(&encode_position(140.0, SaveReason::PowerDownSave)).expect("valid");
        assert!(percent <= 100.0);
        assert_eq!(reason, SaveReason::PowerDownSave);
    }

    #[test]
    fn packed_percent_above_full_scale_is_rejected() {
        let packed: u16 = (10_001 << 2) | 1;
        assert_eq!(
            decode_position(&packed.to_le_bytes()),
            Err(StorageError::IntegrityCheckFailed)
        );
    }

    #[test]
    fn erased_slot_never_validates() {
        assert!(ChangingRegion::validate(&[ERASED_BYTE; CHANGING_SLOT]).is_none());
    }
}
