//! Persistent controller state.
//!
//! Three fields survive power loss: the gauge calibration curve, the last
//! known actuator percentage, and the reason that percentage was saved.
//! Each field tracks whether it changed since the last commit and whether
//! its stored copy passed integrity checks at boot. Two backends implement
//! [`NvStore`]: [`FramStore`] over an external byte-addressable FRAM and
//! [`FlashStore`], a wear-levelled slot log in on-chip flash.

use core::fmt;

use heapless::Vec;

pub mod crc;
pub mod flash;
pub mod fram;

pub use flash::{FlashDevice, FlashError, FlashRegion, FlashStore, RegionStatus, SaveOutcome};
pub use fram::{FramStore, Transport, TransportError};

/// Gauge PWM duty cycle (percent) at 0, 25, 50, 75, and 100% of travel.
pub type GaugeCalibration = [f32; 5];

/// Calibration used when nothing valid is stored.
pub const DEFAULT_GAUGE_CALIBRATION: GaugeCalibration = [86.75, 71.25, 61.25, 51.75, 35.25];

/// Tolerance, in percentage points, for treating two positions as equal.
pub const CLOSE_ENOUGH_PERCENT: f32 = 0.1;

/// Largest raw read served by [`NvStore::raw_command`].
pub const RAW_READ_MAX: usize = 128;

/// Calibration points must lie in `[0, 100]` and be strictly increasing or
/// strictly decreasing.
#[must_use]
pub fn is_valid_calibration(calibration: &GaugeCalibration) -> bool {
    let in_range = |value: f32| (0.0..=100.0).contains(&value);
    if !calibration.iter().all(|&value| in_range(value)) {
        return false;
    }

    let increasing = calibration[1] > calibration[0];
    calibration.windows(2).all(|pair| {
        if increasing {
            pair[1] > pair[0]
        } else {
            pair[1] < pair[0]
        }
    })
}

/// Why an actuator position was saved. Only `PowerDownSave` and
/// `SavedPositionImmediate` are trusted enough to skip homing at boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SaveReason {
    InitialMovement = 0,
    SavedPositionLazy = 1,
    SavedPositionImmediate = 2,
    PowerDownSave = 3,
}

impl SaveReason {
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(SaveReason::InitialMovement),
            1 => Some(SaveReason::SavedPositionLazy),
            2 => Some(SaveReason::SavedPositionImmediate),
            3 => Some(SaveReason::PowerDownSave),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            SaveReason::InitialMovement => "InitialMovement",
            SaveReason::SavedPositionLazy => "SavedPositionLazy",
            SaveReason::SavedPositionImmediate => "SavedPositionImmediate",
            SaveReason::PowerDownSave => "PowerDownSave",
        }
    }

    /// Whether a position saved for this reason can be trusted without homing.
    #[must_use]
    pub const fn trusted_at_boot(self) -> bool {
        matches!(
            self,
            SaveReason::PowerDownSave | SaveReason::SavedPositionImmediate
        )
    }
}

impl fmt::Display for SaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One persisted value plus its change and validity flags.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NvField<T> {
    value: T,
    changed: bool,
    was_valid: bool,
}

impl<T: Copy + PartialEq> NvField<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            value,
            changed: false,
            was_valid: false,
        }
    }

    /// Replaces the value without marking it changed.
    pub fn init(&mut self, value: T) -> &mut Self {
        self.value = value;
        self.changed = false;
        self
    }

    /// Stores a new value, marking the field changed only if it differs.
    pub fn set(&mut self, value: T) -> &mut Self {
        if self.value != value {
            self.value = value;
            self.changed = true;
        }
        self
    }

    #[must_use]
    pub fn get(&self) -> T {
        self.value
    }

    #[must_use]
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn clear_changed(&mut self) {
        self.changed = false;
    }

    /// Whether the boot-time copy passed integrity validation.
    #[must_use]
    pub fn was_valid(&self) -> bool {
        self.was_valid
    }

    pub fn set_was_valid(&mut self, valid: bool) -> &mut Self {
        self.was_valid = valid;
        self
    }
}

/// The fixed persistence schema.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PersistedRecord {
    gauge_calibration: NvField<GaugeCalibration>,
    actuator_percent: NvField<f32>,
    reason: NvField<SaveReason>,
}

impl PersistedRecord {
    /// Record holding the compiled-in defaults, none of them marked valid.
    #[must_use]
    pub const fn defaults() -> Self {
        Self {
            gauge_calibration: NvField::new(DEFAULT_GAUGE_CALIBRATION),
            actuator_percent: NvField::new(0.0),
            reason: NvField::new(SaveReason::InitialMovement),
        }
    }

    /// Resets every field to its default and clears both flags.
    pub fn set_defaults(&mut self) {
        *self = Self::defaults();
    }

    pub fn default_gauge_calibration(&mut self) {
        self.gauge_calibration.init(DEFAULT_GAUGE_CALIBRATION).set_was_valid(false);
    }

    pub fn default_position(&mut self) {
        self.actuator_percent.init(0.0).set_was_valid(false);
        self.reason
            .init(SaveReason::InitialMovement)
            .set_was_valid(false);
    }

    #[must_use]
    pub fn gauge_calibration(&self) -> &NvField<GaugeCalibration> {
        &self.gauge_calibration
    }

    pub fn gauge_calibration_mut(&mut self) -> &mut NvField<GaugeCalibration> {
        &mut self.gauge_calibration
    }

    #[must_use]
    pub fn actuator_percent(&self) -> &NvField<f32> {
        &self.actuator_percent
    }

    pub fn actuator_percent_mut(&mut self) -> &mut NvField<f32> {
        &mut self.actuator_percent
    }

    #[must_use]
    pub fn reason(&self) -> &NvField<SaveReason> {
        &self.reason
    }

    pub fn reason_mut(&mut self) -> &mut NvField<SaveReason> {
        &mut self.reason
    }

    pub fn set_gauge_calibration(&mut self, calibration: GaugeCalibration) -> &mut Self {
        self.gauge_calibration.set(calibration);
        self
    }

    pub fn set_actuator_percent(&mut self, percent: f32, reason: SaveReason) -> &mut Self {
        self.actuator_percent.set(percent);
        self.reason.set(reason);
        self
    }

    /// Whether `percent` is within [`CLOSE_ENOUGH_PERCENT`] of the stored value.
    #[must_use]
    pub fn close_enough(&self, percent: f32) -> bool {
        let stored = self.actuator_percent.get();
        let delta = if stored > percent {
            stored - percent
        } else {
            percent - stored
        };
        delta <= CLOSE_ENOUGH_PERCENT
    }

    /// Whether any field still needs a commit.
    #[must_use]
    pub fn dirty(&self) -> bool {
        self.gauge_calibration.changed() || self.actuator_percent.changed() || self.reason.changed()
    }
}

impl Default for PersistedRecord {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Failures surfaced by the persistence layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// No device answered on the transport.
    TransportUnavailable,
    /// A single transport operation timed out or was not acknowledged.
    TransportTimeoutOrNack,
    /// Stored bytes failed their CRC or range check.
    IntegrityCheckFailed,
    Flash(FlashError),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::TransportUnavailable => f.write_str("transport unavailable"),
            StorageError::TransportTimeoutOrNack => f.write_str("transport timeout or NACK"),
            StorageError::IntegrityCheckFailed => f.write_str("integrity check failed"),
            StorageError::Flash(err) => write!(f, "flash: {err}"),
        }
    }
}

impl From<TransportError> for StorageError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable => StorageError::TransportUnavailable,
            TransportError::TimeoutOrNack => StorageError::TransportTimeoutOrNack,
        }
    }
}

impl From<FlashError> for StorageError {
    fn from(err: FlashError) -> Self {
        StorageError::Flash(err)
    }
}

/// Low-level inspection requests passed through from the operator console.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RawCommand<'a> {
    /// Check that the backing device responds.
    Probe,
    Read { address: u32, len: usize },
    Write { address: u32, bytes: &'a [u8] },
    /// Report slot usage of each flash region.
    RegionStatus,
}

/// Result of a handled [`RawCommand`].
#[derive(Clone, Debug, PartialEq)]
pub enum RawResponse {
    Probed(bool),
    Bytes(Vec<u8, RAW_READ_MAX>),
    Written(usize),
    Regions([RegionStatus; 2]),
    Failed(StorageError),
}

/// Contract shared by both persistence backends.
///
/// Loading happens in each backend's constructor; a store always comes up
/// with usable values, falling back to defaults for anything that fails
/// validation.
pub trait NvStore {
    /// Backend label for logs and the console.
    fn name(&self) -> &'static str;

    fn record(&self) -> &PersistedRecord;

    fn record_mut(&mut self) -> &mut PersistedRecord;

    /// Writes every changed field and clears its flag. Unchanged fields are
    /// never rewritten.
    ///
    /// # Errors
    ///
    /// Returns the first storage failure; fields that failed keep their
    /// changed flag so the next commit retries them.
    fn commit(&mut self) -> Result<(), StorageError>;

    /// Returns the whole reserved region to its erased pattern.
    ///
    /// # Errors
    ///
    /// Returns the device failure that interrupted the wipe.
    fn zap(&mut self) -> Result<(), StorageError>;

    /// Whether writes cost no endurance budget.
    fn unlimited_updates(&self) -> bool;

    /// Backend-specific inspection. `None` means the command is not handled.
    fn raw_command(&mut self, command: RawCommand<'_>) -> Option<RawResponse> {
        let _ = command;
        None
    }

    fn set_actuator_percent(&mut self, percent: f32, reason: SaveReason) {
        self.record_mut().set_actuator_percent(percent, reason);
    }

    fn close_enough(&self, percent: f32) -> bool {
        self.record().close_enough(percent)
    }
}

/// Backend chosen once at boot by probing the FRAM transport.
pub enum NvBackend<T, F> {
    Fram(FramStore<T>),
    Flash(FlashStore<F>),
}

impl<T: Transport, F: FlashDevice> NvBackend<T, F> {
    /// Uses FRAM when its transport answers, otherwise the flash log.
    pub fn select(mut transport: T, flash: F) -> Self {
        if transport.is_available() {
            info!("nvstate: using FRAM backend");
            NvBackend::Fram(FramStore::load(transport))
        } else {
            info!("nvstate: FRAM not found, using flash backend");
            NvBackend::Flash(FlashStore::load(flash))
        }
    }

    #[must_use]
    pub fn is_fram(&self) -> bool {
        matches!(self, NvBackend::Fram(_))
    }
}

impl<T: Transport, F: FlashDevice> NvStore for NvBackend<T, F> {
    fn name(&self) -> &'static str {
        match self {
            NvBackend::Fram(store) => store.name(),
            NvBackend::Flash(store) => store.name(),
        }
    }

    fn record(&self) -> &PersistedRecord {
        match self {
            NvBackend::Fram(store) => store.record(),
            NvBackend::Flash(store) => store.record(),
        }
    }

    fn record_mut(&mut self) -> &mut PersistedRecord {
        match self {
            NvBackend::Fram(store) => store.record_mut(),
            NvBackend::Flash(store) => store.record_mut(),
        }
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        match self {
            NvBackend::Fram(store) => store.commit(),
            NvBackend::Flash(store) => store.commit(),
        }
    }

    fn zap(&mut self) -> Result<(), StorageError> {
        match self {
            NvBackend::Fram(store) => store.zap(),
            NvBackend::Flash(store) => store.zap(),
        }
    }

    fn unlimited_updates(&self) -> bool {
        match self {
            NvBackend::Fram(store) => store.unlimited_updates(),
            NvBackend::Flash(store) => store.unlimited_updates(),
        }
    }

    fn raw_command(&mut self, command: RawCommand<'_>) -> Option<RawResponse> {
        match self {
            NvBackend::Fram(store) => store.raw_command(command),
            NvBackend::Flash(store) => store.raw_command(command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_examples() {
        assert!(is_valid_calibration(&[10.0, 20.0, 30.0, 40.0, 50.0]));
        assert!(!is_valid_calibration(&[10.0, 20.0, 15.0, 40.0, 50.0]));
        assert!(!is_valid_calibration(&[-5.0, 20.0, 30.0, 40.0, 50.0]));
    }

    #[test]
    fn calibration_accepts_decreasing_curves() {
        assert!(is_valid_calibration(&DEFAULT_GAUGE_CALIBRATION));
        assert!(!is_valid_calibration(&[50.0, 40.0, 40.0, 30.0, 20.0]));
    }

    #[test]
    fn calibration_range_checks_the_last_point() {
        assert!(!is_valid_calibration(&[10.0, 20.0, 30.0, 40.0, 100.5]));
        assert!(!is_valid_calibration(&[10.0, 20.0, f32::NAN, 40.0, 50.0]));
    }

    #[test]
    fn field_marks_changed_only_on_difference() {
        let mut field = NvField::new(5_u8);
        field.set(5);
        assert!(!field.changed());

        field.set(6);
        assert!(field.changed());
        assert_eq!(field.get(), 6);

        field.clear_changed();
        field.init(9);
        assert!(!field.changed());
        assert!(!field.was_valid());
    }

    #[test]
    fn close_enough_uses_a_tenth_of_a_point() {
        let mut record = PersistedRecord::defaults();
        record.set_actuator_percent(40.0, SaveReason::SavedPositionLazy);

        assert!(record.close_enough(40.05));
        assert!(record.close_enough(39.95));
        assert!(!record.close_enough(40.2));
        assert!(record.dirty());
    }

    #[test]
    fn reason_round_trips_through_raw_codes() {
        for raw in 0..4 {
            let reason = SaveReason::from_raw(raw).expect("known code");
            assert_eq!(reason.as_raw(), raw);
        }
        assert!(SaveReason::from_raw(4).is_none());
        assert!(SaveReason::PowerDownSave.trusted_at_boot());
        assert!(!SaveReason::SavedPositionLazy.trusted_at_boot());
    }
}
