//! Analog gauge drive.
//!
//! The gauge needle is moved by a PWM duty cycle. Five calibration points
//! give the duty for 0, 25, 50, 75 and 100% of actuator travel; everything in
//! between is linearly interpolated on a fine grid.

use crate::actuator::Timestamp;
use crate::nvstate::{DEFAULT_GAUGE_CALIBRATION, GaugeCalibration, is_valid_calibration};

/// Resolution of the percent-to-duty grid.
pub const GAUGE_MAP_STEPS: usize = 400;

/// Duty change per slow step, in percentage points.
pub const SLOW_STEP_DUTY: f32 = 1.0;

/// Delay between slow steps.
pub const SLOW_STEP_MS: u32 = 20;

/// Duty change per trim switch nudge while calibrating.
pub const NUDGE_DUTY: f32 = 0.25;

/// Repeat interval of a held trim switch while calibrating.
pub const NUDGE_INTERVAL_MS: u32 = 25;

/// Holding the config button this long abandons calibration.
pub const CONFIG_ABORT_MS: u32 = 2000;

/// Calibration is abandoned after this long without input.
pub const CONFIG_INACTIVITY_MS: u64 = 60_000;

/// Percent-to-duty mapping built from a calibration curve.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GaugeMap {
    calibration: GaugeCalibration,
}

impl GaugeMap {
    #[must_use]
    pub const fn new(calibration: GaugeCalibration) -> Self {
        Self { calibration }
    }

    #[must_use]
    pub fn calibration(&self) -> &GaugeCalibration {
        &self.calibration
    }

    /// Duty cycle at grid point `index` of [`GAUGE_MAP_STEPS`].
    #[allow(clippy::cast_precision_loss)]
    fn duty_at(&self, index: usize) -> f32 {
        const SEGMENT: usize = GAUGE_MAP_STEPS / 4;
        let segment = (index / SEGMENT).min(3);
        let low = self.calibration[segment];
        let high = self.calibration[segment + 1];
        let offset = (index - segment * SEGMENT) as f32 / SEGMENT as f32;
        low + offset * (high - low)
    }

    /// Duty cycle for a gauge reading, snapped to the nearest grid point.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn duty_for(&self, percent: f32) -> f32 {
        let percent = if percent.is_nan() { 0.0 } else { percent };
        let scaled = percent / 100.0 * GAUGE_MAP_STEPS as f32 + 0.5;
        let index = if scaled <= 0.0 {
            0
        } else {
            (scaled as usize).min(GAUGE_MAP_STEPS)
        };
        self.duty_at(index)
    }

    /// Duty at 0% travel.
    #[must_use]
    pub fn low_duty(&self) -> f32 {
        self.calibration[0]
    }

    /// Duty at 100% travel.
    #[must_use]
    pub fn high_duty(&self) -> f32 {
        self.calibration[4]
    }
}

impl Default for GaugeMap {
    fn default() -> Self {
        Self::new(DEFAULT_GAUGE_CALIBRATION)
    }
}

/// Next duty on a slow sweep from `current` toward `target`, or `None` once
/// the target is reached.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn slow_step(current: f32, target: f32) -> Option<f32> {
    if current == target || target.is_nan() {
        return None;
    }
    let step = if current > target {
        -SLOW_STEP_DUTY
    } else {
        SLOW_STEP_DUTY
    };
    let next = current + step;
    let overshoot = if next > target { next - target } else { target - next };
    Some(if overshoot <= SLOW_STEP_DUTY { target } else { next })
}

/// PWM output and power switch behind the gauge.
pub trait GaugeOutput {
    fn set_duty(&mut self, duty: f32);
    fn duty(&self) -> f32;
    fn set_powered(&mut self, powered: bool);
}

/// Calibrated gauge on top of a [`GaugeOutput`].
pub struct Gauge<O> {
    output: O,
    map: GaugeMap,
    percent: f32,
}

impl<O: GaugeOutput> Gauge<O> {
    pub fn new(output: O, calibration: GaugeCalibration) -> Self {
        let mut gauge = Self {
            output,
            map: GaugeMap::new(calibration),
            percent: 0.0,
        };
        gauge.set(0.0);
        gauge
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    #[must_use]
    pub fn map(&self) -> &GaugeMap {
        &self.map
    }

    /// Replaces the calibration curve. The needle keeps its duty until the
    /// next `set`.
    pub fn calibrate(&mut self, calibration: GaugeCalibration) {
        self.map = GaugeMap::new(calibration);
    }

    /// Last reading requested, in percent of travel.
    #[must_use]
    pub fn get(&self) -> f32 {
        self.percent
    }

    pub fn set(&mut self, percent: f32) {
        self.output.set_duty(self.map.duty_for(percent));
        self.percent = percent;
    }

    /// Sweeps the needle to `percent` one duty step at a time, calling
    /// `pause` before each step.
    pub fn set_slow(&mut self, percent: f32, pause: impl FnMut(u32)) {
        self.set_duty_slow(self.map.duty_for(percent), pause);
        self.percent = percent;
    }

    /// Like [`Gauge::set_slow`] with a raw duty target.
    pub fn set_duty_slow(&mut self, duty: f32, mut pause: impl FnMut(u32)) {
        while let Some(next) = slow_step(self.output.duty(), duty) {
            pause(SLOW_STEP_MS);
            self.output.set_duty(next);
        }
    }

    /// Current raw duty.
    #[must_use]
    pub fn duty(&self) -> f32 {
        self.output.duty()
    }

    /// Drives the duty directly, bypassing the calibration map.
    pub fn set_duty(&mut self, duty: f32) {
        self.output.set_duty(duty);
    }

    pub fn enable(&mut self) {
        self.output.set_powered(true);
    }

    pub fn disable(&mut self) {
        self.output.set_powered(false);
    }
}

/// Operator input sampled during calibration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalibrationInput {
    /// Nothing pressed.
    Idle,
    Raise,
    Lower,
    /// Config button tapped: store the current duty for this point.
    Accept,
    /// Config button held past [`CONFIG_ABORT_MS`].
    Abort,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CalibrationStatus {
    /// Waiting for the point with this index.
    InProgress(usize),
    /// All five points accepted and the curve is valid.
    Complete(GaugeCalibration),
    /// All five points accepted but the curve failed validation.
    Rejected,
    Aborted,
}

/// Five-point gauge calibration driven by the trim switch and config button.
///
/// The needle starts on the stored duty for 0%. Raise and lower nudge it,
/// accept stores it for the current point and moves to the next one.
#[derive(Clone, Debug)]
pub struct CalibrationSession {
    points: GaugeCalibration,
    next: usize,
    duty: f32,
    last_activity: Timestamp,
}

impl CalibrationSession {
    #[must_use]
    pub fn new(start: GaugeCalibration, now: Timestamp) -> Self {
        Self {
            points: start,
            next: 0,
            duty: start[0],
            last_activity: now,
        }
    }

    /// Duty the needle should show right now.
    #[must_use]
    pub fn duty(&self) -> f32 {
        self.duty
    }

    #[must_use]
    pub fn points(&self) -> &GaugeCalibration {
        &self.points
    }

    pub fn apply(&mut self, input: CalibrationInput, now: Timestamp) -> CalibrationStatus {
        match input {
            CalibrationInput::Idle => {
                if now.millis_since(self.last_activity) >= CONFIG_INACTIVITY_MS {
                    info!("gauge: calibration timed out");
                    return CalibrationStatus::Aborted;
                }
            }
            CalibrationInput::Raise => {
                self.duty = (self.duty + NUDGE_DUTY).min(100.0);
                self.last_activity = now;
            }
            CalibrationInput::Lower => {
                self.duty = (self.duty - NUDGE_DUTY).max(0.0);
                self.last_activity = now;
            }
            CalibrationInput::Accept => {
                self.points[self.next] = self.duty;
                info!("gauge: PWM[{}] = {}%", self.next, self.duty);
                self.next += 1;
                self.last_activity = now;
                if self.next == self.points.len() {
                    return if is_valid_calibration(&self.points) {
                        CalibrationStatus::Complete(self.points)
                    } else {
                        warn!("gauge: calibration rejected");
                        CalibrationStatus::Rejected
                    };
                }
            }
            CalibrationInput::Abort => return CalibrationStatus::Aborted,
        }
        CalibrationStatus::InProgress(self.next)
    }
}
