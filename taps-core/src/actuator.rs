//! Dead-reckoning position model for the trim-tab actuator.
//!
//! The actuator has no position feedback. Position is tracked as
//! milliseconds of run time away from full retraction and integrated each
//! time motion stops. While moving, the unclamped estimate is allowed to
//! leave `[0, full_transit_ms]`; the controller uses that excursion to detect
//! a runaway motor.

use core::fmt;
use core::ops::{Add, Sub};
use core::time::Duration;

/// Monotonic millisecond timestamp.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed since `earlier`, saturating at zero.
    #[must_use]
    pub const fn millis_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    #[allow(clippy::cast_possible_truncation)]
    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Self::Output {
        Duration::from_millis(self.millis_since(rhs))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Current motor drive.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Stopped,
    Extending,
    Retracting,
}

/// H-bridge outputs driving the actuator motor.
pub trait Motor {
    fn extend(&mut self);
    fn retract(&mut self);
    /// Stops the motor with both outputs shorted.
    fn brake(&mut self);
}

/// Pure position bookkeeping, independent of any motor.
#[derive(Clone, Debug, PartialEq)]
pub struct ActuatorPosition {
    full_transit_ms: u32,
    position_ms: u32,
    direction: Direction,
    motion_start: Option<Timestamp>,
    last_stop: Option<Timestamp>,
    moved: bool,
}

impl ActuatorPosition {
    /// Model of a fully retracted actuator with the given rated stroke time.
    #[must_use]
    pub const fn new(full_transit_ms: u32) -> Self {
        Self {
            full_transit_ms: if full_transit_ms == 0 { 1 } else { full_transit_ms },
            position_ms: 0,
            direction: Direction::Stopped,
            motion_start: None,
            last_stop: None,
            moved: false,
        }
    }

    #[must_use]
    pub const fn full_transit_ms(&self) -> u32 {
        self.full_transit_ms
    }

    /// Run time used for homing: 110% of the rated stroke.
    #[must_use]
    pub const fn full_retract_target_ms(&self) -> u32 {
        self.full_transit_ms.saturating_mul(11) / 10
    }

    /// Integrated position, excluding any motion in flight.
    #[must_use]
    pub const fn position_ms(&self) -> u32 {
        self.position_ms
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self.direction, Direction::Stopped)
    }

    /// Whether any motion has started since this flag was last cleared.
    #[must_use]
    pub const fn moved(&self) -> bool {
        self.moved
    }

    pub fn set_moved(&mut self, moved: bool) {
        self.moved = moved;
    }

    pub fn begin_extend(&mut self, now: Timestamp) {
        self.begin(Direction::Extending, now);
    }

    pub fn begin_retract(&mut self, now: Timestamp) {
        self.begin(Direction::Retracting, now);
    }

    /// Retract with the estimate forced to zero, for homing from an
    /// unknown position.
    pub fn begin_full_retract(&mut self, now: Timestamp) {
        self.begin(Direction::Retracting, now);
        self.position_ms = 0;
    }

    fn begin(&mut self, direction: Direction, now: Timestamp) {
        if self.is_active() {
            self.stop(now);
        }
        self.last_stop = None;
        self.direction = direction;
        self.motion_start = Some(now);
        self.moved = true;
    }

    /// Integrates the run time since motion began and clamps the result.
    /// Returns `false` when nothing was moving.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn stop(&mut self, now: Timestamp) -> bool {
        if !self.is_active() {
            return false;
        }

        let clamped = self
            .unbounded_position_ms(now)
            .clamp(0, i64::from(self.full_transit_ms));
        self.position_ms = clamped as u32;
        self.direction = Direction::Stopped;
        self.motion_start = None;
        self.last_stop = Some(now);
        true
    }

    /// Run time of the motion in flight, or zero when stopped.
    #[must_use]
    pub fn active_ms(&self, now: Timestamp) -> u64 {
        self.motion_start.map_or(0, |start| now.millis_since(start))
    }

    #[allow(clippy::cast_possible_wrap)]
    fn unbounded_position_ms(&self, now: Timestamp) -> i64 {
        let elapsed = self.active_ms(now).min(i64::MAX as u64) as i64;
        let position = i64::from(self.position_ms);
        match self.direction {
            Direction::Stopped => position,
            Direction::Extending => position.saturating_add(elapsed),
            Direction::Retracting => position.saturating_sub(elapsed),
        }
    }

    /// Position as a percentage of full transit, including motion in flight
    /// and without clamping.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent_unbounded(&self, now: Timestamp) -> f32 {
        (self.unbounded_position_ms(now) as f32 * 100.0) / self.full_transit_ms as f32
    }

    /// [`ActuatorPosition::percent_unbounded`] clamped into `[0, 100]`.
    #[must_use]
    pub fn percent(&self, now: Timestamp) -> f32 {
        self.percent_unbounded(now).clamp(0.0, 100.0)
    }

    /// Whole seconds since the last stop; zero while moving or before the
    /// first stop.
    #[must_use]
    pub fn seconds_since_last_stop(&self, now: Timestamp) -> u64 {
        self.last_stop.map_or(0, |stop| now.millis_since(stop) / 1000)
    }

    /// Seeds the estimate from a recovered percentage without moving.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn set_already_at_percent(&mut self, percent: f32) {
        let percent = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 100.0)
        };
        self.position_ms = (self.full_transit_ms as f32 * (percent / 100.0)) as u32;
    }
}

/// Position model bound to the motor outputs.
pub struct Actuator<M> {
    motor: M,
    position: ActuatorPosition,
}

impl<M: Motor> Actuator<M> {
    pub fn new(mut motor: M, full_transit_ms: u32) -> Self {
        motor.brake();
        Self {
            motor,
            position: ActuatorPosition::new(full_transit_ms),
        }
    }

    #[must_use]
    pub fn position(&self) -> &ActuatorPosition {
        &self.position
    }

    pub fn motor(&self) -> &M {
        &self.motor
    }

    pub fn motor_mut(&mut self) -> &mut M {
        &mut self.motor
    }

    pub fn begin_extend(&mut self, now: Timestamp) {
        self.stop(now);
        self.motor.extend();
        self.position.begin_extend(now);
    }

    pub fn begin_retract(&mut self, now: Timestamp) {
        self.stop(now);
        self.motor.retract();
        self.position.begin_retract(now);
    }

    pub fn begin_full_retract(&mut self, now: Timestamp) {
        self.stop(now);
        self.motor.retract();
        self.position.begin_full_retract(now);
    }

    /// Brakes the motor and integrates the elapsed run time. No-op when idle.
    pub fn stop(&mut self, now: Timestamp) -> bool {
        if !self.position.is_active() {
            return false;
        }
        self.motor.brake();
        self.position.stop(now);
        info!(
            "actuator: stop {} ms, {}%",
            self.position.position_ms(),
            self.position.percent(now)
        );
        true
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.position.is_active()
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.position.direction()
    }

    #[must_use]
    pub fn active_ms(&self, now: Timestamp) -> u64 {
        self.position.active_ms(now)
    }

    #[must_use]
    pub fn full_transit_ms(&self) -> u32 {
        self.position.full_transit_ms()
    }

    #[must_use]
    pub fn full_retract_target_ms(&self) -> u32 {
        self.position.full_retract_target_ms()
    }

    #[must_use]
    pub fn percent(&self, now: Timestamp) -> f32 {
        self.position.percent(now)
    }

    #[must_use]
    pub fn percent_unbounded(&self, now: Timestamp) -> f32 {
        self.position.percent_unbounded(now)
    }

    #[must_use]
    pub fn seconds_since_last_stop(&self, now: Timestamp) -> u64 {
        self.position.seconds_since_last_stop(now)
    }

    pub fn set_already_at_percent(&mut self, percent: f32) {
        self.position.set_already_at_percent(percent);
    }

    #[must_use]
    pub fn moved(&self) -> bool {
        self.position.moved()
    }

    pub fn set_moved(&mut self, moved: bool) {
        self.position.set_moved(moved);
    }
}
