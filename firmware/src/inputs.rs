//! Debounced switch levels shared between the EXTI tasks and the board.
//!
//! The EXTI tasks own the pins. They publish the settled level of each input
//! here, post the matching mailbox event, and the blocking calibration loop
//! samples the same levels without touching the hardware.

#![allow(dead_code)]

use portable_atomic::{AtomicBool, Ordering};
use taps_core::actuator::Timestamp;
use taps_core::gauge::{CONFIG_ABORT_MS, CalibrationInput};
use taps_core::sources::TrimSwitchEdge;

/// Settle time after an edge before the level is trusted.
pub const DEBOUNCE_MS: u64 = 10;

/// Point-in-time copy of every operator input. `true` means pressed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct InputSnapshot {
    /// Bottom of the trim switch.
    pub extend: bool,
    /// Top of the trim switch.
    pub retract: bool,
    pub button: bool,
}

impl InputSnapshot {
    #[must_use]
    pub fn trim_edge(self) -> TrimSwitchEdge {
        trim_edge(self.extend, self.retract)
    }
}

/// Latest debounced levels.
pub struct InputLevels {
    extend: AtomicBool,
    retract: AtomicBool,
    button: AtomicBool,
}

impl InputLevels {
    pub const fn new() -> Self {
        Self {
            extend: AtomicBool::new(false),
            retract: AtomicBool::new(false),
            button: AtomicBool::new(false),
        }
    }

    /// Records the trim switch halves. Returns the edge when the combined
    /// position changed.
    pub fn set_trim(&self, extend: bool, retract: bool) -> Option<TrimSwitchEdge> {
        let before = trim_edge(
            self.extend.swap(extend, Ordering::AcqRel),
            self.retract.swap(retract, Ordering::AcqRel),
        );
        let after = trim_edge(extend, retract);
        (before != after).then_some(after)
    }

    /// Records the config button. Returns `true` when the level changed.
    pub fn set_button(&self, pressed: bool) -> bool {
        self.button.swap(pressed, Ordering::AcqRel) != pressed
    }

    pub fn snapshot(&self) -> InputSnapshot {
        InputSnapshot {
            extend: self.extend.load(Ordering::Acquire),
            retract: self.retract.load(Ordering::Acquire),
            button: self.button.load(Ordering::Acquire),
        }
    }
}

impl Default for InputLevels {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps the two switch halves to a trim edge. Both halves closed at once
/// can only be a wiring fault and is treated as released.
#[must_use]
pub fn trim_edge(extend: bool, retract: bool) -> TrimSwitchEdge {
    match (extend, retract) {
        (true, false) => TrimSwitchEdge::ExtendPressed,
        (false, true) => TrimSwitchEdge::RetractPressed,
        _ => TrimSwitchEdge::Released,
    }
}

/// Turns sampled levels into calibration inputs.
///
/// Trim bottom lowers the needle, trim top raises it. A button tap accepts
/// the current point, holding it for [`CONFIG_ABORT_MS`] abandons the
/// session. The press that opened configuration is ignored until released.
#[derive(Debug)]
pub struct CalibrationInputs {
    armed: bool,
    pressed_at: Option<Timestamp>,
    aborted: bool,
}

impl CalibrationInputs {
    pub const fn new() -> Self {
        Self {
            armed: false,
            pressed_at: None,
            aborted: false,
        }
    }

    pub fn sample(&mut self, levels: InputSnapshot, now: Timestamp) -> CalibrationInput {
        if !self.armed {
            if levels.button {
                return CalibrationInput::Idle;
            }
            self.armed = true;
        }

        if levels.button {
            let since = *self.pressed_at.get_or_insert(now);
            if !self.aborted && now.millis_since(since) >= u64::from(CONFIG_ABORT_MS) {
                self.aborted = true;
                return CalibrationInput::Abort;
            }
            return CalibrationInput::Idle;
        }

        if self.pressed_at.take().is_some() && !core::mem::take(&mut self.aborted) {
            return CalibrationInput::Accept;
        }

        match levels.trim_edge() {
            TrimSwitchEdge::ExtendPressed => CalibrationInput::Lower,
            TrimSwitchEdge::RetractPressed => CalibrationInput::Raise,
            TrimSwitchEdge::Released => CalibrationInput::Idle,
        }
    }
}

impl Default for CalibrationInputs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn button(pressed: bool) -> InputSnapshot {
        InputSnapshot {
            button: pressed,
            ..InputSnapshot::default()
        }
    }

    #[test]
    fn trim_levels_report_only_real_changes() {
        let levels = InputLevels::new();
        assert_eq!(
            levels.set_trim(true, false),
            Some(TrimSwitchEdge::ExtendPressed)
        );
        assert_eq!(levels.set_trim(true, false), None);
        assert_eq!(levels.set_trim(true, true), Some(TrimSwitchEdge::Released));
        assert_eq!(levels.set_trim(false, false), None);
        assert_eq!(
            levels.set_trim(false, true),
            Some(TrimSwitchEdge::RetractPressed)
        );
    }

    #[test]
    fn button_level_changes_are_edges() {
        let levels = InputLevels::new();
        assert!(levels.set_button(true));
        assert!(!levels.set_button(true));
        assert!(levels.snapshot().button);
        assert!(levels.set_button(false));
    }

    #[test]
    fn opening_press_is_ignored_until_released() {
        let mut inputs = CalibrationInputs::new();
        assert_eq!(inputs.sample(button(true), at(0)), CalibrationInput::Idle);
        assert_eq!(inputs.sample(button(true), at(5000)), CalibrationInput::Idle);
        assert_eq!(inputs.sample(button(false), at(5010)), CalibrationInput::Idle);
    }

    #[test]
    fn tap_accepts_and_long_hold_aborts_once() {
        let mut inputs = CalibrationInputs::new();
        inputs.sample(button(false), at(0));

        assert_eq!(inputs.sample(button(true), at(100)), CalibrationInput::Idle);
        assert_eq!(inputs.sample(button(false), at(300)), CalibrationInput::Accept);

        assert_eq!(inputs.sample(button(true), at(1000)), CalibrationInput::Idle);
        assert_eq!(inputs.sample(button(true), at(3000)), CalibrationInput::Abort);
        assert_eq!(inputs.sample(button(true), at(3500)), CalibrationInput::Idle);
        assert_eq!(inputs.sample(button(false), at(3600)), CalibrationInput::Idle);
    }

    #[test]
    fn trim_halves_nudge_the_needle() {
        let mut inputs = CalibrationInputs::new();
        let extend = InputSnapshot {
            extend: true,
            ..InputSnapshot::default()
        };
        let retract = InputSnapshot {
            retract: true,
            ..InputSnapshot::default()
        };
        assert_eq!(inputs.sample(extend, at(0)), CalibrationInput::Lower);
        assert_eq!(inputs.sample(retract, at(25)), CalibrationInput::Raise);
    }
}
