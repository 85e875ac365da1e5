//! Control state machine.
//!
//! The controller is the single consumer of the mailbox. It owns the
//! actuator model and the persistent store; everything else (gauge, LEDs,
//! the configuration front end, clocks) is reached through [`Board`].
//! State is implicit: which message arrives, combined with the actuator
//! direction and the homing flag, decides what happens.

use core::fmt;
use core::time::Duration;

use crate::actuator::{Actuator, Direction, Motor, Timestamp};
use crate::mailbox::{Letter, MessageKind};
use crate::nvstate::{NvStore, PersistedRecord, SaveReason};
use crate::sources::{EventSources, GaugeTick};
use crate::ticks::TICK_MS;

/// Stroke and speed of a supported actuator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ActuatorProfile {
    pub name: &'static str,
    /// Stroke in thousandths of an inch.
    pub stroke_mils: u32,
    /// Travel time per inch of stroke.
    pub ms_per_inch: u32,
}

impl ActuatorProfile {
    /// Rated run time from fully retracted to fully extended.
    #[must_use]
    pub const fn full_transit_ms(&self) -> u32 {
        self.stroke_mils * self.ms_per_inch / 1000
    }
}

/// Lenco 20740-002 on a 2003 22V.
pub const TIGE_2003_22V: ActuatorProfile = ActuatorProfile {
    name: "Tige 2003 22V",
    stroke_mils: 1250,
    ms_per_inch: 1600,
};

/// 2004 20V.
pub const TIGE_2004_20V: ActuatorProfile = ActuatorProfile {
    name: "Tige 2004 20V",
    stroke_mils: 2250,
    ms_per_inch: 2200,
};

/// Bennett TIGSA4015C on a 2006 22Ve, about five seconds end to end.
pub const TIGE_2006_22VE: ActuatorProfile = ActuatorProfile {
    name: "Tige 2006 22Ve",
    stroke_mils: 2625,
    ms_per_inch: 1905,
};

pub const DEFAULT_PROFILE: ActuatorProfile = TIGE_2006_22VE;

/// Tunables for the control loop.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ControlConfig {
    pub full_transit_ms: u32,
    /// How long the position must stay put before a lazy save.
    pub position_save_delay_secs: u64,
    /// Unbounded percentages outside this band mean the motor ran away.
    pub runaway_low_percent: f32,
    pub runaway_high_percent: f32,
    /// Pause after homing before the gauge and switch come back.
    pub settle_after_homing: Duration,
    /// Yield interval inside bounded drive loops.
    pub poll_interval: Duration,
    /// Status LED blink length when a lazy save is written.
    pub lazy_save_blink: Duration,
}

impl ControlConfig {
    #[must_use]
    pub const fn for_profile(profile: &ActuatorProfile) -> Self {
        Self {
            full_transit_ms: profile.full_transit_ms(),
            position_save_delay_secs: 15,
            runaway_low_percent: -50.0,
            runaway_high_percent: 150.0,
            settle_after_homing: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
            lazy_save_blink: Duration::from_millis(100),
        }
    }

    #[must_use]
    pub const fn with_full_transit_ms(mut self, full_transit_ms: u32) -> Self {
        self.full_transit_ms = full_transit_ms;
        self
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self::for_profile(&DEFAULT_PROFILE)
    }
}

/// Operator-visible safety faults.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fault {
    /// The position estimate left the plausible band while moving.
    RunawayActuator,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::RunawayActuator => f.write_str("runaway actuator"),
        }
    }
}

/// Board services the controller depends on.
pub trait Board {
    fn now(&self) -> Timestamp;

    /// Blocks for `duration`. Bounded drive loops call this between polls.
    fn pause(&mut self, duration: Duration);

    fn gauge_set(&mut self, percent: f32);
    /// Sweeps the needle to `percent` in small steps.
    fn gauge_set_slow(&mut self, percent: f32);
    fn gauge_get(&self) -> f32;
    fn gauge_enable(&mut self);
    fn gauge_disable(&mut self);

    fn status_led(&mut self, on: bool);
    fn toggle_status_led(&mut self);
    fn toggle_heartbeat_led(&mut self);
    fn power_led(&mut self, on: bool);

    fn signal_fault(&mut self, fault: Fault);

    /// Sleeps until a producer may have posted a message.
    fn wait_for_event(&mut self);

    /// Interactive gauge calibration. Returns `true` when `record` was
    /// changed and must be committed.
    fn configure(&mut self, record: &mut PersistedRecord) -> bool;

    /// One byte from the operator console.
    fn user_command<S: NvStore>(&mut self, code: u8, store: &mut S);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Modal {
    Configure,
    Command(u8),
}

/// Event loop tying the mailbox, actuator, store and board together.
pub struct Controller<'m, S, M, B, const N: usize> {
    sources: &'m EventSources<'m, N>,
    store: S,
    actuator: Actuator<M>,
    board: B,
    config: ControlConfig,
    movements: u32,
    moved_since_save: bool,
    homing: bool,
    sweep_increasing: bool,
    last_fault: Option<Fault>,
}

impl<'m, S, M, B, const N: usize> Controller<'m, S, M, B, N>
where
    S: NvStore,
    M: Motor,
    B: Board,
{
    pub fn new(
        sources: &'m EventSources<'m, N>,
        store: S,
        motor: M,
        board: B,
        config: ControlConfig,
    ) -> Self {
        Self {
            sources,
            store,
            actuator: Actuator::new(motor, config.full_transit_ms),
            board,
            config,
            movements: 0,
            moved_since_save: false,
            homing: false,
            sweep_increasing: true,
            last_fault: None,
        }
    }

    /// Applies the boot recovery policy.
    ///
    /// A position saved at power-down or immediately after a move is trusted
    /// as-is. Anything else starts an unconditional full retraction.
    pub fn boot(&mut self) {
        self.board.gauge_enable();

        let record = self.store.record();
        let trusted = record.reason().was_valid()
            && record.actuator_percent().was_valid()
            && record.reason().get().trusted_at_boot();

        if trusted {
            let percent = record.actuator_percent().get();
            info!(
                "control: recovered {}% ({})",
                percent,
                record.reason().get().name()
            );
            self.actuator.set_already_at_percent(percent);
            self.sources.enable_trim_switch(true);
            self.sources.enable_config_button(true);
            self.board.gauge_set_slow(100.0);
        } else {
            info!("control: position unknown, homing");
            self.begin_homing();
        }

        self.sources.enable_heartbeat(true);
        let now = self.board.now();
        self.board.gauge_set_slow(self.actuator.percent(now));
    }

    /// Handles one message. The slot returns to the pool when `letter` drops.
    pub fn dispatch(&mut self, letter: Letter<'_, N>) {
        let kind = letter.kind();
        match kind {
            MessageKind::TrimRetractOn => self.begin_trim(Direction::Retracting),
            MessageKind::TrimExtendOn => self.begin_trim(Direction::Extending),
            MessageKind::TrimOff => self.end_trim(),
            MessageKind::GaugeUpdate => self.update_gauge(),
            MessageKind::FullRetract => self.homing_tick(),
            MessageKind::Heartbeat => self.heartbeat(),
            MessageKind::PowerFailed => self.power_failed(),
            MessageKind::PowerRestored => self.power_restored(),
            MessageKind::ConfigButtonOn => self.run_modal(Modal::Configure),
            MessageKind::UserCommand => {
                #[allow(clippy::cast_possible_truncation)]
                let code = letter.payload() as u8;
                if self.actuator.is_active() {
                    debug!("control: console busy while moving");
                } else {
                    self.run_modal(Modal::Command(code));
                }
            }
            MessageKind::Free => debug!("control: ignoring {}", kind.name()),
        }
    }

    /// Drains the mailbox. Returns how many messages were handled.
    pub fn run_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(letter) = self.sources.mailbox().pop() {
            self.dispatch(letter);
            handled += 1;
        }
        handled
    }

    pub fn run(&mut self) -> ! {
        loop {
            self.run_pending();
            self.board.wait_for_event();
        }
    }

    fn begin_trim(&mut self, direction: Direction) {
        self.moved_since_save = true;
        self.movements = self.movements.saturating_add(1);
        self.board.status_led(true);

        let now = self.board.now();
        match direction {
            Direction::Extending => self.actuator.begin_extend(now),
            Direction::Retracting => self.actuator.begin_retract(now),
            Direction::Stopped => return,
        }
        self.sources.arm_gauge_ticks(GaugeTick::Update);
        self.sources.enable_config_button(false);
    }

    fn end_trim(&mut self) {
        self.board.status_led(false);
        let percent = self.stop_motion();
        self.board.gauge_set(percent);

        if self.store.unlimited_updates() {
            self.persist(percent, SaveReason::SavedPositionImmediate);
            self.moved_since_save = false;
        } else if self.movements == 1 {
            self.persist(percent, SaveReason::InitialMovement);
        }

        self.sources.enable_config_button(true);
    }

    fn update_gauge(&mut self) {
        let now = self.board.now();
        let unbounded = self.actuator.percent_unbounded(now);
        if unbounded < self.config.runaway_low_percent
            || unbounded > self.config.runaway_high_percent
        {
            error!("control: runaway actuator at {}%", unbounded);
            self.board.status_led(false);
            self.stop_motion();
            self.last_fault = Some(Fault::RunawayActuator);
            self.board.signal_fault(Fault::RunawayActuator);
        }
        let now = self.board.now();
        self.board.gauge_set(self.actuator.percent(now));
    }

    fn begin_homing(&mut self) {
        let now = self.board.now();
        self.homing = true;
        self.actuator.begin_full_retract(now);
        self.sources.arm_gauge_ticks(GaugeTick::FullRetract);
    }

    #[allow(clippy::cast_precision_loss)]
    fn homing_tick(&mut self) {
        self.board.status_led(true);

        let now = self.board.now();
        let target_ms = self.actuator.full_retract_target_ms();
        if self.actuator.active_ms(now) >= u64::from(target_ms) {
            self.finish_homing();
            return;
        }

        let ticks_for_retract = target_ms as f32 / TICK_MS as f32;
        let delta = 2.0 * (100.0 / ticks_for_retract);
        let current = self.board.gauge_get();
        if current >= 99.0 {
            self.sweep_increasing = false;
        } else if current <= 1.0 {
            self.sweep_increasing = true;
        }
        let next = if self.sweep_increasing {
            current + delta
        } else {
            current - delta
        };
        self.board.gauge_set(next);
    }

    fn finish_homing(&mut self) {
        let percent = self.stop_motion();
        info!("control: homed at {}%", percent);
        self.board.pause(self.config.settle_after_homing);

        self.reposition_after_homing();

        let now = self.board.now();
        self.board.gauge_set_slow(self.actuator.percent(now));
        self.board.status_led(false);
        self.homing = false;
        self.sources.enable_trim_switch(true);
        self.sources.mailbox().flush();
        self.sources.enable_config_button(true);
    }

    /// Drives back out to a lazily saved position that homing discarded.
    fn reposition_after_homing(&mut self) {
        let record = self.store.record();
        let lazy = record.reason().was_valid()
            && record.actuator_percent().was_valid()
            && record.reason().get() == SaveReason::SavedPositionLazy;
        let target = record.actuator_percent().get();

        let now = self.board.now();
        if !lazy || self.store.close_enough(self.actuator.percent(now)) {
            return;
        }

        self.board.gauge_set_slow(self.actuator.percent(now));
        if (0.0..=100.0).contains(&target) {
            info!("control: restoring {}%", target);
            self.drive_out_to(target, true);
        }
    }

    /// Extends until `target` is reached or a full stroke's time has passed.
    /// With `stop_at_stored` the drive also ends once the position matches
    /// the stored percent.
    fn drive_out_to(&mut self, target: f32, stop_at_stored: bool) {
        let now = self.board.now();
        self.actuator.begin_extend(now);
        let limit = u64::from(self.actuator.full_retract_target_ms());

        loop {
            let now = self.board.now();
            let percent = self.actuator.percent(now);
            if (stop_at_stored && self.store.close_enough(percent))
                || percent >= target
                || self.actuator.active_ms(now) >= limit
            {
                break;
            }
            self.board.gauge_set(percent);
            self.board.pause(self.config.poll_interval);
        }

        let now = self.board.now();
        self.actuator.stop(now);
    }

    fn heartbeat(&mut self) {
        self.board.toggle_heartbeat_led();

        if self.store.unlimited_updates()
            || self.sources.power_fail_available()
            || self.sources.switch_engaged()
        {
            return;
        }

        let now = self.board.now();
        if !self.moved_since_save
            || self.actuator.seconds_since_last_stop(now) < self.config.position_save_delay_secs
        {
            return;
        }

        self.moved_since_save = false;
        let percent = self.actuator.percent(now);
        if !self.store.close_enough(percent) {
            self.board.toggle_status_led();
            self.persist(percent, SaveReason::SavedPositionLazy);
            self.board.pause(self.config.lazy_save_blink);
            self.board.toggle_status_led();
        }
    }

    fn power_failed(&mut self) {
        warn!("control: power failure");
        let percent = self.stop_motion();
        self.board.gauge_disable();
        self.sources.enable_config_button(false);
        self.sources.enable_heartbeat(false);
        self.sources.mailbox().flush();
        self.board.power_led(true);
        self.board.status_led(true);

        if self.moved_since_save {
            self.persist(percent, SaveReason::PowerDownSave);
            self.moved_since_save = false;
            self.movements = 0;
        }
    }

    fn power_restored(&mut self) {
        info!("control: power restored");
        self.board.status_led(false);
        self.board.power_led(false);

        let previous = self.board.gauge_get();
        self.board.gauge_set(0.0);
        self.board.gauge_enable();
        self.board.gauge_set_slow(previous);

        if self.homing {
            self.begin_homing();
        } else {
            self.sources.enable_config_button(true);
        }
        self.sources.enable_heartbeat(true);
    }

    /// Runs a modal sequence with the config button and heartbeat muted.
    ///
    /// Whatever queued up around it is discarded, except that console bytes
    /// survive a command so the rest of a burst still arrives.
    fn run_modal(&mut self, modal: Modal) {
        self.sources.enable_config_button(false);
        self.sources.enable_heartbeat(false);
        self.drain_for(modal);
        self.board.status_led(true);

        match modal {
            Modal::Configure => self.configuration_cycle(),
            Modal::Command(code) => self.board.user_command(code, &mut self.store),
        }

        self.board.status_led(false);
        self.drain_for(modal);
        self.sources.enable_config_button(true);
        self.sources.enable_heartbeat(true);
    }

    fn drain_for(&self, modal: Modal) {
        let mailbox = self.sources.mailbox();
        let discarded = match modal {
            Modal::Configure => mailbox.flush(),
            Modal::Command(_) => mailbox.flush_except(MessageKind::UserCommand),
        };
        if discarded > 0 {
            debug!("control: discarded {} queued messages", discarded);
        }
    }

    /// Homes the actuator so the wiring can be checked, runs the board's
    /// calibration front end, then drives back to where it started.
    fn configuration_cycle(&mut self) {
        let now = self.board.now();
        let initial = self.actuator.percent(now);
        info!("control: configuration from {}%", initial);

        self.actuator.begin_full_retract(now);
        let target = u64::from(self.actuator.full_retract_target_ms());
        while self.actuator.active_ms(self.board.now()) < target {
            self.board.pause(self.config.poll_interval);
        }
        let now = self.board.now();
        self.actuator.stop(now);

        if self.board.configure(self.store.record_mut()) {
            if let Err(err) = self.store.commit() {
                warn!("control: calibration commit failed: {}", err);
            }
        }

        let now = self.board.now();
        if self.actuator.percent(now) < initial {
            self.drive_out_to(initial, false);
        }

        let now = self.board.now();
        self.board.gauge_set_slow(self.actuator.percent(now));
    }

    fn stop_motion(&mut self) -> f32 {
        let now = self.board.now();
        self.actuator.stop(now);
        self.sources.disarm_gauge_ticks();
        self.actuator.percent(now)
    }

    fn persist(&mut self, percent: f32, reason: SaveReason) {
        self.store.set_actuator_percent(percent, reason);
        match self.store.commit() {
            Ok(()) => debug!("control: saved {}% as {}", percent, reason.name()),
            Err(err) => warn!("control: save as {} failed: {}", reason.name(), err),
        }
    }

    #[must_use]
    pub fn sources(&self) -> &'m EventSources<'m, N> {
        self.sources
    }

    pub fn actuator(&self) -> &Actuator<M> {
        &self.actuator
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    #[must_use]
    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Trim movements since boot or the last power-down save.
    #[must_use]
    pub fn movements(&self) -> u32 {
        self.movements
    }

    #[must_use]
    pub fn moved_since_save(&self) -> bool {
        self.moved_since_save
    }

    /// Whether the boot-time full retraction is still running.
    #[must_use]
    pub fn is_homing(&self) -> bool {
        self.homing
    }

    #[must_use]
    pub fn last_fault(&self) -> Option<Fault> {
        self.last_fault
    }
}
