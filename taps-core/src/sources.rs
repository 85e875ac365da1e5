//! Interrupt-side event producers.
//!
//! Each producer is a cheap method that allocates a [`Letter`](crate::mailbox::Letter)
//! and pushes it, so it may run from an EXTI handler, a timer tick, or an
//! async task. The control loop toggles the enable flags to mute sources
//! while it runs modal sequences.

use portable_atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use crate::mailbox::{Mailbox, MessageKind};
use crate::ticks::{HEARTBEAT_PERIOD_TICKS, ListenerHandle, TickScheduler};

/// Debounced trim switch transitions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TrimSwitchEdge {
    ExtendPressed,
    RetractPressed,
    Released,
}

/// Power-fail comparator edges. The supervisor output falls when the supply
/// collapses and rises once it recovers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerEdge {
    Falling,
    Rising,
}

/// Message posted on every gauge tick while motion is in progress.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GaugeTick {
    Off,
    Update,
    FullRetract,
}

impl GaugeTick {
    const fn to_raw(self) -> u8 {
        match self {
            GaugeTick::Off => 0,
            GaugeTick::Update => 1,
            GaugeTick::FullRetract => 2,
        }
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => GaugeTick::Update,
            2 => GaugeTick::FullRetract,
            _ => GaugeTick::Off,
        }
    }

    const fn message(self) -> Option<MessageKind> {
        match self {
            GaugeTick::Off => None,
            GaugeTick::Update => Some(MessageKind::GaugeUpdate),
            GaugeTick::FullRetract => Some(MessageKind::FullRetract),
        }
    }
}

fn no_wake() {}

/// Producer set shared between interrupt handlers and the control loop.
pub struct EventSources<'m, const N: usize> {
    mailbox: &'m Mailbox<N>,
    wake: fn(),
    trim_switch: AtomicBool,
    switch_engaged: AtomicBool,
    config_button: AtomicBool,
    heartbeat: AtomicBool,
    gauge_tick: AtomicU8,
    power_fail_available: AtomicBool,
    power_fail_depth: AtomicU8,
    dropped: AtomicU32,
}

impl<'m, const N: usize> EventSources<'m, N> {
    /// Creates a producer set with every source muted.
    #[must_use]
    pub const fn new(mailbox: &'m Mailbox<N>) -> Self {
        Self::with_wake(mailbox, no_wake)
    }

    /// Like [`EventSources::new`], calling `wake` after every successful post.
    #[must_use]
    pub const fn with_wake(mailbox: &'m Mailbox<N>, wake: fn()) -> Self {
        Self {
            mailbox,
            wake,
            trim_switch: AtomicBool::new(false),
            switch_engaged: AtomicBool::new(false),
            config_button: AtomicBool::new(false),
            heartbeat: AtomicBool::new(false),
            gauge_tick: AtomicU8::new(GaugeTick::Off.to_raw()),
            power_fail_available: AtomicBool::new(false),
            power_fail_depth: AtomicU8::new(0),
            dropped: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn mailbox(&self) -> &'m Mailbox<N> {
        self.mailbox
    }

    fn post(&self, kind: MessageKind, payload: u32) -> bool {
        if let Some(letter) = self.mailbox.allocate(kind, payload) {
            letter.push();
            (self.wake)();
            true
        } else {
            if !self.mailbox.is_stopped() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("mailbox: dropped {}", kind.name());
            }
            false
        }
    }

    /// Trim switch edge from the debouncer.
    pub fn on_trim_switch(&self, edge: TrimSwitchEdge) -> bool {
        let (engaged, kind) = match edge {
            TrimSwitchEdge::ExtendPressed => (true, MessageKind::TrimExtendOn),
            TrimSwitchEdge::RetractPressed => (true, MessageKind::TrimRetractOn),
            TrimSwitchEdge::Released => (false, MessageKind::TrimOff),
        };
        self.switch_engaged.store(engaged, Ordering::Relaxed);

        self.trim_switch.load(Ordering::Relaxed) && self.post(kind, 0)
    }

    /// Configuration pushbutton edge from the debouncer.
    pub fn on_config_button(&self, pressed: bool) -> bool {
        pressed
            && self.config_button.load(Ordering::Relaxed)
            && self.post(MessageKind::ConfigButtonOn, 0)
    }

    /// Nested power-fail edge counting. Only the first falling edge and the
    /// rising edge that balances the last one produce messages.
    pub fn on_power_edge(&self, edge: PowerEdge) -> bool {
        match edge {
            PowerEdge::Falling => {
                let previous = self.power_fail_depth.fetch_add(1, Ordering::AcqRel);
                previous == 0 && self.post(MessageKind::PowerFailed, 0)
            }
            PowerEdge::Rising => {
                let previous = self.power_fail_depth.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |depth| depth.checked_sub(1),
                );
                matches!(previous, Ok(1)) && self.post(MessageKind::PowerRestored, 0)
            }
        }
    }

    /// Once-per-second tick.
    pub fn heartbeat_tick(&self) {
        if self.heartbeat.load(Ordering::Relaxed) {
            self.post(MessageKind::Heartbeat, 0);
        }
    }

    /// Gauge refresh tick, posting whichever kind is armed.
    pub fn gauge_tick(&self) {
        if let Some(kind) = self.armed_gauge_tick().message() {
            self.post(kind, 0);
        }
    }

    /// Console byte from the operator link.
    pub fn post_user_command(&self, code: u8) -> bool {
        self.post(MessageKind::UserCommand, u32::from(code))
    }

    pub fn enable_trim_switch(&self, enabled: bool) {
        self.trim_switch.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn trim_switch_enabled(&self) -> bool {
        self.trim_switch.load(Ordering::Relaxed)
    }

    /// Whether either trim switch contact is currently closed.
    #[must_use]
    pub fn switch_engaged(&self) -> bool {
        self.switch_engaged.load(Ordering::Relaxed)
    }

    pub fn enable_config_button(&self, enabled: bool) {
        self.config_button.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn config_button_enabled(&self) -> bool {
        self.config_button.load(Ordering::Relaxed)
    }

    pub fn enable_heartbeat(&self, enabled: bool) {
        self.heartbeat.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat.load(Ordering::Relaxed)
    }

    pub fn arm_gauge_ticks(&self, tick: GaugeTick) {
        self.gauge_tick.store(tick.to_raw(), Ordering::Relaxed);
    }

    pub fn disarm_gauge_ticks(&self) {
        self.arm_gauge_ticks(GaugeTick::Off);
    }

    #[must_use]
    pub fn armed_gauge_tick(&self) -> GaugeTick {
        GaugeTick::from_raw(self.gauge_tick.load(Ordering::Relaxed))
    }

    /// Records whether the board has a power-fail comparator wired up.
    pub fn set_power_fail_available(&self, available: bool) {
        self.power_fail_available.store(available, Ordering::Relaxed);
    }

    #[must_use]
    pub fn power_fail_available(&self) -> bool {
        self.power_fail_available.load(Ordering::Relaxed)
    }

    /// Events lost to pool exhaustion.
    #[must_use]
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Registers the gauge refresh (every tick) and heartbeat (once a second)
/// listeners.
///
/// Returns `None` if the scheduler has no room for both.
pub fn install_event_ticks<const N: usize, const L: usize>(
    scheduler: &TickScheduler<EventSources<'static, N>, L>,
) -> Option<[ListenerHandle; 2]> {
    let gauge = scheduler.register(1, |sources: &EventSources<'static, N>| {
        sources.gauge_tick();
    })?;
    let heartbeat = scheduler.register(
        HEARTBEAT_PERIOD_TICKS,
        |sources: &EventSources<'static, N>| sources.heartbeat_tick(),
    );
    if heartbeat.is_none() {
        scheduler.unregister(gauge);
    }
    Some([gauge, heartbeat?])
}
