//! Periodic tick fan-out.
//!
//! A hardware timer (or an embassy `Ticker`) calls [`TickScheduler::tick`]
//! every [`TICK_MS`]. Listeners are plain function pointers registered with
//! a period in ticks; they all receive the same shared context, which in the
//! firmware is the [`EventSources`](crate::sources::EventSources) producer set.

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Vec;

/// Scheduler granularity in milliseconds.
pub const TICK_MS: u32 = 20;

/// Ticks between heartbeat events (one second).
pub const HEARTBEAT_PERIOD_TICKS: u32 = ticks_for_ms(1000);

/// Converts a millisecond interval to a whole number of ticks, at least one.
#[must_use]
pub const fn ticks_for_ms(ms: u32) -> u32 {
    let ticks = ms / TICK_MS;
    if ticks == 0 { 1 } else { ticks }
}

/// Identifies a registration so it can be removed later.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ListenerHandle(u16);

struct Listener<C: 'static> {
    handle: ListenerHandle,
    period: u32,
    countdown: u32,
    callback: fn(&C),
}

struct Table<C: 'static, const L: usize> {
    listeners: Vec<Listener<C>, L>,
    next_handle: u16,
}

/// Registration table of periodic callbacks.
pub struct TickScheduler<C: 'static, const L: usize> {
    table: Mutex<RefCell<Table<C, L>>>,
}

impl<C: 'static, const L: usize> TickScheduler<C, L> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(RefCell::new(Table {
                listeners: Vec::new(),
                next_handle: 0,
            })),
        }
    }

    /// Adds a callback fired every `period_ticks` ticks.
    ///
    /// Returns `None` when the table is full.
    pub fn register(&self, period_ticks: u32, callback: fn(&C)) -> Option<ListenerHandle> {
        let period = period_ticks.max(1);
        critical_section::with(|cs| {
            let mut table = self.table.borrow_ref_mut(cs);
            let handle = ListenerHandle(table.next_handle);
            table
                .listeners
                .push(Listener {
                    handle,
                    period,
                    countdown: period,
                    callback,
                })
                .ok()?;
            table.next_handle = table.next_handle.wrapping_add(1);
            Some(handle)
        })
    }

    /// Removes a registration. Returns `false` if the handle was unknown.
    pub fn unregister(&self, handle: ListenerHandle) -> bool {
        critical_section::with(|cs| {
            let mut table = self.table.borrow_ref_mut(cs);
            match table.listeners.iter().position(|l| l.handle == handle) {
                Some(index) => {
                    table.listeners.swap_remove(index);
                    true
                }
                None => false,
            }
        })
    }

    /// Advances every countdown by one tick and runs the callbacks that came
    /// due, outside the critical section. Returns how many fired.
    pub fn tick(&self, context: &C) -> usize {
        let due = critical_section::with(|cs| {
            let mut table = self.table.borrow_ref_mut(cs);

            let mut due: Vec<fn(&C), L> = Vec::new();
            for listener in &mut table.listeners {
                listener.countdown -= 1;
                if listener.countdown == 0 {
                    listener.countdown = listener.period;
                    // Capacity matches the listener table.
                    let _ = due.push(listener.callback);
                }
            }
            due
        });

        for callback in &due {
            callback(context);
        }
        due.len()
    }

    #[must_use]
    pub fn listeners(&self) -> usize {
        critical_section::with(|cs| self.table.borrow_ref(cs).listeners.len())
    }
}

impl<C: 'static, const L: usize> Default for TickScheduler<C, L> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;

    #[derive(Default)]
    struct Counters {
        fast: Cell<u32>,
        slow: Cell<u32>,
    }

    fn bump_fast(counters: &Counters) {
        counters.fast.set(counters.fast.get() + 1);
    }

    fn bump_slow(counters: &Counters) {
        counters.slow.set(counters.slow.get() + 1);
    }

    #[test]
    fn listeners_fire_at_their_own_period() {
        let scheduler: TickScheduler<Counters, 4> = TickScheduler::new();
        let counters = Counters::default();
        scheduler.register(1, bump_fast).expect("room");
        scheduler
            .register(HEARTBEAT_PERIOD_TICKS, bump_slow)
            .expect("room");

        for _ in 0..(HEARTBEAT_PERIOD_TICKS * 3) {
            scheduler.tick(&counters);
        }

        assert_eq!(counters.fast.get(), HEARTBEAT_PERIOD_TICKS * 3);
        assert_eq!(counters.slow.get(), 3);
    }

    #[test]
    fn unregistered_listener_stops_firing() {
        let scheduler: TickScheduler<Counters, 2> = TickScheduler::new();
        let counters = Counters::default();
        let handle = scheduler.register(1, bump_fast).expect("room");

        scheduler.tick(&counters);
        assert!(scheduler.unregister(handle));
        assert!(!scheduler.unregister(handle));
        scheduler.tick(&counters);

        assert_eq!(counters.fast.get(), 1);
        assert_eq!(scheduler.listeners(), 0);
    }

    #[test]
    fn full_table_rejects_registration() {
        let scheduler: TickScheduler<Counters, 1> = TickScheduler::new();
        assert!(scheduler.register(1, bump_fast).is_some());
        assert!(scheduler.register(1, bump_slow).is_none());
    }

    #[test]
    fn sub_tick_intervals_round_up_to_one_tick() {
        assert_eq!(ticks_for_ms(5), 1);
        assert_eq!(ticks_for_ms(100), 5);
    }
}
