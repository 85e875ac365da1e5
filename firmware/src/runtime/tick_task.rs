use embassy_time::{Duration, Ticker};
use taps_core::ticks::TICK_MS;

use super::{SCHEDULER, SOURCES};

/// Drives the tick scheduler that posts gauge updates and heartbeats.
#[embassy_executor::task]
pub async fn run() -> ! {
    let mut ticker = Ticker::every(Duration::from_millis(u64::from(TICK_MS)));
    loop {
        ticker.next().await;
        SCHEDULER.tick(&SOURCES);
    }
}
