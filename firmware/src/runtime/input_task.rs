use embassy_futures::select::select;
use embassy_stm32::exti::ExtiInput;
use embassy_time::Timer;
use taps_core::sources::PowerEdge;

use super::{INPUTS, SOURCES};
use crate::inputs::DEBOUNCE_MS;

/// Trim switch halves. Both inputs are active low.
#[embassy_executor::task]
pub async fn trim(mut extend: ExtiInput<'static>, mut retract: ExtiInput<'static>) -> ! {
    loop {
        if let Some(edge) = INPUTS.set_trim(extend.is_low(), retract.is_low()) {
            defmt::debug!("input: trim {}", edge);
            SOURCES.on_trim_switch(edge);
        }
        select(extend.wait_for_any_edge(), retract.wait_for_any_edge()).await;
        Timer::after_millis(DEBOUNCE_MS).await;
    }
}

/// Config pushbutton, active low.
#[embassy_executor::task]
pub async fn button(mut button: ExtiInput<'static>) -> ! {
    loop {
        let pressed = button.is_low();
        if INPUTS.set_button(pressed) {
            SOURCES.on_config_button(pressed);
        }
        button.wait_for_any_edge().await;
        Timer::after_millis(DEBOUNCE_MS).await;
    }
}

/// Supply supervisor output. Low means the supply is collapsing.
#[embassy_executor::task]
pub async fn power(mut supervisor: ExtiInput<'static>) -> ! {
    let mut failed = false;
    loop {
        let low = supervisor.is_low();
        if low != failed {
            failed = low;
            SOURCES.on_power_edge(if low {
                PowerEdge::Falling
            } else {
                PowerEdge::Rising
            });
        }
        supervisor.wait_for_any_edge().await;
    }
}
