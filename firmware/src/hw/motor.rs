//! H-bridge drive for the trim actuator.

use embassy_stm32::gpio::Output;
use embassy_time::{Duration, block_for};
use taps_core::actuator::Motor;

/// Dead time with the bridge disabled before the direction pins change.
const ENABLE_DELAY: Duration = Duration::from_millis(20);

/// BTS7960-style bridge: one PWM input per half plus a shared enable.
/// The PWM inputs are driven as plain levels.
pub struct HBridge {
    extend: Output<'static>,
    retract: Output<'static>,
    enable: Output<'static>,
}

impl HBridge {
    pub fn new(extend: Output<'static>, retract: Output<'static>, enable: Output<'static>) -> Self {
        Self {
            extend,
            retract,
            enable,
        }
    }

    fn drive(&mut self, extend: bool) {
        self.enable.set_low();
        block_for(ENABLE_DELAY);
        if extend {
            self.retract.set_low();
            self.extend.set_high();
        } else {
            self.extend.set_low();
            self.retract.set_high();
        }
        self.enable.set_high();
    }
}

impl Motor for HBridge {
    fn extend(&mut self) {
        self.drive(true);
    }

    fn retract(&mut self) {
        self.drive(false);
    }

    fn brake(&mut self) {
        self.enable.set_low();
        self.extend.set_low();
        self.retract.set_low();
        // Both halves low with the bridge enabled shorts the motor.
        self.enable.set_high();
    }
}
