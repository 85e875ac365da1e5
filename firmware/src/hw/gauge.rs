//! PWM output behind the analog trim gauge.

use embassy_stm32::gpio::Output;
use embassy_stm32::peripherals::TIM3;
use embassy_stm32::timer::simple_pwm::SimplePwm;
use taps_core::gauge::GaugeOutput;

/// Carrier frequency for the gauge drive.
pub const GAUGE_PWM_HZ: u32 = 30_000;

/// TIM3 channel 1 plus the switch that powers the gauge.
pub struct PwmGauge {
    pwm: SimplePwm<'static, TIM3>,
    power: Output<'static>,
    duty: f32,
}

impl PwmGauge {
    pub fn new(mut pwm: SimplePwm<'static, TIM3>, power: Output<'static>) -> Self {
        pwm.ch1().set_duty_cycle(0);
        pwm.ch1().enable();
        Self {
            pwm,
            power,
            duty: 0.0,
        }
    }
}

impl GaugeOutput for PwmGauge {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn set_duty(&mut self, duty: f32) {
        let duty = duty.clamp(0.0, 100.0);
        let mut channel = self.pwm.ch1();
        let max = f32::from(channel.max_duty_cycle());
        channel.set_duty_cycle((max * duty / 100.0) as u16);
        self.duty = duty;
    }

    fn duty(&self) -> f32 {
        self.duty
    }

    fn set_powered(&mut self, powered: bool) {
        if powered {
            self.power.set_high();
        } else {
            self.power.set_low();
        }
    }
}
