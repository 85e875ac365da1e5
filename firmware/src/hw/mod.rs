//! STM32G0B1 board support.
//!
//! Pin map:
//!
//! | Signal            | Pin  | Notes                          |
//! |-------------------|------|--------------------------------|
//! | trim extend       | PA0  | EXTI0, active low              |
//! | trim retract      | PA1  | EXTI1, active low              |
//! | trim enable       | PA2  | held high for optical isolators|
//! | config button     | PA3  | EXTI3, active low              |
//! | power fail        | PB2  | EXTI2, low while supply sags   |
//! | status LED        | PA5  |                                |
//! | power LED         | PA4  |                                |
//! | heartbeat LED     | PC6  |                                |
//! | gauge PWM         | PA6  | TIM3 CH1                       |
//! | gauge power       | PB0  |                                |
//! | motor extend      | PB3  |                                |
//! | motor retract     | PB4  |                                |
//! | motor enable      | PB5  |                                |
//! | FRAM SCL / SDA    | PB8 / PB9 | I2C1                      |
//! | USB DM / DP       | PA11 / PA12 |                         |

pub mod flash;
pub mod fram;
pub mod gauge;
pub mod motor;

use core::fmt::Write as _;
use core::time::Duration as CoreDuration;

use defmt::{error, info, warn};
use embassy_stm32::gpio::Output;
use embassy_time::{Duration, Instant, block_for};
use taps_core::actuator::Timestamp;
use taps_core::console::{ConsoleReply, LineBuffer, execute};
use taps_core::control::{Board, Fault};
use taps_core::gauge::{CalibrationSession, CalibrationStatus, Gauge, NUDGE_INTERVAL_MS};
use taps_core::nvstate::{GaugeCalibration, NvStore, PersistedRecord};

use crate::inputs::{CalibrationInputs, InputLevels};
use crate::replies::{ReplyQueue, ReplyWriter, send_reply};

use self::gauge::PwmGauge;

/// Blinks shown on the status LED when a fault is signalled.
const FAULT_BLINKS: u32 = 5;
const FAULT_BLINK: Duration = Duration::from_millis(150);

fn pause_ms(ms: u32) {
    block_for(Duration::from_millis(u64::from(ms)));
}

fn set_level(pin: &mut Output<'static>, on: bool) {
    if on {
        pin.set_high();
    } else {
        pin.set_low();
    }
}

/// LEDs on the front panel.
pub struct Leds {
    pub status: Output<'static>,
    pub power: Output<'static>,
    pub heartbeat: Output<'static>,
}

/// Everything the control loop reaches through [`Board`].
pub struct TapsBoard {
    gauge: Gauge<PwmGauge>,
    leds: Leds,
    inputs: &'static InputLevels,
    replies: &'static ReplyQueue,
    console: LineBuffer,
}

impl TapsBoard {
    pub fn new(
        gauge: PwmGauge,
        calibration: GaugeCalibration,
        leds: Leds,
        inputs: &'static InputLevels,
        replies: &'static ReplyQueue,
    ) -> Self {
        Self {
            gauge: Gauge::new(gauge, calibration),
            leds,
            inputs,
            replies,
            console: LineBuffer::new(),
        }
    }

    fn blink_fault(&mut self) {
        for _ in 0..FAULT_BLINKS * 2 {
            self.leds.status.toggle();
            block_for(FAULT_BLINK);
        }
    }

    /// Prints the boot banner on the console.
    pub fn announce<S: NvStore>(&self, store: &S) {
        let mut writer = ReplyWriter::new(|frame| self.replies.try_send(frame).is_ok());
        let formatted = write!(
            writer,
            "TAPS ready, {} backend, gauge {:?}",
            store.name(),
            self.gauge.map().calibration()
        );
        let dropped = writer.finish();
        report_reply(formatted.map(|()| dropped));
    }
}

fn report_reply(sent: Result<usize, core::fmt::Error>) {
    match sent {
        Ok(0) => {}
        Ok(dropped) => warn!("board: {} reply frames dropped", dropped),
        Err(_) => warn!("board: reply formatting failed"),
    }
}

impl Board for TapsBoard {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(Instant::now().as_millis())
    }

    fn pause(&mut self, duration: CoreDuration) {
        let ticks = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        block_for(Duration::from_micros(ticks));
    }

    fn gauge_set(&mut self, percent: f32) {
        self.gauge.set(percent);
    }

    fn gauge_set_slow(&mut self, percent: f32) {
        self.gauge.set_slow(percent, pause_ms);
    }

    fn gauge_get(&self) -> f32 {
        self.gauge.get()
    }

    fn gauge_enable(&mut self) {
        self.gauge.enable();
    }

    fn gauge_disable(&mut self) {
        self.gauge.disable();
    }

    fn status_led(&mut self, on: bool) {
        set_level(&mut self.leds.status, on);
    }

    fn toggle_status_led(&mut self) {
        self.leds.status.toggle();
    }

    fn toggle_heartbeat_led(&mut self) {
        self.leds.heartbeat.toggle();
    }

    fn power_led(&mut self, on: bool) {
        set_level(&mut self.leds.power, on);
    }

    fn signal_fault(&mut self, fault: Fault) {
        error!("board: {}", fault);
        report_reply(send_reply(self.replies, fault));
        self.blink_fault();
    }

    fn wait_for_event(&mut self) {
        cortex_m::asm::wfe();
    }

    fn configure(&mut self, record: &mut PersistedRecord) -> bool {
        let mut session = CalibrationSession::new(record.gauge_calibration().get(), self.now());
        let mut inputs = CalibrationInputs::new();
        info!("board: gauge calibration started");
        self.gauge.set_duty_slow(session.duty(), pause_ms);

        loop {
            pause_ms(NUDGE_INTERVAL_MS);
            let now = self.now();
            match session.apply(inputs.sample(self.inputs.snapshot(), now), now) {
                CalibrationStatus::InProgress(_) => self.gauge.set_duty(session.duty()),
                CalibrationStatus::Complete(points) => {
                    self.gauge.calibrate(points);
                    record.set_gauge_calibration(points);
                    info!("board: gauge calibrated");
                    return true;
                }
                CalibrationStatus::Rejected => {
                    warn!("board: calibration rejected");
                    self.blink_fault();
                    return false;
                }
                CalibrationStatus::Aborted => {
                    info!("board: calibration abandoned");
                    return false;
                }
            }
        }
    }

    fn user_command<S: NvStore>(&mut self, code: u8, store: &mut S) {
        let Some(parsed) = self.console.ingest(code) else {
            return;
        };

        let sent = match parsed {
            Ok(command) => {
                let reply = execute(&command, store);
                if let ConsoleReply::Calibrated(points) = &reply {
                    self.gauge.calibrate(*points);
                }
                send_reply(self.replies, &reply)
            }
            Err(err) => send_reply(self.replies, err),
        };
        report_reply(sent);
    }
}
