//! Task wiring.
//!
//! Event producers (tick, EXTI inputs, USB) run on a high-priority interrupt
//! executor. The control loop owns thread mode: it blocks inside
//! `Controller::run`, sleeping on `wfe` until a producer posts and signals
//! with `sev`.

use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_executor::{InterruptExecutor, Spawner};
use embassy_stm32 as hal;
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::flash::Flash;
use embassy_stm32::gpio::{Level, Output, OutputType, Pull, Speed};
use embassy_stm32::i2c::{self, I2c};
use embassy_stm32::interrupt;
use embassy_stm32::interrupt::{InterruptExt, Priority};
use embassy_stm32::time::Hertz;
use embassy_stm32::timer::low_level::CountingMode;
use embassy_stm32::timer::simple_pwm::{PwmPin, SimplePwm};
use static_cell::StaticCell;
use taps_core::control::{ControlConfig, Controller};
use taps_core::mailbox::{EventMailbox, MAILBOX_CAPACITY};
use taps_core::nvstate::{NvBackend, NvStore};
use taps_core::sources::{EventSources, install_event_ticks};
use taps_core::ticks::TickScheduler;

use crate::hw::flash::InternalFlash;
use crate::hw::fram::FramBus;
use crate::hw::gauge::{GAUGE_PWM_HZ, PwmGauge};
use crate::hw::motor::HBridge;
use crate::hw::{Leds, TapsBoard};
use crate::inputs::InputLevels;
use crate::replies::ReplyQueue;
use crate::usb;

mod input_task;
mod tick_task;
mod usb_task;

/// Gauge refresh and heartbeat, with room to spare.
const TICK_LISTENERS: usize = 4;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        cortex_m::interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                cortex_m::interrupt::enable();
            }
        }
    }
}

fn wake() {
    cortex_m::asm::sev();
}

pub(super) static MAILBOX: EventMailbox = EventMailbox::new();
pub(super) static SOURCES: EventSources<'static, MAILBOX_CAPACITY> =
    EventSources::with_wake(&MAILBOX, wake);
pub(super) static SCHEDULER: TickScheduler<EventSources<'static, MAILBOX_CAPACITY>, TICK_LISTENERS> =
    TickScheduler::new();
pub(super) static INPUTS: InputLevels = InputLevels::new();
pub(super) static REPLIES: ReplyQueue = ReplyQueue::new();
pub(super) static USB_STORAGE: StaticCell<usb::UsbDeviceStorage> = StaticCell::new();

static EXECUTOR_HIGH: InterruptExecutor = InterruptExecutor::new();

#[interrupt]
unsafe fn USART3_4_5_6_LPUART1() {
    unsafe { EXECUTOR_HIGH.on_interrupt() }
}

#[embassy_executor::main]
pub async fn main(_spawner: Spawner) {
    let p = hal::init(hal::Config::default());

    // Some boards feed the switch through optical isolators powered from here.
    let _trim_enable = Output::new(p.PA2, Level::High, Speed::Low);

    let motor = HBridge::new(
        Output::new(p.PB3, Level::Low, Speed::Low),
        Output::new(p.PB4, Level::Low, Speed::Low),
        Output::new(p.PB5, Level::Low, Speed::Low),
    );

    let pwm = SimplePwm::new(
        p.TIM3,
        Some(PwmPin::new(p.PA6, OutputType::PushPull)),
        None,
        None,
        None,
        Hertz(GAUGE_PWM_HZ),
        CountingMode::EdgeAlignedUp,
    );
    let gauge = PwmGauge::new(pwm, Output::new(p.PB0, Level::Low, Speed::Low));

    let mut i2c_config = i2c::Config::default();
    i2c_config.frequency = Hertz(400_000);
    i2c_config.timeout = embassy_time::Duration::from_millis(10);
    let fram = FramBus::new(I2c::new_blocking(p.I2C1, p.PB8, p.PB9, i2c_config));
    let flash = InternalFlash::new(Flash::new_blocking(p.FLASH));
    let store = NvBackend::select(fram, flash);
    defmt::info!("taps: {} backend", store.name());

    let board = TapsBoard::new(
        gauge,
        store.record().gauge_calibration().get(),
        Leds {
            status: Output::new(p.PA5, Level::Low, Speed::Low),
            power: Output::new(p.PA4, Level::Low, Speed::Low),
            heartbeat: Output::new(p.PC6, Level::Low, Speed::Low),
        },
        &INPUTS,
        &REPLIES,
    );

    SOURCES.set_power_fail_available(true);
    if install_event_ticks(&SCHEDULER).is_none() {
        defmt::error!("taps: tick scheduler full");
    }

    interrupt::USART3_4_5_6_LPUART1.set_priority(Priority::P1);
    let spawner = EXECUTOR_HIGH.start(interrupt::USART3_4_5_6_LPUART1);

    spawner
        .spawn(tick_task::run())
        .expect("failed to spawn tick task");
    spawner
        .spawn(input_task::trim(
            ExtiInput::new(p.PA0, p.EXTI0, Pull::Up),
            ExtiInput::new(p.PA1, p.EXTI1, Pull::Up),
        ))
        .expect("failed to spawn trim switch task");
    spawner
        .spawn(input_task::button(ExtiInput::new(p.PA3, p.EXTI3, Pull::Up)))
        .expect("failed to spawn config button task");
    spawner
        .spawn(input_task::power(ExtiInput::new(p.PB2, p.EXTI2, Pull::Up)))
        .expect("failed to spawn power monitor task");
    spawner
        .spawn(usb_task::run(p.USB, p.PA12, p.PA11))
        .expect("failed to spawn USB task");

    let mut controller =
        Controller::new(&SOURCES, store, motor, board, ControlConfig::default());
    controller.board().announce(controller.store());
    controller.boot();
    controller.run()
}
