use embassy_futures::join::join;
use embassy_futures::select::{Either3, select3};
use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_time::Timer;
use embassy_usb::driver::EndpointError;

use super::{REPLIES, SOURCES, USB_STORAGE};
use crate::replies::ReplyFrame;
use crate::usb::{self, ConsolePort, UsbDeviceStrings};

/// Milliseconds a console byte waits for a free mailbox slot.
const POST_RETRIES: u32 = 50;

embassy_stm32::bind_interrupts!(struct UsbIrqs {
    USB_UCPD1_2 => embassy_stm32::usb::InterruptHandler<hal::peripherals::USB>;
});

#[embassy_executor::task]
pub async fn run(
    usb: Peri<'static, hal::peripherals::USB>,
    dp: Peri<'static, hal::peripherals::PA12>,
    dm: Peri<'static, hal::peripherals::PA11>,
) -> ! {
    let storage = USB_STORAGE.init(usb::UsbDeviceStorage::new());
    let driver = embassy_stm32::usb::Driver::new(usb, UsbIrqs, dp, dm);

    let usb::UsbConsole { mut device, port } =
        usb::UsbConsole::new(driver, storage, UsbDeviceStrings::default());

    join(device.run(), run_console(port)).await;
    loop {
        core::future::pending::<()>().await;
    }
}

async fn run_console<D>(mut port: ConsolePort<D>) -> !
where
    D: embassy_usb::driver::Driver<'static>,
{
    let mut ingress = [0u8; usb::MAX_PACKET_SIZE as usize];
    let mut pending_tx: Option<ReplyFrame> = None;

    loop {
        port.wait_ready().await;
        pending_tx.take();
        defmt::info!("usb: console connected");

        loop {
            let ConsolePort {
                sender,
                receiver,
                control,
            } = &mut port;

            match select3(
                receiver.read_packet(&mut ingress),
                async {
                    if pending_tx.is_none() {
                        pending_tx = Some(REPLIES.receive().await);
                    }
                    let Some(frame) = pending_tx.as_ref() else {
                        return Ok(());
                    };
                    let result = sender.write_packet(frame).await;
                    if result.is_ok() {
                        pending_tx = None;
                    }
                    result
                },
                control.control_changed(),
            )
            .await
            {
                Either3::First(Ok(count)) => {
                    for &byte in &ingress[..count] {
                        post_console_byte(byte).await;
                    }
                }
                Either3::First(Err(EndpointError::Disabled)) => {
                    defmt::warn!("usb: console interface disabled");
                    break;
                }
                Either3::First(Err(_)) => {
                    defmt::warn!("usb: console read error");
                }
                Either3::Second(Ok(())) => {}
                Either3::Second(Err(EndpointError::Disabled)) => {
                    defmt::warn!("usb: console write disabled");
                    break;
                }
                Either3::Second(Err(_)) => {
                    defmt::warn!("usb: console write error");
                }
                Either3::Third(()) => {
                    if !sender.dtr() {
                        defmt::info!("usb: host dropped DTR");
                        break;
                    }
                }
            }
        }
    }
}

/// A packet can carry more bytes than the mailbox holds, so wait for the
/// control loop to drain it.
async fn post_console_byte(byte: u8) {
    for _ in 0..POST_RETRIES {
        if SOURCES.post_user_command(byte) {
            return;
        }
        Timer::after_millis(1).await;
    }
    defmt::warn!("usb: console byte dropped");
}
