//! USB CDC ACM console.
//!
//! A single CDC ACM interface carries the maintenance console. Received
//! bytes are posted to the mailbox one at a time; replies come back through
//! the reply queue.

pub const MAX_PACKET_SIZE: u16 = 64;

const CONTROL_BUFFER_LEN: usize = 64;
const CONFIG_DESCRIPTOR_LEN: usize = 256;
const BOS_DESCRIPTOR_LEN: usize = 256;
const MSOS_DESCRIPTOR_LEN: usize = 256;

/// User-visible strings advertised in the USB descriptors.
#[derive(Clone, Copy, Debug)]
pub struct UsbDeviceStrings {
    pub manufacturer: &'static str,
    pub product: &'static str,
    pub serial_number: Option<&'static str>,
}

impl Default for UsbDeviceStrings {
    fn default() -> Self {
        Self {
            manufacturer: "TAPS",
            product: "Trim Tab Actuator Console",
            serial_number: None,
        }
    }
}

/// Backing storage for the Embassy USB builder and the CDC ACM class.
pub struct UsbDeviceStorage {
    control_buf: [u8; CONTROL_BUFFER_LEN],
    config_descriptor: [u8; CONFIG_DESCRIPTOR_LEN],
    bos_descriptor: [u8; BOS_DESCRIPTOR_LEN],
    msos_descriptor: [u8; MSOS_DESCRIPTOR_LEN],
    console_state: embassy_usb::class::cdc_acm::State<'static>,
}

impl UsbDeviceStorage {
    pub fn new() -> Self {
        Self {
            control_buf: [0; CONTROL_BUFFER_LEN],
            config_descriptor: [0; CONFIG_DESCRIPTOR_LEN],
            bos_descriptor: [0; BOS_DESCRIPTOR_LEN],
            msos_descriptor: [0; MSOS_DESCRIPTOR_LEN],
            console_state: embassy_usb::class::cdc_acm::State::new(),
        }
    }
}

/// Split handles for the console interface.
pub struct ConsolePort<D: embassy_usb::driver::Driver<'static>> {
    pub sender: embassy_usb::class::cdc_acm::Sender<'static, D>,
    pub receiver: embassy_usb::class::cdc_acm::Receiver<'static, D>,
    pub control: embassy_usb::class::cdc_acm::ControlChanged<'static>,
}

impl<D> ConsolePort<D>
where
    D: embassy_usb::driver::Driver<'static>,
{
    /// Waits until the host enables both endpoints and asserts DTR.
    pub async fn wait_ready(&mut self) {
        embassy_futures::join::join(
            self.sender.wait_connection(),
            self.receiver.wait_connection(),
        )
        .await;
        while !self.sender.dtr() {
            self.control.control_changed().await;
        }
    }
}

/// The USB device together with its console port.
pub struct UsbConsole<D>
where
    D: embassy_usb::driver::Driver<'static>,
{
    pub device: embassy_usb::UsbDevice<'static, D>,
    pub port: ConsolePort<D>,
}

impl<D> UsbConsole<D>
where
    D: embassy_usb::driver::Driver<'static>,
{
    pub fn new(
        driver: D,
        storage: &'static mut UsbDeviceStorage,
        strings: UsbDeviceStrings,
    ) -> Self {
        let mut config = embassy_usb::Config::new(0x1209, 0x0001);
        config.manufacturer = Some(strings.manufacturer);
        config.product = Some(strings.product);
        config.serial_number = strings.serial_number;
        #[allow(clippy::cast_possible_truncation)]
        {
            config.max_packet_size_0 = MAX_PACKET_SIZE as u8;
        }
        config.max_power = 100;

        let mut builder = embassy_usb::Builder::new(
            driver,
            config,
            &mut storage.config_descriptor,
            &mut storage.bos_descriptor,
            &mut storage.msos_descriptor,
            &mut storage.control_buf,
        );

        let class = embassy_usb::class::cdc_acm::CdcAcmClass::new(
            &mut builder,
            &mut storage.console_state,
            MAX_PACKET_SIZE,
        );
        let (sender, receiver, control) = class.split_with_control();

        Self {
            device: builder.build(),
            port: ConsolePort {
                sender,
                receiver,
                control,
            },
        }
    }
}
