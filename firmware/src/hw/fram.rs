//! I2C transport for the external FRAM.

use embassy_stm32::i2c::{Error, I2c, Master};
use embassy_stm32::mode::Blocking;
use taps_core::nvstate::{Transport, TransportError};

/// 7-bit address of the MB85RC64 with all strap pins low.
pub const FRAM_ADDRESS: u8 = 0x50;

pub struct FramBus {
    i2c: I2c<'static, Blocking, Master>,
    address: u8,
}

impl FramBus {
    pub fn new(i2c: I2c<'static, Blocking, Master>) -> Self {
        Self {
            i2c,
            address: FRAM_ADDRESS,
        }
    }
}

fn transport_error(err: Error) -> TransportError {
    defmt::debug!("fram: i2c error {}", defmt::Debug2Format(&err));
    TransportError::TimeoutOrNack
}

impl Transport for FramBus {
    fn is_available(&mut self) -> bool {
        let mut probe = [0_u8; 1];
        self.i2c
            .blocking_write_read(self.address, &[0, 0], &mut probe)
            .is_ok()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.i2c
            .blocking_write(self.address, bytes)
            .map_err(transport_error)
    }

    fn write_then_read(&mut self, write: &[u8], read: &mut [u8]) -> Result<(), TransportError> {
        self.i2c
            .blocking_write_read(self.address, write, read)
            .map_err(transport_error)
    }
}
