//! Internal flash as a wear-levelled log device.

use embassy_stm32::flash::{Blocking, Error, FLASH_SIZE, Flash, WRITE_SIZE};
use taps_core::nvstate::{FlashDevice, FlashError};

/// Erase granularity of the STM32G0 main flash.
pub const PAGE_SIZE: u32 = 2048;

pub struct InternalFlash {
    flash: Flash<'static, Blocking>,
}

impl InternalFlash {
    pub fn new(flash: Flash<'static, Blocking>) -> Self {
        Self { flash }
    }

    fn check(&self, address: u32, len: usize) -> Result<(), FlashError> {
        let end = u64::from(address) + len as u64;
        if end > FLASH_SIZE as u64 {
            return Err(FlashError::OutOfBounds);
        }
        Ok(())
    }
}

fn flash_error(err: Error) -> FlashError {
    match err {
        Error::Size => FlashError::OutOfBounds,
        Error::Unaligned => FlashError::Unaligned,
        other => {
            defmt::warn!("flash: controller error {}", defmt::Debug2Format(&other));
            FlashError::Device
        }
    }
}

impl FlashDevice for InternalFlash {
    #[allow(clippy::cast_possible_truncation)]
    fn capacity(&self) -> u32 {
        FLASH_SIZE as u32
    }

    fn sector_size(&self) -> u32 {
        PAGE_SIZE
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_size(&self) -> u32 {
        WRITE_SIZE as u32
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check(address, buf.len())?;
        self.flash.blocking_read(address, buf).map_err(flash_error)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn erase(&mut self, address: u32, len: u32) -> Result<(), FlashError> {
        self.check(address, len as usize)?;
        if address % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 {
            return Err(FlashError::Unaligned);
        }
        self.flash
            .blocking_erase(address, address + len)
            .map_err(flash_error)
    }

    /// Programs `data` one double-word at a time. Units that already hold
    /// the requested bytes are skipped, since the controller raises PROGERR
    /// on any write to a programmed double-word.
    #[allow(clippy::cast_possible_truncation)]
    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        self.check(address, data.len())?;
        if address as usize % WRITE_SIZE != 0 || data.len() % WRITE_SIZE != 0 {
            return Err(FlashError::Unaligned);
        }
        let mut current = [0_u8; WRITE_SIZE];
        for (index, unit) in data.chunks_exact(WRITE_SIZE).enumerate() {
            let at = address + (index * WRITE_SIZE) as u32;
            self.flash
                .blocking_read(at, &mut current)
                .map_err(flash_error)?;
            if current.as_slice() == unit {
                continue;
            }
            self.flash.blocking_write(at, unit).map_err(flash_error)?;
        }
        Ok(())
    }
}
