//! CRC-16 used by both persistence backends.

use crc::{CRC_16_IBM_3740, Crc};

/// Width of every stored checksum, in bytes.
pub const CRC_LEN: usize = 2;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Checksum of a single byte run.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Checksum over several byte runs, fed in order as if concatenated.
#[must_use]
pub fn crc16_chain(parts: &[&[u8]]) -> u16 {
    let mut digest = CRC16.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_the_ccitt_false_check_value() {
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn chained_parts_equal_the_concatenation() {
        assert_eq!(crc16_chain(&[b"1234", b"56789"]), crc16(b"123456789"));
    }

    #[test]
    fn single_bit_flip_changes_the_checksum() {
        let mut data = *b"trim tab";
        let original = crc16(&data);
        data[3] ^= 0x10;
        assert_ne!(crc16(&data), original);
    }
}
