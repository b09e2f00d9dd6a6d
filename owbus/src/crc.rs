//! 1-Wire checksums.
//!
//! CRC8 is the Dallas/Maxim polynomial x^8 + x^5 + x^4 + 1 used for ROM
//! addresses and scratchpads. CRC16 is x^16 + x^15 + x^2 + 1 (CRC-16/ARC),
//! used by memory and switch chips. Both run LSB first with a zero initial
//! register; the seeded variants continue from a register value left by an
//! earlier partial transfer.

use crc::{Crc, CRC_16_ARC, CRC_8_MAXIM_DOW};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_MAXIM_DOW);
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Residue of a CRC16 computed over data followed by the inverted CRC16, which
/// is how 1-Wire devices transmit it.
pub const CRC16_RESIDUE: u16 = 0xB001;

/// CRC8 over `bytes`. Zero when `bytes` ends with its own CRC8.
pub fn crc8(bytes: &[u8]) -> u8 {
    CRC8.checksum(bytes)
}

/// CRC8 continuing from register value `seed`.
pub fn crc8_seeded(bytes: &[u8], seed: u8) -> u8 {
    // The digest reflects its initial value for reflected algorithms; undo
    // that so `seed` lands in the register as-is.
    let mut digest = CRC8.digest_with_initial(seed.reverse_bits());
    digest.update(bytes);
    digest.finalize()
}

/// CRC16 over `bytes`.
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// CRC16 continuing from register value `seed`.
pub fn crc16_seeded(bytes: &[u8], seed: u16) -> u16 {
    let mut digest = CRC16.digest_with_initial(seed.reverse_bits());
    digest.update(bytes);
    digest.finalize()
}

/// Whether `bytes` (data followed by the device's inverted CRC16) checks out.
pub fn crc16_is_valid(bytes: &[u8], seed: u16) -> bool {
    crc16_seeded(bytes, seed) == CRC16_RESIDUE
}

/// Inverted CRC16 in transmission order, as a device appends it.
pub fn crc16_trailer(bytes: &[u8]) -> [u8; 2] {
    (!crc16(bytes)).to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_check_values() {
        assert_eq!(crc8(b"123456789"), 0xA1);
        assert_eq!(crc16(b"123456789"), 0xBB3D);
    }

    #[test]
    fn test_crc8_rom_address() {
        // ROM code from the Maxim CRC application note.
        let rom = [0x02, 0x1C, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xA2];
        assert_eq!(crc8(&rom[..7]), 0xA2);
        assert_eq!(crc8(&rom), 0);
    }

    #[test]
    fn test_crc8_appended_residue_is_zero() {
        let mut data = vec![0x50, 0x05, 0x4B, 0x46, 0x7F, 0xFF, 0x0C, 0x10];
        data.push(crc8(&data));
        assert_eq!(crc8(&data), 0);
    }

    #[test]
    fn test_crc16_appended_residue() {
        let data = [0xF0, 0x00, 0x00, 0xAA, 0x55, 0x01];

        let mut plain = data.to_vec();
        plain.extend_from_slice(&crc16(&data).to_le_bytes());
        assert_eq!(crc16(&plain), 0);

        let mut inverted = data.to_vec();
        inverted.extend_from_slice(&crc16_trailer(&data));
        assert_eq!(crc16(&inverted), CRC16_RESIDUE);
        assert!(crc16_is_valid(&inverted, 0));
    }

    #[test]
    fn test_seeded_continues_register() {
        let head = [0xF0, 0x20, 0x00];
        let tail = [0x01, 0x02, 0x03, 0x04];
        let whole: Vec<u8> = head.iter().chain(tail.iter()).copied().collect();

        assert_eq!(crc8_seeded(&tail, crc8(&head)), crc8(&whole));
        assert_eq!(crc16_seeded(&tail, crc16(&head)), crc16(&whole));
        assert_eq!(crc8_seeded(&whole, 0), crc8(&whole));
    }

    #[test]
    fn test_single_bit_flip_detected() {
        let mut data = vec![0x10, 0x01, 0x00, 0x00, 0x7F, 0xFF, 0x0C, 0x10];
        data.push(crc8(&data));
        data[3] ^= 0x04;
        assert_ne!(crc8(&data), 0);
    }
}
