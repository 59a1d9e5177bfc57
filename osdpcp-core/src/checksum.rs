//! OSDP message check characters
//!
//! Frames carry either a CRC-16 or a legacy 8-bit checksum, selected by
//! bit 2 of the control byte:
//! 1. CRC-16/AUG-CCITT: polynomial 0x1021, initial value 0x1D0F, no
//!    reflection, no final XOR, sent little-endian
//! 2. Checksum: two's complement of the byte sum, one byte

use tracing::trace;

const CRC_POLY: u16 = 0x1021;
const CRC_INIT: u16 = 0x1D0F;

/// Calculate the CRC-16 of an OSDP frame (everything before the CRC)
///
/// # Examples
///
/// ```
/// use osdpcp_core::checksum;
///
/// assert_eq!(checksum::crc16(b"123456789"), 0xE5CC);
/// ```
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC_INIT;

    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC_POLY
            } else {
                crc << 1
            };
        }
    }

    trace!(len = data.len(), crc = format!("0x{:04X}", crc), "Calculated CRC");

    crc
}

/// Calculate the 8-bit checksum
pub fn checksum8(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Verify CRC
pub fn verify_crc16(data: &[u8], expected: u16) -> bool {
    crc16(data) == expected
}

/// Verify checksum
pub fn verify_checksum8(data: &[u8], expected: u8) -> bool {
    checksum8(data) == expected
}
