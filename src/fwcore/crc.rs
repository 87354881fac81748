// SPDX-License-Identifier: LGPL-2.1-or-later

//! Cyclic redundancy checks used by wire protocols and container footers.

/// CRC algorithms used by the transports and parsers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrcKind {
    /// Standard 8-bit CRC (SMBus polynomial)
    B8Standard,
    /// CRC-16/XMODEM as used by packetised serial protocols
    B16Xmodem,
}

const CRC8_STANDARD: crc::Crc<u8> = crc::Crc::<u8>::new(&crc::CRC_8_SMBUS);
const CRC16_XMODEM: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);

/// Compute a checksum over `data` with the given algorithm
#[must_use]
pub fn crc(kind: CrcKind, data: &[u8]) -> u32 {
    match kind {
        CrcKind::B8Standard => u32::from(CRC8_STANDARD.checksum(data)),
        CrcKind::B16Xmodem => u32::from(CRC16_XMODEM.checksum(data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_xmodem_vector() {
        // classic check value for "123456789"
        assert_eq!(crc(CrcKind::B16Xmodem, b"123456789"), 0x31C3);
    }

    #[test]
    fn test_crc8_vector() {
        assert_eq!(crc(CrcKind::B8Standard, b"123456789"), 0xF4);
        assert_eq!(crc(CrcKind::B8Standard, &[]), 0x00);
    }
}
