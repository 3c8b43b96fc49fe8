//! CRC16 integrity check used by the sensor's radio payloads.
//!
//! The sensor runs a reflected CCITT CRC (polynomial 0x8408, seed 0xFFFF, no
//! final XOR) and then reverses the bit order of the 16-bit result. The check is
//! accept/reject only; nothing in this crate attempts error correction.

/// Reflected CCITT polynomial.
const POLYNOMIAL: u16 = 0x8408;

/// Initial register value.
const SEED: u16 = 0xFFFF;

/// Byte-wise lookup table for the reflected polynomial.
pub const CRC16_TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut n = 0;
    while n < 256 {
        let mut crc = n as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLYNOMIAL } else { crc >> 1 };
            bit += 1;
        }
        table[n] = crc;
        n += 1;
    }
    table
}

/// Compute the sensor CRC16 of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let crc = data
        .iter()
        .fold(SEED, |crc, &byte| (crc >> 8) ^ CRC16_TABLE[usize::from((crc ^ u16::from(byte)) as u8)]);
    crc.reverse_bits()
}

/// Check a buffer whose last two bytes hold the big-endian CRC16 of the rest.
///
/// Buffers shorter than three bytes never validate.
pub fn has_valid_crc16_trailer(data: &[u8]) -> bool {
    if data.len() < 3 {
        return false;
    }
    let (body, trailer) = data.split_at(data.len() - 2);
    crc16(body) == u16::from_be_bytes([trailer[0], trailer[1]])
}

/// Append the big-endian CRC16 trailer expected by [`has_valid_crc16_trailer`].
pub fn append_crc16(data: &mut Vec<u8>) {
    let crc = crc16(data);
    data.extend_from_slice(&crc.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_values() {
        assert_eq!(&CRC16_TABLE[..8], &[0x0000, 0x1189, 0x2312, 0x329B, 0x4624, 0x57AD, 0x6536, 0x74BF]);
        assert_eq!(CRC16_TABLE[128], 0x8408);
        assert_eq!(CRC16_TABLE[255], 0x0F78);
    }

    #[test]
    fn test_check_value() {
        // CRC-16/MCRF4XX check value 0x6F91, bit-reversed
        assert_eq!(crc16(b"123456789"), 0x89F6);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_trailer_round_trip() {
        let mut data = b"glucose frame body".to_vec();
        append_crc16(&mut data);
        assert!(has_valid_crc16_trailer(&data));

        data[3] ^= 0x01;
        assert!(!has_valid_crc16_trailer(&data));
    }

    #[test]
    fn test_short_buffers_rejected() {
        assert!(!has_valid_crc16_trailer(&[]));
        assert!(!has_valid_crc16_trailer(&[0xFF, 0xFF]));
    }
}
