//! Modbus CRC16
//!
//! Polynomial `0xA001` (the bit-reversed `0x8005`), processed LSB first,
//! seeded with `0xFFFF`. On the wire the result is sent low byte first.

/// The initial value of every CRC accumulation
pub const CRC_SEED: u16 = 0xFFFF;

/// The number of CRC bytes trailing every frame
pub const CRC_LEN: usize = 2;

const POLY: u16 = 0xA001;

/// Fold a single byte into a running CRC
///
/// Start from [`CRC_SEED`]. Folding every byte of a buffer in order gives
/// the same result as [`crc16()`] over the whole buffer.
pub const fn crc16_update(crc: u16, byte: u8) -> u16 {
    let mut crc = crc ^ (byte as u16);
    let mut bit = 0;
    while bit < 8 {
        if crc & 0x0001 != 0 {
            crc = (crc >> 1) ^ POLY;
        } else {
            crc >>= 1;
        }
        bit += 1;
    }
    crc
}

/// Compute the CRC of a complete buffer
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(CRC_SEED, |crc, &b| crc16_update(crc, b))
}

/// Does `frame` end with a valid CRC over the bytes before it?
///
/// The trailing two bytes are read low byte first. Frames too short to
/// hold anything besides the CRC are never valid.
pub fn check(frame: &[u8]) -> bool {
    if frame.len() <= CRC_LEN {
        return false;
    }
    let (body, trailer) = frame.split_at(frame.len() - CRC_LEN);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    received == crc16(body)
}
