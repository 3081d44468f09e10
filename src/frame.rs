//! Validated request frames
//!
//! A request on the wire looks like:
//!
//! ```text
//! [address:1][function:1][payload:N][crc_lo:1][crc_hi:1]
//! ```

use crate::crc::{self, CRC_LEN};

/// ValidFrame represents a CRC-checked request buffered from the wire
///
/// It is guaranteed to hold at least an address byte, a function byte, and
/// the trailing CRC. It borrows the assembler's buffer, so it only lives for
/// the duration of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidFrame<'a> {
    bytes: &'a [u8],
}

impl<'a> ValidFrame<'a> {
    const MIN_LEN: usize = 2 + CRC_LEN;

    /// Check the trailing CRC of `bytes`, returning a view on success
    pub fn check(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < Self::MIN_LEN || !crc::check(bytes) {
            return None;
        }
        Some(Self { bytes })
    }

    /// The slave address this frame was sent to
    #[inline]
    pub fn address(&self) -> u8 {
        self.bytes[0]
    }

    /// The raw function code byte
    #[inline]
    pub fn function(&self) -> u8 {
        self.bytes[1]
    }

    /// The frame without its trailing CRC
    #[inline]
    pub fn body(&self) -> &'a [u8] {
        &self.bytes[..self.bytes.len() - CRC_LEN]
    }

    /// The complete frame, CRC included
    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// The byte at `offset`, if it lies before the CRC
    #[inline]
    pub fn byte(&self, offset: usize) -> Option<u8> {
        self.body().get(offset).copied()
    }

    /// The big-endian word at `offset..offset + 2`, if it lies before the CRC
    pub fn be_u16(&self, offset: usize) -> Option<u16> {
        let hi = self.byte(offset)?;
        let lo = self.byte(offset + 1)?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    /// The total length, CRC included
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false, a valid frame holds at least four bytes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
