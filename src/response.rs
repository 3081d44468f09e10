//! Response Builder
//!
//! Serializes replies and hands them to the [`Transmit`] sink. A normal reply
//! is:
//!
//! ```text
//! [address][function][payload...][crc_lo][crc_hi]
//! ```
//!
//! and an exception reply is:
//!
//! ```text
//! [address][function | 0x80][exception_code][crc_lo][crc_hi]
//! ```

use heapless::Vec;

use crate::{
    crc::{crc16, CRC_LEN},
    ExceptionCode, FunctionCode, Transmit,
};

/// The largest reply this engine will ever send, CRC included
///
/// A full 125 register read is `3 + 250 + 2 = 255` bytes.
pub const MAX_RESPONSE_LEN: usize = 256;

/// The reply did not fit [`MAX_RESPONSE_LEN`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct ResponseFull;

impl From<ResponseFull> for ExceptionCode {
    fn from(_: ResponseFull) -> Self {
        ExceptionCode::SlaveDeviceFailure
    }
}

/// A reply under construction
///
/// Holds everything up to, but not including, the CRC. Room for the CRC is
/// always kept free, so [`Response::send()`] cannot run out of space.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    buf: Vec<u8, MAX_RESPONSE_LEN>,
}

impl Response {
    const LIMIT: usize = MAX_RESPONSE_LEN - CRC_LEN;

    /// Start a normal reply for `function`
    pub fn new(address: u8, function: u8) -> Self {
        let mut resp = Self { buf: Vec::new() };
        // A two byte header always fits
        let _ = resp.extend(&[address, function]);
        resp
    }

    /// A complete exception reply
    pub fn exception(address: u8, function: u8, code: ExceptionCode) -> Self {
        let mut resp = Self { buf: Vec::new() };
        let _ = resp.extend(&[address, function | FunctionCode::EXCEPTION_BIT, code.into()]);
        resp
    }

    /// A reply that repeats the first bytes of a request verbatim
    pub fn echo(head: &[u8]) -> Result<Self, ResponseFull> {
        let mut resp = Self { buf: Vec::new() };
        resp.extend(head)?;
        Ok(resp)
    }

    /// Append one byte
    pub fn push(&mut self, byte: u8) -> Result<(), ResponseFull> {
        if self.buf.len() >= Self::LIMIT {
            return Err(ResponseFull);
        }
        self.buf.push(byte).map_err(|_| ResponseFull)
    }

    /// Append a big-endian word
    pub fn push_u16(&mut self, word: u16) -> Result<(), ResponseFull> {
        self.extend(&word.to_be_bytes())
    }

    /// Append a run of bytes, all or nothing
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), ResponseFull> {
        if self.buf.len() + bytes.len() > Self::LIMIT {
            return Err(ResponseFull);
        }
        self.buf.extend_from_slice(bytes).map_err(|_| ResponseFull)
    }

    /// The function byte, with the exception bit if this is an exception
    #[inline]
    pub fn function(&self) -> u8 {
        self.buf.get(1).copied().unwrap_or_default()
    }

    /// The exception code, if this is an exception reply
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        if self.function() & FunctionCode::EXCEPTION_BIT == 0 {
            return None;
        }
        self.buf
            .get(2)
            .and_then(|b| ExceptionCode::try_from(*b).ok())
    }

    /// Is this an exception reply?
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.exception_code().is_some()
    }

    /// The serialized bytes so far, without the CRC
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Append the CRC, low byte first, returning the wire bytes
    pub fn finish(self) -> Vec<u8, MAX_RESPONSE_LEN> {
        let crc = crc16(&self.buf);
        let mut wire = self.buf;
        // Room for the CRC is reserved by every append
        let _ = wire.extend_from_slice(&crc.to_le_bytes());
        wire
    }

    /// Finish the reply and hand it to `tx`
    ///
    /// Returns the number of bytes `tx` reports as sent. Zero means the
    /// transmission failed; it is NOT retried here.
    pub fn send<T: Transmit + ?Sized>(self, tx: &mut T) -> usize {
        let wire = self.finish();
        let sent = tx.transmit(&wire);
        if sent == 0 {
            mb_warn!("transmit of {=usize} bytes failed", wire.len());
        } else if sent != wire.len() {
            mb_warn!("short transmit, {=usize} of {=usize}", sent, wire.len());
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec as StdVec;

    struct Capture {
        frames: StdVec<StdVec<u8>>,
        fail: bool,
    }

    impl Transmit for Capture {
        fn transmit(&mut self, frame: &[u8]) -> usize {
            self.frames.push(frame.to_vec());
            if self.fail {
                0
            } else {
                frame.len()
            }
        }
    }

    #[test]
    fn exception_layout() {
        let resp = Response::exception(0x01, 0x03, ExceptionCode::IllegalDataValue);
        assert!(resp.is_exception());
        assert_eq!(resp.exception_code(), Some(ExceptionCode::IllegalDataValue));
        let wire = resp.finish();
        assert_eq!(&wire[..3], &[0x01, 0x83, 0x03]);
        assert_eq!(&wire[3..], &crc16(&[0x01, 0x83, 0x03]).to_le_bytes());
    }

    #[test]
    fn normal_reply_is_not_an_exception() {
        let mut resp = Response::new(0x11, 0x03);
        resp.push(2).unwrap();
        resp.push_u16(0xBEEF).unwrap();
        assert!(!resp.is_exception());
        assert_eq!(resp.as_bytes(), &[0x11, 0x03, 0x02, 0xBE, 0xEF]);
    }

    #[test]
    fn send_reports_bytes_sent() {
        let mut tx = Capture {
            frames: StdVec::new(),
            fail: false,
        };
        let resp = Response::echo(&[0x01, 0x06, 0x00, 0x05, 0x04, 0xD2]).unwrap();
        assert_eq!(resp.send(&mut tx), 8);
        assert_eq!(tx.frames.len(), 1);
        assert!(crate::crc::check(&tx.frames[0]));
    }

    #[test]
    fn failed_transmit_is_reported_not_retried() {
        let mut tx = Capture {
            frames: StdVec::new(),
            fail: true,
        };
        let resp = Response::exception(0x01, 0x2B, ExceptionCode::IllegalFunction);
        assert_eq!(resp.send(&mut tx), 0);
        assert_eq!(tx.frames.len(), 1);
    }

    #[test]
    fn crc_room_is_always_reserved() {
        let mut resp = Response::new(0x01, 0x03);
        while resp.push(0xAA).is_ok() {}
        assert_eq!(resp.as_bytes().len(), MAX_RESPONSE_LEN - CRC_LEN);
        assert_eq!(resp.push_u16(1), Err(ResponseFull));
        assert_eq!(resp.finish().len(), MAX_RESPONSE_LEN);
    }
}
