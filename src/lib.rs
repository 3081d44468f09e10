//! # RTU Slave
//!
//! This is a Modbus RTU slave protocol engine, intended for small embedded
//! devices sitting on a serial (typically RS-485) line. It consumes the bytes
//! heard on the line, picks out the frames addressed to this device, answers
//! holding register reads and writes, and keeps itself alive with a small
//! recovery supervisor.
//!
//! Peripheral bring-up (clocks, DMA, UART registers) and sensor acquisition
//! are NOT part of this crate. They are reached only through the traits below.
//!
//! ## Data flow
//!
//! ```text
//! bytes -> Assembler (CRC checked) -> dispatch (register I/O) -> Response -> Transmit
//! ```
//!
//! 1. The receive path hands every received chunk to a [`DeviceContext`][crate::context::DeviceContext],
//!    one byte at a time.
//! 2. The [`Assembler`][crate::assembler::Assembler] waits for our own address byte, buffers
//!    a frame, and checks its trailing CRC16.
//! 3. A valid frame is handed to [`dispatch()`][crate::dispatch::dispatch], which reads or writes
//!    the [`RegisterStore`] and decides between a normal reply and an exception.
//! 4. The [`Response`][crate::response::Response] is serialized, the CRC is appended
//!    low byte first, and the result is handed to the [`Transmit`] sink.
//!
//! Framing errors (bad CRC, overflow) are swallowed: the engine goes back to
//! idle and nothing is sent. Request errors (bad counts, unknown functions)
//! are answered with a Modbus exception frame.
//!
//! ## Framing
//!
//! Canonical Modbus RTU frames are delimited by line silence. This engine
//! instead counts bytes. In the default [`Framing::Fixed`][crate::assembler::Framing::Fixed]
//! mode every frame is exactly eight bytes long, which covers function codes
//! 3, 4 and 6, but NOT Write Multiple Registers (16), whose requests grow
//! with the register count. [`Framing::ByFunction`][crate::assembler::Framing::ByFunction]
//! derives the expected length from the function code and the declared byte
//! count instead.
//!
//! ## Recovery
//!
//! The [`Supervisor`][crate::recovery::Supervisor] is ticked from the main
//! loop. It watches for:
//!
//! * A burst of transport errors (three within a five second window)
//! * A long silence on the line (2.5 seconds without any received bytes)
//! * A preventive interval (every ten seconds)
//!
//! and, when one of those trips, drives the context back to idle and asks the
//! receive path to re-arm reception.
//!
//! ## Concurrency
//!
//! A context is NOT reentrant. Exactly one frame is assembled and processed at
//! a time. The receive path and the supervisor are serialized through the
//! table's async mutex; the supervisor only ever tries the lock, and its
//! non-blocking accessors fail with
//! [`ContextError::Busy`][crate::context::ContextError::Busy] while the table is
//! in use.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(async_fn_in_trait)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod assembler;
pub mod context;
pub mod crc;
pub mod dispatch;
pub mod frame;
pub mod recovery;
pub mod registers;
pub mod response;
pub mod runner;

pub use crate::context::{Contexts, DeviceConfig, DeviceContext, Handle};
pub use crate::recovery::Supervisor;

/// The slave address used when nothing else is configured
pub const DEFAULT_SLAVE_ADDRESS: u8 = 0x01;

/// The logical address of the first holding register
pub const REGISTER_BASE: u32 = 40001;

/// The number of holding registers exposed by a default device
pub const DEVICE_REGISTERS: usize = 20;

/// An error type for the [`ByteSource`][crate::runner::ByteSource] trait
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum Error<E> {
    /// Some error with the underlying hardware serial port
    Serial(E),
}

impl<E> From<E> for Error<E> {
    fn from(value: E) -> Self {
        Self::Serial(value)
    }
}

/// A trait representing the sending half of the serial line
pub trait Transmit {
    /// Send a single, complete frame.
    ///
    /// This call is synchronous, and may block up to some bounded hardware
    /// timeout. It returns the number of bytes actually sent. Zero means the
    /// transmission failed; no retry is attempted by the engine.
    fn transmit(&mut self, frame: &[u8]) -> usize;
}

impl<T: Transmit + ?Sized> Transmit for &mut T {
    fn transmit(&mut self, frame: &[u8]) -> usize {
        T::transmit(self, frame)
    }
}

/// A trait representing the holding register storage of the device
///
/// The store is shared with whatever refreshes sensor values, so both
/// methods take `&self`. Implementations must make single register updates
/// atomic, so an interleaved refresh and Modbus write never tear a value.
pub trait RegisterStore {
    /// Read the register at `logical_address` (e.g. `40001`)
    fn read(&self, logical_address: u32) -> u16;

    /// Write `value` to the register at `logical_address`, returning the
    /// value ultimately stored.
    fn write(&self, logical_address: u32, value: u16) -> u16;
}

impl<T: RegisterStore + ?Sized> RegisterStore for &T {
    fn read(&self, logical_address: u32) -> u16 {
        T::read(self, logical_address)
    }

    fn write(&self, logical_address: u32, value: u16) -> u16 {
        T::write(self, logical_address, value)
    }
}

/// Supported function codes
///
/// Any other function code is answered with
/// [`ExceptionCode::IllegalFunction`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum FunctionCode {
    /// Read Holding Registers - `0x03`
    ReadHoldingRegisters,
    /// Read Input Registers - `0x04`
    ///
    /// Served exactly like [`FunctionCode::ReadHoldingRegisters`].
    ReadInputRegisters,
    /// Write Single Register - `0x06`
    WriteSingleRegister,
    /// Write Multiple Registers - `0x10`
    WriteMultipleRegisters,
}

impl FunctionCode {
    const READ_HOLDING: u8 = 0x03;
    const READ_INPUT: u8 = 0x04;
    const WRITE_SINGLE: u8 = 0x06;
    const WRITE_MULTIPLE: u8 = 0x10;

    /// The bit set on the function code of an exception reply
    pub const EXCEPTION_BIT: u8 = 0x80;
}

/// Function Code Error
#[derive(Debug, PartialEq)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum FunctionCodeError {
    /// The function code is not served by this device
    Unsupported(u8),
}

impl TryFrom<u8> for FunctionCode {
    type Error = FunctionCodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            Self::READ_HOLDING => Ok(FunctionCode::ReadHoldingRegisters),
            Self::READ_INPUT => Ok(FunctionCode::ReadInputRegisters),
            Self::WRITE_SINGLE => Ok(FunctionCode::WriteSingleRegister),
            Self::WRITE_MULTIPLE => Ok(FunctionCode::WriteMultipleRegisters),
            other => Err(FunctionCodeError::Unsupported(other)),
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(val: FunctionCode) -> Self {
        match val {
            FunctionCode::ReadHoldingRegisters => FunctionCode::READ_HOLDING,
            FunctionCode::ReadInputRegisters => FunctionCode::READ_INPUT,
            FunctionCode::WriteSingleRegister => FunctionCode::WRITE_SINGLE,
            FunctionCode::WriteMultipleRegisters => FunctionCode::WRITE_MULTIPLE,
        }
    }
}

/// Modbus exception codes
///
/// Sent as the single payload byte of an exception reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum ExceptionCode {
    /// `1` - the function code is not supported
    IllegalFunction,
    /// `2` - the register address is not allowed
    IllegalDataAddress,
    /// `3` - a value in the request is not allowed
    IllegalDataValue,
    /// `4` - an unrecoverable error occurred while serving the request
    SlaveDeviceFailure,
    /// `5` - the request was accepted, but will take a long time
    Acknowledge,
    /// `6` - the device is busy with a long running command
    SlaveDeviceBusy,
    /// `7` - the request cannot be performed
    NegativeAcknowledge,
    /// `8` - a parity error was detected in memory
    MemoryParityError,
}

/// Exception Code Error
#[derive(Debug, PartialEq)]
#[non_exhaustive]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum ExceptionCodeError {
    /// The byte is not a known exception code
    Unknown(u8),
}

impl TryFrom<u8> for ExceptionCode {
    type Error = ExceptionCodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ExceptionCode::IllegalFunction),
            2 => Ok(ExceptionCode::IllegalDataAddress),
            3 => Ok(ExceptionCode::IllegalDataValue),
            4 => Ok(ExceptionCode::SlaveDeviceFailure),
            5 => Ok(ExceptionCode::Acknowledge),
            6 => Ok(ExceptionCode::SlaveDeviceBusy),
            7 => Ok(ExceptionCode::NegativeAcknowledge),
            8 => Ok(ExceptionCode::MemoryParityError),
            other => Err(ExceptionCodeError::Unknown(other)),
        }
    }
}

impl From<ExceptionCode> for u8 {
    fn from(val: ExceptionCode) -> Self {
        match val {
            ExceptionCode::IllegalFunction => 1,
            ExceptionCode::IllegalDataAddress => 2,
            ExceptionCode::IllegalDataValue => 3,
            ExceptionCode::SlaveDeviceFailure => 4,
            ExceptionCode::Acknowledge => 5,
            ExceptionCode::SlaveDeviceBusy => 6,
            ExceptionCode::NegativeAcknowledge => 7,
            ExceptionCode::MemoryParityError => 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_codes_round_trip_through_bytes() {
        for byte in [0x03u8, 0x04, 0x06, 0x10] {
            let fc = FunctionCode::try_from(byte).unwrap();
            assert_eq!(u8::from(fc), byte);
        }
        assert_eq!(
            FunctionCode::try_from(0x05),
            Err(FunctionCodeError::Unsupported(0x05))
        );
    }

    #[test]
    fn exception_codes_match_the_wire_values() {
        assert_eq!(u8::from(ExceptionCode::IllegalFunction), 1);
        assert_eq!(u8::from(ExceptionCode::IllegalDataValue), 3);
        assert_eq!(u8::from(ExceptionCode::MemoryParityError), 8);
        for byte in 1..=8u8 {
            assert_eq!(u8::from(ExceptionCode::try_from(byte).unwrap()), byte);
        }
        assert_eq!(
            ExceptionCode::try_from(0),
            Err(ExceptionCodeError::Unknown(0))
        );
        assert_eq!(
            ExceptionCode::try_from(9),
            Err(ExceptionCodeError::Unknown(9))
        );
    }
}
