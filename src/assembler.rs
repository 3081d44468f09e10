//! Frame Assembler
//!
//! The byte level state machine that turns a stream of received bytes into
//! CRC-checked request frames.
//!
//! ```text
//!            our address               frame complete, CRC ok
//!   Idle ---------------> Receiving ----------------------> Processing
//!    ^                      |                                   |
//!    |   CRC mismatch,      |                                   |
//!    +---- overflow --------+                                   |
//!    +----------------------- dispatch returned ----------------+
//! ```
//!
//! The assembler never looks at line silence. It knows a frame is complete
//! purely by counting bytes, see [`Framing`].

use heapless::Vec;

use crate::{
    crc::{crc16_update, CRC_SEED},
    frame::ValidFrame,
    FunctionCode,
};

/// The length of every frame in [`Framing::Fixed`] mode
///
/// Also the smallest frame any supported request fits in.
pub const FIXED_FRAME_LEN: usize = 8;

/// Offset of the declared byte count in a Write Multiple Registers request
const WRITE_MULTIPLE_BYTE_COUNT: usize = 6;

/// Frame bytes of a Write Multiple Registers request besides its data
const WRITE_MULTIPLE_OVERHEAD: usize = 9;

/// The states of the assembler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum State {
    /// Waiting for our own address byte
    Idle,
    /// Buffering the rest of a frame
    Receiving,
    /// A validated frame is being dispatched
    ///
    /// Only observable if dispatch never returned, e.g. it panicked. The
    /// next byte then resets the assembler back to [`State::Idle`].
    Processing,
}

/// How the assembler decides a frame is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Framing {
    /// Every frame is exactly [`FIXED_FRAME_LEN`] bytes long
    ///
    /// Correct for Read Holding/Input Registers and Write Single Register.
    /// Write Multiple Registers requests are longer than eight bytes, so
    /// they are cut short and either fail the CRC check or, if the eight
    /// bytes happen to check out, are refused by the dispatcher with
    /// `ILLEGAL_DATA_VALUE`.
    #[default]
    Fixed,
    /// The frame length is derived from the function code
    ///
    /// Eight bytes for every function except Write Multiple Registers,
    /// which is `9 + byte_count` bytes once the byte count is buffered.
    ByFunction,
}

/// Why a partially received frame was thrown away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Discard {
    /// The trailing CRC did not match
    CrcMismatch,
    /// The frame would not fit the buffer
    Overflow,
    /// A byte arrived while a previous frame was still being processed
    Desync,
}

/// The outcome of feeding one byte to the [`Assembler`]
#[derive(Debug, PartialEq)]
pub enum Poll<R> {
    /// The byte was not buffered (not our address while idle)
    Skipped,
    /// The byte was buffered, the frame is not complete yet
    Buffered,
    /// The partial frame was discarded, the assembler is idle again
    Discarded(Discard),
    /// A complete, valid frame was dispatched
    Dispatched(R),
}

/// The frame assembly state machine
///
/// `CAP` is the capacity of the frame buffer. It must be at least
/// [`FIXED_FRAME_LEN`] to ever complete a frame.
pub struct Assembler<const CAP: usize = FIXED_FRAME_LEN> {
    address: u8,
    framing: Framing,
    state: State,
    crc: u16,
    buf: Vec<u8, CAP>,
}

impl<const CAP: usize> Assembler<CAP> {
    /// Create a new, idle assembler listening for `address`
    pub const fn new(address: u8, framing: Framing) -> Self {
        Self {
            address,
            framing,
            state: State::Idle,
            crc: CRC_SEED,
            buf: Vec::new(),
        }
    }

    /// Feed a single received byte
    ///
    /// When this byte completes a valid frame, `on_frame` is called with it
    /// while the assembler is in [`State::Processing`]. Whatever happens,
    /// the assembler is back in [`State::Idle`] with an empty buffer once a
    /// frame completes or is discarded.
    pub fn poll<F, R>(&mut self, byte: u8, on_frame: F) -> Poll<R>
    where
        F: FnOnce(ValidFrame<'_>) -> R,
    {
        self.crc = crc16_update(self.crc, byte);

        match self.state {
            State::Idle => {
                if byte != self.address {
                    return Poll::Skipped;
                }
                self.buf.clear();
                if self.buf.push(byte).is_err() {
                    // Only possible with a zero capacity buffer
                    return self.discard(Discard::Overflow);
                }
                self.state = State::Receiving;
                mb_trace!("address match {=u8}", byte);
                Poll::Buffered
            }
            State::Receiving => {
                if self.buf.push(byte).is_err() {
                    mb_warn!("frame overflow at {=usize} bytes", CAP);
                    return self.discard(Discard::Overflow);
                }
                match self.expected_len() {
                    Some(len) if len > CAP => {
                        mb_warn!("frame of {=usize} bytes exceeds buffer", len);
                        self.discard(Discard::Overflow)
                    }
                    Some(len) if self.buf.len() >= len => self.complete(on_frame),
                    _ => Poll::Buffered,
                }
            }
            State::Processing => {
                mb_warn!("byte during processing, resetting");
                self.discard(Discard::Desync)
            }
        }
    }

    /// Drop any partial frame and reseed the running CRC
    ///
    /// Idempotent. This is the reset action used by the recovery supervisor.
    pub fn flush(&mut self) {
        self.buf.clear();
        self.state = State::Idle;
        self.crc = CRC_SEED;
    }

    /// The current state
    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    /// The number of bytes currently buffered
    #[inline]
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// The running CRC over every byte fed since the last [`Assembler::flush()`]
    #[inline]
    pub fn running_crc(&self) -> u16 {
        self.crc
    }

    /// The slave address this assembler listens for
    #[inline]
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The framing mode
    #[inline]
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// How long the frame being buffered will be, if that is known yet
    fn expected_len(&self) -> Option<usize> {
        match self.framing {
            Framing::Fixed => Some(FIXED_FRAME_LEN),
            Framing::ByFunction => {
                let function = *self.buf.get(1)?;
                if FunctionCode::try_from(function) == Ok(FunctionCode::WriteMultipleRegisters) {
                    let count = *self.buf.get(WRITE_MULTIPLE_BYTE_COUNT)?;
                    Some(WRITE_MULTIPLE_OVERHEAD + count as usize)
                } else {
                    Some(FIXED_FRAME_LEN)
                }
            }
        }
    }

    fn complete<F, R>(&mut self, on_frame: F) -> Poll<R>
    where
        F: FnOnce(ValidFrame<'_>) -> R,
    {
        let Some(frame) = ValidFrame::check(&self.buf) else {
            mb_debug!("crc mismatch, dropping {=usize} bytes", self.buf.len());
            return self.discard(Discard::CrcMismatch);
        };
        self.state = State::Processing;
        let out = on_frame(frame);
        self.buf.clear();
        self.state = State::Idle;
        Poll::Dispatched(out)
    }

    fn discard<R>(&mut self, why: Discard) -> Poll<R> {
        self.buf.clear();
        self.state = State::Idle;
        Poll::Discarded(why)
    }
}
