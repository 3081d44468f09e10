//! Function Dispatcher
//!
//! Interprets a validated request and serves it against a [`RegisterStore`].
//! Requests the device cannot serve are answered with an exception, they are
//! never treated as local faults.
//!
//! | Function | Request after `[addr][fn]`              | Reply after `[addr][fn]`      |
//! |----------|-----------------------------------------|-------------------------------|
//! | 3, 4     | `start:2 count:2`                       | `byte_count:1 values:2*count` |
//! | 6        | `address:2 value:2`                     | request echoed                |
//! | 16       | `start:2 count:2 byte_count:1 values`   | `start:2 count:2`             |
//!
//! Register addresses on the wire are zero based, the store is called with
//! logical addresses offset by [`REGISTER_BASE`].

use crate::{
    frame::ValidFrame,
    response::Response,
    ExceptionCode, FunctionCode, RegisterStore, REGISTER_BASE,
};

/// The largest register count a read may ask for
pub const MAX_READ_COUNT: u16 = 125;

/// The largest register count a Write Multiple Registers may carry
pub const MAX_WRITE_COUNT: u16 = 123;

const START: usize = 2;
const COUNT: usize = 4;
const VALUE: usize = 4;
const BYTE_COUNT: usize = 6;
const WRITE_DATA: usize = 7;

/// Serve one request, returning the reply to send
///
/// The reply is always addressed with `address`, our own slave address.
pub fn dispatch<S: RegisterStore + ?Sized>(
    frame: &ValidFrame<'_>,
    address: u8,
    registers: &S,
) -> Response {
    let function = frame.function();
    let served = match FunctionCode::try_from(function) {
        Ok(FunctionCode::ReadHoldingRegisters) | Ok(FunctionCode::ReadInputRegisters) => {
            read_registers(frame, address, registers)
        }
        Ok(FunctionCode::WriteSingleRegister) => write_register(frame, registers),
        Ok(FunctionCode::WriteMultipleRegisters) => write_registers(frame, address, registers),
        Err(_) => {
            mb_debug!("unsupported function {=u8}", function);
            Err(ExceptionCode::IllegalFunction)
        }
    };

    served.unwrap_or_else(|code| {
        mb_info!("exception {=u8} for function {=u8}", u8::from(code), function);
        Response::exception(address, function, code)
    })
}

fn logical(start: u16, offset: u16) -> u32 {
    REGISTER_BASE + u32::from(start) + u32::from(offset)
}

/// Functions 3 and 4
fn read_registers<S: RegisterStore + ?Sized>(
    frame: &ValidFrame<'_>,
    address: u8,
    registers: &S,
) -> Result<Response, ExceptionCode> {
    let start = frame.be_u16(START).ok_or(ExceptionCode::IllegalDataValue)?;
    let count = frame.be_u16(COUNT).ok_or(ExceptionCode::IllegalDataValue)?;
    if !(1..=MAX_READ_COUNT).contains(&count) {
        return Err(ExceptionCode::IllegalDataValue);
    }

    let mut resp = Response::new(address, frame.function());
    // count is at most 125, so the byte count fits
    resp.push((count * 2) as u8)?;
    for i in 0..count {
        resp.push_u16(registers.read(logical(start, i)))?;
    }
    Ok(resp)
}

/// Function 6
fn write_register<S: RegisterStore + ?Sized>(
    frame: &ValidFrame<'_>,
    registers: &S,
) -> Result<Response, ExceptionCode> {
    let addr = frame.be_u16(START).ok_or(ExceptionCode::IllegalDataValue)?;
    let value = frame.be_u16(VALUE).ok_or(ExceptionCode::IllegalDataValue)?;
    registers.write(logical(addr, 0), value);

    let head = frame
        .body()
        .get(..VALUE + 2)
        .ok_or(ExceptionCode::IllegalDataValue)?;
    Ok(Response::echo(head)?)
}

/// Function 16
fn write_registers<S: RegisterStore + ?Sized>(
    frame: &ValidFrame<'_>,
    address: u8,
    registers: &S,
) -> Result<Response, ExceptionCode> {
    let start = frame.be_u16(START).ok_or(ExceptionCode::IllegalDataValue)?;
    let count = frame.be_u16(COUNT).ok_or(ExceptionCode::IllegalDataValue)?;
    let byte_count = frame.byte(BYTE_COUNT).ok_or(ExceptionCode::IllegalDataValue)?;
    if !(1..=MAX_WRITE_COUNT).contains(&count) || u16::from(byte_count) != count * 2 {
        return Err(ExceptionCode::IllegalDataValue);
    }

    // The declared data must actually be there. With fixed eight byte
    // framing it never is.
    let data = frame
        .body()
        .get(WRITE_DATA..WRITE_DATA + usize::from(byte_count))
        .ok_or(ExceptionCode::IllegalDataValue)?;

    for (i, word) in (0..count).zip(data.chunks_exact(2)) {
        registers.write(logical(start, i), u16::from_be_bytes([word[0], word[1]]));
    }

    let mut resp = Response::new(address, frame.function());
    resp.push_u16(start)?;
    resp.push_u16(count)?;
    Ok(resp)
}
