// Modbus TCP codec - MBAP framing and request/response PDU encoding
//
// Wire format per the Modbus Application Protocol spec: a 7-byte MBAP header
// (transaction id, protocol id = 0, length, unit id) followed by the PDU
// (function code + data). All integers are big-endian on the wire.

use super::{Function, ModbusError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use std::io::Cursor;

/// Maximum PDU size (function code + data).
pub const MAX_PDU_SIZE: usize = 253;

/// Coil/discrete-input quantity limits for the read functions.
pub const MAX_READ_BITS: u16 = 1968;
/// Register quantity limit for the read functions.
pub const MAX_READ_REGISTERS: u16 = 125;
/// Coil quantity limit for write multiple coils.
pub const MAX_WRITE_BITS: u16 = 1968;
/// Register quantity limit for write multiple registers.
pub const MAX_WRITE_REGISTERS: u16 = 123;
/// Register quantity limits for read/write multiple registers.
pub const MAX_RW_READ_REGISTERS: u16 = 125;
pub const MAX_RW_WRITE_REGISTERS: u16 = 121;
/// A FIFO queue response carries at most this many registers.
pub const MAX_FIFO_COUNT: usize = 31;

/// Modbus exception codes (response function code with bit 0x80 set,
/// followed by one of these in the next byte).
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailedToRespond = 0x0B,
}

/// Human description of an exception code in the context of the request
/// function. Unknown codes still produce a usable message.
pub fn describe_exception(function: Function, code: u8) -> String {
    let subject = match function {
        Function::ReadCoils | Function::WriteSingleCoil | Function::WriteMultipleCoils => "coil",
        Function::ReadDiscreteInputs => "discrete input",
        Function::ReadHoldingRegisters
        | Function::WriteSingleRegister
        | Function::WriteMultipleRegisters
        | Function::MaskWriteRegister
        | Function::ReadWriteMultipleRegisters => "register",
        Function::ReadInputRegisters => "input register",
        Function::ReadFifoQueue => "FIFO queue",
        Function::EncapsulatedInterfaceTransport => "encapsulated transport",
    };
    match ExceptionCode::try_from(code) {
        Ok(ExceptionCode::IllegalFunction) => {
            format!("function {function:?} is not supported by the server")
        }
        Ok(ExceptionCode::IllegalDataAddress) => {
            format!("{subject} address range is not valid on the server")
        }
        Ok(ExceptionCode::IllegalDataValue) => {
            format!("a value in the {function:?} request is not allowed by the server")
        }
        Ok(ExceptionCode::ServerDeviceFailure) => {
            "unrecoverable error while the server processed the request".into()
        }
        Ok(ExceptionCode::Acknowledge) => {
            "request accepted, long-running processing in progress".into()
        }
        Ok(ExceptionCode::ServerDeviceBusy) => {
            "server busy, retransmit the request later".into()
        }
        Ok(ExceptionCode::MemoryParityError) => {
            "parity error in the server's record storage".into()
        }
        Ok(ExceptionCode::GatewayPathUnavailable) => {
            "gateway could not allocate a path to the target".into()
        }
        Ok(ExceptionCode::GatewayTargetFailedToRespond) => {
            "gateway target did not respond".into()
        }
        Err(_) => format!("unknown exception code {code:#04x}"),
    }
}

/// MBAP header (Modbus TCP), 7 bytes, preceding every PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Number of following bytes: unit id + PDU.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub const SIZE: usize = 7;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
        buf.put_u8(self.unit_id);
    }

    pub fn decode(buf: &mut Cursor<&[u8]>) -> Result<MbapHeader, ModbusError> {
        if buf.remaining() < Self::SIZE {
            return Err(ModbusError::Response(format!(
                "truncated MBAP header ({} bytes)",
                buf.remaining()
            )));
        }
        let header = MbapHeader {
            transaction_id: buf.get_u16(),
            protocol_id: buf.get_u16(),
            length: buf.get_u16(),
            unit_id: buf.get_u8(),
        };
        if header.protocol_id != 0 {
            return Err(ModbusError::Response(format!(
                "unexpected protocol id {:#06x}",
                header.protocol_id
            )));
        }
        Ok(header)
    }
}

/// One encoded request plus what the matching response must look like.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub function: Function,
    /// PDU bytes (function code included).
    pub pdu: Bytes,
    /// Exact expected response length (MBAP + PDU), when known up front.
    pub expected_adu_len: Option<usize>,
}

impl Request {
    /// Upper bound on the response length, used for framing when the exact
    /// length is not known before the reply arrives.
    pub fn max_adu_len(&self) -> usize {
        match self.expected_adu_len {
            Some(len) => len,
            None => match self.function {
                // byte count (1) + fifo count (2) + up to 31 registers
                Function::ReadFifoQueue => MbapHeader::SIZE + 1 + 2 + 2 + 2 * MAX_FIFO_COUNT,
                _ => MbapHeader::SIZE + MAX_PDU_SIZE,
            },
        }
    }
}

fn configuration(message: impl Into<String>) -> ModbusError {
    ModbusError::Adapter(crate::Error::Configuration(message.into()))
}

/// Translates a 1-based data-model address into the 0-based PDU address and
/// checks that `count` items starting there stay inside the address space.
fn pdu_address(address: u16, count: u16) -> Result<u16, ModbusError> {
    if address == 0 {
        return Err(configuration(
            "modbus data-model addresses are 1-based; address 0 does not exist",
        ));
    }
    let end = u32::from(address) + u32::from(count) - 1;
    if end > 65535 {
        return Err(configuration(format!(
            "address range {address}..={end} exceeds the modbus address space"
        )));
    }
    Ok(address - 1)
}

fn check_count(count: u16, max: u16, what: &str) -> Result<(), ModbusError> {
    if count == 0 || count > max {
        return Err(configuration(format!(
            "{what} count {count} outside 1..={max}"
        )));
    }
    Ok(())
}

/// LSB-first bit packing used by the coil functions.
pub(crate) fn pack_bits(values: &[bool]) -> Bytes {
    let mut buf = BytesMut::with_capacity(values.len().div_ceil(8));
    for chunk in values.chunks(8) {
        let mut byte = 0u8;
        for (i, &bit) in chunk.iter().enumerate() {
            if bit {
                byte |= 1 << i;
            }
        }
        buf.put_u8(byte);
    }
    buf.freeze()
}

pub(crate) fn unpack_bits(data: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

// ---- request constructors ------------------------------------------------

pub(crate) fn read_bits(
    function: Function,
    address: u16,
    count: u16,
) -> Result<Request, ModbusError> {
    check_count(count, MAX_READ_BITS, "bit")?;
    let start = pdu_address(address, count)?;
    let mut pdu = BytesMut::with_capacity(5);
    pdu.put_u8(function as u8);
    pdu.put_u16(start);
    pdu.put_u16(count);
    Ok(Request {
        function,
        pdu: pdu.freeze(),
        expected_adu_len: Some(MbapHeader::SIZE + 2 + (count as usize).div_ceil(8)),
    })
}

pub(crate) fn read_registers(
    function: Function,
    address: u16,
    count: u16,
) -> Result<Request, ModbusError> {
    check_count(count, MAX_READ_REGISTERS, "register")?;
    let start = pdu_address(address, count)?;
    let mut pdu = BytesMut::with_capacity(5);
    pdu.put_u8(function as u8);
    pdu.put_u16(start);
    pdu.put_u16(count);
    Ok(Request {
        function,
        pdu: pdu.freeze(),
        expected_adu_len: Some(MbapHeader::SIZE + 2 + 2 * count as usize),
    })
}

/// Write single coil (0x05) or register (0x06); the response echoes the
/// request byte-for-byte.
pub(crate) fn write_single(
    function: Function,
    address: u16,
    value: u16,
) -> Result<Request, ModbusError> {
    let start = pdu_address(address, 1)?;
    let mut pdu = BytesMut::with_capacity(5);
    pdu.put_u8(function as u8);
    pdu.put_u16(start);
    pdu.put_u16(value);
    Ok(Request {
        function,
        pdu: pdu.freeze(),
        expected_adu_len: Some(MbapHeader::SIZE + 5),
    })
}

pub(crate) fn write_multiple_coils(address: u16, values: &[bool]) -> Result<Request, ModbusError> {
    let count = u16::try_from(values.len())
        .map_err(|_| configuration("too many coils in one request"))?;
    check_count(count, MAX_WRITE_BITS, "coil")?;
    let start = pdu_address(address, count)?;
    let packed = pack_bits(values);
    let mut pdu = BytesMut::with_capacity(6 + packed.len());
    pdu.put_u8(Function::WriteMultipleCoils as u8);
    pdu.put_u16(start);
    pdu.put_u16(count);
    pdu.put_u8(packed.len() as u8);
    pdu.put_slice(&packed);
    Ok(Request {
        function: Function::WriteMultipleCoils,
        pdu: pdu.freeze(),
        expected_adu_len: Some(MbapHeader::SIZE + 5),
    })
}

pub(crate) fn write_multiple_registers(
    address: u16,
    values: &[u16],
) -> Result<Request, ModbusError> {
    let count = u16::try_from(values.len())
        .map_err(|_| configuration("too many registers in one request"))?;
    check_count(count, MAX_WRITE_REGISTERS, "register")?;
    let start = pdu_address(address, count)?;
    let mut pdu = BytesMut::with_capacity(6 + 2 * values.len());
    pdu.put_u8(Function::WriteMultipleRegisters as u8);
    pdu.put_u16(start);
    pdu.put_u16(count);
    pdu.put_u8((2 * values.len()) as u8);
    for &value in values {
        pdu.put_u16(value);
    }
    Ok(Request {
        function: Function::WriteMultipleRegisters,
        pdu: pdu.freeze(),
        expected_adu_len: Some(MbapHeader::SIZE + 5),
    })
}

pub(crate) fn mask_write_register(
    address: u16,
    and_mask: u16,
    or_mask: u16,
) -> Result<Request, ModbusError> {
    let start = pdu_address(address, 1)?;
    let mut pdu = BytesMut::with_capacity(7);
    pdu.put_u8(Function::MaskWriteRegister as u8);
    pdu.put_u16(start);
    pdu.put_u16(and_mask);
    pdu.put_u16(or_mask);
    Ok(Request {
        function: Function::MaskWriteRegister,
        pdu: pdu.freeze(),
        expected_adu_len: Some(MbapHeader::SIZE + 7),
    })
}

pub(crate) fn read_write_multiple_registers(
    read_address: u16,
    read_count: u16,
    write_address: u16,
    values: &[u16],
) -> Result<Request, ModbusError> {
    check_count(read_count, MAX_RW_READ_REGISTERS, "read register")?;
    let write_count = u16::try_from(values.len())
        .map_err(|_| configuration("too many registers in one request"))?;
    check_count(write_count, MAX_RW_WRITE_REGISTERS, "write register")?;
    let read_start = pdu_address(read_address, read_count)?;
    let write_start = pdu_address(write_address, write_count)?;
    let mut pdu = BytesMut::with_capacity(10 + 2 * values.len());
    pdu.put_u8(Function::ReadWriteMultipleRegisters as u8);
    pdu.put_u16(read_start);
    pdu.put_u16(read_count);
    pdu.put_u16(write_start);
    pdu.put_u16(write_count);
    pdu.put_u8((2 * values.len()) as u8);
    for &value in values {
        pdu.put_u16(value);
    }
    Ok(Request {
        function: Function::ReadWriteMultipleRegisters,
        pdu: pdu.freeze(),
        expected_adu_len: Some(MbapHeader::SIZE + 2 + 2 * read_count as usize),
    })
}

pub(crate) fn read_fifo_queue(address: u16) -> Result<Request, ModbusError> {
    let start = pdu_address(address, 1)?;
    let mut pdu = BytesMut::with_capacity(3);
    pdu.put_u8(Function::ReadFifoQueue as u8);
    pdu.put_u16(start);
    Ok(Request {
        function: Function::ReadFifoQueue,
        pdu: pdu.freeze(),
        expected_adu_len: None,
    })
}

pub(crate) fn encapsulated_interface_transport(
    mei_type: u8,
    data: &[u8],
) -> Result<Request, ModbusError> {
    if 2 + data.len() > MAX_PDU_SIZE {
        return Err(configuration(format!(
            "encapsulated payload of {} bytes exceeds the PDU size limit",
            data.len()
        )));
    }
    let mut pdu = BytesMut::with_capacity(2 + data.len());
    pdu.put_u8(Function::EncapsulatedInterfaceTransport as u8);
    pdu.put_u8(mei_type);
    pdu.put_slice(data);
    Ok(Request {
        function: Function::EncapsulatedInterfaceTransport,
        pdu: pdu.freeze(),
        expected_adu_len: None,
    })
}

// ---- framing and response decoding ---------------------------------------

/// Builds the full ADU (MBAP header + PDU) for a request.
pub(crate) fn encode_adu(transaction_id: u16, unit_id: u8, request: &Request) -> Bytes {
    let header = MbapHeader {
        transaction_id,
        protocol_id: 0,
        length: (request.pdu.len() + 1) as u16,
        unit_id,
    };
    let mut buf = BytesMut::with_capacity(MbapHeader::SIZE + request.pdu.len());
    header.encode(&mut buf);
    buf.put_slice(&request.pdu);
    buf.freeze()
}

/// Validates the MBAP header and the function byte of a response ADU and
/// returns the PDU payload after the function code. Exception responses are
/// mapped to [`ModbusError::Exception`].
pub(crate) fn decode_adu(
    transaction_id: u16,
    unit_id: u8,
    function: Function,
    adu: &[u8],
) -> Result<Bytes, ModbusError> {
    let mut cursor = Cursor::new(adu);
    let header = MbapHeader::decode(&mut cursor)?;
    if header.transaction_id != transaction_id {
        return Err(ModbusError::Response(format!(
            "transaction id mismatch: sent {transaction_id}, received {}",
            header.transaction_id
        )));
    }
    if header.unit_id != unit_id {
        return Err(ModbusError::Response(format!(
            "unit id mismatch: sent {unit_id}, received {}",
            header.unit_id
        )));
    }
    if header.length as usize != adu.len() - (MbapHeader::SIZE - 1) {
        return Err(ModbusError::Response(format!(
            "MBAP length {} does not match the {} received bytes",
            header.length,
            adu.len()
        )));
    }
    if !cursor.has_remaining() {
        return Err(ModbusError::Response("response has no PDU".into()));
    }
    let code = cursor.get_u8();
    if code == (function as u8 | 0x80) {
        if !cursor.has_remaining() {
            return Err(ModbusError::Response(
                "exception response without an exception code".into(),
            ));
        }
        let exception = cursor.get_u8();
        return Err(ModbusError::Exception {
            function,
            code: exception,
            description: describe_exception(function, exception),
        });
    }
    if code != function as u8 {
        return Err(ModbusError::Response(format!(
            "function code mismatch: sent {:#04x}, received {code:#04x}",
            function as u8
        )));
    }
    Ok(Bytes::copy_from_slice(&adu[cursor.position() as usize..]))
}

/// Decodes a read-bits payload: byte count then LSB-first packed bits.
pub(crate) fn decode_bits(payload: &[u8], count: u16) -> Result<Vec<bool>, ModbusError> {
    let expected = (count as usize).div_ceil(8);
    if payload.len() != 1 + expected || payload[0] as usize != expected {
        return Err(ModbusError::Response(format!(
            "bit response carries {} bytes, expected {expected}",
            payload.len().saturating_sub(1)
        )));
    }
    Ok(unpack_bits(&payload[1..], count as usize))
}

/// Decodes a read-registers payload: byte count then big-endian registers.
pub(crate) fn decode_registers(payload: &[u8], count: u16) -> Result<Vec<u16>, ModbusError> {
    let expected = 2 * count as usize;
    if payload.len() != 1 + expected || payload[0] as usize != expected {
        return Err(ModbusError::Response(format!(
            "register response carries {} bytes, expected {expected}",
            payload.len().saturating_sub(1)
        )));
    }
    Ok(payload[1..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Verifies that a write-single response echoes the request exactly.
pub(crate) fn verify_echo(request: &Request, payload: &[u8]) -> Result<(), ModbusError> {
    // payload excludes the function byte; compare against the request PDU body
    if payload != &request.pdu[1..] {
        return Err(ModbusError::Response(
            "response does not echo the write request".into(),
        ));
    }
    Ok(())
}

/// Verifies the address/quantity echo of a write-multiple response.
pub(crate) fn verify_write_count(
    payload: &[u8],
    expected_start: u16,
    expected_count: u16,
) -> Result<(), ModbusError> {
    if payload.len() != 4 {
        return Err(ModbusError::Response(format!(
            "write acknowledgement has {} bytes, expected 4",
            payload.len()
        )));
    }
    let start = u16::from_be_bytes([payload[0], payload[1]]);
    let count = u16::from_be_bytes([payload[2], payload[3]]);
    if start != expected_start {
        return Err(ModbusError::Response(format!(
            "write acknowledged at address {start}, expected {expected_start}"
        )));
    }
    if count != expected_count {
        return Err(ModbusError::Response(format!(
            "server wrote {count} items, expected {expected_count}"
        )));
    }
    Ok(())
}

/// Decodes a read-FIFO-queue payload into its register values.
pub(crate) fn decode_fifo(payload: &[u8]) -> Result<Vec<u16>, ModbusError> {
    if payload.len() < 4 {
        return Err(ModbusError::Response("truncated FIFO response".into()));
    }
    let byte_count = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let fifo_count = u16::from_be_bytes([payload[2], payload[3]]) as usize;
    if fifo_count > MAX_FIFO_COUNT {
        return Err(ModbusError::Response(format!(
            "FIFO count {fifo_count} exceeds the protocol limit of {MAX_FIFO_COUNT}"
        )));
    }
    if byte_count != 2 + 2 * fifo_count || payload.len() != 4 + 2 * fifo_count {
        return Err(ModbusError::Response("inconsistent FIFO byte count".into()));
    }
    Ok(payload[4..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}
