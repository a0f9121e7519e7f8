// ABOUTME: Modbus TCP client layered on a bytes adapter: MBAP framing, typed operations, exceptions
// ABOUTME: Exposes 1-based data-model addresses and verifies echoes, counts and transaction ids

mod codec;
mod registers;

pub use codec::{
    ExceptionCode, MAX_FIFO_COUNT, MAX_PDU_SIZE, MAX_READ_BITS, MAX_READ_REGISTERS,
    MAX_RW_READ_REGISTERS, MAX_RW_WRITE_REGISTERS, MAX_WRITE_BITS, MAX_WRITE_REGISTERS,
    MbapHeader, describe_exception,
};
pub use registers::{ByteOrder, RegisterLayout, WordOrder};

use crate::adapter::{Adapter, ReadOptions};
use crate::stop::StopCondition;
use bytes::Bytes;
use codec::Request;
use num_enum::TryFromPrimitive;
use std::time::Duration;
use thiserror::Error;

/// Well-known Modbus TCP port, injected when the descriptor has none.
pub const MODBUS_TCP_DEFAULT_PORT: u16 = 502;

/// Default bound on the gap between response fragments.
const DEFAULT_FRAME_GAP: Duration = Duration::from_secs(1);

/// Supported Modbus function codes.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
    MaskWriteRegister = 0x16,
    ReadWriteMultipleRegisters = 0x17,
    ReadFifoQueue = 0x18,
    EncapsulatedInterfaceTransport = 0x2B,
}

/// Errors produced by the Modbus layer.
#[derive(Debug, Error)]
pub enum ModbusError {
    /// The server answered with an exception PDU.
    #[error("modbus exception from {function:?} (code {code:#04x}): {description}")]
    Exception {
        function: Function,
        code: u8,
        description: String,
    },

    /// The response violated the protocol (bad transaction id, wrong
    /// function code, inconsistent lengths).
    #[error("malformed modbus response: {0}")]
    Response(String),

    /// Transport or adapter failure, including configuration errors raised
    /// by precondition checks before any bytes leave the process.
    #[error(transparent)]
    Adapter(#[from] crate::Error),
}

/// Modbus TCP client.
///
/// Layered over a raw bytes [`Adapter`]; each request installs a per-read
/// stop-condition override matching the exact expected response length, plus
/// a continuation bound on inter-fragment gaps, and reverts it when the
/// response (or an exception) arrives. Addresses follow the Modbus data
/// model: 1-based externally, translated to 0-based PDU addresses on the
/// wire. Address 0 is rejected.
///
/// ```no_run
/// use instrio::{Adapter, Descriptor};
/// use instrio::protocol::modbus::Modbus;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let adapter = Adapter::new(Descriptor::tcp_host("10.0.0.61"));
///     let mut plc = Modbus::new(adapter).await?;
///
///     plc.write_single_coil(9, true).await?;
///     let inputs = plc.read_discrete_inputs(1, 8).await?;
///     println!("{inputs:?}");
///     Ok(())
/// }
/// ```
pub struct Modbus {
    adapter: Adapter,
    unit_id: u8,
    transaction_id: u16,
    frame_gap: Duration,
}

impl Modbus {
    /// Layers Modbus over `adapter`, injecting port 502 if the descriptor
    /// has no port yet.
    pub async fn new(adapter: Adapter) -> Result<Modbus, ModbusError> {
        adapter.set_default_port(MODBUS_TCP_DEFAULT_PORT).await?;
        Ok(Self::assemble(adapter))
    }

    /// Blocking variant of [`Modbus::new`].
    pub fn new_blocking(adapter: Adapter) -> Result<Modbus, ModbusError> {
        adapter.blocking_set_default_port(MODBUS_TCP_DEFAULT_PORT)?;
        Ok(Self::assemble(adapter))
    }

    fn assemble(adapter: Adapter) -> Modbus {
        Modbus {
            adapter,
            unit_id: 0xFF,
            transaction_id: 0,
            frame_gap: DEFAULT_FRAME_GAP,
        }
    }

    /// Unit identifier placed in the MBAP header; 0xFF by default, which is
    /// the convention for directly addressed Modbus TCP servers.
    pub fn with_unit_id(mut self, unit_id: u8) -> Modbus {
        self.unit_id = unit_id;
        self
    }

    /// Bound on the quiet time between response fragments (default 1 s).
    pub fn with_frame_gap(mut self, gap: Duration) -> Modbus {
        self.frame_gap = gap;
        self
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn next_transaction(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    /// Per-request framing override: the exact (or bounded) response length
    /// plus an inter-fragment gap limit.
    fn read_options(&self, request: &Request) -> ReadOptions {
        ReadOptions::new().stop_conditions(vec![
            StopCondition::length(request.max_adu_len()),
            StopCondition::continuation(self.frame_gap),
        ])
    }

    async fn transact(&mut self, request: Request) -> Result<Bytes, ModbusError> {
        let transaction = self.next_transaction();
        let adu = codec::encode_adu(transaction, self.unit_id, &request);
        let options = self.read_options(&request);
        let frame = self.adapter.query_detailed(adu, options).await?;
        codec::decode_adu(transaction, self.unit_id, request.function, &frame.payload())
    }

    fn blocking_transact(&mut self, request: Request) -> Result<Bytes, ModbusError> {
        let transaction = self.next_transaction();
        let adu = codec::encode_adu(transaction, self.unit_id, &request);
        let options = self.read_options(&request);
        let frame = self.adapter.blocking_query_detailed(adu, options)?;
        codec::decode_adu(transaction, self.unit_id, request.function, &frame.payload())
    }

    // ---- bit access (0x01, 0x02, 0x05, 0x0F) -----------------------------

    /// Read Coils (0x01).
    pub async fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>, ModbusError> {
        let request = codec::read_bits(Function::ReadCoils, address, count)?;
        let payload = self.transact(request).await?;
        codec::decode_bits(&payload, count)
    }

    pub fn blocking_read_coils(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        let request = codec::read_bits(Function::ReadCoils, address, count)?;
        let payload = self.blocking_transact(request)?;
        codec::decode_bits(&payload, count)
    }

    /// Single-coil convenience wrapper over [`read_coils`](Modbus::read_coils).
    pub async fn read_coil(&mut self, address: u16) -> Result<bool, ModbusError> {
        Ok(self.read_coils(address, 1).await?[0])
    }

    pub fn blocking_read_coil(&mut self, address: u16) -> Result<bool, ModbusError> {
        Ok(self.blocking_read_coils(address, 1)?[0])
    }

    /// Read Discrete Inputs (0x02).
    pub async fn read_discrete_inputs(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        let request = codec::read_bits(Function::ReadDiscreteInputs, address, count)?;
        let payload = self.transact(request).await?;
        codec::decode_bits(&payload, count)
    }

    pub fn blocking_read_discrete_inputs(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        let request = codec::read_bits(Function::ReadDiscreteInputs, address, count)?;
        let payload = self.blocking_transact(request)?;
        codec::decode_bits(&payload, count)
    }

    pub async fn read_discrete_input(&mut self, address: u16) -> Result<bool, ModbusError> {
        Ok(self.read_discrete_inputs(address, 1).await?[0])
    }

    pub fn blocking_read_discrete_input(&mut self, address: u16) -> Result<bool, ModbusError> {
        Ok(self.blocking_read_discrete_inputs(address, 1)?[0])
    }

    /// Write Single Coil (0x05). The server must echo the request.
    pub async fn write_single_coil(
        &mut self,
        address: u16,
        enabled: bool,
    ) -> Result<(), ModbusError> {
        let value = if enabled { 0xFF00 } else { 0x0000 };
        let request = codec::write_single(Function::WriteSingleCoil, address, value)?;
        let payload = self.transact(request.clone()).await?;
        codec::verify_echo(&request, &payload)
    }

    pub fn blocking_write_single_coil(
        &mut self,
        address: u16,
        enabled: bool,
    ) -> Result<(), ModbusError> {
        let value = if enabled { 0xFF00 } else { 0x0000 };
        let request = codec::write_single(Function::WriteSingleCoil, address, value)?;
        let payload = self.blocking_transact(request.clone())?;
        codec::verify_echo(&request, &payload)
    }

    /// Write Multiple Coils (0x0F). The acknowledged count must match.
    pub async fn write_multiple_coils(
        &mut self,
        address: u16,
        values: &[bool],
    ) -> Result<(), ModbusError> {
        let request = codec::write_multiple_coils(address, values)?;
        let payload = self.transact(request).await?;
        codec::verify_write_count(&payload, address - 1, values.len() as u16)
    }

    pub fn blocking_write_multiple_coils(
        &mut self,
        address: u16,
        values: &[bool],
    ) -> Result<(), ModbusError> {
        let request = codec::write_multiple_coils(address, values)?;
        let payload = self.blocking_transact(request)?;
        codec::verify_write_count(&payload, address - 1, values.len() as u16)
    }

    // ---- register access (0x03, 0x04, 0x06, 0x10, 0x16, 0x17) ------------

    /// Read Holding Registers (0x03).
    pub async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let request = codec::read_registers(Function::ReadHoldingRegisters, address, count)?;
        let payload = self.transact(request).await?;
        codec::decode_registers(&payload, count)
    }

    pub fn blocking_read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let request = codec::read_registers(Function::ReadHoldingRegisters, address, count)?;
        let payload = self.blocking_transact(request)?;
        codec::decode_registers(&payload, count)
    }

    pub async fn read_holding_register(&mut self, address: u16) -> Result<u16, ModbusError> {
        Ok(self.read_holding_registers(address, 1).await?[0])
    }

    pub fn blocking_read_holding_register(&mut self, address: u16) -> Result<u16, ModbusError> {
        Ok(self.blocking_read_holding_registers(address, 1)?[0])
    }

    /// Read Input Registers (0x04).
    pub async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let request = codec::read_registers(Function::ReadInputRegisters, address, count)?;
        let payload = self.transact(request).await?;
        codec::decode_registers(&payload, count)
    }

    pub fn blocking_read_input_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let request = codec::read_registers(Function::ReadInputRegisters, address, count)?;
        let payload = self.blocking_transact(request)?;
        codec::decode_registers(&payload, count)
    }

    pub async fn read_input_register(&mut self, address: u16) -> Result<u16, ModbusError> {
        Ok(self.read_input_registers(address, 1).await?[0])
    }

    pub fn blocking_read_input_register(&mut self, address: u16) -> Result<u16, ModbusError> {
        Ok(self.blocking_read_input_registers(address, 1)?[0])
    }

    /// Write Single Register (0x06). The server must echo the request.
    pub async fn write_single_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> Result<(), ModbusError> {
        let request = codec::write_single(Function::WriteSingleRegister, address, value)?;
        let payload = self.transact(request.clone()).await?;
        codec::verify_echo(&request, &payload)
    }

    pub fn blocking_write_single_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> Result<(), ModbusError> {
        let request = codec::write_single(Function::WriteSingleRegister, address, value)?;
        let payload = self.blocking_transact(request.clone())?;
        codec::verify_echo(&request, &payload)
    }

    /// Write Multiple Registers (0x10). The acknowledged count must match.
    pub async fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        let request = codec::write_multiple_registers(address, values)?;
        let payload = self.transact(request).await?;
        codec::verify_write_count(&payload, address - 1, values.len() as u16)
    }

    pub fn blocking_write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        let request = codec::write_multiple_registers(address, values)?;
        let payload = self.blocking_transact(request)?;
        codec::verify_write_count(&payload, address - 1, values.len() as u16)
    }

    /// Mask Write Register (0x16): `new = (old & and_mask) | (or_mask & !and_mask)`.
    /// The server must echo the request.
    pub async fn mask_write_register(
        &mut self,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> Result<(), ModbusError> {
        let request = codec::mask_write_register(address, and_mask, or_mask)?;
        let payload = self.transact(request.clone()).await?;
        codec::verify_echo(&request, &payload)
    }

    pub fn blocking_mask_write_register(
        &mut self,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> Result<(), ModbusError> {
        let request = codec::mask_write_register(address, and_mask, or_mask)?;
        let payload = self.blocking_transact(request.clone())?;
        codec::verify_echo(&request, &payload)
    }

    /// Read/Write Multiple Registers (0x17): the write is performed before
    /// the read, atomically on the server.
    pub async fn read_write_multiple_registers(
        &mut self,
        read_address: u16,
        read_count: u16,
        write_address: u16,
        values: &[u16],
    ) -> Result<Vec<u16>, ModbusError> {
        let request = codec::read_write_multiple_registers(
            read_address,
            read_count,
            write_address,
            values,
        )?;
        let payload = self.transact(request).await?;
        codec::decode_registers(&payload, read_count)
    }

    pub fn blocking_read_write_multiple_registers(
        &mut self,
        read_address: u16,
        read_count: u16,
        write_address: u16,
        values: &[u16],
    ) -> Result<Vec<u16>, ModbusError> {
        let request = codec::read_write_multiple_registers(
            read_address,
            read_count,
            write_address,
            values,
        )?;
        let payload = self.blocking_transact(request)?;
        codec::decode_registers(&payload, read_count)
    }

    // ---- queues and encapsulated transport (0x18, 0x2B) ------------------

    /// Read FIFO Queue (0x18): returns up to 31 registers.
    pub async fn read_fifo_queue(&mut self, address: u16) -> Result<Vec<u16>, ModbusError> {
        let request = codec::read_fifo_queue(address)?;
        let payload = self.transact(request).await?;
        codec::decode_fifo(&payload)
    }

    pub fn blocking_read_fifo_queue(&mut self, address: u16) -> Result<Vec<u16>, ModbusError> {
        let request = codec::read_fifo_queue(address)?;
        let payload = self.blocking_transact(request)?;
        codec::decode_fifo(&payload)
    }

    /// Encapsulated Interface Transport (0x2B): opaque passthrough with the
    /// standard exception mapping. Returns the response PDU payload after
    /// the function code.
    pub async fn encapsulated_interface_transport(
        &mut self,
        mei_type: u8,
        data: &[u8],
    ) -> Result<Bytes, ModbusError> {
        let request = codec::encapsulated_interface_transport(mei_type, data)?;
        self.transact(request).await
    }

    pub fn blocking_encapsulated_interface_transport(
        &mut self,
        mei_type: u8,
        data: &[u8],
    ) -> Result<Bytes, ModbusError> {
        let request = codec::encapsulated_interface_transport(mei_type, data)?;
        self.blocking_transact(request)
    }
}
