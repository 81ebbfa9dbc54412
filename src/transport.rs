//! Transport abstraction consumed by the workflow
//!
//! A transport already speaks "read/write holding registers for unit X".
//! Framing, CRC and serial settings are the transport's business; see
//! [`crate::rtu`] for the RS-485 implementation and [`crate::simulator`]
//! for the in-memory sensor model.

use crate::codec::RegisterCodec;
use crate::constants::RegisterAddress;
use crate::error::{StageResult, TransportResult};
use crate::protocol::UnitId;

/// Counters kept by a transport over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Requests put on the wire
    pub requests_sent: u64,
    /// Complete, valid responses received
    pub responses_received: u64,
    /// Failed requests of any kind
    pub errors: u64,
    /// Requests that ended in silence or a partial frame
    pub timeouts: u64,
    /// Device-reported exception responses
    pub exceptions: u64,
    /// Bytes written
    pub bytes_sent: u64,
    /// Bytes read
    pub bytes_received: u64,
}

/// Blocking holding-register transport.
///
/// # Implemented By
///
/// - [`RtuTransport`](crate::rtu::RtuTransport) - Modbus RTU over any byte stream
/// - [`SimulatedSensor`](crate::simulator::SimulatedSensor) - in-memory device model
///
/// Implementations must return [`TransportError::Malformed`](crate::error::TransportError::Malformed)
/// when a read yields a register count different from the one requested, and
/// must report device exceptions separately from timeouts.
pub trait ModbusTransport {
    /// Open (or validate) the link.
    fn connect(&mut self) -> TransportResult<()>;

    /// Release the link. Closing a closed transport is a no-op.
    fn close(&mut self) -> TransportResult<()>;

    /// Check if the transport is ready for requests.
    fn is_connected(&self) -> bool;

    /// Read holding registers (function code 0x03).
    ///
    /// # Arguments
    ///
    /// * `unit` - Addressed unit id
    /// * `address` - Starting register address
    /// * `count` - Number of registers to read
    fn read_holding_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>>;

    /// Write holding registers (function code 0x10).
    ///
    /// # Arguments
    ///
    /// * `unit` - Addressed unit id
    /// * `address` - Starting register address
    /// * `values` - Register values, written in order
    fn write_holding_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        values: &[u16],
    ) -> TransportResult<()>;

    /// Get transport statistics.
    fn get_stats(&self) -> TransportStats {
        TransportStats::default()
    }

    /// Read one named f32 register.
    fn read_f32(&mut self, unit: UnitId, register: RegisterAddress) -> StageResult<f32> {
        let regs = self.read_holding_registers(unit, register.address(), register.count())?;
        Ok(RegisterCodec::decode_f32(&regs)?)
    }

    /// Write one named f32 register.
    fn write_f32(
        &mut self,
        unit: UnitId,
        register: RegisterAddress,
        value: f32,
    ) -> TransportResult<()> {
        self.write_holding_registers(
            unit,
            register.address(),
            &RegisterCodec::encode_f32(value),
        )
    }
}

impl<T: ModbusTransport + ?Sized> ModbusTransport for &mut T {
    fn connect(&mut self) -> TransportResult<()> {
        (**self).connect()
    }

    fn close(&mut self) -> TransportResult<()> {
        (**self).close()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn read_holding_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        (**self).read_holding_registers(unit, address, count)
    }

    fn write_holding_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        values: &[u16],
    ) -> TransportResult<()> {
        (**self).write_holding_registers(unit, address, values)
    }

    fn get_stats(&self) -> TransportStats {
        (**self).get_stats()
    }
}

impl<T: ModbusTransport + ?Sized> ModbusTransport for Box<T> {
    fn connect(&mut self) -> TransportResult<()> {
        (**self).connect()
    }

    fn close(&mut self) -> TransportResult<()> {
        (**self).close()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn read_holding_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        (**self).read_holding_registers(unit, address, count)
    }

    fn write_holding_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        values: &[u16],
    ) -> TransportResult<()> {
        (**self).write_holding_registers(unit, address, values)
    }

    fn get_stats(&self) -> TransportStats {
        (**self).get_stats()
    }
}
