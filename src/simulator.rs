//! In-memory model of the level sensor
//!
//! [`SimulatedSensor`] implements [`ModbusTransport`] and behaves like the
//! real device on a quiet bus: it answers only on its own unit id, refuses
//! identity writes while the interlock is engaged, and moves to the new
//! address as soon as an identity write is accepted. Every request is logged
//! so callers can check exactly what went over the wire. [`Fault`]s inject
//! transport failures for selected requests. A sensor whose interlock will
//! not engage, or a line that returns short register reads, can be modelled
//! too.

use std::ops::RangeInclusive;

use tracing::debug;

use crate::codec::RegisterCodec;
use crate::constants::{
    RegisterAddress, EXCEPTION_ILLEGAL_DATA_ADDRESS, EXCEPTION_ILLEGAL_DATA_VALUE,
    FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS, MAX_UNIT_ID, SECURITY_LOCKED,
    SECURITY_UNLOCKED,
};
use crate::error::{TransportError, TransportResult};
use crate::protocol::UnitId;
use crate::transport::{ModbusTransport, TransportStats};

/// Direction of a logged request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
}

/// One request as received by the simulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OpKind,
    pub unit: UnitId,
    pub address: u16,
    pub count: u16,
    /// Written values, empty for reads
    pub values: Vec<u16>,
}

impl Operation {
    /// Addressed unit
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// Named register at the request's address, if any
    pub fn register(&self) -> Option<RegisterAddress> {
        RegisterAddress::ALL
            .into_iter()
            .find(|r| r.address() == self.address)
    }

    /// Written value decoded as f32
    pub fn written_f32(&self) -> Option<f32> {
        RegisterCodec::decode_f32(&self.values).ok()
    }
}

/// Injected failure for requests matching a filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// Only this direction, or both
    pub kind: Option<OpKind>,
    /// Only this register, or all
    pub register: Option<RegisterAddress>,
    /// Only units in this range
    pub units: RangeInclusive<u8>,
    /// Returned to the caller
    pub error: TransportError,
    /// Matching requests let through before the fault arms
    pub skip: u32,
    /// Failures left; `None` fails forever
    pub times: Option<u32>,
    /// Apply the request anyway and only lose the response
    pub response_lost: bool,
}

impl Fault {
    /// Fail every matching request.
    pub fn persistent(
        kind: OpKind,
        register: RegisterAddress,
        error: TransportError,
    ) -> Self {
        Self {
            kind: Some(kind),
            register: Some(register),
            units: 0..=MAX_UNIT_ID,
            error,
            skip: 0,
            times: None,
            response_lost: false,
        }
    }

    /// Fail the first `times` matching requests.
    pub fn transient(
        kind: OpKind,
        register: RegisterAddress,
        error: TransportError,
        times: u32,
    ) -> Self {
        Self {
            times: Some(times),
            ..Self::persistent(kind, register, error)
        }
    }

    /// Time out every request of `kind` addressed below `unit`.
    pub fn timeouts_before(kind: OpKind, unit: u8) -> Self {
        Self {
            kind: Some(kind),
            register: None,
            units: 0..=unit.saturating_sub(1),
            error: TransportError::timeout(100),
            skip: 0,
            times: None,
            response_lost: false,
        }
        .only_if(unit > 0)
    }

    /// Restrict to a single unit.
    pub fn at_unit(mut self, unit: u8) -> Self {
        self.units = unit..=unit;
        self
    }

    /// Let `skip` matching requests through first.
    pub fn after(mut self, skip: u32) -> Self {
        self.skip = skip;
        self
    }

    /// Apply the request, then report the error.
    pub fn losing_response(mut self) -> Self {
        self.response_lost = true;
        self
    }

    fn only_if(mut self, armed: bool) -> Self {
        if !armed {
            self.times = Some(0);
        }
        self
    }

    fn matches(&self, op: &Operation) -> bool {
        self.kind.map_or(true, |k| k == op.kind)
            && self.register.map_or(true, |r| op.register() == Some(r))
            && self.units.contains(&op.unit.get())
    }
}

/// Simulated ultrasonic level sensor.
///
/// # Example
///
/// ```rust
/// use sensor_readdress::{ModbusTransport, RegisterAddress, SimulatedSensor, UnitId};
///
/// let unit = UnitId::new(5).unwrap();
/// let mut sensor = SimulatedSensor::new(unit).with_distance(1.25);
/// sensor.connect().unwrap();
///
/// let metres = sensor.read_f32(unit, RegisterAddress::Distance).unwrap();
/// assert_eq!(metres, 1.25);
/// ```
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    address: UnitId,
    identity_value: f32,
    security_value: f32,
    distance_m: f32,
    stale_identity: bool,
    lock_settles_to: Option<f32>,
    truncated_reads: Option<(RegisterAddress, u32)>,
    connected: bool,
    close_count: u32,
    faults: Vec<Fault>,
    log: Vec<Operation>,
    stats: TransportStats,
}

impl SimulatedSensor {
    /// Locked sensor answering on `address`, reading 1.0 m.
    pub fn new(address: UnitId) -> Self {
        Self {
            address,
            identity_value: address.as_f32(),
            security_value: SECURITY_LOCKED,
            distance_m: 1.0,
            stale_identity: false,
            lock_settles_to: None,
            truncated_reads: None,
            connected: false,
            close_count: 0,
            faults: Vec::new(),
            log: Vec::new(),
            stats: TransportStats::default(),
        }
    }

    /// Override what the identity register reports.
    pub fn with_identity_value(mut self, value: f32) -> Self {
        self.identity_value = value;
        self
    }

    /// Override the security register.
    pub fn with_security_value(mut self, value: f32) -> Self {
        self.security_value = value;
        self
    }

    /// Start with the interlock released.
    pub fn unlocked(self) -> Self {
        self.with_security_value(SECURITY_UNLOCKED)
    }

    /// Set the measured distance in metres.
    pub fn with_distance(mut self, metres: f32) -> Self {
        self.distance_m = metres;
        self
    }

    /// Accept identity writes by moving address while the identity register
    /// keeps reporting the old value.
    pub fn with_stale_identity(mut self) -> Self {
        self.stale_identity = true;
        self
    }

    /// Acknowledge lock writes but leave the security register at `value`.
    pub fn with_lock_settling_to(mut self, value: f32) -> Self {
        self.lock_settles_to = Some(value);
        self
    }

    /// Answer the next `times` reads of `register` with a single register.
    pub fn with_truncated_reads(mut self, register: RegisterAddress, times: u32) -> Self {
        self.truncated_reads = Some((register, times));
        self
    }

    /// Add a fault.
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    /// Address the device currently answers on
    pub fn address(&self) -> UnitId {
        self.address
    }

    /// Raw security register value
    pub fn security_value(&self) -> f32 {
        self.security_value
    }

    /// Every request received so far
    pub fn log(&self) -> &[Operation] {
        &self.log
    }

    /// Number of `close` calls seen
    pub fn close_count(&self) -> u32 {
        self.close_count
    }

    fn check_faults(&mut self, op: &Operation) -> Option<(TransportError, bool)> {
        for fault in self.faults.iter_mut().filter(|f| f.matches(op)) {
            if fault.times == Some(0) {
                continue;
            }
            if fault.skip > 0 {
                fault.skip -= 1;
                continue;
            }
            if let Some(times) = fault.times.as_mut() {
                *times -= 1;
            }
            return Some((fault.error.clone(), fault.response_lost));
        }
        None
    }

    fn register_value(&self, register: RegisterAddress) -> f32 {
        match register {
            RegisterAddress::Identity => self.identity_value,
            RegisterAddress::Security => self.security_value,
            RegisterAddress::Distance => self.distance_m,
        }
    }

    fn apply_write(&mut self, op: &Operation) -> TransportResult<()> {
        let function = FC_WRITE_MULTIPLE_REGISTERS;
        let register = op
            .register()
            .ok_or_else(|| TransportError::exception(function, EXCEPTION_ILLEGAL_DATA_ADDRESS))?;
        let value = op
            .written_f32()
            .ok_or_else(|| TransportError::exception(function, EXCEPTION_ILLEGAL_DATA_VALUE))?;

        match register {
            RegisterAddress::Security => {
                self.security_value = match self.lock_settles_to {
                    Some(settled) if value == SECURITY_LOCKED => settled,
                    _ => value,
                };
            }
            RegisterAddress::Identity => {
                if self.security_value != SECURITY_UNLOCKED {
                    debug!(unit = %op.unit, "Identity write refused: interlock engaged");
                    return Err(TransportError::exception(
                        function,
                        EXCEPTION_ILLEGAL_DATA_VALUE,
                    ));
                }
                let new_id = UnitId::from_f32(value).map_err(|_| {
                    TransportError::exception(function, EXCEPTION_ILLEGAL_DATA_VALUE)
                })?;
                debug!(from = %self.address, to = %new_id, "Simulated sensor moved");
                self.address = new_id;
                if !self.stale_identity {
                    self.identity_value = new_id.as_f32();
                }
            }
            RegisterAddress::Distance => {
                return Err(TransportError::exception(
                    function,
                    EXCEPTION_ILLEGAL_DATA_ADDRESS,
                ));
            }
        }
        Ok(())
    }

    fn record_error(&mut self, err: TransportError) -> TransportError {
        self.stats.errors += 1;
        if err.is_timeout() {
            self.stats.timeouts += 1;
        }
        if err.is_device_reported() {
            self.stats.exceptions += 1;
        }
        err
    }
}

impl ModbusTransport for SimulatedSensor {
    fn connect(&mut self) -> TransportResult<()> {
        self.connected = true;
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        self.connected = false;
        self.close_count += 1;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read_holding_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let op = Operation {
            kind: OpKind::Read,
            unit,
            address,
            count,
            values: Vec::new(),
        };
        self.log.push(op.clone());
        self.stats.requests_sent += 1;

        if let Some((err, _)) = self.check_faults(&op) {
            return Err(self.record_error(err));
        }
        if unit != self.address {
            return Err(self.record_error(TransportError::NoResponse { unit: unit.get() }));
        }
        let Some(register) = op.register().filter(|r| r.count() == count) else {
            return Err(self.record_error(TransportError::exception(
                FC_READ_HOLDING_REGISTERS,
                EXCEPTION_ILLEGAL_DATA_ADDRESS,
            )));
        };

        self.stats.responses_received += 1;
        let mut regs = RegisterCodec::encode_f32(self.register_value(register)).to_vec();
        if let Some((truncated, left)) = self.truncated_reads.as_mut() {
            if *truncated == register && *left > 0 {
                *left -= 1;
                regs.truncate(1);
            }
        }
        Ok(regs)
    }

    fn write_holding_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        values: &[u16],
    ) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let op = Operation {
            kind: OpKind::Write,
            unit,
            address,
            count: values.len() as u16,
            values: values.to_vec(),
        };
        self.log.push(op.clone());
        self.stats.requests_sent += 1;

        let lost_response = match self.check_faults(&op) {
            Some((err, false)) => return Err(self.record_error(err)),
            Some((err, true)) => Some(err),
            None => None,
        };
        if unit != self.address {
            return Err(self.record_error(TransportError::NoResponse { unit: unit.get() }));
        }
        if let Err(err) = self.apply_write(&op) {
            return Err(self.record_error(err));
        }
        if let Some(err) = lost_response {
            return Err(self.record_error(err));
        }

        self.stats.responses_received += 1;
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats
    }
}
