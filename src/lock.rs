//! Security interlock register
//!
//! The sensor refuses identity writes while its interlock is engaged.
//! The register holds `0.0` (locked) or `1.0` (unlocked); anything else
//! points at wiring or firmware trouble and is surfaced as
//! [`SecurityState::Invalid`].

use std::fmt;

use tracing::debug;

use crate::constants::{RegisterAddress, SECURITY_LOCKED, SECURITY_UNLOCKED};
use crate::error::{StageResult, TransportResult};
use crate::protocol::UnitId;
use crate::transport::ModbusTransport;

/// Decoded state of the security register. Never stored, always re-read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SecurityState {
    Locked,
    Unlocked,
    /// Neither 0.0 nor 1.0
    Invalid(f32),
}

impl SecurityState {
    /// Classify a decoded register value.
    pub fn from_value(value: f32) -> Self {
        if value == SECURITY_LOCKED {
            Self::Locked
        } else if value == SECURITY_UNLOCKED {
            Self::Unlocked
        } else {
            Self::Invalid(value)
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked)
    }
}

impl fmt::Display for SecurityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => write!(f, "locked"),
            Self::Unlocked => write!(f, "unlocked"),
            Self::Invalid(v) => write!(f, "invalid ({})", v),
        }
    }
}

/// Reads and sets the interlock of one device.
pub struct LockController;

impl LockController {
    /// Read and classify the security register.
    ///
    /// An `Invalid` state is returned as data; the caller decides whether it
    /// is fatal.
    pub fn read_lock_state<T: ModbusTransport + ?Sized>(
        transport: &mut T,
        unit: UnitId,
    ) -> StageResult<SecurityState> {
        let value = transport.read_f32(unit, RegisterAddress::Security)?;
        let state = SecurityState::from_value(value);
        debug!(unit = unit.get(), %state, "Security register read");
        Ok(state)
    }

    /// Write 1.0 to the security register.
    pub fn unlock<T: ModbusTransport + ?Sized>(
        transport: &mut T,
        unit: UnitId,
    ) -> TransportResult<()> {
        transport.write_f32(unit, RegisterAddress::Security, SECURITY_UNLOCKED)
    }

    /// Write 0.0 to the security register.
    pub fn lock<T: ModbusTransport + ?Sized>(transport: &mut T, unit: UnitId) -> TransportResult<()> {
        transport.write_f32(unit, RegisterAddress::Security, SECURITY_LOCKED)
    }
}
