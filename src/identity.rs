//! Unit-id discovery
//!
//! When the operator does not know which address the sensor answers on, the
//! probe walks every id in ascending order and asks each one for its identity
//! register. A device that reports its own address back is taken to be the
//! sensor. This is a sequential scan of up to 255 bus calls.

use std::ops::RangeInclusive;

use tracing::{debug, info};

use crate::constants::{RegisterAddress, MAX_UNIT_ID};
use crate::error::{IdentityNotFound, StageResult};
use crate::protocol::UnitId;
use crate::transport::ModbusTransport;

/// Brute-force identity scanner.
pub struct IdentityProbe;

impl IdentityProbe {
    /// Read the identity register of one unit as a raw float.
    pub fn read_identity<T: ModbusTransport + ?Sized>(
        transport: &mut T,
        unit: UnitId,
    ) -> StageResult<f32> {
        transport.read_f32(unit, RegisterAddress::Identity)
    }

    /// Scan `0..=254` and return the first unit whose identity register
    /// equals its own address.
    ///
    /// Failed or undecodable reads count as "no match". Uniqueness on the bus
    /// is not checked.
    pub fn find_unit_id<T: ModbusTransport + ?Sized>(
        transport: &mut T,
    ) -> Result<UnitId, IdentityNotFound> {
        Self::find_unit_id_in(transport, 0..=MAX_UNIT_ID)
    }

    /// [`find_unit_id`](Self::find_unit_id) over a narrower range.
    /// Ids above 254 are skipped.
    pub fn find_unit_id_in<T: ModbusTransport + ?Sized>(
        transport: &mut T,
        range: RangeInclusive<u8>,
    ) -> Result<UnitId, IdentityNotFound> {
        let mut scanned = 0;

        for raw in range {
            let Ok(unit) = UnitId::new(raw) else {
                continue;
            };
            scanned += 1;

            match Self::read_identity(transport, unit) {
                Ok(value) if value == unit.as_f32() => {
                    info!(unit = raw, "Sensor found");
                    return Ok(unit);
                }
                Ok(value) => debug!(unit = raw, value, "Identity mismatch, continuing"),
                Err(e) => debug!(unit = raw, error = %e, "No answer, continuing"),
            }
        }

        Err(IdentityNotFound { scanned })
    }
}
