//! Scoped ownership of the bus connection
//!
//! A [`SensorSession`] connects on creation and closes the transport when it
//! is dropped, so every exit path of a workflow run releases the port.

use tracing::{debug, warn};

use crate::error::{StageError, StageResult, TransportResult};
use crate::protocol::UnitId;
use crate::transport::ModbusTransport;

/// Exclusive owner of a transport for the duration of one run, together with
/// the unit id the device is currently believed to answer on.
pub struct SensorSession<T: ModbusTransport> {
    transport: T,
    unit: Option<UnitId>,
}

impl<T: ModbusTransport> SensorSession<T> {
    /// Connect `transport` and take ownership of it.
    ///
    /// On failure the transport is closed before the error is returned.
    pub fn open(mut transport: T) -> TransportResult<Self> {
        if let Err(e) = transport.connect() {
            let _ = transport.close();
            return Err(e);
        }
        debug!("Session opened");
        Ok(Self {
            transport,
            unit: None,
        })
    }

    /// Transport together with the id the device is believed to answer on.
    ///
    /// Fails with [`StageError::UnitNotSelected`] before [`set_unit`](Self::set_unit).
    pub fn addressed(&mut self) -> StageResult<(&mut T, UnitId)> {
        let unit = self.unit.ok_or(StageError::UnitNotSelected)?;
        Ok((&mut self.transport, unit))
    }

    /// Record the id the device answers on.
    pub fn set_unit(&mut self, unit: UnitId) {
        self.unit = Some(unit);
    }

    /// Borrow the transport for a bus operation.
    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T: ModbusTransport> Drop for SensorSession<T> {
    fn drop(&mut self) {
        match self.transport.close() {
            Ok(()) => debug!("Session closed"),
            Err(e) => warn!(error = %e, "Failed to close transport"),
        }
    }
}
