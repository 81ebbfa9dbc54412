//! Distance measurement read

use tracing::info;

use crate::constants::{RegisterAddress, DISTANCE_SCALE};
use crate::error::StageResult;
use crate::protocol::UnitId;
use crate::transport::ModbusTransport;

/// Reads the level sensor's measurement register.
pub struct DistanceProbe;

impl DistanceProbe {
    /// Measured distance in centimetres (register value is metres).
    pub fn measure<T: ModbusTransport + ?Sized>(transport: &mut T, unit: UnitId) -> StageResult<f32> {
        let metres = transport.read_f32(unit, RegisterAddress::Distance)?;
        let centimetres = metres * DISTANCE_SCALE;
        info!(unit = unit.get(), distance_cm = centimetres, "Distance measured");
        Ok(centimetres)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StageError, TransportError};
    use crate::simulator::SimulatedSensor;

    #[test]
    fn test_scales_to_centimetres() {
        let unit = UnitId::new(7).unwrap();
        let mut sensor = SimulatedSensor::new(unit).with_distance(1.5);
        sensor.connect().unwrap();
        assert_eq!(DistanceProbe::measure(&mut sensor, unit), Ok(150.0));
    }

    #[test]
    fn test_wrong_unit_is_an_error() {
        let mut sensor = SimulatedSensor::new(UnitId::new(7).unwrap());
        sensor.connect().unwrap();
        assert_eq!(
            DistanceProbe::measure(&mut sensor, UnitId::new(8).unwrap()),
            Err(StageError::Transport(TransportError::NoResponse { unit: 8 }))
        );
    }
}
