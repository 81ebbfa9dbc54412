//! Unit id type and the starting-id selector of the workflow

use std::fmt;
use std::str::FromStr;

use crate::constants::MAX_UNIT_ID;
use crate::error::InvalidUnitId;

/// Bus address of a device on the RS-485 line, always in `0..=254`.
///
/// # Example
///
/// ```rust
/// use sensor_readdress::UnitId;
///
/// let id = UnitId::new(7).unwrap();
/// assert_eq!(id.get(), 7);
/// assert!(UnitId::new(255).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(u8);

impl UnitId {
    /// Validate and wrap a raw id
    pub fn new(value: u8) -> Result<Self, InvalidUnitId> {
        if value > MAX_UNIT_ID {
            return Err(InvalidUnitId {
                value: f64::from(value),
                max: MAX_UNIT_ID,
            });
        }
        Ok(Self(value))
    }

    /// Interpret a decoded register value as a unit id.
    ///
    /// Only exact integer values inside the range are accepted.
    pub fn from_f32(value: f32) -> Result<Self, InvalidUnitId> {
        let invalid = InvalidUnitId {
            value: f64::from(value),
            max: MAX_UNIT_ID,
        };
        if !value.is_finite() || value.fract() != 0.0 || value < 0.0 {
            return Err(invalid);
        }
        if value > f32::from(MAX_UNIT_ID) {
            return Err(invalid);
        }
        Ok(Self(value as u8))
    }

    /// Raw value
    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Value as written into the identity register
    #[inline]
    pub fn as_f32(self) -> f32 {
        f32::from(self.0)
    }
}

impl TryFrom<u8> for UnitId {
    type Error = InvalidUnitId;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<u16> for UnitId {
    type Error = InvalidUnitId;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map_err(|_| InvalidUnitId {
                value: f64::from(value),
                max: MAX_UNIT_ID,
            })
            .and_then(Self::new)
    }
}

impl From<UnitId> for u8 {
    fn from(id: UnitId) -> Self {
        id.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UnitId {
    type Err = InvalidUnitId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let value: u16 = trimmed.parse().map_err(|_| InvalidUnitId {
            value: trimmed.parse::<f64>().unwrap_or(f64::NAN),
            max: MAX_UNIT_ID,
        })?;
        Self::try_from(value)
    }
}

/// Where the workflow takes the device's current id from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartingUnit {
    /// Operator supplied the id
    Known(UnitId),
    /// Scan the bus for it first
    Discover,
}

impl From<UnitId> for StartingUnit {
    fn from(id: UnitId) -> Self {
        Self::Known(id)
    }
}

impl From<Option<UnitId>> for StartingUnit {
    fn from(id: Option<UnitId>) -> Self {
        id.map_or(Self::Discover, Self::Known)
    }
}

impl fmt::Display for StartingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(id) => write!(f, "{}", id),
            Self::Discover => write!(f, "discover"),
        }
    }
}
