//! Register map of the level sensor and the Modbus constants the tool needs
//!
//! Every sensor value lives in one IEEE-754 f32 spread across two holding
//! registers. The table below is the bit-exact contract with the device.

use std::time::Duration;

use crate::error::RegisterMapError;

// ============================================================================
// Sensor Register Map
// ============================================================================

/// Registers occupied by a single f32 value
pub const FLOAT_REGISTER_COUNT: u16 = 2;

/// A named holding register on the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterAddress {
    /// Bus address the device answers on, stored as an integer-valued float
    Identity,
    /// Security interlock: 0.0 locked, 1.0 unlocked
    Security,
    /// Measured distance in metres
    Distance,
}

impl RegisterAddress {
    /// Every register the tool touches, in table order
    pub const ALL: [RegisterAddress; 3] = [Self::Identity, Self::Security, Self::Distance];

    /// Starting register address
    #[inline]
    pub const fn address(self) -> u16 {
        match self {
            Self::Identity => 32782,
            Self::Security => 32790,
            Self::Distance => 0,
        }
    }

    /// Number of registers, always two
    #[inline]
    pub const fn count(self) -> u16 {
        FLOAT_REGISTER_COUNT
    }

    /// Name used in logs
    pub const fn name(self) -> &'static str {
        match self {
            Self::Identity => "IDENTITY",
            Self::Security => "SECURITY",
            Self::Distance => "DISTANCE",
        }
    }
}

impl std::fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name(), self.address())
    }
}

/// Check that the register table is usable: counts are two, ranges fit the
/// 16-bit address space and no two registers overlap.
pub fn validate_register_map() -> Result<(), RegisterMapError> {
    for (i, reg) in RegisterAddress::ALL.iter().enumerate() {
        if reg.count() != FLOAT_REGISTER_COUNT {
            return Err(RegisterMapError {
                message: format!("{} spans {} registers, expected 2", reg, reg.count()),
            });
        }
        let end = u32::from(reg.address()) + u32::from(reg.count());
        if end > 0x1_0000 {
            return Err(RegisterMapError {
                message: format!("{} runs past the end of the address space", reg),
            });
        }
        for other in &RegisterAddress::ALL[i + 1..] {
            let (a0, a1) = (u32::from(reg.address()), end);
            let b0 = u32::from(other.address());
            let b1 = b0 + u32::from(other.count());
            if a0 < b1 && b0 < a1 {
                return Err(RegisterMapError {
                    message: format!("{} overlaps {}", reg, other),
                });
            }
        }
    }
    Ok(())
}

/// Lock register value meaning "interlock engaged"
pub const SECURITY_LOCKED: f32 = 0.0;

/// Lock register value meaning "configuration writable"
pub const SECURITY_UNLOCKED: f32 = 1.0;

/// Distance register scale: metres to centimetres
pub const DISTANCE_SCALE: f32 = 100.0;

// ============================================================================
// Unit Id Range
// ============================================================================

/// Highest unit id the identity scan covers and the workflow accepts.
/// 255 is treated as a broadcast-like sentinel and never addressed.
pub const MAX_UNIT_ID: u8 = 254;

// ============================================================================
// Workflow Timing
// ============================================================================

/// Delay between attempts of one stage
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Attempt budget of the initial identity check
pub const VERIFY_CURRENT_ATTEMPTS: u32 = 3;

/// Attempt budget of every other stage
pub const DEFAULT_STAGE_ATTEMPTS: u32 = 10;

// ============================================================================
// Frame Size Constants (RTU)
// ============================================================================

/// Maximum PDU size per Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum RTU ADU size: address + PDU + CRC
pub const MAX_RTU_FRAME_SIZE: usize = 1 + MAX_PDU_SIZE + 2;

/// Maximum number of registers for FC03
/// 1 + 1 + (N × 2) ≤ 253 → N ≤ 125
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16
/// 1 + 2 + 2 + 1 + (N × 2) ≤ 253 → N ≤ 123
pub const MAX_WRITE_REGISTERS: usize = 123;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Device Failure
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Acknowledge
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;

/// Server Device Busy
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;
