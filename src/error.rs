//! Error types for register access and the id-update workflow
//!
//! The taxonomy is layered: [`TransportError`] covers the bus, [`DecodeError`]
//! covers register shapes, and [`StageError`] is what a single workflow stage
//! can observe. [`RetryExhausted`] wraps the last error once a stage's
//! attempt budget is spent.

use thiserror::Error;

use crate::lock::SecurityState;

/// Errors reported by a [`ModbusTransport`](crate::transport::ModbusTransport).
///
/// Every variant is retryable from the workflow's point of view.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No complete frame arrived within the per-call timeout
    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The device never started answering
    #[error("No response from unit {unit}")]
    NoResponse { unit: u8 },

    /// Register count in the response differs from the requested count
    #[error("Malformed response: expected {expected} registers, got {actual}")]
    Malformed { expected: usize, actual: usize },

    /// Device-reported Modbus exception
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Frame checksum mismatch
    #[error("CRC mismatch: expected {expected:04X}, got {actual:04X}")]
    Crc { expected: u16, actual: u16 },

    /// A well-formed frame that does not answer the request
    #[error("Unexpected response: {message}")]
    UnexpectedResponse { message: String },

    /// Operation attempted on a closed transport
    #[error("Transport not connected")]
    NotConnected,

    /// Underlying I/O failure
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl TransportError {
    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create an unexpected-response error
    pub fn unexpected<S: Into<String>>(message: S) -> Self {
        Self::UnexpectedResponse {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create an exception error from a function/exception code pair
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function,
            code,
            message: exception_description(code).to_string(),
        }
    }

    /// True for errors raised by the device rather than the link
    pub fn is_device_reported(&self) -> bool {
        matches!(self, Self::Exception { .. })
    }

    /// True for timeout-like failures
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::NoResponse { .. })
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::Timeout { timeout_ms: 0 }
            }
            _ => Self::Io {
                message: err.to_string(),
            },
        }
    }
}

/// Human readable name of a Modbus exception code.
pub fn exception_description(code: u8) -> &'static str {
    use crate::constants::*;
    match code {
        EXCEPTION_ILLEGAL_FUNCTION => "Illegal function",
        EXCEPTION_ILLEGAL_DATA_ADDRESS => "Illegal data address",
        EXCEPTION_ILLEGAL_DATA_VALUE => "Illegal data value",
        EXCEPTION_SERVER_DEVICE_FAILURE => "Server device failure",
        EXCEPTION_ACKNOWLEDGE => "Acknowledge",
        EXCEPTION_SERVER_DEVICE_BUSY => "Server device busy",
        _ => "Unknown exception",
    }
}

/// A register sequence that cannot hold one f32.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Cannot decode f32: expected {expected} registers, got {actual}")]
pub struct DecodeError {
    pub expected: usize,
    pub actual: usize,
}

/// Unit id outside the addressable range.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("Invalid unit id {value}: must be an integer in 0..={max}")]
pub struct InvalidUnitId {
    pub value: f64,
    pub max: u8,
}

/// The identity probe scanned every id without a truthful answer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("No sensor answered with its own unit id ({scanned} ids scanned)")]
pub struct IdentityNotFound {
    pub scanned: usize,
}

/// Overlapping or malformed register table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid register map: {message}")]
pub struct RegisterMapError {
    pub message: String,
}

/// Everything a single workflow stage can observe going wrong.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Lock register held a value that is neither locked nor unlocked
    #[error("Security fault: lock register reads {value}")]
    SecurityFault { value: f32 },

    /// Identity register disagrees with the addressed unit id
    #[error("Identity mismatch: expected {expected}, read {actual}")]
    IdentityMismatch { expected: u8, actual: f32 },

    /// Lock write succeeded but the register does not read back as locked
    #[error("Interlock not engaged: state is {state}")]
    LockNotEngaged { state: SecurityState },

    #[error(transparent)]
    IdentityNotFound(#[from] IdentityNotFound),

    /// Requested id equals the current id
    #[error("New unit id {unit} equals the current unit id")]
    SameUnitId { unit: u8 },

    #[error(transparent)]
    RegisterMap(#[from] RegisterMapError),

    /// A device operation ran before the session knew which id to address
    #[error("No unit id selected for the session")]
    UnitNotSelected,
}

impl StageError {
    /// Errors that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SecurityFault { .. }
                | Self::IdentityNotFound(_)
                | Self::SameUnitId { .. }
                | Self::RegisterMap(_)
                | Self::UnitNotSelected
        )
    }
}

/// A bounded retry loop gave up.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Gave up after {attempts} attempt(s): {last_error}")]
pub struct RetryExhausted<E> {
    /// Number of attempts actually made
    pub attempts: u32,
    /// Error returned by the last attempt
    pub last_error: E,
}

/// Result alias for transport calls
pub type TransportResult<T> = Result<T, TransportError>;

/// Result alias for stage operations
pub type StageResult<T> = Result<T, StageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_timeout_maps_to_timeout() {
        let err: TransportError = std::io::Error::new(std::io::ErrorKind::TimedOut, "t").into();
        assert!(err.is_timeout());

        let err: TransportError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "p").into();
        assert!(matches!(err, TransportError::Io { .. }));
    }

    #[test]
    fn test_exception_is_distinct_from_timeout() {
        let err = TransportError::exception(0x10, 0x02);
        assert!(err.is_device_reported());
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("Illegal data address"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(StageError::SecurityFault { value: 0.5 }.is_fatal());
        assert!(!StageError::Transport(TransportError::timeout(100)).is_fatal());
        assert!(!StageError::IdentityMismatch {
            expected: 7,
            actual: 5.0
        }
        .is_fatal());
    }
}
