//! # Sensor Readdress - Safe Unit-Id Reassignment over Modbus RTU
//!
//! Changes the bus address of an RS-485 ultrasonic level sensor whose
//! configuration registers sit behind a security interlock. The update runs
//! as a staged, fail-closed state machine: verify the current identity,
//! unlock, commit the new identity, lock again and verify every step, with
//! bounded retries per stage.
//!
//! ## Register Map
//!
//! | Register | Address | Count | Meaning |
//! |----------|---------|-------|---------|
//! | IDENTITY | 32782 | 2 | unit id as f32 |
//! | SECURITY | 32790 | 2 | 0.0 locked, 1.0 unlocked |
//! | DISTANCE | 0 | 2 | distance in metres |
//!
//! Every value is an IEEE-754 f32, big-endian bytes and words.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sensor_readdress::{open_serial, run_id_update_workflow, SerialConfig, StartingUnit, UnitId};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = open_serial(&SerialConfig::new("/dev/ttyUSB0"))?;
//!
//!     let outcome = run_id_update_workflow(transport, StartingUnit::Discover, UnitId::new(7)?);
//!     println!("{}", outcome);
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Error types for register access and the workflow
pub mod error;

/// Register map and Modbus constants
pub mod constants;

/// Unit id and starting-id selector
pub mod protocol;

/// f32 <-> register conversion
pub mod codec;

/// Transport abstraction
pub mod transport;

/// Bounded retry
pub mod retry;

/// Workflow and serial configuration
pub mod config;

// ============================================================================
// Device operations
// ============================================================================

/// Unit-id discovery
pub mod identity;

/// Security interlock
pub mod lock;

/// Distance measurement
pub mod distance;

/// Scoped transport ownership
pub mod session;

/// Staged id-update workflow
pub mod workflow;

// ============================================================================
// Transports
// ============================================================================

/// Modbus RTU framing over serial lines
pub mod rtu;

/// In-memory sensor model
pub mod simulator;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Workflow entry points ===
pub use workflow::{
    run_id_update_workflow, EventSink, IdUpdateWorkflow, Stage, StageAttempts, TracingSink,
    WorkflowEvent, WorkflowOutcome, WorkflowReport,
};

// === Error handling ===
pub use error::{
    DecodeError, IdentityNotFound, InvalidUnitId, RetryExhausted, StageError, StageResult,
    TransportError, TransportResult,
};

// === Core types ===
pub use codec::RegisterCodec;
pub use constants::RegisterAddress;
pub use lock::{LockController, SecurityState};
pub use protocol::{StartingUnit, UnitId};

// === Operations ===
pub use distance::DistanceProbe;
pub use identity::IdentityProbe;
pub use retry::{retry, retry_with_sleep, RetryPolicy};
pub use session::SensorSession;

// === Configuration ===
pub use config::{Parity, SerialConfig, StageBudgets, WorkflowConfig};

// === Transports ===
pub use rtu::{RtuLine, RtuTransport};
pub use simulator::SimulatedSensor;
pub use transport::{ModbusTransport, TransportStats};

#[cfg(feature = "rtu")]
pub use rtu::open_serial;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
