//! # Workflow and Link Configuration
//!
//! Per-stage retry budgets for the id-update workflow, and the serial
//! parameters the RTU transport opens the port with.
//!
//! ## Default Budgets
//!
//! | Stage | Attempts | Delay |
//! |-------|----------|-------|
//! | VerifyCurrentIdentity | 3 | 100 ms |
//! | every other stage | 10 | 100 ms |

use std::time::Duration;

use crate::constants::{DEFAULT_RETRY_DELAY, DEFAULT_STAGE_ATTEMPTS, VERIFY_CURRENT_ATTEMPTS};
use crate::retry::RetryPolicy;
use crate::workflow::Stage;

/// Default baud rate of the sensor
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default per-call timeout of the serial link
pub const DEFAULT_SERIAL_TIMEOUT_MS: u64 = 100;

/// Retry policy of every stage of the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageBudgets {
    pub verify_current_identity: RetryPolicy,
    pub read_lock: RetryPolicy,
    pub unlock: RetryPolicy,
    pub commit_new_identity: RetryPolicy,
    pub lock: RetryPolicy,
    pub verify_lock: RetryPolicy,
    pub verify_new_identity: RetryPolicy,
    pub sanity_measurement: RetryPolicy,
}

impl StageBudgets {
    /// Policy for a stage. Stages without a budget of their own run once.
    pub fn policy(&self, stage: Stage) -> RetryPolicy {
        match stage {
            Stage::Connect | Stage::DiscoverIdentity => RetryPolicy::new(1),
            Stage::VerifyCurrentIdentity => self.verify_current_identity,
            Stage::ReadLock => self.read_lock,
            Stage::Unlock => self.unlock,
            Stage::CommitNewIdentity => self.commit_new_identity,
            Stage::Lock => self.lock,
            Stage::VerifyLock => self.verify_lock,
            Stage::VerifyNewIdentity => self.verify_new_identity,
            Stage::SanityMeasurement => self.sanity_measurement,
        }
    }

    fn policies_mut(&mut self) -> [&mut RetryPolicy; 8] {
        [
            &mut self.verify_current_identity,
            &mut self.read_lock,
            &mut self.unlock,
            &mut self.commit_new_identity,
            &mut self.lock,
            &mut self.verify_lock,
            &mut self.verify_new_identity,
            &mut self.sanity_measurement,
        ]
    }
}

impl Default for StageBudgets {
    fn default() -> Self {
        let standard = RetryPolicy::new(DEFAULT_STAGE_ATTEMPTS);
        Self {
            verify_current_identity: RetryPolicy::new(VERIFY_CURRENT_ATTEMPTS),
            read_lock: standard,
            unlock: standard,
            commit_new_identity: standard,
            lock: standard,
            verify_lock: standard,
            verify_new_identity: standard,
            sanity_measurement: standard,
        }
    }
}

/// Configuration of one id-update run.
///
/// # Example
///
/// ```rust
/// use sensor_readdress::WorkflowConfig;
/// use std::time::Duration;
///
/// let config = WorkflowConfig::new()
///     .with_retry_delay(Duration::from_millis(250))
///     .with_sanity_measurement(false);
///
/// assert_eq!(config.budgets.unlock.delay, Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowConfig {
    /// Per-stage retry policies
    pub budgets: StageBudgets,
    /// Run the trailing distance read after a successful update
    pub sanity_measurement: bool,
}

impl WorkflowConfig {
    /// Defaults matching the sensor's commissioning procedure.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay of every stage.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        for policy in self.budgets.policies_mut() {
            policy.delay = delay;
        }
        self
    }

    /// Enable or disable the trailing distance read.
    pub fn with_sanity_measurement(mut self, enabled: bool) -> Self {
        self.sanity_measurement = enabled;
        self
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            budgets: StageBudgets::default(),
            sanity_measurement: true,
        }
    }
}

/// Parity setting of the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial parameters of the RS-485 link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`
    pub port: String,
    pub baud_rate: u32,
    /// 5 to 8
    pub data_bits: u8,
    /// 1 or 2
    pub stop_bits: u8,
    pub parity: Parity,
    /// Per-call response timeout
    pub timeout: Duration,
}

impl SerialConfig {
    /// 9600 baud, 8N1, 100 ms timeout.
    pub fn new<S: Into<String>>(port: S) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            timeout: Duration::from_millis(DEFAULT_SERIAL_TIMEOUT_MS),
        }
    }

    /// Set the baud rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
