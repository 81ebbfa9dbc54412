//! Id-update workflow
//!
//! Moves a sensor from its current unit id to a new one:
//!
//! | # | Stage | Addressed id | Passes when |
//! |---|-------|--------------|-------------|
//! | 1 | VerifyCurrentIdentity | current | identity == current |
//! | 2 | ReadLock | current | security register decodes |
//! | 3 | Unlock | current | write 1.0 accepted |
//! | 4 | CommitNewIdentity | current, then new | identity read at new == new |
//! | 5 | Lock | new | write 0.0 accepted |
//! | 6 | VerifyLock | new | security reads locked |
//! | 7 | VerifyNewIdentity | new | identity == new |
//!
//! Each stage runs under its own [`RetryPolicy`](crate::retry::RetryPolicy).
//! Exhausting a stage ends the run with [`WorkflowOutcome::Failure`]; later
//! stages are never attempted and the whole sequence is never restarted.
//! From stage 4 onwards the device is addressed by its new id only.
//!
//! A successful run ends with a non-blocking distance read whose failure is
//! only reported as a warning.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::codec::RegisterCodec;
use crate::config::WorkflowConfig;
use crate::constants::{validate_register_map, RegisterAddress};
use crate::distance::DistanceProbe;
use crate::error::{StageError, StageResult};
use crate::identity::IdentityProbe;
use crate::lock::{LockController, SecurityState};
use crate::protocol::{StartingUnit, UnitId};
use crate::retry::{retry_classified, Attempt};
use crate::session::SensorSession;
use crate::transport::{ModbusTransport, TransportStats};

// ============================================================================
// Stages
// ============================================================================

/// One step of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Opening the transport
    Connect,
    /// Scanning for the current id when none was given
    DiscoverIdentity,
    VerifyCurrentIdentity,
    ReadLock,
    Unlock,
    CommitNewIdentity,
    Lock,
    VerifyLock,
    VerifyNewIdentity,
    /// Trailing distance read, never fails the run
    SanityMeasurement,
}

impl Stage {
    /// The seven stages that make up the update itself
    pub const PROTOCOL: [Stage; 7] = [
        Self::VerifyCurrentIdentity,
        Self::ReadLock,
        Self::Unlock,
        Self::CommitNewIdentity,
        Self::Lock,
        Self::VerifyLock,
        Self::VerifyNewIdentity,
    ];

    /// Stage name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "Connect",
            Self::DiscoverIdentity => "DiscoverIdentity",
            Self::VerifyCurrentIdentity => "VerifyCurrentIdentity",
            Self::ReadLock => "ReadLock",
            Self::Unlock => "Unlock",
            Self::CommitNewIdentity => "CommitNewIdentity",
            Self::Lock => "Lock",
            Self::VerifyLock => "VerifyLock",
            Self::VerifyNewIdentity => "VerifyNewIdentity",
            Self::SanityMeasurement => "SanityMeasurement",
        }
    }

    /// 1-based position among [`Stage::PROTOCOL`]
    pub fn position(&self) -> Option<usize> {
        Self::PROTOCOL.iter().position(|s| s == self).map(|i| i + 1)
    }

    /// Device state an operator must assume after a run aborted here.
    pub fn state_after_abort(&self) -> &'static str {
        match self {
            Self::Connect | Self::DiscoverIdentity | Self::VerifyCurrentIdentity | Self::ReadLock => {
                "device untouched"
            }
            Self::Unlock => "interlock may be released; identity unchanged",
            Self::CommitNewIdentity => {
                "interlock released; identity unconfirmed (device may answer on either id)"
            }
            Self::Lock | Self::VerifyLock => "identity changed; interlock may still be released",
            Self::VerifyNewIdentity => "identity changed and locked; final identity read unconfirmed",
            Self::SanityMeasurement => "update complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Outcome and Report
// ============================================================================

/// Result of one run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    /// Device answers on `unit_id`, locked and verified
    Success {
        unit_id: UnitId,
        /// Sanity reading in centimetres, `None` if it could not be taken
        distance_cm: Option<f32>,
    },
    /// The run stopped at `stage`; `error` is the last error observed there
    Failure { stage: Stage, error: StageError },
}

impl WorkflowOutcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Final unit id on success
    pub fn unit_id(&self) -> Option<UnitId> {
        match self {
            Self::Success { unit_id, .. } => Some(*unit_id),
            Self::Failure { .. } => None,
        }
    }

    /// Failing stage on failure
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { stage, .. } => Some(*stage),
        }
    }
}

impl fmt::Display for WorkflowOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { unit_id, .. } => write!(f, "unit id is now {}", unit_id),
            Self::Failure { stage, error } => {
                write!(f, "failed at {} ({}): {}", stage, stage.state_after_abort(), error)
            }
        }
    }
}

/// Attempts spent on a stage that ran to completion or exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageAttempts {
    pub stage: Stage,
    pub attempts: u32,
    pub succeeded: bool,
}

/// Outcome plus bookkeeping of one run.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub outcome: WorkflowOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Stages that were entered, in order
    pub stages: Vec<StageAttempts>,
    /// Transport counters at the end of the run
    pub stats: TransportStats,
}

impl WorkflowReport {
    /// Wall-clock duration of the run
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

// ============================================================================
// Events
// ============================================================================

/// Progress notifications emitted during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    UnitDiscovered { unit: UnitId },
    StageStarted { stage: Stage, unit: UnitId },
    AttemptFailed {
        stage: Stage,
        attempt: u32,
        max_attempts: u32,
        error: StageError,
    },
    StageCompleted { stage: Stage, attempts: u32 },
    StageFailed {
        stage: Stage,
        attempts: u32,
        error: StageError,
    },
    /// Interlock was already released before the update started
    AlreadyUnlocked { unit: UnitId },
    DistanceMeasured { distance_cm: f32 },
    SanityMeasurementFailed { error: StageError },
    Finished { outcome: WorkflowOutcome },
}

/// Receiver of [`WorkflowEvent`]s.
pub trait EventSink {
    fn emit(&mut self, event: WorkflowEvent);
}

impl EventSink for Vec<WorkflowEvent> {
    fn emit(&mut self, event: WorkflowEvent) {
        self.push(event);
    }
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn emit(&mut self, event: WorkflowEvent) {
        (**self).emit(event);
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&mut self, event: WorkflowEvent) {
        match event {
            WorkflowEvent::UnitDiscovered { unit } => info!(unit = unit.get(), "Sensor discovered"),
            WorkflowEvent::StageStarted { stage, unit } => match stage.position() {
                Some(n) => info!(unit = unit.get(), "Stage {}/{}: {}", n, Stage::PROTOCOL.len(), stage),
                None => info!(unit = unit.get(), "{}", stage),
            },
            WorkflowEvent::AttemptFailed {
                stage,
                attempt,
                max_attempts,
                error,
            } => debug!(%stage, %error, "Error. Retrying... {}/{}", attempt, max_attempts),
            WorkflowEvent::StageCompleted { stage, attempts } => {
                info!(%stage, attempts, "Stage completed")
            }
            WorkflowEvent::StageFailed {
                stage,
                attempts,
                error,
            } => error!(%stage, attempts, %error, "Stage failed, aborting"),
            WorkflowEvent::AlreadyUnlocked { unit } => {
                warn!(unit = unit.get(), "Security register was already unlocked")
            }
            WorkflowEvent::DistanceMeasured { distance_cm } => {
                info!(distance_cm, "Sanity measurement")
            }
            WorkflowEvent::SanityMeasurementFailed { error } => {
                warn!(%error, "Sanity measurement failed; update itself succeeded")
            }
            WorkflowEvent::Finished { outcome } => match outcome {
                WorkflowOutcome::Success { unit_id, .. } => {
                    info!(unit = unit_id.get(), "Unit id update finished")
                }
                WorkflowOutcome::Failure { stage, error } => {
                    error!(%stage, %error, state = stage.state_after_abort(), "Unit id update aborted")
                }
            },
        }
    }
}

// ============================================================================
// Workflow
// ============================================================================

/// Staged, fail-closed unit-id update.
///
/// # Example
///
/// ```rust
/// use sensor_readdress::{
///     IdUpdateWorkflow, SimulatedSensor, StartingUnit, UnitId, WorkflowConfig,
/// };
/// use std::time::Duration;
///
/// let current = UnitId::new(5).unwrap();
/// let new = UnitId::new(7).unwrap();
/// let mut sensor = SimulatedSensor::new(current);
///
/// let config = WorkflowConfig::new().with_retry_delay(Duration::ZERO);
/// let report = IdUpdateWorkflow::new(config).run(&mut sensor, StartingUnit::Known(current), new);
///
/// assert_eq!(report.outcome.unit_id(), Some(new));
/// assert_eq!(sensor.address(), new);
/// ```
pub struct IdUpdateWorkflow<S: EventSink = TracingSink> {
    config: WorkflowConfig,
    sink: S,
}

impl IdUpdateWorkflow<TracingSink> {
    /// Workflow reporting through `tracing`.
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            config,
            sink: TracingSink,
        }
    }
}

impl<S: EventSink> IdUpdateWorkflow<S> {
    /// Replace the event sink.
    pub fn with_sink<S2: EventSink>(self, sink: S2) -> IdUpdateWorkflow<S2> {
        IdUpdateWorkflow {
            config: self.config,
            sink,
        }
    }

    /// Run the update. The transport is connected on entry and closed on
    /// every exit path.
    pub fn run<T: ModbusTransport>(
        &mut self,
        transport: T,
        current: StartingUnit,
        new: UnitId,
    ) -> WorkflowReport {
        let started_at = Utc::now();
        let mut stages = Vec::new();
        let mut stats = TransportStats::default();

        let outcome = match self.execute(transport, current, new, &mut stages, &mut stats) {
            Ok(outcome) | Err(outcome) => outcome,
        };

        self.sink.emit(WorkflowEvent::Finished {
            outcome: outcome.clone(),
        });

        WorkflowReport {
            outcome,
            started_at,
            finished_at: Utc::now(),
            stages,
            stats,
        }
    }

    fn execute<T: ModbusTransport>(
        &mut self,
        transport: T,
        current: StartingUnit,
        new: UnitId,
        stages: &mut Vec<StageAttempts>,
        stats: &mut TransportStats,
    ) -> Result<WorkflowOutcome, WorkflowOutcome> {
        validate_register_map().map_err(|e| failure(Stage::Connect, e.into()))?;
        if current == StartingUnit::Known(new) {
            return Err(same_unit(new));
        }

        let mut session =
            SensorSession::open(transport).map_err(|e| failure(Stage::Connect, e.into()))?;

        let outcome = self.update(&mut session, current, new, stages);
        *stats = session.transport().get_stats();
        outcome
    }

    fn update<T: ModbusTransport>(
        &mut self,
        session: &mut SensorSession<T>,
        current: StartingUnit,
        new: UnitId,
        stages: &mut Vec<StageAttempts>,
    ) -> Result<WorkflowOutcome, WorkflowOutcome> {
        let current = match current {
            StartingUnit::Known(unit) => unit,
            StartingUnit::Discover => {
                let unit = IdentityProbe::find_unit_id(session.transport())
                    .map_err(|e| failure(Stage::DiscoverIdentity, e.into()))?;
                self.sink.emit(WorkflowEvent::UnitDiscovered { unit });
                if unit == new {
                    return Err(same_unit(new));
                }
                unit
            }
        };
        session.set_unit(current);

        self.run_stage(Stage::VerifyCurrentIdentity, current, stages, || {
            let (transport, unit) = session.addressed()?;
            expect_identity(transport, unit)
        })?;

        let state = self.run_stage(Stage::ReadLock, current, stages, || {
            let (transport, unit) = session.addressed()?;
            match LockController::read_lock_state(transport, unit)? {
                SecurityState::Invalid(value) => Err(StageError::SecurityFault { value }),
                state => Ok(state),
            }
        })?;
        if state == SecurityState::Unlocked {
            self.sink
                .emit(WorkflowEvent::AlreadyUnlocked { unit: current });
        }

        self.run_stage(Stage::Unlock, current, stages, || {
            let (transport, unit) = session.addressed()?;
            Ok(LockController::unlock(transport, unit)?)
        })?;

        self.run_stage(Stage::CommitNewIdentity, current, stages, || {
            let (transport, unit) = session.addressed()?;
            commit_identity(transport, unit, new)
        })?;
        session.set_unit(new);

        self.run_stage(Stage::Lock, new, stages, || {
            let (transport, unit) = session.addressed()?;
            Ok(LockController::lock(transport, unit)?)
        })?;

        self.run_stage(Stage::VerifyLock, new, stages, || {
            let (transport, unit) = session.addressed()?;
            match LockController::read_lock_state(transport, unit)? {
                state if state.is_locked() => Ok(()),
                SecurityState::Invalid(value) => Err(StageError::SecurityFault { value }),
                state => Err(StageError::LockNotEngaged { state }),
            }
        })?;

        self.run_stage(Stage::VerifyNewIdentity, new, stages, || {
            let (transport, unit) = session.addressed()?;
            expect_identity(transport, unit)
        })?;

        let distance_cm = if self.config.sanity_measurement {
            self.sanity_measurement(session, new, stages)
        } else {
            None
        };

        Ok(WorkflowOutcome::Success {
            unit_id: new,
            distance_cm,
        })
    }

    fn sanity_measurement<T: ModbusTransport>(
        &mut self,
        session: &mut SensorSession<T>,
        unit: UnitId,
        stages: &mut Vec<StageAttempts>,
    ) -> Option<f32> {
        let measured = self.run_stage(Stage::SanityMeasurement, unit, stages, || {
            let (transport, unit) = session.addressed()?;
            DistanceProbe::measure(transport, unit)
        });

        match measured {
            Ok(distance_cm) => {
                self.sink
                    .emit(WorkflowEvent::DistanceMeasured { distance_cm });
                Some(distance_cm)
            }
            Err(WorkflowOutcome::Failure { error, .. }) => {
                self.sink
                    .emit(WorkflowEvent::SanityMeasurementFailed { error });
                None
            }
            Err(WorkflowOutcome::Success { .. }) => None,
        }
    }

    /// Run one stage under its retry policy.
    fn run_stage<R, F>(
        &mut self,
        stage: Stage,
        unit: UnitId,
        stages: &mut Vec<StageAttempts>,
        mut operation: F,
    ) -> Result<R, WorkflowOutcome>
    where
        F: FnMut() -> StageResult<R>,
    {
        let policy = self.config.budgets.policy(stage);
        let max_attempts = policy.effective_attempts();
        self.sink.emit(WorkflowEvent::StageStarted { stage, unit });

        let sink = &mut self.sink;
        let result = retry_classified(&policy, std::thread::sleep, |attempt| {
            operation().map(|value| (value, attempt)).map_err(|error| {
                sink.emit(WorkflowEvent::AttemptFailed {
                    stage,
                    attempt,
                    max_attempts,
                    error: error.clone(),
                });
                if error.is_fatal() {
                    Attempt::Fatal(error)
                } else {
                    Attempt::Retry(error)
                }
            })
        });

        match result {
            Ok((value, attempts)) => {
                stages.push(StageAttempts {
                    stage,
                    attempts,
                    succeeded: true,
                });
                self.sink
                    .emit(WorkflowEvent::StageCompleted { stage, attempts });
                Ok(value)
            }
            Err(exhausted) => {
                stages.push(StageAttempts {
                    stage,
                    attempts: exhausted.attempts,
                    succeeded: false,
                });
                // the caller downgrades a failed sanity read to a warning
                if stage != Stage::SanityMeasurement {
                    self.sink.emit(WorkflowEvent::StageFailed {
                        stage,
                        attempts: exhausted.attempts,
                        error: exhausted.last_error.clone(),
                    });
                }
                Err(failure(stage, exhausted.last_error))
            }
        }
    }
}

/// Run the update with default budgets, reporting through `tracing`.
///
/// With [`StartingUnit::Discover`] the bus is scanned for the current id
/// first.
pub fn run_id_update_workflow<T: ModbusTransport>(
    transport: T,
    current: StartingUnit,
    new: UnitId,
) -> WorkflowOutcome {
    IdUpdateWorkflow::new(WorkflowConfig::default())
        .run(transport, current, new)
        .outcome
}

// ============================================================================
// Stage Actions
// ============================================================================

fn failure(stage: Stage, error: StageError) -> WorkflowOutcome {
    WorkflowOutcome::Failure { stage, error }
}

fn same_unit(unit: UnitId) -> WorkflowOutcome {
    failure(
        Stage::VerifyCurrentIdentity,
        StageError::SameUnitId { unit: unit.get() },
    )
}

fn expect_identity<T: ModbusTransport + ?Sized>(transport: &mut T, unit: UnitId) -> StageResult<()> {
    let value = IdentityProbe::read_identity(transport, unit)?;
    if value == unit.as_f32() {
        Ok(())
    } else {
        Err(StageError::IdentityMismatch {
            expected: unit.get(),
            actual: value,
        })
    }
}

/// Write the new id at the current address, then confirm it at the new one.
///
/// The read-back runs even when the write reports an error: a lost response
/// does not mean the device kept its old address.
fn commit_identity<T: ModbusTransport + ?Sized>(
    transport: &mut T,
    current: UnitId,
    new: UnitId,
) -> StageResult<()> {
    let identity = RegisterAddress::Identity;
    let write = transport.write_holding_registers(
        current,
        identity.address(),
        &RegisterCodec::encode_unit_id(new),
    );
    if let Err(e) = &write {
        debug!(from = current.get(), to = new.get(), error = %e, "Identity write reported an error");
    }

    match IdentityProbe::read_identity(transport, new) {
        Ok(value) if value == new.as_f32() => Ok(()),
        Ok(value) => Err(StageError::IdentityMismatch {
            expected: new.get(),
            actual: value,
        }),
        Err(read_err) => Err(write.err().map(StageError::from).unwrap_or(read_err)),
    }
}
