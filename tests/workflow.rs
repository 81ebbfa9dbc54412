//! End-to-end runs of the id-update workflow against the simulated sensor
//!
//! Every test inspects the simulator's request log, so the exact bus traffic
//! of each run is pinned down.

use std::time::Duration;

use sensor_readdress::simulator::{Fault, OpKind, Operation};
use sensor_readdress::{
    run_id_update_workflow, DecodeError, IdUpdateWorkflow, IdentityNotFound, ModbusTransport,
    RegisterAddress, SecurityState, SimulatedSensor, Stage, StageError, StartingUnit,
    TransportError, UnitId, WorkflowConfig, WorkflowEvent, WorkflowOutcome, WorkflowReport,
};

fn unit(id: u8) -> UnitId {
    UnitId::new(id).unwrap()
}

fn fast() -> WorkflowConfig {
    WorkflowConfig::new().with_retry_delay(Duration::ZERO)
}

fn run(sensor: &mut SimulatedSensor, current: StartingUnit, new: u8) -> WorkflowReport {
    IdUpdateWorkflow::new(fast()).run(sensor, current, unit(new))
}

/// (direction, unit, register, written value)
fn summarize(log: &[Operation]) -> Vec<(OpKind, u8, Option<RegisterAddress>, Option<f32>)> {
    log.iter()
        .map(|op| (op.kind, op.unit.get(), op.register(), op.written_f32()))
        .collect()
}

fn attempts_of(report: &WorkflowReport, stage: Stage) -> Option<u32> {
    report
        .stages
        .iter()
        .find(|s| s.stage == stage)
        .map(|s| s.attempts)
}

fn first_identity_write(log: &[Operation]) -> Option<usize> {
    log.iter()
        .position(|op| op.kind == OpKind::Write && op.register() == Some(RegisterAddress::Identity))
}

// ============================================================================
// Happy path
// ============================================================================

#[test]
fn test_update_5_to_7_exact_traffic() {
    use OpKind::{Read, Write};
    use RegisterAddress::{Distance, Identity, Security};

    let mut sensor = SimulatedSensor::new(unit(5)).with_distance(0.5);
    let report = run(&mut sensor, unit(5).into(), 7);

    assert_eq!(
        report.outcome,
        WorkflowOutcome::Success {
            unit_id: unit(7),
            distance_cm: Some(50.0)
        }
    );
    assert_eq!(
        summarize(sensor.log()),
        vec![
            (Read, 5, Some(Identity), None),
            (Read, 5, Some(Security), None),
            (Write, 5, Some(Security), Some(1.0)),
            (Write, 5, Some(Identity), Some(7.0)),
            (Read, 7, Some(Identity), None),
            (Write, 7, Some(Security), Some(0.0)),
            (Read, 7, Some(Security), None),
            (Read, 7, Some(Identity), None),
            (Read, 7, Some(Distance), None),
        ]
    );

    assert_eq!(sensor.address(), unit(7));
    assert_eq!(sensor.security_value(), 0.0);
    assert_eq!(report.stats.requests_sent, 9);
    assert_eq!(report.stats.errors, 0);
}

#[test]
fn test_every_stage_reported_once_in_order() {
    let mut sensor = SimulatedSensor::new(unit(10));
    let report = run(&mut sensor, unit(10).into(), 200);

    let stages: Vec<Stage> = report.stages.iter().map(|s| s.stage).collect();
    let mut expected = Stage::PROTOCOL.to_vec();
    expected.push(Stage::SanityMeasurement);
    assert_eq!(stages, expected);
}

#[test]
fn test_boundary_ids() {
    let mut sensor = SimulatedSensor::new(unit(0));
    assert!(run(&mut sensor, unit(0).into(), 254).outcome.is_success());
    assert_eq!(sensor.address(), unit(254));

    let report = run(&mut sensor, unit(254).into(), 0);
    assert_eq!(report.outcome.unit_id(), Some(unit(0)));
}

#[test]
fn test_convenience_entry_point() {
    let mut sensor = SimulatedSensor::new(unit(3));
    // default budgets, but nothing fails so no delay is ever taken
    let outcome = run_id_update_workflow(&mut sensor, unit(3).into(), unit(4));
    assert_eq!(outcome.unit_id(), Some(unit(4)));
}

// ============================================================================
// Fail-closed aborts
// ============================================================================

struct AbortCase {
    fault: Fault,
    stage: Stage,
    attempts: u32,
}

fn abort_cases() -> Vec<AbortCase> {
    let timeout = TransportError::timeout(100);
    vec![
        AbortCase {
            fault: Fault::persistent(OpKind::Read, RegisterAddress::Identity, timeout.clone())
                .at_unit(5),
            stage: Stage::VerifyCurrentIdentity,
            attempts: 3,
        },
        AbortCase {
            fault: Fault::persistent(OpKind::Read, RegisterAddress::Security, timeout.clone())
                .at_unit(5),
            stage: Stage::ReadLock,
            attempts: 10,
        },
        AbortCase {
            fault: Fault::persistent(OpKind::Write, RegisterAddress::Security, timeout.clone())
                .at_unit(5),
            stage: Stage::Unlock,
            attempts: 10,
        },
        AbortCase {
            fault: Fault::persistent(OpKind::Write, RegisterAddress::Identity, timeout.clone()),
            stage: Stage::CommitNewIdentity,
            attempts: 10,
        },
        AbortCase {
            fault: Fault::persistent(OpKind::Write, RegisterAddress::Security, timeout.clone())
                .at_unit(7),
            stage: Stage::Lock,
            attempts: 10,
        },
        AbortCase {
            fault: Fault::persistent(OpKind::Read, RegisterAddress::Security, timeout.clone())
                .at_unit(7),
            stage: Stage::VerifyLock,
            attempts: 10,
        },
        AbortCase {
            // let the commit read-back through, then fail the final check
            fault: Fault::persistent(OpKind::Read, RegisterAddress::Identity, timeout)
                .at_unit(7)
                .after(1),
            stage: Stage::VerifyNewIdentity,
            attempts: 10,
        },
    ]
}

#[test]
fn test_each_stage_aborts_the_run() {
    for case in abort_cases() {
        let mut sensor = SimulatedSensor::new(unit(5)).with_fault(case.fault);
        let report = run(&mut sensor, unit(5).into(), 7);

        assert_eq!(
            report.outcome.failed_stage(),
            Some(case.stage),
            "outcome {:?}",
            report.outcome
        );
        assert_eq!(attempts_of(&report, case.stage), Some(case.attempts));

        // nothing after the failing stage was entered
        let last = report.stages.last().map(|s| s.stage);
        assert_eq!(last, Some(case.stage));
        assert!(report.stages.iter().all(|s| s.stage <= case.stage));
        assert_eq!(sensor.close_count(), 1);

        // the new id is never addressed before the identity write
        let log = sensor.log();
        let boundary = first_identity_write(log).unwrap_or(log.len());
        assert!(
            log[..boundary].iter().all(|op| op.unit.get() == 5),
            "new id addressed early when failing at {}",
            case.stage
        );
        if case.stage < Stage::CommitNewIdentity {
            assert!(log.iter().all(|op| op.unit.get() == 5));
            assert_eq!(sensor.address(), unit(5));
        }
    }
}

#[test]
fn test_failed_unlock_never_writes_identity() {
    let mut sensor = SimulatedSensor::new(unit(5)).with_fault(Fault::persistent(
        OpKind::Write,
        RegisterAddress::Security,
        TransportError::exception(0x10, 0x04),
    ));
    let report = run(&mut sensor, unit(5).into(), 7);

    assert_eq!(report.outcome.failed_stage(), Some(Stage::Unlock));
    assert_eq!(first_identity_write(sensor.log()), None);
}

#[test]
fn test_commit_failure_reports_write_error_when_new_id_is_silent() {
    let mut sensor = SimulatedSensor::new(unit(5)).with_fault(Fault::persistent(
        OpKind::Write,
        RegisterAddress::Identity,
        TransportError::timeout(100),
    ));
    let report = run(&mut sensor, unit(5).into(), 7);

    assert_eq!(
        report.outcome,
        WorkflowOutcome::Failure {
            stage: Stage::CommitNewIdentity,
            error: StageError::Transport(TransportError::timeout(100)),
        }
    );
    // each attempt is one write at the old id plus one read-back at the new
    let identity_ops: Vec<_> = summarize(sensor.log())
        .into_iter()
        .filter(|(_, _, reg, _)| *reg == Some(RegisterAddress::Identity))
        .skip(1)
        .collect();
    assert_eq!(identity_ops.len(), 20);
    for pair in identity_ops.chunks(2) {
        assert_eq!((pair[0].0, pair[0].1), (OpKind::Write, 5));
        assert_eq!((pair[1].0, pair[1].1), (OpKind::Read, 7));
    }
}

#[test]
fn test_stale_read_back_fails_commit() {
    let mut sensor = SimulatedSensor::new(unit(5)).with_stale_identity();
    let report = run(&mut sensor, unit(5).into(), 7);

    assert_eq!(
        report.outcome,
        WorkflowOutcome::Failure {
            stage: Stage::CommitNewIdentity,
            error: StageError::IdentityMismatch {
                expected: 7,
                actual: 5.0
            },
        }
    );
    assert_eq!(attempts_of(&report, Stage::CommitNewIdentity), Some(10));
    for stage in [Stage::Lock, Stage::VerifyLock, Stage::VerifyNewIdentity] {
        assert_eq!(attempts_of(&report, stage), None);
    }

    // the interlock is left released; nothing tried to lock it at the new id
    assert!(!sensor.log().iter().any(|op| op.kind == OpKind::Write
        && op.unit.get() == 7
        && op.register() == Some(RegisterAddress::Security)));
    assert_eq!(sensor.security_value(), 1.0);
}

#[test]
fn test_wrong_identity_at_current_id() {
    let mut sensor = SimulatedSensor::new(unit(5)).with_identity_value(9.0);
    let report = run(&mut sensor, unit(5).into(), 7);

    assert_eq!(
        report.outcome,
        WorkflowOutcome::Failure {
            stage: Stage::VerifyCurrentIdentity,
            error: StageError::IdentityMismatch {
                expected: 5,
                actual: 9.0
            },
        }
    );
    assert_eq!(sensor.log().len(), 3);
}

#[test]
fn test_interlock_that_will_not_engage() {
    // security writes never reach the device once it sits on the new id
    let mut sensor = SimulatedSensor::new(unit(5)).with_fault(
        Fault::persistent(
            OpKind::Write,
            RegisterAddress::Security,
            TransportError::timeout(100),
        )
        .at_unit(7),
    );
    let report = run(&mut sensor, unit(5).into(), 7);
    assert_eq!(report.outcome.failed_stage(), Some(Stage::Lock));
    assert_eq!(sensor.address(), unit(7));
    assert_eq!(sensor.security_value(), 1.0);
}

#[test]
fn test_lock_acknowledged_but_still_unlocked() {
    let mut sensor = SimulatedSensor::new(unit(5)).with_lock_settling_to(1.0);
    let report = run(&mut sensor, unit(5).into(), 7);

    assert_eq!(
        report.outcome,
        WorkflowOutcome::Failure {
            stage: Stage::VerifyLock,
            error: StageError::LockNotEngaged {
                state: SecurityState::Unlocked
            },
        }
    );
    assert_eq!(attempts_of(&report, Stage::VerifyLock), Some(10));
    assert_eq!(attempts_of(&report, Stage::VerifyNewIdentity), None);

    // the run ends on the tenth security read; identity is never re-read at 7
    let last = summarize(sensor.log()).pop().unwrap();
    assert_eq!(last, (OpKind::Read, 7, Some(RegisterAddress::Security), None));
}

#[test]
fn test_lock_settles_to_garbage() {
    let mut sensor = SimulatedSensor::new(unit(5)).with_lock_settling_to(0.5);
    let report = run(&mut sensor, unit(5).into(), 7);

    assert_eq!(
        report.outcome,
        WorkflowOutcome::Failure {
            stage: Stage::VerifyLock,
            error: StageError::SecurityFault { value: 0.5 },
        }
    );
    assert_eq!(attempts_of(&report, Stage::VerifyLock), Some(1));
    let security_reads_at_new_id = sensor
        .log()
        .iter()
        .filter(|op| {
            op.kind == OpKind::Read
                && op.unit.get() == 7
                && op.register() == Some(RegisterAddress::Security)
        })
        .count();
    assert_eq!(security_reads_at_new_id, 1);
}

#[test]
fn test_short_register_reads_use_the_stage_budget() {
    let mut sensor =
        SimulatedSensor::new(unit(5)).with_truncated_reads(RegisterAddress::Security, 10);
    let report = run(&mut sensor, unit(5).into(), 7);

    assert_eq!(
        report.outcome,
        WorkflowOutcome::Failure {
            stage: Stage::ReadLock,
            error: StageError::Decode(DecodeError {
                expected: 2,
                actual: 1
            }),
        }
    );
    assert_eq!(attempts_of(&report, Stage::ReadLock), Some(10));
    assert_eq!(first_identity_write(sensor.log()), None);
}

#[test]
fn test_short_register_reads_recover() {
    let mut sensor =
        SimulatedSensor::new(unit(5)).with_truncated_reads(RegisterAddress::Security, 3);
    let report = run(&mut sensor, unit(5).into(), 7);

    assert_eq!(report.outcome.unit_id(), Some(unit(7)));
    assert_eq!(attempts_of(&report, Stage::ReadLock), Some(4));
    assert_eq!(attempts_of(&report, Stage::VerifyLock), Some(1));
}

// ============================================================================
// Discovery
// ============================================================================

#[test]
fn test_discover_then_update() {
    let mut sensor = SimulatedSensor::new(unit(42));
    let mut events = Vec::new();
    let report = IdUpdateWorkflow::new(fast())
        .with_sink(&mut events)
        .run(&mut sensor, StartingUnit::Discover, unit(7));

    assert_eq!(report.outcome.unit_id(), Some(unit(7)));
    assert_eq!(events[0], WorkflowEvent::UnitDiscovered { unit: unit(42) });

    // 43 scan reads (0..=42), then the update proper starts at 42
    let log = sensor.log();
    assert!(log[..43]
        .iter()
        .all(|op| op.kind == OpKind::Read && op.register() == Some(RegisterAddress::Identity)));
    assert_eq!(log[43].unit.get(), 42);
}

#[test]
fn test_discover_finds_the_target_id() {
    let mut sensor = SimulatedSensor::new(unit(7));
    let report = run(&mut sensor, StartingUnit::Discover, 7);

    assert_eq!(
        report.outcome,
        WorkflowOutcome::Failure {
            stage: Stage::VerifyCurrentIdentity,
            error: StageError::SameUnitId { unit: 7 },
        }
    );
    assert!(sensor.log().iter().all(|op| op.kind == OpKind::Read));
}

#[test]
fn test_discover_nothing_on_the_bus() {
    let mut sensor = SimulatedSensor::new(unit(5)).with_identity_value(9.0);
    let report = run(&mut sensor, StartingUnit::Discover, 7);

    assert_eq!(
        report.outcome,
        WorkflowOutcome::Failure {
            stage: Stage::DiscoverIdentity,
            error: StageError::IdentityNotFound(IdentityNotFound { scanned: 255 }),
        }
    );
    assert_eq!(sensor.log().len(), 255);
    assert!(report.stages.is_empty());
    assert_eq!(sensor.close_count(), 1);
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[test]
fn test_transport_closed_on_every_exit() {
    let mut ok = SimulatedSensor::new(unit(1));
    assert!(run(&mut ok, unit(1).into(), 2).outcome.is_success());
    assert_eq!(ok.close_count(), 1);
    assert!(!ok.is_connected());

    let mut failing = SimulatedSensor::new(unit(1)).with_security_value(0.25);
    assert!(!run(&mut failing, unit(1).into(), 2).outcome.is_success());
    assert_eq!(failing.close_count(), 1);
    assert!(!failing.is_connected());
}

#[test]
fn test_boxed_transport() {
    let transport: Box<dyn ModbusTransport> = Box::new(SimulatedSensor::new(unit(8)));
    let outcome = IdUpdateWorkflow::new(fast())
        .run(transport, unit(8).into(), unit(9))
        .outcome;
    assert!(outcome.is_success());
}
