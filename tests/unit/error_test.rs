//! Tests for error types

use prometheus_processing_unit::core::{JobError, TaskError, UnitError, UnitState};

#[test]
fn test_unit_error_messages() {
    assert_eq!(
        UnitError::Config("queue_capacity must be greater than 0".into()).to_string(),
        "invalid configuration: queue_capacity must be greater than 0"
    );
    assert_eq!(UnitError::NotRunning.to_string(), "unit is not running");
    assert_eq!(UnitError::QueueClosed.to_string(), "admission queue closed");
    assert_eq!(UnitError::QueueFull.to_string(), "admission queue full");
    assert_eq!(UnitError::AlreadyStarted.to_string(), "unit already started");
    assert_eq!(
        UnitError::InvalidState(UnitState::Stopped).to_string(),
        "invalid unit state: Stopped"
    );
    assert_eq!(
        UnitError::LoopFault("completion for unknown job 9".into()).to_string(),
        "dispatch loop fault: completion for unknown job 9"
    );
}

#[test]
fn test_task_error_keeps_context_chain() {
    let err = TaskError::Failed(anyhow::anyhow!("socket reset").context("fetch failed"));
    assert_eq!(err.to_string(), "task failed: fetch failed: socket reset");

    let panicked = TaskError::Panicked("index out of bounds".into());
    assert_eq!(panicked.to_string(), "task panicked: index out of bounds");
}

#[test]
fn test_job_error_is_transparent_over_task_error() {
    let err: JobError = TaskError::Panicked("boom".into()).into();
    assert_eq!(err.to_string(), "task panicked: boom");
    assert!(!err.is_cancelled());

    assert!(JobError::Cancelled.is_cancelled());
    assert_eq!(JobError::Timeout.to_string(), "timed out waiting for job");
}

#[test]
fn test_unit_error_converts_into_anyhow() {
    fn submit_like() -> prometheus_processing_unit::core::AppResult<()> {
        Err(UnitError::QueueFull.into())
    }
    let err = submit_like().unwrap_err();
    assert_eq!(err.downcast_ref::<UnitError>(), Some(&UnitError::QueueFull));
}
