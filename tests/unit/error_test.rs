//! Tests for error types

use prometheus_task_lot::core::{SchedulerError, TaskStatus};
use prometheus_task_lot::util::TaskId;

#[test]
fn test_activity_not_found_error() {
    let err = SchedulerError::ActivityNotFound("send-email".to_string());
    assert_eq!(format!("{}", err), "activity not found: send-email");
}

#[test]
fn test_stale_task_error() {
    let err = SchedulerError::StaleTask(TaskId::from("t-1"));
    assert_eq!(format!("{}", err), "stale task t-1: updated since it was read");
}

#[test]
fn test_invalid_transition_error() {
    let err = SchedulerError::InvalidTransition {
        id: TaskId::from("t-2"),
        from: TaskStatus::Finished,
        to: TaskStatus::Running,
    };
    assert_eq!(
        format!("{}", err),
        "invalid transition for task t-2: FINISHED -> RUNNING"
    );
}

#[test]
fn test_storage_error() {
    let err = SchedulerError::storage("connection refused");
    assert_eq!(format!("{}", err), "storage unavailable: connection refused");
}

#[test]
fn test_serialization_error_converts() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: SchedulerError = json_err.into();
    assert!(matches!(err, SchedulerError::Serialization(_)));
}
