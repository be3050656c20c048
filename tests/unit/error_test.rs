//! Tests for error types

use std::time::Duration;

use prometheus_singleton_cron::core::{LockError, SchedulerError, StoreError};
use prometheus_singleton_cron::infra::AlertError;
use prometheus_singleton_cron::single_flight::FlightError;

#[test]
fn test_acquisition_failed_error() {
    let err = LockError::AcquisitionFailed {
        key: "cron_sync20260314093000".to_string(),
    };
    assert_eq!(format!("{}", err), "lock acquisition failed: cron_sync20260314093000");
    assert!(err.is_contention());
}

#[test]
fn test_task_still_running_is_not_contention() {
    let err = LockError::TaskStillRunning {
        key: "exec_sync".to_string(),
    };
    assert_eq!(format!("{}", err), "task still running: exec_sync");
    assert!(!err.is_contention());
}

#[test]
fn test_spin_timeout_error() {
    let err = LockError::SpinLockTimeout(Duration::from_secs(2));
    assert_eq!(format!("{}", err), "spin lock timeout after 2s");
}

#[test]
fn test_store_error_converts_into_lock_error() {
    let err: LockError = StoreError::Unavailable("connection refused".to_string()).into();
    assert_eq!(format!("{}", err), "store error: store unavailable: connection refused");
}

#[test]
fn test_scheduler_errors() {
    let err = SchedulerError::DuplicateEntry("daily-report".to_string());
    assert_eq!(format!("{}", err), "duplicate entry: daily-report");

    let err = SchedulerError::InvalidConfig("bad".to_string());
    assert_eq!(format!("{}", err), "invalid config: bad");
}

#[test]
fn test_alert_errors() {
    assert_eq!(format!("{}", AlertError::Status(502)), "alert rejected with status 502");
    assert_eq!(format!("{}", AlertError::NotConfigured), "alert destination not configured");
}

#[test]
fn test_flight_errors() {
    let err: FlightError<String> = FlightError::Failed("upstream down".to_string());
    assert_eq!(format!("{}", err), "upstream down");
    assert!(!err.is_panic());

    let err: FlightError<String> = FlightError::AbnormalExit;
    assert_eq!(format!("{}", err), "call exited abnormally");
}
