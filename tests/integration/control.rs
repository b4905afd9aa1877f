//! Integration tests covering the start/stop/restart control protocol.

#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    process::Command,
    time::{Duration, Instant},
};

use common::{
    ProcessGuard, is_process_alive, pool_control, read_pid, write_pool_script,
};
use poolctl::{
    control::ControlOutcome,
    error::{PoolError, ProcessError},
};
use tempfile::tempdir;

#[test]
fn start_then_stop_round_trip() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let script = write_pool_script(dir, true);
    let control = pool_control(dir, &script, Duration::from_secs(5));
    let mut guard = ProcessGuard::default();

    assert!(!control.is_pool_running().unwrap());

    let ControlOutcome::Started { pid } = control.start().unwrap() else {
        panic!("expected the pool to start");
    };
    guard.track(pid);

    assert_eq!(read_pid(control.pool_pid_file()), pid);
    assert!(control.is_pool_running().unwrap());
    assert!(is_process_alive(pid));

    assert_eq!(
        control.stop().unwrap(),
        ControlOutcome::Stopped { pid: pid as i32 }
    );
    assert!(!control.is_pool_running().unwrap());
    assert!(!is_process_alive(pid));
}

#[test]
fn second_start_fails_without_spawning() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let script = write_pool_script(dir, true);
    let control = pool_control(dir, &script, Duration::from_secs(5));
    let mut guard = ProcessGuard::default();

    let ControlOutcome::Started { pid } = control.start().unwrap() else {
        panic!("expected the pool to start");
    };
    guard.track(pid);

    let err = control.start().unwrap_err();
    assert!(matches!(
        err,
        PoolError::Process(ProcessError::AlreadyRunning { pid: running }) if running == pid as i32
    ));
    assert_eq!(read_pid(control.pool_pid_file()), pid);

    control.stop().unwrap();
}

#[test]
fn stop_times_out_and_leaves_stubborn_pool_running() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let script = write_pool_script(dir, false);
    let control = pool_control(dir, &script, Duration::from_millis(300));
    let mut guard = ProcessGuard::default();

    let ControlOutcome::Started { pid } = control.start().unwrap() else {
        panic!("expected the pool to start");
    };
    guard.track(pid);

    let started = Instant::now();
    let err = control.stop().unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(
        err,
        PoolError::Process(ProcessError::StopTimeout { .. })
    ));
    assert!(elapsed >= Duration::from_millis(300), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "waited {elapsed:?}");
    assert!(is_process_alive(pid));
    assert!(control.is_pool_running().unwrap());
}

#[test]
fn restart_never_starts_when_stop_fails() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let script = write_pool_script(dir, false);
    let control = pool_control(dir, &script, Duration::from_millis(200));
    let mut guard = ProcessGuard::default();

    let ControlOutcome::Started { pid } = control.start().unwrap() else {
        panic!("expected the pool to start");
    };
    guard.track(pid);

    let mut outcomes = Vec::new();
    let err = control
        .restart(|outcome| outcomes.push(*outcome))
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::Process(ProcessError::StopTimeout { .. })
    ));
    assert!(outcomes.is_empty());
    assert_eq!(read_pid(control.pool_pid_file()), pid);
}

#[test]
fn restart_replaces_the_running_pool() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let script = write_pool_script(dir, true);
    let control = pool_control(dir, &script, Duration::from_secs(5));
    let mut guard = ProcessGuard::default();

    let ControlOutcome::Started { pid: first } = control.start().unwrap() else {
        panic!("expected the pool to start");
    };
    guard.track(first);

    let mut outcomes = Vec::new();
    control
        .execute("restart", |outcome| outcomes.push(*outcome))
        .unwrap();
    let [ControlOutcome::Stopped { pid: stopped }, ControlOutcome::Started { pid: second }] =
        outcomes[..]
    else {
        panic!("unexpected restart outcomes: {outcomes:?}");
    };
    guard.track(second);

    assert_eq!(stopped, first as i32);
    assert_ne!(second, first);
    assert_eq!(read_pid(control.pool_pid_file()), second);
    assert!(!is_process_alive(first));
    assert!(control.is_pool_running().unwrap());

    control.stop().unwrap();
}

#[test]
fn restart_of_stopped_pool_just_starts() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let script = write_pool_script(dir, true);
    let control = pool_control(dir, &script, Duration::from_secs(5));
    let mut guard = ProcessGuard::default();

    let mut outcomes = Vec::new();
    control.restart(|outcome| outcomes.push(*outcome)).unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0], ControlOutcome::NotRunning);
    let ControlOutcome::Started { pid } = outcomes[1] else {
        panic!("expected the pool to start");
    };
    guard.track(pid);

    control.stop().unwrap();
}

#[test]
fn stale_pid_file_is_not_running_and_is_replaced_on_start() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let script = write_pool_script(dir, true);
    let control = pool_control(dir, &script, Duration::from_secs(5));
    let mut guard = ProcessGuard::default();

    let mut finished = Command::new("true").spawn().unwrap();
    let stale = finished.id();
    finished.wait().unwrap();
    fs::write(control.pool_pid_file(), format!("{stale}\n")).unwrap();

    assert!(!control.is_pool_running().unwrap());
    assert_eq!(control.stop().unwrap(), ControlOutcome::NotRunning);

    let ControlOutcome::Started { pid } = control.start().unwrap() else {
        panic!("expected the pool to start");
    };
    guard.track(pid);
    assert_eq!(read_pid(control.pool_pid_file()), pid);

    control.stop().unwrap();
}

#[test]
fn live_process_that_is_not_our_child_counts_as_running() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let script = write_pool_script(dir, true);
    let control = pool_control(dir, &script, Duration::from_secs(5));

    // The test process itself cannot be reaped by itself, so only the signal probe can see it.
    fs::write(control.pool_pid_file(), std::process::id().to_string()).unwrap();
    assert!(control.is_pool_running().unwrap());

    let err = control.start().unwrap_err();
    assert!(matches!(
        err,
        PoolError::Process(ProcessError::AlreadyRunning { .. })
    ));
}

#[test]
fn corrupt_pid_file_is_treated_as_not_running() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let script = write_pool_script(dir, true);
    let control = pool_control(dir, &script, Duration::from_secs(5));

    fs::write(control.pool_pid_file(), "garbage").unwrap();
    assert!(!control.is_pool_running().unwrap());
    assert_eq!(control.stop().unwrap(), ControlOutcome::NotRunning);
    assert_eq!(fs::read_to_string(control.pool_pid_file()).unwrap(), "garbage");
}
