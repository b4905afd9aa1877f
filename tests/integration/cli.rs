//! End-to-end tests driving the `poolctl` binary.

#[path = "common/mod.rs"]
mod common;

use assert_cmd::cargo::cargo_bin_cmd;
use common::{
    ProcessGuard, is_process_alive, wait_for_pid_file, wait_for_process_exit,
    write_config, write_pool_script,
};
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::tempdir;

#[test]
fn stop_without_pool_reports_not_running() {
    let temp = tempdir().unwrap();
    let script = write_pool_script(temp.path(), true);
    let config = write_config(temp.path(), &script, 5_000_000);

    cargo_bin_cmd!("poolctl")
        .arg("--config")
        .arg(&config)
        .arg("stop")
        .assert()
        .success()
        .stdout(contains("The pool was not running"));
}

#[test]
fn unknown_action_is_a_silent_no_op() {
    let temp = tempdir().unwrap();
    let script = write_pool_script(temp.path(), true);
    let config = write_config(temp.path(), &script, 5_000_000);

    cargo_bin_cmd!("poolctl")
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    assert!(!temp.path().join("run/pool.pid").exists());
}

#[test]
fn missing_config_fails() {
    let temp = tempdir().unwrap();

    cargo_bin_cmd!("poolctl")
        .arg("--config")
        .arg(temp.path().join("absent.yaml"))
        .arg("start")
        .assert()
        .failure()
        .stderr(contains("Failed to read config file"));
}

#[test]
fn start_and_stop_detached_pool() {
    let temp = tempdir().unwrap();
    let script = write_pool_script(temp.path(), true);
    let config = write_config(temp.path(), &script, 5_000_000);
    let pid_file = temp.path().join("run/pool.pid");
    let mut guard = ProcessGuard::default();

    cargo_bin_cmd!("poolctl")
        .arg("--config")
        .arg(&config)
        .arg("start")
        .assert()
        .success()
        .stdout(contains("Pool started"));

    let pid = wait_for_pid_file(&pid_file);
    guard.track(pid);
    assert!(is_process_alive(pid), "pool should outlive the start command");

    cargo_bin_cmd!("poolctl")
        .arg("--config")
        .arg(&config)
        .arg("start")
        .assert()
        .failure()
        .stderr(contains("already running"));

    cargo_bin_cmd!("poolctl")
        .arg("--config")
        .arg(&config)
        .arg("stop")
        .assert()
        .success()
        .stdout(contains("Pool stopped"));

    wait_for_process_exit(pid);
}

#[test]
fn stubborn_pool_makes_stop_fail() {
    let temp = tempdir().unwrap();
    let script = write_pool_script(temp.path(), false);
    let config = write_config(temp.path(), &script, 300_000);
    let pid_file = temp.path().join("run/pool.pid");
    let mut guard = ProcessGuard::default();

    cargo_bin_cmd!("poolctl")
        .arg("--config")
        .arg(&config)
        .arg("start")
        .assert()
        .success();

    let pid = wait_for_pid_file(&pid_file);
    guard.track(pid);

    cargo_bin_cmd!("poolctl")
        .arg("--config")
        .arg(&config)
        .arg("stop")
        .assert()
        .failure()
        .stderr(contains("Could not stop the pool"));

    assert!(is_process_alive(pid));
}

#[test]
fn root_start_requires_opt_in() {
    if !nix::unistd::getuid().is_root() {
        return;
    }

    let temp = tempdir().unwrap();
    let script = write_pool_script(temp.path(), true);
    let config = write_config(temp.path(), &script, 5_000_000);
    let yaml = std::fs::read_to_string(&config)
        .unwrap()
        .replace("allow_root: true", "allow_root: false");
    std::fs::write(&config, yaml).unwrap();

    cargo_bin_cmd!("poolctl")
        .arg("--config")
        .arg(&config)
        .arg("start")
        .assert()
        .failure()
        .stderr(contains("root"));

    assert!(!temp.path().join("run/pool.pid").exists());
}
