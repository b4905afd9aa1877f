#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use nix::sys::{
    signal::{self, Signal},
    wait::waitpid,
};
use poolctl::{control::PoolControl, pid::PidFactory, runner::RunnerFactory};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// Shell used as the console entry point in tests; the pool "command" is a script path.
pub const CONSOLE: &str = "/bin/sh";

/// Writes a pool script that exits on SIGUSR1, or ignores it when `cooperative` is false.
pub fn write_pool_script(dir: &Path, cooperative: bool) -> PathBuf {
    let (name, trap) = if cooperative {
        ("pool.sh", "trap 'exit 0' USR1")
    } else {
        ("stubborn_pool.sh", "trap '' USR1")
    };
    let path = dir.join(name);
    fs::write(&path, format!("{trap}\nwhile :; do sleep 0.1; done\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A controller for `script` whose PID file lives in `dir`.
pub fn pool_control(dir: &Path, script: &Path, wait_timeout: Duration) -> PoolControl {
    let mut factory = RunnerFactory::new(PidFactory::new(), CONSOLE);
    let empty: [&str; 0] = [];
    factory.modify_descriptor_spec(0, &["null"]).unwrap();
    factory.modify_descriptor_spec(1, &empty).unwrap();
    factory.modify_descriptor_spec(2, &empty).unwrap();

    PoolControl::new(
        factory,
        PidFactory::new(),
        dir.join("pool.pid"),
        script.display().to_string(),
    )
    .with_allow_root(true)
    .with_wait_timeout(wait_timeout)
}

/// Writes a YAML config for `script` and returns its path.
pub fn write_config(dir: &Path, script: &Path, wait_timeout_micros: u64) -> PathBuf {
    let path = dir.join("poolctl.yaml");
    fs::write(
        &path,
        format!(
            r#"
pool:
  pid_file: run/pool.pid
  command: "{script}"
  allow_root: true
  wait_timeout: {wait_timeout_micros}
runner:
  console_path: {CONSOLE}
  descriptors:
    0: ["null"]
    1: ["null"]
    2: ["null"]
"#,
            script = script.display()
        ),
    )
    .unwrap();
    path
}

pub fn read_pid(path: &Path) -> u32 {
    fs::read_to_string(path)
        .unwrap()
        .trim()
        .parse()
        .expect("PID file should hold a number")
}

pub fn wait_for_pid_file(path: &Path) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path)
            && let Ok(pid) = content.trim().parse::<u32>()
        {
            return pid;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for a PID in {:?}", path);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

/// Whether `pid` is a live, non-zombie process.
pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|process| process.status() != ProcessStatus::Zombie)
}

pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for PID {} to exit", pid);
}

/// Kills every tracked process on drop so failing tests do not leak pools.
#[derive(Default)]
pub struct ProcessGuard {
    pids: Vec<u32>,
}

impl ProcessGuard {
    pub fn track(&mut self, pid: u32) {
        self.pids.push(pid);
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        for pid in &self.pids {
            if !is_process_alive(*pid) {
                continue;
            }
            let target = nix::unistd::Pid::from_raw(*pid as i32);
            if signal::kill(target, Signal::SIGKILL).is_ok() {
                // Reaps our own children; returns ECHILD immediately for anything else.
                let _ = waitpid(target, None);
            }
        }
    }
}
