//! Start/stop/restart control of the worker pool.
//!
//! Every invocation is independent: the PID file is the only state shared
//! between them. Liveness is decided per operation by [`is_alive`], which
//! copes with the pool being either a child of this process (started in the
//! same invocation) or an unrelated process (started by an earlier one).
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::{
        signal::{self, Signal},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Uid,
};
use strum_macros::{AsRefStr, EnumString};
use tracing::{debug, error, info, warn};

use crate::{
    error::{PidFileError, PoolError, ProcessError},
    pid::{Pid, PidFactory},
    privilege,
    runner::{Execution, Mode, RunnerFactory},
};

/// Upper bound on liveness re-checks while waiting for the pool to stop.
pub const MAX_POLL_COUNT: u32 = 1000;

/// Default time allowed for the pool to exit after the stop signal, in microseconds.
pub const DEFAULT_WAIT_TIMEOUT_MICROS: u64 = 20_000_000;

/// Signal asking the pool to shut down gracefully.
pub const DEFAULT_STOP_SIGNAL: Signal = Signal::SIGUSR1;

/// Operator actions understood by [`PoolControl::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    /// Launch the pool.
    Start,
    /// Signal the pool and wait for it to exit.
    Stop,
    /// Stop, then start.
    Restart,
}

/// Result of a successful control step, printed to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// The pool was launched with this PID.
    Started {
        /// PID of the new pool.
        pid: u32,
    },
    /// The pool with this PID exited after the stop signal.
    Stopped {
        /// PID of the stopped pool.
        pid: i32,
    },
    /// Stop found nothing to do.
    NotRunning,
}

impl fmt::Display for ControlOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlOutcome::Started { pid } => write!(f, "Pool started (PID {pid})"),
            ControlOutcome::Stopped { pid } => write!(f, "Pool stopped (PID {pid})"),
            ControlOutcome::NotRunning => f.write_str("The pool was not running"),
        }
    }
}

/// Controls the lifecycle of the single pool process.
#[derive(Debug, Clone)]
pub struct PoolControl {
    runner_factory: RunnerFactory,
    pid_factory: PidFactory,
    pool_pid_file: PathBuf,
    pool_command: String,
    allow_root: bool,
    wait_timeout: Duration,
    stop_signal: Signal,
    uid: Uid,
}

impl PoolControl {
    /// Creates a controller for the pool whose PID lives at `pool_pid_file`.
    ///
    /// Root launches are refused, the stop signal is `SIGUSR1` and the wait
    /// timeout is 20 seconds until overridden.
    pub fn new(
        runner_factory: RunnerFactory,
        pid_factory: PidFactory,
        pool_pid_file: impl Into<PathBuf>,
        pool_command: impl Into<String>,
    ) -> Self {
        Self {
            runner_factory,
            pid_factory,
            pool_pid_file: pool_pid_file.into(),
            pool_command: pool_command.into(),
            allow_root: false,
            wait_timeout: Duration::from_micros(DEFAULT_WAIT_TIMEOUT_MICROS),
            stop_signal: DEFAULT_STOP_SIGNAL,
            uid: privilege::current_uid(),
        }
    }

    /// Permits or forbids launching the pool as root.
    pub fn with_allow_root(mut self, allow_root: bool) -> Self {
        self.allow_root = allow_root;
        self
    }

    /// Sets how long stop waits for the pool to exit.
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Sets the signal used to request a graceful shutdown.
    pub fn with_stop_signal(mut self, stop_signal: Signal) -> Self {
        self.stop_signal = stop_signal;
        self
    }

    /// Overrides the user the privilege check is evaluated for.
    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.uid = uid;
        self
    }

    /// Path of the pool PID file.
    pub fn pool_pid_file(&self) -> &Path {
        &self.pool_pid_file
    }

    /// Runs the named action, handing each outcome to `report` as it happens.
    /// Unrecognised actions do nothing.
    pub fn execute(
        &self,
        action: &str,
        mut report: impl FnMut(&ControlOutcome),
    ) -> Result<(), PoolError> {
        let Ok(action) = Action::from_str(action) else {
            debug!("Ignoring unrecognised action '{action}'");
            return Ok(());
        };

        match action {
            Action::Start => report(&self.start()?),
            Action::Stop => report(&self.stop()?),
            Action::Restart => self.restart(report)?,
        }
        Ok(())
    }

    /// Stops the pool, then starts it again. A failed stop skips the start.
    ///
    /// The stop outcome is reported before the start is attempted.
    pub fn restart(&self, mut report: impl FnMut(&ControlOutcome)) -> Result<(), PoolError> {
        report(&self.stop()?);
        report(&self.start()?);
        Ok(())
    }

    /// Sends the stop signal and waits up to the wait timeout for the pool to exit.
    ///
    /// Does nothing when the pool is not running. A pool that ignores the
    /// signal is left running and reported as [`ProcessError::StopTimeout`].
    pub fn stop(&self) -> Result<ControlOutcome, PoolError> {
        let Some(pid) = self.running_pid()? else {
            info!("The pool was not running");
            return Ok(ControlOutcome::NotRunning);
        };

        let signal_name = self.stop_signal.as_str();
        info!("Stopping pool PID {} with {signal_name}", pid.pid());
        match signal::kill(pid.as_nix(), self.stop_signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                debug!("Pool PID {} exited before {signal_name} was sent", pid.pid());
                return Ok(ControlOutcome::Stopped { pid: pid.pid() });
            }
            Err(source) => {
                error!("Could not send {signal_name} to PID {}: {source}", pid.pid());
                return Err(ProcessError::Signal {
                    pid: pid.pid(),
                    signal: signal_name.to_string(),
                    source,
                }
                .into());
            }
        }

        let interval = self.wait_timeout / MAX_POLL_COUNT;
        let started = Instant::now();
        let mut polls = 0;
        loop {
            thread::sleep(interval);
            polls += 1;

            if !is_alive(&pid) {
                info!("Pool PID {} stopped after {:?}", pid.pid(), started.elapsed());
                return Ok(ControlOutcome::Stopped { pid: pid.pid() });
            }

            if polls >= MAX_POLL_COUNT {
                let waited = started.elapsed();
                error!("Pool PID {} still running after {waited:?}", pid.pid());
                return Err(ProcessError::StopTimeout {
                    pid: pid.pid(),
                    waited,
                }
                .into());
            }
        }
    }

    /// Launches the pool in the background through a console runner.
    ///
    /// Fails if running as a forbidden root user or if the pool is already
    /// alive; neither case spawns anything.
    pub fn start(&self) -> Result<ControlOutcome, PoolError> {
        privilege::ensure_may_launch(self.uid, self.allow_root)?;

        if let Some(pid) = self.running_pid()? {
            warn!("Pool already running with PID {}", pid.pid());
            return Err(ProcessError::AlreadyRunning { pid: pid.pid() }.into());
        }

        let runner = self.runner_factory.create_runner(
            "console",
            Some(self.pool_pid_file.clone()),
            1,
        )?;
        let pid = match runner.execute(&self.pool_command, Mode::Background)? {
            Execution::Detached { pid, .. } => pid,
            Execution::Finished(summary) => summary.last_pid,
        };

        info!("Pool started with PID {pid}");
        Ok(ControlOutcome::Started { pid })
    }

    /// Whether the PID file names a live process.
    ///
    /// A missing or unparsable PID file means "not running".
    pub fn is_pool_running(&self) -> Result<bool, PoolError> {
        Ok(self.running_pid()?.is_some())
    }

    /// Reads the PID file afresh and keeps the PID only if that process is alive.
    fn running_pid(&self) -> Result<Option<Pid>, PidFileError> {
        let pid = match self.pid_factory.create(&self.pool_pid_file) {
            Ok(pid) => pid,
            Err(err) if err.is_absent_or_corrupt() => {
                debug!("Treating pool as not running: {err}");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        Ok(is_alive(&pid).then_some(pid))
    }
}

/// Whether `pid` names a live process.
///
/// A non-blocking reap answers for our own children (and reaps them if they
/// have exited). For anything else a null signal probes for existence; a
/// process we may not signal still exists.
pub fn is_alive(pid: &Pid) -> bool {
    match waitpid(pid.as_nix(), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => true,
        Ok(status) => {
            debug!("Reaped PID {}: {status:?}", pid.pid());
            false
        }
        Err(_) => match signal::kill(pid.as_nix(), None) {
            Ok(()) => !is_zombie(pid.pid()),
            Err(Errno::EPERM) => true,
            Err(_) => false,
        },
    }
}

/// A zombie still answers signals but has already exited.
#[cfg(target_os = "linux")]
fn is_zombie(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };

    // The state field follows the parenthesised command name.
    stat.rfind(')')
        .and_then(|end| stat[end + 1..].trim_start().chars().next())
        .is_some_and(|state| state == 'Z' || state == 'X')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: i32) -> bool {
    false
}
