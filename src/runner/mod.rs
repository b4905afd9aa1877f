//! Subprocess runners.
//!
//! A [`Runner`] spawns one managed command, wires its standard streams per a
//! [`DescriptorSpec`], records its PID and, when allowed more than one run,
//! re-spawns it after abnormal exits. Runners are built by
//! [`RunnerFactory`], which owns the mutable configuration.
#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;
use std::{
    env, fmt, fs,
    io::{self, BufRead, BufReader, Read},
    os::unix::{fs::PermissionsExt, process::CommandExt},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus},
    thread,
    time::{Duration, Instant},
};

use nix::sys::signal::{self, Signal};
use tracing::{debug, error, info, warn};

use crate::{error::ProcessError, pid::PidFactory};

pub mod descriptor;
pub mod factory;

pub use descriptor::{DescriptorSpec, Directive, FileMode, PipeMode, Stream};
pub use factory::RunnerFactory;

/// Default cap on a single invocation, in microseconds (one hour).
pub const DEFAULT_PROCESS_TIMEOUT_MICROS: u64 = 3_600_000_000;

/// Default cap on waiting for a requested exit, in microseconds (20 seconds).
pub const DEFAULT_WAIT_TIMEOUT_MICROS: u64 = 20_000_000;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether the caller blocks on the managed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Block until the command stops being re-run.
    Foreground,
    /// Return as soon as the PID has been recorded.
    Background,
}

/// The closed set of runner variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerKind {
    /// Runs the command line as given.
    Process,
    /// Runs the command as a sub-command of a console entry point.
    Console {
        /// Path of the console binary prefixed to every command.
        console_path: PathBuf,
    },
}

/// Snapshot of the factory configuration a runner was built with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Standard-stream wiring.
    pub descriptors: DescriptorSpec,
    /// Hard cap on a single invocation.
    pub process_timeout: Duration,
    /// Cap on waiting for a requested graceful exit.
    pub wait_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            descriptors: DescriptorSpec::default(),
            process_timeout: Duration::from_micros(DEFAULT_PROCESS_TIMEOUT_MICROS),
            wait_timeout: Duration::from_micros(DEFAULT_WAIT_TIMEOUT_MICROS),
        }
    }
}

/// How a single invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited with the given status code.
    Exited(i32),
    /// The process was terminated by the given signal.
    Signalled(i32),
    /// The process outlived the process timeout and was terminated by the runner.
    TimedOut,
}

impl RunOutcome {
    /// Only a zero exit code counts as success.
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Exited(0))
    }

    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => RunOutcome::Exited(code),
            (None, Some(signal)) => RunOutcome::Signalled(signal),
            (None, None) => RunOutcome::Exited(-1),
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Exited(code) => write!(f, "exited with status {code}"),
            RunOutcome::Signalled(signal) => write!(f, "terminated by signal {signal}"),
            RunOutcome::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Result of a runner that has finished re-invoking its command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Number of invocations performed.
    pub runs: u32,
    /// PID of the last invocation.
    pub last_pid: u32,
    /// How the last invocation ended.
    pub last: RunOutcome,
}

/// What [`Runner::execute`] handed back.
#[derive(Debug)]
pub enum Execution {
    /// Foreground run that has completed.
    Finished(RunSummary),
    /// Background run; the process is still owned by the OS, not the caller.
    Detached {
        /// PID of the first invocation.
        pid: u32,
        /// Respawn loop, present when the runner may run more than once.
        supervisor: Option<thread::JoinHandle<Result<RunSummary, ProcessError>>>,
    },
}

impl Execution {
    /// Waits for the respawn loop, if any, and returns the final summary.
    ///
    /// A detached run without a supervisor has nothing to wait for and yields
    /// `None`.
    pub fn join(self) -> Result<Option<RunSummary>, ProcessError> {
        match self {
            Execution::Finished(summary) => Ok(Some(summary)),
            Execution::Detached {
                supervisor: None, ..
            } => Ok(None),
            Execution::Detached {
                pid,
                supervisor: Some(supervisor),
            } => match supervisor.join() {
                Ok(result) => result.map(Some),
                Err(_) => {
                    error!("Supervisor of PID {pid} panicked");
                    Err(ProcessError::SupervisorPanicked { pid })
                }
            },
        }
    }
}

/// Spawns and supervises a single managed command.
#[derive(Debug, Clone)]
pub struct Runner {
    kind: RunnerKind,
    config: RunnerConfig,
    pid_factory: PidFactory,
    pid_file: Option<PathBuf>,
    max_run_count: u32,
}

impl Runner {
    pub(crate) fn new(
        kind: RunnerKind,
        config: RunnerConfig,
        pid_factory: PidFactory,
        pid_file: Option<PathBuf>,
        max_run_count: u32,
    ) -> Self {
        Self {
            kind,
            config,
            pid_factory,
            pid_file,
            max_run_count,
        }
    }

    /// Variant of this runner.
    pub fn kind(&self) -> &RunnerKind {
        &self.kind
    }

    /// Configuration snapshot taken at construction.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Where the spawned PID is recorded, if anywhere.
    pub fn pid_file(&self) -> Option<&Path> {
        self.pid_file.as_deref()
    }

    /// Maximum total invocations; 0 and 1 both mean a single run.
    pub fn max_run_count(&self) -> u32 {
        self.max_run_count
    }

    /// The shell command line this runner would execute for `command`.
    pub fn command_line(&self, command: &str) -> String {
        match &self.kind {
            RunnerKind::Process => command.to_string(),
            RunnerKind::Console { console_path } => {
                format!("{} {command}", shell_quote(&console_path.to_string_lossy()))
            }
        }
    }

    /// Spawns `command` and, in foreground mode, supervises it to completion.
    ///
    /// The PID of every invocation is written to the PID file before control
    /// returns to a background caller.
    pub fn execute(&self, command: &str, mode: Mode) -> Result<Execution, ProcessError> {
        let command_line = self.command_line(command);
        let background = mode == Mode::Background;

        self.check_console(&command_line)?;
        let child = self.spawn(&command_line, background)?;
        let pid = child.id();

        if !background {
            return self
                .supervise(&command_line, child, false)
                .map(Execution::Finished);
        }

        if self.max_runs() <= 1 {
            info!("Started `{command_line}` in the background with PID {pid}");
            // Dropping the handle neither kills nor reaps the child.
            drop(child);
            return Ok(Execution::Detached {
                pid,
                supervisor: None,
            });
        }

        info!(
            "Started `{command_line}` in the background with PID {pid}; supervising up to {} runs",
            self.max_runs()
        );
        let runner = self.clone();
        let supervisor =
            thread::spawn(move || runner.supervise(&command_line, child, true));
        Ok(Execution::Detached {
            pid,
            supervisor: Some(supervisor),
        })
    }

    /// The shell would report a missing console only as exit status 127, after
    /// the PID has been recorded, so it is looked up before spawning.
    fn check_console(&self, command_line: &str) -> Result<(), ProcessError> {
        let RunnerKind::Console { console_path } = &self.kind else {
            return Ok(());
        };
        if find_executable(console_path).is_some() {
            return Ok(());
        }

        error!("Console entry point {console_path:?} is not an executable file");
        Err(ProcessError::Spawn {
            command: command_line.to_string(),
            source: io::Error::new(
                io::ErrorKind::NotFound,
                format!("console entry point {console_path:?} is not an executable file"),
            ),
        })
    }

    fn max_runs(&self) -> u32 {
        self.max_run_count.max(1)
    }

    fn supervise(
        &self,
        command_line: &str,
        first: Child,
        background: bool,
    ) -> Result<RunSummary, ProcessError> {
        let max_runs = self.max_runs();
        let mut child = first;
        let mut runs = 1;

        loop {
            let pid = child.id();
            let last = self.await_exit(child)?;
            let summary = RunSummary {
                runs,
                last_pid: pid,
                last,
            };

            if last.is_success() {
                debug!("`{command_line}` (PID {pid}) completed after {runs} run(s)");
                return Ok(summary);
            }

            if runs >= max_runs {
                if max_runs > 1 {
                    error!("`{command_line}` {last}; giving up after {runs} run(s)");
                } else {
                    warn!("`{command_line}` (PID {pid}) {last}");
                }
                return Ok(summary);
            }

            warn!("`{command_line}` (PID {pid}) {last}; respawning (run {} of {max_runs})", runs + 1);
            child = self.spawn(command_line, background)?;
            runs += 1;
        }
    }

    fn spawn(&self, command_line: &str, background: bool) -> Result<Child, ProcessError> {
        let spawn_err = |source: io::Error| ProcessError::Spawn {
            command: command_line.to_string(),
            source,
        };

        let descriptors = &self.config.descriptors;
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("exec {command_line}"));
        cmd.stdin(descriptors.stdio(Stream::Stdin, background).map_err(spawn_err)?)
            .stdout(descriptors.stdio(Stream::Stdout, background).map_err(spawn_err)?)
            .stderr(descriptors.stdio(Stream::Stderr, background).map_err(spawn_err)?);

        if background {
            unsafe {
                cmd.pre_exec(|| {
                    // Detach from the controller's session so the child survives it.
                    if libc::setsid() < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        debug!("Executing command: {cmd:?}");
        let mut child = cmd.spawn().map_err(|source| {
            error!("Failed to start `{command_line}`: {source}");
            spawn_err(source)
        })?;
        let pid = child.id();

        // Nothing feeds a piped stdin; closing it hands the child EOF.
        drop(child.stdin.take());
        if let Some(out) = child.stdout.take() {
            forward_output(pid, Stream::Stdout, out);
        }
        if let Some(err) = child.stderr.take() {
            forward_output(pid, Stream::Stderr, err);
        }

        if let Some(path) = &self.pid_file
            && let Err(err) = self.pid_factory.write(path, pid)
        {
            error!("Failed to record PID {pid} for `{command_line}`: {err}");
            let _ = child.kill();
            let _ = child.wait();
            return Err(err.into());
        }

        debug!("`{command_line}` started with PID {pid}");
        Ok(child)
    }

    fn await_exit(&self, mut child: Child) -> Result<RunOutcome, ProcessError> {
        let pid = child.id();
        let wait_err = |source| ProcessError::Wait { pid, source };

        if let Some(status) =
            wait_with_timeout(&mut child, self.config.process_timeout).map_err(wait_err)?
        {
            return Ok(RunOutcome::from_status(status));
        }

        warn!(
            "PID {pid} exceeded the process timeout of {:?}; sending SIGTERM",
            self.config.process_timeout
        );
        let target = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(err) = signal::kill(target, Signal::SIGTERM) {
            debug!("SIGTERM to PID {pid} failed: {err}");
        }

        if wait_with_timeout(&mut child, self.config.wait_timeout)
            .map_err(wait_err)?
            .is_none()
        {
            warn!(
                "PID {pid} did not exit within {:?} of SIGTERM; sending SIGKILL",
                self.config.wait_timeout
            );
            if let Err(err) = child.kill() {
                debug!("SIGKILL to PID {pid} failed: {err}");
            }
            child.wait().map_err(wait_err)?;
        }

        Ok(RunOutcome::TimedOut)
    }
}

/// Wait for a child process with a timeout, returning `Ok(None)` on timeout.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                thread::sleep(EXIT_POLL_INTERVAL.min(deadline - now));
            }
        }
    }
}

/// Locates `program` the way the shell would: paths as given, bare names on `PATH`.
fn find_executable(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return is_executable(program).then(|| program.to_path_buf());
    }

    let search_path = env::var_os("PATH")?;
    env::split_paths(&search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .is_ok_and(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
}

/// Relays a piped output stream of a foreground child into the log.
fn forward_output<R: Read + Send + 'static>(pid: u32, stream: Stream, reader: R) {
    thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            match line {
                Ok(line) => info!(target: "poolctl::child", pid, %stream, "{line}"),
                Err(err) => {
                    debug!("Stopped reading {stream} of PID {pid}: {err}");
                    break;
                }
            }
        }
    });
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}
