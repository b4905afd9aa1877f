//! Error handling for poolctl.
use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::runner::{PipeMode, Stream};

/// Top-level error surfaced by the control command.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Error resolving the pool PID.
    #[error("PID file error: {0}")]
    PidFile(#[from] PidFileError),

    /// Invalid runner configuration.
    #[error("Runner configuration error: {0}")]
    Runner(#[from] RunnerError),

    /// Failure while spawning, signalling or waiting on a process.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Error loading the configuration file.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Error type for PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// The PID file does not exist.
    #[error("PID file {path:?} not found")]
    NotFound {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// The PID file exists but does not hold a usable process id.
    #[error("PID file {path:?} does not contain a valid PID: {reason}")]
    Invalid {
        /// Path of the offending file.
        path: PathBuf,
        /// Why the content was rejected.
        reason: String,
    },

    /// Error reading the PID file.
    #[error("Failed to read PID file {path:?}: {source}")]
    Read {
        /// Path of the file being read.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error writing the PID file.
    #[error("Failed to write PID file {path:?}: {source}")]
    Write {
        /// Path of the file being written.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

impl PidFileError {
    /// Whether this error means "there is no usable PID", as opposed to an I/O failure.
    pub fn is_absent_or_corrupt(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Invalid { .. })
    }
}

/// Rejected runner configuration.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Descriptor slot outside stdin/stdout/stderr.
    #[error("Descriptor spec indices must be 0, 1 or 2, got {0}")]
    InvalidDescriptorIndex(i64),

    /// Descriptor definition that cannot be understood.
    #[error("Invalid descriptor definition {definition:?}: {reason}")]
    InvalidDescriptor {
        /// The words of the rejected definition.
        definition: Vec<String>,
        /// Why it was rejected.
        reason: String,
    },

    /// Pipe whose direction does not fit its stream.
    #[error("A pipe on {stream} must be opened '{expected}'")]
    PipeDirection {
        /// The slot being wired.
        stream: Stream,
        /// The direction that slot requires.
        expected: PipeMode,
    },

    /// Non-positive timeout.
    #[error("The {which} timeout must be a positive integer, got {value}")]
    InvalidTimeout {
        /// Which timeout was being set.
        which: &'static str,
        /// The rejected value in microseconds.
        value: i64,
    },

    /// Unknown runner type passed to the factory.
    #[error("The runner type '{0}' is invalid")]
    InvalidType(String),
}

/// Failures involving the managed process itself.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Error spawning the command.
    #[error("Failed to start `{command}`: {source}")]
    Spawn {
        /// The command line that failed to start.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error waiting on a spawned process.
    #[error("Failed to wait on PID {pid}: {source}")]
    Wait {
        /// Process being waited on.
        pid: u32,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Could not deliver a signal.
    #[error("Could not send {signal} to the pool, PID {pid}: {source}")]
    Signal {
        /// Target process.
        pid: i32,
        /// Signal name.
        signal: String,
        /// The underlying error that occurred.
        #[source]
        source: nix::errno::Errno,
    },

    /// The pool did not exit within the wait budget.
    #[error("Could not stop the pool (PID {pid} still running after {waited:?})")]
    StopTimeout {
        /// Process that refused to exit.
        pid: i32,
        /// Time spent polling.
        waited: Duration,
    },

    /// Start requested while a pool is alive.
    #[error("Pool is already running (PID {pid})")]
    AlreadyRunning {
        /// PID of the live pool.
        pid: i32,
    },

    /// Start requested as root without permission.
    #[error("Cannot run the pool as the root user")]
    RootForbidden,

    /// Error recording the spawned PID.
    #[error(transparent)]
    PidFile(#[from] PidFileError),

    /// The background supervisor thread panicked.
    #[error("Runner supervisor for PID {pid} panicked")]
    SupervisorPanicked {
        /// PID of the first supervised invocation.
        pid: u32,
    },
}

/// Error loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        /// Path of the config file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference names an unset variable.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// Stop signal name that is not a known signal.
    #[error("Unknown stop signal '{0}'")]
    UnknownSignal(String),

    /// Runner settings rejected by the factory.
    #[error(transparent)]
    Runner(#[from] RunnerError),
}
