//! Poolctl supervises a single long-running worker pool process. It starts the
//! pool in the background, records its PID, and stops or restarts it by
//! signalling that PID and polling until the process is gone. Runners used to
//! launch subprocesses are configured through a factory that controls stream
//! wiring, restart limits and timeouts.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Start/stop/restart control protocol.
pub mod control;

/// Error handling.
pub mod error;

/// PID file handling.
pub mod pid;

/// Privilege checks.
pub mod privilege;

/// Subprocess runners and their factory.
pub mod runner;

#[doc(hidden)]
pub mod test_utils;
