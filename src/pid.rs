//! PID file handling for the managed pool.
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::error::PidFileError;

/// A process id read from a PID file.
///
/// Only constructed from a positive decimal value, so a `Pid` always names a
/// concrete process (never "no process" or a process group).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pid {
    pid: i32,
    source: PathBuf,
}

impl Pid {
    /// Returns the process id.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Returns the file the id was read from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Returns the id in the form `nix` expects for signalling and reaping.
    pub fn as_nix(&self) -> nix::unistd::Pid {
        nix::unistd::Pid::from_raw(self.pid)
    }

    fn parse(raw: &str, source: &Path) -> Result<Self, PidFileError> {
        let invalid = |reason: String| PidFileError::Invalid {
            path: source.to_path_buf(),
            reason,
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("file is empty".into()));
        }
        if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid(format!("'{trimmed}' is not a decimal number")));
        }

        let pid = trimmed
            .parse::<i32>()
            .map_err(|err| invalid(format!("'{trimmed}': {err}")))?;
        if pid <= 0 {
            return Err(invalid(format!("'{trimmed}' is not a process id")));
        }

        Ok(Self {
            pid,
            source: source.to_path_buf(),
        })
    }
}

/// Reads and writes PID files.
#[derive(Debug, Clone, Copy, Default)]
pub struct PidFactory;

impl PidFactory {
    /// Creates a new factory.
    pub fn new() -> Self {
        Self
    }

    /// Reads the PID file at `path`.
    ///
    /// Fails with [`PidFileError::NotFound`] when the file is missing and with
    /// [`PidFileError::Invalid`] when it does not hold a usable process id.
    pub fn create(&self, path: &Path) -> Result<Pid, PidFileError> {
        let contents = fs::read_to_string(path).map_err(|source| {
            if source.kind() == ErrorKind::NotFound {
                PidFileError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                PidFileError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        Pid::parse(&contents, path)
    }

    /// Records `pid` at `path`, creating parent directories as needed.
    pub fn write(&self, path: &Path, pid: u32) -> Result<(), PidFileError> {
        let write_err = |source| PidFileError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(path, format!("{pid}\n")).map_err(write_err)?;
        debug!("Recorded PID {pid} in {path:?}");
        Ok(())
    }
}
