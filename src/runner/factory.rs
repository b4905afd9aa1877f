//! Construction of configured runners.
use std::{path::PathBuf, str::FromStr, time::Duration};

use strum_macros::{AsRefStr, EnumString};
use tracing::debug;

use super::{DescriptorSpec, Directive, Runner, RunnerConfig, RunnerKind, Stream};
use crate::{error::RunnerError, pid::PidFactory};

#[derive(Debug, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
enum RunnerType {
    Process,
    Console,
}

/// Holds runner configuration and builds [`Runner`]s from it.
///
/// Every runner receives a copy of the configuration current at the time it
/// is created; later changes to the factory do not reach it.
#[derive(Debug, Clone)]
pub struct RunnerFactory {
    pid_factory: PidFactory,
    console_path: PathBuf,
    config: RunnerConfig,
}

impl RunnerFactory {
    /// Creates a factory with the default descriptor spec and timeouts.
    pub fn new(pid_factory: PidFactory, console_path: impl Into<PathBuf>) -> Self {
        Self {
            pid_factory,
            console_path: console_path.into(),
            config: RunnerConfig::default(),
        }
    }

    /// Current descriptor spec.
    pub fn descriptor_spec(&self) -> &DescriptorSpec {
        &self.config.descriptors
    }

    /// Current process timeout.
    pub fn process_timeout(&self) -> Duration {
        self.config.process_timeout
    }

    /// Current wait timeout.
    pub fn wait_timeout(&self) -> Duration {
        self.config.wait_timeout
    }

    /// Replaces the descriptor spec wholesale.
    pub fn set_descriptor_spec(&mut self, spec: DescriptorSpec) -> Result<(), RunnerError> {
        spec.validate()?;
        self.config.descriptors = spec;
        Ok(())
    }

    /// Adds, changes or (with an empty definition) removes one slot.
    ///
    /// On error the descriptor spec is left untouched.
    pub fn modify_descriptor_spec<S: AsRef<str>>(
        &mut self,
        index: i64,
        definition: &[S],
    ) -> Result<(), RunnerError> {
        let stream = Stream::try_from(index)?;
        match Directive::parse(definition)? {
            Some(directive) => {
                directive.check_direction(stream)?;
                debug!("Wiring {stream} to {directive:?}");
                self.config.descriptors.set(stream, directive);
            }
            None => {
                debug!("Removing {stream} from the descriptor spec");
                self.config.descriptors.remove(stream);
            }
        }
        Ok(())
    }

    /// Sets the per-invocation cap, in microseconds.
    pub fn set_process_timeout(&mut self, micros: i64) -> Result<(), RunnerError> {
        self.config.process_timeout = positive_micros("process", micros)?;
        Ok(())
    }

    /// Sets the graceful-exit wait cap, in microseconds.
    pub fn set_wait_timeout(&mut self, micros: i64) -> Result<(), RunnerError> {
        self.config.wait_timeout = positive_micros("wait", micros)?;
        Ok(())
    }

    /// Builds a runner of the named type (`"process"` or `"console"`).
    pub fn create_runner(
        &self,
        kind: &str,
        pid_file: Option<PathBuf>,
        max_run_count: u32,
    ) -> Result<Runner, RunnerError> {
        let kind = match RunnerType::from_str(kind) {
            Ok(RunnerType::Process) => RunnerKind::Process,
            Ok(RunnerType::Console) => RunnerKind::Console {
                console_path: self.console_path.clone(),
            },
            Err(_) => return Err(RunnerError::InvalidType(kind.to_string())),
        };

        Ok(Runner::new(
            kind,
            self.config.clone(),
            self.pid_factory,
            pid_file,
            max_run_count,
        ))
    }
}

fn positive_micros(which: &'static str, value: i64) -> Result<Duration, RunnerError> {
    u64::try_from(value)
        .ok()
        .filter(|micros| *micros > 0)
        .map(Duration::from_micros)
        .ok_or(RunnerError::InvalidTimeout { which, value })
}
