//! Configuration management for poolctl.
use regex::{Captures, Regex};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

use nix::sys::signal::Signal;
use tracing::debug;

use crate::{
    control::{DEFAULT_WAIT_TIMEOUT_MICROS, PoolControl},
    error::{ConfigError, RunnerError},
    pid::PidFactory,
    runner::RunnerFactory,
};

/// File looked up when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "poolctl.yaml";

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("environment variable pattern")
});

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The supervised pool.
    pub pool: PoolConfig,
    /// Settings applied to the runner factory.
    pub runner: RunnerSettings,
    /// Directory relative paths are resolved from (the config file's directory).
    #[serde(skip)]
    pub project_dir: Option<PathBuf>,
}

/// The pool process and how it is controlled.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// PID file written on start and read on every liveness check.
    pub pid_file: PathBuf,
    /// Console sub-command that runs the pool.
    pub command: String,
    /// Whether the pool may be launched by root.
    #[serde(default)]
    pub allow_root: bool,
    /// Microseconds stop waits for the pool to exit.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: i64,
    /// Signal requesting a graceful shutdown (e.g. `SIGUSR1` or `USR1`).
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,
}

/// Runner factory settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RunnerSettings {
    /// Console entry point prefixed to console-runner commands.
    pub console_path: PathBuf,
    /// Per-invocation cap in microseconds.
    pub process_timeout: Option<i64>,
    /// Graceful-exit wait cap in microseconds.
    pub wait_timeout: Option<i64>,
    /// Descriptor overrides keyed by stream index; an empty list removes the slot.
    #[serde(default)]
    pub descriptors: BTreeMap<i64, Vec<String>>,
}

fn default_wait_timeout() -> i64 {
    DEFAULT_WAIT_TIMEOUT_MICROS as i64
}

fn default_stop_signal() -> String {
    "SIGUSR1".to_string()
}

impl Config {
    /// Resolves `path` against the config file's directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.project_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Console path, resolved unless it is a bare command name left to `PATH`.
    fn console_path(&self) -> PathBuf {
        let path = &self.runner.console_path;
        if path.components().count() > 1 {
            self.resolve(path)
        } else {
            path.clone()
        }
    }

    /// Builds a runner factory, validating timeouts and descriptors on the way.
    pub fn runner_factory(&self) -> Result<RunnerFactory, ConfigError> {
        let mut factory = RunnerFactory::new(PidFactory::new(), self.console_path());

        if let Some(timeout) = self.runner.process_timeout {
            factory.set_process_timeout(timeout)?;
        }
        if let Some(timeout) = self.runner.wait_timeout {
            factory.set_wait_timeout(timeout)?;
        }
        for (index, definition) in &self.runner.descriptors {
            let resolved = self.resolve_file_directive(definition);
            factory.modify_descriptor_spec(*index, &resolved)?;
        }

        Ok(factory)
    }

    /// Builds the pool controller described by this configuration.
    pub fn pool_control(&self) -> Result<PoolControl, ConfigError> {
        let wait_timeout = u64::try_from(self.pool.wait_timeout)
            .ok()
            .filter(|micros| *micros > 0)
            .map(Duration::from_micros)
            .ok_or(RunnerError::InvalidTimeout {
                which: "pool wait",
                value: self.pool.wait_timeout,
            })?;

        let control = PoolControl::new(
            self.runner_factory()?,
            PidFactory::new(),
            self.resolve(&self.pool.pid_file),
            self.pool.command.clone(),
        )
        .with_allow_root(self.pool.allow_root)
        .with_wait_timeout(wait_timeout)
        .with_stop_signal(parse_signal(&self.pool.stop_signal)?);

        Ok(control)
    }

    /// Expands environment references in the values that are used, leaving
    /// comments and keys alone.
    fn expand_env_vars(&mut self) -> Result<(), ConfigError> {
        self.pool.command = expand_env_vars(&self.pool.command)?;
        self.pool.stop_signal = expand_env_vars(&self.pool.stop_signal)?;
        self.pool.pid_file = expand_path(&self.pool.pid_file)?;
        self.runner.console_path = expand_path(&self.runner.console_path)?;
        for definition in self.runner.descriptors.values_mut() {
            for word in definition.iter_mut() {
                *word = expand_env_vars(word)?;
            }
        }
        Ok(())
    }

    fn resolve_file_directive(&self, definition: &[String]) -> Vec<String> {
        match definition {
            [kind, path, mode] if kind == "file" => vec![
                kind.clone(),
                self.resolve(Path::new(path)).to_string_lossy().into_owned(),
                mode.clone(),
            ],
            _ => definition.to_vec(),
        }
    }
}

/// Accepts signal names with or without the `SIG` prefix.
fn parse_signal(name: &str) -> Result<Signal, ConfigError> {
    let upper = name.trim().to_ascii_uppercase();
    let canonical = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&canonical).map_err(|_| ConfigError::UnknownSignal(name.to_string()))
}

/// Expands `$VAR` and `${VAR}` references from the environment.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing = None;
    let expanded = ENV_VAR.replace_all(input, |caps: &Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    match missing {
        Some(var_name) => Err(ConfigError::MissingEnvVar(var_name)),
        None => Ok(expanded.into_owned()),
    }
}

fn expand_path(path: &Path) -> Result<PathBuf, ConfigError> {
    match path.to_str() {
        Some(raw) => expand_env_vars(raw).map(PathBuf::from),
        None => Ok(path.to_path_buf()),
    }
}

/// Loads and parses the configuration file, expanding environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config, ConfigError> {
    let config_path = Path::new(config_path.unwrap_or(DEFAULT_CONFIG_FILE));

    let content = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
        path: config_path.to_path_buf(),
        source,
    })?;
    let mut config: Config = serde_yaml::from_str(&content)?;
    config.expand_env_vars()?;

    let base_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    config.project_dir = Some(base_path.to_path_buf());
    debug!("Loaded configuration from {config_path:?}");

    Ok(config)
}
