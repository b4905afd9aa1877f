use std::process::ExitCode;

use tracing::debug;
use tracing_subscriber::EnvFilter;

use poolctl::{
    cli::{Cli, parse_args},
    config::load_config,
    error::PoolError,
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Cli) -> Result<(), PoolError> {
    let config = load_config(Some(args.config.as_str()))?;
    let control = config.pool_control()?;

    debug!("Running action '{}'", args.action);
    control.execute(&args.action, |outcome| println!("{outcome}"))?;

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
