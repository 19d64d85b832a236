use std::process::ExitCode;

use tracing::error;
use tracing_subscriber::EnvFilter;

use pidwarden::{
    cli::{Cli, parse_args},
    config::Settings,
    registry::Registry,
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    let settings = Settings::new(&args.config_dir);
    let mut registry = match Registry::load(settings) {
        Ok(registry) => registry,
        Err(err) => {
            error!("cannot load units from {}: {err}", args.config_dir.display());
            return ExitCode::FAILURE;
        }
    };

    let Some((action, target)) = args.command.action() else {
        let lines = registry.list();
        if lines.is_empty() {
            println!("No enabled units");
        }
        for line in lines {
            println!("{line}");
        }
        return ExitCode::SUCCESS;
    };

    let outcomes = registry.dispatch(action, target);
    let mut success = true;
    for outcome in &outcomes {
        println!("{outcome}");
        success &= outcome.is_success();
    }

    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
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
