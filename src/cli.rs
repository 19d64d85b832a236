//! Command-line interfaces: the registry binary and the per-unit CLI built
//! from a parameter schema.
use std::{ffi::OsString, path::PathBuf, str::FromStr};

use clap::{
    Arg, ArgAction, ArgMatches, Command, Parser, Subcommand,
    error::{Error as ClapError, ErrorKind},
    value_parser,
};

use crate::{
    config::DEFAULT_CONFIG_DIR,
    error::SupervisorError,
    lifecycle::{Controller, ControllerOptions, Unit, UnitIdentity},
    params::{ParamKind, ParamSchema, ParamValue, Params},
    registry::{ALL_UNITS, Action, ActionReport},
};

/// Verbosity names, quietest first. The position is the numeric shorthand
/// and the first name is the `EnvFilter` directive.
const VERBOSITY: [&[&str]; 6] = [
    &["off"],
    &["error", "err"],
    &["warn", "warning"],
    &["info"],
    &["debug"],
    &["trace"],
];

/// `--log-level` value: a verbosity name or its 0-5 shorthand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(usize);

impl LogLevelArg {
    pub fn as_str(&self) -> &'static str {
        VERBOSITY[self.0][0]
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        let index = match trimmed.parse::<usize>() {
            Ok(number) if number < VERBOSITY.len() => number,
            Ok(number) => {
                return Err(format!(
                    "unsupported log level number '{number}' (expected 0-{})",
                    VERBOSITY.len() - 1
                ));
            }
            Err(_) => VERBOSITY
                .iter()
                .position(|names| names.iter().any(|name| name.eq_ignore_ascii_case(trimmed)))
                .ok_or_else(|| format!("invalid log level '{trimmed}'"))?,
        };
        Ok(LogLevelArg(index))
    }
}

/// Command-line interface for pidwarden.
#[derive(Parser)]
#[command(name = "pidwarden", version)]
#[command(about = "Start, stop and inspect daemons tracked by pidfiles", long_about = None)]
pub struct Cli {
    /// Directory holding `conf-enabled/` and `hooks/`.
    #[arg(long, value_name = "DIR", default_value = DEFAULT_CONFIG_DIR, global = true)]
    pub config_dir: PathBuf,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for pidwarden.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start a unit, or `all`.
    Start { unit: String },

    /// Stop a unit politely, escalating after its stop timeout.
    Stop { unit: String },

    /// Stop a unit with the kill signal straight away.
    #[command(name = "stop-force")]
    StopForce { unit: String },

    /// Stop then start a unit.
    Restart { unit: String },

    /// Send the reload signal to a running unit.
    Reload { unit: String },

    /// Report whether units are running, and any lost processes.
    Status {
        #[arg(default_value = ALL_UNITS)]
        unit: String,
    },

    /// List enabled units.
    List,
}

impl Commands {
    /// The registry action and its target, or `None` for `list`.
    pub fn action(&self) -> Option<(Action, &str)> {
        match self {
            Commands::Start { unit } => Some((Action::Start, unit.as_str())),
            Commands::Stop { unit } => Some((Action::Stop, unit.as_str())),
            Commands::StopForce { unit } => Some((Action::StopForce, unit.as_str())),
            Commands::Restart { unit } => Some((Action::Restart, unit.as_str())),
            Commands::Reload { unit } => Some((Action::Reload, unit.as_str())),
            Commands::Status { unit } => Some((Action::Status, unit.as_str())),
            Commands::List => None,
        }
    }
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}

const PIDFILE_ARG: &str = "pid";
const DEBUG_ARG: &str = "debug";
const COMMAND_ARG: &str = "command";
const COMMANDS: [&str; 6] = ["start", "stop", "stop-force", "restart", "reload", "status"];

/// A parsed per-unit invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitInvocation {
    pub action: Action,
    pub pidfile: PathBuf,
    pub default_pidfile: bool,
    /// Run `start` in the foreground instead of daemonizing.
    pub foreground: bool,
    pub params: Params,
}

/// Command line of a single in-process unit:
/// `<name> [--pid FILE] [--debug] [--<param> VALUE]... <command>`.
#[derive(Debug, Clone)]
pub struct UnitCli {
    name: String,
    schema: ParamSchema,
    default_pidfile: Option<PathBuf>,
}

impl UnitCli {
    pub fn new(name: impl Into<String>, schema: ParamSchema) -> Self {
        Self {
            name: name.into(),
            schema,
            default_pidfile: None,
        }
    }

    /// Built-in pidfile; `--pid` is only offered when there is none.
    pub fn with_default_pidfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_pidfile = Some(path.into());
        self
    }

    /// The clap command for this unit.
    pub fn command(&self) -> Command {
        let mut command = Command::new(self.name.clone())
            .arg(
                Arg::new(DEBUG_ARG)
                    .long(DEBUG_ARG)
                    .action(ArgAction::SetTrue)
                    .help("Run in the foreground instead of daemonizing"),
            )
            .arg(
                Arg::new(COMMAND_ARG)
                    .required(true)
                    .value_parser(COMMANDS)
                    .help("Control command"),
            );

        if self.default_pidfile.is_none() {
            command = command.arg(
                Arg::new(PIDFILE_ARG)
                    .long(PIDFILE_ARG)
                    .value_name("FILE")
                    .required(true)
                    .value_parser(value_parser!(PathBuf))
                    .help("Pidfile tracking the unit"),
            );
        }

        for spec in self.schema.specs() {
            let mut arg = Arg::new(spec.name.clone()).long(spec.name.clone());
            arg = match spec.kind {
                ParamKind::Text => arg.value_parser(value_parser!(String)),
                ParamKind::Integer => arg.value_parser(value_parser!(i64)),
                ParamKind::Flag => arg.action(ArgAction::SetTrue),
            };
            if let Some(help) = &spec.help {
                arg = arg.help(help.clone());
            }
            command = command.arg(arg);
        }

        command
    }

    /// Parses `args` (including the program name).
    pub fn try_parse_from<I, T>(&self, args: I) -> Result<UnitInvocation, ClapError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let mut command = self.command();
        let matches = command.try_get_matches_from_mut(args)?;

        let action = matches
            .get_one::<String>(COMMAND_ARG)
            .and_then(|value| value.parse::<Action>().ok())
            .ok_or_else(|| command.error(ErrorKind::InvalidValue, "unknown control command"))?;

        let (pidfile, default_pidfile) = match &self.default_pidfile {
            Some(path) => (path.clone(), true),
            None => match matches.get_one::<PathBuf>(PIDFILE_ARG) {
                Some(path) => (path.clone(), false),
                None => {
                    return Err(command.error(
                        ErrorKind::MissingRequiredArgument,
                        "--pid is required",
                    ));
                }
            },
        };

        let params = self.params(&matches);
        if action == Action::Start
            && let Some(missing) = self
                .schema
                .specs()
                .iter()
                .find(|spec| params.get(&spec.name).is_none())
        {
            return Err(command.error(
                ErrorKind::MissingRequiredArgument,
                format!("--{} is required to start", missing.name),
            ));
        }

        Ok(UnitInvocation {
            action,
            pidfile,
            default_pidfile,
            foreground: matches.get_flag(DEBUG_ARG),
            params,
        })
    }

    fn params(&self, matches: &ArgMatches) -> Params {
        let mut params = self.schema.defaults();
        for spec in self.schema.specs() {
            let value = match spec.kind {
                ParamKind::Text => matches
                    .get_one::<String>(&spec.name)
                    .map(|value| ParamValue::Text(value.clone())),
                ParamKind::Integer => matches
                    .get_one::<i64>(&spec.name)
                    .map(|value| ParamValue::Integer(*value)),
                ParamKind::Flag => matches.get_flag(&spec.name).then(|| {
                    let default = matches!(spec.default, Some(ParamValue::Flag(true)));
                    ParamValue::Flag(!default)
                }),
            };
            if let Some(value) = value {
                params.insert(&spec.name, value);
            }
        }
        params
    }

    /// Parses the process arguments, exiting with a usage message on error.
    pub fn parse(&self) -> UnitInvocation {
        self.try_parse_from(std::env::args_os())
            .unwrap_or_else(|err| err.exit())
    }
}

/// Carries out a per-unit invocation against an in-process unit.
pub fn run_unit<U: Unit>(
    invocation: UnitInvocation,
    unit: U,
    mut options: ControllerOptions,
) -> Result<ActionReport, SupervisorError> {
    let identity = UnitIdentity::new(&invocation.pidfile, invocation.default_pidfile)?;
    options.params = invocation.params;
    let mut controller = Controller::new(unit, identity, options);

    match invocation.action {
        Action::Start => controller
            .start(!invocation.foreground)
            .map(ActionReport::Start),
        Action::Stop => controller.stop(false).map(ActionReport::Stop),
        Action::StopForce => controller.stop(true).map(ActionReport::Stop),
        Action::Restart => controller.restart().map(ActionReport::Start),
        Action::Reload => controller.reload().map(ActionReport::Reload),
        Action::Status => Ok(ActionReport::Status(controller.status())),
    }
}
