//! Error handling for pidwarden.
use std::{io, path::PathBuf, process::ExitStatus};

use nix::{errno::Errno, sys::signal::Signal};
use thiserror::Error;

/// Defines all possible errors raised while supervising a unit.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The pidfile already names a live process that belongs to the unit.
    #[error("already running ({pid})")]
    AlreadyRunning {
        /// The tracked process id.
        pid: u32,
    },

    /// A unit definition or external command could not be resolved.
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// Delivering a signal failed for a reason other than the process being gone.
    #[error("cannot deliver {signal} to process {pid}: {source}")]
    SignalDelivery {
        /// Target process.
        pid: u32,
        /// The signal being delivered.
        signal: Signal,
        /// The underlying errno.
        #[source]
        source: Errno,
    },

    /// Daemonization failed at a point with no safe state to recover into.
    #[error("{stage} failed: {reason}")]
    FatalInit {
        /// Daemonization step, e.g. `fork #1`.
        stage: &'static str,
        /// What the OS reported.
        reason: String,
    },

    /// Spawning an external command failed.
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        /// The command line being spawned.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// A hook script exited unsuccessfully.
    #[error("{hook} hook `{command}` exited with {status}")]
    Hook {
        /// Hook stage label (e.g. `pre-start`).
        hook: String,
        /// The hook command.
        command: String,
        /// Exit status reported by the OS.
        status: ExitStatus,
    },

    /// A hook script did not finish in time and was killed.
    #[error("{hook} hook `{command}` timed out")]
    HookTimeout {
        /// Hook stage label.
        hook: String,
        /// The hook command.
        command: String,
    },

    /// Error for the pidfile.
    #[error("Pidfile error: {0}")]
    PidFile(#[from] PidFileError),

    /// The registry has no unit under this name.
    #[error("unit '{0}' is not found")]
    UnknownUnit(String),

    /// A unit failed to load and cannot be addressed.
    #[error("unit '{name}' failed to load: {reason}")]
    BrokenUnit {
        /// Unit name.
        name: String,
        /// Load failure message.
        reason: String,
    },

    /// Looking up or switching to an OS user failed.
    #[error("user switch failed: {0}")]
    User(String),

    /// Generic I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Raw errno from a nix call.
    #[error("system call failed: {0}")]
    Errno(#[from] Errno),
}

/// Errors raised while loading unit definitions or resolving an external command.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading a unit definition file.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// Offending file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error parsing YAML configuration.
    #[error("Invalid config {path}: {source}")]
    Parse {
        /// Offending file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: serde_yaml::Error,
    },

    /// A required attribute is absent or empty.
    #[error("{0} attribute is not specified")]
    MissingField(&'static str),

    /// An attribute has an unusable value.
    #[error("{field}: {reason}")]
    InvalidValue {
        /// Attribute name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// A `${VAR}` reference names an unset environment variable.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A signal number does not name a real signal.
    #[error("signals:{field} is not a valid signal number: {value}")]
    InvalidSignal {
        /// Which signal slot.
        field: &'static str,
        /// The rejected number.
        value: i32,
    },

    /// The spawned command vanished before it could be observed.
    #[error("cannot run process {0}")]
    CannotRun(String),

    /// More than one detached process matched the unit after forking.
    #[error("ambiguous forked process: {first} and {second}")]
    AmbiguousFork {
        /// First candidate pid.
        first: u32,
        /// Second candidate pid.
        second: u32,
    },

    /// No detached process matched the unit after the start timeout.
    #[error("no forked process matching `{0}` was reparented to init")]
    NoForkedProcess(String),

    /// A match pattern did not compile.
    #[error("invalid process pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Error type for pidfile operations. Reads never fail: an unreadable pidfile
/// simply means no tracked process.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error writing the pidfile.
    #[error("Failed to write pidfile {path}: {source}")]
    Write {
        /// Pidfile path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error removing the pidfile.
    #[error("Failed to remove pidfile {path}: {source}")]
    Remove {
        /// Pidfile path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },
}
