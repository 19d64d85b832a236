//! Configuration management for pidwarden.
//!
//! [`Settings`] is built once from the command line and handed to the
//! registry. Unit definitions are YAML files, one unit per file.
use regex::{Captures, Regex};
use serde::Deserialize;
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use strum_macros::{AsRefStr, EnumString};

use crate::{command::ExpectMode, error::ConfigError, signals::SignalPolicy};

/// Default configuration root.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/pidwarden";

/// Directory below the configuration root holding enabled unit definitions.
pub const UNITS_DIR: &str = "conf-enabled";

/// Directory below the configuration root holding hook scripts.
pub const HOOKS_DIR: &str = "hooks";

/// Immutable process-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    config_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_DIR)
    }
}

impl Settings {
    /// Settings rooted at `config_dir`. Relative paths are resolved against
    /// the current directory, since supervised commands run from `/`.
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        let dir = config_dir.as_ref();
        Self {
            config_dir: std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf()),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn units_dir(&self) -> PathBuf {
        self.config_dir.join(UNITS_DIR)
    }

    /// Hook script for `unit` at `stage`, whether or not it exists.
    pub fn hook_path(&self, stage: HookStage, unit: &str) -> PathBuf {
        self.config_dir
            .join(HOOKS_DIR)
            .join(stage.as_ref())
            .join(unit)
    }
}

/// Lifecycle points a hook script can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum HookStage {
    PreStart,
    PreStop,
    PostStop,
}

/// `respawn: true` or `respawn: {limit, interval}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RespawnField {
    Enabled(bool),
    Policy {
        limit: Option<u32>,
        interval: Option<u64>,
    },
}

/// `expect: fork`, `expect: daemon` or `expect: false`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExpectField {
    Flag(bool),
    Mode(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SignalsField {
    terminate: Option<i32>,
    kill: Option<i32>,
    reload: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TimeoutsField {
    start: Option<f64>,
    stop: Option<f64>,
    hook: Option<f64>,
}

/// Raw shape of a unit definition file.
#[derive(Debug, Clone, Deserialize)]
struct UnitFile {
    pid: Option<PathBuf>,
    run: Option<String>,
    user: Option<String>,
    group: Option<String>,
    respawn: Option<RespawnField>,
    expect: Option<ExpectField>,
    #[serde(default)]
    signals: SignalsField,
    #[serde(default)]
    timeouts: TimeoutsField,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
}

/// Restart-on-crash policy of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespawnPolicy {
    pub enabled: bool,
    pub limit: u32,
    pub interval: Duration,
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 5,
            interval: Duration::from_secs(5),
        }
    }
}

impl fmt::Display for RespawnPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.enabled {
            write!(
                f,
                "respawn (limit {}, interval {}s)",
                self.limit,
                self.interval.as_secs()
            )
        } else {
            write!(f, "no respawn")
        }
    }
}

/// Stage timeouts of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub start: Duration,
    pub stop: Duration,
    pub hook: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(3),
            stop: Duration::from_secs(5),
            hook: Duration::from_secs(30),
        }
    }
}

/// A validated unit definition.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitDefinition {
    pub pidfile: PathBuf,
    pub run: String,
    pub user: Option<String>,
    pub group: Option<String>,
    pub respawn: RespawnPolicy,
    pub expect: ExpectMode,
    pub signals: SignalPolicy,
    pub timeouts: Timeouts,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

impl UnitDefinition {
    /// Reads and validates a unit definition file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let expanded = expand_env_vars(&content)?;
        Self::parse(&expanded).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parses a unit definition from YAML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: UnitFile = serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;

        let pidfile = raw
            .pid
            .filter(|pid| !pid.as_os_str().is_empty())
            .ok_or(ConfigError::MissingField("pid"))?;
        let run = raw
            .run
            .filter(|run| !run.trim().is_empty())
            .ok_or(ConfigError::MissingField("run"))?;

        Ok(Self {
            pidfile,
            run,
            user: raw.user,
            group: raw.group,
            respawn: respawn_policy(raw.respawn),
            expect: expect_mode(raw.expect)?,
            signals: SignalPolicy::from_numbers(
                raw.signals.terminate,
                raw.signals.kill,
                raw.signals.reload,
            )?,
            timeouts: timeouts(&raw.timeouts)?,
            stdout: raw.stdout,
            stderr: raw.stderr,
        })
    }
}

fn respawn_policy(field: Option<RespawnField>) -> RespawnPolicy {
    let defaults = RespawnPolicy::default();
    match field {
        None => defaults,
        Some(RespawnField::Enabled(enabled)) => RespawnPolicy {
            enabled,
            ..defaults
        },
        Some(RespawnField::Policy { limit, interval }) => {
            let limit = limit.unwrap_or(defaults.limit);
            RespawnPolicy {
                enabled: limit > 0,
                limit,
                interval: interval.map_or(defaults.interval, Duration::from_secs),
            }
        }
    }
}

fn expect_mode(field: Option<ExpectField>) -> Result<ExpectMode, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        field: "expect",
        reason: "must be fork or daemon or not exist".to_string(),
    };
    match field {
        None | Some(ExpectField::Flag(false)) => Ok(ExpectMode::None),
        Some(ExpectField::Flag(true)) => Err(invalid()),
        Some(ExpectField::Mode(mode)) => match mode.parse::<ExpectMode>() {
            Ok(ExpectMode::None) | Err(_) => Err(invalid()),
            Ok(mode) => Ok(mode),
        },
    }
}

fn timeouts(field: &TimeoutsField) -> Result<Timeouts, ConfigError> {
    let defaults = Timeouts::default();
    Ok(Timeouts {
        start: seconds("timeouts:start", field.start, defaults.start)?,
        stop: seconds("timeouts:stop", field.stop, defaults.stop)?,
        hook: seconds("timeouts:hook", field.hook, defaults.hook)?,
    })
}

fn seconds(
    field: &'static str,
    value: Option<f64>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(secs) => Duration::try_from_secs_f64(secs).map_err(|err| {
            ConfigError::InvalidValue {
                field,
                reason: err.to_string(),
            }
        }),
    }
}

/// Expands `${VAR}` references from the environment.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?;
    let mut missing = None;
    let result = re.replace_all(input, |caps: &Captures| {
        let name = &caps[1];
        env::var(name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| name.to_string());
            String::new()
        })
    });
    match missing {
        Some(name) => Err(ConfigError::MissingEnvVar(name)),
        None => Ok(result.into_owned()),
    }
}
