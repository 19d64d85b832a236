//! Loads unit definitions from the configuration directory and dispatches
//! control commands to them.
use std::{
    collections::BTreeMap,
    fmt, fs,
    io::ErrorKind,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, error, warn};

use crate::{
    command::{CommandSpec, HookScripts, SupervisedCommand},
    config::{HookStage, Settings, UnitDefinition},
    error::SupervisorError,
    lifecycle::{
        Controller, ControllerOptions, ReloadOutcome, StartOutcome, StatusReport, StopReport,
    },
    privilege::Credentials,
};

/// Addresses every loaded unit.
pub const ALL_UNITS: &str = "all";

/// Control commands the registry dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Action {
    Start,
    Stop,
    StopForce,
    Restart,
    Reload,
    Status,
}

/// A unit that loaded successfully.
pub struct LoadedUnit {
    definition: UnitDefinition,
    controller: Controller<SupervisedCommand>,
}

impl LoadedUnit {
    pub fn definition(&self) -> &UnitDefinition {
        &self.definition
    }

    pub fn controller(&self) -> &Controller<SupervisedCommand> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut Controller<SupervisedCommand> {
        &mut self.controller
    }
}

enum Entry {
    Loaded(Box<LoadedUnit>),
    Broken(String),
}

/// The report an action produced for one unit.
#[derive(Debug)]
pub enum ActionReport {
    Start(StartOutcome),
    Stop(StopReport),
    Reload(ReloadOutcome),
    Status(StatusReport),
}

impl ActionReport {
    pub fn is_success(&self) -> bool {
        match self {
            ActionReport::Start(_) | ActionReport::Reload(_) => true,
            ActionReport::Stop(report) => report.is_success(),
            ActionReport::Status(report) => report.is_healthy(),
        }
    }
}

impl fmt::Display for ActionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionReport::Start(outcome) => write!(f, "{outcome}"),
            ActionReport::Stop(report) => write!(f, "{report}"),
            ActionReport::Reload(outcome) => write!(f, "{outcome}"),
            ActionReport::Status(report) => write!(f, "{report}"),
        }
    }
}

/// Result of dispatching an action to one unit.
#[derive(Debug)]
pub struct UnitOutcome {
    pub name: String,
    pub result: Result<ActionReport, SupervisorError>,
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        self.result.as_ref().is_ok_and(ActionReport::is_success)
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match &self.result {
            Ok(report) => report.to_string(),
            Err(err) => err.to_string(),
        };
        let mut lines = text.lines();
        write!(f, "{}: {}", self.name, lines.next().unwrap_or_default())?;
        for line in lines {
            write!(f, "\n{}: {line}", self.name)?;
        }
        Ok(())
    }
}

/// Every unit found under the configuration directory, by name.
pub struct Registry {
    settings: Settings,
    units: BTreeMap<String, Entry>,
}

impl Registry {
    /// Loads every definition under the units directory. A unit that fails to
    /// load is kept as broken and reported when addressed; it never takes the
    /// others down with it.
    pub fn load(settings: Settings) -> Result<Self, SupervisorError> {
        let mut units = BTreeMap::new();
        let dir = settings.units_dir();

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("units directory {} does not exist", dir.display());
                return Ok(Self { settings, units });
            }
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let path = entry?.path();
            let Some(name) = unit_name(&path) else {
                continue;
            };

            let loaded = match load_unit(&settings, &name, &path) {
                Ok(unit) => {
                    debug!("loaded unit '{name}' from {}", path.display());
                    Entry::Loaded(Box::new(unit))
                }
                Err(err) => {
                    error!("failed to load unit '{name}': {err}");
                    Entry::Broken(err.to_string())
                }
            };
            units.insert(name, loaded);
        }

        Ok(Self { settings, units })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Names of every unit, loaded or broken, in order.
    pub fn names(&self) -> Vec<&str> {
        self.units.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Result<&LoadedUnit, SupervisorError> {
        match self.units.get(name) {
            Some(Entry::Loaded(unit)) => Ok(unit),
            Some(Entry::Broken(reason)) => Err(SupervisorError::BrokenUnit {
                name: name.to_string(),
                reason: reason.clone(),
            }),
            None => Err(SupervisorError::UnknownUnit(name.to_string())),
        }
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut LoadedUnit, SupervisorError> {
        match self.units.get_mut(name) {
            Some(Entry::Loaded(unit)) => Ok(unit),
            Some(Entry::Broken(reason)) => Err(SupervisorError::BrokenUnit {
                name: name.to_string(),
                reason: reason.clone(),
            }),
            None => Err(SupervisorError::UnknownUnit(name.to_string())),
        }
    }

    /// Runs `action` against one unit or, with [`ALL_UNITS`], every unit.
    pub fn dispatch(&mut self, action: Action, target: &str) -> Vec<UnitOutcome> {
        let names: Vec<String> = if target == ALL_UNITS {
            self.units.keys().cloned().collect()
        } else {
            vec![target.to_string()]
        };

        names
            .into_iter()
            .map(|name| {
                let result = self.apply(action, &name);
                UnitOutcome { name, result }
            })
            .collect()
    }

    fn apply(&mut self, action: Action, name: &str) -> Result<ActionReport, SupervisorError> {
        let controller = self.get_mut(name)?.controller_mut();
        debug!("{action} '{name}'");
        match action {
            Action::Start => controller.start(true).map(ActionReport::Start),
            Action::Stop => controller.stop(false).map(ActionReport::Stop),
            Action::StopForce => controller.stop(true).map(ActionReport::Stop),
            Action::Restart => controller.restart().map(ActionReport::Start),
            Action::Reload => controller.reload().map(ActionReport::Reload),
            Action::Status => Ok(ActionReport::Status(controller.status())),
        }
    }

    /// One line per unit describing its policy.
    pub fn list(&self) -> Vec<String> {
        self.units
            .iter()
            .map(|(name, entry)| match entry {
                Entry::Loaded(unit) => {
                    let definition = unit.definition();
                    format!(
                        "{name}: {} (expect {}, {})",
                        definition.run, definition.expect, definition.respawn
                    )
                }
                Entry::Broken(reason) => format!("{name}: broken ({reason})"),
            })
            .collect()
    }
}

/// File stem of a definition; hidden files are skipped.
fn unit_name(path: &Path) -> Option<String> {
    if !path.is_file() {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}

fn load_unit(settings: &Settings, name: &str, path: &Path) -> Result<LoadedUnit, SupervisorError> {
    let definition = UnitDefinition::load(path)?;

    let credentials = match (&definition.user, &definition.group) {
        (Some(user), group) => Some(Credentials::lookup(user, group.as_deref())?),
        (None, Some(_)) => {
            return Err(SupervisorError::User(
                "group is set without a user".to_string(),
            ));
        }
        (None, None) => None,
    };

    let spec = CommandSpec {
        run: definition.run.clone(),
        expect: definition.expect,
        start_timeout: definition.timeouts.start,
        hook_timeout: definition.timeouts.hook,
        credentials,
        stdout: definition.stdout.clone(),
        stderr: definition.stderr.clone(),
        hooks: discover_hooks(settings, name)?,
    };
    let command = SupervisedCommand::new(spec)?;
    let identity = command.identity(&definition.pidfile);
    let options = ControllerOptions {
        signals: definition.signals,
        stop_timeout: definition.timeouts.stop,
        ..ControllerOptions::default()
    };

    Ok(LoadedUnit {
        controller: Controller::new(command, identity, options),
        definition,
    })
}

fn discover_hooks(settings: &Settings, name: &str) -> Result<HookScripts, SupervisorError> {
    let find = |stage: HookStage| -> Result<Option<PathBuf>, SupervisorError> {
        let path = settings.hook_path(stage, name);
        if !path.is_file() {
            return Ok(None);
        }
        make_executable(&path)?;
        debug!("{} hook for '{name}': {}", stage.as_ref(), path.display());
        Ok(Some(path))
    };

    Ok(HookScripts {
        pre_start: find(HookStage::PreStart)?,
        pre_stop: find(HookStage::PreStop)?,
        post_stop: find(HookStage::PostStop)?,
    })
}

fn make_executable(path: &Path) -> Result<(), SupervisorError> {
    let mut permissions = fs::metadata(path)?.permissions();
    let mode = permissions.mode();
    if mode & 0o100 == 0 {
        permissions.set_mode(mode | 0o100);
        fs::set_permissions(path, permissions)?;
    }
    Ok(())
}
