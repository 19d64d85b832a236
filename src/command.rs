//! Units whose payload is an external command.
use std::{
    fs::OpenOptions,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, error, warn};

use crate::{
    error::{ConfigError, SupervisorError},
    lifecycle::{Payload, RunOutcome, Unit, UnitIdentity},
    privilege::{self, Credentials},
    process::{LiveProcessTable, ProcessPattern, ProcessTable},
    signals::RunContext,
};

/// Number of fork hops between the spawned command and the real daemon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ExpectMode {
    /// The spawned process is the daemon.
    #[default]
    None,
    /// The command forks once and the parent exits.
    Fork,
    /// The command performs a full daemonization of its own.
    Daemon,
}

/// Hook scripts run around lifecycle transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookScripts {
    pub pre_start: Option<PathBuf>,
    pub pre_stop: Option<PathBuf>,
    pub post_stop: Option<PathBuf>,
}

/// Everything needed to launch and resolve an external command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub run: String,
    pub expect: ExpectMode,
    /// Grace period before resolving the forked daemon.
    pub start_timeout: Duration,
    /// Longest a hook may run before it is killed and the transition aborted.
    pub hook_timeout: Duration,
    pub credentials: Option<Credentials>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub hooks: HookScripts,
}

impl CommandSpec {
    pub fn new(run: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            expect: ExpectMode::None,
            start_timeout: Duration::from_secs(3),
            hook_timeout: Duration::from_secs(30),
            credentials: None,
            stdout: None,
            stderr: None,
            hooks: HookScripts::default(),
        }
    }
}

/// An external command supervised through the lifecycle engine.
#[derive(Debug)]
pub struct SupervisedCommand<T = LiveProcessTable> {
    spec: CommandSpec,
    argv: Vec<String>,
    pattern: ProcessPattern,
    table: T,
}

impl SupervisedCommand {
    pub fn new(spec: CommandSpec) -> Result<Self, ConfigError> {
        Self::with_table(spec, LiveProcessTable)
    }
}

impl<T: ProcessTable> SupervisedCommand<T> {
    pub fn with_table(spec: CommandSpec, table: T) -> Result<Self, ConfigError> {
        let argv = split_command(&spec.run)?;
        let pattern = ProcessPattern::for_argv(&argv)?;
        Ok(Self {
            spec,
            argv,
            pattern,
            table,
        })
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Pattern recognising the command's processes.
    pub fn pattern(&self) -> &ProcessPattern {
        &self.pattern
    }

    /// Identity pairing `pidfile` with this command's pattern.
    pub fn identity(&self, pidfile: impl AsRef<Path>) -> UnitIdentity {
        UnitIdentity::with_pattern(pidfile, self.pattern.clone())
    }

    /// Spawns the run script and resolves the pid of the real daemon.
    pub fn call(&self) -> Result<u32, SupervisorError> {
        let mut child = self.spawn(&self.argv)?;
        let pid = child.id();

        if self.table.get(pid).is_none() {
            return Err(ConfigError::CannotRun(self.spec.run.clone()).into());
        }

        if self.spec.expect == ExpectMode::None {
            debug!("`{}` is running as {pid}", self.spec.run);
            return Ok(pid);
        }

        thread::sleep(self.spec.start_timeout);
        // The launcher is expected to be gone by now; reap it so it does not
        // linger as a zombie of ours.
        let _ = child.try_wait();
        self.resolve_forked(pid)
    }

    /// Finds the single process matching the command that has been
    /// reparented to init.
    fn resolve_forked(&self, launcher: u32) -> Result<u32, SupervisorError> {
        let mut detached = self
            .table
            .find(&self.pattern)
            .into_iter()
            .filter(|process| {
                process.pid != launcher && process.parent_pid == Some(1) && !process.is_zombie()
            })
            .map(|process| process.pid);

        match (detached.next(), detached.next()) {
            (Some(pid), None) => {
                debug!(
                    "`{}` detached ({}) as {pid}",
                    self.spec.run, self.spec.expect
                );
                Ok(pid)
            }
            (Some(first), Some(second)) => {
                Err(ConfigError::AmbiguousFork { first, second }.into())
            }
            (None, _) => Err(ConfigError::NoForkedProcess(self.spec.run.clone()).into()),
        }
    }

    fn spawn(&self, argv: &[String]) -> Result<Child, SupervisorError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ConfigError::MissingField("run").into());
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(output(self.spec.stdout.as_deref())?)
            .stderr(output(self.spec.stderr.as_deref())?);

        let credentials = self.spec.credentials.clone();
        if let Some(credentials) = &credentials {
            cmd.envs(credentials.env_overrides());
        }

        unsafe {
            cmd.pre_exec(move || {
                if let Some(credentials) = &credentials {
                    credentials.apply()?;
                }
                privilege::detach_session()
            });
        }

        debug!("Executing command: {cmd:?}");
        cmd.spawn().map_err(|source| {
            error!("Failed to start `{}`: {source}", argv.join(" "));
            SupervisorError::Spawn {
                command: argv.join(" "),
                source,
            }
        })
    }

    /// Runs a hook script to completion. Absent scripts are skipped.
    fn run_hook(&self, hook: &str, script: Option<&Path>) -> Result<(), SupervisorError> {
        let Some(script) = script.filter(|path| path.exists()) else {
            return Ok(());
        };

        let command = script.display().to_string();
        debug!("Running {hook} hook: `{command}`");
        let mut child = self.spawn(&[command.clone()])?;

        match wait_with_timeout(&mut child, self.spec.hook_timeout)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => {
                warn!("{hook} hook `{command}` exited with {status}");
                Err(SupervisorError::Hook {
                    hook: hook.to_string(),
                    command,
                    status,
                })
            }
            None => {
                warn!("{hook} hook `{command}` timed out; killing it");
                let _ = child.kill();
                let _ = child.wait();
                Err(SupervisorError::HookTimeout {
                    hook: hook.to_string(),
                    command,
                })
            }
        }
    }
}

impl<T: ProcessTable> Unit for SupervisedCommand<T> {
    fn payload(&self) -> Payload {
        Payload::External
    }

    fn run(&mut self, _ctx: &RunContext) -> Result<RunOutcome, SupervisorError> {
        self.call().map(RunOutcome::Spawned)
    }

    fn pre_start(&mut self) -> Result<(), SupervisorError> {
        self.run_hook("pre-start", self.spec.hooks.pre_start.as_deref())
    }

    fn pre_stop(&mut self) -> Result<(), SupervisorError> {
        self.run_hook("pre-stop", self.spec.hooks.pre_stop.as_deref())
    }

    fn post_stop(&mut self) -> Result<(), SupervisorError> {
        self.run_hook("post-stop", self.spec.hooks.post_stop.as_deref())
    }
}

/// Splits a run script into argv with shell quoting rules.
pub fn split_command(run: &str) -> Result<Vec<String>, ConfigError> {
    let argv = shell_words::split(run).map_err(|err| ConfigError::InvalidValue {
        field: "run",
        reason: err.to_string(),
    })?;
    if argv.is_empty() {
        return Err(ConfigError::MissingField("run"));
    }
    Ok(argv)
}

fn output(path: Option<&Path>) -> Result<Stdio, SupervisorError> {
    match path {
        None => Ok(Stdio::null()),
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok(Stdio::from(file))
        }
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}
