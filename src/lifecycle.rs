//! Lifecycle engine for one supervised unit.
//!
//! The pidfile and the OS process table are the only truth. Nothing the
//! controller remembers in memory is trusted across calls: every operation
//! re-reads the pidfile and re-resolves the process.
use std::{
    collections::HashSet,
    fmt,
    fs::{File, OpenOptions},
    io::{self, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::{signal, wait::waitpid},
    unistd::{ForkResult, Pid, fork, getpid},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{ConfigError, SupervisorError},
    params::Params,
    pidfile::{PidFile, PidFileGuard},
    privilege::{self, Credentials},
    process::{LiveProcessTable, ProcessPattern, ProcessRecord, ProcessTable},
    signals::{self, RunContext, SignalPolicy},
};

/// Interval between signal deliveries in the termination loop.
pub const TERMINATE_INTERVAL: Duration = Duration::from_millis(200);

/// Upper bound on lost-process sweeps during `stop`.
const MAX_LOST_SWEEPS: usize = 5;

/// Where a unit's payload executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Code running inside the daemonized controller process.
    InProcess,
    /// An external command that detaches on its own.
    External,
}

/// Result of running a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// An in-process payload returned.
    Exited,
    /// An external payload was launched; the value is its canonical daemon pid.
    Spawned(u32),
}

/// Capabilities a supervised unit provides to the lifecycle engine.
pub trait Unit {
    fn payload(&self) -> Payload {
        Payload::InProcess
    }

    /// Runs the payload. In-process payloads should return once
    /// [`RunContext::poll`] yields [`signals::ControlEvent::Terminate`] and call
    /// [`Unit::reload`] on [`signals::ControlEvent::Reload`].
    fn run(&mut self, ctx: &RunContext) -> Result<RunOutcome, SupervisorError>;

    fn pre_start(&mut self) -> Result<(), SupervisorError> {
        Ok(())
    }

    fn pre_stop(&mut self) -> Result<(), SupervisorError> {
        Ok(())
    }

    fn post_stop(&mut self) -> Result<(), SupervisorError> {
        Ok(())
    }

    fn reload(&mut self) -> Result<(), SupervisorError> {
        Ok(())
    }
}

/// Durable identity of a unit: its pidfile plus the pattern recognising every
/// OS process that plausibly belongs to it.
#[derive(Debug, Clone)]
pub struct UnitIdentity {
    pidfile: PidFile,
    default_pidfile: bool,
    pattern: ProcessPattern,
}

impl UnitIdentity {
    /// Derives the pattern from the running executable's basename. With a
    /// built-in (default) pidfile the invocation `<exe> ... start` is enough to
    /// recognise the unit; otherwise the pidfile path must appear too.
    pub fn new(pidfile: impl AsRef<Path>, default_pidfile: bool) -> Result<Self, ConfigError> {
        let pidfile = absolute(pidfile.as_ref());
        let executable = executable_name();
        let pattern = if default_pidfile {
            format!(r"(.*?){}(\x00)+(.*?)start(\x00)*", regex::escape(&executable))
        } else {
            format!(
                r"(.*?){}(\x00)+(.*?){}(.*?)start(\x00)*",
                regex::escape(&executable),
                regex::escape(&pidfile.to_string_lossy())
            )
        };

        Ok(Self {
            pidfile: PidFile::new(pidfile),
            default_pidfile,
            pattern: ProcessPattern::new(&pattern)?,
        })
    }

    /// Identity with an explicit match pattern.
    pub fn with_pattern(pidfile: impl AsRef<Path>, pattern: ProcessPattern) -> Self {
        Self {
            pidfile: PidFile::new(absolute(pidfile.as_ref())),
            default_pidfile: false,
            pattern,
        }
    }

    pub fn pidfile(&self) -> &PidFile {
        &self.pidfile
    }

    pub fn has_default_pidfile(&self) -> bool {
        self.default_pidfile
    }

    pub fn pattern(&self) -> &ProcessPattern {
        &self.pattern
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn executable_name() -> String {
    std::env::args_os()
        .next()
        .map(PathBuf::from)
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "pidwarden".to_string())
}

/// Standard stream targets for a daemonized payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioPaths {
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl Default for StdioPaths {
    fn default() -> Self {
        let null = PathBuf::from("/dev/null");
        Self {
            stdin: null.clone(),
            stdout: null.clone(),
            stderr: null,
        }
    }
}

/// Per-unit supervision settings used by the engine.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub signals: SignalPolicy,
    pub stop_timeout: Duration,
    /// Account an in-process payload drops to after the first fork.
    pub user: Option<String>,
    pub stdio: StdioPaths,
    pub params: Params,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            signals: SignalPolicy::default(),
            stop_timeout: Duration::from_secs(5),
            user: None,
            stdio: StdioPaths::default(),
            params: Params::default(),
        }
    }
}

/// The polite-then-forceful termination loop shared by `stop`, lost-process
/// cleanup and pool workers.
#[derive(Debug, Clone, Copy)]
pub struct Terminator {
    pub signals: SignalPolicy,
    pub stop_timeout: Duration,
    pub interval: Duration,
}

impl Terminator {
    pub fn new(signals: SignalPolicy, stop_timeout: Duration) -> Self {
        Self {
            signals,
            stop_timeout,
            interval: TERMINATE_INTERVAL,
        }
    }

    /// Signals `pid` until it is gone. Sends the terminate signal until the
    /// stop timeout elapses and the kill signal afterwards (or from the start
    /// when `force` is set). "No such process" ends the loop successfully; any
    /// other delivery failure ends it with an error.
    pub fn terminate<T: ProcessTable>(
        &self,
        table: &T,
        pid: u32,
        force: bool,
    ) -> Result<(), SupervisorError> {
        let Some(target) = signal_target(pid) else {
            return Ok(());
        };
        let started = Instant::now();
        loop {
            let escalate = force || started.elapsed() > self.stop_timeout;
            let signal = if escalate {
                self.signals.kill
            } else {
                self.signals.terminate
            };

            match signal::kill(target, signal) {
                Ok(()) => {}
                Err(Errno::ESRCH) => return Ok(()),
                Err(source) => {
                    warn!("Couldn't stop process {pid}: {source}");
                    return Err(SupervisorError::SignalDelivery {
                        pid,
                        signal,
                        source,
                    });
                }
            }

            thread::sleep(self.interval);

            // A zombie has exited; it only waits for its parent to reap it.
            if table.get(pid).is_none_or(|process| process.is_zombie()) {
                debug!("process {pid} is gone");
                return Ok(());
            }
        }
    }
}

/// How the tracked pid resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracked {
    /// No pidfile, or one without a usable pid.
    Stopped,
    /// Live process whose cmdline matches the unit.
    Running(u32),
    /// The pidfile names a process that no longer exists.
    NotFound(u32),
    /// The pid was recycled by an unrelated process.
    Foreign(u32),
}

impl fmt::Display for Tracked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tracked::Stopped => write!(f, "stopped"),
            Tracked::Running(pid) => write!(f, "running ({pid})"),
            Tracked::NotFound(pid) => write!(f, "process with pid {pid} not found"),
            Tracked::Foreign(pid) => {
                write!(f, "pid {pid} is found but it belongs to another process")
            }
        }
    }
}

fn join_pids(pids: &[u32]) -> String {
    pids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Result of `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub tracked: Tracked,
    pub lost: Vec<u32>,
}

impl StatusReport {
    /// Healthy means running or cleanly stopped, with no stray relatives.
    pub fn is_healthy(&self) -> bool {
        matches!(self.tracked, Tracked::Stopped | Tracked::Running(_)) && self.lost.is_empty()
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tracked)?;
        if !self.lost.is_empty() {
            write!(f, "\nlost pids: {}", join_pids(&self.lost))?;
        }
        Ok(())
    }
}

/// Result of `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// An external payload is running under this pid.
    Started(u32),
    /// The daemon was forked off; this is the launching process.
    Detached,
    /// A foreground in-process payload ran to completion.
    Finished,
}

impl fmt::Display for StartOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartOutcome::Started(pid) => write!(f, "started ({pid})"),
            StartOutcome::Detached => write!(f, "started"),
            StartOutcome::Finished => write!(f, "finished"),
        }
    }
}

/// What happened to the tracked process during `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainStop {
    NotRunning,
    Stopped(u32),
    CannotStop(u32),
    /// The pidfile named an unrelated process; it was left alone.
    Foreign(u32),
}

/// Result of `stop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub main: MainStop,
    pub lost_stopped: Vec<u32>,
    pub lost_failed: Vec<u32>,
}

impl StopReport {
    pub fn is_success(&self) -> bool {
        !matches!(self.main, MainStop::CannotStop(_)) && self.lost_failed.is_empty()
    }
}

impl fmt::Display for StopReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.main {
            MainStop::NotRunning => write!(f, "not running")?,
            MainStop::Stopped(_) => write!(f, "stopped")?,
            MainStop::CannotStop(pid) => write!(f, "cannot stop process ({pid})")?,
            MainStop::Foreign(pid) => {
                write!(f, "pid {pid} belongs to another process, pidfile removed")?
            }
        }
        for pid in &self.lost_stopped {
            write!(f, "\nstopped lost process ({pid})")?;
        }
        for pid in &self.lost_failed {
            write!(f, "\ncannot stop lost process ({pid})")?;
        }
        Ok(())
    }
}

/// Result of `reload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Reloaded(u32),
    /// Nothing live to signal.
    Stopped,
}

impl fmt::Display for ReloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadOutcome::Reloaded(_) => write!(f, "reloaded"),
            ReloadOutcome::Stopped => write!(f, "stopped"),
        }
    }
}

/// Drives start/stop/restart/reload/status for one unit.
pub struct Controller<U, T = LiveProcessTable> {
    unit: U,
    identity: UnitIdentity,
    options: ControllerOptions,
    table: T,
}

impl<U: Unit> Controller<U> {
    pub fn new(unit: U, identity: UnitIdentity, options: ControllerOptions) -> Self {
        Self::with_table(unit, identity, options, LiveProcessTable)
    }
}

impl<U: Unit, T: ProcessTable> Controller<U, T> {
    /// Controller reading processes from `table` instead of the live OS table.
    pub fn with_table(
        unit: U,
        identity: UnitIdentity,
        options: ControllerOptions,
        table: T,
    ) -> Self {
        Self {
            unit,
            identity,
            options,
            table,
        }
    }

    pub fn unit(&self) -> &U {
        &self.unit
    }

    pub fn unit_mut(&mut self) -> &mut U {
        &mut self.unit
    }

    pub fn identity(&self) -> &UnitIdentity {
        &self.identity
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut ControllerOptions {
        &mut self.options
    }

    pub fn terminator(&self) -> Terminator {
        Terminator::new(self.options.signals, self.options.stop_timeout)
    }

    /// Pid currently written in the pidfile.
    pub fn pid(&self) -> Option<u32> {
        self.identity.pidfile.read()
    }

    fn live_process(&self, pid: u32) -> Option<ProcessRecord> {
        self.table.get(pid).filter(|process| !process.is_zombie())
    }

    /// Resolves the pidfile against the process table.
    pub fn tracked(&self) -> Tracked {
        let Some(pid) = self.pid() else {
            return Tracked::Stopped;
        };
        match self.live_process(pid) {
            None => Tracked::NotFound(pid),
            Some(process) if self.identity.pattern.is_match(&process.cmdline) => {
                Tracked::Running(pid)
            }
            Some(_) => Tracked::Foreign(pid),
        }
    }

    /// Processes that match the unit but are neither the controller's own
    /// invocation chain nor the tracked process and its descendants.
    pub fn lost_processes(&self) -> Vec<ProcessRecord> {
        let own_pid = std::process::id();
        let mut excluded = HashSet::from([own_pid]);
        if let Some(me) = self.table.get(own_pid) {
            excluded.extend(self.table.ancestors(&me).into_iter().map(|p| p.pid));
        }

        if let Some(tracked) = self.pid().and_then(|pid| self.live_process(pid)) {
            excluded.extend(self.table.descendants(&tracked).into_iter().map(|p| p.pid));
            excluded.insert(tracked.pid);
        }

        let mut lost: Vec<_> = self
            .table
            .find(&self.identity.pattern)
            .into_iter()
            .filter(|process| !process.is_zombie() && !excluded.contains(&process.pid))
            .collect();
        lost.sort_by_key(|process| process.pid);
        lost
    }

    pub fn status(&self) -> StatusReport {
        let tracked = self.tracked();
        let lost = self.lost_processes().into_iter().map(|p| p.pid).collect();
        StatusReport { tracked, lost }
    }

    /// Starts the unit unless it is already running.
    ///
    /// In-process payloads are daemonized when `daemonize` is set; the call
    /// then returns [`StartOutcome::Detached`] in the launching process while
    /// the daemon runs the payload and exits when it returns.
    pub fn start(&mut self, daemonize: bool) -> Result<StartOutcome, SupervisorError> {
        if let Tracked::Running(pid) = self.tracked() {
            info!("already running ({pid})");
            return Err(SupervisorError::AlreadyRunning { pid });
        }

        self.unit.pre_start()?;
        debug!("starting daemon...");

        let ctx = RunContext::new(self.options.params.clone());
        match self.unit.payload() {
            Payload::External => match self.unit.run(&ctx)? {
                RunOutcome::Spawned(pid) => {
                    self.identity.pidfile.write(pid)?;
                    Ok(StartOutcome::Started(pid))
                }
                RunOutcome::Exited => Ok(StartOutcome::Finished),
            },
            Payload::InProcess if daemonize => {
                let credentials = self.credentials()?;
                let fork = daemonize_process(
                    &self.identity.pidfile,
                    credentials.as_ref(),
                    &self.options.stdio,
                );
                match fork {
                    Fork::Launcher => Ok(StartOutcome::Detached),
                    Fork::Daemon(pid) => {
                        let code = match self.run_in_process(pid, &ctx) {
                            Ok(()) => 0,
                            Err(err) => {
                                error!("payload failed: {err}");
                                1
                            }
                        };
                        std::process::exit(code)
                    }
                }
            }
            Payload::InProcess => {
                let pid = std::process::id();
                self.identity.pidfile.write(pid)?;
                self.run_in_process(pid, &ctx)?;
                Ok(StartOutcome::Finished)
            }
        }
    }

    fn credentials(&self) -> Result<Option<Credentials>, SupervisorError> {
        self.options
            .user
            .as_deref()
            .map(|user| Credentials::lookup(user, None))
            .transpose()
    }

    fn run_in_process(&mut self, pid: u32, ctx: &RunContext) -> Result<(), SupervisorError> {
        let _guard = PidFileGuard::new(self.identity.pidfile.clone(), pid);
        signals::install(&self.options.signals)?;
        self.unit.run(ctx)?;
        Ok(())
    }

    /// Stops the tracked process, then sweeps lost processes.
    pub fn stop(&mut self, force: bool) -> Result<StopReport, SupervisorError> {
        let main = self.stop_main_process(force)?;
        let (lost_stopped, lost_failed) = self.kill_lost_processes();
        Ok(StopReport {
            main,
            lost_stopped,
            lost_failed,
        })
    }

    fn stop_main_process(&mut self, force: bool) -> Result<MainStop, SupervisorError> {
        let Some(pid) = self.pid() else {
            self.identity.pidfile.remove()?;
            return Ok(MainStop::NotRunning);
        };

        if let Some(process) = self.live_process(pid) {
            if !self.identity.pattern.is_match(&process.cmdline) {
                warn!("pid {pid} belongs to another process; leaving it alone");
                self.identity.pidfile.remove()?;
                return Ok(MainStop::Foreign(pid));
            }
            self.unit.pre_stop()?;
        }

        debug!("stopping {pid}...");
        match self.terminator().terminate(&self.table, pid, force) {
            Ok(()) => {
                self.identity.pidfile.remove()?;
                debug!("post stopping...");
                self.unit.post_stop()?;
                info!("stopped {pid}");
                Ok(MainStop::Stopped(pid))
            }
            Err(err) => {
                error!("cannot stop process ({pid}): {err}");
                Ok(MainStop::CannotStop(pid))
            }
        }
    }

    /// Force-terminates lost processes until none remain.
    fn kill_lost_processes(&self) -> (Vec<u32>, Vec<u32>) {
        let terminator = self.terminator();
        let mut stopped = Vec::new();
        let mut failed = Vec::new();

        for _ in 0..MAX_LOST_SWEEPS {
            let lost = self.lost_processes();
            if lost.is_empty() {
                break;
            }

            let mut progressed = false;
            for process in lost {
                if failed.contains(&process.pid) {
                    continue;
                }
                match terminator.terminate(&self.table, process.pid, true) {
                    Ok(()) => {
                        info!("stopped lost process ({})", process.pid);
                        stopped.push(process.pid);
                        progressed = true;
                    }
                    Err(err) => {
                        warn!("cannot stop lost process ({}): {err}", process.pid);
                        failed.push(process.pid);
                    }
                }
            }

            if !progressed {
                break;
            }
        }

        (stopped, failed)
    }

    /// `stop` then `start`; no atomicity across the gap.
    pub fn restart(&mut self) -> Result<StartOutcome, SupervisorError> {
        let report = self.stop(false)?;
        debug!("restart stop phase: {report}");
        self.start(true)
    }

    /// Delivers the reload signal to a live tracked process.
    pub fn reload(&self) -> Result<ReloadOutcome, SupervisorError> {
        let Some(pid) = self.pid().filter(|pid| self.live_process(*pid).is_some()) else {
            return Ok(ReloadOutcome::Stopped);
        };

        let Some(target) = signal_target(pid) else {
            return Ok(ReloadOutcome::Stopped);
        };
        let signal = self.options.signals.reload;
        match signal::kill(target, signal) {
            Ok(()) => Ok(ReloadOutcome::Reloaded(pid)),
            Err(Errno::ESRCH) => Ok(ReloadOutcome::Stopped),
            Err(source) => Err(SupervisorError::SignalDelivery {
                pid,
                signal,
                source,
            }),
        }
    }
}

/// A pid that can be signalled on its own. Values outside `1..=i32::MAX` would
/// address a process group or every process, so they yield `None`.
fn signal_target(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
}

/// Which side of the daemonization a caller ended up on.
enum Fork {
    Launcher,
    Daemon(u32),
}

/// Unrecoverable daemonization failure: report and exit with non-zero status.
fn fatal(stage: &'static str, err: impl fmt::Display) -> ! {
    let err = SupervisorError::FatalInit {
        stage,
        reason: err.to_string(),
    };
    eprintln!("{err}");
    std::process::exit(1)
}

/// Double-fork daemonization. The launching process gets [`Fork::Launcher`]
/// after the intermediate child has exited; only the final daemon gets
/// [`Fork::Daemon`]. Any failure past the first fork exits the child.
fn daemonize_process(
    pidfile: &PidFile,
    credentials: Option<&Credentials>,
    stdio: &StdioPaths,
) -> Fork {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    // SAFETY: the child only performs async-signal-safe setup before forking
    // again and never returns into the caller's stack on failure.
    match unsafe { fork() } {
        Err(err) => fatal("fork #1", err),
        Ok(ForkResult::Parent { child }) => {
            let _ = waitpid(child, None);
            return Fork::Launcher;
        }
        Ok(ForkResult::Child) => {}
    }

    if let Some(credentials) = credentials
        && let Err(err) = unsafe { credentials.apply() }
    {
        fatal("switching user", err);
    }
    if let Err(err) = unsafe { privilege::detach_session() } {
        fatal("setsid", err);
    }

    match unsafe { fork() } {
        Err(err) => fatal("fork #2", err),
        Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
        Ok(ForkResult::Child) => {}
    }

    let pid = getpid().as_raw() as u32;
    if let Err(err) = pidfile.write(pid) {
        fatal("writing pidfile", err);
    }
    if let Err(err) = redirect_stdio(stdio) {
        fatal("redirecting standard streams", err);
    }
    debug!("redirected standard file descriptors");
    Fork::Daemon(pid)
}

fn redirect_stdio(stdio: &StdioPaths) -> io::Result<()> {
    let stdin = File::open(&stdio.stdin)?;
    let append = |path: &Path| OpenOptions::new().create(true).append(true).open(path);
    let stdout = append(&stdio.stdout)?;
    let stderr = append(&stdio.stderr)?;

    for (file, target) in [
        (stdin.as_raw_fd(), libc::STDIN_FILENO),
        (stdout.as_raw_fd(), libc::STDOUT_FILENO),
        (stderr.as_raw_fd(), libc::STDERR_FILENO),
    ] {
        if unsafe { libc::dup2(file, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
