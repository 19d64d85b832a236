//! A master process keeping a fixed number of forked workers alive.
//!
//! Each slot owns one worker process plus a heartbeat living in an anonymous
//! shared mapping, so the worker can stamp it after `fork` and the master
//! reads the same word.
use std::{
    io::{self, Write},
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::Duration,
};

use chrono::Utc;
use nix::{
    errno::Errno,
    sys::{
        signal::{self, Signal},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::{ForkResult, Pid, fork},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{ConfigError, SupervisorError},
    lifecycle::{RunOutcome, Terminator, Unit},
    params::Params,
    process::LiveProcessTable,
    signals::{self, ControlEvent, RunContext, SignalPolicy},
};

const SIGNAL_CHECK_STEP: Duration = Duration::from_millis(100);

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Last-activity timestamp shared between the master and one worker.
///
/// Single writer (the worker), single reader (the master). Only staleness
/// matters, so relaxed ordering is enough.
#[derive(Debug)]
pub struct Heartbeat {
    stamp: NonNull<AtomicU64>,
}

impl Heartbeat {
    /// Maps a fresh shared page and stamps it with the current time.
    pub fn new() -> io::Result<Self> {
        // SAFETY: anonymous mapping, no file descriptor involved; the result
        // is checked against MAP_FAILED before use.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mem::size_of::<AtomicU64>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let stamp = NonNull::new(addr.cast::<AtomicU64>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;

        let heartbeat = Self { stamp };
        heartbeat.beat();
        Ok(heartbeat)
    }

    fn cell(&self) -> &AtomicU64 {
        // SAFETY: the mapping is page aligned, zero-initialised and lives
        // until `drop`.
        unsafe { self.stamp.as_ref() }
    }

    /// Records activity now.
    pub fn beat(&self) {
        self.cell().store(now_millis(), Ordering::Relaxed);
    }

    /// Time since the last beat.
    pub fn age(&self) -> Duration {
        let last = self.cell().load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.stamp.as_ptr().cast(), mem::size_of::<AtomicU64>());
        }
    }
}

/// What a worker sees while running: its heartbeat and control events.
pub struct WorkerContext<'a> {
    heartbeat: &'a Heartbeat,
    run: RunContext,
}

impl WorkerContext<'_> {
    /// Tells the master this worker is still making progress.
    pub fn beat(&self) {
        self.heartbeat.beat();
    }

    pub fn poll(&self) -> Option<ControlEvent> {
        self.run.poll()
    }

    pub fn params(&self) -> &Params {
        self.run.params()
    }
}

/// One long-running worker. Runs in its own forked process.
pub trait Worker {
    /// Stable slot number, preserved across replacements.
    fn ordinal(&self) -> usize;

    fn run(&mut self, ctx: &WorkerContext<'_>) -> Result<(), SupervisorError>;
}

/// Supplies the initial workers and their replacements.
pub trait WorkerFactory {
    type Worker: Worker;

    fn workers(&mut self) -> Vec<Self::Worker>;

    /// Builds the successor of a worker whose process exited.
    fn replacement(&mut self, old: &Self::Worker) -> Self::Worker;
}

/// Pool supervision settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Terminate workers whose heartbeat is older than `worker_timeout`.
    pub worker_activity: bool,
    pub worker_timeout: Duration,
    pub poll_interval: Duration,
    pub signals: SignalPolicy,
    pub stop_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            worker_activity: false,
            worker_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            signals: SignalPolicy::default(),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

struct Slot<W> {
    worker: W,
    /// `None` while the replacement could not be forked yet.
    pid: Option<Pid>,
    heartbeat: Heartbeat,
}

/// What one poll tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Ordinals whose worker exited and was replaced.
    pub replaced: Vec<usize>,
    /// Ordinals terminated for a stale heartbeat.
    pub stalled: Vec<usize>,
    /// Ordinals whose replacement failed to fork; retried on the next tick.
    pub pending: Vec<usize>,
}

/// Keeps one live-or-pending worker per slot.
pub struct WorkerPool<F: WorkerFactory> {
    factory: F,
    settings: PoolSettings,
    params: Params,
    slots: Vec<Slot<F::Worker>>,
}

impl<F: WorkerFactory> WorkerPool<F> {
    pub fn new(factory: F, settings: PoolSettings) -> Self {
        Self {
            factory,
            settings,
            params: Params::default(),
            slots: Vec::new(),
        }
    }

    /// Parameters handed to every worker's context.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// `(ordinal, pid)` for every slot with a forked worker.
    pub fn slots(&self) -> Vec<(usize, u32)> {
        self.slots
            .iter()
            .filter_map(|slot| {
                slot.pid
                    .map(|pid| (slot.worker.ordinal(), pid.as_raw() as u32))
            })
            .collect()
    }

    /// Forks every worker the factory hands out. Stops at the first failure;
    /// workers forked before it stay in the pool.
    pub fn spawn_all(&mut self) -> Result<(), SupervisorError> {
        for mut worker in self.factory.workers() {
            let ordinal = worker.ordinal();
            if self.slots.iter().any(|slot| slot.worker.ordinal() == ordinal) {
                return Err(ConfigError::InvalidValue {
                    field: "ordinal",
                    reason: format!("worker ordinal {ordinal} is used twice"),
                }
                .into());
            }

            let heartbeat = Heartbeat::new()?;
            let pid = Self::fork_worker(&self.settings, &self.params, &mut worker, &heartbeat)?;
            info!("worker {ordinal} started as {pid}");
            self.slots.push(Slot {
                worker,
                pid: Some(pid),
                heartbeat,
            });
        }
        Ok(())
    }

    fn fork_worker(
        settings: &PoolSettings,
        params: &Params,
        worker: &mut F::Worker,
        heartbeat: &Heartbeat,
    ) -> Result<Pid, SupervisorError> {
        heartbeat.beat();
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        // SAFETY: the child never returns into the caller; it runs the
        // worker and leaves through `_exit`.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => Ok(child),
            ForkResult::Child => {
                let code = match Self::run_worker(settings, params, worker, heartbeat) {
                    Ok(()) => 0,
                    Err(err) => {
                        error!("worker {} failed: {err}", worker.ordinal());
                        1
                    }
                };
                let _ = io::stdout().flush();
                unsafe { libc::_exit(code) }
            }
        }
    }

    fn run_worker(
        settings: &PoolSettings,
        params: &Params,
        worker: &mut F::Worker,
        heartbeat: &Heartbeat,
    ) -> Result<(), SupervisorError> {
        signals::install_for_worker(&settings.signals)?;
        let ctx = WorkerContext {
            heartbeat,
            run: RunContext::new(params.clone()),
        };
        worker.run(&ctx)
    }

    /// One pass over every slot: stale workers are terminated, exited
    /// workers are reaped and replaced under the same ordinal. A replacement
    /// that fails to fork leaves the slot pending until a later tick.
    pub fn tick(&mut self) -> TickReport {
        let terminator = Terminator::new(self.settings.signals, self.settings.stop_timeout);
        let mut report = TickReport::default();

        for index in 0..self.slots.len() {
            let ordinal = self.slots[index].worker.ordinal();

            if let Some(pid) = self.slots[index].pid {
                if self.settings.worker_activity {
                    let age = self.slots[index].heartbeat.age();
                    if age > self.settings.worker_timeout {
                        warn!("worker {ordinal} ({pid}) idle for {age:?}; terminating");
                        if let Err(err) =
                            terminator.terminate(&LiveProcessTable, pid.as_raw() as u32, false)
                        {
                            error!("cannot stop worker {ordinal} ({pid}): {err}");
                        }
                        report.stalled.push(ordinal);
                    }
                }

                match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => continue,
                    Ok(status) => debug!("worker {ordinal} ({pid}) exited: {status:?}"),
                    // Already reaped elsewhere.
                    Err(Errno::ECHILD) => debug!("worker {ordinal} ({pid}) already reaped"),
                    Err(err) => {
                        warn!("cannot check worker {ordinal} ({pid}): {err}");
                        continue;
                    }
                }

                let successor = self.factory.replacement(&self.slots[index].worker);
                let slot = &mut self.slots[index];
                slot.worker = successor;
                slot.pid = None;
            }

            let slot = &mut self.slots[index];
            match Self::fork_worker(&self.settings, &self.params, &mut slot.worker, &slot.heartbeat)
            {
                Ok(pid) => {
                    info!("worker {ordinal} replaced as {pid}");
                    slot.pid = Some(pid);
                    report.replaced.push(ordinal);
                }
                Err(err) => {
                    error!("cannot fork worker {ordinal}, retrying next tick: {err}");
                    report.pending.push(ordinal);
                }
            }
        }

        report
    }

    /// Sends `signal` to every worker. Failures are logged and the broadcast
    /// continues.
    pub fn broadcast(&self, signal: Signal) {
        for slot in &self.slots {
            let Some(pid) = slot.pid else {
                continue;
            };
            if let Err(err) = signal::kill(pid, signal) {
                warn!(
                    "cannot deliver {signal} to worker {} ({pid}): {err}",
                    slot.worker.ordinal()
                );
            }
        }
    }

    /// Hard-kills every worker without waiting for them.
    pub fn kill_all(&self) {
        self.broadcast(self.settings.signals.kill);
    }

    /// Hard-kills and reaps every worker, emptying the pool.
    pub fn shutdown(&mut self) {
        self.kill_all();
        for pid in self.slots.drain(..).filter_map(|slot| slot.pid) {
            let _ = waitpid(pid, None);
        }
    }

    /// Sleeps one poll interval, waking early for control events.
    fn wait_tick(&self, ctx: &RunContext) -> Option<ControlEvent> {
        let mut remaining = self.settings.poll_interval;
        while !remaining.is_zero() {
            if let Some(event) = ctx.poll() {
                return Some(event);
            }
            let step = remaining.min(SIGNAL_CHECK_STEP);
            thread::sleep(step);
            remaining -= step;
        }
        ctx.poll()
    }
}

impl<F: WorkerFactory> Unit for WorkerPool<F> {
    /// Workers never outlive this call: they are killed and reaped on
    /// terminate and on any error.
    fn run(&mut self, ctx: &RunContext) -> Result<RunOutcome, SupervisorError> {
        self.params = ctx.params().clone();
        if let Err(err) = self.spawn_all() {
            error!("cannot start workers: {err}");
            self.shutdown();
            return Err(err);
        }

        loop {
            match self.wait_tick(ctx) {
                Some(ControlEvent::Terminate) => {
                    info!("terminating {} workers", self.slots.len());
                    self.shutdown();
                    return Ok(RunOutcome::Exited);
                }
                Some(ControlEvent::Reload) => {
                    if let Err(err) = Unit::reload(self) {
                        self.shutdown();
                        return Err(err);
                    }
                }
                None => {}
            }
            self.tick();
        }
    }

    fn reload(&mut self) -> Result<(), SupervisorError> {
        debug!("forwarding reload to workers");
        self.broadcast(self.settings.signals.reload);
        Ok(())
    }
}
