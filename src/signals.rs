//! Signal configuration and the flag-only handlers installed in supervised payloads.
//!
//! Handlers never run unit logic. They record the request in an atomic and
//! the payload picks it up from [`RunContext::poll`] on its next iteration.
use std::sync::atomic::{AtomicBool, Ordering};

use nix::{
    errno::Errno,
    sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal},
};

use crate::{error::ConfigError, params::Params};

static TERMINATE_REQUESTED: AtomicBool = AtomicBool::new(false);
static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_: libc::c_int) {
    TERMINATE_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_reload(_: libc::c_int) {
    RELOAD_REQUESTED.store(true, Ordering::SeqCst);
}

/// The three signals a unit is controlled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalPolicy {
    /// Polite stop request.
    pub terminate: Signal,
    /// Sent once the stop timeout has elapsed, or immediately when forced.
    pub kill: Signal,
    /// Delivered by `reload`.
    pub reload: Signal,
}

impl Default for SignalPolicy {
    fn default() -> Self {
        Self {
            terminate: Signal::SIGTERM,
            kill: Signal::SIGKILL,
            reload: Signal::SIGHUP,
        }
    }
}

impl SignalPolicy {
    /// Builds a policy from raw signal numbers, falling back to the defaults
    /// for any that are absent.
    pub fn from_numbers(
        terminate: Option<i32>,
        kill: Option<i32>,
        reload: Option<i32>,
    ) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            terminate: parse_signal("terminate", terminate, defaults.terminate)?,
            kill: parse_signal("kill", kill, defaults.kill)?,
            reload: parse_signal("reload", reload, defaults.reload)?,
        })
    }
}

fn parse_signal(
    field: &'static str,
    value: Option<i32>,
    default: Signal,
) -> Result<Signal, ConfigError> {
    match value {
        None => Ok(default),
        Some(number) => Signal::try_from(number)
            .map_err(|_| ConfigError::InvalidSignal { field, value: number }),
    }
}

/// A control request recorded by a signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Terminate,
    Reload,
}

/// What a running payload sees of its supervisor: pending control events and
/// the parameters it was started with.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    params: Params,
}

impl RunContext {
    pub fn new(params: Params) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Returns the next pending event. Terminate stays pending once seen;
    /// reload is consumed.
    pub fn poll(&self) -> Option<ControlEvent> {
        if TERMINATE_REQUESTED.load(Ordering::SeqCst) {
            return Some(ControlEvent::Terminate);
        }
        if RELOAD_REQUESTED.swap(false, Ordering::SeqCst) {
            return Some(ControlEvent::Reload);
        }
        None
    }

    pub fn terminate_requested(&self) -> bool {
        TERMINATE_REQUESTED.load(Ordering::SeqCst)
    }
}

fn set_handler(signal: Signal, handler: SigHandler) -> Result<(), Errno> {
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: the handlers only store into static atomics.
    unsafe { signal::sigaction(signal, &action) }?;
    Ok(())
}

/// Routes the policy's terminate and reload signals into the flags read by
/// [`RunContext::poll`].
pub fn install(policy: &SignalPolicy) -> Result<(), Errno> {
    set_handler(policy.terminate, SigHandler::Handler(on_terminate))?;
    set_handler(policy.reload, SigHandler::Handler(on_reload))
}

/// Handler layout for a freshly forked pool worker: terminate regains its
/// default action so the pool can stop the worker, reload stays a flag.
pub fn install_for_worker(policy: &SignalPolicy) -> Result<(), Errno> {
    TERMINATE_REQUESTED.store(false, Ordering::SeqCst);
    RELOAD_REQUESTED.store(false, Ordering::SeqCst);
    set_handler(policy.terminate, SigHandler::SigDfl)?;
    set_handler(policy.reload, SigHandler::Handler(on_reload))
}
