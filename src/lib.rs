//! pidwarden supervises daemons through their pidfiles. It starts, stops,
//! reloads and reports on units, double-forks in-process payloads, resolves
//! the real pid of self-daemonizing commands, hunts down lost processes that
//! match a unit but escaped its tracked tree, and keeps pools of forked
//! workers alive.

/// CLI interface.
pub mod cli;

/// External command units.
pub mod command;

/// Configuration management.
pub mod config;

/// Error handling.
pub mod error;

/// Lifecycle engine for one unit.
pub mod lifecycle;

/// Declarative start parameters.
pub mod params;

/// Pidfile handling.
pub mod pidfile;

/// Worker pools.
pub mod pool;

/// User switching and session detachment.
pub mod privilege;

/// Process table queries.
pub mod process;

/// Unit registry.
pub mod registry;

/// Signal policy and control flags.
pub mod signals;
