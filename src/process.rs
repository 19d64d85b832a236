//! Point-in-time queries against the OS process table.
//!
//! Nothing here is cached. Every call re-reads the table because pids are
//! recycled and a stale record is worse than a fresh miss.
use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use sysinfo::{
    Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind,
};

use crate::error::ConfigError;

/// Coarse scheduler state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Sleeping,
    DiskWait,
    Zombie,
    Stopped,
    Other,
}

impl From<ProcessStatus> for ProcessState {
    fn from(status: ProcessStatus) -> Self {
        match status {
            ProcessStatus::Run => ProcessState::Running,
            ProcessStatus::Sleep | ProcessStatus::Idle => ProcessState::Sleeping,
            ProcessStatus::UninterruptibleDiskSleep => ProcessState::DiskWait,
            ProcessStatus::Zombie | ProcessStatus::Dead => ProcessState::Zombie,
            ProcessStatus::Stop | ProcessStatus::Tracing => ProcessState::Stopped,
            _ => ProcessState::Other,
        }
    }
}

/// Snapshot of one OS process, valid only for the instant it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub state: ProcessState,
    pub parent_pid: Option<u32>,
    /// Raw argv joined by NUL.
    pub cmdline: String,
    /// Virtual memory size in bytes.
    pub memory: u64,
}

impl ProcessRecord {
    fn from_sysinfo(process: &Process) -> Self {
        let cmdline = process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join("\0");

        Self {
            pid: process.pid().as_u32(),
            name: process.name().to_string_lossy().into_owned(),
            state: process.status().into(),
            parent_pid: process.parent().map(|pid| pid.as_u32()),
            cmdline,
            memory: process.virtual_memory(),
        }
    }

    /// Whether the process has exited and only awaits reaping.
    pub fn is_zombie(&self) -> bool {
        self.state == ProcessState::Zombie
    }
}

/// Case-insensitive cmdline matcher used to recognise a unit's processes.
#[derive(Debug, Clone)]
pub struct ProcessPattern {
    regex: Regex,
}

impl ProcessPattern {
    /// Compiles `pattern` as a case-insensitive regular expression.
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(Self { regex })
    }

    /// Matches a literal argv: each argument is escaped and the list is joined
    /// by NUL, so the pattern matches the command however it is quoted.
    ///
    /// The match is anchored at argument boundaries. A bare program name must
    /// start the cmdline or follow a `/` (the resolved path); a program given
    /// as a path must be a whole argument, which also covers a script run by
    /// its interpreter. The last argument must end an argument.
    pub fn for_argv<S: AsRef<str>>(argv: &[S]) -> Result<Self, ConfigError> {
        let Some(program) = argv.first() else {
            return Self::new("^$");
        };
        let lead = if program.as_ref().contains('/') {
            r"(?:^|\x00)"
        } else {
            r"(?:^|/)"
        };
        let escaped = argv
            .iter()
            .map(|arg| regex::escape(arg.as_ref()))
            .collect::<Vec<_>>()
            .join(r"\x00");
        Self::new(&format!(r"{lead}{escaped}(?:\x00|$)"))
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_match(&self, cmdline: &str) -> bool {
        self.regex.is_match(cmdline)
    }
}

/// Read-only view of the process table.
///
/// Implementors only provide the two primitive reads; the relationship walks
/// are derived from them and re-scan the table on every call.
pub trait ProcessTable {
    /// Reads exactly one pid. `None` means the process does not exist (or
    /// vanished while being read).
    fn get(&self, pid: u32) -> Option<ProcessRecord>;

    /// Full scan. Entries that vanish mid-scan are skipped.
    fn get_all(&self) -> Vec<ProcessRecord>;

    /// Every process whose cmdline matches `pattern`.
    fn find(&self, pattern: &ProcessPattern) -> Vec<ProcessRecord> {
        self.get_all()
            .into_iter()
            .filter(|process| pattern.is_match(&process.cmdline))
            .collect()
    }

    /// Parent chain, nearest first, ending where a lookup fails.
    fn ancestors(&self, record: &ProcessRecord) -> Vec<ProcessRecord> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([record.pid]);
        let mut next = record.parent_pid;

        while let Some(pid) = next {
            // Pid churn can make a snapshot loop back on itself.
            if !seen.insert(pid) {
                break;
            }
            match self.get(pid) {
                Some(parent) => {
                    next = parent.parent_pid;
                    chain.push(parent);
                }
                None => break,
            }
        }

        chain
    }

    /// Whole subtree below `record`, one full-table scan per tree level.
    fn descendants(&self, record: &ProcessRecord) -> Vec<ProcessRecord> {
        let mut found = Vec::new();
        let mut seen = HashSet::from([record.pid]);
        let mut frontier = HashSet::from([record.pid]);

        while !frontier.is_empty() {
            let mut next = HashSet::new();
            for process in self.get_all() {
                let Some(parent) = process.parent_pid else {
                    continue;
                };
                if frontier.contains(&parent) && seen.insert(process.pid) {
                    next.insert(process.pid);
                    found.push(process);
                }
            }
            frontier = next;
        }

        found
    }
}

/// The live OS process table, read through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiveProcessTable;

impl LiveProcessTable {
    fn snapshot(processes: ProcessesToUpdate<'_>) -> System {
        let mut system = System::new();
        // Parent, name and status come with every refresh.
        system.refresh_processes_specifics(
            processes,
            true,
            ProcessRefreshKind::nothing()
                .with_cmd(UpdateKind::Always)
                .with_memory(),
        );
        system
    }
}

impl ProcessTable for LiveProcessTable {
    fn get(&self, pid: u32) -> Option<ProcessRecord> {
        let target = Pid::from_u32(pid);
        let system = Self::snapshot(ProcessesToUpdate::Some(&[target]));
        system
            .process(target)
            .filter(|process| process.thread_kind().is_none())
            .map(ProcessRecord::from_sysinfo)
    }

    fn get_all(&self) -> Vec<ProcessRecord> {
        let system = Self::snapshot(ProcessesToUpdate::All);
        system
            .processes()
            .values()
            .filter(|process| process.thread_kind().is_none())
            .map(ProcessRecord::from_sysinfo)
            .collect()
    }
}
