#[path = "common/mod.rs"]
mod common;

use std::{
    env, fs,
    path::{Path, PathBuf},
    process::Command,
    thread,
    time::Duration,
};

use common::{ProcessGuard, is_process_alive, wait_for_lines, wait_for_path_removed, wait_for_pid};
use pidwarden::{
    cli::{UnitCli, run_unit},
    error::SupervisorError,
    lifecycle::{ControllerOptions, RunOutcome, StdioPaths, Unit},
    params::ParamSchema,
    registry::ActionReport,
    signals::{ControlEvent, RunContext},
};
use tempfile::tempdir;

const CHILD_ENV: &str = "PIDWARDEN_DAEMON_PIDFILE";

/// In-process payload: records its lifecycle in a journal next to the pidfile.
struct Journal {
    path: PathBuf,
}

impl Journal {
    fn append(&self, line: &str) -> Result<(), SupervisorError> {
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl Unit for Journal {
    fn run(&mut self, ctx: &RunContext) -> Result<RunOutcome, SupervisorError> {
        let label = ctx.params().text("label").unwrap_or("unnamed").to_string();
        self.append(&format!("started {label}"))?;
        loop {
            match ctx.poll() {
                Some(ControlEvent::Terminate) => {
                    self.append("terminated")?;
                    return Ok(RunOutcome::Exited);
                }
                Some(ControlEvent::Reload) => Unit::reload(self)?,
                None => thread::sleep(Duration::from_millis(50)),
            }
        }
    }

    fn reload(&mut self) -> Result<(), SupervisorError> {
        self.append("reloaded")
    }
}

fn unit_cli() -> UnitCli {
    UnitCli::new("journal", ParamSchema::new().text("label", Some("unnamed")))
}

fn journal_path(pidfile: &Path) -> PathBuf {
    pidfile.with_extension("journal")
}

/// Entry point of the re-executed test binary. Does nothing unless the
/// parent test asked for a daemon.
#[test]
fn daemon_entry() {
    let Ok(pidfile) = env::var(CHILD_ENV) else {
        return;
    };
    let pidfile = PathBuf::from(pidfile);

    let invocation = unit_cli()
        .try_parse_from([
            "journal",
            "--pid",
            pidfile.to_str().unwrap(),
            "--label",
            "nightly",
            "start",
        ])
        .unwrap();
    let options = ControllerOptions {
        stdio: StdioPaths {
            stderr: pidfile.with_extension("err"),
            ..StdioPaths::default()
        },
        ..ControllerOptions::default()
    };
    let journal = Journal {
        path: journal_path(&pidfile),
    };

    let report = run_unit(invocation, journal, options).unwrap();
    assert!(matches!(report, ActionReport::Start(_)));
}

fn control(pidfile: &Path, command: &str) -> ActionReport {
    let invocation = unit_cli()
        .try_parse_from(["journal", "--pid", pidfile.to_str().unwrap(), command])
        .unwrap();
    let journal = Journal {
        path: journal_path(pidfile),
    };
    run_unit(invocation, journal, ControllerOptions::default()).unwrap()
}

#[test]
fn in_process_unit_daemonizes_and_stops() {
    if env::var(CHILD_ENV).is_ok() {
        return;
    }

    let temp = tempdir().expect("failed to create tempdir");
    let pidfile = temp.path().join("journal.pid");

    // The trailing filters make the daemon's cmdline look like
    // `<exe> ... <pidfile> start`, which is what the unit pattern expects.
    let status = Command::new(env::current_exe().unwrap())
        .args(["--exact", "daemon_entry", "--nocapture"])
        .arg(&pidfile)
        .arg("start")
        .env(CHILD_ENV, &pidfile)
        .status()
        .expect("failed to launch daemon");
    assert!(status.success(), "launcher exited with {status}");

    let pid = wait_for_pid(&pidfile);
    let _guard = ProcessGuard(pid);
    assert!(is_process_alive(pid));
    assert_eq!(
        wait_for_lines(&journal_path(&pidfile), 1),
        vec!["started nightly"]
    );

    let report = control(&pidfile, "status");
    assert!(report.is_success(), "unexpected status: {report}");
    assert_eq!(report.to_string(), format!("running ({pid})"));

    assert_eq!(control(&pidfile, "reload").to_string(), "reloaded");
    assert_eq!(
        wait_for_lines(&journal_path(&pidfile), 2),
        vec!["started nightly", "reloaded"]
    );

    let report = control(&pidfile, "stop");
    assert_eq!(report.to_string(), "stopped");
    wait_for_path_removed(&pidfile);
    assert!(!is_process_alive(pid));
    assert_eq!(
        wait_for_lines(&journal_path(&pidfile), 3),
        vec!["started nightly", "reloaded", "terminated"]
    );
}
