#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    process::{Child, Command, Stdio},
    thread,
    time::Duration,
};

use common::{ProcessGuard, is_process_alive, unique_token, wait_for_process_exit, write_script};
use pidwarden::{
    command::{CommandSpec, SupervisedCommand},
    error::SupervisorError,
    lifecycle::{
        Controller, ControllerOptions, MainStop, Payload, RunOutcome, Tracked, Unit, UnitIdentity,
    },
    process::ProcessPattern,
    signals::RunContext,
};
use tempfile::tempdir;

/// Runs `script` under `sh -c` with `token` as `$0`, so the token shows up
/// in the cmdline.
fn spawn_tagged(token: &str, script: &str) -> Child {
    Command::new("sh")
        .arg("-c")
        .arg(script)
        .arg(token)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .spawn()
        .expect("failed to spawn tagged shell")
}

const IDLE: &str = "while :; do sleep 0.2; done";

/// External unit launching a tagged shell.
struct Tagged {
    token: String,
    script: String,
    children: Vec<Child>,
}

impl Tagged {
    fn new(token: &str, script: &str) -> Self {
        Self {
            token: token.to_string(),
            script: script.to_string(),
            children: Vec::new(),
        }
    }
}

impl Unit for Tagged {
    fn payload(&self) -> Payload {
        Payload::External
    }

    fn run(&mut self, _ctx: &RunContext) -> Result<RunOutcome, SupervisorError> {
        let child = spawn_tagged(&self.token, &self.script);
        let pid = child.id();
        self.children.push(child);
        Ok(RunOutcome::Spawned(pid))
    }
}

fn controller(dir: &std::path::Path, token: &str, script: &str) -> Controller<Tagged> {
    let identity =
        UnitIdentity::with_pattern(dir.join("unit.pid"), ProcessPattern::new(token).unwrap());
    let options = ControllerOptions {
        stop_timeout: Duration::from_secs(2),
        ..ControllerOptions::default()
    };
    Controller::new(Tagged::new(token, script), identity, options)
}

#[test]
fn start_status_stop_cycle() {
    let temp = tempdir().expect("failed to create tempdir");
    let token = unique_token("cycle");
    let mut ctl = controller(temp.path(), &token, IDLE);

    assert_eq!(ctl.status().to_string(), "stopped");

    let outcome = ctl.start(true).expect("start");
    let pidwarden::lifecycle::StartOutcome::Started(pid) = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    let _guard = ProcessGuard(pid);
    assert_eq!(ctl.pid(), Some(pid));
    assert_eq!(ctl.status().to_string(), format!("running ({pid})"));

    let err = ctl.start(true).unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyRunning { pid: p } if p == pid));
    assert_eq!(ctl.unit().children.len(), 1);

    let report = ctl.stop(false).expect("stop");
    assert_eq!(report.main, MainStop::Stopped(pid));
    assert_eq!(report.to_string(), "stopped");
    assert!(!temp.path().join("unit.pid").exists());
    wait_for_process_exit(pid);
}

#[test]
fn stop_with_stale_pidfile_cleans_up() {
    let temp = tempdir().expect("failed to create tempdir");
    let token = unique_token("stale");
    let mut ctl = controller(temp.path(), &token, IDLE);

    let mut gone = Command::new("true").spawn().expect("spawn true");
    let dead_pid = gone.id();
    gone.wait().expect("reap true");
    fs::write(temp.path().join("unit.pid"), format!("{dead_pid}\n")).unwrap();

    assert_eq!(ctl.tracked(), Tracked::NotFound(dead_pid));
    assert!(!ctl.status().is_healthy());

    let report = ctl.stop(false).expect("stop");
    assert_eq!(report.to_string(), "stopped");
    assert!(!temp.path().join("unit.pid").exists());
}

#[test]
fn force_stop_never_sends_polite_signal() {
    let temp = tempdir().expect("failed to create tempdir");
    let token = unique_token("force");
    let marker = temp.path().join("got-term");
    let script = format!("trap 'echo term > {}' TERM; {IDLE}", marker.display());
    let mut ctl = controller(temp.path(), &token, &script);

    let pidwarden::lifecycle::StartOutcome::Started(pid) = ctl.start(true).expect("start") else {
        panic!("expected an external start");
    };
    let _guard = ProcessGuard(pid);
    thread::sleep(Duration::from_millis(200));

    let report = ctl.stop(true).expect("stop-force");
    assert_eq!(report.main, MainStop::Stopped(pid));
    wait_for_process_exit(pid);
    assert!(!marker.exists(), "force stop delivered the terminate signal");
}

#[test]
fn lost_processes_are_reported_and_killed() {
    let temp = tempdir().expect("failed to create tempdir");
    let token = unique_token("lost");
    let mut ctl = controller(temp.path(), &token, IDLE);

    let pidwarden::lifecycle::StartOutcome::Started(pid) = ctl.start(true).expect("start") else {
        panic!("expected an external start");
    };
    let _guard = ProcessGuard(pid);

    let mut stray = spawn_tagged(&token, IDLE);
    let stray_pid = stray.id();
    let _stray_guard = ProcessGuard(stray_pid);
    thread::sleep(Duration::from_millis(200));

    let status = ctl.status();
    assert_eq!(status.tracked, Tracked::Running(pid));
    assert_eq!(status.lost, vec![stray_pid]);
    assert!(!status.is_healthy());
    assert_eq!(
        status.to_string(),
        format!("running ({pid})\nlost pids: {stray_pid}")
    );

    let report = ctl.stop(false).expect("stop");
    assert!(report.is_success());
    assert_eq!(report.lost_stopped, vec![stray_pid]);
    assert_eq!(
        report.to_string(),
        format!("stopped\nstopped lost process ({stray_pid})")
    );

    stray.wait().expect("reap stray");
    assert!(!is_process_alive(pid));
    assert!(ctl.status().is_healthy());
}

#[test]
fn recycled_pid_is_left_alone() {
    let temp = tempdir().expect("failed to create tempdir");
    let token = unique_token("foreign");
    let mut ctl = controller(temp.path(), &token, IDLE);

    let mut unrelated = spawn_tagged(&unique_token("unrelated"), IDLE);
    let unrelated_pid = unrelated.id();
    let _guard = ProcessGuard(unrelated_pid);
    fs::write(temp.path().join("unit.pid"), format!("{unrelated_pid}\n")).unwrap();
    thread::sleep(Duration::from_millis(100));

    assert_eq!(ctl.tracked(), Tracked::Foreign(unrelated_pid));
    assert_eq!(
        ctl.status().to_string(),
        format!("pid {unrelated_pid} is found but it belongs to another process")
    );

    let report = ctl.stop(false).expect("stop");
    assert_eq!(report.main, MainStop::Foreign(unrelated_pid));
    assert!(is_process_alive(unrelated_pid));
    assert!(!temp.path().join("unit.pid").exists());

    unrelated.kill().expect("kill unrelated");
    unrelated.wait().expect("reap unrelated");
}

#[test]
fn reload_signals_running_process() {
    let temp = tempdir().expect("failed to create tempdir");
    let token = unique_token("reload");
    let marker = temp.path().join("reloaded");
    let script = format!("trap 'echo hup >> {}' HUP; {IDLE}", marker.display());
    let mut ctl = controller(temp.path(), &token, &script);

    assert_eq!(ctl.reload().expect("reload").to_string(), "stopped");

    let pidwarden::lifecycle::StartOutcome::Started(pid) = ctl.start(true).expect("start") else {
        panic!("expected an external start");
    };
    let _guard = ProcessGuard(pid);
    thread::sleep(Duration::from_millis(200));

    assert_eq!(ctl.reload().expect("reload").to_string(), "reloaded");
    common::wait_for_lines(&marker, 1);
    assert_eq!(ctl.tracked(), Tracked::Running(pid));

    ctl.stop(true).expect("stop");
}

fn command_controller(pidfile: std::path::PathBuf, run: &str) -> Controller<SupervisedCommand> {
    let command = SupervisedCommand::new(CommandSpec::new(run)).expect("valid command");
    let identity = command.identity(pidfile);
    let options = ControllerOptions {
        stop_timeout: Duration::from_secs(2),
        ..ControllerOptions::default()
    };
    Controller::new(command, identity, options)
}

fn spawn_bystander(program: &str, args: &[&str]) -> Child {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .spawn()
        .expect("failed to spawn bystander")
}

#[test]
fn stop_spares_processes_that_only_mention_the_command() {
    let temp = tempdir().expect("failed to create tempdir");
    let token = unique_token("web");
    let script = write_script(&temp.path().join(format!("{token}.sh")), IDLE);
    let script = script.display().to_string();
    let log = format!("{script}.log");
    fs::write(&log, "").expect("create log");

    let mut bystanders = vec![
        spawn_bystander("tail", &["-f", &log]),
        spawn_bystander("sh", &["-c", &format!("sleep 30; echo {script}-access.log")]),
    ];
    let _bystander_guards: Vec<_> = bystanders
        .iter()
        .map(|child| ProcessGuard(child.id()))
        .collect();

    let mut ctl = command_controller(temp.path().join("web.pid"), &script);
    let pidwarden::lifecycle::StartOutcome::Started(pid) = ctl.start(true).expect("start") else {
        panic!("expected an external start");
    };
    let _guard = ProcessGuard(pid);
    thread::sleep(Duration::from_millis(200));
    assert!(ctl.lost_processes().is_empty());

    let report = ctl.stop(false).expect("stop");
    assert!(report.is_success());
    assert!(report.lost_stopped.is_empty());
    wait_for_process_exit(pid);

    for bystander in &mut bystanders {
        assert!(is_process_alive(bystander.id()), "bystander was stopped");
        bystander.kill().expect("kill bystander");
        bystander.wait().expect("reap bystander");
    }
}

#[test]
fn stop_spares_commands_with_a_longer_argument() {
    let temp = tempdir().expect("failed to create tempdir");
    let mut longer = spawn_bystander("sleep", &["50"]);
    let _longer_guard = ProcessGuard(longer.id());

    let mut ctl = command_controller(temp.path().join("nap.pid"), "sleep 5");
    let pidwarden::lifecycle::StartOutcome::Started(pid) = ctl.start(true).expect("start") else {
        panic!("expected an external start");
    };
    let _guard = ProcessGuard(pid);
    thread::sleep(Duration::from_millis(200));
    assert!(ctl.lost_processes().iter().all(|process| process.pid != longer.id()));

    let report = ctl.stop(true).expect("stop");
    assert!(!report.lost_stopped.contains(&longer.id()));
    wait_for_process_exit(pid);

    assert!(is_process_alive(longer.id()), "sleep 50 was stopped");
    longer.kill().expect("kill bystander");
    longer.wait().expect("reap bystander");
}
