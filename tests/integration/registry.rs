#[path = "common/mod.rs"]
mod common;

use std::{fs, os::unix::fs::PermissionsExt, path::Path};

use common::{ProcessGuard, wait_for_lines, wait_for_process_exit, write_script};
use pidwarden::{
    config::Settings,
    registry::{ALL_UNITS, Action, ActionReport, Registry},
};
use tempfile::tempdir;

const IDLE: &str = "while :; do sleep 0.2; done";

fn write_unit(root: &Path, name: &str, body: &str) {
    let dir = root.join("conf-enabled");
    fs::create_dir_all(&dir).expect("create conf-enabled");
    fs::write(dir.join(format!("{name}.yaml")), body).expect("write unit");
}

fn started_pid(report: &ActionReport) -> u32 {
    match report {
        ActionReport::Start(pidwarden::lifecycle::StartOutcome::Started(pid)) => *pid,
        other => panic!("unexpected report {other}"),
    }
}

#[test]
fn start_and_stop_all_units() {
    let temp = tempdir().expect("failed to create tempdir");
    let root = temp.path();
    for name in ["alpha", "beta"] {
        let script = write_script(&root.join("bin").join(format!("{name}.sh")), IDLE);
        write_unit(
            root,
            name,
            &format!(
                "pid: {}/run/{name}.pid\nrun: {}\ntimeouts:\n  stop: 1\n",
                root.display(),
                script.display()
            ),
        );
    }

    let mut registry = Registry::load(Settings::new(root)).expect("load registry");
    let outcomes = registry.dispatch(Action::Start, ALL_UNITS);
    assert_eq!(outcomes.len(), 2);
    let guards: Vec<_> = outcomes
        .iter()
        .map(|outcome| ProcessGuard(started_pid(outcome.result.as_ref().unwrap())))
        .collect();

    let status: Vec<_> = registry
        .dispatch(Action::Status, ALL_UNITS)
        .iter()
        .map(|outcome| {
            assert!(outcome.is_success());
            outcome.to_string()
        })
        .collect();
    assert_eq!(
        status,
        vec![
            format!("alpha: running ({})", guards[0].0),
            format!("beta: running ({})", guards[1].0),
        ]
    );

    let again = registry.dispatch(Action::Start, "alpha");
    assert!(!again[0].is_success());
    assert_eq!(
        again[0].to_string(),
        format!("alpha: already running ({})", guards[0].0)
    );

    let stopped = registry.dispatch(Action::Stop, ALL_UNITS);
    assert!(stopped.iter().all(|outcome| outcome.is_success()));
    for guard in &guards {
        wait_for_process_exit(guard.0);
    }

    let status: Vec<_> = registry
        .dispatch(Action::Status, ALL_UNITS)
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(status, vec!["alpha: stopped", "beta: stopped"]);
}

#[test]
fn hooks_are_discovered_and_made_executable() {
    let temp = tempdir().expect("failed to create tempdir");
    let root = temp.path();
    let log = root.join("hooks.log");
    let script = write_script(&root.join("bin/web.sh"), IDLE);
    write_unit(
        root,
        "web",
        &format!(
            "pid: {}/run/web.pid\nrun: {}\n",
            root.display(),
            script.display()
        ),
    );

    for stage in ["pre-start", "pre-stop", "post-stop"] {
        let hook = root.join("hooks").join(stage).join("web");
        fs::create_dir_all(hook.parent().unwrap()).unwrap();
        fs::write(&hook, format!("#!/bin/sh\necho {stage} >> {}\n", log.display())).unwrap();
        fs::set_permissions(&hook, fs::Permissions::from_mode(0o644)).unwrap();
    }

    let mut registry = Registry::load(Settings::new(root)).expect("load registry");
    let started = registry.dispatch(Action::Start, "web");
    let _guard = ProcessGuard(started_pid(started[0].result.as_ref().unwrap()));

    registry.dispatch(Action::StopForce, "web");
    assert_eq!(
        wait_for_lines(&log, 3),
        vec!["pre-start", "pre-stop", "post-stop"]
    );
}

#[test]
fn restart_replaces_the_process() {
    let temp = tempdir().expect("failed to create tempdir");
    let root = temp.path();
    let script = write_script(&root.join("bin/svc.sh"), IDLE);
    write_unit(
        root,
        "svc",
        &format!(
            "pid: {}/run/svc.pid\nrun: {}\n",
            root.display(),
            script.display()
        ),
    );

    let mut registry = Registry::load(Settings::new(root)).expect("load registry");
    let first = started_pid(
        registry.dispatch(Action::Start, "svc")[0]
            .result
            .as_ref()
            .unwrap(),
    );
    let _first = ProcessGuard(first);

    let second = started_pid(
        registry.dispatch(Action::Restart, "svc")[0]
            .result
            .as_ref()
            .unwrap(),
    );
    let _second = ProcessGuard(second);
    assert_ne!(first, second);
    wait_for_process_exit(first);

    registry.dispatch(Action::StopForce, "svc");
    wait_for_process_exit(second);
}
