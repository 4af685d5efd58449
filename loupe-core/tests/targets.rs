// Multi-process scenarios: following spawned children.

mod common;

use common::*;
use loupe_core::types::{Breakpoint, EvalScope};
use loupe_core::{DebugError, Debugger, DebuggerConfig, SimLauncher};

const PARENT: &str = r#"{
    "functions": [
        {"name": "main.main", "file": "/src/main.go", "line": 3, "body": [
            {"line": 4, "ops": [{"op": "spawn", "program": "/src/child.json", "args": ["--worker"]}]},
            {"line": 5, "ops": [{"op": "nop"}]}
        ]}
    ]
}"#;

const CHILD: &str = r#"{
    "functions": [
        {"name": "main.main", "file": "/src/child.go", "line": 3, "body": [
            {"line": 4, "ops": [{"op": "set", "var": "x", "value": {"int": 1}}]},
            {"line": 5, "ops": [{"op": "exit", "code": 3}]}
        ]}
    ]
}"#;

fn family() -> SimLauncher {
    let launcher = launcher(PARENT);
    launcher.set_source("/src/child.json", CHILD);
    launcher
}

fn follow(regex: Option<&str>) -> Debugger {
    let config = DebuggerConfig {
        follow_exec: true,
        follow_exec_regex: regex.map(str::to_string),
        ..Default::default()
    };
    launch_with(family(), config)
}

fn break_suspended(debugger: &Debugger, expr: &str) -> Breakpoint {
    debugger
        .create_breakpoint(&Breakpoint::default(), expr, None, true)
        .unwrap()
}

#[test]
fn test_followed_child_hits_pending_breakpoint() {
    let debugger = follow(None);
    let bp = break_suspended(&debugger, "child.go:4");
    assert!(bp.suspended);

    let state = cont(&debugger);
    assert_eq!(state.pid, 1001);
    assert_eq!(stopped_breakpoint(&state), Some(bp.id));
    assert_eq!(state.target_command_line, "/src/child.json --worker");

    let bp = debugger.get_breakpoint(bp.id).unwrap();
    assert!(!bp.suspended);
    assert_eq!(bp.file, "/src/child.go");

    let targets = debugger.list_targets().unwrap();
    let pids: Vec<_> = targets.iter().map(|t| t.pid).collect();
    assert_eq!(pids, vec![1000, 1001]);
    assert_eq!(targets[1].current_thread.as_ref().unwrap().line, 4);
}

#[test]
fn test_children_exit_before_parent() {
    let debugger = follow(None);
    break_suspended(&debugger, "child.go:4");
    cont(&debugger);

    // The child exits with 3; the parent keeps running and reports the final exit.
    let state = cont(&debugger);
    assert!(state.exited);
    assert_eq!(state.pid, 1000);
    assert_eq!(state.exit_status, 0);
}

#[test]
fn test_find_location_across_targets() {
    let debugger = follow(None);
    break_suspended(&debugger, "child.go:4");
    cont(&debugger);

    let locs = debugger
        .find_location(EvalScope::default(), "main.main", false, &[])
        .unwrap();
    // Different files: one location per target.
    assert_eq!(locs.len(), 2);
    let mut pids: Vec<_> = locs.iter().flat_map(|l| l.pc_pids.clone()).collect();
    pids.sort_unstable();
    assert_eq!(pids, vec![1000, 1001]);

    let locs = debugger
        .find_location(EvalScope::default(), "child.go:5", false, &[])
        .unwrap();
    assert_eq!(locs.len(), 1);
    assert_eq!(locs[0].pc_pids, vec![1001]);
}

#[test]
fn test_unmatched_child_is_not_followed() {
    let debugger = follow(Some("^/src/other"));
    break_suspended(&debugger, "child.go:4");

    let state = cont(&debugger);
    assert!(state.exited);
    assert_eq!(state.pid, 1000);
    assert!(debugger.get_breakpoint(1).unwrap().suspended);
}

#[test]
fn test_children_ignored_without_follow_exec() {
    let debugger = launch_with(family(), DebuggerConfig::default());
    assert_eq!(debugger.follow_exec_enabled().unwrap(), (false, None));
    let state = cont(&debugger);
    assert!(state.exited);
    assert_eq!(state.pid, 1000);
}

#[test]
fn test_follow_exec_toggled_at_runtime() {
    let debugger = launch_with(family(), DebuggerConfig::default());
    let err = debugger.follow_exec(true, Some("(")).unwrap_err();
    assert!(matches!(err, DebugError::InvalidArgument(_)));

    debugger.follow_exec(true, Some("worker")).unwrap();
    assert_eq!(
        debugger.follow_exec_enabled().unwrap(),
        (true, Some("worker".to_string()))
    );
    break_suspended(&debugger, "child.go:4");
    let state = cont(&debugger);
    assert_eq!(state.pid, 1001);
}

#[test]
fn test_detach_ends_session() {
    let debugger = follow(None);
    break_suspended(&debugger, "child.go:4");
    cont(&debugger);
    debugger.detach(true).unwrap();
    assert!(matches!(
        debugger.continue_execution(),
        Err(DebugError::NoTarget)
    ));
}
