// Breakpoint scenarios against the simulated backend

mod common;

use common::*;
use loupe_core::types::{Breakpoint, EvalScope, LoadConfig};
use loupe_core::{DebugError, RestartOptions};

const GENERIC: &str = r#"{"functions": [
    {"name": "main.main", "file": "/src/main.go", "line": 3, "body": [
        {"line": 4, "ops": [{"op": "call", "func": "main.id[int]", "args": [{"int": 1}]}]},
        {"line": 5, "ops": [{"op": "call", "func": "main.id[string]", "args": [{"str": "x"}]}]}
    ]},
    {"name": "main.id", "file": "/src/main.go", "line": 9, "params": ["v"], "instantiations": ["int", "string"],
     "body": [{"line": 10, "ops": [{"op": "ret", "values": [{"var": "v"}]}]}]}
]}"#;

const PANICS: &str = r#"{"functions": [
    {"name": "main.main", "file": "/src/main.go", "line": 3, "body": [
        {"line": 4, "ops": [{"op": "panic", "message": "boom"}]}
    ]}
]}"#;

const PLUGIN: &str = r#"{
    "functions": [
        {"name": "main.main", "file": "/src/main.go", "line": 3, "body": [
            {"line": 4, "ops": [{"op": "load_plugin", "name": "plugin.so"}]},
            {"line": 5, "ops": [{"op": "call", "func": "plugin.Hello"}]}
        ]}
    ],
    "plugins": [{"name": "plugin.so", "functions": [
        {"name": "plugin.Hello", "file": "/src/plugin/hello.go", "line": 3,
         "body": [{"line": 4, "ops": [{"op": "nop"}]}]}
    ]}]
}"#;

fn scope() -> EvalScope {
    EvalScope::default()
}

#[test]
fn test_tracepoint_streams_every_hit_then_exit() {
    let debugger = launch(LOOP);
    let req = Breakpoint {
        tracepoint: true,
        ..Default::default()
    };
    let bp = debugger
        .create_breakpoint(&req, "main.work", None, false)
        .unwrap();

    let states = run(&debugger);
    assert_eq!(states.len(), 4);
    for state in &states[..3] {
        assert!(!state.exited);
        assert_eq!(stopped_breakpoint(state), Some(bp.id));
    }
    let last = states.last().unwrap();
    assert!(last.exited);
    assert_eq!(last.exit_status, 0);
    assert_eq!(debugger.get_breakpoint(bp.id).unwrap().total_hit_count, 3);
}

#[test]
fn test_hit_condition_stops_on_matching_hit_only() {
    let debugger = launch(LOOP);
    let req = Breakpoint {
        hit_cond: "== 2".to_string(),
        ..Default::default()
    };
    let bp = debugger
        .create_breakpoint(&req, "main.go:12", None, false)
        .unwrap();

    let state = cont(&debugger);
    assert_eq!(stopped_line(&state), 12);
    let hit = state.current_thread.unwrap().breakpoint.unwrap();
    assert_eq!(hit.id, bp.id);
    assert_eq!(hit.total_hit_count, 2);
    let n = debugger
        .eval_variable(scope(), "n", &LoadConfig::default())
        .unwrap();
    assert_eq!(n.value, "1");

    // the condition can never hold again
    assert!(debugger.get_breakpoint(bp.id).unwrap().addrs.is_empty());
    let state = cont(&debugger);
    assert!(state.exited);
}

#[test]
fn test_hit_condition_less_than_exhausts() {
    let debugger = launch(LOOP);
    let req = Breakpoint {
        hit_cond: "< 3".to_string(),
        ..Default::default()
    };
    let bp = debugger
        .create_breakpoint(&req, "main.go:12", None, false)
        .unwrap();

    for _ in 0..2 {
        let state = cont(&debugger);
        assert_eq!(stopped_breakpoint(&state), Some(bp.id));
    }
    let state = cont(&debugger);
    assert!(state.exited);

    let listed = debugger.list_breakpoints(false).unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].addrs.is_empty());
    assert_eq!(listed[0].total_hit_count, 3);
}

#[test]
fn test_condition_and_captures() {
    let debugger = launch(LOOP);
    let req = Breakpoint {
        cond: "n == 2".to_string(),
        variables: vec!["n + 1".to_string()],
        load_args: Some(LoadConfig::default()),
        stacktrace: 2,
        goroutine: true,
        ..Default::default()
    };
    let bp = debugger
        .create_breakpoint(&req, "main.go:12", None, false)
        .unwrap();

    let state = cont(&debugger);
    let thread = state.current_thread.unwrap();
    assert_eq!(thread.breakpoint.as_ref().map(|b| b.id), Some(bp.id));
    let info = thread.breakpoint_info.unwrap();
    assert_eq!(info.variables[0].value, "3");
    assert_eq!(info.arguments[0].name, "n");
    assert_eq!(info.arguments[0].value, "2");
    assert_eq!(info.stacktrace.len(), 2);
    assert_eq!(info.stacktrace[1].location.function.as_deref(), Some("main.main"));
    assert_eq!(info.goroutine.map(|g| g.id), Some(1));
    assert!(info.condition_error.is_none());
    assert_eq!(debugger.get_breakpoint(bp.id).unwrap().total_hit_count, 1);
}

#[test]
fn test_condition_error_still_stops() {
    let debugger = launch(LOOP);
    let req = Breakpoint {
        cond: "missing == 1".to_string(),
        ..Default::default()
    };
    debugger
        .create_breakpoint(&req, "main.go:12", None, false)
        .unwrap();

    let state = cont(&debugger);
    let info = state.current_thread.unwrap().breakpoint_info.unwrap();
    assert!(info
        .condition_error
        .unwrap()
        .contains("could not find symbol value for missing"));
}

#[test]
fn test_toggle_keeps_amendments_and_clear_removes() {
    let debugger = launch(LOOP);
    let mut bp = break_at(&debugger, "main.go:12");
    bp.cond = "n > 0".to_string();
    bp.name = "work_body".to_string();
    debugger.amend_breakpoint(&bp).unwrap();

    let off = debugger.toggle_breakpoint(bp.id).unwrap();
    assert!(off.disabled);
    assert!(off.addrs.is_empty());
    let on = debugger.toggle_breakpoint(bp.id).unwrap();
    assert!(!on.disabled);
    assert_eq!(on.addrs.len(), 1);
    assert_eq!(on.cond, "n > 0");

    let state = cont(&debugger);
    assert_eq!(
        debugger
            .eval_variable(scope(), "n", &LoadConfig::default())
            .unwrap()
            .value,
        "1"
    );
    assert_eq!(stopped_breakpoint(&state), Some(bp.id));

    debugger.clear_breakpoint_by_name("work_body").unwrap();
    assert!(matches!(
        debugger.get_breakpoint(bp.id),
        Err(DebugError::BreakpointNotFound(_))
    ));
    assert!(cont(&debugger).exited);
}

#[test]
fn test_generic_function_breakpoint_covers_every_instantiation() {
    let debugger = launch(GENERIC);
    let bp = break_at(&debugger, "main.id");
    assert_eq!(bp.addrs.len(), 2);
    assert_eq!(bp.function_name, "main.id");

    let state = cont(&debugger);
    assert_eq!(
        state.current_thread.unwrap().function.as_deref(),
        Some("main.id[int]")
    );
    let cleared = debugger.clear_breakpoint(bp.id).unwrap();
    assert_eq!(cleared.addrs.len(), 2);
    assert!(debugger.list_breakpoints(false).unwrap().is_empty());
    assert!(cont(&debugger).exited);
}

#[test]
fn test_same_address_rejected_and_ids_not_reused() {
    let debugger = launch(LOOP);
    let first = break_at(&debugger, "main.work");
    let err = debugger
        .create_breakpoint(&Breakpoint::default(), "main.go:11", None, false)
        .unwrap_err();
    match err {
        DebugError::BreakpointExists { id, .. } => assert_eq!(id, first.id),
        other => panic!("unexpected error {:?}", other),
    }

    let second = break_at(&debugger, "main.report");
    debugger.clear_breakpoint(second.id).unwrap();
    let third = break_at(&debugger, "main.go:12");
    assert_eq!(third.id, second.id + 1);

    // disabling and restarting do not give ids back either
    debugger.toggle_breakpoint(third.id).unwrap();
    debugger.restart(RestartOptions::default()).unwrap();
    debugger.clear_breakpoint(third.id).unwrap();
    let fourth = break_at(&debugger, "main.report");
    assert_eq!(fourth.id, third.id + 1);
}

#[test]
fn test_failed_install_rolls_back_every_address() {
    let debugger = launch(LOOP);
    let line = break_at(&debugger, "main.go:12");
    debugger.clear_breakpoint(line.id).unwrap();

    let req = Breakpoint {
        addrs: vec![line.addr, 0x10],
        ..Default::default()
    };
    let err = debugger.create_breakpoint(&req, "", None, false).unwrap_err();
    assert!(matches!(err, DebugError::Backend(_)));
    assert!(debugger.list_breakpoints(false).unwrap().is_empty());

    // the first address was released again
    let bp = break_at(&debugger, "main.go:12");
    assert_eq!(bp.addr, line.addr);
    let state = cont(&debugger);
    assert_eq!(stopped_breakpoint(&state), Some(bp.id));
}

#[test]
fn test_internal_breakpoints() {
    let debugger = launch(PANICS);
    assert!(debugger.list_breakpoints(false).unwrap().is_empty());
    let internal = debugger.list_breakpoints(true).unwrap();
    let names: Vec<&str> = internal.iter().map(|b| b.name.as_str()).collect();
    assert!(names.contains(&"unrecovered-panic"));
    assert!(names.contains(&"fatal-throw"));

    let state = cont(&debugger);
    assert_eq!(stopped_breakpoint(&state), Some(-1));
    let state = cont(&debugger);
    assert!(state.exited);
    assert_eq!(state.exit_status, 2);
}

#[test]
fn test_suspended_breakpoint_resolves_when_plugin_loads() {
    let debugger = launch(PLUGIN);
    assert!(matches!(
        debugger.create_breakpoint(&Breakpoint::default(), "plugin.Hello", None, false),
        Err(DebugError::LocationNotFound(_))
    ));
    let bp = debugger
        .create_breakpoint(&Breakpoint::default(), "plugin.Hello", None, true)
        .unwrap();
    assert!(bp.suspended);

    let state = cont(&debugger);
    assert_eq!(stopped_breakpoint(&state), Some(bp.id));
    assert_eq!(state.current_thread.unwrap().file, "/src/plugin/hello.go");
    assert!(!debugger.get_breakpoint(bp.id).unwrap().suspended);
}

#[test]
fn test_restart_rebuild_returns_lost_breakpoints() {
    let launcher = launcher(LOOP);
    let debugger = launch_with(launcher.clone(), Default::default());
    let lost = break_at(&debugger, "main.work");
    let kept = break_at(&debugger, "main.go:12");
    cont(&debugger);

    launcher.set_source(PROGRAM, LOOP.replace("main.work", "main.process"));
    let discarded = debugger
        .restart(RestartOptions {
            rebuild: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(discarded.len(), 1);
    assert_eq!(discarded[0].id, lost.id);
    assert!(discarded[0].suspended);

    let state = cont(&debugger);
    assert_eq!(stopped_breakpoint(&state), Some(kept.id));
    assert_eq!(
        state.current_thread.unwrap().function.as_deref(),
        Some("main.process")
    );
    assert_eq!(debugger.get_breakpoint(kept.id).unwrap().total_hit_count, 1);
}

#[test]
fn test_rebuild_follows_moved_function() {
    let launcher = launcher(LOOP);
    let debugger = launch_with(launcher.clone(), Default::default());
    let bp = break_at(&debugger, "main.work");
    assert_eq!(stopped_line(&cont(&debugger)), 11);

    let moved = LOOP
        .replace("\"line\": 11", "\"line\": 31")
        .replace("\"line\": 12", "\"line\": 32")
        .replace("\"line\": 13", "\"line\": 33");
    launcher.set_source(PROGRAM, &moved);
    let discarded = debugger
        .restart(RestartOptions {
            rebuild: true,
            ..Default::default()
        })
        .unwrap();
    assert!(discarded.is_empty());

    let state = cont(&debugger);
    assert_eq!(stopped_breakpoint(&state), Some(bp.id));
    assert_eq!(stopped_line(&state), 31);
    assert_eq!(
        state.current_thread.unwrap().function.as_deref(),
        Some("main.work")
    );
    assert_eq!(debugger.get_breakpoint(bp.id).unwrap().line, 31);
}

#[test]
fn test_failed_rebuild_leaves_process_alone() {
    let launcher = launcher(LOOP);
    let debugger = launch_with(launcher.clone(), Default::default());
    let before = debugger.get_state().unwrap();

    launcher.set_source(PROGRAM, "{ \"functions\": [");
    let err = debugger
        .restart(RestartOptions {
            rebuild: true,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, DebugError::Build(_)));
    assert!(err.to_string().starts_with(PROGRAM));
    assert_eq!(debugger.get_state().unwrap().pid, before.pid);
}

#[test]
fn test_relative_breakpoint_pinned_at_creation() {
    let debugger = launch(LOOP);
    break_at(&debugger, "main.work");
    cont(&debugger);
    // +1 from the declaration line of main.work
    let bp = break_at(&debugger, "+1");
    assert_eq!(bp.file, "/src/main.go");
    assert_eq!(bp.line, 12);
}
