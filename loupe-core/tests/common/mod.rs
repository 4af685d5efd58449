// Shared fixtures for engine scenarios

#![allow(dead_code)]

use loupe_core::types::{Breakpoint, DebuggerState};
use loupe_core::{Debugger, DebuggerConfig, SimLauncher};
use std::sync::Arc;

pub const PROGRAM: &str = "/src/prog.json";

/// Loops three times over `main.work`, then calls `main.report` and returns.
pub const LOOP: &str = r#"{
    "types": ["main.Counter"],
    "functions": [
        {"name": "main.main", "file": "/src/main.go", "line": 3, "body": [
            {"line": 4, "ops": [{"op": "set", "var": "i", "value": {"int": 0}}]},
            {"line": 5, "ops": [{"op": "call", "func": "main.work", "args": [{"var": "i"}], "result": "r"}]},
            {"line": 6, "ops": [{"op": "set", "var": "i", "value": {"add": ["i", 1]}},
                                {"op": "jump_if_less", "var": "i", "limit": {"int": 3}, "line": 5}]},
            {"line": 7, "ops": [{"op": "call", "func": "main.report", "args": [{"var": "r"}]}]}
        ]},
        {"name": "main.work", "file": "/src/main.go", "line": 11, "params": ["n"], "body": [
            {"line": 12, "ops": [{"op": "set", "var": "d", "value": {"add": ["n", 10]}}]},
            {"line": 13, "ops": [{"op": "ret", "values": [{"var": "d"}]}]}
        ]},
        {"name": "main.report", "file": "/src/main.go", "line": 16, "params": ["v"], "body": [
            {"line": 17, "ops": [{"op": "nop"}]}
        ]}
    ]
}"#;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("loupe_core=debug")
        .with_test_writer()
        .try_init();
}

pub fn launcher(source: &str) -> SimLauncher {
    let launcher = SimLauncher::new();
    launcher.set_source(PROGRAM, source);
    launcher
}

pub fn launch(source: &str) -> Debugger {
    launch_with(launcher(source), DebuggerConfig::default())
}

pub fn launch_with(launcher: SimLauncher, config: DebuggerConfig) -> Debugger {
    init_tracing();
    Debugger::launch(Arc::new(launcher), PROGRAM, Vec::new(), config).unwrap()
}

pub fn break_at(debugger: &Debugger, expr: &str) -> Breakpoint {
    debugger
        .create_breakpoint(&Breakpoint::default(), expr, None, false)
        .unwrap()
}

/// Every state of one continue, last one being the stop.
pub fn run(debugger: &Debugger) -> Vec<DebuggerState> {
    debugger.continue_execution().unwrap().collect()
}

/// Final state of one continue.
pub fn cont(debugger: &Debugger) -> DebuggerState {
    run(debugger).pop().unwrap()
}

pub fn stopped_line(state: &DebuggerState) -> u32 {
    state.current_thread.as_ref().map(|t| t.line).unwrap_or(0)
}

pub fn stopped_breakpoint(state: &DebuggerState) -> Option<i32> {
    state
        .current_thread
        .as_ref()
        .and_then(|t| t.breakpoint.as_ref())
        .map(|bp| bp.id)
}
