// Execution control scenarios: stepping, halting, rewinding and injected calls.

mod common;

use common::*;
use loupe_core::types::{Breakpoint, EvalScope, LoadConfig};
use loupe_core::{DebugError, DebuggerConfig, RestartOptions};
use std::time::Duration;

/// Spins forever incrementing `i`.
const SPIN: &str = r#"{
    "functions": [
        {"name": "main.main", "file": "/src/main.go", "line": 3, "body": [
            {"line": 4, "ops": [{"op": "set", "var": "i", "value": {"int": 0}}]},
            {"line": 5, "ops": [{"op": "set", "var": "i", "value": {"add": ["i", 1]}},
                                {"op": "jump", "line": 5}]}
        ]}
    ]
}"#;

/// Calls `main.tick` forever.
const TICK: &str = r#"{
    "functions": [
        {"name": "main.main", "file": "/src/main.go", "line": 3, "body": [
            {"line": 4, "ops": [{"op": "call", "func": "main.tick"}, {"op": "jump", "line": 4}]}
        ]},
        {"name": "main.tick", "file": "/src/main.go", "line": 9, "body": [
            {"line": 10, "ops": [{"op": "nop"}]}
        ]}
    ]
}"#;

const CALLS: &str = r#"{
    "functions": [
        {"name": "main.main", "file": "/src/main.go", "line": 3, "body": [
            {"line": 4, "ops": [{"op": "set", "var": "x", "value": {"int": 5}}]},
            {"line": 5, "ops": [{"op": "nop"}]}
        ]},
        {"name": "main.plus10", "file": "/src/main.go", "line": 9, "params": ["n"], "body": [
            {"line": 10, "ops": [{"op": "set", "var": "r", "value": {"add": ["n", 10]}}]},
            {"line": 11, "ops": [{"op": "ret", "values": [{"var": "r"}]}]}
        ]},
        {"name": "main.boom", "file": "/src/main.go", "line": 14, "body": [
            {"line": 15, "ops": [{"op": "panic", "message": "oops"}]}
        ]}
    ]
}"#;

fn eval(debugger: &loupe_core::Debugger, expr: &str) -> String {
    debugger
        .eval_variable(EvalScope::default(), expr, &LoadConfig::default())
        .unwrap()
        .value
}

#[test]
fn test_next_steps_over_calls() {
    let debugger = launch(LOOP);
    break_at(&debugger, "main.go:5");
    let state = cont(&debugger);
    assert_eq!(stopped_line(&state), 5);

    let state = debugger.next().unwrap();
    assert_eq!(stopped_line(&state), 6);
    assert!(state.current_thread.as_ref().unwrap().breakpoint.is_none());
    assert_eq!(eval(&debugger, "r"), "10");

    // Back to line 5 crosses the breakpoint again.
    let state = debugger.next().unwrap();
    assert_eq!(stopped_line(&state), 5);
    assert_eq!(stopped_breakpoint(&state), Some(1));
    assert_eq!(debugger.get_breakpoint(1).unwrap().total_hit_count, 2);
}

#[test]
fn test_step_enters_and_step_out_returns() {
    let debugger = launch(LOOP);
    break_at(&debugger, "main.go:5");
    cont(&debugger);

    let state = debugger.step().unwrap();
    let thread = state.current_thread.unwrap();
    assert_eq!(thread.line, 11);
    assert_eq!(thread.function.as_deref(), Some("main.work"));

    let state = debugger.step_out(Some(&LoadConfig::default())).unwrap();
    let thread = state.current_thread.unwrap();
    assert_eq!(thread.function.as_deref(), Some("main.main"));
    assert_eq!(thread.line, 5);
    assert_eq!(thread.return_values.len(), 1);
    assert_eq!(thread.return_values[0].name, "~r0");
    assert_eq!(thread.return_values[0].value, "10");
}

#[test]
fn test_step_out_without_load_config_omits_return_values() {
    let debugger = launch(LOOP);
    break_at(&debugger, "main.work");
    cont(&debugger);

    let state = debugger.step_out(None).unwrap();
    assert!(state.current_thread.unwrap().return_values.is_empty());
}

#[test]
fn test_step_instruction_over_call() {
    let debugger = launch(LOOP);
    let bp = break_at(&debugger, "main.go:5");
    cont(&debugger);
    let call_pc = bp.addrs[0];

    let state = debugger.step_instruction(true).unwrap();
    let thread = state.current_thread.unwrap();
    assert_eq!(thread.pc, call_pc + 4);
    assert_eq!(thread.function.as_deref(), Some("main.main"));

    let state = debugger.step_instruction(false).unwrap();
    assert_eq!(state.current_thread.unwrap().pc, call_pc + 8);
}

#[test]
fn test_step_instruction_into_call() {
    let debugger = launch(LOOP);
    break_at(&debugger, "main.go:5");
    cont(&debugger);

    let state = debugger.step_instruction(false).unwrap();
    assert_eq!(
        state.current_thread.unwrap().function.as_deref(),
        Some("main.work")
    );
}

#[test]
fn test_control_after_exit_reports_exit() {
    let debugger = launch(LOOP);
    let state = cont(&debugger);
    assert!(state.exited);
    assert_eq!(state.exit_status, 0);

    let state = debugger.next().unwrap();
    assert!(state.exited);
    assert_eq!(
        state.err.as_deref(),
        Some("Process 1000 has exited with status 0")
    );
    assert!(debugger.step_instruction(false).unwrap().exited);
    assert!(cont(&debugger).exited);
    assert!(debugger.get_state().unwrap().exited);

    let err = debugger
        .list_locals(EvalScope::default(), &LoadConfig::default())
        .unwrap_err();
    assert!(matches!(err, DebugError::ProcessExited { pid: 1000, .. }));
}

#[test]
fn test_halt_stops_running_target() {
    let debugger = launch(SPIN);
    let mut stream = debugger.continue_execution().unwrap();
    assert!(debugger.is_running());
    assert!(matches!(
        debugger.list_threads(),
        Err(DebugError::TargetRunning)
    ));
    assert!(debugger.get_state().unwrap().running);
    assert!(matches!(
        debugger.continue_execution(),
        Err(DebugError::TargetRunning)
    ));

    std::thread::sleep(Duration::from_millis(20));
    let halted = debugger.halt().unwrap();
    assert!(!halted.exited);
    assert!(!halted.running);
    assert!(!debugger.is_running());

    let last = stream.blocking_recv().unwrap();
    assert_eq!(last.pid, halted.pid);
    assert!(!last.exited);
    assert!(stream.blocking_recv().is_none());
    assert!(eval(&debugger, "i").parse::<i64>().unwrap() >= 0);
}

#[test]
fn test_closing_stream_halts() {
    let debugger = launch(SPIN);
    let stream = debugger.continue_execution().unwrap();
    stream.close();
    let states: Vec<_> = stream.collect();
    assert_eq!(states.len(), 1);
    assert!(!states[0].exited);
    assert!(!debugger.is_running());

    // The target can be resumed again after the halt.
    let mut stream = debugger.continue_execution().unwrap();
    let state = debugger.halt().unwrap();
    assert!(!state.exited);
    assert!(stream.blocking_recv().is_some());
}

#[test]
fn test_halt_with_undrained_tracepoint_stream() {
    let debugger = launch(TICK);
    let req = Breakpoint {
        tracepoint: true,
        ..Default::default()
    };
    debugger
        .create_breakpoint(&req, "main.tick", None, false)
        .unwrap();
    let stream = debugger.continue_execution().unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let (done, halted) = std::sync::mpsc::channel();
    let halter = debugger.clone();
    std::thread::spawn(move || {
        let _ = done.send(halter.halt());
    });
    let state = halted.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert!(!state.exited);
    assert!(!debugger.is_running());

    let states: Vec<_> = stream.collect();
    assert!(!states.is_empty());
    assert!(!states.last().unwrap().exited);
}

#[test]
fn test_call_function_returns_values() {
    let debugger = launch(CALLS);
    break_at(&debugger, "main.go:5");
    cont(&debugger);

    let state = debugger
        .call_function(-1, "main.plus10(x)", Some(&LoadConfig::default()))
        .unwrap();
    let thread = state.current_thread.unwrap();
    assert!(thread.call_return);
    assert_eq!(thread.return_values[0].value, "15");

    let state = debugger.call_function(-1, "main.plus10(1)", None).unwrap();
    assert!(state.current_thread.unwrap().return_values.is_empty());

    // The call does not disturb the stopped program.
    assert_eq!(eval(&debugger, "x"), "5");
    assert!(cont(&debugger).exited);
}

#[test]
fn test_call_function_panic() {
    let debugger = launch(CALLS);
    break_at(&debugger, "main.go:5");
    cont(&debugger);

    let state = debugger.call_function(-1, "main.boom()", None).unwrap();
    let values = state.current_thread.unwrap().return_values;
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].name, "~panic");
    assert_eq!(values[0].children[0].value, "oops");

    let err = debugger.call_function(-1, "x + 1", None).unwrap_err();
    assert!(matches!(err, DebugError::Eval(_)));
}

#[test]
fn test_set_variable_changes_control_flow() {
    let debugger = launch(LOOP);
    break_at(&debugger, "main.go:6");
    cont(&debugger);
    debugger
        .set_variable(EvalScope::default(), "i", "5")
        .unwrap();

    // Loop ends immediately: main.report runs with the first result.
    break_at(&debugger, "main.report");
    let state = cont(&debugger);
    assert_eq!(
        state.current_thread.unwrap().function.as_deref(),
        Some("main.report")
    );
    assert_eq!(eval(&debugger, "v"), "10");
}

#[test]
fn test_rewind_requires_recording() {
    let debugger = launch(LOOP);
    break_at(&debugger, "main.work");
    cont(&debugger);
    assert!(matches!(debugger.rewind(), Err(DebugError::NotRecorded)));
    assert!(matches!(debugger.checkpoint("x"), Err(DebugError::NotRecorded)));
}

#[test]
fn test_rewind_to_previous_hit_and_recording_start() {
    let config = DebuggerConfig {
        record: true,
        ..Default::default()
    };
    let debugger = launch_with(launcher(LOOP), config);
    break_at(&debugger, "main.go:12");
    let first_pc = cont(&debugger).current_thread.unwrap().pc;
    let state = cont(&debugger);
    assert!(state.recording);
    assert!(state.when.starts_with("event "));
    assert_eq!(eval(&debugger, "n"), "1");

    let state = debugger.rewind().unwrap().last().unwrap();
    assert_eq!(stopped_line(&state), 12);
    assert_eq!(stopped_breakpoint(&state), Some(1));
    assert_eq!(state.current_thread.as_ref().unwrap().pc, first_pc);
    assert_eq!(eval(&debugger, "n"), "0");
    // Running backwards does not count hits.
    assert_eq!(debugger.get_breakpoint(1).unwrap().total_hit_count, 2);

    let state = debugger.rewind().unwrap().last().unwrap();
    assert!(!state.exited);
    assert_eq!(stopped_line(&state), 3);
    assert_eq!(state.when, "event 0");
}

#[test]
fn test_rewind_after_exit() {
    let config = DebuggerConfig {
        record: true,
        ..Default::default()
    };
    let debugger = launch_with(launcher(LOOP), config);
    let bp = break_at(&debugger, "main.go:12");
    for _ in 0..3 {
        assert_eq!(stopped_breakpoint(&cont(&debugger)), Some(bp.id));
    }
    assert!(cont(&debugger).exited);

    let state = debugger.rewind().unwrap().last().unwrap();
    assert!(!state.exited);
    assert_eq!(stopped_line(&state), 12);
    assert_eq!(stopped_breakpoint(&state), Some(bp.id));
    assert_eq!(eval(&debugger, "n"), "2");
    assert_eq!(debugger.get_breakpoint(bp.id).unwrap().total_hit_count, 3);

    assert!(cont(&debugger).exited);
}

#[test]
fn test_stop_recording_keeps_replay() {
    let config = DebuggerConfig {
        record: true,
        ..Default::default()
    };
    let debugger = launch_with(launcher(LOOP), config);
    break_at(&debugger, "main.go:12");
    cont(&debugger);

    debugger.stop_recording().unwrap();
    let state = debugger.get_state().unwrap();
    assert!(!state.recording);
    let when = state.when.clone();

    let state = cont(&debugger);
    assert_eq!(stopped_line(&state), 12);
    assert_eq!(state.when, when);

    // only execution up to the stop is replayable
    let state = debugger.rewind().unwrap().last().unwrap();
    assert_eq!(stopped_line(&state), 3);
    assert_eq!(state.when, "event 0");

    debugger.restart(RestartOptions::default()).unwrap();
    assert!(debugger.get_state().unwrap().recording);

    let plain = launch(LOOP);
    assert!(matches!(plain.stop_recording(), Err(DebugError::NotRecorded)));
}

#[test]
fn test_process_pid() {
    let debugger = launch(SPIN);
    assert_eq!(debugger.process_pid().unwrap(), 1000);
    let _stream = debugger.continue_execution().unwrap();
    assert_eq!(debugger.process_pid().unwrap(), 1000);
    debugger.halt().unwrap();
}

#[test]
fn test_checkpoints_and_restart_from_checkpoint() {
    let config = DebuggerConfig {
        record: true,
        ..Default::default()
    };
    let debugger = launch_with(launcher(LOOP), config);
    break_at(&debugger, "main.go:12");
    cont(&debugger);

    let id = debugger.checkpoint("first hit").unwrap();
    assert_eq!(id, 1);
    let checkpoints = debugger.list_checkpoints().unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].note, "first hit");
    assert!(checkpoints[0].when.starts_with("event "));

    cont(&debugger);
    assert_eq!(eval(&debugger, "n"), "1");

    let lost = debugger
        .restart(RestartOptions {
            position: Some("c1".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert!(lost.is_empty());
    let state = debugger.get_state().unwrap();
    assert_eq!(state.pid, 1000);
    assert_eq!(stopped_line(&state), 12);
    assert_eq!(eval(&debugger, "n"), "0");

    debugger.clear_checkpoint(1).unwrap();
    assert!(debugger.list_checkpoints().unwrap().is_empty());
    assert!(debugger.clear_checkpoint(1).is_err());
}

#[test]
fn test_replay_rejects_mutation() {
    let config = DebuggerConfig {
        record: true,
        ..Default::default()
    };
    let debugger = launch_with(launcher(LOOP), config);
    break_at(&debugger, "main.go:12");
    cont(&debugger);

    let err = debugger
        .set_variable(EvalScope::default(), "n", "7")
        .unwrap_err();
    assert!(matches!(err, DebugError::InvalidArgument(_)));
    let err = debugger.call_function(-1, "main.work(1)", None).unwrap_err();
    assert!(matches!(err, DebugError::InvalidArgument(_)));
}

#[test]
fn test_restart_relaunches_with_new_args() {
    let debugger = launch(LOOP);
    break_at(&debugger, "main.work");
    cont(&debugger);

    let lost = debugger
        .restart(RestartOptions {
            reset_args: true,
            new_args: vec!["-v".to_string()],
            ..Default::default()
        })
        .unwrap();
    assert!(lost.is_empty());
    let state = debugger.get_state().unwrap();
    assert_eq!(state.pid, 1001);
    assert_eq!(state.target_command_line, "/src/prog.json -v");
    assert_eq!(debugger.get_breakpoint(1).unwrap().total_hit_count, 0);

    let state = cont(&debugger);
    assert_eq!(stopped_breakpoint(&state), Some(1));
}

#[test]
fn test_switch_goroutine_and_thread() {
    let debugger = launch(LOOP);
    break_at(&debugger, "main.work");
    cont(&debugger);

    let state = debugger.switch_goroutine(1).unwrap();
    assert_eq!(state.selected_goroutine.unwrap().id, 1);
    assert!(matches!(
        debugger.switch_goroutine(99),
        Err(DebugError::GoroutineNotFound(99))
    ));
    assert!(matches!(
        debugger.switch_thread(42),
        Err(DebugError::ThreadNotFound(42))
    ));
}
