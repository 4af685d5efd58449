// Engine state
//
// Everything the debugger mutates lives here, behind one lock held by whichever command
// (or continue worker) is currently driving the targets.

use crate::backend::{Disassembler, LaunchOptions, OsThread, RawGoroutine};
use crate::breakpoint::BreakpointManager;
use crate::config::DebuggerConfig;
use crate::error::{DebugError, DebugResult};
use crate::target::{SharedSymbols, Target, TargetRegistry};
use crate::types::{
    Breakpoint, BreakpointId, BreakpointInfo, DebuggerState, Goroutine, GoroutineId, LineEntry,
    LoadConfig, Location, Pid, StackFrame, Thread, ThreadId, Variable,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Frames walked when computing stack depth or the user location of a goroutine.
pub(crate) const MAX_STACK_DEPTH: usize = 1024;

/// Details of the last stop, attached to the stopping thread in state snapshots.
#[derive(Debug, Clone, Default)]
pub(crate) struct StopInfo {
    pub thread: Option<ThreadId>,
    pub breakpoint: Option<Breakpoint>,
    pub info: Option<BreakpointInfo>,
    pub return_values: Vec<Variable>,
    pub call_return: bool,
}

pub(crate) struct Engine {
    pub targets: TargetRegistry,
    pub breakpoints: BreakpointManager,
    pub config: DebuggerConfig,
    pub launch: LaunchOptions,
    pub disassembler: Arc<dyn Disassembler>,
    pub stop: StopInfo,
    pub detached: bool,
}

impl Engine {
    pub fn new(
        targets: TargetRegistry,
        config: DebuggerConfig,
        launch: LaunchOptions,
        disassembler: Arc<dyn Disassembler>,
    ) -> Self {
        let breakpoints =
            BreakpointManager::new(config.substitute_path.clone(), config.case_insensitive_paths);
        Self {
            targets,
            breakpoints,
            config,
            launch,
            disassembler,
            stop: StopInfo::default(),
            detached: false,
        }
    }

    /// Register a target and give it every breakpoint it can resolve.
    pub fn adopt(&mut self, target: Target) {
        let pid = target.pid();
        self.targets.add(target);
        self.breakpoints.ensure_internal(&mut self.targets, pid);
        self.breakpoints.sync_target(&mut self.targets, pid);
    }

    pub fn symbol_handles(&self) -> Vec<SharedSymbols> {
        self.targets.iter().map(|t| t.symbols()).collect()
    }

    /// Pid and status once every target has exited.
    pub fn exited_status(&self) -> Option<(Pid, i32)> {
        let target = self.targets.current().ok()?;
        target.exit_status().map(|status| (target.pid(), status))
    }

    pub fn ensure_alive(&self) -> DebugResult<()> {
        if self.detached {
            return Err(DebugError::NoTarget);
        }
        match self.exited_status() {
            Some((pid, status)) => Err(DebugError::ProcessExited { pid, status }),
            None => Ok(()),
        }
    }

    pub fn exited_state(&self, pid: Pid, status: i32) -> DebuggerState {
        DebuggerState {
            pid,
            target_command_line: self
                .targets
                .get(pid)
                .map(|t| t.cmdline().to_string())
                .unwrap_or_default(),
            exited: true,
            exit_status: status,
            err: Some(DebugError::ProcessExited { pid, status }.to_string()),
            ..Default::default()
        }
    }

    /// Snapshot of the current target, or the uniform exited state.
    pub fn state(&self) -> DebugResult<DebuggerState> {
        if let Some((pid, status)) = self.exited_status() {
            return Ok(self.exited_state(pid, status));
        }
        let target = self.targets.current()?;
        let process = target.process();

        let threads: Vec<Thread> = process
            .threads()
            .iter()
            .map(|t| self.thread_api(target, t))
            .collect();
        let current_thread = target
            .current_thread
            .and_then(|id| threads.iter().find(|t| t.id == id).cloned());
        let selected_goroutine = target.selected_goroutine.and_then(|id| {
            process
                .goroutines()
                .into_iter()
                .find(|g| g.id == id)
                .map(|g| goroutine_api(target, &g))
        });

        Ok(DebuggerState {
            pid: target.pid(),
            target_command_line: target.cmdline().to_string(),
            running: false,
            recording: process.recording(),
            current_thread,
            selected_goroutine,
            threads,
            exited: false,
            exit_status: 0,
            when: process.when(),
            err: None,
        })
    }

    /// State carrying an error that did not invalidate the engine.
    pub fn error_state(&self, err: &DebugError) -> DebuggerState {
        let mut state = self.state().unwrap_or_default();
        if state.err.is_none() {
            state.err = Some(err.to_string());
        }
        state
    }

    pub fn thread_api(&self, target: &Target, raw: &OsThread) -> Thread {
        let loc = target.location_for_pc(raw.pc);
        let mut thread = Thread {
            id: raw.id,
            pid: target.pid(),
            pc: raw.pc,
            file: loc.file,
            line: loc.line,
            function: loc.function,
            goroutine_id: raw.goroutine_id.unwrap_or(0),
            ..Default::default()
        };
        if self.stop.thread == Some(raw.id) && self.targets.current_pid() == Some(target.pid()) {
            thread.breakpoint = self.stop.breakpoint.clone();
            thread.breakpoint_info = self.stop.info.clone();
            thread.return_values = self.stop.return_values.clone();
            thread.call_return = self.stop.call_return;
        }
        thread
    }

    pub fn current_thread(&self) -> DebugResult<(Pid, OsThread)> {
        let target = self.targets.current()?;
        let id = target.current_thread.ok_or(DebugError::NoCurrentLocation)?;
        target
            .process()
            .threads()
            .into_iter()
            .find(|t| t.id == id)
            .map(|t| (target.pid(), t))
            .ok_or(DebugError::ThreadNotFound(id))
    }

    /// Resolve a scope goroutine id, -1 meaning the selected one.
    pub fn scope_goroutine(&self, target: &Target, id: GoroutineId) -> DebugResult<GoroutineId> {
        if id < 0 {
            return target.selected_goroutine.ok_or(DebugError::GoroutineNotFound(id));
        }
        if target.process().goroutines().iter().any(|g| g.id == id) {
            Ok(id)
        } else {
            Err(DebugError::GoroutineNotFound(id))
        }
    }

    pub fn stack_depth(&self, pid: Pid, goroutine: GoroutineId) -> usize {
        self.targets
            .get(pid)
            .and_then(|t| t.process().stacktrace(goroutine, MAX_STACK_DEPTH).ok())
            .map(|frames| frames.len())
            .unwrap_or(0)
    }

    /// Line-table entry starting exactly at `pc`.
    pub fn line_entry_at(&self, pid: Pid, pc: u64) -> Option<LineEntry> {
        let target = self.targets.get(pid)?;
        target.with_symbols(|symbols| {
            let function = symbols.function_at(pc)?;
            symbols.line_table(&function).into_iter().find(|e| e.pc == pc)
        })
    }

    pub fn stack_frames(
        &self,
        target: &Target,
        goroutine: GoroutineId,
        depth: usize,
        load: Option<&LoadConfig>,
    ) -> DebugResult<Vec<StackFrame>> {
        let raw = target.process().stacktrace(goroutine, depth)?;
        Ok(raw
            .iter()
            .enumerate()
            .map(|(i, frame)| {
                let mut out = StackFrame {
                    location: target.location_for_pc(frame.pc),
                    frame_offset: frame.frame_offset,
                    ..Default::default()
                };
                if let Some(cfg) = load {
                    let process = target.process();
                    match (
                        process.locals(goroutine, i, cfg),
                        process.arguments(goroutine, i, cfg),
                    ) {
                        (Ok(locals), Ok(arguments)) => {
                            out.locals = locals;
                            out.arguments = arguments;
                        }
                        (Err(e), _) | (_, Err(e)) => out.err = Some(e.to_string()),
                    }
                }
                out
            })
            .collect())
    }

    /// Evaluate a breakpoint condition in the goroutine that hit it.
    pub fn eval_condition(&self, pid: Pid, goroutine: GoroutineId, cond: &str) -> DebugResult<bool> {
        let target = self.targets.get(pid).ok_or(DebugError::NoTarget)?;
        let value = target
            .process()
            .eval(goroutine, 0, cond, &LoadConfig::default())?;
        match value.value.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(DebugError::Eval(format!(
                "condition expression \"{}\" is not boolean: {}",
                cond, other
            ))),
        }
    }

    /// Gather what breakpoint `id` asks to capture when it is hit.
    pub fn collect_info(
        &self,
        pid: Pid,
        id: BreakpointId,
        goroutine: Option<GoroutineId>,
        cond_error: Option<String>,
    ) -> Option<BreakpointInfo> {
        let bp = self.breakpoints.logical(id)?;
        let target = self.targets.get(pid)?;
        let process = target.process();
        let mut info = BreakpointInfo {
            condition_error: cond_error,
            ..Default::default()
        };

        let g = match goroutine {
            Some(g) => g,
            None => return Some(info),
        };
        let cfg = LoadConfig::default();
        for name in &bp.variables {
            let var = process
                .eval(g, 0, name, &cfg)
                .unwrap_or_else(|e| Variable::unreadable(name, e.to_string()));
            info.variables.push(var);
        }
        if bp.goroutine {
            info.goroutine = process
                .goroutines()
                .into_iter()
                .find(|raw| raw.id == g)
                .map(|raw| goroutine_api(target, &raw));
        }
        if bp.stacktrace > 0 {
            match self.stack_frames(target, g, bp.stacktrace as usize, None) {
                Ok(frames) => info.stacktrace = frames,
                Err(e) => warn!("Stacktrace for breakpoint {} failed: {}", id, e),
            }
        }
        if let Some(cfg) = &bp.load_args {
            info.arguments = process.arguments(g, 0, cfg).unwrap_or_default();
        }
        if let Some(cfg) = &bp.load_locals {
            info.locals = process.locals(g, 0, cfg).unwrap_or_default();
        }
        Some(info)
    }

    /// Point the target's selection at `thread`.
    pub fn select_thread(&mut self, pid: Pid, thread: Option<ThreadId>) {
        let target = match self.targets.get_mut(pid) {
            Some(t) => t,
            None => return,
        };
        let raw = thread.and_then(|id| {
            target
                .process()
                .threads()
                .into_iter()
                .find(|t| t.id == id)
        });
        match raw {
            Some(raw) => {
                target.current_thread = Some(raw.id);
                target.selected_goroutine = raw.goroutine_id;
            }
            None => target.select_default_thread(),
        }
        let _ = self.targets.set_current(pid);
    }

    /// Handle a process exit; true when it was the last live target.
    pub fn handle_exit(&mut self, pid: Pid, status: i32) -> bool {
        let others = self
            .targets
            .iter()
            .any(|t| t.pid() != pid && t.is_alive());
        if others {
            self.breakpoints.forget_target(pid);
            self.targets.remove(pid);
            debug!("Target {} exited with {}, continuing with remaining targets", pid, status);
            false
        } else {
            if let Some(target) = self.targets.get_mut(pid) {
                target.set_status(crate::target::TargetStatus::Exited(status));
            }
            let _ = self.targets.set_current(pid);
            self.breakpoints.forget_target(pid);
            self.stop = StopInfo::default();
            true
        }
    }

    /// Bring an exited recorded target back so it can run backwards.
    pub fn revive_recorded(&mut self) -> bool {
        let pid = match self.exited_status() {
            Some((pid, _)) => pid,
            None => return false,
        };
        let target = match self.targets.get_mut(pid) {
            Some(target) if target.process().recorded() => target,
            _ => return false,
        };
        target.set_status(crate::target::TargetStatus::Stopped);
        target.select_default_thread();
        self.breakpoints.sync_target(&mut self.targets, pid);
        info!("Target {} rewinds from its exit", pid);
        true
    }

    /// Follow a newly spawned child when the follow-exec filter accepts it.
    pub fn adopt_child(&mut self, mut child: Box<dyn crate::backend::ProcessControl>) -> Option<Target> {
        let cmdline = child.cmdline();
        if !self.targets.accepts_child(&cmdline) {
            debug!("Not following child {} ({})", child.pid(), cmdline);
            if let Err(e) = child.detach(false) {
                warn!("Detaching unfollowed child failed: {}", e);
            }
            return None;
        }
        match Target::new(child) {
            Ok(target) => {
                info!("Following child process {} ({})", target.pid(), cmdline);
                Some(target)
            }
            Err(e) => {
                warn!("Could not attach to child process: {}", e);
                None
            }
        }
    }

    /// Refresh debug info after a plugin load and retry suspended breakpoints.
    pub fn plugin_loaded(&mut self, pid: Pid, name: &str) -> DebugResult<()> {
        if let Some(target) = self.targets.get_mut(pid) {
            target.reload_symbols()?;
        }
        info!("Plugin {} loaded in {}", name, pid);
        self.breakpoints.ensure_internal(&mut self.targets, pid);
        self.breakpoints.sync_target(&mut self.targets, pid);
        Ok(())
    }

    /// Merge per-target resolutions of one spec by source position.
    pub fn merge_locations(per_target: Vec<(Pid, Vec<Location>)>) -> Vec<Location> {
        let mut merged: Vec<Location> = Vec::new();
        for (pid, locs) in per_target {
            for loc in locs {
                let existing = merged
                    .iter_mut()
                    .find(|m| m.file == loc.file && m.line == loc.line && m.function == loc.function);
                match existing {
                    Some(m) => {
                        m.pcs.extend(loc.pcs.iter().copied());
                        m.pc_pids.extend(std::iter::repeat(pid).take(loc.pcs.len()));
                    }
                    None => {
                        let mut loc = loc;
                        loc.pc_pids = vec![pid; loc.pcs.len()];
                        merged.push(loc);
                    }
                }
            }
        }
        merged
    }
}

pub(crate) fn format_location(loc: &Location) -> String {
    format!(
        "{}:{} {}",
        loc.file,
        loc.line,
        loc.function.as_deref().unwrap_or("?")
    )
}

pub(crate) fn goroutine_api(target: &Target, raw: &RawGoroutine) -> Goroutine {
    let current_loc = target.location_for_pc(raw.pc);
    let user_current_loc = target
        .process()
        .stacktrace(raw.id, MAX_STACK_DEPTH)
        .ok()
        .and_then(|frames| {
            frames
                .iter()
                .map(|f| target.location_for_pc(f.pc))
                .find(|loc| {
                    loc.function
                        .as_deref()
                        .map_or(false, |f| !f.starts_with("runtime."))
                })
        })
        .unwrap_or_else(|| current_loc.clone());
    let go_statement_loc = if raw.go_pc != 0 {
        target.location_for_pc(raw.go_pc)
    } else {
        Location::default()
    };
    Goroutine {
        id: raw.id,
        pid: target.pid(),
        current_loc,
        user_current_loc,
        go_statement_loc,
        start_loc: target.location_for_pc(raw.start_pc),
        thread_id: raw.thread_id.unwrap_or(0),
        status: raw.status,
        wait_reason: raw.wait_reason.clone(),
        labels: raw.labels.clone(),
    }
}
