// Execution control
//
// Continue and rewind run on a worker thread; stepping, calls and selection changes run
// synchronously under the engine lock.

use super::engine::{Engine, StopInfo};
use super::{lock, Debugger};
use crate::backend::{OsThread, StopReason};
use crate::breakpoint::HitOutcome;
use crate::error::{DebugError, DebugResult};
use crate::stream::{ContinueStream, RunControl, StateSender};
use crate::types::{
    DebuggerState, GoroutineId, LoadConfig, Pid, ThreadId, Variable, VariableKind,
};
use tracing::{debug, info, warn};

/// Source-level stepping granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Next line in the current function, stepping over calls.
    Next,
    /// Next line, entering called functions.
    Step,
    /// Until the current function returns.
    StepOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Forward,
    Backward,
}

/// One round of a continue: a tracepoint to report, or the final stop.
pub(crate) enum Progress {
    Trace(DebuggerState),
    Done(DebuggerState),
}

enum StepEnd {
    Stopped(OsThread),
    Exited,
}

impl Debugger {
    /// Resume every live target. Tracepoint hits stream as intermediate states; the
    /// last state is a real stop or the exit.
    pub fn continue_execution(&self) -> DebugResult<ContinueStream> {
        self.run_worker(Direction::Forward)
    }

    /// Run backwards to the previous breakpoint or to the start of the recording. A
    /// recorded target that already exited runs back from its exit.
    pub fn rewind(&self) -> DebugResult<ContinueStream> {
        {
            let mut engine = self.command()?;
            let recorded = engine
                .targets
                .current()
                .map(|t| t.process().recorded())
                .unwrap_or(false);
            if engine.exited_status().is_none() && !recorded {
                return Err(DebugError::NotRecorded);
            }
            if recorded && !engine.detached {
                engine.revive_recorded();
            }
        }
        self.run_worker(Direction::Backward)
    }

    /// Continue without a consumer; used when a client disconnects with `cont`.
    pub fn continue_detached(&self) -> DebugResult<()> {
        let stream = self.continue_execution()?;
        std::thread::Builder::new()
            .name("loupe-detached".to_string())
            .spawn(move || {
                let last = stream.last();
                debug!("Detached continue finished: {:?}", last.map(|s| s.pid));
            })?;
        Ok(())
    }

    fn run_worker(&self, direction: Direction) -> DebugResult<ContinueStream> {
        let engine = self.command()?;
        if engine.detached {
            return Err(DebugError::NoTarget);
        }
        if let Some((pid, status)) = engine.exited_status() {
            return Ok(ContinueStream::ready(
                self.run.clone(),
                engine.exited_state(pid, status),
            ));
        }
        let interrupters: Vec<_> = engine
            .targets
            .iter()
            .filter(|t| t.is_alive())
            .map(|t| t.interrupter())
            .collect();
        for interrupter in &interrupters {
            interrupter.reset();
        }
        self.run.begin(interrupters)?;
        drop(engine);

        let (tx, stream) = ContinueStream::channel(self.run.clone());
        let worker = self.clone();
        let spawned = std::thread::Builder::new()
            .name("loupe-continue".to_string())
            .spawn(move || worker.continue_worker(tx, direction));
        if let Err(e) = spawned {
            self.run.finish();
            return Err(DebugError::Io(e));
        }
        Ok(stream)
    }

    fn continue_worker(&self, tx: StateSender, direction: Direction) {
        let mut engine = lock(&self.engine);
        let last = loop {
            match engine.continue_once(&self.run, direction) {
                Ok(Progress::Trace(state)) => {
                    self.run.publish_state(&state);
                    if !tx.push(state) {
                        debug!("Continue stream closed by consumer, halting");
                        self.run.request_halt();
                    }
                }
                Ok(Progress::Done(state)) => break state,
                Err(e) => {
                    warn!("Continue failed: {}", e);
                    break engine.error_state(&e);
                }
            }
        };
        self.run.publish_state(&last);
        self.run.publish_symbols(engine.symbol_handles());
        drop(engine);
        self.run.finish();
        let _ = tx.push_final(last);
    }

    pub fn next(&self) -> DebugResult<DebuggerState> {
        self.step_with(StepMode::Next, None)
    }

    pub fn step(&self) -> DebugResult<DebuggerState> {
        self.step_with(StepMode::Step, None)
    }

    /// Step out of the current function, loading return values with `load` if given.
    pub fn step_out(&self, load: Option<&LoadConfig>) -> DebugResult<DebuggerState> {
        self.step_with(StepMode::StepOut, load)
    }

    fn step_with(&self, mode: StepMode, load: Option<&LoadConfig>) -> DebugResult<DebuggerState> {
        let mut engine = self.command()?;
        if let Some((pid, status)) = engine.exited_status() {
            return Ok(engine.exited_state(pid, status));
        }
        let state = engine.step(mode, load)?;
        self.run.publish_state(&state);
        Ok(state)
    }

    /// Execute one machine instruction, or a whole call with `skip_calls`.
    pub fn step_instruction(&self, skip_calls: bool) -> DebugResult<DebuggerState> {
        let mut engine = self.command()?;
        if let Some((pid, status)) = engine.exited_status() {
            return Ok(engine.exited_state(pid, status));
        }
        let state = engine.step_instruction(skip_calls)?;
        self.run.publish_state(&state);
        Ok(state)
    }

    /// Call a function in the selected goroutine (or `goroutine`, if not -1).
    pub fn call_function(
        &self,
        goroutine: GoroutineId,
        expr: &str,
        load: Option<&LoadConfig>,
    ) -> DebugResult<DebuggerState> {
        let mut engine = self.command()?;
        if let Some((pid, status)) = engine.exited_status() {
            return Ok(engine.exited_state(pid, status));
        }
        let state = engine.call(goroutine, expr, load)?;
        self.run.publish_state(&state);
        Ok(state)
    }

    pub fn switch_thread(&self, id: ThreadId) -> DebugResult<DebuggerState> {
        let mut engine = self.command()?;
        if let Some((pid, status)) = engine.exited_status() {
            return Ok(engine.exited_state(pid, status));
        }
        let target = engine.targets.current_mut()?;
        let raw = target
            .process()
            .threads()
            .into_iter()
            .find(|t| t.id == id)
            .ok_or(DebugError::ThreadNotFound(id))?;
        target.current_thread = Some(raw.id);
        target.selected_goroutine = raw.goroutine_id;
        debug!("Switched to thread {}", id);
        engine.state()
    }

    pub fn switch_goroutine(&self, id: GoroutineId) -> DebugResult<DebuggerState> {
        let mut engine = self.command()?;
        if let Some((pid, status)) = engine.exited_status() {
            return Ok(engine.exited_state(pid, status));
        }
        let target = engine.targets.current_mut()?;
        let raw = target
            .process()
            .goroutines()
            .into_iter()
            .find(|g| g.id == id)
            .ok_or(DebugError::GoroutineNotFound(id))?;
        target.selected_goroutine = Some(raw.id);
        if let Some(thread) = raw.thread_id {
            target.current_thread = Some(thread);
        }
        debug!("Switched to goroutine {}", id);
        engine.state()
    }
}

impl Engine {
    /// Resume until something worth reporting happens.
    pub(crate) fn continue_once(
        &mut self,
        run: &RunControl,
        direction: Direction,
    ) -> DebugResult<Progress> {
        loop {
            let pid = match direction {
                Direction::Forward => self.targets.live_pids_newest_first().first().copied(),
                Direction::Backward => self.targets.current_pid(),
            };
            let pid = match pid {
                Some(pid) => pid,
                None => return Ok(Progress::Done(self.state()?)),
            };

            self.stop = StopInfo::default();
            let event = {
                let target = self.targets.get_mut(pid).ok_or(DebugError::NoTarget)?;
                target.set_status(crate::target::TargetStatus::Running);
                let event = match direction {
                    Direction::Forward => target.process_mut().resume(),
                    Direction::Backward => target.process_mut().reverse_resume(),
                };
                target.set_status(crate::target::TargetStatus::Stopped);
                event?
            };
            debug!("Target {} stopped: {:?}", pid, event.reason);

            match event.reason {
                StopReason::Breakpoint => {
                    let raw = self.thread_of(pid, event.thread);
                    let raw = match raw {
                        Some(raw) => raw,
                        None => {
                            self.select_thread(pid, None);
                            return Ok(Progress::Done(self.state()?));
                        }
                    };
                    let outcome = match direction {
                        Direction::Forward => self.count_hit(pid, &raw),
                        Direction::Backward => self.peek_hit(pid, &raw),
                    };
                    match outcome {
                        HitOutcome::Skip => continue,
                        HitOutcome::NotOurs => {
                            self.select_thread(pid, Some(raw.id));
                            self.stop.thread = Some(raw.id);
                            return Ok(Progress::Done(self.state()?));
                        }
                        HitOutcome::Stop {
                            id,
                            tracepoint,
                            cond_error,
                        } => {
                            self.select_thread(pid, Some(raw.id));
                            self.stop = StopInfo {
                                thread: Some(raw.id),
                                breakpoint: self.breakpoints.get(id).ok(),
                                info: self.collect_info(pid, id, raw.goroutine_id, cond_error),
                                ..Default::default()
                            };
                            let state = self.state()?;
                            return Ok(if tracepoint {
                                Progress::Trace(state)
                            } else {
                                Progress::Done(state)
                            });
                        }
                    }
                }
                StopReason::Halted | StopReason::Stepped | StopReason::RecordingStart => {
                    run.clear_halt();
                    self.select_thread(pid, event.thread);
                    self.stop.thread = event.thread;
                    return Ok(Progress::Done(self.state()?));
                }
                StopReason::Exited(status) => {
                    if self.handle_exit(pid, status) {
                        return Ok(Progress::Done(self.state()?));
                    }
                }
                StopReason::PluginLoaded(name) => {
                    self.plugin_loaded(pid, &name)?;
                    run.publish_symbols(self.symbol_handles());
                }
                StopReason::NewProcess(child) => {
                    if let Some(target) = self.adopt_child(child) {
                        run.add_interrupter(target.interrupter());
                        self.adopt(target);
                        run.publish_symbols(self.symbol_handles());
                    }
                }
            }
        }
    }

    fn thread_of(&self, pid: Pid, thread: Option<ThreadId>) -> Option<OsThread> {
        let id = thread?;
        self.targets
            .get(pid)?
            .process()
            .threads()
            .into_iter()
            .find(|t| t.id == id)
    }

    /// Evaluate the condition at the trap and count the hit.
    fn count_hit(&mut self, pid: Pid, raw: &OsThread) -> HitOutcome {
        let goroutine = raw.goroutine_id.unwrap_or(0);
        let cond = self
            .breakpoints
            .condition_at(pid, raw.pc)
            .map(|c| self.eval_condition(pid, goroutine, &c));
        self.breakpoints
            .record_hit(&mut self.targets, pid, raw.pc, goroutine, cond)
    }

    /// Hit test without touching counters, used when running backwards.
    fn peek_hit(&self, pid: Pid, raw: &OsThread) -> HitOutcome {
        let (id, tracepoint) = match self.breakpoints.owner(pid, raw.pc) {
            Some(bp) => (bp.id, bp.tracepoint),
            None => return HitOutcome::NotOurs,
        };
        let goroutine = raw.goroutine_id.unwrap_or(0);
        let cond_error = match self.breakpoints.condition_at(pid, raw.pc) {
            Some(cond) => match self.eval_condition(pid, goroutine, &cond) {
                Ok(true) => None,
                Ok(false) => return HitOutcome::Skip,
                Err(e) => Some(e.to_string()),
            },
            None => None,
        };
        HitOutcome::Stop {
            id,
            tracepoint,
            cond_error,
        }
    }

    pub(crate) fn step(&mut self, mode: StepMode, load: Option<&LoadConfig>) -> DebugResult<DebuggerState> {
        let (pid, start) = self.current_thread()?;
        let goroutine = start.goroutine_id.ok_or(DebugError::NoCurrentLocation)?;
        let start_depth = self.stack_depth(pid, goroutine);
        let start_loc = self
            .targets
            .get(pid)
            .map(|t| t.location_for_pc(start.pc))
            .unwrap_or_default();
        self.stop = StopInfo::default();

        let end = self.step_until(pid, start.id, goroutine, false, |engine, thread, depth| {
            let new_line = || {
                engine.line_entry_at(pid, thread.pc).map_or(false, |e| {
                    e.is_stmt && (e.line != start_loc.line || e.file != start_loc.file)
                })
            };
            match mode {
                StepMode::StepOut => depth < start_depth,
                StepMode::Next => depth < start_depth || (depth == start_depth && new_line()),
                StepMode::Step => {
                    depth < start_depth
                        || (depth == start_depth && new_line())
                        || (depth > start_depth
                            && engine
                                .line_entry_at(pid, thread.pc)
                                .map_or(false, |e| e.is_stmt))
                }
            }
        })?;

        if let StepEnd::Stopped(thread) = end {
            if mode == StepMode::StepOut {
                if let (Some(cfg), Some(target)) = (load, self.targets.get(pid)) {
                    self.stop.return_values = target.process().return_values(thread.id, cfg);
                }
            }
        }
        self.state()
    }

    pub(crate) fn step_instruction(&mut self, skip_calls: bool) -> DebugResult<DebuggerState> {
        let (pid, start) = self.current_thread()?;
        self.stop = StopInfo::default();

        let call_len = if skip_calls {
            let target = self.targets.get(pid).ok_or(DebugError::NoTarget)?;
            let mem = target.process().read_memory(start.pc, 16)?;
            self.disassembler
                .decode(&mem, start.pc)
                .into_iter()
                .next()
                .filter(|i| i.is_call)
                .map(|i| i.len as u64)
        } else {
            None
        };

        match (call_len, start.goroutine_id) {
            (Some(len), Some(goroutine)) => {
                let depth0 = self.stack_depth(pid, goroutine);
                let ret = start.pc + len;
                self.step_until(pid, start.id, goroutine, false, |_, thread, depth| {
                    depth <= depth0 && thread.pc == ret
                })?;
            }
            _ => {
                let goroutine = start.goroutine_id.unwrap_or(0);
                self.step_until(pid, start.id, goroutine, true, |_, _, _| true)?;
            }
        }
        self.state()
    }

    /// Single-step `thread` until `done` holds for `goroutine`, reporting any
    /// breakpoint crossed on the way.
    fn step_until<F>(
        &mut self,
        pid: Pid,
        thread_id: ThreadId,
        goroutine: GoroutineId,
        any_goroutine: bool,
        done: F,
    ) -> DebugResult<StepEnd>
    where
        F: Fn(&Engine, &OsThread, usize) -> bool,
    {
        loop {
            let event = self
                .targets
                .get_mut(pid)
                .ok_or(DebugError::NoTarget)?
                .process_mut()
                .step_instruction(thread_id)?;
            match event.reason {
                StopReason::Exited(status) => {
                    self.handle_exit(pid, status);
                    return Ok(StepEnd::Exited);
                }
                StopReason::PluginLoaded(name) => self.plugin_loaded(pid, &name)?,
                StopReason::NewProcess(child) => {
                    if let Some(target) = self.adopt_child(child) {
                        self.adopt(target);
                    }
                }
                _ => {}
            }

            let target = self.targets.get(pid).ok_or(DebugError::NoTarget)?;
            let thread = target
                .process()
                .threads()
                .into_iter()
                .find(|t| t.id == thread_id)
                .ok_or(DebugError::ThreadNotFound(thread_id))?;
            let alive = any_goroutine || target.process().goroutines().iter().any(|g| g.id == goroutine);
            if !alive {
                self.finish_step(pid, &thread);
                return Ok(StepEnd::Stopped(thread));
            }

            let on_ours = any_goroutine || thread.goroutine_id == Some(goroutine);
            let natural = on_ours && {
                let depth = thread
                    .goroutine_id
                    .map(|g| self.stack_depth(pid, g))
                    .unwrap_or(0);
                done(self, &thread, depth)
            };

            if self.breakpoints.owner(pid, thread.pc).is_some() {
                if let HitOutcome::Stop {
                    id,
                    tracepoint,
                    cond_error,
                } = self.count_hit(pid, &thread)
                {
                    if !tracepoint || natural {
                        self.finish_step(pid, &thread);
                        self.stop.breakpoint = self.breakpoints.get(id).ok();
                        self.stop.info = self.collect_info(pid, id, thread.goroutine_id, cond_error);
                        return Ok(StepEnd::Stopped(thread));
                    }
                }
            }
            if natural {
                self.finish_step(pid, &thread);
                return Ok(StepEnd::Stopped(thread));
            }
        }
    }

    fn finish_step(&mut self, pid: Pid, thread: &OsThread) {
        self.select_thread(pid, Some(thread.id));
        self.stop.thread = Some(thread.id);
    }

    pub(crate) fn call(
        &mut self,
        goroutine: GoroutineId,
        expr: &str,
        load: Option<&LoadConfig>,
    ) -> DebugResult<DebuggerState> {
        let pid = self.targets.current_pid().ok_or(DebugError::NoTarget)?;
        let target = self.targets.get(pid).ok_or(DebugError::NoTarget)?;
        let g = self.scope_goroutine(target, goroutine)?;
        let thread = target
            .process()
            .goroutines()
            .into_iter()
            .find(|raw| raw.id == g)
            .and_then(|raw| raw.thread_id)
            .or(target.current_thread);

        let cfg = load.cloned().unwrap_or_default();
        info!("Calling {} on goroutine {}", expr, g);
        let result = self
            .targets
            .get_mut(pid)
            .ok_or(DebugError::NoTarget)?
            .process_mut()
            .call_function(g, expr, &cfg)?;

        let return_values = match result.panic {
            Some(payload) => vec![Variable {
                name: "~panic".to_string(),
                kind: VariableKind::Interface,
                type_name: "interface {}".to_string(),
                children: vec![payload],
                ..Default::default()
            }],
            None if load.is_some() => result.return_values,
            None => Vec::new(),
        };
        self.stop = StopInfo {
            thread,
            return_values,
            call_return: true,
            ..Default::default()
        };
        if let Some(id) = thread {
            self.select_thread(pid, Some(id));
            if let Some(target) = self.targets.get_mut(pid) {
                target.selected_goroutine = Some(g);
            }
        }
        self.state()
    }
}
