// Simulated process
//
// Implements process control over a `Machine`. Recorded processes keep a snapshot per
// executed instruction, up to a limit, so they can run backwards and restart from any
// retained event.

use super::eval::{self, Ast, Scope, Value};
use super::history::{History, HISTORY_LIMIT};
use super::image::Image;
use super::launcher::ProgramStore;
use super::machine::{CallOutcome, Effect, Machine, IDLE_THREAD, MAIN_THREAD};
use super::symbols::SimSymbols;
use crate::backend::{
    CallResult, Interrupt, OsThread, ProcessControl, RawAncestor, RawFrame, RawGoroutine,
    StopEvent, StopReason, SymbolTable,
};
use crate::error::{DebugError, DebugResult};
use crate::types::{Checkpoint, GoroutineId, LoadConfig, Pid, Register, ThreadId, Variable};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const STACK_TOP: u64 = 0xc000_0000;
const FRAME_SIZE: u64 = 0x20;

#[derive(Debug, Default)]
pub struct SimInterrupt {
    requested: AtomicBool,
}

impl SimInterrupt {
    fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }
}

impl Interrupt for SimInterrupt {
    fn interrupt(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }
}

struct SavedCheckpoint {
    id: i32,
    note: String,
    position: usize,
    machine: Machine,
}

struct Recording {
    initial: Machine,
    /// Machine state before each executed instruction.
    history: History<Machine>,
    /// False once recording was stopped; what was captured stays replayable.
    active: bool,
    checkpoints: Vec<SavedCheckpoint>,
    next_checkpoint: i32,
}

impl Recording {
    fn new(initial: Machine) -> Self {
        Self {
            initial,
            history: History::new(HISTORY_LIMIT),
            active: true,
            checkpoints: Vec::new(),
            next_checkpoint: 1,
        }
    }
}

fn event_name(position: usize) -> String {
    format!("event {}", position)
}

/// Identifiers of a frame: its locals, then function names.
struct FrameScope<'a> {
    machine: &'a Machine,
    goroutine: GoroutineId,
    frame: usize,
}

impl Scope for FrameScope<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        if let Ok(frame) = self.machine.frame(self.goroutine, self.frame) {
            if let Some(value) = frame.locals.get(name) {
                return Some(value.clone());
            }
        }
        self.machine
            .image
            .function(name)
            .map(|_| Value::Func(name.to_string()))
    }
}

pub struct SimProcess {
    pid: Pid,
    cmdline: String,
    store: Arc<ProgramStore>,
    machine: Machine,
    breakpoints: BTreeSet<u64>,
    interrupt: Arc<SimInterrupt>,
    /// Where the process last stopped; resuming from here does not trap again.
    resume_past: Option<u64>,
    recording: Option<Recording>,
    follow_exec: bool,
    detached: bool,
}

impl SimProcess {
    pub(crate) fn new(
        pid: Pid,
        cmdline: String,
        store: Arc<ProgramStore>,
        machine: Machine,
        record: bool,
    ) -> Self {
        let recording = record.then(|| Recording::new(machine.clone()));
        Self {
            pid,
            cmdline,
            store,
            machine,
            breakpoints: BTreeSet::new(),
            interrupt: Arc::new(SimInterrupt::default()),
            resume_past: None,
            recording,
            follow_exec: false,
            detached: false,
        }
    }

    fn ensure_attached(&self) -> DebugResult<()> {
        if self.detached {
            return Err(DebugError::Backend(format!("process {} is detached", self.pid)));
        }
        Ok(())
    }

    fn image(&self) -> &Image {
        &self.machine.image
    }

    fn stopped(&mut self, reason: StopReason) -> StopEvent {
        self.resume_past = self.machine.current_pc();
        StopEvent::new(Some(MAIN_THREAD), reason)
    }

    /// Execute one instruction and translate its side effect into a stop, if any.
    fn execute(&mut self) -> DebugResult<Option<StopEvent>> {
        if let Some(recording) = &mut self.recording {
            if recording.active {
                recording.history.push(self.machine.clone());
            }
        }
        let event = match self.machine.step()? {
            Effect::None => None,
            Effect::Exited(code) => {
                info!("Process {} exited with status {}", self.pid, code);
                Some(StopEvent::new(None, StopReason::Exited(code)))
            }
            Effect::PluginLoaded(name) => {
                debug!("Process {} loaded {}", self.pid, name);
                Some(StopEvent::new(Some(MAIN_THREAD), StopReason::PluginLoaded(name)))
            }
            Effect::Spawn { program, args } if self.follow_exec => {
                match self.store.spawn(&program, &args, false) {
                    Ok(child) => Some(StopEvent::new(
                        Some(MAIN_THREAD),
                        StopReason::NewProcess(Box::new(child)),
                    )),
                    Err(e) => {
                        warn!("Process {} could not start {}: {}", self.pid, program, e);
                        None
                    }
                }
            }
            Effect::Spawn { program, .. } => {
                debug!("Process {} started {} (not followed)", self.pid, program);
                None
            }
        };
        Ok(event)
    }

    fn check_thread(&self, thread: ThreadId) -> DebugResult<()> {
        if thread == MAIN_THREAD || thread == IDLE_THREAD {
            Ok(())
        } else {
            Err(DebugError::ThreadNotFound(thread))
        }
    }

    fn registers(&self, pc: u64, depth: usize, include_fp: bool) -> Vec<Register> {
        let sp = STACK_TOP - depth as u64 * FRAME_SIZE;
        let mut regs = vec![
            Register {
                name: "PC".to_string(),
                value: format!("{:#x}", pc),
            },
            Register {
                name: "SP".to_string(),
                value: format!("{:#x}", sp),
            },
            Register {
                name: "BP".to_string(),
                value: format!("{:#x}", sp + FRAME_SIZE / 2),
            },
        ];
        if include_fp {
            regs.push(Register {
                name: "XMM0".to_string(),
                value: "0x0".to_string(),
            });
        }
        regs
    }

    fn scope(&self, goroutine: GoroutineId, frame: usize) -> DebugResult<FrameScope<'_>> {
        self.machine.frame(goroutine, frame)?;
        Ok(FrameScope {
            machine: &self.machine,
            goroutine,
            frame,
        })
    }
}

impl ProcessControl for SimProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn cmdline(&self) -> String {
        self.cmdline.clone()
    }

    fn symbols(&self) -> DebugResult<Box<dyn SymbolTable>> {
        Ok(Box::new(SimSymbols::new(self.machine.image.clone())))
    }

    fn interrupter(&self) -> Arc<dyn Interrupt> {
        self.interrupt.clone()
    }

    fn resume(&mut self) -> DebugResult<StopEvent> {
        self.ensure_attached()?;
        if let Some(code) = self.machine.exit_status() {
            return Ok(StopEvent::new(None, StopReason::Exited(code)));
        }
        let mut skip = self.resume_past.take();
        loop {
            if self.interrupt.take() {
                return Ok(self.stopped(StopReason::Halted));
            }
            let pc = self.machine.current_pc();
            if let Some(pc) = pc {
                if skip != Some(pc) && self.breakpoints.contains(&pc) {
                    return Ok(self.stopped(StopReason::Breakpoint));
                }
            }
            skip = None;
            if let Some(event) = self.execute()? {
                return Ok(event);
            }
        }
    }

    fn step_instruction(&mut self, thread: ThreadId) -> DebugResult<StopEvent> {
        self.ensure_attached()?;
        self.check_thread(thread)?;
        if let Some(code) = self.machine.exit_status() {
            return Ok(StopEvent::new(None, StopReason::Exited(code)));
        }
        if thread == IDLE_THREAD {
            return Ok(StopEvent::new(Some(IDLE_THREAD), StopReason::Stepped));
        }
        match self.execute()? {
            Some(event) => {
                if self.machine.exit_status().is_none() {
                    self.resume_past = self.machine.current_pc();
                }
                Ok(event)
            }
            None => Ok(self.stopped(StopReason::Stepped)),
        }
    }

    fn reverse_resume(&mut self) -> DebugResult<StopEvent> {
        self.ensure_attached()?;
        let recording = self.recording.as_mut().ok_or(DebugError::NotRecorded)?;
        while let Some(previous) = recording.history.pop() {
            self.machine = previous;
            if self.interrupt.take() {
                self.resume_past = self.machine.current_pc();
                return Ok(StopEvent::new(Some(MAIN_THREAD), StopReason::Halted));
            }
            if let Some(pc) = self.machine.current_pc() {
                if self.breakpoints.contains(&pc) {
                    self.resume_past = Some(pc);
                    return Ok(StopEvent::new(Some(MAIN_THREAD), StopReason::Breakpoint));
                }
            }
        }
        // With older events dropped the last restored snapshot is the earliest state left.
        if recording.history.base() == 0 {
            self.machine = recording.initial.clone();
        }
        self.resume_past = None;
        debug!("Process {} rewound to the start of the recording", self.pid);
        Ok(StopEvent::new(Some(MAIN_THREAD), StopReason::RecordingStart))
    }

    fn install_breakpoint(&mut self, addr: u64) -> DebugResult<()> {
        if self.image().function_at(addr).is_none() {
            return Err(DebugError::Backend(format!(
                "could not set breakpoint at {:#x}: address not mapped",
                addr
            )));
        }
        self.breakpoints.insert(addr);
        Ok(())
    }

    fn remove_breakpoint(&mut self, addr: u64) -> DebugResult<()> {
        self.breakpoints.remove(&addr);
        Ok(())
    }

    fn threads(&self) -> Vec<OsThread> {
        self.machine.threads()
    }

    fn goroutines(&self) -> Vec<RawGoroutine> {
        self.machine.goroutines()
    }

    fn stacktrace(&self, goroutine: GoroutineId, depth: usize) -> DebugResult<Vec<RawFrame>> {
        let g = self.machine.goroutine(goroutine)?;
        Ok(g.frames
            .iter()
            .rev()
            .take(depth)
            .enumerate()
            .map(|(i, f)| RawFrame {
                pc: f.pc,
                frame_offset: -((i as i64 + 1) * FRAME_SIZE as i64),
            })
            .collect())
    }

    fn ancestors(&self, goroutine: GoroutineId, count: usize) -> DebugResult<Vec<RawAncestor>> {
        let g = self.machine.goroutine(goroutine)?;
        Ok(g.ancestors.iter().take(count).cloned().collect())
    }

    fn thread_registers(&self, thread: ThreadId, include_fp: bool) -> DebugResult<Vec<Register>> {
        self.check_thread(thread)?;
        let raw = self
            .machine
            .threads()
            .into_iter()
            .find(|t| t.id == thread)
            .ok_or(DebugError::ThreadNotFound(thread))?;
        let depth = raw
            .goroutine_id
            .and_then(|g| self.machine.goroutine(g).ok())
            .map(|g| g.frames.len())
            .unwrap_or(0);
        Ok(self.registers(raw.pc, depth, include_fp))
    }

    fn frame_registers(
        &self,
        goroutine: GoroutineId,
        frame: usize,
        include_fp: bool,
    ) -> DebugResult<Vec<Register>> {
        let pc = self.machine.frame(goroutine, frame)?.pc;
        let depth = self.machine.goroutine(goroutine)?.frames.len() - frame;
        Ok(self.registers(pc, depth, include_fp))
    }

    fn read_memory(&self, addr: u64, len: usize) -> DebugResult<Vec<u8>> {
        Ok(self.image().read(addr, len))
    }

    fn eval(
        &self,
        goroutine: GoroutineId,
        frame: usize,
        expr: &str,
        cfg: &LoadConfig,
    ) -> DebugResult<Variable> {
        let scope = self.scope(goroutine, frame)?;
        let value = eval::evaluate(&eval::parse(expr)?, &scope)?;
        Ok(value.to_variable(expr, cfg))
    }

    fn set_variable(
        &mut self,
        goroutine: GoroutineId,
        frame: usize,
        symbol: &str,
        value: &str,
    ) -> DebugResult<()> {
        if self.recording.is_some() {
            return Err(DebugError::InvalidArgument(
                "can not set variables while replaying a recording".to_string(),
            ));
        }
        let value = {
            let scope = self.scope(goroutine, frame)?;
            eval::evaluate(&eval::parse(value)?, &scope)?
        };
        let frame = self.machine.frame_mut(goroutine, frame)?;
        match frame.locals.get_mut(symbol) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(DebugError::Eval(format!(
                "could not find symbol value for {}",
                symbol
            ))),
        }
    }

    fn locals(&self, goroutine: GoroutineId, frame: usize, cfg: &LoadConfig) -> DebugResult<Vec<Variable>> {
        let frame = self.machine.frame(goroutine, frame)?;
        Ok(frame
            .locals
            .iter()
            .filter(|(name, _)| !frame.params.contains(*name))
            .map(|(name, value)| value.to_variable(name, cfg))
            .collect())
    }

    fn arguments(
        &self,
        goroutine: GoroutineId,
        frame: usize,
        cfg: &LoadConfig,
    ) -> DebugResult<Vec<Variable>> {
        let frame = self.machine.frame(goroutine, frame)?;
        Ok(frame
            .params
            .iter()
            .map(|name| match frame.locals.get(name) {
                Some(value) => value.to_variable(name, cfg),
                None => Variable::unreadable(name, "argument not passed"),
            })
            .collect())
    }

    fn return_values(&self, thread: ThreadId, cfg: &LoadConfig) -> Vec<Variable> {
        if thread != MAIN_THREAD {
            return Vec::new();
        }
        self.machine
            .last_return()
            .iter()
            .enumerate()
            .map(|(i, value)| value.to_variable(&format!("~r{}", i), cfg))
            .collect()
    }

    fn call_function(
        &mut self,
        goroutine: GoroutineId,
        expr: &str,
        cfg: &LoadConfig,
    ) -> DebugResult<CallResult> {
        if self.recording.is_some() {
            return Err(DebugError::InvalidArgument(
                "can not call functions while replaying a recording".to_string(),
            ));
        }
        let (name, args) = match eval::parse(expr)? {
            Ast::Call(name, args) => (name, args),
            _ => return Err(DebugError::Eval(format!("not a function call: {}", expr))),
        };
        let values = {
            let scope = self.scope(goroutine, 0)?;
            args.iter()
                .map(|a| eval::evaluate(a, &scope))
                .collect::<DebugResult<Vec<_>>>()?
        };
        debug!("Process {} calling {} with {} args", self.pid, name, values.len());
        Ok(match self.machine.call(goroutine, &name, values)? {
            CallOutcome::Returned(values) => CallResult {
                return_values: values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| v.to_variable(&format!("~r{}", i), cfg))
                    .collect(),
                panic: None,
            },
            CallOutcome::Panicked(message) => CallResult {
                return_values: Vec::new(),
                panic: Some(Value::Str(message).to_variable("", cfg)),
            },
        })
    }

    fn recorded(&self) -> bool {
        self.recording.is_some()
    }

    fn recording(&self) -> bool {
        self.recording.as_ref().map_or(false, |r| r.active)
    }

    fn stop_recording(&mut self) -> DebugResult<()> {
        let recording = self.recording.as_mut().ok_or(DebugError::NotRecorded)?;
        if recording.active {
            recording.active = false;
            info!(
                "Process {} stopped recording at {}",
                self.pid,
                event_name(recording.history.position())
            );
        }
        Ok(())
    }

    fn when(&self) -> String {
        self.recording
            .as_ref()
            .map(|r| event_name(r.history.position()))
            .unwrap_or_default()
    }

    fn restart_recording(&mut self, checkpoint: Option<&str>) -> DebugResult<()> {
        let recording = self.recording.as_mut().ok_or(DebugError::NotRecorded)?;
        match checkpoint.map(str::trim) {
            None | Some("") => {
                self.machine = recording.initial.clone();
                recording.history.reset(0);
            }
            Some(position) => {
                if let Some(id) = position.strip_prefix('c') {
                    let id: i32 = id.parse().map_err(|_| {
                        DebugError::InvalidArgument(format!("invalid checkpoint {}", position))
                    })?;
                    let saved = recording
                        .checkpoints
                        .iter()
                        .find(|c| c.id == id)
                        .ok_or_else(|| {
                            DebugError::InvalidArgument(format!("checkpoint {} not found", id))
                        })?;
                    self.machine = saved.machine.clone();
                    recording.history.truncate(saved.position);
                } else {
                    let event: usize = position.parse().map_err(|_| {
                        DebugError::InvalidArgument(format!("invalid position {}", position))
                    })?;
                    if event < recording.history.base() {
                        return Err(DebugError::InvalidArgument(format!(
                            "{} is no longer recorded",
                            event_name(event)
                        )));
                    }
                    if let Some(snapshot) = recording.history.get(event) {
                        self.machine = snapshot.clone();
                        recording.history.truncate(event);
                    } else if event > recording.history.position() {
                        return Err(DebugError::InvalidArgument(format!(
                            "{} has not been recorded yet",
                            event_name(event)
                        )));
                    }
                }
            }
        }
        recording.active = true;
        self.resume_past = None;
        info!("Process {} restarted at {}", self.pid, self.when());
        Ok(())
    }

    fn checkpoint(&mut self, note: &str) -> DebugResult<i32> {
        let recording = self.recording.as_mut().ok_or(DebugError::NotRecorded)?;
        let id = recording.next_checkpoint;
        recording.next_checkpoint += 1;
        recording.checkpoints.push(SavedCheckpoint {
            id,
            note: note.to_string(),
            position: recording.history.position(),
            machine: self.machine.clone(),
        });
        Ok(id)
    }

    fn checkpoints(&self) -> Vec<Checkpoint> {
        self.recording
            .as_ref()
            .map(|r| {
                r.checkpoints
                    .iter()
                    .map(|c| Checkpoint {
                        id: c.id,
                        when: event_name(c.position),
                        note: c.note.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn clear_checkpoint(&mut self, id: i32) -> DebugResult<()> {
        let recording = self.recording.as_mut().ok_or(DebugError::NotRecorded)?;
        let before = recording.checkpoints.len();
        recording.checkpoints.retain(|c| c.id != id);
        if recording.checkpoints.len() == before {
            return Err(DebugError::InvalidArgument(format!("checkpoint {} not found", id)));
        }
        Ok(())
    }

    fn set_follow_exec(&mut self, enabled: bool) {
        self.follow_exec = enabled;
    }

    fn detach(&mut self, kill: bool) -> DebugResult<()> {
        self.ensure_attached()?;
        self.detached = true;
        info!("Detached from process {} (kill={})", self.pid, kill);
        Ok(())
    }
}
