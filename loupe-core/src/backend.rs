// Collaborator interfaces
//
// Process control, debug-info lookup, disassembly and process launching live outside the
// engine. The engine only talks to them through these traits.

use crate::error::{DebugError, DebugResult};
use crate::types::{
    Checkpoint, Function, GoroutineId, GoroutineStatus, LineEntry, LoadConfig, Pid, Register,
    ThreadId, Variable,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Asynchronous stop request, callable while the process is running.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
    /// Drop a stale request before the next resume.
    fn reset(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsThread {
    pub id: ThreadId,
    pub pc: u64,
    pub goroutine_id: Option<GoroutineId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawGoroutine {
    pub id: GoroutineId,
    pub pc: u64,
    pub thread_id: Option<ThreadId>,
    pub start_pc: u64,
    pub go_pc: u64,
    pub status: GoroutineStatus,
    pub wait_reason: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub pc: u64,
    pub frame_offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAncestor {
    pub id: GoroutineId,
    pub pcs: Vec<u64>,
}

pub enum StopReason {
    /// Stopped on an installed trap, before the trapped instruction executes.
    Breakpoint,
    Halted,
    Stepped,
    Exited(i32),
    PluginLoaded(String),
    /// A spawned or exec'd child the process-control layer attached to.
    NewProcess(Box<dyn ProcessControl>),
    /// Reverse execution reached the start of the recording.
    RecordingStart,
}

impl fmt::Debug for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Breakpoint => write!(f, "Breakpoint"),
            StopReason::Halted => write!(f, "Halted"),
            StopReason::Stepped => write!(f, "Stepped"),
            StopReason::Exited(status) => write!(f, "Exited({})", status),
            StopReason::PluginLoaded(name) => write!(f, "PluginLoaded({})", name),
            StopReason::NewProcess(child) => write!(f, "NewProcess({})", child.pid()),
            StopReason::RecordingStart => write!(f, "RecordingStart"),
        }
    }
}

#[derive(Debug)]
pub struct StopEvent {
    pub thread: Option<ThreadId>,
    pub reason: StopReason,
}

impl StopEvent {
    pub fn new(thread: Option<ThreadId>, reason: StopReason) -> Self {
        Self { thread, reason }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallResult {
    pub return_values: Vec<Variable>,
    pub panic: Option<Variable>,
}

/// Control of one live process. One in-flight operation at a time.
pub trait ProcessControl: Send {
    fn pid(&self) -> Pid;
    fn cmdline(&self) -> String;
    /// Snapshot of the currently loaded debug info.
    fn symbols(&self) -> DebugResult<Box<dyn SymbolTable>>;
    fn interrupter(&self) -> Arc<dyn Interrupt>;

    fn resume(&mut self) -> DebugResult<StopEvent>;
    fn step_instruction(&mut self, thread: ThreadId) -> DebugResult<StopEvent>;
    fn reverse_resume(&mut self) -> DebugResult<StopEvent> {
        Err(DebugError::NotRecorded)
    }

    fn install_breakpoint(&mut self, addr: u64) -> DebugResult<()>;
    fn remove_breakpoint(&mut self, addr: u64) -> DebugResult<()>;

    fn threads(&self) -> Vec<OsThread>;
    fn goroutines(&self) -> Vec<RawGoroutine>;
    fn stacktrace(&self, goroutine: GoroutineId, depth: usize) -> DebugResult<Vec<RawFrame>>;
    fn ancestors(&self, goroutine: GoroutineId, count: usize) -> DebugResult<Vec<RawAncestor>>;
    fn thread_registers(&self, thread: ThreadId, include_fp: bool) -> DebugResult<Vec<Register>>;
    fn frame_registers(
        &self,
        goroutine: GoroutineId,
        frame: usize,
        include_fp: bool,
    ) -> DebugResult<Vec<Register>>;
    fn read_memory(&self, addr: u64, len: usize) -> DebugResult<Vec<u8>>;

    fn eval(
        &self,
        goroutine: GoroutineId,
        frame: usize,
        expr: &str,
        cfg: &LoadConfig,
    ) -> DebugResult<Variable>;
    fn set_variable(
        &mut self,
        goroutine: GoroutineId,
        frame: usize,
        symbol: &str,
        value: &str,
    ) -> DebugResult<()>;
    fn locals(&self, goroutine: GoroutineId, frame: usize, cfg: &LoadConfig) -> DebugResult<Vec<Variable>>;
    fn arguments(
        &self,
        goroutine: GoroutineId,
        frame: usize,
        cfg: &LoadConfig,
    ) -> DebugResult<Vec<Variable>>;
    /// Values returned by the most recently completed function on this thread.
    fn return_values(&self, thread: ThreadId, cfg: &LoadConfig) -> Vec<Variable>;
    fn call_function(
        &mut self,
        goroutine: GoroutineId,
        expr: &str,
        cfg: &LoadConfig,
    ) -> DebugResult<CallResult>;

    fn recorded(&self) -> bool {
        false
    }
    /// True while new execution is being captured.
    fn recording(&self) -> bool {
        false
    }
    /// Stop capturing; the existing recording stays replayable.
    fn stop_recording(&mut self) -> DebugResult<()> {
        Err(DebugError::NotRecorded)
    }
    /// Position in the recording, empty for live processes.
    fn when(&self) -> String {
        String::new()
    }
    fn restart_recording(&mut self, _checkpoint: Option<&str>) -> DebugResult<()> {
        Err(DebugError::NotRecorded)
    }
    fn checkpoint(&mut self, _note: &str) -> DebugResult<i32> {
        Err(DebugError::NotRecorded)
    }
    fn checkpoints(&self) -> Vec<Checkpoint> {
        Vec::new()
    }
    fn clear_checkpoint(&mut self, _id: i32) -> DebugResult<()> {
        Err(DebugError::NotRecorded)
    }

    fn set_follow_exec(&mut self, enabled: bool);
    fn detach(&mut self, kill: bool) -> DebugResult<()>;
}

/// Read access to parsed debug info.
pub trait SymbolTable: Send {
    fn functions(&self) -> Vec<Function>;
    /// Line table of one function, sorted by address.
    fn line_table(&self, function: &Function) -> Vec<LineEntry>;
    fn sources(&self) -> Vec<String>;
    fn types(&self) -> Vec<String>;
    /// Names of the functions called directly by `function`.
    fn callees(&self, function: &str) -> Vec<String>;

    fn function_at(&self, pc: u64) -> Option<Function> {
        self.functions().into_iter().find(|f| f.contains(pc))
    }

    fn line_at(&self, pc: u64) -> Option<LineEntry> {
        let function = self.function_at(pc)?;
        self.line_table(&function)
            .into_iter()
            .take_while(|entry| entry.pc <= pc)
            .last()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub pc: u64,
    pub len: usize,
    pub text: String,
    pub dest: Option<u64>,
    pub is_call: bool,
    pub is_return: bool,
}

pub trait Disassembler: Send + Sync {
    /// Decode `mem`, which starts at address `start`.
    fn decode(&self, mem: &[u8], start: u64) -> Vec<Instruction>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub record: bool,
}

/// Starts processes and rebuilds programs.
pub trait Launcher: Send + Sync {
    fn launch(&self, opts: &LaunchOptions) -> DebugResult<Box<dyn ProcessControl>>;
    /// Rebuild the program; failures carry the build output verbatim.
    fn build(&self, opts: &LaunchOptions) -> DebugResult<()>;
    fn disassembler(&self) -> Arc<dyn Disassembler>;
}
