// Simulated machine
//
// Goroutines are scheduled cooperatively on one OS thread. A machine value is the whole
// mutable state of a process, so cloning it is a snapshot.

use super::eval::{eval_operand, Value};
use super::image::{Image, Instr, FATAL_PANIC, FATAL_THROW, INSTR_LEN};
use super::program::{Expr, Op};
use crate::backend::{OsThread, RawAncestor, RawGoroutine};
use crate::error::{DebugError, DebugResult};
use crate::types::{GoroutineId, GoroutineStatus, ThreadId};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

pub const MAIN_GOROUTINE: GoroutineId = 1;
pub const MAIN_THREAD: ThreadId = 1;
pub const IDLE_THREAD: ThreadId = 2;

/// Upper bound on instructions executed by an injected call.
const CALL_STEP_LIMIT: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct Frame {
    pub function: String,
    pub pc: u64,
    pub locals: BTreeMap<String, Value>,
    pub params: Vec<String>,
    /// Local receiving the first value returned by the frame above.
    result: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GoroutineState {
    pub id: GoroutineId,
    /// Outermost frame first.
    pub frames: Vec<Frame>,
    pub start_pc: u64,
    pub go_pc: u64,
    pub labels: BTreeMap<String, String>,
    pub ancestors: Vec<RawAncestor>,
}

/// Side effect of one instruction the process has to report.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    None,
    Exited(i32),
    PluginLoaded(String),
    Spawn { program: String, args: Vec<String> },
}

#[derive(Debug)]
pub enum CallOutcome {
    Returned(Vec<Value>),
    Panicked(String),
}

#[derive(Debug, Clone)]
pub struct Machine {
    pub image: Arc<Image>,
    goroutines: BTreeMap<GoroutineId, GoroutineState>,
    run_queue: VecDeque<GoroutineId>,
    current: Option<GoroutineId>,
    next_goroutine: GoroutineId,
    clock: i64,
    exit: Option<i32>,
    last_return: Vec<Value>,
    panic_message: Option<String>,
}

impl Machine {
    pub fn new(image: Image, entry: &str, clock: i64) -> DebugResult<Self> {
        let mut machine = Self {
            image: Arc::new(image),
            goroutines: BTreeMap::new(),
            run_queue: VecDeque::new(),
            current: Some(MAIN_GOROUTINE),
            next_goroutine: MAIN_GOROUTINE + 1,
            clock,
            exit: None,
            last_return: Vec::new(),
            panic_message: None,
        };
        let frame = machine.new_frame(entry, Vec::new())?;
        machine.goroutines.insert(
            MAIN_GOROUTINE,
            GoroutineState {
                id: MAIN_GOROUTINE,
                start_pc: frame.pc,
                go_pc: 0,
                frames: vec![frame],
                labels: BTreeMap::new(),
                ancestors: Vec::new(),
            },
        );
        Ok(machine)
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit
    }

    pub fn current_goroutine(&self) -> Option<GoroutineId> {
        self.current
    }

    pub fn current_pc(&self) -> Option<u64> {
        let g = self.goroutines.get(&self.current?)?;
        g.frames.last().map(|f| f.pc)
    }

    pub fn last_return(&self) -> &[Value] {
        &self.last_return
    }

    pub fn goroutine(&self, id: GoroutineId) -> DebugResult<&GoroutineState> {
        self.goroutines
            .get(&id)
            .ok_or(DebugError::GoroutineNotFound(id))
    }

    /// Frame `index` of a goroutine, 0 being the innermost.
    pub fn frame(&self, id: GoroutineId, index: usize) -> DebugResult<&Frame> {
        let g = self.goroutine(id)?;
        g.frames
            .iter()
            .rev()
            .nth(index)
            .ok_or_else(|| DebugError::InvalidArgument(format!("frame {} does not exist", index)))
    }

    pub fn frame_mut(&mut self, id: GoroutineId, index: usize) -> DebugResult<&mut Frame> {
        let g = self
            .goroutines
            .get_mut(&id)
            .ok_or(DebugError::GoroutineNotFound(id))?;
        g.frames
            .iter_mut()
            .rev()
            .nth(index)
            .ok_or_else(|| DebugError::InvalidArgument(format!("frame {} does not exist", index)))
    }

    pub fn threads(&self) -> Vec<OsThread> {
        if self.exit.is_some() {
            return Vec::new();
        }
        vec![
            OsThread {
                id: MAIN_THREAD,
                pc: self.current_pc().unwrap_or(0),
                goroutine_id: self.current,
            },
            OsThread {
                id: IDLE_THREAD,
                pc: 0,
                goroutine_id: None,
            },
        ]
    }

    pub fn goroutines(&self) -> Vec<RawGoroutine> {
        if self.exit.is_some() {
            return Vec::new();
        }
        self.goroutines
            .values()
            .map(|g| {
                let running = self.current == Some(g.id);
                RawGoroutine {
                    id: g.id,
                    pc: g.frames.last().map(|f| f.pc).unwrap_or(0),
                    thread_id: running.then_some(MAIN_THREAD),
                    start_pc: g.start_pc,
                    go_pc: g.go_pc,
                    status: if running {
                        GoroutineStatus::Running
                    } else {
                        GoroutineStatus::Runnable
                    },
                    wait_reason: String::new(),
                    labels: g.labels.clone(),
                }
            })
            .collect()
    }

    fn new_frame(&self, function: &str, args: Vec<Value>) -> DebugResult<Frame> {
        let info = self
            .image
            .function(function)
            .ok_or_else(|| DebugError::Eval(format!("could not find function {}", function)))?;
        let locals = info.params.iter().cloned().zip(args).collect();
        Ok(Frame {
            function: info.function.name.clone(),
            pc: info.function.entry,
            locals,
            params: info.params.clone(),
            result: None,
        })
    }

    fn top(&mut self, id: GoroutineId) -> DebugResult<&mut Frame> {
        self.goroutines
            .get_mut(&id)
            .and_then(|g| g.frames.last_mut())
            .ok_or(DebugError::GoroutineNotFound(id))
    }

    fn advance(&mut self, id: GoroutineId) -> DebugResult<()> {
        self.top(id)?.pc += INSTR_LEN;
        Ok(())
    }

    fn push(&mut self, id: GoroutineId, frame: Frame) -> DebugResult<()> {
        self.goroutines
            .get_mut(&id)
            .ok_or(DebugError::GoroutineNotFound(id))?
            .frames
            .push(frame);
        Ok(())
    }

    fn reschedule(&mut self) {
        if let Some(current) = self.current.take() {
            self.run_queue.push_back(current);
        }
        self.current = self.run_queue.pop_front();
    }

    /// Execute one instruction of the running goroutine.
    pub fn step(&mut self) -> DebugResult<Effect> {
        if let Some(code) = self.exit {
            return Ok(Effect::Exited(code));
        }
        let id = self
            .current
            .ok_or_else(|| DebugError::Backend("no runnable goroutine".to_string()))?;
        let (pc, locals) = {
            let frame = self.top(id)?;
            (frame.pc, frame.locals.clone())
        };
        let instr = self
            .image
            .instr(pc)
            .cloned()
            .ok_or_else(|| DebugError::Backend(format!("no instruction at {:#x}", pc)))?;
        let clock = self.clock;
        let operand = |e: &Expr| eval_operand(e, &locals, clock);

        match instr {
            Instr::Prologue | Instr::Nop | Instr::PostCall => self.advance(id)?,
            Instr::Call { func, args, result } => {
                let values = args.iter().map(|e| operand(e)).collect::<DebugResult<Vec<_>>>()?;
                let frame = self.new_frame(&func, values)?;
                self.advance(id)?;
                self.top(id)?.result = result;
                self.push(id, frame)?;
            }
            Instr::Jump { dest } => self.top(id)?.pc = dest,
            Instr::JumpIfLess { var, limit, dest } => {
                let value = locals
                    .get(&var)
                    .cloned()
                    .ok_or_else(|| DebugError::Eval(format!("could not find symbol value for {}", var)))?;
                let taken = match (value, operand(&limit)?) {
                    (Value::Int(a), Value::Int(b)) => a < b,
                    _ => false,
                };
                if taken {
                    self.top(id)?.pc = dest;
                } else {
                    self.advance(id)?;
                }
            }
            Instr::Exec(op) => return self.exec(id, op, &operand),
        }
        Ok(Effect::None)
    }

    fn exec(
        &mut self,
        id: GoroutineId,
        op: Op,
        operand: &dyn Fn(&Expr) -> DebugResult<Value>,
    ) -> DebugResult<Effect> {
        match op {
            Op::Set { var, value } => {
                let value = operand(&value)?;
                let frame = self.top(id)?;
                frame.locals.insert(var, value);
                frame.pc += INSTR_LEN;
            }
            Op::Ret { values } => {
                let values = values.iter().map(operand).collect::<DebugResult<Vec<_>>>()?;
                return self.ret(id, values);
            }
            Op::Go { func, args, labels } => {
                let values = args.iter().map(operand).collect::<DebugResult<Vec<_>>>()?;
                let frame = self.new_frame(&func, values)?;
                let parent = self.goroutine(id)?;
                let mut ancestors = vec![RawAncestor {
                    id,
                    pcs: parent.frames.iter().rev().map(|f| f.pc).collect(),
                }];
                ancestors.extend(parent.ancestors.iter().cloned());
                let go_pc = parent.frames.last().map(|f| f.pc).unwrap_or(0);

                let child = self.next_goroutine;
                self.next_goroutine += 1;
                self.goroutines.insert(
                    child,
                    GoroutineState {
                        id: child,
                        start_pc: frame.pc,
                        go_pc,
                        frames: vec![frame],
                        labels,
                        ancestors,
                    },
                );
                self.run_queue.push_back(child);
                self.advance(id)?;
            }
            Op::Yield => {
                self.advance(id)?;
                self.reschedule();
            }
            Op::Panic { message } => self.raise(id, FATAL_PANIC, message)?,
            Op::Throw { message } => self.raise(id, FATAL_THROW, message)?,
            Op::Exit { code } => {
                self.exit = Some(code);
                return Ok(Effect::Exited(code));
            }
            Op::LoadPlugin { name } => {
                self.advance(id)?;
                if Arc::make_mut(&mut self.image).load_plugin(&name)? {
                    return Ok(Effect::PluginLoaded(name));
                }
            }
            Op::Spawn { program, args } => {
                self.advance(id)?;
                return Ok(Effect::Spawn { program, args });
            }
            Op::Nop | Op::Call { .. } | Op::Jump { .. } | Op::JumpIfLess { .. } => self.advance(id)?,
        }
        Ok(Effect::None)
    }
}

impl Machine {
    /// Enter a runtime handler that terminates the process.
    fn raise(&mut self, id: GoroutineId, handler: &str, message: String) -> DebugResult<()> {
        let mut frame = self.new_frame(handler, Vec::new())?;
        frame
            .locals
            .insert("msg".to_string(), Value::Str(message.clone()));
        self.panic_message = Some(message);
        self.push(id, frame)
    }

    fn ret(&mut self, id: GoroutineId, values: Vec<Value>) -> DebugResult<Effect> {
        let g = self
            .goroutines
            .get_mut(&id)
            .ok_or(DebugError::GoroutineNotFound(id))?;
        g.frames.pop();
        self.last_return = values;

        if let Some(caller) = g.frames.last_mut() {
            if let Some(var) = caller.result.take() {
                if let Some(value) = self.last_return.first() {
                    caller.locals.insert(var, value.clone());
                }
            }
            return Ok(Effect::None);
        }

        if id == MAIN_GOROUTINE {
            self.exit = Some(0);
            return Ok(Effect::Exited(0));
        }
        self.goroutines.remove(&id);
        self.current = self.run_queue.pop_front();
        Ok(Effect::None)
    }

    /// Run `function` to completion on goroutine `id` in a copy of the machine.
    /// The process itself is left as it was.
    pub fn call(&self, id: GoroutineId, function: &str, args: Vec<Value>) -> DebugResult<CallOutcome> {
        let mut m = self.clone();
        m.goroutine(id)?;
        if m.current != Some(id) {
            if let Some(current) = m.current.take() {
                m.run_queue.push_front(current);
            }
            m.run_queue.retain(|g| *g != id);
            m.current = Some(id);
        }
        let depth = m.goroutine(id)?.frames.len();
        let frame = m.new_frame(function, args)?;
        m.push(id, frame)?;

        for _ in 0..CALL_STEP_LIMIT {
            if let Ok(g) = m.goroutine(id) {
                if g.frames.len() == depth {
                    return Ok(CallOutcome::Returned(m.last_return));
                }
                let top = g.frames.last().map(|f| f.function.as_str());
                if top == Some(FATAL_PANIC) || top == Some(FATAL_THROW) {
                    return Ok(CallOutcome::Panicked(
                        m.panic_message.unwrap_or_default(),
                    ));
                }
            }
            if let Effect::Exited(code) = m.step()? {
                return Err(DebugError::Eval(format!(
                    "process exited with status {} during call",
                    code
                )));
            }
        }
        Err(DebugError::Eval(format!("call to {} did not return", function)))
    }

    pub fn panic_message(&self) -> Option<&str> {
        self.panic_message.as_deref()
    }
}
