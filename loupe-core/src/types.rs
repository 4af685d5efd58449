// Debugger API types
//
// Serializable snapshots exchanged with clients. Values are never mutated after construction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Pid = u32;
pub type ThreadId = i64;
pub type GoroutineId = i64;
pub type BreakpointId = i32;

/// A function known to the symbol table.
///
/// Instantiations of a generic function (and inlined copies) carry the shared
/// identity in `instance_of`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Function {
    pub name: String,
    pub entry: u64,
    pub end: u64,
    pub file: String,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_of: Option<String>,
}

impl Function {
    pub fn identity(&self) -> &str {
        self.instance_of.as_deref().unwrap_or(&self.name)
    }

    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.entry && pc < self.end
    }
}

/// One entry of a line table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEntry {
    pub pc: u64,
    pub file: String,
    pub line: u32,
    pub is_stmt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub pc: u64,
    pub file: String,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    pub pcs: Vec<u64>,
    pub pc_pids: Vec<Pid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub follow_pointers: bool,
    pub max_variable_recurse: i32,
    pub max_string_len: i32,
    pub max_array_values: i32,
    pub max_struct_fields: i32,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            follow_pointers: true,
            max_variable_recurse: 1,
            max_string_len: 64,
            max_array_values: 64,
            max_struct_fields: -1,
        }
    }
}

/// Evaluation scope; a goroutine id of -1 selects the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalScope {
    pub goroutine_id: GoroutineId,
    pub frame: i32,
}

impl Default for EvalScope {
    fn default() -> Self {
        Self {
            goroutine_id: -1,
            frame: 0,
        }
    }
}

impl EvalScope {
    pub fn new(goroutine_id: GoroutineId, frame: i32) -> Self {
        Self {
            goroutine_id,
            frame,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    #[default]
    Invalid,
    Bool,
    Int,
    String,
    Func,
    Ptr,
    Struct,
    Interface,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Variable {
    pub name: String,
    pub addr: u64,
    pub type_name: String,
    pub kind: VariableKind,
    pub value: String,
    pub len: i64,
    pub children: Vec<Variable>,
    /// Set when the value could not be read; the rest of the command still succeeds.
    pub unreadable: String,
}

impl Variable {
    pub fn unreadable(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            unreadable: reason.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub name: String,
    pub addr: u64,
    pub addrs: Vec<u64>,
    pub addr_pid: Vec<Pid>,
    pub file: String,
    /// Absolute line; on requests with `function_name` it is an offset from the declaration.
    pub line: i32,
    pub function_name: String,
    pub expr: String,
    pub cond: String,
    pub hit_cond: String,
    pub hit_cond_per_g: bool,
    pub tracepoint: bool,
    pub trace_return: bool,
    pub goroutine: bool,
    pub stacktrace: i32,
    pub variables: Vec<String>,
    pub load_args: Option<LoadConfig>,
    pub load_locals: Option<LoadConfig>,
    pub disabled: bool,
    pub suspended: bool,
    pub total_hit_count: u64,
    pub hit_count: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakpointInfo {
    pub stacktrace: Vec<StackFrame>,
    pub goroutine: Option<Goroutine>,
    pub variables: Vec<Variable>,
    pub arguments: Vec<Variable>,
    pub locals: Vec<Variable>,
    pub condition_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thread {
    pub id: ThreadId,
    pub pid: Pid,
    pub pc: u64,
    pub file: String,
    pub line: u32,
    pub function: Option<String>,
    /// Zero when no goroutine is running on the thread.
    pub goroutine_id: GoroutineId,
    pub breakpoint: Option<Breakpoint>,
    pub breakpoint_info: Option<BreakpointInfo>,
    pub return_values: Vec<Variable>,
    pub call_return: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoroutineStatus {
    #[default]
    Idle,
    Runnable,
    Running,
    Waiting,
    Dead,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Goroutine {
    pub id: GoroutineId,
    pub pid: Pid,
    pub current_loc: Location,
    pub user_current_loc: Location,
    pub go_statement_loc: Location,
    pub start_loc: Location,
    pub thread_id: ThreadId,
    pub status: GoroutineStatus,
    pub wait_reason: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerState {
    pub pid: Pid,
    pub target_command_line: String,
    pub running: bool,
    /// New execution is being captured for replay.
    pub recording: bool,
    pub current_thread: Option<Thread>,
    pub selected_goroutine: Option<Goroutine>,
    pub threads: Vec<Thread>,
    pub exited: bool,
    pub exit_status: i32,
    pub when: String,
    pub err: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackFrame {
    #[serde(flatten)]
    pub location: Location,
    pub frame_offset: i64,
    pub locals: Vec<Variable>,
    pub arguments: Vec<Variable>,
    pub err: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ancestor {
    pub id: GoroutineId,
    pub stack: Vec<StackFrame>,
    pub unreadable: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsmInstruction {
    pub loc: Location,
    pub dest_loc: Option<Location>,
    pub text: String,
    pub bytes: Vec<u8>,
    pub breakpoint: bool,
    pub at_pc: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetInfo {
    pub pid: Pid,
    pub cmd_line: String,
    pub current_thread: Option<Thread>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Checkpoint {
    pub id: i32,
    pub when: String,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoroutineField {
    CurrentLoc,
    UserLoc,
    GoLoc,
    StartLoc,
    Label,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoroutineFilter {
    pub kind: GoroutineField,
    #[serde(default)]
    pub negated: bool,
    #[serde(default)]
    pub arg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoroutineGroupBy {
    pub kind: Option<GoroutineField>,
    /// Label key, when grouping by label.
    pub label: String,
    pub max_group_members: usize,
    pub max_groups: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoroutineGroup {
    pub name: String,
    pub offset: usize,
    pub count: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoroutinePage {
    pub goroutines: Vec<Goroutine>,
    pub groups: Vec<GoroutineGroup>,
    /// Start index of the next page, or -1 when exhausted.
    pub next: i64,
    pub too_many_groups: bool,
}
