// Code image of a simulated program
//
// Lays functions out as fixed-width instructions, builds their line tables and links
// calls and jumps. Plugins are linked into their own segment when loaded.

use super::program::{Expr, FunctionDef, LineDef, Op, SimProgram};
use crate::error::{DebugError, DebugResult};
use crate::types::{Function, LineEntry};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet};

pub const CODE_BASE: u64 = 0x40_1000;
pub const PLUGIN_BASE: u64 = 0x80_0000;
pub const PLUGIN_STRIDE: u64 = 0x10_0000;
pub const INSTR_LEN: u64 = 4;

pub const RUNTIME_FILE: &str = "/usr/local/go/src/runtime/panic.go";
pub const FATAL_PANIC: &str = "runtime.fatalpanic";
pub const FATAL_THROW: &str = "runtime.fatalthrow";

// Instruction layout (4 bytes):
// opcode (1 byte)
// operand (3 bytes, big-endian) - branch destinations are instruction indices from
//                                 CODE_BASE, NO_DEST when not linked yet
pub mod opcode {
    pub const NOP: u8 = 0x90;
    pub const PROLOGUE: u8 = 0x55;
    pub const CALL: u8 = 0xE8;
    pub const RET: u8 = 0xC3;
    pub const JMP: u8 = 0xE9;
    pub const JL: u8 = 0x7C;
    pub const STORE: u8 = 0x89;
    pub const EXIT: u8 = 0xF4;
    pub const SYSCALL: u8 = 0xCD;
    pub const PANIC: u8 = 0x0B;
    pub const POST_CALL: u8 = 0x8B;
}

pub const NO_DEST: u64 = 0xFF_FFFF;

pub mod syscall {
    pub const GO: u64 = 1;
    pub const YIELD: u64 = 2;
    pub const LOAD_PLUGIN: u64 = 3;
    pub const SPAWN: u64 = 4;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Prologue,
    Nop,
    /// Lands after a call returns, on the calling line.
    PostCall,
    Call {
        func: String,
        args: Vec<Expr>,
        result: Option<String>,
    },
    Jump {
        dest: u64,
    },
    JumpIfLess {
        var: String,
        limit: Expr,
        dest: u64,
    },
    Exec(Op),
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub function: Function,
    pub params: Vec<String>,
    pub lines: Vec<LineEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct Image {
    pub functions: Vec<FunctionInfo>,
    by_name: BTreeMap<String, usize>,
    instrs: BTreeMap<u64, Instr>,
    segments: BTreeMap<u64, Bytes>,
    callees: BTreeMap<String, BTreeSet<String>>,
    types: BTreeSet<String>,
    plugins: Vec<super::program::PluginDef>,
    loaded: Vec<String>,
}

fn runtime_functions() -> Vec<FunctionDef> {
    [(FATAL_PANIC, 1217), (FATAL_THROW, 1158)]
        .iter()
        .map(|(name, line)| FunctionDef {
            name: name.to_string(),
            file: RUNTIME_FILE.to_string(),
            line: *line,
            params: Vec::new(),
            instantiations: Vec::new(),
            body: vec![LineDef {
                line: line + 1,
                ops: vec![Op::Exit { code: 2 }],
            }],
        })
        .collect()
}

fn dest_operand(dest: Option<u64>) -> u64 {
    dest.map(|d| (d - CODE_BASE) / INSTR_LEN).unwrap_or(NO_DEST)
}

/// Destination pc of a branch operand.
pub fn operand_dest(operand: u64) -> Option<u64> {
    (operand != NO_DEST).then(|| CODE_BASE + operand * INSTR_LEN)
}

fn ends_function(op: &Op) -> bool {
    matches!(
        op,
        Op::Ret { .. } | Op::Exit { .. } | Op::Jump { .. } | Op::Panic { .. } | Op::Throw { .. }
    )
}

/// One function before branch destinations are known.
struct Draft {
    info: FunctionInfo,
    body: Vec<(u64, Instr)>,
    line_pcs: BTreeMap<u32, u64>,
    jumps: Vec<(usize, u32)>,
}

impl Image {
    pub fn build(program: &SimProgram) -> DebugResult<Self> {
        let mut image = Image {
            types: program.types.iter().cloned().collect(),
            plugins: program.plugins.clone(),
            ..Default::default()
        };
        let mut defs = program.functions.clone();
        defs.extend(runtime_functions());
        image.link(&defs, CODE_BASE)?;
        Ok(image)
    }

    /// Link a plugin's code; false when it was already loaded.
    pub fn load_plugin(&mut self, name: &str) -> DebugResult<bool> {
        if self.loaded.iter().any(|p| p == name) {
            return Ok(false);
        }
        let index = self
            .plugins
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| DebugError::Backend(format!("plugin {} not found", name)))?;
        let defs = self.plugins[index].functions.clone();
        let base = PLUGIN_BASE + index as u64 * PLUGIN_STRIDE;
        self.link(&defs, base)?;
        self.loaded.push(name.to_string());
        Ok(true)
    }

    fn link(&mut self, defs: &[FunctionDef], base: u64) -> DebugResult<()> {
        let mut drafts = Vec::new();
        let mut pc = base;
        for def in defs {
            let names: Vec<(String, Option<String>)> = if def.instantiations.is_empty() {
                vec![(def.name.clone(), None)]
            } else {
                def.instantiations
                    .iter()
                    .map(|t| (format!("{}[{}]", def.name, t), Some(def.name.clone())))
                    .collect()
            };
            for (name, instance_of) in names {
                let draft = layout(def, name, instance_of, pc);
                pc = draft.info.function.end;
                drafts.push(draft);
            }
        }

        for draft in &drafts {
            self.by_name
                .insert(draft.info.function.name.clone(), self.functions.len());
            self.functions.push(draft.info.clone());
        }

        let mut code = BytesMut::with_capacity((pc - base) as usize);
        for mut draft in drafts {
            for (index, line) in draft.jumps {
                let dest = *draft.line_pcs.get(&line).ok_or_else(|| {
                    DebugError::Build(format!(
                        "{}:{}: jump to line without code",
                        draft.info.function.file, line
                    ))
                })?;
                match &mut draft.body[index].1 {
                    Instr::Jump { dest: d } | Instr::JumpIfLess { dest: d, .. } => *d = dest,
                    _ => {}
                }
            }
            let caller = draft.info.function.name.clone();
            for (pc, instr) in draft.body {
                self.encode(&mut code, &instr);
                if let Instr::Call { func, .. } | Instr::Exec(Op::Go { func, .. }) = &instr {
                    self.callees
                        .entry(caller.clone())
                        .or_default()
                        .insert(func.clone());
                }
                self.instrs.insert(pc, instr);
            }
        }
        self.segments.insert(base, code.freeze());
        Ok(())
    }

    fn encode(&self, buf: &mut BytesMut, instr: &Instr) {
        let (op, operand) = match instr {
            Instr::Prologue => (opcode::PROLOGUE, 0),
            Instr::Nop => (opcode::NOP, 0),
            Instr::PostCall => (opcode::POST_CALL, 0),
            Instr::Call { func, .. } => (
                opcode::CALL,
                dest_operand(self.function(func).map(|f| f.function.entry)),
            ),
            Instr::Jump { dest } => (opcode::JMP, dest_operand(Some(*dest))),
            Instr::JumpIfLess { dest, .. } => (opcode::JL, dest_operand(Some(*dest))),
            Instr::Exec(op) => match op {
                Op::Nop => (opcode::NOP, 0),
                Op::Set { .. } => (opcode::STORE, 0),
                Op::Ret { .. } => (opcode::RET, 0),
                Op::Exit { code } => (opcode::EXIT, (*code as u64) & 0xFF_FFFF),
                Op::Panic { .. } => (opcode::PANIC, 0),
                Op::Throw { .. } => (opcode::PANIC, 1),
                Op::Go { .. } => (opcode::SYSCALL, syscall::GO),
                Op::Yield => (opcode::SYSCALL, syscall::YIELD),
                Op::LoadPlugin { .. } => (opcode::SYSCALL, syscall::LOAD_PLUGIN),
                Op::Spawn { .. } => (opcode::SYSCALL, syscall::SPAWN),
                Op::Call { .. } | Op::Jump { .. } | Op::JumpIfLess { .. } => (opcode::NOP, 0),
            },
        };
        buf.put_u8(op);
        buf.put_uint(operand, 3);
    }

    pub fn function(&self, name: &str) -> Option<&FunctionInfo> {
        self.by_name.get(name).map(|i| &self.functions[*i])
    }

    pub fn function_at(&self, pc: u64) -> Option<&FunctionInfo> {
        self.functions.iter().find(|f| f.function.contains(pc))
    }

    pub fn instr(&self, pc: u64) -> Option<&Instr> {
        self.instrs.get(&pc)
    }

    pub fn line_at(&self, pc: u64) -> Option<&LineEntry> {
        self.function_at(pc)?
            .lines
            .iter()
            .take_while(|e| e.pc <= pc)
            .last()
    }

    /// Code bytes; unmapped addresses read as zero.
    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| {
                let a = addr + i;
                self.segments
                    .range(..=a)
                    .next_back()
                    .and_then(|(base, code)| code.get((a - base) as usize).copied())
                    .unwrap_or(0)
            })
            .collect()
    }

    pub fn sources(&self) -> Vec<String> {
        let files: BTreeSet<String> = self
            .functions
            .iter()
            .flat_map(|f| f.lines.iter().map(|e| e.file.clone()))
            .collect();
        files.into_iter().collect()
    }

    pub fn types(&self) -> Vec<String> {
        self.types.iter().cloned().collect()
    }

    pub fn callees(&self, function: &str) -> Vec<String> {
        self.callees
            .get(function)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn layout(def: &FunctionDef, name: String, instance_of: Option<String>, entry: u64) -> Draft {
    let mut body: Vec<(u64, Instr)> = Vec::new();
    let mut lines = Vec::new();
    let mut line_pcs = BTreeMap::new();
    let mut jumps = Vec::new();
    let mut pc = entry;

    let mut emit = |instr: Instr, line: u32, is_stmt: bool, body: &mut Vec<(u64, Instr)>| {
        lines.push(LineEntry {
            pc,
            file: def.file.clone(),
            line,
            is_stmt,
        });
        body.push((pc, instr));
        pc += INSTR_LEN;
        pc - INSTR_LEN
    };

    emit(Instr::Prologue, def.line, false, &mut body);
    let decl = emit(Instr::Nop, def.line, true, &mut body);
    line_pcs.insert(def.line, decl);

    let mut terminated = false;
    for line in &def.body {
        if line.ops.is_empty() {
            let at = emit(Instr::Nop, line.line, true, &mut body);
            line_pcs.entry(line.line).or_insert(at);
            terminated = false;
            continue;
        }
        for (i, op) in line.ops.iter().enumerate() {
            let stmt = i == 0;
            let at = match op {
                Op::Call { func, args, result } => {
                    let at = emit(
                        Instr::Call {
                            func: func.clone(),
                            args: args.clone(),
                            result: result.clone(),
                        },
                        line.line,
                        stmt,
                        &mut body,
                    );
                    emit(Instr::PostCall, line.line, false, &mut body);
                    at
                }
                Op::Jump { line: target } => {
                    jumps.push((body.len(), *target));
                    emit(Instr::Jump { dest: 0 }, line.line, stmt, &mut body)
                }
                Op::JumpIfLess {
                    var,
                    limit,
                    line: target,
                } => {
                    jumps.push((body.len(), *target));
                    emit(
                        Instr::JumpIfLess {
                            var: var.clone(),
                            limit: limit.clone(),
                            dest: 0,
                        },
                        line.line,
                        stmt,
                        &mut body,
                    )
                }
                other => emit(Instr::Exec(other.clone()), line.line, stmt, &mut body),
            };
            if stmt {
                line_pcs.entry(line.line).or_insert(at);
            }
            terminated = ends_function(op);
        }
    }
    if !terminated {
        let last = def.body.last().map(|l| l.line).unwrap_or(def.line) + 1;
        emit(Instr::Exec(Op::Ret { values: Vec::new() }), last, true, &mut body);
    }

    Draft {
        info: FunctionInfo {
            function: Function {
                name,
                entry,
                end: pc,
                file: def.file.clone(),
                line: def.line,
                instance_of,
            },
            params: def.params.clone(),
            lines,
        },
        body,
        line_pcs,
        jumps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(src: &str) -> SimProgram {
        SimProgram::parse("prog.json", src).unwrap()
    }

    const LOOP: &str = r#"{
        "functions": [
            {"name": "main.main", "file": "/src/main.go", "line": 5, "body": [
                {"line": 6, "ops": [{"op": "set", "var": "i", "value": {"int": 0}}]},
                {"line": 7, "ops": [{"op": "call", "func": "main.f", "args": [{"var": "i"}]}]},
                {"line": 8, "ops": [{"op": "set", "var": "i", "value": {"add": ["i", 1]}},
                                    {"op": "jump_if_less", "var": "i", "limit": {"int": 3}, "line": 7}]}
            ]},
            {"name": "main.f", "file": "/src/main.go", "line": 12, "params": ["x"]}
        ]
    }"#;

    #[test]
    fn test_layout_and_line_table() {
        let image = Image::build(&program(LOOP)).unwrap();
        let main = image.function("main.main").unwrap();
        assert_eq!(main.function.entry, CODE_BASE);
        assert_eq!(main.lines[0].is_stmt, false);
        assert_eq!(main.lines[1], LineEntry {
            pc: CODE_BASE + 4,
            file: "/src/main.go".to_string(),
            line: 5,
            is_stmt: true,
        });
        assert_eq!(image.instr(CODE_BASE + 16), Some(&Instr::PostCall));
        assert_eq!(image.line_at(CODE_BASE + 16).unwrap().line, 7);
        // implicit return on the line after the body
        let f = image.function("main.f").unwrap();
        assert_eq!(f.lines.last().unwrap().line, 13);
    }

    #[test]
    fn test_jumps_are_linked() {
        let image = Image::build(&program(LOOP)).unwrap();
        let jl = CODE_BASE + 24;
        match image.instr(jl) {
            Some(Instr::JumpIfLess { dest, .. }) => assert_eq!(*dest, CODE_BASE + 12),
            other => panic!("unexpected {:?}", other),
        }
        let bytes = image.read(jl, 4);
        assert_eq!(bytes[0], opcode::JL);
        assert_eq!(operand_dest(u64::from(bytes[3])), Some(CODE_BASE + 12));
    }

    #[test]
    fn test_runtime_functions_present() {
        let image = Image::build(&program(LOOP)).unwrap();
        assert!(image.function(FATAL_PANIC).is_some());
        assert!(image.function(FATAL_THROW).is_some());
        assert_eq!(image.callees("main.main"), vec!["main.f".to_string()]);
    }

    #[test]
    fn test_plugins_link_into_their_own_segment() {
        let src = r#"{
            "functions": [{"name": "main.main", "file": "/src/main.go", "line": 1}],
            "plugins": [{"name": "plugin.so", "functions": [
                {"name": "plugin.Hello", "file": "/src/plugin/p.go", "line": 3}
            ]}]
        }"#;
        let mut image = Image::build(&program(src)).unwrap();
        assert!(image.function("plugin.Hello").is_none());
        assert!(image.load_plugin("plugin.so").unwrap());
        assert!(!image.load_plugin("plugin.so").unwrap());
        assert_eq!(image.function("plugin.Hello").unwrap().function.entry, PLUGIN_BASE);
        assert!(image.sources().contains(&"/src/plugin/p.go".to_string()));
    }
}
