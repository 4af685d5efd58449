// Simulated program descriptions
//
// A program is a JSON document listing functions, each with a source file, a declaration
// line and the operations executed on every body line.

use crate::error::{DebugError, DebugResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_ENTRY: &str = "main.main";

fn default_entry() -> String {
    DEFAULT_ENTRY.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimProgram {
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_entry")]
    pub entry: String,
    pub functions: Vec<FunctionDef>,
    #[serde(default)]
    pub plugins: Vec<PluginDef>,
    #[serde(default)]
    pub types: Vec<String>,
}

/// Code loaded at run time by a `load_plugin` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDef {
    pub name: String,
    pub functions: Vec<FunctionDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub file: String,
    /// Declaration line.
    pub line: u32,
    #[serde(default)]
    pub params: Vec<String>,
    /// Type arguments; each one produces a copy named `name[T]`.
    #[serde(default)]
    pub instantiations: Vec<String>,
    #[serde(default)]
    pub body: Vec<LineDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineDef {
    pub line: u32,
    #[serde(default)]
    pub ops: Vec<Op>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Nop,
    Set {
        var: String,
        value: Expr,
    },
    Call {
        func: String,
        #[serde(default)]
        args: Vec<Expr>,
        /// Local receiving the first return value.
        #[serde(default)]
        result: Option<String>,
    },
    Ret {
        #[serde(default)]
        values: Vec<Expr>,
    },
    Jump {
        line: u32,
    },
    JumpIfLess {
        var: String,
        limit: Expr,
        line: u32,
    },
    Go {
        func: String,
        #[serde(default)]
        args: Vec<Expr>,
        #[serde(default)]
        labels: BTreeMap<String, String>,
    },
    Yield,
    Panic {
        message: String,
    },
    Throw {
        message: String,
    },
    Exit {
        code: i32,
    },
    LoadPlugin {
        name: String,
    },
    Spawn {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Int(i64),
    Str(String),
    Var(String),
    /// Local plus a constant.
    Add(String, i64),
    /// The process clock, fixed for the lifetime of a recording.
    Clock,
}

impl SimProgram {
    /// Parse a program description. Errors read like compiler output.
    pub fn parse(path: &str, source: &str) -> DebugResult<Self> {
        let mut program: SimProgram = serde_json::from_str(source).map_err(|e| {
            DebugError::Build(format!("{}:{}:{}: {}", path, e.line(), e.column(), e))
        })?;
        if program.path.is_empty() {
            program.path = path.to_string();
        }
        program.validate()?;
        Ok(program)
    }

    /// Every call target must exist in the program or one of its plugins.
    pub fn validate(&self) -> DebugResult<()> {
        let mut known: BTreeSet<String> = BTreeSet::new();
        let all = self
            .functions
            .iter()
            .chain(self.plugins.iter().flat_map(|p| p.functions.iter()));
        for f in all.clone() {
            known.insert(f.name.clone());
            for inst in &f.instantiations {
                known.insert(format!("{}[{}]", f.name, inst));
            }
        }
        if !known.contains(&self.entry) {
            return Err(DebugError::Build(format!(
                "{}: function {} is undeclared in the main package",
                self.path, self.entry
            )));
        }
        for f in all {
            for line in &f.body {
                for op in &line.ops {
                    let target = match op {
                        Op::Call { func, .. } | Op::Go { func, .. } => func,
                        _ => continue,
                    };
                    if !known.contains(target) {
                        return Err(DebugError::Build(format!(
                            "{}:{}: undefined: {}",
                            f.file, line.line, target
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
