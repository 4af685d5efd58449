// Simulated backend
//
// A deterministic in-process implementation of the collaborator interfaces. Programs are
// described in JSON and executed by a small machine with cooperative goroutines, plugins,
// child processes and optional recording.

mod disasm;
mod eval;
mod history;
mod image;
mod launcher;
mod machine;
mod process;
mod program;
mod symbols;

pub use disasm::SimDisassembler;
pub use launcher::SimLauncher;
pub use process::{SimInterrupt, SimProcess};
pub use program::{Expr, FunctionDef, LineDef, Op, PluginDef, SimProgram};
pub use symbols::SimSymbols;
