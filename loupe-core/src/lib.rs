// Debugger control core
//
// Resolves source locations to code addresses, manages logical breakpoints across
// processes, drives execution and answers inspection queries:
// - Location resolution with path substitution
// - Breakpoint lifecycle, conditions and hit counting
// - Continue, stepping, rewind and injected calls
// - Multi-process target registry with follow-exec
//
// Process control, debug info and disassembly are reached through the traits in
// `backend`; `sim` provides a deterministic in-process implementation.

pub mod backend;
pub mod breakpoint;
pub mod config;
pub mod debugger;
pub mod error;
pub mod location;
pub mod sim;
pub mod stream;
pub mod substitute;
pub mod target;
pub mod types;

pub use config::DebuggerConfig;
pub use debugger::{Debugger, RestartOptions, StepMode};
pub use error::{DebugError, DebugResult};
pub use location::LocationSpec;
pub use sim::SimLauncher;
pub use stream::ContinueStream;
pub use substitute::SubstituteRule;
