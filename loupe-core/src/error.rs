// Engine error taxonomy
//
// Every engine-level failure is recoverable; the engine stays consistent for the next command.

use thiserror::Error;

pub type DebugResult<T> = Result<T, DebugError>;

#[derive(Debug, Error)]
pub enum DebugError {
    #[error("location \"{0}\" not found")]
    LocationNotFound(String),

    #[error("location \"{spec}\" ambiguous: {}", candidates.join(", "))]
    AmbiguousLocation { spec: String, candidates: Vec<String> },

    #[error("no current location")]
    NoCurrentLocation,

    #[error("invalid location \"{0}\"")]
    InvalidLocation(String),

    #[error("breakpoint already exists at {location} (id {id})")]
    BreakpointExists { id: i32, location: String },

    #[error("no breakpoint with id {0}")]
    BreakpointNotFound(i32),

    #[error("no breakpoint with name {0}")]
    BreakpointNameNotFound(String),

    #[error("breakpoint name \"{0}\" already exists")]
    DuplicateBreakpointName(String),

    #[error("breakpoint name \"{0}\" is not valid")]
    InvalidBreakpointName(String),

    #[error("invalid hit condition \"{0}\"")]
    InvalidHitCondition(String),

    #[error("unknown thread {0}")]
    ThreadNotFound(i64),

    #[error("unknown goroutine {0}")]
    GoroutineNotFound(i64),

    #[error("Process {pid} has exited with status {status}")]
    ProcessExited { pid: u32, status: i32 },

    #[error("target is running")]
    TargetRunning,

    #[error("no target attached")]
    NoTarget,

    #[error("{0}")]
    Build(String),

    #[error("{0}")]
    Eval(String),

    #[error("recording not available")]
    NotRecorded,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DebugError {
    /// True for the uniform "process has exited" condition.
    pub fn is_exited(&self) -> bool {
        matches!(self, DebugError::ProcessExited { .. })
    }
}
