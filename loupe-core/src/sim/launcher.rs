// Launcher for simulated programs
//
// Programs are JSON documents read from disk, or registered in memory with
// `SimLauncher::set_source`. A build parses the current source; launches run the last
// successful build.

use super::disasm::SimDisassembler;
use super::image::Image;
use super::machine::Machine;
use super::process::SimProcess;
use super::program::SimProgram;
use crate::backend::{Disassembler, LaunchOptions, Launcher, ProcessControl};
use crate::error::{DebugError, DebugResult};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const FIRST_PID: u32 = 1000;

struct Built {
    program: SimProgram,
    image: Image,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sources and build results shared by every process of a launcher.
pub struct ProgramStore {
    sources: Mutex<BTreeMap<String, String>>,
    built: Mutex<BTreeMap<String, Arc<Built>>>,
    next_pid: AtomicU32,
    next_clock: AtomicI64,
}

impl ProgramStore {
    fn new() -> Self {
        Self {
            sources: Mutex::new(BTreeMap::new()),
            built: Mutex::new(BTreeMap::new()),
            next_pid: AtomicU32::new(FIRST_PID),
            next_clock: AtomicI64::new(1),
        }
    }

    fn source(&self, path: &str) -> DebugResult<String> {
        if let Some(source) = lock(&self.sources).get(path) {
            return Ok(source.clone());
        }
        std::fs::read_to_string(path).map_err(|e| DebugError::Build(format!("{}: {}", path, e)))
    }

    fn build(&self, path: &str) -> DebugResult<Arc<Built>> {
        let program = SimProgram::parse(path, &self.source(path)?)?;
        let image = Image::build(&program)?;
        let built = Arc::new(Built { program, image });
        lock(&self.built).insert(path.to_string(), built.clone());
        debug!("Built {}", path);
        Ok(built)
    }

    fn program(&self, path: &str) -> DebugResult<Arc<Built>> {
        if let Some(built) = lock(&self.built).get(path) {
            return Ok(built.clone());
        }
        self.build(path)
    }

    /// Start a new process running `path`.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        path: &str,
        args: &[String],
        record: bool,
    ) -> DebugResult<SimProcess> {
        let built = self.program(path)?;
        let clock = self.next_clock.fetch_add(1, Ordering::SeqCst);
        let machine = Machine::new(built.image.clone(), &built.program.entry, clock)?;
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);

        let mut cmdline = vec![path.to_string()];
        cmdline.extend(args.iter().cloned());
        info!("Started {} as process {} (record={})", path, pid, record);
        Ok(SimProcess::new(
            pid,
            cmdline.join(" "),
            self.clone(),
            machine,
            record,
        ))
    }
}

/// Launches simulated programs. Cheap to clone; clones share their programs.
#[derive(Clone)]
pub struct SimLauncher {
    store: Arc<ProgramStore>,
    disassembler: Arc<SimDisassembler>,
}

impl Default for SimLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl SimLauncher {
    pub fn new() -> Self {
        Self {
            store: Arc::new(ProgramStore::new()),
            disassembler: Arc::new(SimDisassembler::new()),
        }
    }

    /// Register the source of `path`, shadowing the file system. Takes effect on the
    /// next build.
    pub fn set_source(&self, path: impl Into<String>, source: impl Into<String>) {
        lock(&self.store.sources).insert(path.into(), source.into());
    }

    fn program_path(opts: &LaunchOptions) -> String {
        match &opts.working_dir {
            Some(dir) if Path::new(&opts.program).is_relative() => {
                Path::new(dir).join(&opts.program).to_string_lossy().into_owned()
            }
            _ => opts.program.clone(),
        }
    }
}

impl Launcher for SimLauncher {
    fn launch(&self, opts: &LaunchOptions) -> DebugResult<Box<dyn ProcessControl>> {
        let path = Self::program_path(opts);
        let process = self.store.spawn(&path, &opts.args, opts.record)?;
        Ok(Box::new(process))
    }

    fn build(&self, opts: &LaunchOptions) -> DebugResult<()> {
        self.store.build(&Self::program_path(opts)).map(|_| ())
    }

    fn disassembler(&self) -> Arc<dyn Disassembler> {
        self.disassembler.clone()
    }
}
