// Targets and the target registry
//
// A target is one attached process with its own debug info and installed traps. The
// registry holds every live target of a session (more than one with follow-exec).

use crate::backend::{Interrupt, ProcessControl, SymbolTable};
use crate::error::{DebugError, DebugResult};
use crate::location::{location_for_pc, LocationSpec, Resolver};
use crate::substitute::SubstituteRule;
use crate::types::{GoroutineId, Location, Pid, ThreadId};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Debug info of one target, guarded by the debug-info lock.
pub type SharedSymbols = Arc<Mutex<Box<dyn SymbolTable>>>;

pub fn lock_symbols(symbols: &SharedSymbols) -> MutexGuard<'_, Box<dyn SymbolTable>> {
    symbols.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    Stopped,
    Running,
    Exited(i32),
}

pub struct Target {
    pid: Pid,
    cmdline: String,
    process: Box<dyn ProcessControl>,
    symbols: SharedSymbols,
    interrupter: Arc<dyn Interrupt>,
    status: TargetStatus,
    installed: BTreeSet<u64>,
    pub(crate) current_thread: Option<ThreadId>,
    pub(crate) selected_goroutine: Option<GoroutineId>,
}

impl Target {
    pub fn new(process: Box<dyn ProcessControl>) -> DebugResult<Self> {
        let symbols = process.symbols()?;
        let interrupter = process.interrupter();
        let mut target = Self {
            pid: process.pid(),
            cmdline: process.cmdline(),
            process,
            symbols: Arc::new(Mutex::new(symbols)),
            interrupter,
            status: TargetStatus::Stopped,
            installed: BTreeSet::new(),
            current_thread: None,
            selected_goroutine: None,
        };
        target.select_default_thread();
        debug!("Target {} created: {}", target.pid, target.cmdline);
        Ok(target)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    pub fn status(&self) -> TargetStatus {
        self.status
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.status, TargetStatus::Exited(_))
    }

    pub fn exit_status(&self) -> Option<i32> {
        match self.status {
            TargetStatus::Exited(status) => Some(status),
            _ => None,
        }
    }

    pub(crate) fn set_status(&mut self, status: TargetStatus) {
        if let TargetStatus::Exited(code) = status {
            info!("Process {} exited with status {}", self.pid, code);
            self.installed.clear();
            self.current_thread = None;
            self.selected_goroutine = None;
        }
        self.status = status;
    }

    /// Fails with the uniform exited error once the process is gone.
    pub fn ensure_alive(&self) -> DebugResult<()> {
        match self.status {
            TargetStatus::Exited(status) => Err(DebugError::ProcessExited {
                pid: self.pid,
                status,
            }),
            _ => Ok(()),
        }
    }

    pub fn process(&self) -> &dyn ProcessControl {
        self.process.as_ref()
    }

    pub fn process_mut(&mut self) -> &mut dyn ProcessControl {
        self.process.as_mut()
    }

    pub fn interrupter(&self) -> Arc<dyn Interrupt> {
        self.interrupter.clone()
    }

    pub fn symbols(&self) -> SharedSymbols {
        self.symbols.clone()
    }

    pub fn with_symbols<R>(&self, f: impl FnOnce(&dyn SymbolTable) -> R) -> R {
        let guard = lock_symbols(&self.symbols);
        f(guard.as_ref())
    }

    /// Refresh debug info after the process loaded new code.
    pub fn reload_symbols(&mut self) -> DebugResult<()> {
        let fresh = self.process.symbols()?;
        *lock_symbols(&self.symbols) = fresh;
        Ok(())
    }

    pub fn location_for_pc(&self, pc: u64) -> Location {
        self.with_symbols(|symbols| location_for_pc(symbols, pc))
    }

    pub fn resolve(
        &self,
        spec: &LocationSpec,
        rules: &[SubstituteRule],
        case_insensitive: bool,
    ) -> DebugResult<Vec<Location>> {
        self.with_symbols(|symbols| {
            Resolver::new(symbols)
                .with_rules(rules, case_insensitive)
                .resolve(spec)
        })
    }

    pub fn resolve_one(
        &self,
        spec: &LocationSpec,
        rules: &[SubstituteRule],
        case_insensitive: bool,
    ) -> DebugResult<Location> {
        self.with_symbols(|symbols| {
            Resolver::new(symbols)
                .with_rules(rules, case_insensitive)
                .resolve_one(spec)
        })
    }

    pub fn installed(&self) -> &BTreeSet<u64> {
        &self.installed
    }

    pub fn install(&mut self, addr: u64) -> DebugResult<()> {
        self.ensure_alive()?;
        if self.installed.insert(addr) {
            if let Err(e) = self.process.install_breakpoint(addr) {
                self.installed.remove(&addr);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, addr: u64) -> DebugResult<()> {
        if !self.is_alive() {
            self.installed.remove(&addr);
            return Ok(());
        }
        if self.installed.contains(&addr) {
            self.process.remove_breakpoint(addr)?;
            self.installed.remove(&addr);
        }
        Ok(())
    }

    /// Pick the first thread carrying a goroutine, falling back to any thread.
    pub(crate) fn select_default_thread(&mut self) {
        let threads = self.process.threads();
        let chosen = threads
            .iter()
            .find(|t| t.goroutine_id.is_some())
            .or_else(|| threads.first());
        self.current_thread = chosen.map(|t| t.id);
        self.selected_goroutine = chosen.and_then(|t| t.goroutine_id);
    }

    pub fn detach(&mut self, kill: bool) -> DebugResult<()> {
        if !self.is_alive() {
            return Ok(());
        }
        if !kill {
            for addr in std::mem::take(&mut self.installed) {
                if let Err(e) = self.process.remove_breakpoint(addr) {
                    warn!("Failed to remove breakpoint at {:#x} before detach: {}", addr, e);
                }
            }
        }
        self.process.detach(kill)?;
        self.installed.clear();
        self.status = TargetStatus::Exited(0);
        info!("Detached from process {} (kill={})", self.pid, kill);
        Ok(())
    }
}

/// The set of targets attached in one debugging session.
#[derive(Default)]
pub struct TargetRegistry {
    targets: Vec<Target>,
    current: Option<Pid>,
    follow_exec: bool,
    follow_exec_regex: Option<Regex>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mut target: Target) {
        target.process_mut().set_follow_exec(self.follow_exec);
        info!("Target {} added ({})", target.pid(), target.cmdline());
        if self.current.is_none() {
            self.current = Some(target.pid());
        }
        self.targets.push(target);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Target> {
        let index = self.targets.iter().position(|t| t.pid() == pid)?;
        let target = self.targets.remove(index);
        if self.current == Some(pid) {
            self.current = self.targets.first().map(|t| t.pid());
        }
        info!("Target {} removed", pid);
        Some(target)
    }

    /// Remove every target, keeping follow-exec settings.
    pub fn take_all(&mut self) -> Vec<Target> {
        self.current = None;
        std::mem::take(&mut self.targets)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, pid: Pid) -> Option<&Target> {
        self.targets.iter().find(|t| t.pid() == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Target> {
        self.targets.iter_mut().find(|t| t.pid() == pid)
    }

    pub fn current(&self) -> DebugResult<&Target> {
        self.current
            .and_then(|pid| self.get(pid))
            .ok_or(DebugError::NoTarget)
    }

    pub fn current_mut(&mut self) -> DebugResult<&mut Target> {
        let pid = self.current.ok_or(DebugError::NoTarget)?;
        self.get_mut(pid).ok_or(DebugError::NoTarget)
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current
    }

    pub fn set_current(&mut self, pid: Pid) -> DebugResult<()> {
        if self.get(pid).is_none() {
            return Err(DebugError::InvalidArgument(format!("no target with pid {}", pid)));
        }
        self.current = Some(pid);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Target> {
        self.targets.iter_mut()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.targets.iter().map(|t| t.pid()).collect()
    }

    /// Live targets, most recently added first.
    pub fn live_pids_newest_first(&self) -> Vec<Pid> {
        self.targets
            .iter()
            .rev()
            .filter(|t| t.is_alive())
            .map(|t| t.pid())
            .collect()
    }

    pub fn set_follow_exec(&mut self, enabled: bool, regex: Option<&str>) -> DebugResult<()> {
        let compiled = match regex.filter(|r| !r.is_empty()) {
            Some(r) => Some(
                Regex::new(r).map_err(|e| DebugError::InvalidArgument(format!("follow-exec regex: {}", e)))?,
            ),
            None => None,
        };
        self.follow_exec = enabled;
        self.follow_exec_regex = compiled;
        for target in self.targets.iter_mut().filter(|t| t.is_alive()) {
            target.process_mut().set_follow_exec(enabled);
        }
        debug!("Follow-exec set to {}", enabled);
        Ok(())
    }

    pub fn follow_exec(&self) -> (bool, Option<String>) {
        (
            self.follow_exec,
            self.follow_exec_regex.as_ref().map(|r| r.as_str().to_string()),
        )
    }

    /// Whether a new child process with this command line becomes a target.
    pub fn accepts_child(&self, cmdline: &str) -> bool {
        self.follow_exec
            && self
                .follow_exec_regex
                .as_ref()
                .map_or(true, |re| re.is_match(cmdline))
    }
}
