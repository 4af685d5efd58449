// Execution controller
//
// `Debugger` is the single entry point for every command. Commands lock the engine; a
// continue hands the lock to a worker thread and reports through a `ContinueStream`.

mod control;
mod engine;
mod inspect;

use crate::backend::{Disassembler, LaunchOptions, Launcher};
use crate::breakpoint::Origin;
use crate::config::DebuggerConfig;
use crate::error::{DebugError, DebugResult};
use crate::location::{LocationSpec, Resolver};
use crate::stream::RunControl;
use crate::substitute::SubstituteRule;
use crate::target::{Target, TargetRegistry};
use crate::types::{Breakpoint, BreakpointId, Checkpoint, DebuggerState, Location, Pid};
use engine::{Engine, StopInfo};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

pub use control::StepMode;

/// Options of a restart request.
#[derive(Debug, Clone, Default)]
pub struct RestartOptions {
    /// Checkpoint or event position to restart a recording from.
    pub position: Option<String>,
    /// Replace the program arguments with `new_args`.
    pub reset_args: bool,
    pub new_args: Vec<String>,
    /// Record a new execution instead of replaying the existing one.
    pub rerecord: bool,
    pub rebuild: bool,
}

#[derive(Clone)]
pub struct Debugger {
    engine: Arc<Mutex<Engine>>,
    run: Arc<RunControl>,
    launcher: Arc<dyn Launcher>,
}

fn lock(engine: &Mutex<Engine>) -> MutexGuard<'_, Engine> {
    engine.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Debugger {
    /// Launch `program` and stop it before it runs any user code.
    pub fn launch(
        launcher: Arc<dyn Launcher>,
        program: impl Into<String>,
        args: Vec<String>,
        config: DebuggerConfig,
    ) -> DebugResult<Self> {
        let opts = LaunchOptions {
            program: program.into(),
            args,
            working_dir: config.working_dir.clone(),
            record: config.record,
        };
        info!("Launching {} {:?}", opts.program, opts.args);
        let process = launcher.launch(&opts)?;
        let target = Target::new(process)?;

        let mut targets = TargetRegistry::new();
        targets.set_follow_exec(config.follow_exec, config.follow_exec_regex.as_deref())?;

        let disassembler: Arc<dyn Disassembler> = launcher.disassembler();
        let mut engine = Engine::new(targets, config, opts, disassembler);
        engine.adopt(target);

        let run = Arc::new(RunControl::new());
        run.publish_symbols(engine.symbol_handles());
        if let Ok(state) = engine.state() {
            run.publish_state(&state);
        }
        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
            run,
            launcher,
        })
    }

    /// Lock the engine for a command that needs the target stopped.
    fn command(&self) -> DebugResult<MutexGuard<'_, Engine>> {
        if self.run.is_running() {
            return Err(DebugError::TargetRunning);
        }
        Ok(lock(&self.engine))
    }

    pub fn is_running(&self) -> bool {
        self.run.is_running()
    }

    /// Current state; while running, the last published state marked running.
    pub fn get_state(&self) -> DebugResult<DebuggerState> {
        if self.run.is_running() {
            let mut state = self.run.last_state().unwrap_or_default();
            state.running = true;
            return Ok(state);
        }
        let engine = lock(&self.engine);
        engine.state()
    }

    /// Stop a running continue; returns the resulting stop (or exit) state.
    pub fn halt(&self) -> DebugResult<DebuggerState> {
        if self.run.is_running() {
            self.run.request_halt();
            self.run.wait_idle();
        }
        let engine = lock(&self.engine);
        engine.state()
    }

    /// Detach from every target, killing them when `kill` is set.
    pub fn detach(&self, kill: bool) -> DebugResult<()> {
        if self.run.is_running() {
            self.run.request_halt();
            self.run.wait_idle();
        }
        let mut engine = lock(&self.engine);
        for target in engine.targets.iter_mut() {
            if let Err(e) = target.detach(kill) {
                error!("Detach from {} failed: {}", target.pid(), e);
            }
        }
        engine.detached = true;
        info!("Debugger detached (kill={})", kill);
        Ok(())
    }

    /// Restart the session. Breakpoints keep their identities and are re-resolved;
    /// the ones that no longer resolve are returned, now suspended.
    pub fn restart(&self, opts: RestartOptions) -> DebugResult<Vec<Breakpoint>> {
        let mut guard = self.command()?;
        let engine = &mut *guard;
        if engine.detached {
            return Err(DebugError::NoTarget);
        }

        let recorded = engine
            .targets
            .current()
            .map(|t| t.process().recorded())
            .unwrap_or(false);
        if opts.position.is_some() && !recorded {
            return Err(DebugError::NotRecorded);
        }

        if opts.rebuild {
            info!("Rebuilding {}", engine.launch.program);
            self.launcher.build(&engine.launch)?;
        }

        let replay_in_place = recorded && !opts.rerecord && !opts.rebuild && !opts.reset_args;
        let alive = engine.targets.current().map(|t| t.is_alive()).unwrap_or(false);
        if replay_in_place && alive {
            let target = engine.targets.current_mut()?;
            target.process_mut().restart_recording(opts.position.as_deref())?;
            target.select_default_thread();
            let pid = target.pid();
            engine.breakpoints.reset_for_restart(Some(pid), pid);
            engine.breakpoints.sync_target(&mut engine.targets, pid);
        } else {
            let mut launch = engine.launch.clone();
            if opts.reset_args {
                launch.args = opts.new_args.clone();
            }
            launch.record = launch.record || opts.rerecord;
            let process = self.launcher.launch(&launch)?;
            let target = Target::new(process)?;
            let new_pid = target.pid();

            let old_pid = engine.targets.current_pid();
            for mut old in engine.targets.take_all() {
                if let Err(e) = old.detach(true) {
                    warn!("Killing previous process {} failed: {}", old.pid(), e);
                }
            }
            engine.launch = launch;
            engine.breakpoints.reset_for_restart(old_pid, new_pid);
            engine.adopt(target);
        }
        engine.stop = StopInfo::default();

        self.run.publish_symbols(engine.symbol_handles());
        if let Ok(state) = engine.state() {
            self.run.publish_state(&state);
        }
        let discarded: Vec<Breakpoint> = engine
            .breakpoints
            .list(false)
            .into_iter()
            .filter(|bp| bp.suspended && !bp.disabled)
            .collect();
        info!("Restarted, {} breakpoints could not be restored", discarded.len());
        Ok(discarded)
    }

    /// Create a breakpoint from `expr`, or from the location fields of `req`.
    pub fn create_breakpoint(
        &self,
        req: &Breakpoint,
        expr: &str,
        rules: Option<Vec<SubstituteRule>>,
        suspended: bool,
    ) -> DebugResult<Breakpoint> {
        let mut guard = self.command()?;
        let engine = &mut *guard;
        let origin = engine.breakpoint_origin(req, expr, rules, suspended)?;

        if engine.exited_status().is_some() && !suspended {
            engine.ensure_alive()?;
        }
        engine
            .breakpoints
            .create(&mut engine.targets, req, origin, suspended)
    }

    pub fn amend_breakpoint(&self, req: &Breakpoint) -> DebugResult<Breakpoint> {
        let mut guard = self.command()?;
        let engine = &mut *guard;
        engine.breakpoints.amend(&mut engine.targets, req)
    }

    pub fn toggle_breakpoint(&self, id: BreakpointId) -> DebugResult<Breakpoint> {
        let mut guard = self.command()?;
        let engine = &mut *guard;
        engine.breakpoints.toggle(&mut engine.targets, id)
    }

    pub fn clear_breakpoint(&self, id: BreakpointId) -> DebugResult<Breakpoint> {
        let mut guard = self.command()?;
        let engine = &mut *guard;
        engine.breakpoints.clear(&mut engine.targets, id)
    }

    pub fn clear_breakpoint_by_name(&self, name: &str) -> DebugResult<Breakpoint> {
        let mut guard = self.command()?;
        let engine = &mut *guard;
        engine.breakpoints.clear_by_name(&mut engine.targets, name)
    }

    pub fn get_breakpoint(&self, id: BreakpointId) -> DebugResult<Breakpoint> {
        self.command()?.breakpoints.get(id)
    }

    pub fn get_breakpoint_by_name(&self, name: &str) -> DebugResult<Breakpoint> {
        self.command()?.breakpoints.get_by_name(name)
    }

    pub fn list_breakpoints(&self, include_internal: bool) -> DebugResult<Vec<Breakpoint>> {
        Ok(self.command()?.breakpoints.list(include_internal))
    }

    pub fn checkpoint(&self, note: &str) -> DebugResult<i32> {
        let mut engine = self.command()?;
        engine.ensure_alive()?;
        let target = engine.targets.current_mut()?;
        if !target.process().recorded() {
            return Err(DebugError::NotRecorded);
        }
        target.process_mut().checkpoint(note)
    }

    pub fn list_checkpoints(&self) -> DebugResult<Vec<Checkpoint>> {
        let engine = self.command()?;
        let target = engine.targets.current()?;
        if !target.process().recorded() {
            return Err(DebugError::NotRecorded);
        }
        Ok(target.process().checkpoints())
    }

    pub fn clear_checkpoint(&self, id: i32) -> DebugResult<()> {
        let mut engine = self.command()?;
        let target = engine.targets.current_mut()?;
        if !target.process().recorded() {
            return Err(DebugError::NotRecorded);
        }
        target.process_mut().clear_checkpoint(id)
    }

    /// Stop capturing the current target. Rewind and restart still work on what was
    /// recorded so far.
    pub fn stop_recording(&self) -> DebugResult<()> {
        let mut engine = self.command()?;
        engine.ensure_alive()?;
        let target = engine.targets.current_mut()?;
        target.process_mut().stop_recording()
    }

    /// Pid of the current target; answers while a continue is in flight.
    pub fn process_pid(&self) -> DebugResult<Pid> {
        if self.run.is_running() {
            return self
                .run
                .last_state()
                .map(|state| state.pid)
                .ok_or(DebugError::TargetRunning);
        }
        let engine = lock(&self.engine);
        if engine.detached {
            return Err(DebugError::NoTarget);
        }
        engine.targets.current_pid().ok_or(DebugError::NoTarget)
    }

    /// Enable or disable following child processes.
    pub fn follow_exec(&self, enabled: bool, regex: Option<&str>) -> DebugResult<()> {
        let mut engine = self.command()?;
        engine.targets.set_follow_exec(enabled, regex)?;
        engine.config.follow_exec = enabled;
        engine.config.follow_exec_regex = regex.map(str::to_string);
        Ok(())
    }

    pub fn follow_exec_enabled(&self) -> DebugResult<(bool, Option<String>)> {
        Ok(self.command()?.targets.follow_exec())
    }
}

impl Engine {
    /// Build the origin of a new breakpoint. Relative specs are pinned to an absolute
    /// location now; if that fails they stay as given so suspension can apply.
    fn breakpoint_origin(
        &self,
        req: &Breakpoint,
        expr: &str,
        rules: Option<Vec<SubstituteRule>>,
        suspended: bool,
    ) -> DebugResult<Origin> {
        let rules = rules.unwrap_or_default();
        let current_pid = self.targets.current_pid().unwrap_or_default();

        let spec = if !expr.trim().is_empty() {
            LocationSpec::parse(expr)?
        } else if req.addr != 0 || !req.addrs.is_empty() {
            let mut addrs = req.addrs.clone();
            if req.addr != 0 && !addrs.contains(&req.addr) {
                addrs.insert(0, req.addr);
            }
            return Ok(Origin::Address {
                pid: req.addr_pid.first().copied().unwrap_or(current_pid),
                addrs,
            });
        } else if !req.function_name.is_empty() {
            LocationSpec::Function {
                name: req.function_name.clone(),
                line_offset: (req.line > 0).then_some(req.line),
            }
        } else if !req.file.is_empty() && req.line > 0 {
            LocationSpec::FileLine {
                path: req.file.clone(),
                line: req.line as u32,
            }
        } else {
            return Err(DebugError::InvalidArgument(
                "breakpoint needs a location expression, address, function or file:line".to_string(),
            ));
        };

        if let LocationSpec::Address(addr) = spec {
            return Ok(Origin::Address {
                pid: current_pid,
                addrs: vec![addr],
            });
        }
        if !spec.is_relative() {
            return Ok(Origin::Expr { spec, rules });
        }

        match self.resolve_relative(&spec, &rules) {
            Ok((pid, loc)) => {
                if spec.is_address() || loc.file.is_empty() {
                    Ok(Origin::Address {
                        pid,
                        addrs: loc.pcs,
                    })
                } else {
                    Ok(Origin::Expr {
                        spec: LocationSpec::FileLine {
                            path: loc.file,
                            line: loc.line,
                        },
                        rules,
                    })
                }
            }
            Err(e) if suspended => {
                info!("Keeping {} unresolved: {}", spec, e);
                Ok(Origin::Expr { spec, rules })
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a spec that depends on the current position or scope.
    fn resolve_relative(
        &self,
        spec: &LocationSpec,
        rules: &[SubstituteRule],
    ) -> DebugResult<(Pid, Location)> {
        self.ensure_alive()?;
        let (pid, thread) = self.current_thread()?;
        let target = self.targets.get(pid).ok_or(DebugError::NoTarget)?;
        let here = target.location_for_pc(thread.pc);
        if here.file.is_empty() {
            return Err(DebugError::NoCurrentLocation);
        }
        let goroutine = target.selected_goroutine.unwrap_or_default();
        let cfg = crate::types::LoadConfig::default();
        let eval = |e: &str| target.process().eval(goroutine, 0, e, &cfg);
        let rules = if rules.is_empty() {
            self.breakpoints.rules()
        } else {
            rules
        };
        let loc = target.with_symbols(|symbols| {
            Resolver::new(symbols)
                .with_rules(rules, self.config.case_insensitive_paths)
                .with_current(here.file.clone(), here.line)
                .with_eval(&eval)
                .resolve_one(spec)
        })?;
        Ok((pid, loc))
    }
}
