// Inspection commands
//
// Read-only views of the stopped target. All of them fail with the uniform exited error
// once the process is gone, and with `TargetRunning` while a continue is in flight.
// Debug-info listings read the published symbol tables and work while running.

use super::engine::{format_location, goroutine_api, Engine};
use super::Debugger;
use crate::error::{DebugError, DebugResult};
use crate::location::{strip_generics, LocationSpec, Resolver};
use crate::substitute::SubstituteRule;
use crate::target::{lock_symbols, Target};
use crate::types::{
    Ancestor, AsmInstruction, EvalScope, Goroutine, GoroutineField, GoroutineFilter,
    GoroutineGroup, GoroutineGroupBy, GoroutineId, GoroutinePage, LoadConfig, Location, Register,
    StackFrame, TargetInfo, Thread, ThreadId, Variable,
};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::MutexGuard;

/// Largest block `examine_memory` returns.
pub const MAX_EXAMINE_LEN: usize = 1000;

fn compile_filter(filter: &str) -> DebugResult<Option<Regex>> {
    if filter.is_empty() {
        return Ok(None);
    }
    Regex::new(filter)
        .map(Some)
        .map_err(|e| DebugError::InvalidArgument(format!("invalid filter: {}", e)))
}

fn frame_index(scope: &EvalScope) -> DebugResult<usize> {
    usize::try_from(scope.frame)
        .map_err(|_| DebugError::InvalidArgument(format!("invalid frame {}", scope.frame)))
}

impl Debugger {
    fn inspect(&self) -> DebugResult<MutexGuard<'_, Engine>> {
        let engine = self.command()?;
        engine.ensure_alive()?;
        Ok(engine)
    }

    pub fn list_threads(&self) -> DebugResult<Vec<Thread>> {
        let engine = self.inspect()?;
        let target = engine.targets.current()?;
        Ok(target
            .process()
            .threads()
            .iter()
            .map(|t| engine.thread_api(target, t))
            .collect())
    }

    pub fn get_thread(&self, id: ThreadId) -> DebugResult<Thread> {
        let engine = self.inspect()?;
        let target = engine.targets.current()?;
        target
            .process()
            .threads()
            .iter()
            .find(|t| t.id == id)
            .map(|t| engine.thread_api(target, t))
            .ok_or(DebugError::ThreadNotFound(id))
    }

    /// List goroutines, filtered, then either paged (`start`, `count`; 0 = all) or grouped.
    pub fn list_goroutines(
        &self,
        start: usize,
        count: usize,
        filters: &[GoroutineFilter],
        group_by: &GoroutineGroupBy,
    ) -> DebugResult<GoroutinePage> {
        let engine = self.inspect()?;
        let target = engine.targets.current()?;
        let mut raw = target.process().goroutines();
        raw.sort_by_key(|g| g.id);
        let all: Vec<Goroutine> = raw
            .iter()
            .map(|g| goroutine_api(target, g))
            .filter(|g| filters.iter().all(|f| filter_matches(f, g) != f.negated))
            .collect();

        if let Some(kind) = group_by.kind {
            return Ok(group_goroutines(all, kind, group_by));
        }

        let total = all.len();
        let start = start.min(total);
        let end = if count == 0 {
            total
        } else {
            start.saturating_add(count).min(total)
        };
        Ok(GoroutinePage {
            goroutines: all[start..end].to_vec(),
            groups: Vec::new(),
            next: if end < total { end as i64 } else { -1 },
            too_many_groups: false,
        })
    }

    /// Up to `depth + 1` frames of a goroutine; `full` loads locals and arguments.
    pub fn stacktrace(
        &self,
        goroutine: GoroutineId,
        depth: i32,
        full: Option<&LoadConfig>,
    ) -> DebugResult<Vec<StackFrame>> {
        if depth < 0 {
            return Err(DebugError::InvalidArgument(format!("negative depth {}", depth)));
        }
        let engine = self.inspect()?;
        let target = engine.targets.current()?;
        let g = engine.scope_goroutine(target, goroutine)?;
        engine.stack_frames(target, g, depth as usize + 1, full)
    }

    pub fn ancestors(
        &self,
        goroutine: GoroutineId,
        count: usize,
        depth: usize,
    ) -> DebugResult<Vec<Ancestor>> {
        let engine = self.inspect()?;
        let target = engine.targets.current()?;
        let g = engine.scope_goroutine(target, goroutine)?;
        let raw = target.process().ancestors(g, count)?;
        Ok(raw
            .into_iter()
            .map(|a| Ancestor {
                id: a.id,
                stack: a
                    .pcs
                    .iter()
                    .take(depth.max(1))
                    .map(|pc| StackFrame {
                        location: target.location_for_pc(*pc),
                        ..Default::default()
                    })
                    .collect(),
                unreadable: String::new(),
            })
            .collect())
    }

    pub fn list_locals(&self, scope: EvalScope, cfg: &LoadConfig) -> DebugResult<Vec<Variable>> {
        let frame = frame_index(&scope)?;
        let engine = self.inspect()?;
        let target = engine.targets.current()?;
        let g = engine.scope_goroutine(target, scope.goroutine_id)?;
        target.process().locals(g, frame, cfg)
    }

    pub fn list_args(&self, scope: EvalScope, cfg: &LoadConfig) -> DebugResult<Vec<Variable>> {
        let frame = frame_index(&scope)?;
        let engine = self.inspect()?;
        let target = engine.targets.current()?;
        let g = engine.scope_goroutine(target, scope.goroutine_id)?;
        target.process().arguments(g, frame, cfg)
    }

    /// Evaluate an expression; fails only when its primary value cannot be resolved.
    pub fn eval_variable(
        &self,
        scope: EvalScope,
        expr: &str,
        cfg: &LoadConfig,
    ) -> DebugResult<Variable> {
        let frame = frame_index(&scope)?;
        let engine = self.inspect()?;
        let target = engine.targets.current()?;
        let g = engine.scope_goroutine(target, scope.goroutine_id)?;
        target.process().eval(g, frame, expr, cfg)
    }

    pub fn set_variable(&self, scope: EvalScope, symbol: &str, value: &str) -> DebugResult<()> {
        let frame = frame_index(&scope)?;
        let mut engine = self.inspect()?;
        let target = engine.targets.current_mut()?;
        let g = match scope.goroutine_id {
            id if id < 0 => target
                .selected_goroutine
                .ok_or(DebugError::GoroutineNotFound(id))?,
            id => id,
        };
        target.process_mut().set_variable(g, frame, symbol, value)
    }

    /// Registers of a thread; 0 selects the current thread.
    pub fn list_registers(&self, thread: ThreadId, include_fp: bool) -> DebugResult<Vec<Register>> {
        let engine = self.inspect()?;
        let target = engine.targets.current()?;
        let id = if thread == 0 {
            target.current_thread.ok_or(DebugError::NoCurrentLocation)?
        } else {
            thread
        };
        target.process().thread_registers(id, include_fp)
    }

    pub fn list_scope_registers(&self, scope: EvalScope, include_fp: bool) -> DebugResult<Vec<Register>> {
        let frame = frame_index(&scope)?;
        let engine = self.inspect()?;
        let target = engine.targets.current()?;
        let g = engine.scope_goroutine(target, scope.goroutine_id)?;
        target.process().frame_registers(g, frame, include_fp)
    }

    pub fn list_types(&self, filter: &str) -> DebugResult<Vec<String>> {
        let re = compile_filter(filter)?;
        let mut out = BTreeSet::new();
        for symbols in self.run.symbols() {
            let table = lock_symbols(&symbols);
            out.extend(
                table
                    .types()
                    .into_iter()
                    .filter(|t| re.as_ref().map_or(true, |re| re.is_match(t))),
            );
        }
        Ok(out.into_iter().collect())
    }

    pub fn list_sources(&self, filter: &str) -> DebugResult<Vec<String>> {
        let re = compile_filter(filter)?;
        let mut out = BTreeSet::new();
        for symbols in self.run.symbols() {
            let table = lock_symbols(&symbols);
            out.extend(
                table
                    .sources()
                    .into_iter()
                    .filter(|s| re.as_ref().map_or(true, |re| re.is_match(s))),
            );
        }
        Ok(out.into_iter().collect())
    }

    /// Functions matching `filter`, plus their callees up to `follow_calls` levels deep.
    pub fn list_functions(&self, filter: &str, follow_calls: usize) -> DebugResult<Vec<String>> {
        let re = compile_filter(filter)?;
        let mut out = BTreeSet::new();
        for symbols in self.run.symbols() {
            let table = lock_symbols(&symbols);
            let mut frontier: Vec<String> = table
                .functions()
                .into_iter()
                .map(|f| f.name)
                .filter(|name| re.as_ref().map_or(true, |re| re.is_match(name)))
                .collect();
            out.extend(frontier.iter().cloned());
            for _ in 0..follow_calls {
                let mut next = Vec::new();
                for name in &frontier {
                    for callee in table.callees(name) {
                        if out.insert(callee.clone()) {
                            next.push(callee);
                        }
                    }
                }
                if next.is_empty() {
                    break;
                }
                frontier = next;
            }
        }
        Ok(out.into_iter().collect())
    }

    /// Resolve a location expression in every live target and merge the results.
    pub fn find_location(
        &self,
        scope: EvalScope,
        expr: &str,
        include_non_exec: bool,
        rules: &[SubstituteRule],
    ) -> DebugResult<Vec<Location>> {
        let frame = frame_index(&scope)?;
        let spec = LocationSpec::parse(expr)?;
        let engine = self.inspect()?;
        let rules = if rules.is_empty() {
            engine.breakpoints.rules()
        } else {
            rules
        };
        let ci = engine.config.case_insensitive_paths;
        let current_pid = engine.targets.current_pid();

        let mut per_target = Vec::new();
        let mut first_err = None;
        for target in engine.targets.iter().filter(|t| t.is_alive()) {
            let g = engine
                .scope_goroutine(target, scope.goroutine_id)
                .unwrap_or_default();
            let here = if Some(target.pid()) == current_pid {
                scope_location(target, g, frame)
            } else {
                None
            };
            let cfg = LoadConfig::default();
            let eval = |e: &str| target.process().eval(g, frame, e, &cfg);
            let result = target.with_symbols(|symbols| {
                let mut resolver = Resolver::new(symbols)
                    .with_rules(rules, ci)
                    .with_non_exec_lines(include_non_exec)
                    .with_eval(&eval);
                if let Some(loc) = &here {
                    resolver = resolver.with_current(loc.file.clone(), loc.line);
                }
                resolver.resolve(&spec)
            });
            match result {
                Ok(locs) => per_target.push((target.pid(), locs)),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if per_target.is_empty() {
            return Err(first_err.unwrap_or_else(|| DebugError::LocationNotFound(expr.to_string())));
        }
        Ok(Engine::merge_locations(per_target))
    }

    /// Disassemble the function containing `pc`.
    pub fn disassemble_pc(&self, scope: EvalScope, pc: u64) -> DebugResult<Vec<AsmInstruction>> {
        let engine = self.inspect()?;
        let target = engine.targets.current()?;
        let function = target
            .with_symbols(|symbols| symbols.function_at(pc))
            .ok_or_else(|| DebugError::LocationNotFound(format!("{:#x}", pc)))?;
        disassemble(&engine, target, scope, function.entry, function.end)
    }

    pub fn disassemble_range(
        &self,
        scope: EvalScope,
        start: u64,
        end: u64,
    ) -> DebugResult<Vec<AsmInstruction>> {
        if end <= start {
            return Err(DebugError::InvalidArgument(format!(
                "empty range {:#x}-{:#x}",
                start, end
            )));
        }
        let engine = self.inspect()?;
        let target = engine.targets.current()?;
        disassemble(&engine, target, scope, start, end)
    }

    pub fn examine_memory(&self, addr: u64, len: usize) -> DebugResult<Vec<u8>> {
        if len > MAX_EXAMINE_LEN {
            return Err(DebugError::InvalidArgument(format!(
                "len must be at most {}",
                MAX_EXAMINE_LEN
            )));
        }
        let engine = self.inspect()?;
        engine.targets.current()?.process().read_memory(addr, len)
    }

    /// Addresses of every return instruction of a function (all instantiations).
    pub fn function_return_locations(&self, name: &str) -> DebugResult<Vec<u64>> {
        let engine = self.inspect()?;
        let target = engine.targets.current()?;
        let spec = LocationSpec::Function {
            name: name.to_string(),
            line_offset: None,
        };
        let loc = target.resolve_one(
            &spec,
            engine.breakpoints.rules(),
            engine.config.case_insensitive_paths,
        )?;
        let identity = loc.function.unwrap_or_default();
        let functions: Vec<_> = target.with_symbols(|symbols| {
            symbols
                .functions()
                .into_iter()
                .filter(|f| strip_generics(f.identity()) == identity)
                .collect()
        });

        let mut out = Vec::new();
        for f in functions {
            let mem = target
                .process()
                .read_memory(f.entry, (f.end - f.entry) as usize)?;
            out.extend(
                engine
                    .disassembler
                    .decode(&mem, f.entry)
                    .into_iter()
                    .filter(|i| i.is_return)
                    .map(|i| i.pc),
            );
        }
        out.sort_unstable();
        Ok(out)
    }

    pub fn list_targets(&self) -> DebugResult<Vec<TargetInfo>> {
        let engine = self.inspect()?;
        Ok(engine
            .targets
            .iter()
            .filter(|t| t.is_alive())
            .map(|t| TargetInfo {
                pid: t.pid(),
                cmd_line: t.cmdline().to_string(),
                current_thread: t.current_thread.and_then(|id| {
                    t.process()
                        .threads()
                        .iter()
                        .find(|raw| raw.id == id)
                        .map(|raw| engine.thread_api(t, raw))
                }),
            })
            .collect())
    }
}

fn scope_location(target: &Target, goroutine: GoroutineId, frame: usize) -> Option<Location> {
    let frames = target.process().stacktrace(goroutine, frame + 1).ok()?;
    let pc = frames.get(frame)?.pc;
    let loc = target.location_for_pc(pc);
    (!loc.file.is_empty()).then_some(loc)
}

fn disassemble(
    engine: &Engine,
    target: &Target,
    scope: EvalScope,
    start: u64,
    end: u64,
) -> DebugResult<Vec<AsmInstruction>> {
    let mem = target.process().read_memory(start, (end - start) as usize)?;
    let current_pc = engine
        .scope_goroutine(target, scope.goroutine_id)
        .ok()
        .and_then(|g| target.process().stacktrace(g, 1).ok())
        .and_then(|frames| frames.first().map(|f| f.pc));

    Ok(engine
        .disassembler
        .decode(&mem, start)
        .into_iter()
        .map(|instr| {
            let offset = (instr.pc - start) as usize;
            let bytes = mem
                .get(offset..offset + instr.len)
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            AsmInstruction {
                loc: target.location_for_pc(instr.pc),
                dest_loc: instr.dest.map(|d| target.location_for_pc(d)),
                text: instr.text,
                bytes,
                breakpoint: target.installed().contains(&instr.pc),
                at_pc: current_pc == Some(instr.pc),
            }
        })
        .collect())
}

fn filter_matches(filter: &GoroutineFilter, g: &Goroutine) -> bool {
    match filter.kind {
        GoroutineField::CurrentLoc => format_location(&g.current_loc).contains(&filter.arg),
        GoroutineField::UserLoc => format_location(&g.user_current_loc).contains(&filter.arg),
        GoroutineField::GoLoc => format_location(&g.go_statement_loc).contains(&filter.arg),
        GoroutineField::StartLoc => format_location(&g.start_loc).contains(&filter.arg),
        GoroutineField::Label => match filter.arg.split_once('=') {
            Some((key, value)) => g.labels.get(key).map_or(false, |v| v == value),
            None => g.labels.contains_key(&filter.arg),
        },
        GoroutineField::Running => g.thread_id != 0,
    }
}

fn group_key(g: &Goroutine, kind: GoroutineField, label: &str) -> String {
    match kind {
        GoroutineField::CurrentLoc => format_location(&g.current_loc),
        GoroutineField::UserLoc => format_location(&g.user_current_loc),
        GoroutineField::GoLoc => format_location(&g.go_statement_loc),
        GoroutineField::StartLoc => format_location(&g.start_loc),
        GoroutineField::Label => match g.labels.get(label) {
            Some(value) => format!("{}={}", label, value),
            None => format!("{}=(none)", label),
        },
        GoroutineField::Running => {
            if g.thread_id != 0 {
                "running".to_string()
            } else {
                "not running".to_string()
            }
        }
    }
}

fn group_goroutines(all: Vec<Goroutine>, kind: GoroutineField, by: &GoroutineGroupBy) -> GoroutinePage {
    let mut buckets: BTreeMap<String, Vec<Goroutine>> = BTreeMap::new();
    for g in all {
        buckets
            .entry(group_key(&g, kind, &by.label))
            .or_default()
            .push(g);
    }

    let max_groups = if by.max_groups == 0 { usize::MAX } else { by.max_groups };
    let max_members = if by.max_group_members == 0 {
        usize::MAX
    } else {
        by.max_group_members
    };
    let too_many_groups = buckets.len() > max_groups;

    let mut page = GoroutinePage {
        next: -1,
        too_many_groups,
        ..Default::default()
    };
    for (name, members) in buckets.into_iter().take(max_groups) {
        let shown: Vec<Goroutine> = members.iter().take(max_members).cloned().collect();
        page.groups.push(GoroutineGroup {
            name,
            offset: page.goroutines.len(),
            count: shown.len(),
            total: members.len(),
        });
        page.goroutines.extend(shown);
    }
    page
}
