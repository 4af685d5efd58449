// Breakpoint manager
//
// Logical breakpoints carry user identity (ID, name, conditions, captures); each one owns
// the physical traps it resolved to in every target.

use crate::error::{DebugError, DebugResult};
use crate::location::LocationSpec;
use crate::substitute::SubstituteRule;
use crate::target::TargetRegistry;
use crate::types::{Breakpoint, BreakpointId, GoroutineId, LoadConfig, Location, Pid};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

pub const UNRECOVERED_PANIC_ID: BreakpointId = -1;
pub const FATAL_THROW_ID: BreakpointId = -2;
pub const UNRECOVERED_PANIC: &str = "unrecovered-panic";
pub const FATAL_THROW: &str = "fatal-throw";

const INTERNAL: &[(BreakpointId, &str, &str)] = &[
    (UNRECOVERED_PANIC_ID, UNRECOVERED_PANIC, "runtime.fatalpanic"),
    (FATAL_THROW_ID, FATAL_THROW, "runtime.fatalthrow"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitCondition {
    pub op: HitOp,
    pub value: u64,
}

impl HitCondition {
    /// Parse `== N`, `!= N`, `< N`, `<= N`, `> N`, `>= N` or `% N`.
    pub fn parse(s: &str) -> DebugResult<Self> {
        let text = s.trim();
        let invalid = || DebugError::InvalidHitCondition(s.to_string());
        let (op, rest) = [
            ("==", HitOp::Eq),
            ("!=", HitOp::Ne),
            ("<=", HitOp::Le),
            (">=", HitOp::Ge),
            ("<", HitOp::Lt),
            (">", HitOp::Gt),
            ("%", HitOp::Mod),
        ]
        .iter()
        .find_map(|(tok, op)| text.strip_prefix(tok).map(|rest| (*op, rest)))
        .ok_or_else(invalid)?;
        let value: u64 = rest.trim().parse().map_err(|_| invalid())?;
        if op == HitOp::Mod && value == 0 {
            return Err(invalid());
        }
        Ok(Self { op, value })
    }

    pub fn satisfied(&self, count: u64) -> bool {
        match self.op {
            HitOp::Eq => count == self.value,
            HitOp::Ne => count != self.value,
            HitOp::Lt => count < self.value,
            HitOp::Le => count <= self.value,
            HitOp::Gt => count > self.value,
            HitOp::Ge => count >= self.value,
            HitOp::Mod => count % self.value == 0,
        }
    }

    /// No later hit can satisfy the condition any more.
    pub fn exhausted(&self, count: u64) -> bool {
        match self.op {
            HitOp::Lt => count >= self.value,
            HitOp::Le => count > self.value,
            HitOp::Eq => count >= self.value,
            _ => false,
        }
    }
}

/// Where a logical breakpoint's addresses come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Re-resolved in every target that can resolve it.
    Expr {
        spec: LocationSpec,
        rules: Vec<SubstituteRule>,
    },
    /// Raw addresses, bound to one target.
    Address { pid: Pid, addrs: Vec<u64> },
}

impl Origin {
    fn expr_text(&self) -> String {
        match self {
            Origin::Expr { spec, .. } => spec.to_string(),
            Origin::Address { addrs, .. } => addrs
                .first()
                .map(|a| format!("*{:#x}", a))
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogicalBreakpoint {
    pub id: BreakpointId,
    pub name: String,
    pub origin: Origin,
    pub enabled: bool,
    pub cond: String,
    pub hit_cond: Option<HitCondition>,
    hit_cond_text: String,
    pub hit_cond_per_g: bool,
    pub tracepoint: bool,
    pub trace_return: bool,
    pub goroutine: bool,
    pub stacktrace: i32,
    pub variables: Vec<String>,
    pub load_args: Option<LoadConfig>,
    pub load_locals: Option<LoadConfig>,
    pub total_hit_count: u64,
    pub hit_count: BTreeMap<GoroutineId, u64>,
    /// The hit condition can never be satisfied again; physical traps were removed.
    pub exhausted: bool,
    pub internal: bool,
    file: String,
    line: i32,
    function_name: String,
}

impl LogicalBreakpoint {
    fn new(id: BreakpointId, origin: Origin, req: &Breakpoint) -> DebugResult<Self> {
        let hit_cond = parse_hit_cond(&req.hit_cond)?;
        Ok(Self {
            id,
            name: req.name.clone(),
            origin,
            enabled: !req.disabled,
            cond: req.cond.clone(),
            hit_cond,
            hit_cond_text: req.hit_cond.trim().to_string(),
            hit_cond_per_g: req.hit_cond_per_g,
            tracepoint: req.tracepoint,
            trace_return: req.trace_return,
            goroutine: req.goroutine,
            stacktrace: req.stacktrace,
            variables: req.variables.clone(),
            load_args: req.load_args.clone(),
            load_locals: req.load_locals.clone(),
            total_hit_count: 0,
            hit_count: BTreeMap::new(),
            exhausted: false,
            internal: false,
            file: req.file.clone(),
            line: req.line,
            function_name: req.function_name.clone(),
        })
    }

    fn record_location(&mut self, loc: &Location) {
        self.file = loc.file.clone();
        self.line = loc.line as i32;
        if let Some(function) = &loc.function {
            self.function_name = function.clone();
        }
    }
}

fn parse_hit_cond(text: &str) -> DebugResult<Option<HitCondition>> {
    if text.trim().is_empty() {
        Ok(None)
    } else {
        HitCondition::parse(text).map(Some)
    }
}

fn validate_name(name: &str) -> DebugResult<()> {
    if name.is_empty() {
        return Ok(());
    }
    if name.parse::<i64>().is_ok() || name.chars().any(char::is_whitespace) {
        return Err(DebugError::InvalidBreakpointName(name.to_string()));
    }
    Ok(())
}

/// Errors that leave a breakpoint suspended instead of failing creation.
fn is_unresolved(err: &DebugError) -> bool {
    matches!(
        err,
        DebugError::LocationNotFound(_)
            | DebugError::NoCurrentLocation
            | DebugError::NoTarget
            | DebugError::ProcessExited { .. }
    )
}

/// Result of a physical breakpoint trap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitOutcome {
    /// No logical breakpoint owns the address.
    NotOurs,
    /// Condition or hit condition not met: resume silently.
    Skip,
    Stop {
        id: BreakpointId,
        tracepoint: bool,
        cond_error: Option<String>,
    },
}

pub struct BreakpointManager {
    logical: BTreeMap<BreakpointId, LogicalBreakpoint>,
    physical: BTreeMap<(Pid, u64), BreakpointId>,
    /// Enabled breakpoints waiting for a resolution trigger.
    pending: BTreeSet<BreakpointId>,
    high_water: BreakpointId,
    rules: Vec<SubstituteRule>,
    case_insensitive: bool,
}

impl BreakpointManager {
    pub fn new(rules: Vec<SubstituteRule>, case_insensitive: bool) -> Self {
        Self {
            logical: BTreeMap::new(),
            physical: BTreeMap::new(),
            pending: BTreeSet::new(),
            high_water: 0,
            rules,
            case_insensitive,
        }
    }

    pub fn rules(&self) -> &[SubstituteRule] {
        &self.rules
    }

    fn next_id(&self) -> BreakpointId {
        let max_existing = self.logical.keys().copied().max().unwrap_or(0);
        max_existing.max(self.high_water) + 1
    }

    fn check_name(&self, name: &str, owner: BreakpointId) -> DebugResult<()> {
        validate_name(name)?;
        if !name.is_empty()
            && self
                .logical
                .values()
                .any(|bp| bp.id != owner && bp.name == name)
        {
            return Err(DebugError::DuplicateBreakpointName(name.to_string()));
        }
        Ok(())
    }

    /// Create a logical breakpoint and materialize it in every target that resolves it.
    pub fn create(
        &mut self,
        targets: &mut TargetRegistry,
        req: &Breakpoint,
        origin: Origin,
        allow_suspended: bool,
    ) -> DebugResult<Breakpoint> {
        if req.id < 0 {
            return Err(DebugError::InvalidArgument(format!(
                "breakpoint id {} is reserved",
                req.id
            )));
        }
        if req.id > 0 {
            if let Some(existing) = self.logical.get(&req.id) {
                if existing.origin == origin {
                    return Ok(self.to_api(existing));
                }
                return Err(DebugError::BreakpointExists {
                    id: req.id,
                    location: existing.origin.expr_text(),
                });
            }
        }
        self.check_name(&req.name, 0)?;

        let id = if req.id > 0 { req.id } else { self.next_id() };
        let bp = LogicalBreakpoint::new(id, origin, req)?;
        let enabled = bp.enabled;
        self.logical.insert(id, bp);

        if enabled {
            let pids = targets.pids();
            match self.materialize_in(targets, id, &pids) {
                Ok(_) => {}
                Err(e) if allow_suspended && is_unresolved(&e) => {
                    debug!("Breakpoint {} suspended: {}", id, e);
                    self.pending.insert(id);
                }
                Err(e) => {
                    self.logical.remove(&id);
                    return Err(e);
                }
            }
        }
        self.high_water = self.high_water.max(id);
        let bp = &self.logical[&id];
        info!("Created breakpoint {} at {}", id, bp.origin.expr_text());
        Ok(self.to_api(bp))
    }

    /// Replace the mutable attributes of an existing breakpoint.
    pub fn amend(&mut self, targets: &mut TargetRegistry, req: &Breakpoint) -> DebugResult<Breakpoint> {
        let current = self
            .logical
            .get(&req.id)
            .ok_or(DebugError::BreakpointNotFound(req.id))?;
        self.check_name(&req.name, req.id)?;
        let hit_cond = parse_hit_cond(&req.hit_cond)?;
        let hit_cond_text = req.hit_cond.trim().to_string();
        let hit_cond_changed = current.hit_cond_text != hit_cond_text;
        let was_enabled = current.enabled;

        let id = req.id;
        if let Some(bp) = self.logical.get_mut(&id) {
            bp.name = req.name.clone();
            bp.cond = req.cond.clone();
            bp.hit_cond = hit_cond;
            bp.hit_cond_text = hit_cond_text;
            bp.hit_cond_per_g = req.hit_cond_per_g;
            bp.tracepoint = req.tracepoint;
            bp.trace_return = req.trace_return;
            bp.goroutine = req.goroutine;
            bp.stacktrace = req.stacktrace;
            bp.variables = req.variables.clone();
            bp.load_args = req.load_args.clone();
            bp.load_locals = req.load_locals.clone();
            if hit_cond_changed {
                bp.exhausted = false;
            }
        }

        if req.disabled {
            if was_enabled {
                self.remove_physical(targets, id);
                self.pending.remove(&id);
            }
            if let Some(bp) = self.logical.get_mut(&id) {
                bp.enabled = false;
            }
        } else {
            if let Some(bp) = self.logical.get_mut(&id) {
                bp.enabled = true;
            }
            let needs_traps = !self.logical[&id].exhausted && !self.has_physical(id);
            if needs_traps {
                let pids = targets.pids();
                match self.materialize_in(targets, id, &pids) {
                    Ok(_) => {
                        self.pending.remove(&id);
                    }
                    Err(e) if is_unresolved(&e) => {
                        self.pending.insert(id);
                    }
                    Err(e) => {
                        if let Some(bp) = self.logical.get_mut(&id) {
                            bp.enabled = was_enabled;
                        }
                        return Err(e);
                    }
                }
            }
        }
        debug!("Amended breakpoint {}", id);
        Ok(self.to_api(&self.logical[&id]))
    }

    /// Flip enabled/disabled, keeping every amendment.
    pub fn toggle(&mut self, targets: &mut TargetRegistry, id: BreakpointId) -> DebugResult<Breakpoint> {
        let mut req = self.get(id)?;
        req.disabled = !req.disabled;
        self.amend(targets, &req)
    }

    /// Remove a breakpoint and every trap it owns; all or nothing.
    pub fn clear(&mut self, targets: &mut TargetRegistry, id: BreakpointId) -> DebugResult<Breakpoint> {
        let bp = self
            .logical
            .get(&id)
            .ok_or(DebugError::BreakpointNotFound(id))?;
        let snapshot = self.to_api(bp);

        let owned: Vec<(Pid, u64)> = self.owned(id);
        let mut removed: Vec<(Pid, u64)> = Vec::new();
        for (pid, addr) in owned {
            let result = match targets.get_mut(pid) {
                Some(target) => target.remove(addr),
                None => Ok(()),
            };
            if let Err(e) = result {
                for (pid, addr) in removed {
                    if let Some(target) = targets.get_mut(pid) {
                        if let Err(e) = target.install(addr) {
                            warn!("Failed to restore breakpoint at {:#x}: {}", addr, e);
                        }
                    }
                }
                return Err(e);
            }
            removed.push((pid, addr));
        }

        self.physical.retain(|_, owner| *owner != id);
        self.pending.remove(&id);
        self.logical.remove(&id);
        info!("Cleared breakpoint {}", id);
        Ok(snapshot)
    }

    pub fn clear_by_name(&mut self, targets: &mut TargetRegistry, name: &str) -> DebugResult<Breakpoint> {
        let id = self.id_by_name(name)?;
        self.clear(targets, id)
    }

    pub fn get(&self, id: BreakpointId) -> DebugResult<Breakpoint> {
        self.logical
            .get(&id)
            .map(|bp| self.to_api(bp))
            .ok_or(DebugError::BreakpointNotFound(id))
    }

    pub fn get_by_name(&self, name: &str) -> DebugResult<Breakpoint> {
        self.get(self.id_by_name(name)?)
    }

    fn id_by_name(&self, name: &str) -> DebugResult<BreakpointId> {
        self.logical
            .values()
            .find(|bp| !name.is_empty() && bp.name == name)
            .map(|bp| bp.id)
            .ok_or_else(|| DebugError::BreakpointNameNotFound(name.to_string()))
    }

    pub fn logical(&self, id: BreakpointId) -> Option<&LogicalBreakpoint> {
        self.logical.get(&id)
    }

    pub fn list(&self, include_internal: bool) -> Vec<Breakpoint> {
        self.logical
            .values()
            .filter(|bp| include_internal || !bp.internal)
            .map(|bp| self.to_api(bp))
            .collect()
    }

    /// Logical breakpoint owning the trap at `addr` in target `pid`.
    pub fn owner(&self, pid: Pid, addr: u64) -> Option<&LogicalBreakpoint> {
        self.physical
            .get(&(pid, addr))
            .and_then(|id| self.logical.get(id))
            .filter(|bp| bp.enabled)
    }

    /// Condition to evaluate before recording a hit at `addr`.
    pub fn condition_at(&self, pid: Pid, addr: u64) -> Option<String> {
        self.owner(pid, addr)
            .map(|bp| bp.cond.clone())
            .filter(|cond| !cond.trim().is_empty())
    }

    /// Account for a trap at `addr`; `cond` is the evaluated condition, if any.
    pub fn record_hit(
        &mut self,
        targets: &mut TargetRegistry,
        pid: Pid,
        addr: u64,
        goroutine: GoroutineId,
        cond: Option<DebugResult<bool>>,
    ) -> HitOutcome {
        let id = match self.owner(pid, addr) {
            Some(bp) => bp.id,
            None => return HitOutcome::NotOurs,
        };
        let cond_error = match cond {
            Some(Ok(false)) => return HitOutcome::Skip,
            Some(Err(e)) => Some(e.to_string()),
            _ => None,
        };

        let (active, tracepoint, exhausted) = match self.logical.get_mut(&id) {
            Some(bp) => {
                bp.total_hit_count += 1;
                let per_g = bp.hit_count.entry(goroutine).or_insert(0);
                *per_g += 1;
                let count = if bp.hit_cond_per_g { *per_g } else { bp.total_hit_count };
                let active = bp.hit_cond.map_or(true, |hc| hc.satisfied(count));
                let exhausted = !bp.hit_cond_per_g
                    && bp.hit_cond.map_or(false, |hc| hc.exhausted(count));
                (active, bp.tracepoint, exhausted)
            }
            None => return HitOutcome::NotOurs,
        };

        if exhausted {
            info!("Hit condition of breakpoint {} can no longer be met, removing traps", id);
            self.remove_physical(targets, id);
            if let Some(bp) = self.logical.get_mut(&id) {
                bp.exhausted = true;
            }
        }

        if active {
            HitOutcome::Stop {
                id,
                tracepoint,
                cond_error,
            }
        } else {
            HitOutcome::Skip
        }
    }

    /// Create internal breakpoints for a target whose runtime provides them.
    pub fn ensure_internal(&mut self, targets: &mut TargetRegistry, pid: Pid) {
        for (id, name, function) in INTERNAL {
            if self.logical.contains_key(id) {
                continue;
            }
            let spec = LocationSpec::Function {
                name: function.to_string(),
                line_offset: None,
            };
            let resolvable = targets
                .get(pid)
                .map(|t| t.resolve_one(&spec, &[], false).is_ok())
                .unwrap_or(false);
            if !resolvable {
                continue;
            }
            let req = Breakpoint {
                name: name.to_string(),
                ..Default::default()
            };
            let origin = Origin::Expr {
                spec,
                rules: Vec::new(),
            };
            if let Ok(mut bp) = LogicalBreakpoint::new(*id, origin, &req) {
                bp.internal = true;
                self.logical.insert(*id, bp);
            }
        }
    }

    /// Materialize every eligible breakpoint in target `pid`; failures stay suspended.
    pub fn sync_target(&mut self, targets: &mut TargetRegistry, pid: Pid) {
        let ids: Vec<BreakpointId> = self
            .logical
            .values()
            .filter(|bp| bp.enabled && !bp.exhausted)
            .filter(|bp| match &bp.origin {
                Origin::Expr { .. } => true,
                Origin::Address { pid: owner, .. } => *owner == pid,
            })
            .map(|bp| bp.id)
            .collect();

        for id in ids {
            if self.physical.iter().any(|((p, _), owner)| *p == pid && *owner == id) {
                continue;
            }
            match self.materialize_in(targets, id, &[pid]) {
                Ok(n) => {
                    debug!("Breakpoint {} materialized in {} ({} addresses)", id, pid, n);
                    self.pending.remove(&id);
                }
                Err(e) => {
                    if !self.has_physical(id) {
                        self.pending.insert(id);
                    }
                    debug!("Breakpoint {} not resolved in {}: {}", id, pid, e);
                }
            }
        }
    }

    /// Retry suspended breakpoints against every target.
    pub fn rescan_pending(&mut self, targets: &mut TargetRegistry) {
        for pid in targets.pids() {
            self.sync_target(targets, pid);
        }
    }

    /// Forget all traps and counters ahead of a restart; identities are kept.
    pub fn reset_for_restart(&mut self, old_pid: Option<Pid>, new_pid: Pid) {
        self.physical.clear();
        self.pending.clear();
        for bp in self.logical.values_mut() {
            bp.total_hit_count = 0;
            bp.hit_count.clear();
            bp.exhausted = false;
            if let Origin::Address { pid, .. } = &mut bp.origin {
                if Some(*pid) == old_pid {
                    *pid = new_pid;
                }
            }
            if bp.enabled {
                self.pending.insert(bp.id);
            }
        }
    }

    /// Drop the traps of a target that went away.
    pub fn forget_target(&mut self, pid: Pid) {
        let affected: BTreeSet<BreakpointId> = self
            .physical
            .iter()
            .filter(|((p, _), _)| *p == pid)
            .map(|(_, id)| *id)
            .collect();
        self.physical.retain(|(p, _), _| *p != pid);
        for id in affected {
            let eligible = self
                .logical
                .get(&id)
                .map_or(false, |bp| bp.enabled && !bp.exhausted);
            if eligible && !self.has_physical(id) {
                self.pending.insert(id);
            }
        }
    }

    pub fn is_suspended(&self, id: BreakpointId) -> bool {
        self.pending.contains(&id)
    }

    fn has_physical(&self, id: BreakpointId) -> bool {
        self.physical.values().any(|owner| *owner == id)
    }

    fn owned(&self, id: BreakpointId) -> Vec<(Pid, u64)> {
        self.physical
            .iter()
            .filter(|(_, owner)| **owner == id)
            .map(|(key, _)| *key)
            .collect()
    }

    fn remove_physical(&mut self, targets: &mut TargetRegistry, id: BreakpointId) {
        for (pid, addr) in self.owned(id) {
            if let Some(target) = targets.get_mut(pid) {
                if let Err(e) = target.remove(addr) {
                    warn!("Failed to remove breakpoint {} at {:#x}: {}", id, addr, e);
                }
            }
            self.physical.remove(&(pid, addr));
        }
    }

    /// Resolve and install breakpoint `id` in the given live targets.
    fn materialize_in(
        &mut self,
        targets: &mut TargetRegistry,
        id: BreakpointId,
        pids: &[Pid],
    ) -> DebugResult<usize> {
        let bp = self
            .logical
            .get(&id)
            .ok_or(DebugError::BreakpointNotFound(id))?;

        let mut resolved: Vec<(Pid, Location)> = Vec::new();
        let mut first_err: Option<DebugError> = None;
        for pid in pids {
            let target = match targets.get(*pid) {
                Some(t) if t.is_alive() => t,
                Some(t) => {
                    if let Err(e) = t.ensure_alive() {
                        first_err.get_or_insert(e);
                    }
                    continue;
                }
                None => continue,
            };
            let result = match &bp.origin {
                Origin::Expr { spec, rules } => {
                    let rules = if rules.is_empty() { &self.rules } else { rules };
                    target.resolve_one(spec, rules, self.case_insensitive)
                }
                Origin::Address { pid: owner, addrs } if owner == pid => {
                    let mut loc = target.location_for_pc(addrs.first().copied().unwrap_or_default());
                    loc.pcs = addrs.clone();
                    Ok(loc)
                }
                Origin::Address { .. } => continue,
            };
            match result {
                Ok(loc) => resolved.push((*pid, loc)),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        if resolved.is_empty() {
            return Err(first_err.unwrap_or_else(|| DebugError::LocationNotFound(bp.origin.expr_text())));
        }

        for (pid, loc) in &resolved {
            for pc in &loc.pcs {
                if let Some(owner) = self.physical.get(&(*pid, *pc)) {
                    if *owner != id {
                        return Err(DebugError::BreakpointExists {
                            id: *owner,
                            location: format!("{}:{}", loc.file, loc.line),
                        });
                    }
                }
            }
        }

        let mut installed: Vec<(Pid, u64)> = Vec::new();
        for (pid, loc) in &resolved {
            for pc in &loc.pcs {
                let result = match targets.get_mut(*pid) {
                    Some(target) => target.install(*pc),
                    None => Ok(()),
                };
                if let Err(e) = result {
                    for (pid, addr) in installed {
                        if let Some(target) = targets.get_mut(pid) {
                            if let Err(e) = target.remove(addr) {
                                warn!(
                                    "Rolling back breakpoint {} at {:#x} in {} failed: {}",
                                    id, addr, pid, e
                                );
                            }
                        }
                        self.physical.remove(&(pid, addr));
                    }
                    return Err(e);
                }
                self.physical.insert((*pid, *pc), id);
                installed.push((*pid, *pc));
            }
        }

        if let Some(bp) = self.logical.get_mut(&id) {
            bp.record_location(&resolved[0].1);
        }
        Ok(installed.len())
    }

    fn to_api(&self, bp: &LogicalBreakpoint) -> Breakpoint {
        let owned = self.owned(bp.id);
        let (file, line, function_name) = match (&bp.origin, bp.file.is_empty()) {
            (Origin::Expr { spec: LocationSpec::FileLine { path, line }, .. }, true) => {
                (path.clone(), *line as i32, bp.function_name.clone())
            }
            _ => (bp.file.clone(), bp.line, bp.function_name.clone()),
        };
        Breakpoint {
            id: bp.id,
            name: bp.name.clone(),
            addr: owned.first().map(|(_, a)| *a).unwrap_or(0),
            addrs: owned.iter().map(|(_, a)| *a).collect(),
            addr_pid: owned.iter().map(|(p, _)| *p).collect(),
            file,
            line,
            function_name,
            expr: bp.origin.expr_text(),
            cond: bp.cond.clone(),
            hit_cond: bp.hit_cond_text.clone(),
            hit_cond_per_g: bp.hit_cond_per_g,
            tracepoint: bp.tracepoint,
            trace_return: bp.trace_return,
            goroutine: bp.goroutine,
            stacktrace: bp.stacktrace,
            variables: bp.variables.clone(),
            load_args: bp.load_args.clone(),
            load_locals: bp.load_locals.clone(),
            disabled: !bp.enabled,
            suspended: self.pending.contains(&bp.id),
            total_hit_count: bp.total_hit_count,
            hit_count: bp
                .hit_count
                .iter()
                .map(|(g, n)| (g.to_string(), *n))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hit_conditions() {
        assert_eq!(
            HitCondition::parse("< 3").unwrap(),
            HitCondition { op: HitOp::Lt, value: 3 }
        );
        assert_eq!(
            HitCondition::parse("==3").unwrap(),
            HitCondition { op: HitOp::Eq, value: 3 }
        );
        assert_eq!(HitCondition::parse(">= 10").unwrap().op, HitOp::Ge);
        assert_eq!(HitCondition::parse("% 2").unwrap().op, HitOp::Mod);
        assert!(HitCondition::parse("% 0").is_err());
        assert!(HitCondition::parse("=> 3").is_err());
        assert!(HitCondition::parse("< x").is_err());
    }

    #[test]
    fn test_hit_condition_exhaustion() {
        let lt = HitCondition::parse("< 3").unwrap();
        assert!(lt.satisfied(1) && lt.satisfied(2) && !lt.satisfied(3));
        assert!(!lt.exhausted(2));
        assert!(lt.exhausted(3));

        let eq = HitCondition::parse("== 3").unwrap();
        assert!(!eq.exhausted(2));
        assert!(eq.satisfied(3) && eq.exhausted(3));

        let le = HitCondition::parse("<= 2").unwrap();
        assert!(!le.exhausted(2) && le.exhausted(3));

        let ge = HitCondition::parse(">= 2").unwrap();
        assert!(!ge.exhausted(100));
    }

    #[test]
    fn test_names_are_validated() {
        assert!(validate_name("").is_ok());
        assert!(validate_name("loop_body").is_ok());
        assert!(validate_name("42").is_err());
        assert!(validate_name("two words").is_err());
    }

    #[test]
    fn test_suspended_creation_without_targets() {
        let mut targets = TargetRegistry::new();
        let mut manager = BreakpointManager::new(Vec::new(), false);
        let origin = Origin::Expr {
            spec: LocationSpec::parse("plugin.Fn").unwrap(),
            rules: Vec::new(),
        };
        let req = Breakpoint::default();
        assert!(manager
            .create(&mut targets, &req, origin.clone(), false)
            .is_err());
        assert!(manager.list(true).is_empty());

        let bp = manager.create(&mut targets, &req, origin, true).unwrap();
        assert_eq!(bp.id, 1);
        assert!(bp.suspended);
        assert!(bp.addrs.is_empty());
    }

    #[test]
    fn test_explicit_ids_and_auto_allocation() {
        let mut targets = TargetRegistry::new();
        let mut manager = BreakpointManager::new(Vec::new(), false);
        let origin = |name: &str| Origin::Expr {
            spec: LocationSpec::parse(name).unwrap(),
            rules: Vec::new(),
        };
        let explicit = Breakpoint {
            id: 2,
            ..Default::default()
        };
        let bp = manager
            .create(&mut targets, &explicit, origin("a.f"), true)
            .unwrap();
        assert_eq!(bp.id, 2);

        // Same id and location again is idempotent.
        let again = manager
            .create(&mut targets, &explicit, origin("a.f"), true)
            .unwrap();
        assert_eq!(again.id, 2);
        assert!(manager
            .create(&mut targets, &explicit, origin("a.g"), true)
            .is_err());

        let auto = manager
            .create(&mut targets, &Breakpoint::default(), origin("a.g"), true)
            .unwrap();
        assert_eq!(auto.id, 3);

        manager.clear(&mut targets, 3).unwrap();
        let next = manager
            .create(&mut targets, &Breakpoint::default(), origin("a.h"), true)
            .unwrap();
        assert_eq!(next.id, 4);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut targets = TargetRegistry::new();
        let mut manager = BreakpointManager::new(Vec::new(), false);
        let req = Breakpoint {
            name: "first".to_string(),
            ..Default::default()
        };
        let origin = |name: &str| Origin::Expr {
            spec: LocationSpec::parse(name).unwrap(),
            rules: Vec::new(),
        };
        manager.create(&mut targets, &req, origin("a.f"), true).unwrap();
        let err = manager
            .create(&mut targets, &req, origin("a.g"), true)
            .unwrap_err();
        assert!(matches!(err, DebugError::DuplicateBreakpointName(_)));
        assert_eq!(manager.get_by_name("first").unwrap().id, 1);
    }

    #[test]
    fn test_toggle_preserves_amendments() {
        let mut targets = TargetRegistry::new();
        let mut manager = BreakpointManager::new(Vec::new(), false);
        let origin = Origin::Expr {
            spec: LocationSpec::parse("a.f").unwrap(),
            rules: Vec::new(),
        };
        let mut bp = manager
            .create(&mut targets, &Breakpoint::default(), origin, true)
            .unwrap();
        bp.cond = "i == 3".to_string();
        bp.variables = vec!["i".to_string(), "j".to_string()];
        manager.amend(&mut targets, &bp).unwrap();

        let off = manager.toggle(&mut targets, bp.id).unwrap();
        assert!(off.disabled);
        assert!(!off.suspended);
        let on = manager.toggle(&mut targets, bp.id).unwrap();
        assert!(!on.disabled);
        assert!(on.suspended);
        assert_eq!(on.cond, "i == 3");
        assert_eq!(on.variables, vec!["i".to_string(), "j".to_string()]);
    }
}
