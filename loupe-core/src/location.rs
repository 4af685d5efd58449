// Location specifications
//
// Parses user-level location expressions and resolves them into addresses against one
// symbol table. Resolution is deterministic and has no side effects.

use crate::backend::SymbolTable;
use crate::error::{DebugError, DebugResult};
use crate::substitute::{matches_path_suffix, substitute_path, SubstituteRule};
use crate::types::{Function, Location, Variable, VariableKind};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

const SOURCE_EXTENSIONS: &[&str] = &["go", "rs", "c", "cc", "cpp", "h", "hpp", "s"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationSpec {
    Address(u64),
    /// `*expr`, evaluated in the current scope.
    AddressExpr(String),
    Function {
        name: String,
        line_offset: Option<i32>,
    },
    FileLine {
        path: String,
        line: u32,
    },
    Line(u32),
    Offset(i32),
    Regex(String),
}

/// Parse a decimal or `0x` hexadecimal address.
pub fn parse_address(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}

fn is_source_file(base: &str) -> bool {
    let last = base.rsplit(['/', '\\']).next().unwrap_or(base);
    match last.rsplit_once('.') {
        Some((stem, ext)) => !stem.is_empty() && SOURCE_EXTENSIONS.contains(&ext),
        None => false,
    }
}

impl LocationSpec {
    pub fn parse(expr: &str) -> DebugResult<Self> {
        let expr = expr.trim();
        let invalid = || DebugError::InvalidLocation(expr.to_string());
        if expr.is_empty() {
            return Err(invalid());
        }

        if let Some(rest) = expr.strip_prefix('*') {
            if rest.trim().is_empty() {
                return Err(invalid());
            }
            return Ok(match parse_address(rest) {
                Some(addr) => LocationSpec::Address(addr),
                None => LocationSpec::AddressExpr(rest.trim().to_string()),
            });
        }

        if expr.len() >= 2 && expr.starts_with('/') && expr.ends_with('/') {
            let pattern = &expr[1..expr.len() - 1];
            Regex::new(pattern).map_err(|_| invalid())?;
            return Ok(LocationSpec::Regex(pattern.to_string()));
        }

        if let Some(digits) = expr.strip_prefix('+').or_else(|| expr.strip_prefix('-')) {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                let n: i32 = digits.parse().map_err(|_| invalid())?;
                return Ok(LocationSpec::Offset(if expr.starts_with('-') { -n } else { n }));
            }
        }

        if expr.bytes().all(|b| b.is_ascii_digit()) {
            let line: u32 = expr.parse().map_err(|_| invalid())?;
            if line == 0 {
                return Err(invalid());
            }
            return Ok(LocationSpec::Line(line));
        }

        let (base, line) = match expr.rsplit_once(':') {
            Some((base, line)) => match line.parse::<i32>() {
                Ok(n) => (base, Some(n)),
                Err(_) => (expr, None),
            },
            None => (expr, None),
        };
        if base.is_empty() {
            return Err(invalid());
        }

        if is_source_file(base) {
            match line {
                Some(n) if n > 0 => Ok(LocationSpec::FileLine {
                    path: base.to_string(),
                    line: n as u32,
                }),
                _ => Err(invalid()),
            }
        } else {
            Ok(LocationSpec::Function {
                name: base.to_string(),
                line_offset: line,
            })
        }
    }

    /// Relative specs depend on the current stop location.
    pub fn is_relative(&self) -> bool {
        matches!(
            self,
            LocationSpec::Line(_) | LocationSpec::Offset(_) | LocationSpec::AddressExpr(_)
        )
    }

    /// Address specs bind to one target; everything else is shared across targets.
    pub fn is_address(&self) -> bool {
        matches!(self, LocationSpec::Address(_))
    }
}

impl fmt::Display for LocationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationSpec::Address(addr) => write!(f, "*{:#x}", addr),
            LocationSpec::AddressExpr(expr) => write!(f, "*{}", expr),
            LocationSpec::Function {
                name,
                line_offset: Some(n),
            } => write!(f, "{}:{}", name, n),
            LocationSpec::Function { name, .. } => write!(f, "{}", name),
            LocationSpec::FileLine { path, line } => write!(f, "{}:{}", path, line),
            LocationSpec::Line(n) => write!(f, "{}", n),
            LocationSpec::Offset(n) if *n >= 0 => write!(f, "+{}", n),
            LocationSpec::Offset(n) => write!(f, "{}", n),
            LocationSpec::Regex(re) => write!(f, "/{}/", re),
        }
    }
}

/// Remove generic type parameter lists: `pkg.Box[int].Get` -> `pkg.Box.Get`.
pub fn strip_generics(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut depth = 0usize;
    for c in name.chars() {
        match c {
            '[' => depth += 1,
            ']' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum NameMatch {
    Partial,
    Exact,
}

/// Exact spellings first, then spellings that only match partially.
fn name_forms(name: &str) -> (Vec<String>, Vec<String>) {
    let plain = strip_generics(name);
    let mut exact = vec![plain.clone()];
    let mut partial = Vec::new();

    let pkg_start = plain.rfind('/').map(|i| i + 1).unwrap_or(0);
    let dot = match plain[pkg_start..].find('.') {
        Some(d) => pkg_start + d,
        None => return (exact, partial),
    };
    let pkg = &plain[..dot];
    let rest = &plain[dot + 1..];

    if let Some((recv, method)) = rest.rsplit_once('.') {
        let bare = recv
            .strip_prefix("(*")
            .and_then(|r| r.strip_suffix(')'))
            .unwrap_or(recv);
        for form in [
            format!("{}.{}.{}", pkg, bare, method),
            format!("{}.(*{}).{}", pkg, bare, method),
        ] {
            if !exact.contains(&form) {
                exact.push(form);
            }
        }
        partial.push(format!("{}.{}", pkg, method));
    }
    (exact, partial)
}

fn boundary_suffix(form: &str, pattern: &str) -> bool {
    if pattern.starts_with('/') {
        return format!("/{}", form).ends_with(pattern);
    }
    if !form.ends_with(pattern) || form.len() == pattern.len() {
        return false;
    }
    matches!(
        form.as_bytes()[form.len() - pattern.len() - 1],
        b'.' | b'/'
    )
}

fn match_function_name(pattern: &str, name: &str) -> Option<NameMatch> {
    let pattern = strip_generics(pattern);
    let (exact, partial) = name_forms(name);
    if exact.iter().any(|form| *form == pattern) {
        return Some(NameMatch::Exact);
    }
    let suffix_hit = exact
        .iter()
        .chain(partial.iter())
        .any(|form| *form == pattern || boundary_suffix(form, &pattern));
    suffix_hit.then_some(NameMatch::Partial)
}

/// First statement after the function prologue.
pub fn after_prologue(symbols: &dyn SymbolTable, function: &Function) -> u64 {
    symbols
        .line_table(function)
        .iter()
        .find(|entry| entry.is_stmt && entry.pc > function.entry)
        .map(|entry| entry.pc)
        .unwrap_or(function.entry)
}

/// Describe the source position of `pc`.
pub fn location_for_pc(symbols: &dyn SymbolTable, pc: u64) -> Location {
    let mut loc = Location {
        pc,
        pcs: vec![pc],
        ..Default::default()
    };
    if let Some(entry) = symbols.line_at(pc) {
        loc.file = entry.file;
        loc.line = entry.line;
    }
    loc.function = symbols.function_at(pc).map(|f| f.name);
    loc
}

pub type EvalFn<'a> = dyn Fn(&str) -> DebugResult<Variable> + 'a;

/// Resolution context for one target.
pub struct Resolver<'a> {
    symbols: &'a dyn SymbolTable,
    rules: &'a [SubstituteRule],
    case_insensitive: bool,
    current: Option<(String, u32)>,
    include_non_exec: bool,
    eval: Option<&'a EvalFn<'a>>,
}

impl<'a> Resolver<'a> {
    pub fn new(symbols: &'a dyn SymbolTable) -> Self {
        Self {
            symbols,
            rules: &[],
            case_insensitive: false,
            current: None,
            include_non_exec: false,
            eval: None,
        }
    }

    pub fn with_rules(mut self, rules: &'a [SubstituteRule], case_insensitive: bool) -> Self {
        self.rules = rules;
        self.case_insensitive = case_insensitive;
        self
    }

    /// File and line the selected thread is stopped at.
    pub fn with_current(mut self, file: impl Into<String>, line: u32) -> Self {
        self.current = Some((file.into(), line));
        self
    }

    pub fn with_non_exec_lines(mut self, include: bool) -> Self {
        self.include_non_exec = include;
        self
    }

    pub fn with_eval(mut self, eval: &'a EvalFn<'a>) -> Self {
        self.eval = Some(eval);
        self
    }

    pub fn resolve(&self, spec: &LocationSpec) -> DebugResult<Vec<Location>> {
        match spec {
            LocationSpec::Address(addr) => Ok(vec![location_for_pc(self.symbols, *addr)]),
            LocationSpec::AddressExpr(expr) => self.resolve_address_expr(spec, expr),
            LocationSpec::Function { name, line_offset } => {
                let group = self.find_function(spec, name)?;
                Ok(vec![self.function_location(spec, &group, *line_offset)?])
            }
            LocationSpec::FileLine { path, line } => {
                let file = self.find_file(spec, path)?;
                Ok(vec![self.line_location(spec, &file, *line)?])
            }
            LocationSpec::Line(line) => {
                let (file, _) = self.current.as_ref().ok_or(DebugError::NoCurrentLocation)?;
                Ok(vec![self.line_location(spec, file, *line)?])
            }
            LocationSpec::Offset(delta) => {
                let (file, line) = self.current.as_ref().ok_or(DebugError::NoCurrentLocation)?;
                let target = *line as i64 + *delta as i64;
                if target <= 0 {
                    return Err(DebugError::LocationNotFound(spec.to_string()));
                }
                Ok(vec![self.line_location(spec, file, target as u32)?])
            }
            LocationSpec::Regex(pattern) => self.resolve_regex(spec, pattern),
        }
    }

    /// Resolve and require exactly one location.
    pub fn resolve_one(&self, spec: &LocationSpec) -> DebugResult<Location> {
        let mut locs = self.resolve(spec)?;
        if locs.len() > 1 {
            return Err(DebugError::AmbiguousLocation {
                spec: spec.to_string(),
                candidates: locs
                    .iter()
                    .map(|l| l.function.clone().unwrap_or_else(|| format!("{:#x}", l.pc)))
                    .collect(),
            });
        }
        locs.pop()
            .ok_or_else(|| DebugError::LocationNotFound(spec.to_string()))
    }

    fn groups(&self) -> BTreeMap<String, Vec<Function>> {
        let mut groups: BTreeMap<String, Vec<Function>> = BTreeMap::new();
        for f in self.symbols.functions() {
            groups
                .entry(strip_generics(f.identity()))
                .or_default()
                .push(f);
        }
        groups
    }

    fn find_function(&self, spec: &LocationSpec, name: &str) -> DebugResult<Vec<Function>> {
        let mut exact = Vec::new();
        let mut partial = Vec::new();
        for (identity, group) in self.groups() {
            let best = group
                .iter()
                .filter_map(|f| match_function_name(name, &f.name))
                .chain(match_function_name(name, &identity))
                .max();
            match best {
                Some(NameMatch::Exact) => exact.push((identity, group)),
                Some(NameMatch::Partial) => partial.push((identity, group)),
                None => {}
            }
        }

        let mut chosen = if exact.is_empty() { partial } else { exact };
        match chosen.len() {
            0 => Err(DebugError::LocationNotFound(spec.to_string())),
            1 => Ok(chosen.remove(0).1),
            _ => Err(DebugError::AmbiguousLocation {
                spec: spec.to_string(),
                candidates: chosen.into_iter().map(|(identity, _)| identity).collect(),
            }),
        }
    }

    fn function_location(
        &self,
        spec: &LocationSpec,
        group: &[Function],
        line_offset: Option<i32>,
    ) -> DebugResult<Location> {
        let mut pcs = Vec::new();
        let mut first: Option<(u64, String, u32)> = None;
        for f in group {
            let pc = match line_offset {
                Some(offset) if offset > 0 => {
                    let line = f.line + offset as u32;
                    self.symbols
                        .line_table(f)
                        .into_iter()
                        .filter(|e| e.is_stmt && e.line == line && e.file == f.file)
                        .map(|e| e.pc)
                        .min()
                }
                _ => Some(after_prologue(self.symbols, f)),
            };
            if let Some(pc) = pc {
                pcs.push(pc);
                if first.as_ref().map_or(true, |(p, _, _)| pc < *p) {
                    let line = self.symbols.line_at(pc).map(|e| e.line).unwrap_or(f.line);
                    first = Some((pc, f.file.clone(), line));
                }
            }
        }

        let (pc, file, line) = first.ok_or_else(|| DebugError::LocationNotFound(spec.to_string()))?;
        pcs.sort_unstable();
        Ok(Location {
            pc,
            file,
            line,
            function: group.first().map(|f| strip_generics(f.identity())),
            pcs,
            pc_pids: Vec::new(),
        })
    }

    fn find_file(&self, spec: &LocationSpec, path: &str) -> DebugResult<String> {
        let ci = self.case_insensitive;
        let mut matches: Vec<(String, bool)> = Vec::new();
        for source in self.symbols.sources() {
            let shown = substitute_path(&source, self.rules, ci);
            if matches_path_suffix(&shown, path, ci) || matches_path_suffix(&source, path, ci) {
                let exact = shown == path || source == path;
                matches.push((source, exact));
            }
        }
        if matches.iter().any(|(_, exact)| *exact) {
            matches.retain(|(_, exact)| *exact);
        }
        matches.dedup_by(|a, b| a.0 == b.0);
        match matches.len() {
            0 => Err(DebugError::LocationNotFound(spec.to_string())),
            1 => Ok(matches.remove(0).0),
            _ => Err(DebugError::AmbiguousLocation {
                spec: spec.to_string(),
                candidates: matches.into_iter().map(|(source, _)| source).collect(),
            }),
        }
    }

    fn line_location(&self, spec: &LocationSpec, file: &str, line: u32) -> DebugResult<Location> {
        let mut pcs = Vec::new();
        let mut function = None;
        for f in self.symbols.functions() {
            let pc = self
                .symbols
                .line_table(&f)
                .into_iter()
                .filter(|e| e.is_stmt && e.line == line && e.file == file)
                .map(|e| e.pc)
                .min();
            if let Some(pc) = pc {
                pcs.push(pc);
                if function.is_none() {
                    function = Some(strip_generics(f.identity()));
                }
            }
        }

        if pcs.is_empty() {
            if self.include_non_exec {
                return Ok(Location {
                    file: file.to_string(),
                    line,
                    ..Default::default()
                });
            }
            return Err(DebugError::LocationNotFound(spec.to_string()));
        }
        pcs.sort_unstable();
        Ok(Location {
            pc: pcs[0],
            file: file.to_string(),
            line,
            function,
            pcs,
            pc_pids: Vec::new(),
        })
    }

    fn resolve_regex(&self, spec: &LocationSpec, pattern: &str) -> DebugResult<Vec<Location>> {
        let re = Regex::new(pattern).map_err(|_| DebugError::InvalidLocation(spec.to_string()))?;
        let mut out = Vec::new();
        for (identity, group) in self.groups() {
            if re.is_match(&identity) || group.iter().any(|f| re.is_match(&f.name)) {
                out.push(self.function_location(spec, &group, None)?);
            }
        }
        if out.is_empty() {
            return Err(DebugError::LocationNotFound(spec.to_string()));
        }
        Ok(out)
    }

    fn resolve_address_expr(&self, spec: &LocationSpec, expr: &str) -> DebugResult<Vec<Location>> {
        let eval = self.eval.ok_or(DebugError::NoCurrentLocation)?;
        let value = eval(expr)?;
        if value.kind == VariableKind::Func {
            let name = LocationSpec::Function {
                name: value.value.clone(),
                line_offset: None,
            };
            let group = self.find_function(&name, &value.value)?;
            return Ok(vec![self.function_location(spec, &group, None)?]);
        }
        let addr = parse_address(&value.value)
            .ok_or_else(|| DebugError::InvalidLocation(spec.to_string()))?;
        Ok(vec![location_for_pc(self.symbols, addr)])
    }
}
