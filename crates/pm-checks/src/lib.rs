//! Compile/link/run feature-detection probes.
//!
//! A [`Check`] is a single yes/no (or integer-valued) question about the
//! target toolchain — "does `<stdatomic.h>` exist", "does this link", "what
//! does running this program print" — identified by the hash of its probe
//! source plus parameters, never by name, so two targets asking the same
//! question share one cached answer.
//!
//! The pipeline run by [`Checker::run`] accumulates every check a solution's
//! targets requested, deduplicates by hash, gathers each check's own
//! dependencies (a run-check often first needs a link-check to succeed),
//! loads whatever the persisted cache already answered, builds a
//! dependency-ordered plan, executes what's left, persists the cache, and
//! distributes results back to callers as a `definition -> value` map so a
//! target can turn a resolved check straight into a `-D` flag.

mod cache;

use blake3::Hasher;
use pm_toolchain::{Language, PlatformTriple, TargetShell};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChecksError {
    #[error("check dependency cycle detected among: {0:?}")]
    DependencyCycle(Vec<String>),
    #[error("check {0} depends on unknown check {1}")]
    UnknownDependency(String, String),
    #[error("cache I/O failed: {0}")]
    Cache(#[from] std::io::Error),
    #[error("probe execution failed for check {hash}: {reason}")]
    ProbeFailed { hash: String, reason: String },
}

/// What kind of probe a [`Check`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    /// A named function exists and is callable.
    FunctionExists,
    /// A header can be `#include`d.
    IncludeExists,
    /// `sizeof(type)`, captured as the run's exit code/stdout value.
    TypeSize,
    /// `alignof(type)` (or the struct-padding trick when unsupported).
    TypeAlignment,
    /// A symbol resolves at link time without being called.
    SymbolExists,
    /// A declaration (macro, typedef, or prototype) is visible.
    DeclarationExists,
    /// A struct/union has a named member.
    StructMemberExists,
    /// A library exports a named function (link-only, no header needed).
    LibraryFunctionExists,
    /// Arbitrary source compiles for the target language/toolchain.
    SourceCompiles,
    /// Arbitrary source compiles *and* links.
    SourceLinks,
    /// Arbitrary source compiles, links, and runs to completion; the
    /// integer result is the captured exit code or stdout-parsed value.
    SourceRuns,
    /// Caller-defined probe outside the closed set above.
    Custom,
}

/// How far a [`CheckKind`]'s probe must be carried to produce its result —
/// the dimension `pm_cli::probe::run_probe` actually branches on. Several
/// kinds share a stage (e.g. `SymbolExists` and `LibraryFunctionExists` are
/// both link-only), but the kind itself survives into `distribute` so a
/// target can tell *why* it asked, not just how the probe was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStage {
    Compile,
    Link,
    Run,
}

impl CheckKind {
    pub fn stage(self) -> ProbeStage {
        match self {
            CheckKind::IncludeExists | CheckKind::DeclarationExists | CheckKind::SourceCompiles => ProbeStage::Compile,
            CheckKind::FunctionExists | CheckKind::SymbolExists | CheckKind::StructMemberExists | CheckKind::LibraryFunctionExists | CheckKind::SourceLinks => {
                ProbeStage::Link
            }
            CheckKind::TypeSize | CheckKind::TypeAlignment | CheckKind::SourceRuns | CheckKind::Custom => ProbeStage::Run,
        }
    }
}

/// Parameters distinguishing two otherwise-identical probe sources: which
/// language/toolchain/target triple they're asked under. Two checks with
/// the same `data` but different params are different checks, hence the
/// params feed the hash alongside the source text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckParams {
    pub language: Language,
    pub target: String,
}

impl CheckParams {
    pub fn new(language: Language, target: impl Into<String>) -> Self {
        Self { language, target: target.into() }
    }
}

/// A single feature-detection probe.
#[derive(Debug, Clone)]
pub struct Check {
    pub kind: CheckKind,
    pub data: String,
    pub params: CheckParams,
    /// Hashes of checks that must resolve (and, for `Runs`, resolve
    /// truthily) before this one may execute.
    pub dependencies: Vec<String>,
    /// Description surfaced in manual-check sidecars and plan diagnostics.
    pub description: String,
    /// Preprocessor definitions this check emits once it resolves. Unioned
    /// with any other check sharing this one's hash when `CheckSet::add`
    /// deduplicates them, per the check engine's "definitions accumulate"
    /// rule.
    pub definitions: BTreeSet<String>,
    /// Prefixes applied to every definition name when rendering them (e.g.
    /// `HAVE_`); also unioned on dedup, and crossed with `definitions` to
    /// produce the names `Checker::distribute` emits.
    pub prefix: BTreeSet<String>,
    /// Emit the definition when the check's value is zero rather than when
    /// it's truthy — the `DefineIfZero` flag from the check's output model.
    pub define_if_zero: bool,
}

impl Check {
    pub fn new(kind: CheckKind, data: impl Into<String>, params: CheckParams) -> Self {
        let data = data.into();
        Self {
            description: format!("{kind:?} probe ({} bytes)", data.len()),
            kind,
            data,
            params,
            dependencies: Vec::new(),
            definitions: BTreeSet::new(),
            prefix: BTreeSet::new(),
            define_if_zero: false,
        }
    }

    pub fn depending_on(mut self, hashes: impl IntoIterator<Item = String>) -> Self {
        self.dependencies.extend(hashes);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare a preprocessor definition this check emits once resolved.
    pub fn defining(mut self, definition: impl Into<String>) -> Self {
        self.definitions.insert(definition.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix.insert(prefix.into());
        self
    }

    pub fn define_if_zero(mut self) -> Self {
        self.define_if_zero = true;
        self
    }

    /// The concrete names `Checker::distribute` will key by: every
    /// definition, crossed with every prefix (or left bare if no prefix was
    /// declared).
    pub fn definition_names(&self) -> Vec<String> {
        if self.prefix.is_empty() {
            self.definitions.iter().cloned().collect()
        } else {
            self.prefix
                .iter()
                .flat_map(|p| self.definitions.iter().map(move |d| format!("{p}{d}")))
                .collect()
        }
    }

    /// Union another check's definitions/prefixes into this one. Used by
    /// `CheckSet::add` when two checks dedupe to the same hash but were
    /// built (e.g. by different targets) asking for different macro names.
    fn merge_definitions(&mut self, other: &Check) {
        self.definitions.extend(other.definitions.iter().cloned());
        self.prefix.extend(other.prefix.iter().cloned());
    }

    /// Content hash identifying this check, domain-separated the same way
    /// `pm_types::PackageId::hash` separates its own namespace so the two
    /// hash spaces never collide if ever compared or logged side by side.
    /// Definitions/prefix/`DefineIfZero` are deliberately excluded: they're
    /// the *output* two differently-named requests for the same underlying
    /// probe agree to union, not part of the probe's identity.
    pub fn hash(&self) -> String {
        let mut hasher = Hasher::new_derive_key("pm-checks check v1");
        hasher.update(&[self.kind as u8]);
        hasher.update(self.data.as_bytes());
        hasher.update(&[self.params.language as u8]);
        hasher.update(self.params.target.as_bytes());
        let mut deps = self.dependencies.clone();
        deps.sort();
        for dep in &deps {
            hasher.update(dep.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Standard headers a `TypeSize`/`TypeAlignment` probe includes to discover
/// a type, each depended on by its own `IncludeExists` check — step 3's
/// "a `type-size` check depends on `include-exists` for each of a standard
/// header list".
const STANDARD_TYPE_HEADERS: &[&str] = &["stdint.h", "stddef.h", "sys/types.h"];

impl Check {
    pub fn include_exists(header: &str, params: CheckParams) -> Self {
        let data = format!("#include <{header}>\nint main(void) {{ return 0; }}\n");
        Check::new(CheckKind::IncludeExists, data, params)
            .with_description(format!("`{header}` exists"))
            .with_prefix("HAVE_")
            .defining(header.replace(['/', '.'], "_").to_uppercase())
    }

    pub fn function_exists(name: &str, params: CheckParams) -> Self {
        let data = format!("char {name}(void);\nint main(void) {{ return ((long)&{name}) != 0; }}\n");
        Check::new(CheckKind::FunctionExists, data, params)
            .with_description(format!("function `{name}` exists"))
            .with_prefix("HAVE_")
            .defining(name.to_uppercase())
    }

    pub fn symbol_exists(name: &str, params: CheckParams) -> Self {
        let data = format!("extern void *{name};\nint main(void) {{ return &{name} != (void *)0; }}\n");
        Check::new(CheckKind::SymbolExists, data, params)
            .with_description(format!("symbol `{name}` exists"))
            .with_prefix("HAVE_")
            .defining(name.to_uppercase())
    }

    pub fn declaration_exists(name: &str, header: &str, params: CheckParams) -> Self {
        let data = format!("#include <{header}>\nint main(void) {{ (void)sizeof({name}); return 0; }}\n");
        Check::new(CheckKind::DeclarationExists, data, params)
            .with_description(format!("`{name}` is declared"))
            .with_prefix("HAVE_DECL_")
            .defining(name.to_uppercase())
    }

    pub fn struct_member_exists(struct_name: &str, member: &str, header: &str, params: CheckParams) -> Self {
        let data = format!("#include <{header}>\nint main(void) {{ struct {struct_name} s; (void)sizeof(s.{member}); return 0; }}\n");
        Check::new(CheckKind::StructMemberExists, data, params)
            .with_description(format!("`struct {struct_name}::{member}` exists"))
            .with_prefix("HAVE_")
            .defining(format!("{struct_name}_{member}").to_uppercase())
    }

    pub fn library_function_exists(name: &str, params: CheckParams) -> Self {
        let data = format!("extern char {name}(void);\nint main(void) {{ {name}(); return 0; }}\n");
        Check::new(CheckKind::LibraryFunctionExists, data, params)
            .with_description(format!("library function `{name}` exists"))
            .with_prefix("HAVE_")
            .defining(name.to_uppercase())
    }

    pub fn source_compiles(data: impl Into<String>, params: CheckParams) -> Self {
        Check::new(CheckKind::SourceCompiles, data, params)
    }

    pub fn source_links(data: impl Into<String>, params: CheckParams) -> Self {
        Check::new(CheckKind::SourceLinks, data, params)
    }

    pub fn source_runs(data: impl Into<String>, params: CheckParams) -> Self {
        Check::new(CheckKind::SourceRuns, data, params)
    }

    /// Build a `TypeSize` check for `type_name` plus the `IncludeExists`
    /// checks it depends on to discover it. Callers add every returned
    /// check to the same [`CheckSet`] — `CheckSet::add_type_size` does this
    /// for the common case.
    pub fn type_size(type_name: &str, params: CheckParams) -> (Self, Vec<Check>) {
        let headers: Vec<Check> = STANDARD_TYPE_HEADERS.iter().map(|h| Check::include_exists(h, params.clone())).collect();
        let deps: Vec<String> = headers.iter().map(Check::hash).collect();
        let data = format!("{}\nint main(void) {{ return (int)sizeof({type_name}); }}\n", include_standard_headers());
        let check = Check::new(CheckKind::TypeSize, data, params)
            .depending_on(deps)
            .with_description(format!("size of `{type_name}`"))
            .with_prefix("SIZEOF_")
            .defining(type_name.replace(' ', "_").to_uppercase());
        (check, headers)
    }

    /// As [`Check::type_size`], but for `alignof`.
    pub fn type_alignment(type_name: &str, params: CheckParams) -> (Self, Vec<Check>) {
        let headers: Vec<Check> = STANDARD_TYPE_HEADERS.iter().map(|h| Check::include_exists(h, params.clone())).collect();
        let deps: Vec<String> = headers.iter().map(Check::hash).collect();
        let data = format!(
            "{}\nstruct pm_align_probe {{ char c; {type_name} t; }};\nint main(void) {{ return (int)offsetof(struct pm_align_probe, t); }}\n",
            include_standard_headers()
        );
        let check = Check::new(CheckKind::TypeAlignment, data, params)
            .depending_on(deps)
            .with_description(format!("alignment of `{type_name}`"))
            .with_prefix("ALIGNOF_")
            .defining(type_name.replace(' ', "_").to_uppercase());
        (check, headers)
    }
}

fn include_standard_headers() -> String {
    STANDARD_TYPE_HEADERS.iter().map(|h| format!("#include <{h}>\n")).collect()
}

/// Outcome of running (or recalling from cache) a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// Boolean-shaped result for `Compiles`/`Links`, or a captured integer
    /// for `Runs`.
    Value(i32),
    /// Deferred to a manual, target-side run (cross-compilation case).
    Manual,
}

impl CheckResult {
    pub fn truthy(&self) -> bool {
        matches!(self, CheckResult::Value(v) if *v != 0)
    }
}

/// A set of checks requested together, e.g. by one target's preparation
/// pass. Automatically carries an endianness probe, deduplicated against
/// any target-specific one with identical parameters, so targets never
/// need to ask for it explicitly, and two targets sharing a triple share
/// the one cached answer rather than each re-deriving their own.
#[derive(Debug, Clone)]
pub struct CheckSet {
    checks: BTreeMap<String, Check>,
}

impl CheckSet {
    pub fn new(target: &PlatformTriple) -> Self {
        let mut set = Self { checks: BTreeMap::new() };
        set.add(endianness_check(target));
        set
    }

    /// Add a check, deduplicated by hash. A duplicate's definitions and
    /// prefixes union into the representative already queued under that
    /// hash rather than being dropped — property 3's dedup invariant.
    pub fn add(&mut self, check: Check) -> String {
        let hash = check.hash();
        match self.checks.get_mut(&hash) {
            Some(existing) => existing.merge_definitions(&check),
            None => {
                self.checks.insert(hash.clone(), check);
            }
        }
        hash
    }

    /// Add a `TypeSize` check and its standard-header dependencies in one
    /// call, returning the main check's hash.
    pub fn add_type_size(&mut self, type_name: &str, params: CheckParams) -> String {
        let (check, headers) = Check::type_size(type_name, params);
        for header in headers {
            self.add(header);
        }
        self.add(check)
    }

    /// As [`Self::add_type_size`], but for `TypeAlignment`.
    pub fn add_type_alignment(&mut self, type_name: &str, params: CheckParams) -> String {
        let (check, headers) = Check::type_alignment(type_name, params);
        for header in headers {
            self.add(header);
        }
        self.add(check)
    }

    pub fn checks(&self) -> impl Iterator<Item = &Check> {
        self.checks.values()
    }

    pub fn get(&self, hash: &str) -> Option<&Check> {
        self.checks.get(hash)
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

/// The built-in endianness probe every [`CheckSet`] carries. Identical
/// parameters for two targets on the same triple hash identically and thus
/// dedupe away inside `Checker::accumulate`, matching the source behavior
/// being preserved rather than "fixed" per the design notes.
fn endianness_check(target: &PlatformTriple) -> Check {
    // `u.c[0]` is 1 on little-endian (the `1` initializer lands in the
    // first byte) and 0 on big-endian, so `WORDS_BIGENDIAN` is defined when
    // the probe's exit code comes back *zero* — `define_if_zero` inverts
    // the usual truthy-gate for exactly this probe.
    Check::source_runs(
        "int main(void) { union { int i; char c[sizeof(int)]; } u = {1}; return u.c[0]; }",
        CheckParams::new(Language::C, target.to_string()),
    )
    .with_description("target endianness probe")
    .defining("WORDS_BIGENDIAN")
    .define_if_zero()
}

/// Accumulates, plans, executes, and persists [`Check`]s across solutions.
pub struct Checker {
    cache_path: PathBuf,
    manual_path: PathBuf,
    pending: BTreeMap<String, Check>,
    resolved: HashMap<String, CheckResult>,
}

impl Checker {
    pub fn new(cache_path: impl Into<PathBuf>, manual_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: cache_path.into(),
            manual_path: manual_path.into(),
            pending: BTreeMap::new(),
            resolved: HashMap::new(),
        }
    }

    /// Step 1/2: accumulate a set's checks, deduplicated by hash against
    /// anything already queued.
    pub fn accumulate(&mut self, set: &CheckSet) {
        for check in set.checks() {
            self.pending.entry(check.hash()).or_insert_with(|| check.clone());
        }
    }

    /// Step 3: verify every declared dependency hash is itself a known
    /// check, surfacing a clear error instead of silently skipping it at
    /// execution time.
    fn gather_dependencies(&self) -> Result<(), ChecksError> {
        for check in self.pending.values() {
            for dep in &check.dependencies {
                if !self.pending.contains_key(dep) && !self.resolved.contains_key(dep) {
                    return Err(ChecksError::UnknownDependency(check.hash(), dep.clone()));
                }
            }
        }
        Ok(())
    }

    /// Step 4: load the persisted cache file, folding hits straight into
    /// `resolved` so Step 6 never re-executes them.
    pub fn load_cache(&mut self) -> Result<(), ChecksError> {
        let values = cache::load(&self.cache_path)?;
        for (hash, value) in values {
            self.resolved.insert(hash, CheckResult::Value(value));
        }
        let manual = cache::load_manual(&self.manual_path)?;
        for hash in manual {
            self.resolved.entry(hash).or_insert(CheckResult::Manual);
        }
        Ok(())
    }

    /// Step 5: build the dependency-ordered execution plan for whatever
    /// isn't already resolved, erroring with the offending hashes if the
    /// dependency graph has a cycle rather than looping forever.
    fn plan(&self) -> Result<Vec<String>, ChecksError> {
        let unresolved: Vec<&String> =
            self.pending.keys().filter(|h| !self.resolved.contains_key(*h)).collect();

        let mut graph = DiGraph::<String, ()>::new();
        let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
        for hash in &unresolved {
            let idx = graph.add_node((*hash).clone());
            nodes.insert((*hash).clone(), idx);
        }
        for hash in &unresolved {
            let check = &self.pending[*hash];
            for dep in &check.dependencies {
                if let Some(&dep_idx) = nodes.get(dep) {
                    graph.add_edge(dep_idx, nodes[*hash], ());
                }
            }
        }

        match toposort(&graph, None) {
            Ok(order) => Ok(order.into_iter().map(|idx| graph[idx].clone()).collect()),
            Err(cycle) => {
                let cycle_hash = graph[cycle.node_id()].clone();
                Err(ChecksError::DependencyCycle(vec![cycle_hash]))
            }
        }
    }

    /// Steps 6-7: execute the plan via the injected probe runner, then
    /// persist everything resolved this run. The runner is closure-injected
    /// — rather than this crate depending on `pm-command`/`pm-toolchain`'s
    /// process-spawning directly — so `pm-solution` can own the actual
    /// subprocess wiring while this crate stays a pure scheduling/caching
    /// layer, the same separation `pm-resolver::resolve_install_verify`
    /// uses for fetching.
    pub fn run<F>(&mut self, target_shell: TargetShell, mut probe: F) -> Result<(), ChecksError>
    where
        F: FnMut(&Check) -> Result<ProbeOutcome, String>,
    {
        self.gather_dependencies()?;
        let order = self.plan()?;

        let mut manual_pending = Vec::new();
        for hash in order {
            let check = self.pending[&hash].clone();
            match probe(&check) {
                Ok(ProbeOutcome::Value(v)) => {
                    self.resolved.insert(hash, CheckResult::Value(v));
                }
                Ok(ProbeOutcome::RequiresManualRun) => {
                    self.resolved.insert(hash.clone(), CheckResult::Manual);
                    manual_pending.push(hash);
                }
                Err(reason) => return Err(ChecksError::ProbeFailed { hash, reason }),
            }
        }

        if !manual_pending.is_empty() {
            cache::append_manual(&self.manual_path, &manual_pending)?;
            // Manual checks are staged as a run-script rendered for the
            // *target* shell, never the host shell.
            let _ = target_shell.script_extension();
        }

        self.persist()
    }

    fn persist(&self) -> Result<(), ChecksError> {
        let values: HashMap<String, i32> = self
            .resolved
            .iter()
            .filter_map(|(hash, result)| match result {
                CheckResult::Value(v) => Some((hash.clone(), *v)),
                CheckResult::Manual => None,
            })
            .collect();
        cache::save(&self.cache_path, &values)?;
        Ok(())
    }

    /// Step 8: finalize a set's `definition -> value` map from its check
    /// list, for consumption by targets as `-D` flags. Only checks that
    /// resolved to an actual `Value` (not a still-pending `Manual` probe)
    /// and whose gate condition holds (truthy, or falsy under
    /// `define_if_zero`) contribute; a check declaring no definitions
    /// (e.g. the plain link/run gates other checks depend on) contributes
    /// nothing.
    pub fn distribute(&self, set: &CheckSet) -> HashMap<String, CheckResult> {
        let mut out = HashMap::new();
        for check in set.checks() {
            let Some(CheckResult::Value(value)) = self.resolved.get(&check.hash()) else { continue };
            let emit = if check.define_if_zero { *value == 0 } else { *value != 0 };
            if !emit {
                continue;
            }
            for name in check.definition_names() {
                out.insert(name, CheckResult::Value(*value));
            }
        }
        out
    }

    pub fn result(&self, hash: &str) -> Option<CheckResult> {
        self.resolved.get(hash).copied()
    }

    /// Render the dependency graph as Graphviz for diagnostics when a
    /// dependency cycle is discovered, matching the execution plan's own
    /// cycle-diagnostic convention.
    pub fn dependency_graph_dot(&self) -> String {
        let mut seen = HashSet::new();
        let mut lines = vec!["digraph checks {".to_string()];
        for check in self.pending.values() {
            let hash = check.hash();
            if seen.insert(hash.clone()) {
                lines.push(format!("  \"{hash}\" [label=\"{:?}\"];", check.kind));
            }
            for dep in &check.dependencies {
                lines.push(format!("  \"{dep}\" -> \"{hash}\";"));
            }
        }
        lines.push("}".to_string());
        lines.join("\n")
    }
}

/// What a closure-injected probe runner reports back for one [`Check`].
pub enum ProbeOutcome {
    Value(i32),
    /// The host can't execute this target's binaries (cross-compilation);
    /// defer to the manual sidecar instead of failing the run.
    RequiresManualRun,
}

/// Render the target-side script a deferred manual check should be run
/// with, in the shell the *target* platform understands.
pub fn render_manual_script(check: &Check, shell: TargetShell, probe_binary: &Path) -> String {
    let exe = probe_binary.display();
    match shell {
        TargetShell::Posix => format!("#!/bin/sh\n{exe}\n{}\n", shell.render_exit_code_check("?")),
        TargetShell::Cmd => format!("@echo off\r\n{exe}\r\n{}\r\n", shell.render_exit_code_check("ERRORLEVEL")),
        TargetShell::PowerShell => format!("& '{exe}'\n{}\n", shell.render_exit_code_check("LASTEXITCODE")),
    }
    .replace("{description}", &check.description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn triple() -> PlatformTriple {
        PlatformTriple::new("x86_64", "unknown", "linux").with_env("gnu")
    }

    #[test]
    fn identical_probes_with_same_params_hash_equal() {
        let a = Check::new(CheckKind::SourceCompiles, "int main(){}", CheckParams::new(Language::C, "x"));
        let b = Check::new(CheckKind::SourceCompiles, "int main(){}", CheckParams::new(Language::C, "x"));
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn different_target_param_changes_hash() {
        let a = Check::new(CheckKind::SourceCompiles, "int main(){}", CheckParams::new(Language::C, "x"));
        let b = Check::new(CheckKind::SourceCompiles, "int main(){}", CheckParams::new(Language::C, "y"));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn check_set_always_carries_one_endianness_check() {
        let set = CheckSet::new(&triple());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn two_targets_on_same_triple_dedupe_endianness_check() {
        let mut checker = Checker::new("/tmp/does-not-exist-checks.txt", "/tmp/does-not-exist-manual.txt");
        checker.accumulate(&CheckSet::new(&triple()));
        checker.accumulate(&CheckSet::new(&triple()));
        assert_eq!(checker.pending.len(), 1);
    }

    #[test]
    fn plan_orders_dependents_after_dependencies() {
        let base = Check::new(CheckKind::SourceCompiles, "a", CheckParams::new(Language::C, "x"));
        let base_hash = base.hash();
        let dependent =
            Check::new(CheckKind::SourceLinks, "b", CheckParams::new(Language::C, "x")).depending_on([base_hash.clone()]);

        let mut checker = Checker::new("/tmp/plan-cache.txt", "/tmp/plan-manual.txt");
        checker.pending.insert(base_hash.clone(), base);
        checker.pending.insert(dependent.hash(), dependent.clone());

        let order = checker.plan().unwrap();
        let base_pos = order.iter().position(|h| h == &base_hash).unwrap();
        let dep_pos = order.iter().position(|h| h == &dependent.hash()).unwrap();
        assert!(base_pos < dep_pos);
    }

    #[test]
    fn cyclic_dependency_is_rejected() {
        let a = Check::new(CheckKind::SourceCompiles, "a", CheckParams::new(Language::C, "x"));
        let mut b = Check::new(CheckKind::SourceCompiles, "b", CheckParams::new(Language::C, "x"));
        b = b.depending_on([a.hash()]);
        let a_with_cycle = a.clone().depending_on([b.hash()]);

        let mut checker = Checker::new("/tmp/cycle-cache.txt", "/tmp/cycle-manual.txt");
        checker.pending.insert(a_with_cycle.hash(), a_with_cycle);
        checker.pending.insert(b.hash(), b);

        assert!(matches!(checker.plan(), Err(ChecksError::DependencyCycle(_))));
    }

    #[test]
    fn run_persists_resolved_values_to_cache_file() {
        let tmp = TempDir::new().unwrap();
        let cache_path = tmp.path().join("checks.3.txt");
        let manual_path = tmp.path().join("checks.3.manual.txt");

        let mut checker = Checker::new(&cache_path, &manual_path);
        let mut set = CheckSet::new(&triple());
        let probe_hash = set.add(Check::new(CheckKind::SourceCompiles, "int main(){}", CheckParams::new(Language::C, "x")));
        checker.accumulate(&set);

        checker.run(TargetShell::Posix, |_check| Ok(ProbeOutcome::Value(1))).unwrap();

        assert!(checker.result(&probe_hash).unwrap().truthy());
        assert!(cache_path.exists());

        let mut reloaded = Checker::new(&cache_path, &manual_path);
        reloaded.load_cache().unwrap();
        assert!(reloaded.result(&probe_hash).unwrap().truthy());
    }

    #[test]
    fn run_defers_unrunnable_probe_to_manual_sidecar() {
        let tmp = TempDir::new().unwrap();
        let cache_path = tmp.path().join("checks.3.txt");
        let manual_path = tmp.path().join("checks.3.manual.txt");

        let mut checker = Checker::new(&cache_path, &manual_path);
        let mut set = CheckSet::new(&triple());
        let probe_hash = set.add(Check::new(CheckKind::SourceRuns, "int main(){return 1;}", CheckParams::new(Language::C, "arm64")));
        checker.accumulate(&set);

        checker.run(TargetShell::Posix, |_check| Ok(ProbeOutcome::RequiresManualRun)).unwrap();

        assert_eq!(checker.result(&probe_hash), Some(CheckResult::Manual));
        assert!(manual_path.exists());
    }

    #[test]
    fn distribute_keys_by_definition_not_hash() {
        let tmp = TempDir::new().unwrap();
        let checker = {
            let mut checker = Checker::new(tmp.path().join("a.txt"), tmp.path().join("a.manual.txt"));
            let mut set = CheckSet::new(&triple());
            // No `defining(...)` on this one: it gates other checks but
            // never itself produces a `-D` flag.
            set.add(Check::new(CheckKind::SourceCompiles, "x", CheckParams::new(Language::C, "x")));
            checker.accumulate(&set);
            // The target is big-endian (probe exit code 0) for every check,
            // including the auto-added endianness probe.
            checker.run(TargetShell::Posix, |_| Ok(ProbeOutcome::Value(0))).unwrap();
            checker
        };

        let other_set = CheckSet::new(&triple());
        let distributed = checker.distribute(&other_set);
        assert_eq!(distributed.len(), 1);
        assert_eq!(distributed.get("WORDS_BIGENDIAN"), Some(&CheckResult::Value(0)));
    }

    #[test]
    fn distribute_omits_definitions_whose_gate_condition_fails() {
        let tmp = TempDir::new().unwrap();
        let mut checker = Checker::new(tmp.path().join("a.txt"), tmp.path().join("a.manual.txt"));
        let mut set = CheckSet::new(&triple());
        set.add(Check::function_exists("getrandom", CheckParams::new(Language::C, "x")));
        checker.accumulate(&set);
        // Every probe (including the auto endianness one) fails to link,
        // so `HAVE_GETRANDOM` (truthy-gated) must not be emitted.
        checker.run(TargetShell::Posix, |_| Ok(ProbeOutcome::Value(0))).unwrap();

        let distributed = checker.distribute(&set);
        assert!(!distributed.contains_key("HAVE_GETRANDOM"));
    }

    #[test]
    fn duplicate_checks_union_definitions_on_dedup() {
        let mut set = CheckSet::new(&triple());
        let a = Check::new(CheckKind::IncludeExists, "x", CheckParams::new(Language::C, "t")).defining("FOO");
        let b = Check::new(CheckKind::IncludeExists, "x", CheckParams::new(Language::C, "t")).defining("BAR");
        let hash_a = set.add(a);
        let hash_b = set.add(b);
        assert_eq!(hash_a, hash_b);

        let merged = set.get(&hash_a).unwrap();
        assert!(merged.definitions.contains("FOO"));
        assert!(merged.definitions.contains("BAR"));
    }

    #[test]
    fn type_size_depends_on_standard_header_checks() {
        let params = CheckParams::new(Language::C, "x");
        let mut set = CheckSet::new(&triple());
        let hash = set.add_type_size("size_t", params.clone());

        let check = set.get(&hash).unwrap();
        assert_eq!(check.dependencies.len(), STANDARD_TYPE_HEADERS.len());
        for dep in &check.dependencies {
            assert!(set.get(dep).is_some(), "header dependency {dep} must itself be queued");
        }
    }

    #[test]
    fn type_size_check_emits_sizeof_definition() {
        let tmp = TempDir::new().unwrap();
        let mut checker = Checker::new(tmp.path().join("a.txt"), tmp.path().join("a.manual.txt"));
        let mut set = CheckSet::new(&triple());
        let hash = set.add_type_size("int", CheckParams::new(Language::C, "x"));
        checker.accumulate(&set);
        checker.run(TargetShell::Posix, move |check| if check.hash() == hash { Ok(ProbeOutcome::Value(4)) } else { Ok(ProbeOutcome::Value(1)) }).unwrap();

        let distributed = checker.distribute(&set);
        assert_eq!(distributed.get("SIZEOF_INT"), Some(&CheckResult::Value(4)));
    }
}
