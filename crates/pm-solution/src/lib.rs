//! Solution/Build orchestration.
//!
//! A [`Solution`] holds one build configuration — target OS, architecture,
//! libraries-type, configuration type, compiler family — together with the
//! targets registered into it and the tool registry they're built with. A
//! [`Build`] owns several solutions (one per requested configuration
//! combination) plus the loaded plug-in modules that populate them, and
//! drives the three orchestration entry points every plug-in may
//! implement: `check`, `build`, `configure`.
//!
//! Toolchain auto-detection is out of scope here, same as in `pm-toolchain`:
//! a [`Solution`] is handed an already-populated [`ToolRegistry`], it never
//! goes looking for a compiler itself.

use pm_checks::{Checker, ProbeOutcome};
use pm_command::{Command, CommandBuilder};
use pm_fingerprint::FingerprintDb;
use pm_plan::{ExecutionSummary, FailureBound, Plan};
use pm_plugin::{Module, ModuleStore};
use pm_target::{resolve_targets, ConfigurationType, Target, TargetKind};
use pm_toolchain::{PlatformTriple, ToolRegistry};
use rayon::prelude::*;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SolutionError {
    #[error(transparent)]
    Target(#[from] pm_target::TargetError),
    #[error(transparent)]
    Checks(#[from] pm_checks::ChecksError),
    #[error(transparent)]
    Plan(#[from] pm_plan::PlanError),
    #[error(transparent)]
    Command(#[from] pm_command::CommandError),
    #[error(transparent)]
    Plugin(#[from] pm_plugin::PluginError),
    #[error("no toolchain configured for solution {0:?}")]
    NoToolchain(String),
    #[error("target {0:?} has no output path after preparation")]
    MissingOutput(String),
}

/// The four axes that make two builds of the same sources distinct
/// artifacts: target triple, libraries-type, configuration type, and
/// compiler family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SolutionKey {
    pub triple: String,
    pub libraries: LibrariesType,
    pub configuration: ConfigurationName,
    pub compiler: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LibrariesType {
    Static,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigurationName {
    Debug,
    Release,
    MinSizeRel,
    RelWithDebInfo,
}

impl ConfigurationName {
    pub fn as_target_configuration(&self) -> ConfigurationType {
        match self {
            ConfigurationName::Debug => ConfigurationType::Debug,
            ConfigurationName::Release => ConfigurationType::Release,
            ConfigurationName::MinSizeRel => ConfigurationType::MinSizeRel,
            ConfigurationName::RelWithDebInfo => ConfigurationType::RelWithDebInfo,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConfigurationName::Debug => "debug",
            ConfigurationName::Release => "release",
            ConfigurationName::MinSizeRel => "minsizerel",
            ConfigurationName::RelWithDebInfo => "relwithdebinfo",
        }
    }
}

impl SolutionKey {
    /// A filesystem/cache-safe name for this configuration, used as the
    /// `<config>` component of `etc/<config>/checks.3.txt`.
    pub fn config_name(&self) -> String {
        format!("{}-{}-{:?}-{}", self.triple, self.configuration.name(), self.libraries, self.compiler)
    }
}

impl std::fmt::Debug for LibrariesType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", if matches!(self, LibrariesType::Static) { "static" } else { "shared" })
    }
}

/// Lifecycle events a callback may subscribe to during [`Build::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetEvent {
    /// Fired once per target right after pass 1 (dependencies bound).
    DependenciesBound,
    /// Fired once per target right after pass 3 (options merged, defaults applied).
    OptionsMerged,
    /// Fired once per target right after pass 6 (outputs finalized).
    Finalized,
}

/// A filter selecting which targets a callback fires for: either every
/// target in the solution or only those whose name matches exactly.
#[derive(Debug, Clone)]
pub enum TargetFilter {
    All,
    Named(String),
}

impl TargetFilter {
    fn matches(&self, target: &Target) -> bool {
        match self {
            TargetFilter::All => true,
            TargetFilter::Named(name) => &target.name == name,
        }
    }
}

type EventCallback = Box<dyn Fn(&Target) + Send + Sync>;

/// One build configuration: its targets, the toolchain they're built with,
/// and the check engine scoped to it.
pub struct Solution {
    pub key: SolutionKey,
    pub triple: PlatformTriple,
    pub tools: ToolRegistry,
    pub targets: HashMap<String, Target>,
    checker: Checker,
    callbacks: Vec<(TargetFilter, TargetEvent, EventCallback)>,
    rsp_dir: PathBuf,
    obj_root: PathBuf,
}

impl Solution {
    pub fn new(key: SolutionKey, triple: PlatformTriple, tools: ToolRegistry, checks_cache: PathBuf, manual_checks_cache: PathBuf, obj_root: PathBuf) -> Self {
        let rsp_dir = obj_root.join("rsp");
        Self {
            key,
            triple,
            tools,
            targets: HashMap::new(),
            checker: Checker::new(checks_cache, manual_checks_cache),
            callbacks: Vec::new(),
            rsp_dir,
            obj_root,
        }
    }

    pub fn add_target(&mut self, target: Target) {
        self.targets.insert(target.name.clone(), target);
    }

    /// Register an event callback. Callbacks subscribe to
    /// `(target filter) × (event type)` and run during preparation
    /// transitions.
    pub fn on(&mut self, filter: TargetFilter, event: TargetEvent, callback: impl Fn(&Target) + Send + Sync + 'static) {
        self.callbacks.push((filter, event, Box::new(callback)));
    }

    fn fire(&self, event: TargetEvent, target: &Target) {
        for (filter, ev, callback) in &self.callbacks {
            if *ev == event && filter.matches(target) {
                callback(target);
            }
        }
    }

    pub fn checker_mut(&mut self) -> &mut Checker {
        &mut self.checker
    }

    /// Run every check accumulated into this solution's checker. The probe
    /// callback compiles (and, for run-checks, executes) one
    /// probe program; this method owns only the scheduling, same
    /// separation the checker itself documents.
    pub fn perform_checks<F>(&mut self, probe: F) -> Result<(), SolutionError>
    where
        F: FnMut(&pm_checks::Check) -> Result<ProbeOutcome, String>,
    {
        self.checker.load_cache()?;
        self.checker.run(self.triple.target_shell(), probe)?;
        Ok(())
    }

    /// Run the six-pass target resolution to a fixed point: adding targets
    /// during preparation (a generated-source target discovered mid-pass)
    /// re-triggers the whole pass sequence until the target count stops
    /// growing. Preparation is re-entrant: adding new targets during
    /// prepare triggers another wave until fixed-point.
    pub fn prepare(&mut self) -> Result<(), SolutionError> {
        loop {
            let before = self.targets.len();
            resolve_targets(&mut self.targets)?;

            for target in self.targets.values() {
                self.fire(TargetEvent::DependenciesBound, target);
                self.fire(TargetEvent::OptionsMerged, target);
                self.fire(TargetEvent::Finalized, target);
            }

            if self.targets.len() == before {
                break;
            }
        }
        Ok(())
    }

    /// Lower every target's sources into [`Command`]s via the solution's
    /// tool registry, one compile command per source file
    /// plus a final link/archive command per target.
    pub fn build_commands(&self) -> Result<Vec<Command>, SolutionError> {
        let mut commands = Vec::new();
        for target in self.targets.values() {
            let target_obj_dir = self.obj_root.join(&target.name);
            let mut object_ids = Vec::new();

            for source in &target.sources {
                let ext = source.extension().and_then(|e| e.to_str()).unwrap_or("");
                let tool = self.tools.for_extension(ext).map_err(|_| SolutionError::NoToolchain(target.name.clone()))?;
                let object = target_obj_dir.join(source.file_stem().unwrap_or_default()).with_extension("o");
                let id = format!("compile:{}:{}", target.name, source.display());

                let command = CommandBuilder::build_compile_command(
                    id.clone(),
                    &tool,
                    source,
                    &object,
                    &self.obj_root,
                    &target.effective.include_dirs,
                    &target.effective.definitions,
                    &target.effective.compile_options,
                )?;
                object_ids.push(id);
                commands.push(command);
            }

            self.build_link_command(target, &mut commands, &object_ids)?;
        }
        Ok(commands)
    }

    fn build_link_command(&self, target: &Target, commands: &mut Vec<Command>, object_ids: &[String]) -> Result<Option<String>, SolutionError> {
        if target.object_files.is_empty() && object_ids.is_empty() {
            return Ok(None);
        }
        let linker_ext = match target.kind {
            TargetKind::StaticLibrary => "a-archive",
            _ => "o-link",
        };
        let Ok(tool) = self.tools.for_extension(linker_ext) else {
            // No linker registered for this kind; caller consumes objects
            // directly (e.g. a header-only interface target).
            return Ok(None);
        };

        let id = format!("link:{}", target.name);
        let mut command = Command::new(id.clone(), pm_command::CommandKind::from_tool_kind(tool.kind()), tool.program(), &self.obj_root);
        for lib_dir in &target.effective.link_directories {
            command.push_literal(format!("-L{}", lib_dir.display()));
        }
        for lib in &target.effective.link_libraries {
            command.push_literal(format!("-l{lib}"));
        }
        if let Some(output) = &target.output_path {
            command.push_literal("-o");
            command.push_literal(output.display().to_string());
            command.outputs.push(output.clone());
        }
        command.dependency_ids = object_ids.to_vec();
        for dep_id in object_ids {
            if let Some(obj_cmd) = commands.iter().find(|c| &c.id == dep_id) {
                command.inputs.extend(obj_cmd.outputs.iter().cloned());
            }
        }

        let args = command.resolve_args();
        if pm_command::needs_response_file(&args) {
            let hash = command.hash();
            let rsp_path = pm_command::response_file(&self.rsp_dir, &hash, &args)?;
            command.args.clear();
            command.push_literal(format!("@{}", rsp_path.display()));
        }

        commands.push(command);
        Ok(Some(id))
    }
}

/// An owner of several [`Solution`]s and the plug-in modules that populate
/// them.
pub struct Build {
    pub solutions: Vec<Solution>,
    modules: ModuleStore,
    loaded: Vec<Arc<Module>>,
}

impl Build {
    pub fn new() -> Self {
        Self { solutions: Vec::new(), modules: ModuleStore::new(), loaded: Vec::new() }
    }

    pub fn add_solution(&mut self, solution: Solution) {
        self.solutions.push(solution);
    }

    /// Load a build-description plug-in and call its required
    /// `configure`/`build` and optional `check` entry points against every
    /// solution in turn.
    ///
    /// # Safety
    /// `path` must name a shared library implementing the ABI documented
    /// on [`pm_plugin::Module`].
    pub unsafe fn load_plugin(&mut self, path: impl Into<PathBuf>) -> Result<(), SolutionError> {
        let module = unsafe { self.modules.get_or_load(path) }?;
        self.loaded.push(Arc::clone(&module));

        for solution in &mut self.solutions {
            let ctx = solution as *mut Solution as *mut c_void;
            unsafe { module.call_configure(ctx) }?;
            unsafe { module.call_build(ctx) }?;
            unsafe { module.call_check(ctx) }?;
        }
        Ok(())
    }

    /// Runs checks across all solutions in parallel. `probe` is keyed by
    /// [`SolutionKey`] rather than the solution itself so each worker
    /// thread only ever needs a `&mut` borrow of its own solution.
    pub fn perform_checks<F>(&mut self, probe: F) -> Result<(), SolutionError>
    where
        F: Fn(&SolutionKey, &pm_checks::Check) -> Result<ProbeOutcome, String> + Sync,
    {
        let errors: Mutex<Vec<SolutionError>> = Mutex::new(Vec::new());
        // Each solution owns its own checker; splitting the slice and
        // handing each chunk to its own thread needs no extra
        // synchronization beyond the key being `Clone`.
        self.solutions.par_iter_mut().for_each(|solution| {
            let key = solution.key.clone();
            let result = solution.perform_checks(|check| probe(&key, check));
            if let Err(e) = result {
                errors.lock().unwrap().push(e);
            }
        });
        let mut errors = errors.into_inner().unwrap();
        match errors.pop() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs `prepare()` across solutions in parallel, and across targets
    /// within a solution in multiple waves.
    pub fn prepare(&mut self) -> Result<(), SolutionError> {
        let errors: Mutex<Vec<SolutionError>> = Mutex::new(Vec::new());
        self.solutions.par_iter_mut().for_each(|solution| {
            if let Err(e) = solution.prepare() {
                errors.lock().unwrap().push(e);
            }
        });
        let mut errors = errors.into_inner().unwrap();
        match errors.pop() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs each solution's plan. Each solution's commands are lowered,
    /// built into a [`Plan`], and executed against a
    /// per-solution [`FingerprintDb`] for staleness; `run` is the injected
    /// process-spawn callback (actually invoking `program`/`args`/`env`),
    /// kept out of this crate the same way `pm-checks` and `pm-resolver`
    /// keep I/O injected.
    pub fn execute<F>(&self, jobs: usize, bound: FailureBound, fingerprints: Option<&FingerprintDb>, run: F) -> Result<Vec<ExecutionSummary>, SolutionError>
    where
        F: Fn(&Command) -> Result<(), String> + Sync,
    {
        let mut summaries = Vec::new();
        for solution in &self.solutions {
            let commands = solution.build_commands()?;
            let plan = Plan::build(commands)?;
            summaries.push(plan.execute(jobs, bound, fingerprints, &run));
        }
        Ok(summaries)
    }
}

impl Default for Build {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_target::{OptionBundle, OptionScope};
    use pm_toolchain::{Language, Tool, ToolKind};
    use pm_types::PackagePath;
    use tempfile::TempDir;

    fn triple() -> PlatformTriple {
        PlatformTriple::new("x86_64", "unknown", "linux").with_env("gnu")
    }

    fn solution(tmp: &TempDir) -> Solution {
        let key = SolutionKey {
            triple: "x86_64-unknown-linux-gnu".into(),
            libraries: LibrariesType::Static,
            configuration: ConfigurationName::Debug,
            compiler: "gnu".into(),
        };
        let mut tools = ToolRegistry::new();
        tools.register("c", Tool::new("/usr/bin/cc", ToolKind::Gnu, Language::C));
        Solution::new(
            key,
            triple(),
            tools,
            tmp.path().join("checks.txt"),
            tmp.path().join("checks.manual.txt"),
            tmp.path().join("obj"),
        )
    }

    #[test]
    fn config_name_is_stable_and_descriptive() {
        let tmp = TempDir::new().unwrap();
        let solution = solution(&tmp);
        let name = solution.key.config_name();
        assert!(name.contains("debug"));
        assert!(name.contains("static"));
    }

    #[test]
    fn prepare_reaches_fixed_point_with_no_dependencies() {
        let tmp = TempDir::new().unwrap();
        let mut solution = solution(&tmp);
        let path = PackagePath::parse("org.acme.widgets").unwrap();
        let target = Target::new("widgets", path, TargetKind::StaticLibrary, Language::C)
            .with_scoped(OptionScope::Public, OptionBundle::default());
        solution.add_target(target);

        solution.prepare().unwrap();
        assert_eq!(solution.targets.len(), 1);
    }

    #[test]
    fn build_commands_emits_one_compile_command_per_source() {
        let tmp = TempDir::new().unwrap();
        let mut solution = solution(&tmp);
        let path = PackagePath::parse("org.acme.widgets").unwrap();
        let mut target = Target::new("widgets", path, TargetKind::StaticLibrary, Language::C);
        target.sources.push(PathBuf::from("src/a.c"));
        target.sources.push(PathBuf::from("src/b.c"));
        solution.add_target(target);
        solution.prepare().unwrap();

        let commands = solution.build_commands().unwrap();
        assert_eq!(commands.iter().filter(|c| c.id.starts_with("compile:")).count(), 2);
    }

    #[test]
    fn event_callback_fires_for_matching_target_only() {
        let tmp = TempDir::new().unwrap();
        let mut solution = solution(&tmp);
        let path = PackagePath::parse("org.acme.widgets").unwrap();
        solution.add_target(Target::new("widgets", path.clone(), TargetKind::StaticLibrary, Language::C));
        solution.add_target(Target::new("gizmos", path, TargetKind::StaticLibrary, Language::C));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        solution.on(TargetFilter::Named("widgets".into()), TargetEvent::Finalized, move |t| {
            seen_clone.lock().unwrap().push(t.name.clone());
        });

        solution.prepare().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["widgets".to_string()]);
    }

    #[test]
    fn build_owns_multiple_solutions() {
        let tmp = TempDir::new().unwrap();
        let mut build = Build::new();
        build.add_solution(solution(&tmp));
        build.add_solution(solution(&tmp));
        assert_eq!(build.solutions.len(), 2);

        build.prepare().unwrap();
    }
}
