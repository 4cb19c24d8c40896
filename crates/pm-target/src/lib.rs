//! Targets (executables, static/shared libraries) and the scoped option
//! bundles (include directories, definitions, compile options, link
//! libraries/directories) that flow between them.
//!
//! Four visibility scopes:
//! - `Private`: visible only to the declaring target.
//! - `Protected`: visible to the declaring target and sibling targets that
//!   share its package-path prefix.
//! - `Public`: visible to the declaring target and every consumer.
//! - `Interface`: visible only to consumers, never used to build the
//!   declaring target itself (a header-only or umbrella target's own
//!   compile step ignores it).
//!
//! [`resolve::resolve_targets`] runs the six-pass resolution over a whole
//! target graph; see that module for the pass-by-pass behavior.

mod resolve;

pub use resolve::resolve_targets;

use pm_toolchain::Language;
use pm_types::PackagePath;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("target {0:?} depends on unbound target {1:?}")]
    UnboundDependency(String, String),
    #[error("option inheritance did not reach a fixed point after {0} passes")]
    FloodFillDidNotConverge(usize),
    #[error("target {0:?} has an empty effective option set after execution, which is a programming error")]
    EmptyAfterExecution(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionScope {
    Private,
    Protected,
    Public,
    Interface,
}

impl OptionScope {
    pub const ALL: [OptionScope; 4] =
        [OptionScope::Private, OptionScope::Protected, OptionScope::Public, OptionScope::Interface];
}

/// One scope's worth of compiler/linker options. Plain data merged by
/// [`OptionBundle::merge_from`] rather than any scope-aware logic living on
/// the bundle itself — scope decisions belong to the flood-fill, not to the
/// bundle type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionBundle {
    pub include_dirs: Vec<PathBuf>,
    pub definitions: Vec<String>,
    pub compile_options: Vec<String>,
    pub link_libraries: Vec<String>,
    pub link_directories: Vec<PathBuf>,
}

impl OptionBundle {
    /// Whether this bundle contributes nothing but include directories and
    /// definitions — no compile options or anything link-shaped.
    pub fn is_headers_only(&self) -> bool {
        self.compile_options.is_empty() && self.link_libraries.is_empty() && self.link_directories.is_empty()
    }

    /// Merge `other` in, deduplicating by value. Returns whether anything
    /// actually changed, so callers can drive a fixed-point loop.
    pub fn merge_from(&mut self, other: &OptionBundle) -> bool {
        let mut changed = false;
        changed |= extend_dedup(&mut self.include_dirs, &other.include_dirs);
        changed |= extend_dedup(&mut self.definitions, &other.definitions);
        changed |= extend_dedup(&mut self.compile_options, &other.compile_options);
        changed |= extend_dedup(&mut self.link_libraries, &other.link_libraries);
        changed |= extend_dedup(&mut self.link_directories, &other.link_directories);
        changed
    }
}

fn extend_dedup<T: PartialEq + Clone>(dst: &mut Vec<T>, src: &[T]) -> bool {
    let mut changed = false;
    for item in src {
        if !dst.contains(item) {
            dst.push(item.clone());
            changed = true;
        }
    }
    changed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Executable,
    StaticLibrary,
    SharedLibrary,
}

/// Configuration-type defaults applied during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationType {
    Debug,
    Release,
    MinSizeRel,
    RelWithDebInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeLibrary {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationLevel {
    O0,
    O1,
    O2,
    O3,
    Os,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerSettings {
    pub runtime_library: RuntimeLibrary,
    pub optimization_level: OptimizationLevel,
    pub debug_info: bool,
}

impl ConfigurationType {
    pub fn default_compiler_settings(&self) -> CompilerSettings {
        match self {
            ConfigurationType::Debug => CompilerSettings {
                runtime_library: RuntimeLibrary::Dynamic,
                optimization_level: OptimizationLevel::O0,
                debug_info: true,
            },
            ConfigurationType::Release => CompilerSettings {
                runtime_library: RuntimeLibrary::Dynamic,
                optimization_level: OptimizationLevel::O2,
                debug_info: false,
            },
            ConfigurationType::MinSizeRel => CompilerSettings {
                runtime_library: RuntimeLibrary::Static,
                optimization_level: OptimizationLevel::Os,
                debug_info: false,
            },
            ConfigurationType::RelWithDebInfo => CompilerSettings {
                runtime_library: RuntimeLibrary::Dynamic,
                optimization_level: OptimizationLevel::O2,
                debug_info: true,
            },
        }
    }
}

/// A target's declared dependency on another target, at the scope *this*
/// target consumes it (and, for Public/Interface, re-exports it onward).
#[derive(Debug, Clone)]
pub struct DependencyEdge {
    pub target_name: String,
    pub scope: OptionScope,
}

/// An executable, static library, or shared library produced from a set of
/// source files plus its resolved dependency graph.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub package_path: PackagePath,
    pub kind: TargetKind,
    pub language: Language,
    pub sources: Vec<PathBuf>,
    pub configuration: ConfigurationType,
    /// Whether an explicit export-definitions file should be generated on
    /// platforms that require one for a fully exported shared library
    /// (Pass 6).
    pub export_all_symbols: bool,

    /// This target's own declared bundles, one per scope.
    pub scoped: HashMap<OptionScope, OptionBundle>,
    pub dependency_edges: Vec<DependencyEdge>,

    /// Filled by Pass 2/3: everything needed to compile this target,
    /// including its own Private/Protected/Public bundles plus whatever
    /// was absorbed from dependencies.
    pub effective: OptionBundle,
    /// Filled by Pass 2: what flows on to this target's own consumers
    /// (its Public+Interface bundles, plus re-exported Public contributions
    /// absorbed from dependencies).
    pub exported: OptionBundle,
    /// Per-dependency monotone headers-only flag: `true` until a
    /// non-headers-only contribution is discovered along that edge, after
    /// which it never reverts.
    pub headers_only_edges: HashMap<String, bool>,
    pub compiler_settings: Option<CompilerSettings>,

    /// Pass 4: this target participates in a circular link dependency and
    /// must be built with the alternate "circular linker" command.
    pub circular_linker: bool,
    pub circular_partners: Vec<String>,

    /// Pass 5.
    pub object_files: Vec<PathBuf>,
    pub generated_source_prerequisites: Vec<String>,

    /// Pass 6.
    pub import_library_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub export_definitions_path: Option<PathBuf>,
}

impl Target {
    pub fn new(name: impl Into<String>, package_path: PackagePath, kind: TargetKind, language: Language) -> Self {
        Self {
            name: name.into(),
            package_path,
            kind,
            language,
            sources: Vec::new(),
            configuration: ConfigurationType::Debug,
            export_all_symbols: false,
            scoped: HashMap::new(),
            dependency_edges: Vec::new(),
            effective: OptionBundle::default(),
            exported: OptionBundle::default(),
            headers_only_edges: HashMap::new(),
            compiler_settings: None,
            circular_linker: false,
            circular_partners: Vec::new(),
            object_files: Vec::new(),
            generated_source_prerequisites: Vec::new(),
            import_library_path: None,
            output_path: None,
            export_definitions_path: None,
        }
    }

    pub fn with_scoped(mut self, scope: OptionScope, bundle: OptionBundle) -> Self {
        self.scoped.insert(scope, bundle);
        self
    }

    pub fn with_sources(mut self, sources: impl IntoIterator<Item = PathBuf>) -> Self {
        self.sources.extend(sources);
        self
    }

    pub fn with_configuration(mut self, configuration: ConfigurationType) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn depends_on(mut self, target_name: impl Into<String>, scope: OptionScope) -> Self {
        self.dependency_edges.push(DependencyEdge { target_name: target_name.into(), scope });
        self
    }

    pub fn bundle(&self, scope: OptionScope) -> OptionBundle {
        self.scoped.get(&scope).cloned().unwrap_or_default()
    }

    /// Package-path prefix shared with `other`: both paths minus their
    /// final element match, i.e. they're siblings under the same parent.
    /// This is the "same parent package-path prefix" test Protected
    /// visibility uses.
    pub fn shares_package_prefix(&self, other: &Target) -> bool {
        let a = self.package_path.elements();
        let b = other.package_path.elements();
        if a.len() < 2 || b.len() < 2 {
            return false;
        }
        a[..a.len() - 1] == b[..b.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> PackagePath {
        PackagePath::parse(s).unwrap()
    }

    #[test]
    fn shares_package_prefix_for_siblings_only() {
        let a = Target::new("a", path("org.acme.widgets"), TargetKind::StaticLibrary, Language::C);
        let b = Target::new("b", path("org.acme.gadgets"), TargetKind::StaticLibrary, Language::C);
        let c = Target::new("c", path("org.other.gadgets"), TargetKind::StaticLibrary, Language::C);
        assert!(a.shares_package_prefix(&b));
        assert!(!a.shares_package_prefix(&c));
    }

    #[test]
    fn bundle_merge_dedupes_and_reports_change() {
        let mut bundle = OptionBundle::default();
        bundle.definitions.push("FOO".to_string());
        let mut other = OptionBundle::default();
        other.definitions.push("FOO".to_string());
        other.definitions.push("BAR".to_string());

        assert!(bundle.merge_from(&other));
        assert_eq!(bundle.definitions, vec!["FOO".to_string(), "BAR".to_string()]);
        assert!(!bundle.merge_from(&other));
    }

    #[test]
    fn headers_only_bundle_has_no_link_shaped_content() {
        let mut bundle = OptionBundle::default();
        bundle.include_dirs.push(PathBuf::from("include"));
        assert!(bundle.is_headers_only());
        bundle.link_libraries.push("m".to_string());
        assert!(!bundle.is_headers_only());
    }
}
