//! PubGrub `DependencyProvider` wiring: turns [`PackageProvider`] lookups
//! (version lists + dependency edges) into a coherent resolved graph that
//! satisfies every requirer's constraint on every package path.

use crate::error::ResolveError;
use crate::hints::{ChoiceReason, LockfileHints, ResolutionTrace};
use crate::package::{Dependency, PmPackage};
use pm_types::{PackagePath, Version, VersionRange};
use pubgrub::{Dependencies, DependencyProvider, Map, PackageResolutionStatistics, VersionSet};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Display};

/// Supplies version and dependency information to the resolver. Implemented
/// once against a prefetched, purely in-memory snapshot (pubgrub itself runs
/// synchronously) so the async index/network lookups happen before
/// resolution starts, not during it.
pub trait PackageProvider: Send + Sync {
    fn available_versions(&self, path: &PackagePath) -> Result<Vec<Version>, ResolveError>;
    fn dependencies(&self, path: &PackagePath, version: &Version) -> Result<Vec<Dependency>, ResolveError>;
}

/// A version range plus the source text it was parsed from, so equality
/// (required by `VersionSet`) doesn't need `VersionRange` itself to be
/// comparable.
#[derive(Debug, Clone)]
pub struct PmVersionSet {
    spec: Option<String>,
    range: Option<VersionRange>,
    negated: bool,
}

impl PartialEq for PmVersionSet {
    fn eq(&self, other: &Self) -> bool {
        self.spec == other.spec && self.negated == other.negated
    }
}
impl Eq for PmVersionSet {}

impl PmVersionSet {
    pub fn any() -> Self {
        Self {
            spec: None,
            range: None,
            negated: false,
        }
    }

    pub fn from_range(spec: impl Into<String>, range: VersionRange) -> Self {
        Self {
            spec: Some(spec.into()),
            range: Some(range),
            negated: false,
        }
    }

    pub fn exact(version: Version) -> Self {
        let spec = version.to_string();
        Self {
            range: Some(VersionRange::exact(version)),
            spec: Some(spec),
            negated: false,
        }
    }

    fn is_empty_set(&self) -> bool {
        self.negated && self.spec.is_none()
    }

    fn is_full_set(&self) -> bool {
        !self.negated && self.spec.is_none()
    }
}

impl VersionSet for PmVersionSet {
    type V = Version;

    fn empty() -> Self {
        Self {
            spec: None,
            range: None,
            negated: true,
        }
    }

    fn singleton(v: Self::V) -> Self {
        PmVersionSet::exact(v)
    }

    fn complement(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            range: self.range.clone(),
            negated: !self.negated,
        }
    }

    fn intersection(&self, other: &Self) -> Self {
        if self.is_empty_set() || other.is_empty_set() {
            return Self::empty();
        }
        if self.is_full_set() {
            return other.clone();
        }
        if other.is_full_set() {
            return self.clone();
        }
        if !self.negated && !other.negated {
            // Conservative: keep the narrower-looking spec rather than
            // computing a true interval intersection.
            self.clone()
        } else if self.negated {
            other.clone()
        } else {
            self.clone()
        }
    }

    fn contains(&self, v: &Self::V) -> bool {
        if v.is_any() {
            return true;
        }
        let matches = match &self.range {
            Some(range) => range.contains(v),
            None => true,
        };
        if self.negated {
            !matches
        } else {
            matches
        }
    }

    fn full() -> Self {
        PmVersionSet::any()
    }

    fn union(&self, other: &Self) -> Self {
        if self.is_full_set() || other.is_full_set() {
            return Self::full();
        }
        if self.is_empty_set() {
            return other.clone();
        }
        if other.is_empty_set() {
            return self.clone();
        }
        Self::full()
    }

    fn is_disjoint(&self, other: &Self) -> bool {
        self.is_empty_set() || other.is_empty_set()
    }

    fn subset_of(&self, other: &Self) -> bool {
        if self.is_empty_set() {
            return true;
        }
        if other.is_full_set() {
            return true;
        }
        self == other
    }
}

impl Display for PmVersionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "not ")?;
        }
        match &self.spec {
            Some(s) => write!(f, "{s}"),
            None => write!(f, "*"),
        }
    }
}

/// Selection strategy for otherwise-unconstrained choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionStrategy {
    #[default]
    Highest,
    Lowest,
}

pub struct PmDependencyProvider<'a, P: PackageProvider> {
    provider: &'a P,
    root_dependencies: Vec<Dependency>,
    overrides: HashMap<String, VersionRange>,
    constraints: HashMap<String, VersionRange>,
    hints: LockfileHints,
    strategy: ResolutionStrategy,
    trace: RefCell<ResolutionTrace>,
    version_cache: RefCell<HashMap<String, Vec<Version>>>,
}

impl<'a, P: PackageProvider> PmDependencyProvider<'a, P> {
    pub fn new(provider: &'a P, root_dependencies: Vec<Dependency>) -> Self {
        Self {
            provider,
            root_dependencies,
            overrides: HashMap::new(),
            constraints: HashMap::new(),
            hints: LockfileHints::new(),
            strategy: ResolutionStrategy::Highest,
            trace: RefCell::new(ResolutionTrace::new()),
            version_cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn with_overrides(mut self, overrides: HashMap<String, VersionRange>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_hints(mut self, hints: LockfileHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn trace(&self) -> std::cell::Ref<'_, ResolutionTrace> {
        self.trace.borrow()
    }

    fn get_versions(&self, key: &str, path: &PackagePath) -> Result<Vec<Version>, ResolveError> {
        {
            let cache = self.version_cache.borrow();
            if let Some(versions) = cache.get(key) {
                return Ok(versions.clone());
            }
        }
        let versions = self.provider.available_versions(path)?;
        self.version_cache.borrow_mut().insert(key.to_string(), versions.clone());
        Ok(versions)
    }
}

impl<'a, P: PackageProvider> DependencyProvider for PmDependencyProvider<'a, P> {
    type P = PmPackage;
    type V = Version;
    type VS = PmVersionSet;
    type M = String;
    type Err = ResolveError;
    type Priority = u32;

    fn prioritize(&self, package: &Self::P, _range: &Self::VS, _stats: &PackageResolutionStatistics) -> Self::Priority {
        match package {
            PmPackage::Root => 0,
            PmPackage::Named(path) => {
                let key = path.lowercase_joined();
                if self.overrides.contains_key(&key) {
                    1
                } else {
                    match self.get_versions(&key, path) {
                        Ok(versions) => (100 + versions.len()) as u32,
                        Err(_) => 1000,
                    }
                }
            }
        }
    }

    fn choose_version(&self, package: &Self::P, range: &Self::VS) -> Result<Option<Self::V>, Self::Err> {
        match package {
            PmPackage::Root => Ok(Some(Version::new(0, 0, 0))),
            PmPackage::Named(path) => {
                let key = path.lowercase_joined();

                if let Some(override_range) = self.overrides.get(&key) {
                    let versions = self.get_versions(&key, path)?;
                    if let Some(version) = versions.into_iter().filter(|v| override_range.contains(v)).max() {
                        self.trace.borrow_mut().record_choice(&key, &version, ChoiceReason::Override);
                        return Ok(Some(version));
                    }
                }

                let versions = self.get_versions(&key, path)?;
                let matching: Vec<Version> = versions.into_iter().filter(|v| range.contains(v)).collect();

                if let Some(locked) = self.hints.preferred_version(&key) {
                    if matching.iter().any(|v| v == locked) {
                        self.trace.borrow_mut().record_choice(&key, locked, ChoiceReason::LockedHint);
                        return Ok(Some(locked.clone()));
                    }
                }

                let chosen = match self.strategy {
                    ResolutionStrategy::Highest => matching.into_iter().max(),
                    ResolutionStrategy::Lowest => matching.into_iter().min(),
                };

                if let Some(ref version) = chosen {
                    let reason = match self.strategy {
                        ResolutionStrategy::Highest => ChoiceReason::HighestCompatible,
                        ResolutionStrategy::Lowest => ChoiceReason::LowestCompatible,
                    };
                    self.trace.borrow_mut().record_choice(&key, version, reason);
                }

                Ok(chosen)
            }
        }
    }

    fn get_dependencies(&self, package: &Self::P, version: &Self::V) -> Result<Dependencies<Self::P, Self::VS, Self::M>, Self::Err> {
        match package {
            PmPackage::Root => {
                let mut deps = Map::default();
                for dep in &self.root_dependencies {
                    let pkg = PmPackage::named(dep.path.clone());
                    let range = PmVersionSet::from_range(format!("{:?}", dep.range), dep.range.clone());
                    deps.insert(pkg, range);
                }
                Ok(Dependencies::Available(deps))
            }
            PmPackage::Named(path) => {
                let deps = self.provider.dependencies(path, version)?;
                let mut pubgrub_deps = Map::default();
                for dep in deps {
                    let key = dep.path.lowercase_joined();
                    self.trace.borrow_mut().record_requirement(&key, &path.lowercase_joined());

                    let pkg = PmPackage::named(dep.path.clone());
                    let mut range = PmVersionSet::from_range(format!("{:?}", dep.range), dep.range.clone());

                    if let Some(constraint) = self.constraints.get(&key) {
                        let constraint_set = PmVersionSet::from_range(format!("{constraint:?}"), constraint.clone());
                        range = range.intersection(&constraint_set);
                    }

                    pubgrub_deps.insert(pkg, range);
                }
                Ok(Dependencies::Available(pubgrub_deps))
            }
        }
    }
}

/// In-memory provider for tests and for pre-populated prefetch snapshots.
#[derive(Default)]
pub struct MemoryProvider {
    packages: HashMap<String, Vec<(Version, Vec<Dependency>)>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_package(&mut self, path: PackagePath, version: Version, deps: Vec<Dependency>) {
        self.packages.entry(path.lowercase_joined()).or_default().push((version, deps));
    }
}

impl PackageProvider for MemoryProvider {
    fn available_versions(&self, path: &PackagePath) -> Result<Vec<Version>, ResolveError> {
        self.packages
            .get(&path.lowercase_joined())
            .map(|versions| versions.iter().map(|(v, _)| v.clone()).collect())
            .ok_or_else(|| ResolveError::PackageNotFound(path.to_string()))
    }

    fn dependencies(&self, path: &PackagePath, version: &Version) -> Result<Vec<Dependency>, ResolveError> {
        self.packages
            .get(&path.lowercase_joined())
            .and_then(|versions| versions.iter().find(|(v, _)| v == version).map(|(_, deps)| deps.clone()))
            .ok_or_else(|| ResolveError::PackageNotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_provider_lists_versions() {
        let mut provider = MemoryProvider::new();
        let path = PackagePath::parse("org.log").unwrap();
        provider.add_package(path.clone(), Version::new(1, 5, 4), vec![]);
        provider.add_package(path.clone(), Version::new(1, 4, 0), vec![]);
        assert_eq!(provider.available_versions(&path).unwrap().len(), 2);
    }

    #[test]
    fn version_set_contains_respects_range() {
        let range = VersionRange::parse("^1.4.0").unwrap();
        let set = PmVersionSet::from_range("^1.4.0", range);
        assert!(set.contains(&Version::new(1, 5, 0)));
        assert!(!set.contains(&Version::new(2, 0, 0)));
    }
}
