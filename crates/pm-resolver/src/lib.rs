//! Dependency resolution and installation orchestration.
//!
//! Two stages, kept deliberately separate because PubGrub's solver is
//! synchronous while the index and source fetchers are not:
//!
//! 1. [`PmDependencyProvider`] runs PubGrub over a prefetched, in-memory
//!    snapshot to pick one version per package path that satisfies every
//!    requirer — this is where version conflicts surface.
//! 2. [`resolve_install_verify`] walks the chosen set against the real
//!    index/store/source stack: local-index lookup with "too young"
//!    remote fallback, per-hash locked install, and hash verification with
//!    one remote retry on local staleness.

mod conflict;
mod error;
mod hints;
mod package;
mod provider;

pub use conflict::ConflictFormatter;
pub use error::{ConflictDerivation, ConflictingRequirement, DerivationStep, ResolutionSuggestion, ResolveError};
pub use hints::{ChoiceReason, LockfileHints, ResolutionTrace};
pub use package::{Dependency, PmPackage};
pub use provider::{MemoryProvider, PackageProvider, PmDependencyProvider, PmVersionSet, ResolutionStrategy};

use pm_index_client::IndexClient;
use pm_registry::{IndexDb, ResolvedEntry};
use pm_store::Store;
use pm_types::{PackageId, PackagePath, Version, VersionRange};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;

/// A resolved dependency graph: one concrete version chosen per package path.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub packages: HashMap<String, Version>,
}

/// Runs PubGrub resolution for a set of root requests against `provider`.
pub struct Resolver<'a, P: PackageProvider> {
    provider: &'a P,
}

impl<'a, P: PackageProvider> Resolver<'a, P> {
    pub fn new(provider: &'a P) -> Self {
        Self { provider }
    }

    /// Resolve `root_dependencies`, returning the chosen version for every
    /// package path reachable from them.
    pub fn resolve(&self, root_dependencies: Vec<Dependency>) -> Result<Resolution, ResolveError> {
        self.resolve_with(root_dependencies, LockfileHints::new(), ResolutionStrategy::Highest)
    }

    pub fn resolve_with(&self, root_dependencies: Vec<Dependency>, hints: LockfileHints, strategy: ResolutionStrategy) -> Result<Resolution, ResolveError> {
        let dependency_provider = PmDependencyProvider::new(self.provider, root_dependencies).with_hints(hints).with_strategy(strategy);

        let selected = pubgrub::resolve(&dependency_provider, PmPackage::Root, Version::new(0, 0, 0)).map_err(|e| ResolveError::NoSolution {
            message: e.to_string(),
            derivation: ConflictDerivation::new(e.to_string()),
            suggestions: Vec::new(),
        })?;

        let mut packages = HashMap::new();
        for (pkg, version) in selected {
            if let PmPackage::Named(path) = pkg {
                packages.insert(path.lowercase_joined(), version);
            }
        }
        Ok(Resolution { packages })
    }
}

/// Outcome of installing a single resolved package.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub id: PackageId,
    pub hash: String,
    pub group_number: i64,
    /// Set when this outcome came from a local override rather than the
    /// index/store: the authoritative source directory, bypassing the
    /// content-addressed store entirely.
    pub override_dir: Option<PathBuf>,
}

/// Walk a [`Resolution`] against the real index/store/source stack,
/// implementing the resolver's orchestration steps: skip what is already
/// installed, resolve each path through the local index (falling back to
/// remote on staleness), download and install under a per-hash lock, and
/// verify the on-disk hash against what the index promised — retrying
/// against the remote index once if the mismatch could be local staleness.
///
/// `fetch_and_unpack` performs the actual download (source descriptor
/// resolution and VCS/archive fetch live in the caller, which knows how to
/// turn a [`ResolvedEntry`] into a concrete source) and returns the
/// directory it unpacked into; the returned path must already be
/// `store.package_dir(&id)` so the layout hash can be computed in place.
pub async fn resolve_install_verify<F, Fut>(
    resolution: &Resolution,
    already_installed: &mut HashMap<String, PackageId>,
    index: &mut IndexDb,
    client: &IndexClient,
    store: &Store,
    now_unix: i64,
    fetch_and_unpack: F,
) -> HashMap<String, Result<InstallOutcome, ResolveError>>
where
    F: Fn(&ResolvedEntry) -> Fut,
    Fut: Future<Output = Result<PathBuf, pm_source::SourceError>>,
{
    let mut out = HashMap::new();

    for (path_key, version) in &resolution.packages {
        if let Some(id) = already_installed.get(path_key) {
            if store.is_installed(id) {
                let hash = store.installed_hash(id).ok().flatten().unwrap_or_default();
                out.insert(path_key.clone(), Ok(InstallOutcome { id: id.clone(), hash, group_number: 0, override_dir: None }));
                continue;
            }
        }

        let outcome = resolve_install_one(path_key, version, index, client, store, now_unix, &fetch_and_unpack).await;
        if let Ok(ref outcome) = outcome {
            already_installed.insert(path_key.clone(), outcome.id.clone());
        }
        out.insert(path_key.clone(), outcome);
    }

    out
}

async fn resolve_install_one<F, Fut>(
    path_key: &str,
    version: &Version,
    index: &mut IndexDb,
    client: &IndexClient,
    store: &Store,
    now_unix: i64,
    fetch_and_unpack: &F,
) -> Result<InstallOutcome, ResolveError>
where
    F: Fn(&ResolvedEntry) -> Fut,
    Fut: Future<Output = Result<PathBuf, pm_source::SourceError>>,
{
    let path = PackagePath::parse(path_key).map_err(|e| ResolveError::PackageNotFound(e.to_string()))?;

    // Overrides have negative ids and bypass the remote index entirely: the
    // local filesystem is authoritative, regardless of what range this
    // particular request asked for. Consult before touching the index.
    if let Some(record) = store.overridden_package(path_key)? {
        let id = PackageId::new(path, record.version.clone());
        return Ok(InstallOutcome {
            id,
            hash: String::new(),
            group_number: record.override_id,
            override_dir: Some(record.local_source_dir),
        });
    }

    let range = VersionRange::exact(version.clone());

    let mut entry = index.resolve_exact(&path, &range, client, now_unix).await?;
    let id = entry.package_id()?;

    let _lock = store.lock_package(&id)?;
    fetch_and_unpack(&entry).await?;

    let actual_hash = store.compute_layout_hash(&id)?;
    if actual_hash != entry.hash {
        // Might be a stale local snapshot; force one remote refresh before
        // treating this as a real mismatch.
        index.force_refresh(client, &[path_key.to_string()], now_unix).await?;
        entry = index.resolve_exact_offline(&path, &range, now_unix)?;
        if actual_hash != entry.hash {
            return Err(ResolveError::HashMismatch {
                path: path_key.to_string(),
                expected: entry.hash.clone(),
                actual: actual_hash,
            });
        }
    }

    store.install(&id, entry.group_number, false)?;

    Ok(InstallOutcome {
        id,
        hash: actual_hash,
        group_number: entry.group_number,
        override_dir: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_types::PackagePath;

    #[test]
    fn resolves_single_package_highest_compatible() {
        let mut provider = MemoryProvider::new();
        let path = PackagePath::parse("org.log").unwrap();
        provider.add_package(path.clone(), Version::new(1, 5, 4), vec![]);
        provider.add_package(path.clone(), Version::new(1, 4, 0), vec![]);

        let resolver = Resolver::new(&provider);
        let root = vec![Dependency::new(path.clone(), VersionRange::parse("^1.4").unwrap())];
        let resolution = resolver.resolve(root).unwrap();

        assert_eq!(resolution.packages.get("org.log"), Some(&Version::new(1, 5, 4)));
    }

    #[test]
    fn resolves_transitive_dependency() {
        let mut provider = MemoryProvider::new();
        let app = PackagePath::parse("org.app").unwrap();
        let net = PackagePath::parse("org.net").unwrap();
        let log = PackagePath::parse("org.log").unwrap();

        provider.add_package(
            app.clone(),
            Version::new(1, 0, 0),
            vec![Dependency::new(net.clone(), VersionRange::any())],
        );
        provider.add_package(
            net.clone(),
            Version::new(2, 0, 0),
            vec![Dependency::new(log.clone(), VersionRange::parse("^1.0.0").unwrap())],
        );
        provider.add_package(log.clone(), Version::new(1, 3, 0), vec![]);

        let resolver = Resolver::new(&provider);
        let root = vec![Dependency::new(app.clone(), VersionRange::any())];
        let resolution = resolver.resolve(root).unwrap();

        assert_eq!(resolution.packages.get("org.net"), Some(&Version::new(2, 0, 0)));
        assert_eq!(resolution.packages.get("org.log"), Some(&Version::new(1, 3, 0)));
    }

    #[test]
    fn missing_package_is_reported() {
        let provider = MemoryProvider::new();
        let resolver = Resolver::new(&provider);
        let missing = PackagePath::parse("org.missing").unwrap();
        let root = vec![Dependency::new(missing, VersionRange::any())];
        assert!(resolver.resolve(root).is_err());
    }

    /// S6: an override for `pub.example.lib` must win over the index even
    /// though the index is never populated with a matching entry at all —
    /// proof the override short-circuits before any index lookup.
    #[tokio::test]
    async fn override_beats_index_resolution() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = pm_store::Store::open(tmp.path().join("store")).unwrap();
        let mut index = IndexDb::open(tmp.path().join("index"), 3600).unwrap();
        let client = IndexClient::new("http://127.0.0.1:0");

        let path = PackagePath::parse("pub.example.lib").unwrap();
        let overridden_version = Version::new(1, 2, 0);
        let override_id = PackageId::new(path.clone(), overridden_version.clone());
        store
            .override_package(
                &override_id,
                pm_store::OverrideRecord::new(PathBuf::from("/tmp/x"), 1, -1, overridden_version.clone()),
            )
            .unwrap();

        let mut resolution = Resolution::default();
        resolution.packages.insert(path.lowercase_joined(), Version::parse("1.0.0").unwrap());

        let mut already_installed = HashMap::new();
        let outcomes = resolve_install_verify(&resolution, &mut already_installed, &mut index, &client, &store, 0, |_entry: &ResolvedEntry| async {
            panic!("override must short-circuit before any fetch is attempted");
            #[allow(unreachable_code)]
            Ok(PathBuf::new())
        })
        .await;

        let outcome = outcomes.get(&path.lowercase_joined()).unwrap().as_ref().unwrap();
        assert_eq!(outcome.group_number, -1);
        assert_eq!(outcome.override_dir, Some(PathBuf::from("/tmp/x")));
        assert_eq!(outcome.id.version, overridden_version);
    }
}
