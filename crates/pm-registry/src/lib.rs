//! Local, read-mostly package index database.
//!
//! Holds a cached snapshot of package-path -> version resolution data,
//! downloaded in bulk from the remote index (`pm-index-client`) and served
//! locally for most resolutions. Schema upgrades are detected by a stored
//! integer; a mismatch triggers a clean reload rather than an in-place
//! migration: simplest correct response to a format change, and schema
//! upgrades are rare enough that a rebuild is cheap.

use pm_index_client::{FindDependenciesResponse, IndexClient, IndexClientError};
use pm_types::{PackageId, PackagePath, Version, VersionRange};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Bump when the on-disk snapshot's shape changes incompatibly.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no such version for {path} matching {range:?}")]
    NoSuchVersion { path: String, range: String },
    #[error("resolution for {0} is too young for offline use; a remote query is required")]
    TooYoung(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    IndexClient(#[from] IndexClientError),
}

/// One resolved (path, version) pair as cached locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedEntry {
    pub path: String,
    pub version: String,
    pub hash: String,
    pub group_number: i64,
    pub prefix: String,
    pub flags: u32,
    pub dependency_ids: Vec<String>,
    pub updated_at_unix: i64,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Snapshot {
    schema_version: u32,
    last_refresh_unix: i64,
    entries: HashMap<String, Vec<ResolvedEntry>>,
}

/// The local cached index. `now_unix` is supplied by the caller rather than
/// read from the clock directly, so freshness checks stay deterministic and
/// testable.
pub struct IndexDb {
    path: PathBuf,
    refresh_window_secs: i64,
    snapshot: Snapshot,
}

impl IndexDb {
    pub fn open(root: impl Into<PathBuf>, refresh_window_secs: i64) -> Result<Self, RegistryError> {
        let path = root.into().join("etc").join("index").join("snapshot.json");
        let snapshot = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let loaded: Snapshot = serde_json::from_str(&content)?;
            if loaded.schema_version != CURRENT_SCHEMA_VERSION {
                tracing::info!(
                    "index schema version {} != {}, discarding cached snapshot",
                    loaded.schema_version,
                    CURRENT_SCHEMA_VERSION
                );
                Snapshot {
                    schema_version: CURRENT_SCHEMA_VERSION,
                    ..Default::default()
                }
            } else {
                loaded
            }
        } else {
            Snapshot {
                schema_version: CURRENT_SCHEMA_VERSION,
                ..Default::default()
            }
        };
        Ok(Self {
            path,
            refresh_window_secs,
            snapshot,
        })
    }

    fn persist(&self) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(&self.snapshot)?)?;
        Ok(())
    }

    fn is_too_young(&self, entry: &ResolvedEntry, now_unix: i64) -> bool {
        (now_unix - entry.updated_at_unix) < 2 * self.refresh_window_secs
    }

    fn is_stale(&self, now_unix: i64) -> bool {
        (now_unix - self.snapshot.last_refresh_unix) > self.refresh_window_secs
    }

    /// Pure local lookup. Fails with [`RegistryError::TooYoung`] when the
    /// only matching entry is inside the freshness window and therefore
    /// cannot be trusted offline.
    pub fn resolve_exact_offline(&self, path: &PackagePath, range: &VersionRange, now_unix: i64) -> Result<ResolvedEntry, RegistryError> {
        let key = path.lowercase_joined();
        let candidates = self.snapshot.entries.get(&key).ok_or_else(|| RegistryError::NoSuchVersion {
            path: key.clone(),
            range: format!("{range:?}"),
        })?;

        let versions: Vec<(Version, &ResolvedEntry)> = candidates
            .iter()
            .filter_map(|e| Version::parse(&e.version).ok().map(|v| (v, e)))
            .collect();
        let version_refs: Vec<&Version> = versions.iter().map(|(v, _)| v).collect();
        let chosen = range.max_satisfying(version_refs.into_iter()).cloned().ok_or_else(|| RegistryError::NoSuchVersion {
            path: key.clone(),
            range: format!("{range:?}"),
        })?;

        let entry = versions.iter().find(|(v, _)| *v == chosen).map(|(_, e)| *e).expect("chosen version came from candidates");

        if self.is_too_young(entry, now_unix) {
            return Err(RegistryError::TooYoung(key));
        }
        Ok(entry.clone())
    }

    /// Resolve `path` within `range`, falling back to the remote index
    /// through `client` when the local snapshot is stale, the candidate is
    /// too young, or nothing local matches.
    pub async fn resolve_exact(
        &mut self,
        path: &PackagePath,
        range: &VersionRange,
        client: &IndexClient,
        now_unix: i64,
    ) -> Result<ResolvedEntry, RegistryError> {
        if !self.is_stale(now_unix) {
            if let Ok(entry) = self.resolve_exact_offline(path, range, now_unix) {
                return Ok(entry);
            }
        }
        self.refresh(client, &[path.to_string()], now_unix).await?;
        self.resolve_exact_offline(path, range, now_unix)
    }

    /// Batch resolution: returns an entry for every request the local (or,
    /// after one refresh, remote) index could satisfy.
    pub async fn find_dependencies(
        &mut self,
        requests: &[(PackagePath, VersionRange)],
        client: &IndexClient,
        now_unix: i64,
    ) -> HashMap<String, Result<ResolvedEntry, RegistryError>> {
        let mut out = HashMap::new();
        let mut needs_remote = Vec::new();
        for (path, range) in requests {
            match self.resolve_exact_offline(path, range, now_unix) {
                Ok(entry) => {
                    out.insert(path.to_string(), Ok(entry));
                }
                Err(RegistryError::TooYoung(_)) | Err(RegistryError::NoSuchVersion { .. }) => {
                    needs_remote.push(path.to_string());
                }
                Err(e) => {
                    out.insert(path.to_string(), Err(e));
                }
            }
        }
        if !needs_remote.is_empty() {
            if let Err(e) = self.refresh(client, &needs_remote, now_unix).await {
                for path in &needs_remote {
                    out.insert(path.clone(), Err(RegistryError::NoSuchVersion {
                        path: path.clone(),
                        range: e.to_string(),
                    }));
                }
                return out;
            }
            for (path, range) in requests {
                let key = path.to_string();
                if !out.contains_key(&key) {
                    out.insert(key, self.resolve_exact_offline(path, range, now_unix));
                }
            }
        }
        out
    }

    /// Force a remote refresh for the given paths, bypassing the staleness
    /// check. Used by callers that discovered a local hash mismatch and
    /// need to rule out a stale snapshot before failing outright.
    pub async fn force_refresh(&mut self, client: &IndexClient, paths: &[String], now_unix: i64) -> Result<(), RegistryError> {
        self.refresh(client, paths, now_unix).await
    }

    async fn refresh(&mut self, client: &IndexClient, paths: &[String], now_unix: i64) -> Result<(), RegistryError> {
        let resp: FindDependenciesResponse = client.find_dependencies(paths).await?;
        if resp.schema_version != CURRENT_SCHEMA_VERSION {
            tracing::warn!(
                "remote schema version {} != local {}, clearing cache",
                resp.schema_version,
                CURRENT_SCHEMA_VERSION
            );
            self.snapshot.entries.clear();
        }
        for (path, remote) in resp.entries {
            let entry = ResolvedEntry {
                path: path.clone(),
                version: remote.version,
                hash: remote.hash,
                group_number: remote.group_number,
                prefix: remote.prefix,
                flags: remote.flags,
                dependency_ids: remote.dependencies,
                updated_at_unix: remote.updated_at_unix,
            };
            let bucket = self.snapshot.entries.entry(path).or_default();
            bucket.retain(|e| e.version != entry.version);
            bucket.push(entry);
        }
        self.snapshot.last_refresh_unix = now_unix;
        self.persist()
    }

    /// Package paths whose lowercased form contains `pattern`.
    pub fn get_matching_packages(&self, pattern: &str) -> Vec<String> {
        let pattern = pattern.to_ascii_lowercase();
        self.snapshot
            .entries
            .keys()
            .filter(|k| k.contains(&pattern))
            .cloned()
            .collect()
    }

    pub fn get_versions_for_package(&self, path: &PackagePath) -> Vec<Version> {
        self.snapshot
            .entries
            .get(&path.lowercase_joined())
            .map(|entries| entries.iter().filter_map(|e| Version::parse(&e.version).ok()).collect())
            .unwrap_or_default()
    }
}

impl ResolvedEntry {
    pub fn package_id(&self) -> Result<PackageId, RegistryError> {
        let path = PackagePath::parse(&self.path).map_err(|e| RegistryError::NoSuchVersion {
            path: self.path.clone(),
            range: e.to_string(),
        })?;
        let version = Version::parse(&self.version).map_err(|e| RegistryError::NoSuchVersion {
            path: self.path.clone(),
            range: e.to_string(),
        })?;
        Ok(PackageId::new(path, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(version: &str, updated_at: i64) -> ResolvedEntry {
        ResolvedEntry {
            path: "org.sqlite".to_string(),
            version: version.to_string(),
            hash: "deadbeef".to_string(),
            group_number: 1,
            prefix: String::new(),
            flags: 0,
            dependency_ids: vec![],
            updated_at_unix: updated_at,
        }
    }

    #[test]
    fn offline_resolve_picks_max_satisfying() {
        let tmp = tempfile::tempdir().unwrap();
        let mut db = IndexDb::open(tmp.path(), 3600).unwrap();
        db.snapshot.entries.insert(
            "org.sqlite".to_string(),
            vec![entry("3.40.0", 0), entry("3.42.0", 0), entry("4.0.0", 0)],
        );
        let path = PackagePath::parse("org.sqlite").unwrap();
        let range = VersionRange::parse("^3.0.0").unwrap();
        let resolved = db.resolve_exact_offline(&path, &range, 100_000).unwrap();
        assert_eq!(resolved.version, "3.42.0");
    }

    #[test]
    fn too_young_entry_refuses_offline_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        let mut db = IndexDb::open(tmp.path(), 3600).unwrap();
        let now = 10_000;
        db.snapshot.entries.insert("org.sqlite".to_string(), vec![entry("3.42.0", now - 1000)]);
        let path = PackagePath::parse("org.sqlite").unwrap();
        let range = VersionRange::any();
        let err = db.resolve_exact_offline(&path, &range, now).unwrap_err();
        assert!(matches!(err, RegistryError::TooYoung(_)));
    }

    #[test]
    fn schema_mismatch_discards_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshot_path = tmp.path().join("etc").join("index").join("snapshot.json");
        fs::create_dir_all(snapshot_path.parent().unwrap()).unwrap();
        let stale = Snapshot {
            schema_version: CURRENT_SCHEMA_VERSION + 1,
            last_refresh_unix: 0,
            entries: {
                let mut m = HashMap::new();
                m.insert("org.sqlite".to_string(), vec![entry("3.42.0", 0)]);
                m
            },
        };
        fs::write(&snapshot_path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let db = IndexDb::open(tmp.path(), 3600).unwrap();
        assert!(db.snapshot.entries.is_empty());
    }

    #[test]
    fn get_matching_packages_substring_matches() {
        let tmp = tempfile::tempdir().unwrap();
        let mut db = IndexDb::open(tmp.path(), 3600).unwrap();
        db.snapshot.entries.insert("org.sqlite".to_string(), vec![entry("3.42.0", 0)]);
        db.snapshot.entries.insert("org.zlib".to_string(), vec![entry("1.3.0", 0)]);
        let matches = db.get_matching_packages("sql");
        assert_eq!(matches, vec!["org.sqlite".to_string()]);
    }
}
