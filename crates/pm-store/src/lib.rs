//! Content-addressed package store.
//!
//! Given a package id, the store returns a stable on-disk directory derived
//! from [`pm_types::PackageId::filesystem_subpath`], and tracks which ids are
//! installed plus which ids are locally overridden. A pnpm-style hard-link
//! pool is not needed here (packages are unpacked source trees, not
//! individual files), but the per-hash locking discipline is the same one
//! used for content-addressed files generally: lock by hash, not by path.

use fs4::FileExt;
use pm_types::{PackageId, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to create directory: {0}")]
    CreateDir(#[source] io::Error),
    #[error("failed to read: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write: {0}")]
    Write(#[source] io::Error),
    #[error("failed to lock {path}: {source}")]
    Lock { path: PathBuf, #[source] source: io::Error },
    #[error("package not installed: {0}")]
    NotInstalled(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Per-installed-package record: content hash of the on-disk layout, group
/// number (shared identity across mirrored versions), and whether the
/// source root was overridden at install time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRecord {
    pub layout_hash: String,
    pub group_number: i64,
    pub source_root_override: bool,
}

/// A locally overridden package. Override ids are negative to distinguish
/// them from remote index ids; the local filesystem is authoritative. Keyed
/// (in [`Store`]'s override table) by package *path*, not full id, so that
/// any version-range request for the path resolves to the override
/// regardless of what range was asked for — an override bypasses the index
/// entirely rather than merely pinning one of its versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub local_source_dir: PathBuf,
    pub prefix_length: usize,
    pub override_id: i64,
    pub version: Version,
    pub dependencies: BTreeSet<String>,
}

impl OverrideRecord {
    pub fn new(local_source_dir: PathBuf, prefix_length: usize, override_id: i64, version: Version) -> Self {
        assert!(override_id < 0, "override ids must be negative");
        Self {
            local_source_dir,
            prefix_length,
            override_id,
            version,
            dependencies: BTreeSet::new(),
        }
    }
}

/// The content-addressed package store rooted at a configured directory.
pub struct Store {
    root: PathBuf,
    overrides_cache: Mutex<Option<HashMap<String, OverrideRecord>>>,
}

impl Store {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            root: root.into(),
            overrides_cache: Mutex::new(None),
        };
        store.ensure_dirs()?;
        Ok(store)
    }

    fn ensure_dirs(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.pkg_root()).map_err(StoreError::CreateDir)?;
        fs::create_dir_all(self.stamps_dir()).map_err(StoreError::CreateDir)?;
        fs::create_dir_all(self.locks_dir()).map_err(StoreError::CreateDir)?;
        Ok(())
    }

    pub fn pkg_root(&self) -> PathBuf {
        self.root.join("pkg")
    }

    pub fn stamps_dir(&self) -> PathBuf {
        self.root.join("etc").join("stamps").join("packages")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("etc").join("locks")
    }

    /// `pkg/<aa>/<bb>/<cc>/<dd>/<rest>` for this package id.
    pub fn package_dir(&self, id: &PackageId) -> PathBuf {
        self.pkg_root().join(id.filesystem_subpath())
    }

    /// Unpacked source tree root: `.../src/<source_root_dir>`.
    pub fn src_dir(&self, id: &PackageId, source_root_dir: &str) -> PathBuf {
        self.package_dir(id).join("src").join(source_root_dir)
    }

    /// Build-output root: `.../obj`.
    pub fn obj_dir(&self, id: &PackageId) -> PathBuf {
        self.package_dir(id).join("obj")
    }

    fn stamp_path(&self, id: &PackageId) -> PathBuf {
        self.stamps_dir().join(id.filesystem_subpath())
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.locks_dir().join(name)
    }

    fn with_file_lock<T>(&self, name: &str, f: impl FnOnce() -> Result<T, StoreError>) -> Result<T, StoreError> {
        let guard = self.lock(name)?;
        let result = f();
        drop(guard);
        result
    }

    fn lock(&self, name: &str) -> Result<LockGuard, StoreError> {
        let path = self.lock_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
        }
        let file = File::create(&path).map_err(|e| StoreError::Lock { path: path.clone(), source: e })?;
        file.lock_exclusive().map_err(|e| StoreError::Lock { path: path.clone(), source: e })?;
        Ok(LockGuard { file })
    }

    /// Take the per-package hash lock for the duration the caller holds the
    /// guard. Covers both the download and the install step, so re-entrant
    /// callers for the same id block on each other rather than duplicating
    /// work.
    pub fn lock_package(&self, id: &PackageId) -> Result<LockGuard, StoreError> {
        self.lock(&id.hash())
    }

    /// Record an installed package: hashes its on-disk layout and persists
    /// that hash alongside the group number. Install/override operations on
    /// the same id are mutually exclusive across threads and processes via
    /// the per-hash file lock.
    pub fn install(&self, id: &PackageId, group_number: i64, source_root_override: bool) -> Result<InstallRecord, StoreError> {
        let hash_key = id.hash();
        self.with_file_lock(&hash_key, || {
            let layout_hash = hash_dir(&self.package_dir(id))?;
            let record = InstallRecord {
                layout_hash,
                group_number,
                source_root_override,
            };
            let stamp = self.stamp_path(id);
            if let Some(parent) = stamp.parent() {
                fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
            }
            fs::write(&stamp, serde_json::to_vec_pretty(&record)?).map_err(StoreError::Write)?;
            info!("installed {} (group {group_number})", id);
            Ok(record)
        })
    }

    pub fn is_installed(&self, id: &PackageId) -> bool {
        self.stamp_path(id).exists()
    }

    pub fn installed_hash(&self, id: &PackageId) -> Result<Option<String>, StoreError> {
        let stamp = self.stamp_path(id);
        if !stamp.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&stamp).map_err(StoreError::Read)?;
        let record: InstallRecord = serde_json::from_str(&content)?;
        Ok(Some(record.layout_hash))
    }

    /// Recompute the on-disk layout hash for `id` without touching the
    /// stamp file. Callers use this to verify a download against the hash
    /// an index promised before trusting it as installed.
    pub fn compute_layout_hash(&self, id: &PackageId) -> Result<String, StoreError> {
        hash_dir(&self.package_dir(id))
    }

    fn overrides_path(&self) -> PathBuf {
        self.root.join("etc").join("overrides.json")
    }

    fn load_overrides(&self) -> Result<HashMap<String, OverrideRecord>, StoreError> {
        let path = self.overrides_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(&path).map_err(StoreError::Read)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save_overrides(&self, map: &HashMap<String, OverrideRecord>) -> Result<(), StoreError> {
        let path = self.overrides_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
        }
        fs::write(&path, serde_json::to_vec_pretty(map)?).map_err(StoreError::Write)?;
        Ok(())
    }

    /// Insert or replace the override for `id`'s package path, deleting any
    /// previous override recorded under the same path first. Guarded by a
    /// well-known file lock so concurrent writers across processes
    /// serialize. Keyed by path (`id.path.lowercase_joined()`) rather than
    /// the full id so that resolution can look up "is this path overridden"
    /// before it even knows which version a request's range would pick.
    pub fn override_package(&self, id: &PackageId, record: OverrideRecord) -> Result<(), StoreError> {
        let key = id.path.lowercase_joined();
        self.with_file_lock("overrides", || {
            let mut map = self.load_overrides()?;
            map.remove(&key);
            map.insert(key.clone(), record);
            self.save_overrides(&map)?;
            *self.overrides_cache.lock().unwrap() = Some(map);
            debug!("overrode package {}", id);
            Ok(())
        })
    }

    /// Read-through cached map of all overrides, keyed by package path
    /// (`PackagePath::lowercase_joined`).
    pub fn overridden_packages(&self) -> Result<HashMap<String, OverrideRecord>, StoreError> {
        let mut cache = self.overrides_cache.lock().unwrap();
        if let Some(map) = cache.as_ref() {
            return Ok(map.clone());
        }
        let map = self.load_overrides()?;
        *cache = Some(map.clone());
        Ok(map)
    }

    /// Look up the override for a single package path, if any.
    pub fn overridden_package(&self, path_key: &str) -> Result<Option<OverrideRecord>, StoreError> {
        Ok(self.overridden_packages()?.get(path_key).cloned())
    }

    /// Delete the override recorded for `id`'s package path, if any.
    pub fn delete_overridden(&self, id: &PackageId) -> Result<(), StoreError> {
        let key = id.path.lowercase_joined();
        self.with_file_lock("overrides", || {
            let mut map = self.load_overrides()?;
            map.remove(&key);
            self.save_overrides(&map)?;
            *self.overrides_cache.lock().unwrap() = Some(map);
            Ok(())
        })
    }

    /// Delete the override whose local source directory matches `sdir`.
    pub fn delete_overridden_by_dir(&self, sdir: &Path) -> Result<(), StoreError> {
        self.with_file_lock("overrides", || {
            let mut map = self.load_overrides()?;
            map.retain(|_, r| r.local_source_dir != sdir);
            self.save_overrides(&map)?;
            *self.overrides_cache.lock().unwrap() = Some(map);
            Ok(())
        })
    }
}

/// Holds an exclusive OS file lock until dropped.
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl Clone for OverrideRecord {
    fn clone(&self) -> Self {
        Self {
            local_source_dir: self.local_source_dir.clone(),
            prefix_length: self.prefix_length,
            override_id: self.override_id,
            version: self.version.clone(),
            dependencies: self.dependencies.clone(),
        }
    }
}

/// BLAKE3 hash of an entire directory tree's contents, parallelized over
/// files with `rayon`.
fn hash_dir(dir: &Path) -> Result<String, StoreError> {
    use rayon::prelude::*;
    use std::collections::BTreeMap;

    if !dir.exists() {
        return Ok(blake3::hash(b"").to_hex().to_string());
    }

    let files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect();

    let hashes: Result<BTreeMap<String, String>, StoreError> = files
        .par_iter()
        .map(|path| {
            let content = fs::read(path).map_err(StoreError::Read)?;
            let rel = path.strip_prefix(dir).unwrap_or(path).to_string_lossy().to_string();
            Ok((rel, blake3::hash(&content).to_hex().to_string()))
        })
        .collect();
    let hashes = hashes?;

    let combined: String = hashes.iter().map(|(k, v)| format!("{k}:{v}")).collect::<Vec<_>>().join("\n");
    Ok(blake3::hash(combined.as_bytes()).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_types::{PackagePath, Version};
    use tempfile::TempDir;

    fn test_id() -> PackageId {
        PackageId::new(PackagePath::parse("org.sqlite").unwrap(), Version::new(3, 42, 0))
    }

    #[test]
    fn install_records_and_reports_installed() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let id = test_id();

        assert!(!store.is_installed(&id));
        fs::create_dir_all(store.package_dir(&id)).unwrap();
        store.install(&id, 7, false).unwrap();
        assert!(store.is_installed(&id));
        assert!(store.installed_hash(&id).unwrap().is_some());
    }

    #[test]
    fn filesystem_subpath_has_stable_directory() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let id = test_id();
        let a = store.package_dir(&id);
        let b = store.package_dir(&id);
        assert_eq!(a, b);
    }

    #[test]
    fn override_then_delete_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let id = test_id();
        let record = OverrideRecord::new(PathBuf::from("/local/src"), 2, -1, id.version.clone());
        let path_key = id.path.lowercase_joined();

        store.override_package(&id, record).unwrap();
        assert!(store.overridden_packages().unwrap().contains_key(&path_key));

        store.delete_overridden(&id).unwrap();
        assert!(!store.overridden_packages().unwrap().contains_key(&path_key));
    }

    #[test]
    fn overriding_replaces_previous_record() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let id = test_id();

        store.override_package(&id, OverrideRecord::new(PathBuf::from("/old"), 1, -1, id.version.clone())).unwrap();
        store.override_package(&id, OverrideRecord::new(PathBuf::from("/new"), 1, -2, id.version.clone())).unwrap();

        let map = store.overridden_packages().unwrap();
        assert_eq!(map.get(&id.path.lowercase_joined()).unwrap().local_source_dir, PathBuf::from("/new"));
    }

    #[test]
    fn override_beats_index_lookup_by_path() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let id = test_id();
        store.override_package(&id, OverrideRecord::new(PathBuf::from("/tmp/x"), 1, -1, id.version.clone())).unwrap();

        let found = store.overridden_package(&id.path.lowercase_joined()).unwrap().expect("override present");
        assert_eq!(found.local_source_dir, PathBuf::from("/tmp/x"));
        assert!(found.override_id < 0);
    }

    #[test]
    #[should_panic(expected = "override ids must be negative")]
    fn override_id_must_be_negative() {
        OverrideRecord::new(PathBuf::from("/x"), 1, 1, Version::new(1, 0, 0));
    }
}
