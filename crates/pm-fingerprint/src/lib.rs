//! Per-file content fingerprints and implicit-dependency edges.
//!
//! The execution plan (`pm-plan`) consults this database to decide whether a
//! command can be skipped: a command is stale-free only when every input's
//! fingerprint still matches what was recorded the last time it ran *and*
//! every output still exists with its recorded fingerprint. Implicit
//! dependencies (headers discovered while compiling, not named directly on
//! the command) are folded into the same record so a header edit correctly
//! invalidates every translation unit that happened to include it, without
//! the caller having declared that edge up front.
//!
//! Accesses go through a single [`std::sync::RwLock`] guarding the whole
//! map — one writer at a time, many concurrent readers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, #[source] source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, #[source] source: io::Error },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Content fingerprint of one file: a BLAKE3 hash plus the modification
/// time observed when it was computed. The hash is authoritative for
/// staleness; the timestamp backs the built-in command's extra
/// `isTimeChanged` comparison without re-reading the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: String,
    pub mtime_unix_nanos: u128,
    pub len: u64,
}

/// Per-file record: its current fingerprint, the command that generates it
/// (if it is itself a build output), and the implicit dependencies
/// discovered the last time it was compiled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub fingerprint: Fingerprint,
    pub generator_command_hash: Option<String>,
    pub implicit_deps: BTreeSet<PathBuf>,
}

/// Fingerprint a file's content. Memory-maps files over 4KiB to avoid an
/// extra copy, matching the store's directory-hashing approach.
pub fn fingerprint_file(path: &Path) -> Result<Fingerprint, FingerprintError> {
    let file = fs::File::open(path).map_err(|e| FingerprintError::Read { path: path.to_path_buf(), source: e })?;
    let meta = file.metadata().map_err(|e| FingerprintError::Read { path: path.to_path_buf(), source: e })?;
    let hash = if meta.len() > 4096 {
        // SAFETY: read-only mapping of a file we just opened; not modified
        // concurrently by this process.
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| FingerprintError::Read { path: path.to_path_buf(), source: e })?;
        blake3::hash(&mmap).to_hex().to_string()
    } else {
        let content = fs::read(path).map_err(|e| FingerprintError::Read { path: path.to_path_buf(), source: e })?;
        blake3::hash(&content).to_hex().to_string()
    };
    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let mtime_unix_nanos = mtime.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    Ok(Fingerprint { hash, mtime_unix_nanos, len: meta.len() })
}

/// Persisted fingerprint database, one per storage root.
pub struct FingerprintDb {
    path: PathBuf,
    records: RwLock<HashMap<PathBuf, FileRecord>>,
}

impl FingerprintDb {
    /// Load (or initialize empty) the database at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FingerprintError> {
        let path = path.into();
        let records = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| FingerprintError::Read { path: path.clone(), source: e })?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };
        Ok(Self { path, records: RwLock::new(records) })
    }

    pub fn save(&self) -> Result<(), FingerprintError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| FingerprintError::Write { path: parent.to_path_buf(), source: e })?;
        }
        let records = self.records.read().unwrap();
        let content = serde_json::to_vec_pretty(&*records)?;
        fs::write(&self.path, content).map_err(|e| FingerprintError::Write { path: self.path.clone(), source: e })
    }

    pub fn get(&self, path: &Path) -> Option<FileRecord> {
        self.records.read().unwrap().get(path).cloned()
    }

    /// Record (or refresh) `path`'s fingerprint, preserving its prior
    /// implicit dependencies unless `implicit_deps` overrides them.
    pub fn update(
        &self,
        path: &Path,
        generator_command_hash: Option<String>,
        implicit_deps: Option<BTreeSet<PathBuf>>,
    ) -> Result<FileRecord, FingerprintError> {
        let fingerprint = fingerprint_file(path)?;
        let mut records = self.records.write().unwrap();
        let implicit_deps = implicit_deps.unwrap_or_else(|| {
            records.get(path).map(|r| r.implicit_deps.clone()).unwrap_or_default()
        });
        let record = FileRecord { fingerprint, generator_command_hash, implicit_deps };
        records.insert(path.to_path_buf(), record.clone());
        Ok(record)
    }

    /// Whether `path` is unchanged since it was last recorded: present on
    /// disk and its current hash matches the stored one.
    pub fn is_fresh(&self, path: &Path) -> bool {
        let records = self.records.read().unwrap();
        let Some(recorded) = records.get(path) else { return false };
        match fingerprint_file(path) {
            Ok(current) => current.hash == recorded.fingerprint.hash,
            Err(_) => false,
        }
    }

    /// All files transitively reachable from `path` via recorded implicit
    /// dependency edges (headers of headers of ...).
    pub fn implicit_closure(&self, path: &Path) -> BTreeSet<PathBuf> {
        let records = self.records.read().unwrap();
        let mut seen = BTreeSet::new();
        let mut stack = vec![path.to_path_buf()];
        while let Some(p) = stack.pop() {
            if let Some(record) = records.get(&p) {
                for dep in &record.implicit_deps {
                    if seen.insert(dep.clone()) {
                        stack.push(dep.clone());
                    }
                }
            }
        }
        seen
    }
}

/// Parse MSVC-style `/showIncludes` output. `cl.exe` prefixes each include
/// it pulls in with a locale-dependent "Note: including file:" marker
/// followed by a variable amount of indentation and the path; we only rely
/// on the fixed `Note: including file:` token, not the indentation, since
/// that varies by nesting depth.
pub fn parse_msvc_includes(compiler_stdout: &str) -> Vec<PathBuf> {
    const MARKER: &str = "Note: including file:";
    compiler_stdout
        .lines()
        .filter_map(|line| {
            let idx = line.find(MARKER)?;
            let path = line[idx + MARKER.len()..].trim();
            if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            }
        })
        .collect()
}

/// Parse a GNU-style `.d` Makefile dependency fragment (`gcc -MD -MF`).
/// Lines are `target: dep1 dep2 \` continued with trailing backslashes;
/// the target itself is the object file, not an implicit dependency, so
/// only the prerequisite list is returned.
pub fn parse_gnu_depfile(content: &str) -> Vec<PathBuf> {
    let joined = content.replace("\\\n", " ");
    let mut deps = Vec::new();
    for line in joined.lines() {
        let Some((_, rhs)) = line.split_once(':') else { continue };
        for token in rhs.split_whitespace() {
            deps.push(PathBuf::from(token));
        }
    }
    deps
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_file_matches_recorded_fingerprint() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("fingerprints.json");
        let file_path = tmp.path().join("a.c");
        fs::write(&file_path, b"int main(){}").unwrap();

        let db = FingerprintDb::open(&db_path).unwrap();
        db.update(&file_path, None, None).unwrap();
        assert!(db.is_fresh(&file_path));

        fs::write(&file_path, b"int main(){ return 1; }").unwrap();
        assert!(!db.is_fresh(&file_path));
    }

    #[test]
    fn round_trips_through_save_and_reopen() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("fingerprints.json");
        let file_path = tmp.path().join("a.c");
        fs::write(&file_path, b"data").unwrap();

        {
            let db = FingerprintDb::open(&db_path).unwrap();
            db.update(&file_path, Some("cmdhash".into()), None).unwrap();
            db.save().unwrap();
        }

        let reopened = FingerprintDb::open(&db_path).unwrap();
        let record = reopened.get(&file_path).unwrap();
        assert_eq!(record.generator_command_hash.as_deref(), Some("cmdhash"));
    }

    #[test]
    fn implicit_closure_follows_transitive_headers() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("fingerprints.json");
        let a = tmp.path().join("a.c");
        let b = tmp.path().join("b.h");
        let c = tmp.path().join("c.h");
        for p in [&a, &b, &c] {
            fs::write(p, b"x").unwrap();
        }

        let db = FingerprintDb::open(&db_path).unwrap();
        db.update(&b, None, Some(BTreeSet::from([c.clone()]))).unwrap();
        db.update(&a, None, Some(BTreeSet::from([b.clone()]))).unwrap();

        let closure = db.implicit_closure(&a);
        assert!(closure.contains(&b));
        assert!(closure.contains(&c));
    }

    #[test]
    fn parses_msvc_show_includes_lines() {
        let output = "Note: including file: C:\\inc\\foo.h\nCompiling x.c\nNote: including file:  C:\\inc\\bar.h\n";
        let deps = parse_msvc_includes(output);
        assert_eq!(deps, vec![PathBuf::from("C:\\inc\\foo.h"), PathBuf::from("C:\\inc\\bar.h")]);
    }

    #[test]
    fn parses_gnu_depfile_targets() {
        let content = "obj/a.o: src/a.c \\\n  include/a.h \\\n  include/b.h\n";
        let deps = parse_gnu_depfile(content);
        assert_eq!(deps, vec![PathBuf::from("src/a.c"), PathBuf::from("include/a.h"), PathBuf::from("include/b.h")]);
    }
}
