//! Ambient runtime configuration.
//!
//! Everything here is plain config-shaped data read once at startup: where
//! the content-addressed store lives, which remote index to query, how
//! stale a local snapshot may get before a refresh is forced, and default
//! parallelism. This is deliberately not a build *language*; it configures
//! the *engine*, the way a tool's own CLI config differs from the
//! manifests it builds.
//!
//! Resolution order: built-in defaults, then a `pm.toml` found by walking
//! up from the current directory, then environment variables prefixed
//! `PM_`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: PathBuf, #[source] source: toml::de::Error },
    #[error("could not determine a platform config/cache directory")]
    NoPlatformDirs,
}

/// Default freshness window (seconds) before a resolved entry forces a
/// remote query: the index refuses offline-only resolution and forces a
/// remote query once age exceeds `2 × refresh_window`.
pub const DEFAULT_REFRESH_WINDOW_SECS: i64 = 6 * 60 * 60;

fn default_refresh_window() -> i64 {
    DEFAULT_REFRESH_WINDOW_SECS
}

fn default_jobs() -> Option<usize> {
    None
}

fn default_index_url() -> String {
    "https://index.example.invalid".to_string()
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the content-addressed store (`pkg/`, `etc/`, `tmp/` live
    /// under here).
    pub store_root: PathBuf,
    /// Base URL of the remote package index.
    #[serde(default = "default_index_url")]
    pub index_url: String,
    /// Seconds before a cached index entry is considered "too young" to
    /// trust offline.
    #[serde(default = "default_refresh_window")]
    pub refresh_window_secs: i64,
    /// Default worker-pool size; `None` means hardware concurrency.
    #[serde(default = "default_jobs")]
    pub jobs: Option<usize>,
    /// Stop the execution plan at the first command failure rather than
    /// continuing up to a bound.
    #[serde(default = "default_stop_on_first_error")]
    pub stop_on_first_error: bool,
    /// Verbosity, mapped from `-v`/`-vv`/`-vvv` on the CLI.
    #[serde(default)]
    pub verbosity: u8,
}

fn default_stop_on_first_error() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            index_url: default_index_url(),
            refresh_window_secs: DEFAULT_REFRESH_WINDOW_SECS,
            jobs: None,
            stop_on_first_error: true,
            verbosity: 0,
        }
    }
}

fn default_store_root() -> PathBuf {
    directories::ProjectDirs::from("dev", "pm", "pm")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".pm-store"))
}

impl Config {
    /// Load defaults, then overlay a `pm.toml` discovered by walking up
    /// from `start_dir`, then environment variables.
    pub fn load(start_dir: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(path) = find_config_file(start_dir) {
            config = Self::from_file(&path)?;
        }
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read { path: path.to_path_buf(), source: e })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse { path: path.to_path_buf(), source: e })
    }

    fn apply_env(&mut self) {
        if let Ok(root) = std::env::var("PM_STORE_ROOT") {
            self.store_root = PathBuf::from(root);
        }
        if let Ok(url) = std::env::var("PM_INDEX_URL") {
            self.index_url = url;
        }
        if let Ok(secs) = std::env::var("PM_REFRESH_WINDOW_SECS") {
            if let Ok(secs) = secs.parse() {
                self.refresh_window_secs = secs;
            }
        }
        if let Ok(jobs) = std::env::var("PM_JOBS") {
            if let Ok(jobs) = jobs.parse() {
                self.jobs = Some(jobs);
            }
        }
    }

    /// `etc/<config>/checks.3.txt`-style path for a named solution
    /// configuration.
    pub fn checks_cache_path(&self, config_name: &str) -> PathBuf {
        self.store_root.join("etc").join(config_name).join("checks.3.txt")
    }

    pub fn manual_checks_path(&self, config_name: &str) -> PathBuf {
        self.store_root.join("etc").join(config_name).join("checks.3.manual.txt")
    }

    pub fn tmp_build_dir(&self, key: &str) -> PathBuf {
        self.store_root.join("tmp").join("build").join(key)
    }
}

/// Walk up from `start_dir` looking for `pm.toml`, checking each ancestor
/// directory in turn until the filesystem root is reached.
fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut dir = Some(start_dir.to_path_buf());
    while let Some(d) = dir {
        let candidate = d.join("pm.toml");
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = d.parent().map(|p| p.to_path_buf());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.refresh_window_secs, DEFAULT_REFRESH_WINDOW_SECS);
        assert!(config.stop_on_first_error);
    }

    #[test]
    fn loads_config_file_found_in_parent_directory() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(tmp.path().join("pm.toml"), "index_url = \"https://custom.example\"\n").unwrap();

        let config = Config::load(&nested).unwrap();
        assert_eq!(config.index_url, "https://custom.example");
    }

    #[test]
    fn derives_checks_cache_path_per_config() {
        let config = Config { store_root: PathBuf::from("/root"), ..Config::default() };
        assert_eq!(config.checks_cache_path("debug-x64"), PathBuf::from("/root/etc/debug-x64/checks.3.txt"));
    }
}
