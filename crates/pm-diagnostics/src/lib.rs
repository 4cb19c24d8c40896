//! Rich error diagnostics for the CLI.
//!
//! Every crate defines its own `thiserror::Error` enum scoped to its own
//! concerns (`pm_store::StoreError`, `pm_resolver::ResolveError`,
//! `pm_plan::PlanError`, ...). This crate is the single place those get
//! aggregated into a `miette`-rendered diagnostic before the CLI prints
//! anything, covering: invalid input, resolution failure, I/O failure,
//! hash mismatch, cycle detected, build failure, check failure, manual
//! setup required, plug-in load failure.

#![allow(unused_assignments)]

pub use miette::{Diagnostic, Report, Result};
use thiserror::Error;

/// A top-level error with rich diagnostics, one variant per failure
/// category.
#[derive(Error, Diagnostic, Debug)]
pub enum PmError {
    #[error("invalid package path: {0}")]
    #[diagnostic(code(pm::input::invalid_path))]
    InvalidPackagePath(String),

    #[error("invalid version range: {0}")]
    #[diagnostic(code(pm::input::invalid_range))]
    InvalidVersionRange(String),

    #[error("invalid source url: {0}")]
    #[diagnostic(code(pm::input::invalid_url))]
    InvalidSourceUrl(String),

    #[error("no version of '{path}' satisfies '{range}'")]
    #[diagnostic(code(pm::resolve::no_such_version), help("available versions: {available}"))]
    NoSuchVersion { path: String, range: String, available: String },

    #[error("unresolved dependency: {0}")]
    #[diagnostic(code(pm::resolve::unresolved), help("check the package path and that an index entry or override exists"))]
    UnresolvedDependency(String),

    #[error("no solution found for dependency constraints")]
    #[diagnostic(code(pm::resolve::no_solution), help("try relaxing a version range or adding an override"))]
    NoSolution { derivation: String },

    #[error("network error: {message}")]
    #[diagnostic(code(pm::io::network))]
    NetworkError { message: String },

    #[error("filesystem error: {message}")]
    #[diagnostic(code(pm::io::filesystem))]
    FilesystemError { message: String },

    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    #[diagnostic(code(pm::resolve::hash_mismatch), help("the local index snapshot may be stale; a remote refresh was already attempted once"))]
    HashMismatch { path: String, expected: String, actual: String },

    #[error("cycle detected in {graph}")]
    #[diagnostic(code(pm::graph::cycle), help("see {artifact} for the offending edges"))]
    CycleDetected { graph: String, artifact: String },

    #[error("build failed: {target}")]
    #[diagnostic(code(pm::build::failed))]
    BuildFailed {
        target: String,
        #[source_code]
        src: Option<String>,
        #[label("error here")]
        span: Option<miette::SourceSpan>,
    },

    #[error("check failed (non-fatal): {0}")]
    #[diagnostic(code(pm::check::failed), severity(Warning))]
    CheckFailed(String),

    #[error("manual setup required for cross-compiled check(s)")]
    #[diagnostic(code(pm::check::manual_setup_required), help("run the generated script at {script} on the target and re-run with its results"))]
    ManualSetupRequired { script: String },

    #[error("plug-in load failed: {0}")]
    #[diagnostic(code(pm::plugin::load_failed), help("the stale module file was removed; the next run will rebuild it"))]
    PluginLoadFailed(String),

    #[error("{0}")]
    #[diagnostic(code(pm::suppressed))]
    Suppressed(String),

    #[error("{0}")]
    #[diagnostic(code(pm::generic))]
    Generic(String),
}

impl PmError {
    pub fn no_such_version(path: impl Into<String>, range: impl Into<String>, available: Vec<String>) -> Self {
        Self::NoSuchVersion {
            path: path.into(),
            range: range.into(),
            available: if available.is_empty() { "none".to_string() } else { available.join(", ") },
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    pub fn filesystem(message: impl Into<String>) -> Self {
        Self::FilesystemError { message: message.into() }
    }

    pub fn cycle(graph: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self::CycleDetected { graph: graph.into(), artifact: artifact.into() }
    }

    /// Whether this error's message has already been printed by the caller,
    /// meaning the CLI should translate it to exit code 1 without printing
    /// it again.
    pub fn already_printed(&self) -> bool {
        matches!(self, PmError::Suppressed(_))
    }

    /// Map to the process exit code: 0 is never returned from here (this
    /// type only exists to represent a failure), 1 for everything.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Install the pretty-printing hook for `miette::Report`s. Call once at
/// startup.
pub fn setup() {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .tab_width(4)
                .build(),
        )
    }))
    .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppressed_errors_are_marked_already_printed() {
        let e = PmError::Suppressed("already shown".into());
        assert!(e.already_printed());
        assert_eq!(e.exit_code(), 1);
    }

    #[test]
    fn ordinary_errors_are_not_already_printed() {
        let e = PmError::Generic("boom".into());
        assert!(!e.already_printed());
    }
}
