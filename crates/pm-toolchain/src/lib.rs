//! The narrow `Tool` interface the command builder and target model drive
//! compilers and linkers through.
//!
//! Toolchain *auto-detection* (finding `cl.exe`, probing a GCC on `PATH`,
//! reading Xcode's default toolchain) is explicitly out of scope for the
//! core: callers construct a [`Tool`] from whatever they already know and
//! hand it to [`ToolRegistry`]. What lives here is the interface every
//! compiler/linker/librarian is driven through, replacing what would
//! otherwise be a class hierarchy (MSVC/Clang/GNU/librarian/linker variants)
//! with one struct plus a kind enum used only for the handful of
//! branch-on-kind decisions the rest of the system actually needs:
//! response-file conventions, implicit-dependency parsing style, and
//! import-library handling.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolchainError {
    #[error("no tool registered for extension {0:?}")]
    NoToolForExtension(String),
    #[error("failed to locate {0} on PATH: {1}")]
    NotFound(String, #[source] which::Error),
}

/// Source language a tool compiles, mirroring the check engine's and
/// target model's `language` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    C,
    Cxx,
    Asm,
}

/// The behavioral family a tool belongs to. Never grown into a trait
/// hierarchy: everything that depends on "which compiler is this" switches
/// on this enum instead of dynamic dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolKind {
    /// cl.exe-family: `/showIncludes` implicit deps, `@rsp` response files,
    /// `.lib` import libraries alongside `.dll` outputs.
    Msvc,
    /// gcc/clang driver family: `.d` Makefile-fragment implicit deps,
    /// `@rsp` response files (GNU ld convention).
    Gnu,
    /// Archiver/librarian (`lib.exe`, `ar`) producing static libraries.
    Librarian,
    /// A command re-invoking the current process via the jumppad protocol
    /// (see `pm-plugin`), used for generator steps with no external tool.
    Builtin,
}

/// A compiler, linker, or librarian the command builder can drive.
///
/// Cheaply cloned (`clone()`) so each source file the target owns can carry
/// its own diverged copy (e.g. a per-file language override or extra
/// define) without sharing mutable state with sibling files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    pub program: PathBuf,
    pub version: Option<String>,
    pub kind: ToolKind,
    pub language: Language,
    /// Flags always passed ahead of per-command arguments (e.g. a sysroot).
    pub base_args: Vec<String>,
}

impl Tool {
    pub fn new(program: impl Into<PathBuf>, kind: ToolKind, language: Language) -> Self {
        Self {
            program: program.into(),
            version: None,
            kind,
            language,
            base_args: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_base_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.base_args.extend(args);
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn kind(&self) -> ToolKind {
        self.kind
    }

    /// Whether this tool's output convention needs a separate import
    /// library alongside the primary shared-library output (Pass 6 of
    /// target preparation).
    pub fn produces_import_library(&self) -> bool {
        matches!(self.kind, ToolKind::Msvc)
    }

    /// Resolve `name` on `PATH` as a starting point for a [`Tool`]; the
    /// caller still supplies `kind`/`language` since PATH lookup alone
    /// can't tell a GNU driver from an MSVC one.
    pub fn locate(name: &str, kind: ToolKind, language: Language) -> Result<Tool, ToolchainError> {
        let program = which::which(name).map_err(|e| ToolchainError::NotFound(name.to_string(), e))?;
        Ok(Tool::new(program, kind, language))
    }
}

/// Target platform triple. Carried as plain data; nothing here detects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformTriple {
    pub arch: String,
    pub vendor: String,
    pub os: String,
    pub env: Option<String>,
}

impl PlatformTriple {
    pub fn new(arch: impl Into<String>, vendor: impl Into<String>, os: impl Into<String>) -> Self {
        Self { arch: arch.into(), vendor: vendor.into(), os: os.into(), env: None }
    }

    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = Some(env.into());
        self
    }

    pub fn is_windows(&self) -> bool {
        self.os.eq_ignore_ascii_case("windows")
    }

    /// Which shell a generated manual-check run-script should target. The
    /// script is meant to run on the *target*, so this is derived from the
    /// triple, never from `cfg!(target_os = ...)`.
    pub fn target_shell(&self) -> TargetShell {
        match self.os.to_ascii_lowercase().as_str() {
            "windows" => {
                if self.env.as_deref() == Some("gnu") {
                    TargetShell::Posix
                } else {
                    TargetShell::PowerShell
                }
            }
            _ => TargetShell::Posix,
        }
    }
}

impl std::fmt::Display for PlatformTriple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env {
            Some(env) => write!(f, "{}-{}-{}-{}", self.arch, self.vendor, self.os, env),
            None => write!(f, "{}-{}-{}", self.arch, self.vendor, self.os),
        }
    }
}

/// Shell syntax a manual-check run-script is rendered in, chosen from the
/// *target* triple (see [`PlatformTriple::target_shell`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetShell {
    Posix,
    Cmd,
    PowerShell,
}

impl TargetShell {
    pub fn script_extension(&self) -> &'static str {
        match self {
            TargetShell::Posix => "sh",
            TargetShell::Cmd => "bat",
            TargetShell::PowerShell => "ps1",
        }
    }

    pub fn render_exit_code_check(&self, var: &str) -> String {
        match self {
            TargetShell::Posix => format!("echo ${var}"),
            TargetShell::Cmd => format!("echo %{var}%"),
            TargetShell::PowerShell => format!("Write-Output ${var}"),
        }
    }
}

/// Tools keyed by the file extension they compile; the builder selects a
/// tool from the solution's program registry, keyed by file extension.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    by_extension: HashMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: impl Into<String>, tool: Tool) {
        self.by_extension.insert(extension.into(), tool);
    }

    pub fn for_extension(&self, extension: &str) -> Result<Tool, ToolchainError> {
        self.by_extension
            .get(extension)
            .cloned()
            .ok_or_else(|| ToolchainError::NoToolForExtension(extension.to_string()))
    }

    pub fn contains(&self, extension: &str) -> bool {
        self.by_extension.contains_key(extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_looks_up_by_extension() {
        let mut reg = ToolRegistry::new();
        reg.register("c", Tool::new("/usr/bin/cc", ToolKind::Gnu, Language::C));
        assert!(reg.for_extension("c").is_ok());
        assert!(reg.for_extension("rs").is_err());
    }

    #[test]
    fn msvc_tool_reports_import_library() {
        let tool = Tool::new("cl.exe", ToolKind::Msvc, Language::Cxx);
        assert!(tool.produces_import_library());
        let gnu = Tool::new("clang++", ToolKind::Gnu, Language::Cxx);
        assert!(!gnu.produces_import_library());
    }

    #[test]
    fn target_shell_follows_triple_not_host() {
        let win = PlatformTriple::new("x86_64", "pc", "windows");
        assert_eq!(win.target_shell(), TargetShell::PowerShell);
        let linux = PlatformTriple::new("x86_64", "unknown", "linux").with_env("gnu");
        assert_eq!(linux.target_shell(), TargetShell::Posix);
    }
}
