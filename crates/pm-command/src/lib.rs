//! Command construction: one [`Command`] per tool invocation, built by
//! cloning a [`pm_toolchain::Tool`] per source file so per-file options may
//! diverge without touching the shared registry entry.
//!
//! Argument composition supports three shapes layered on top of plain
//! literals:
//! - [`ArgSlot::Lazy`] callbacks that resolve to a string only once the
//!   plan is being prepared (a path not known at construction time).
//! - Deferred actions ([`Command::push_deferred`]) run during `prepare()`,
//!   for post-hoc wiring such as adding a dependency id discovered after
//!   every command in the plan exists.
//! - Response files ([`response_file`]) once the combined argument length
//!   crosses a platform threshold.

use blake3::Hasher;
use pm_fingerprint::{parse_gnu_depfile, parse_msvc_includes};
use pm_toolchain::{Language, Tool, ToolKind};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("source file {0:?} has no extension to select a tool by")]
    NoExtension(PathBuf),
    #[error("failed to write response file {path:?}: {source}")]
    ResponseFileWrite { path: PathBuf, #[source] source: io::Error },
}

/// How a [`Command`]'s stored variant should be reconstructed on
/// deserialization, matching the plan file's command-kind tag
/// (generic/VS/GNU/builtin).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Generic,
    Msvc,
    Gnu,
    Builtin,
}

impl CommandKind {
    pub fn from_tool_kind(kind: ToolKind) -> Self {
        match kind {
            ToolKind::Msvc => CommandKind::Msvc,
            ToolKind::Gnu | ToolKind::Librarian => CommandKind::Gnu,
            ToolKind::Builtin => CommandKind::Builtin,
        }
    }
}

/// One argument to a [`Command`]: either fixed at construction time or
/// resolved lazily at prepare-time.
#[derive(Clone)]
pub enum ArgSlot {
    Literal(String),
    Lazy(Arc<dyn Fn() -> String + Send + Sync>),
}

impl ArgSlot {
    pub fn literal(value: impl Into<String>) -> Self {
        ArgSlot::Literal(value.into())
    }

    pub fn lazy(f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        ArgSlot::Lazy(Arc::new(f))
    }

    pub fn resolve(&self) -> String {
        match self {
            ArgSlot::Literal(s) => s.clone(),
            ArgSlot::Lazy(f) => f(),
        }
    }
}

impl std::fmt::Debug for ArgSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgSlot::Literal(s) => write!(f, "Literal({s:?})"),
            ArgSlot::Lazy(_) => write!(f, "Lazy(..)"),
        }
    }
}

type DeferredAction = Box<dyn FnOnce(&mut Command) + Send + Sync>;

/// A single tool invocation. Built by [`CommandBuilder`], scheduled by
/// `pm-plan`.
pub struct Command {
    /// Stable, pointer-sized-in-spirit id used only within one plan file;
    /// never meaningful across runs.
    pub id: String,
    pub kind: CommandKind,
    pub program: PathBuf,
    pub working_dir: PathBuf,
    pub args: Vec<ArgSlot>,
    pub env: BTreeMap<String, String>,
    pub dependency_ids: Vec<String>,
    pub inputs: Vec<PathBuf>,
    pub intermediates: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub stdout_redirect: Option<PathBuf>,
    pub stderr_redirect: Option<PathBuf>,
    deferred: Vec<DeferredAction>,
}

impl Command {
    pub fn new(id: impl Into<String>, kind: CommandKind, program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            kind,
            program: program.into(),
            working_dir: working_dir.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            dependency_ids: Vec::new(),
            inputs: Vec::new(),
            intermediates: Vec::new(),
            outputs: Vec::new(),
            stdout_redirect: None,
            stderr_redirect: None,
            deferred: Vec::new(),
        }
    }

    pub fn push_arg(&mut self, arg: ArgSlot) {
        self.args.push(arg);
    }

    pub fn push_literal(&mut self, arg: impl Into<String>) {
        self.args.push(ArgSlot::literal(arg));
    }

    /// Queue an action to run once, during `prepare()`, after every command
    /// in the plan is known — e.g. wiring a dependency id discovered from a
    /// sibling command's resolved outputs.
    pub fn push_deferred(&mut self, action: impl FnOnce(&mut Command) + Send + Sync + 'static) {
        self.deferred.push(Box::new(action));
    }

    /// Run every queued deferred action, in the order they were pushed.
    pub fn run_deferred(&mut self) {
        let actions = std::mem::take(&mut self.deferred);
        for action in actions {
            action(self);
        }
    }

    /// Resolve every argument slot to its final string form. Built-in
    /// commands sort their argv so two functionally identical invocations
    /// hash identically regardless of construction order; every other kind
    /// preserves declaration order since it's meaningful (e.g. `-I` next to
    /// its path).
    pub fn resolve_args(&self) -> Vec<String> {
        let mut resolved: Vec<String> = self.args.iter().map(ArgSlot::resolve).collect();
        if self.kind == CommandKind::Builtin {
            resolved.sort();
        }
        resolved
    }

    /// Content hash covering program path, resolved argv, and environment —
    /// the same fields used to decide whether a cached plan entry is still
    /// valid.
    pub fn hash(&self) -> String {
        let mut hasher = Hasher::new_derive_key("pm-command command v1");
        hasher.update(self.program.to_string_lossy().as_bytes());
        for arg in self.resolve_args() {
            hasher.update(arg.as_bytes());
            hasher.update(b"\0");
        }
        for (key, value) in &self.env {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\0");
        }
        hasher.finalize().to_hex().to_string()
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("program", &self.program)
            .field("args", &self.args)
            .finish()
    }
}

/// Platform argument-length threshold past which [`response_file`] should
/// be used instead of a literal argv (conservative; well under the
/// ~32k-character Windows command-line limit and the typical Linux
/// `ARG_MAX`).
pub const RESPONSE_FILE_THRESHOLD: usize = 30_000;

pub fn needs_response_file(args: &[String]) -> bool {
    args.iter().map(|a| a.len() + 1).sum::<usize>() > RESPONSE_FILE_THRESHOLD
}

/// Write `args` to `rsp/<hash>.rsp` under `rsp_dir`, one argument per line,
/// quoting any argument containing whitespace. Returns the path the caller
/// should pass to the tool as `@<path>`.
pub fn response_file(rsp_dir: &Path, hash: &str, args: &[String]) -> Result<PathBuf, CommandError> {
    fs::create_dir_all(rsp_dir).map_err(|e| CommandError::ResponseFileWrite { path: rsp_dir.to_path_buf(), source: e })?;
    let path = rsp_dir.join(format!("{hash}.rsp"));
    let mut content = String::new();
    for arg in args {
        if arg.chars().any(char::is_whitespace) {
            content.push('"');
            content.push_str(arg);
            content.push('"');
        } else {
            content.push_str(arg);
        }
        content.push('\n');
    }
    fs::write(&path, content).map_err(|e| CommandError::ResponseFileWrite { path: path.clone(), source: e })?;
    Ok(path)
}

/// Builds [`Command`]s from a [`Tool`], cloning it per source file so a
/// per-file language override or extra define never mutates a shared
/// registry entry.
pub struct CommandBuilder;

impl CommandBuilder {
    pub fn build_compile_command(
        id: impl Into<String>,
        tool: &Tool,
        source: &Path,
        object: &Path,
        working_dir: &Path,
        include_dirs: &[PathBuf],
        definitions: &[String],
        compile_options: &[String],
    ) -> Result<Command, CommandError> {
        if source.extension().is_none() {
            return Err(CommandError::NoExtension(source.to_path_buf()));
        }
        let mut command = Command::new(id, CommandKind::from_tool_kind(tool.kind()), tool.program(), working_dir);
        for arg in &tool.base_args {
            command.push_literal(arg.clone());
        }
        for dir in include_dirs {
            command.push_literal(format!("-I{}", dir.display()));
        }
        for def in definitions {
            command.push_literal(format!("-D{def}"));
        }
        for opt in compile_options {
            command.push_literal(opt.clone());
        }
        command.push_literal("-c");
        command.push_literal(source.display().to_string());
        command.push_literal("-o");
        command.push_literal(object.display().to_string());
        command.inputs.push(source.to_path_buf());
        command.outputs.push(object.to_path_buf());
        Ok(command)
    }
}

/// Strip an MSVC-style compiler's `Note: including file:` lines or parse a
/// GNU-style `.d` fragment into the implicit dependency set a just-run
/// compile command's output file record should carry, feeding
/// `pm-fingerprint::FileRecord::implicit_deps`.
pub fn extract_implicit_dependencies(kind: ToolKind, stdout: &str, depfile_content: Option<&str>) -> Vec<PathBuf> {
    match kind {
        ToolKind::Msvc => parse_msvc_includes(stdout),
        ToolKind::Gnu => depfile_content.map(parse_gnu_depfile).unwrap_or_default(),
        ToolKind::Librarian | ToolKind::Builtin => Vec::new(),
    }
}

/// Language a command's source file is written in, surfaced for callers
/// that branch on it (e.g. selecting a probe language for a related
/// check). Kept here rather than re-derived from the tool so a caller never
/// needs to hold onto the `Tool` after building the command.
pub fn command_language(tool: &Tool) -> Language {
    tool.language
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_toolchain::{Language, Tool, ToolKind};
    use tempfile::TempDir;

    #[test]
    fn identical_args_hash_equal_regardless_of_builtin_order() {
        let mut a = Command::new("a", CommandKind::Builtin, "/bin/tool", "/work");
        a.push_literal("--beta");
        a.push_literal("--alpha");

        let mut b = Command::new("b", CommandKind::Builtin, "/bin/tool", "/work");
        b.push_literal("--alpha");
        b.push_literal("--beta");

        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn generic_command_argument_order_is_significant() {
        let mut a = Command::new("a", CommandKind::Gnu, "/bin/cc", "/work");
        a.push_literal("-I/one");
        a.push_literal("-I/two");

        let mut b = Command::new("b", CommandKind::Gnu, "/bin/cc", "/work");
        b.push_literal("-I/two");
        b.push_literal("-I/one");

        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn lazy_arg_resolves_at_resolve_time() {
        let mut command = Command::new("c", CommandKind::Generic, "/bin/tool", "/work");
        command.push_arg(ArgSlot::lazy(|| "late-bound".to_string()));
        assert_eq!(command.resolve_args(), vec!["late-bound".to_string()]);
    }

    #[test]
    fn deferred_action_runs_once_during_prepare() {
        let mut command = Command::new("c", CommandKind::Generic, "/bin/tool", "/work");
        command.push_deferred(|cmd| cmd.dependency_ids.push("discovered-later".to_string()));
        assert!(command.dependency_ids.is_empty());
        command.run_deferred();
        assert_eq!(command.dependency_ids, vec!["discovered-later".to_string()]);
    }

    #[test]
    fn response_file_used_past_threshold() {
        let short = vec!["-c".to_string()];
        assert!(!needs_response_file(&short));
        let long = vec!["x".repeat(RESPONSE_FILE_THRESHOLD + 1)];
        assert!(needs_response_file(&long));
    }

    #[test]
    fn response_file_quotes_args_with_whitespace() {
        let tmp = TempDir::new().unwrap();
        let path = response_file(tmp.path(), "deadbeef", &["has space".to_string(), "plain".to_string()]).unwrap();
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("\"has space\"\n"));
        assert!(content.contains("plain\n"));
    }

    #[test]
    fn compile_command_records_inputs_and_outputs() {
        let tool = Tool::new("/usr/bin/cc", ToolKind::Gnu, Language::C);
        let command = CommandBuilder::build_compile_command(
            "compile-1",
            &tool,
            Path::new("src/main.c"),
            Path::new("obj/main.o"),
            Path::new("/work"),
            &[PathBuf::from("include")],
            &["FOO=1".to_string()],
            &["-Wall".to_string()],
        )
        .unwrap();

        assert_eq!(command.inputs, vec![PathBuf::from("src/main.c")]);
        assert_eq!(command.outputs, vec![PathBuf::from("obj/main.o")]);
        assert!(command.resolve_args().iter().any(|a| a == "-Iinclude"));
    }

    #[test]
    fn msvc_implicit_includes_are_extracted_from_stdout() {
        let stdout = "Note: including file: C:\\headers\\foo.h\r\ncompiling...\r\n";
        let deps = extract_implicit_dependencies(ToolKind::Msvc, stdout, None);
        assert_eq!(deps, vec![PathBuf::from("C:\\headers\\foo.h")]);
    }
}
