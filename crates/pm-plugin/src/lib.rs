//! Dynamically loaded build-description modules.
//!
//! A package's build description is itself compiled into a shared library
//! and loaded as a plug-in. The ABI is four C-callable symbols:
//!
//! - `sw_get_module_abi_version() -> i32` (required) — checked before
//!   anything else; a mismatch means the module was built against a
//!   different version of this engine, so the file is deleted (the next
//!   run rebuilds it) and loading fails for the current run.
//! - `build(ctx: *mut c_void)` (required) — registers targets into the
//!   opaque `Solution` context.
//! - `check(ctx: *mut c_void)` (optional) — registers checks into the
//!   opaque `Checker` context.
//! - `configure(ctx: *mut c_void)` (optional) — adjusts per-run settings on
//!   the opaque `Build` context before targets are built.
//!
//! Contexts cross the FFI boundary as erased pointers rather than Rust
//! trait objects, since a dynamically loaded module and its host may be
//! built from different compiler versions and can't safely share a vtable
//! layout — `pm-solution` is responsible for interpreting the pointer on
//! its side.
//!
//! The jumppad protocol lets a generator command re-invoke the current
//! process to run a function *inside* an already-loaded module instead of
//! spawning a new external tool: `internal-call-builtin-function <module>
//! <name> <version> <args...>` resolves to the module's
//! `_sw_fn_jumppad_<name>` symbol.

use libloading::{Library, Symbol};
use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("failed to load module {path}: {source}")]
    Load { path: PathBuf, #[source] source: libloading::Error },
    #[error("module {path} is missing required symbol {symbol}")]
    MissingSymbol { path: PathBuf, symbol: String },
    #[error("module {path} reports abi version {found}, expected {expected}; module removed and will be rebuilt")]
    AbiMismatch { path: PathBuf, found: i32, expected: i32 },
    #[error("failed to remove stale module {path}: {source}")]
    RemoveStale { path: PathBuf, #[source] source: std::io::Error },
    #[error("jumppad function {0:?} returned a non-zero status: {1}")]
    JumppadFailed(String, i32),
    #[error("malformed jumppad argument list at position {0}")]
    MalformedArgs(usize),
}

/// ABI version this engine implements. A module built against a different
/// version is considered stale, not merely incompatible.
pub const ABI_VERSION: i32 = 1;

type AbiVersionFn = unsafe extern "C" fn() -> c_int;
type EntryPointFn = unsafe extern "C" fn(*mut c_void);
type JumppadFn = unsafe extern "C" fn(argc: c_int, argv: *const *const c_char) -> c_int;

/// A loaded build-description module.
pub struct Module {
    path: PathBuf,
    library: Library,
}

impl Module {
    /// Load `path`, verifying the ABI version. On mismatch the file is
    /// deleted so the next run rebuilds it, and loading fails for the
    /// current run as a plug-in load failure.
    ///
    /// # Safety
    /// The caller must ensure `path` names a library honoring the ABI
    /// documented on this module: its symbols must have the exact
    /// signatures assumed here.
    pub unsafe fn load(path: impl Into<PathBuf>) -> Result<Self, PluginError> {
        let path = path.into();
        let library = unsafe { Library::new(&path) }.map_err(|e| PluginError::Load { path: path.clone(), source: e })?;

        let abi_version: Symbol<AbiVersionFn> = unsafe { library.get(b"sw_get_module_abi_version\0") }
            .map_err(|_| PluginError::MissingSymbol { path: path.clone(), symbol: "sw_get_module_abi_version".into() })?;
        let found = unsafe { abi_version() };
        if found != ABI_VERSION {
            drop(abi_version);
            drop(library);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| PluginError::RemoveStale { path: path.clone(), source: e })?;
            }
            return Err(PluginError::AbiMismatch { path, found, expected: ABI_VERSION });
        }

        Ok(Self { path, library })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Call the required `build(Solution&)` entry point.
    ///
    /// # Safety
    /// `ctx` must point to a live value of the type the module's `build`
    /// symbol expects to receive (the `Solution` context), for the
    /// duration of the call.
    pub unsafe fn call_build(&self, ctx: *mut c_void) -> Result<(), PluginError> {
        let f: Symbol<EntryPointFn> = unsafe { self.library.get(b"build\0") }
            .map_err(|_| PluginError::MissingSymbol { path: self.path.clone(), symbol: "build".into() })?;
        unsafe { f(ctx) };
        Ok(())
    }

    /// Call the optional `check(Checker&)` entry point if present.
    ///
    /// # Safety
    /// Same contract as [`Module::call_build`].
    pub unsafe fn call_check(&self, ctx: *mut c_void) -> Result<(), PluginError> {
        let Ok(f) = (unsafe { self.library.get::<EntryPointFn>(b"check\0") }) else { return Ok(()) };
        unsafe { f(ctx) };
        Ok(())
    }

    /// Call the optional `configure(Build&)` entry point if present.
    ///
    /// # Safety
    /// Same contract as [`Module::call_build`].
    pub unsafe fn call_configure(&self, ctx: *mut c_void) -> Result<(), PluginError> {
        let Ok(f) = (unsafe { self.library.get::<EntryPointFn>(b"configure\0") }) else { return Ok(()) };
        unsafe { f(ctx) };
        Ok(())
    }

    /// Resolve and invoke `_sw_fn_jumppad_<name>` for the builtin
    /// sub-command protocol.
    ///
    /// # Safety
    /// `args` must be representable as NUL-free strings; the jumppad
    /// symbol must accept `argc`/`argv` in the documented shape.
    pub unsafe fn call_jumppad(&self, name: &str, args: &[String]) -> Result<i32, PluginError> {
        let symbol_name = jumppad_symbol_name(name);
        let mut sym_bytes = symbol_name.into_bytes();
        sym_bytes.push(0);
        let f: Symbol<JumppadFn> = unsafe { self.library.get(&sym_bytes) }
            .map_err(|_| PluginError::MissingSymbol { path: self.path.clone(), symbol: String::from_utf8_lossy(&sym_bytes).into_owned() })?;

        let cstrings: Vec<CString> = args.iter().map(|a| CString::new(a.as_str()).unwrap_or_default()).collect();
        let ptrs: Vec<*const c_char> = cstrings.iter().map(|c| c.as_ptr()).collect();
        let status = unsafe { f(ptrs.len() as c_int, ptrs.as_ptr()) };
        Ok(status)
    }
}

/// Symbol name for a jumppad function, following the
/// `_sw_fn_jumppad_<name>` convention.
pub fn jumppad_symbol_name(name: &str) -> String {
    format!("_sw_fn_jumppad_{name}")
}

/// Leading argument that marks a builtin sub-command invocation:
/// `internal-call-builtin-function <module> <name> <version> <args...>`.
pub const JUMPPAD_COMMAND: &str = "internal-call-builtin-function";

/// Parsed form of a jumppad invocation line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumppadInvocation {
    pub module: PathBuf,
    pub function: String,
    pub version: u32,
    pub args: Vec<String>,
}

impl JumppadInvocation {
    /// Parse `internal-call-builtin-function <module> <name> <version>
    /// <args...>` out of a process's argument vector (with argv[0]
    /// already stripped).
    pub fn parse(argv: &[String]) -> Option<Self> {
        if argv.first().map(String::as_str) != Some(JUMPPAD_COMMAND) {
            return None;
        }
        let module = argv.get(1)?.clone();
        let function = argv.get(2)?.clone();
        let version: u32 = argv.get(3)?.parse().ok()?;
        let args = argv.get(4..).unwrap_or(&[]).to_vec();
        Some(Self { module: PathBuf::from(module), function, version, args })
    }

    pub fn into_argv(self) -> Vec<String> {
        let mut argv = vec![
            JUMPPAD_COMMAND.to_string(),
            self.module.to_string_lossy().into_owned(),
            self.function,
            self.version.to_string(),
        ];
        argv.extend(self.args);
        argv
    }
}

/// A single decoded argument in the jumppad wire format: either a plain
/// string or a variable-arity set preceded by a length prefix (e.g. a file
/// set is encoded as `N path_1 ... path_N`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JumppadArg {
    Str(String),
    FileSet(Vec<PathBuf>),
}

/// Encode a sequence of [`JumppadArg`]s into the flat string vector a
/// jumppad call transmits as `argv`.
pub fn encode_jumppad_args(args: &[JumppadArg]) -> Vec<String> {
    let mut out = Vec::new();
    for arg in args {
        match arg {
            JumppadArg::Str(s) => out.push(s.clone()),
            JumppadArg::FileSet(paths) => {
                out.push(paths.len().to_string());
                out.extend(paths.iter().map(|p| p.to_string_lossy().into_owned()));
            }
        }
    }
    out
}

/// Decode one `JumppadArg::FileSet` starting at `pos` in a flat string
/// vector: `pos` names the length prefix, the following `N` tokens name
/// paths. Returns the parsed set and the index just past it.
pub fn decode_file_set(argv: &[String], pos: usize) -> Result<(Vec<PathBuf>, usize), PluginError> {
    let count: usize = argv.get(pos).ok_or(PluginError::MalformedArgs(pos))?.parse().map_err(|_| PluginError::MalformedArgs(pos))?;
    let start = pos + 1;
    let end = start + count;
    if end > argv.len() {
        return Err(PluginError::MalformedArgs(pos));
    }
    Ok((argv[start..end].iter().map(PathBuf::from).collect(), end))
}

/// Shared module store keyed by canonical path. Concurrent readers share
/// access via an upgrade mutex; loading a module not yet cached takes the
/// writer slot alone.
#[derive(Default)]
pub struct ModuleStore {
    loaded: RwLock<HashMap<PathBuf, Arc<Module>>>,
}

impl ModuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the already-loaded module for `path`, or load and cache it.
    ///
    /// # Safety
    /// Same contract as [`Module::load`].
    pub unsafe fn get_or_load(&self, path: impl Into<PathBuf>) -> Result<Arc<Module>, PluginError> {
        let path = path.into();
        if let Some(m) = self.loaded.read().unwrap().get(&path) {
            return Ok(Arc::clone(m));
        }
        let mut write = self.loaded.write().unwrap();
        if let Some(m) = write.get(&path) {
            return Ok(Arc::clone(m));
        }
        let module = Arc::new(unsafe { Module::load(&path) }?);
        write.insert(path, Arc::clone(&module));
        Ok(module)
    }

    pub fn len(&self) -> usize {
        self.loaded.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jumppad_symbol_name_follows_convention() {
        assert_eq!(jumppad_symbol_name("generate_header"), "_sw_fn_jumppad_generate_header");
    }

    #[test]
    fn parses_builtin_invocation_from_argv() {
        let argv = vec![
            "internal-call-builtin-function".to_string(),
            "/path/to/module.so".to_string(),
            "copy_file".to_string(),
            "1".to_string(),
            "src.txt".to_string(),
            "dst.txt".to_string(),
        ];
        let parsed = JumppadInvocation::parse(&argv).unwrap();
        assert_eq!(parsed.function, "copy_file");
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.args, vec!["src.txt".to_string(), "dst.txt".to_string()]);
    }

    #[test]
    fn non_jumppad_argv_returns_none() {
        let argv = vec!["build".to_string()];
        assert!(JumppadInvocation::parse(&argv).is_none());
    }

    #[test]
    fn round_trips_invocation_through_argv() {
        let inv = JumppadInvocation {
            module: PathBuf::from("m.so"),
            function: "f".into(),
            version: 2,
            args: vec!["a".into()],
        };
        let argv = inv.clone().into_argv();
        let reparsed = JumppadInvocation::parse(&argv).unwrap();
        assert_eq!(inv, reparsed);
    }

    #[test]
    fn encodes_and_decodes_file_set_with_length_prefix() {
        let args = vec![
            JumppadArg::Str("out.o".to_string()),
            JumppadArg::FileSet(vec![PathBuf::from("a.h"), PathBuf::from("b.h")]),
        ];
        let argv = encode_jumppad_args(&args);
        assert_eq!(argv, vec!["out.o", "2", "a.h", "b.h"]);

        let (files, next) = decode_file_set(&argv, 1).unwrap();
        assert_eq!(files, vec![PathBuf::from("a.h"), PathBuf::from("b.h")]);
        assert_eq!(next, argv.len());
    }

    #[test]
    fn decode_file_set_rejects_truncated_list() {
        let argv = vec!["3".to_string(), "a.h".to_string()];
        assert!(decode_file_set(&argv, 0).is_err());
    }

    #[test]
    fn module_store_starts_empty() {
        let store = ModuleStore::new();
        assert!(store.is_empty());
    }
}
