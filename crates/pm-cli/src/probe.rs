//! Subprocess wiring for check probes and command execution.
//!
//! `pm-checks` and `pm-plan` both take their actual process-spawning as an
//! injected closure so the scheduling/caching crates stay free of I/O; this
//! module is where the CLI supplies that closure, the same separation
//! `pm-resolver::resolve_install_verify` uses for fetching.

use pm_checks::{Check, ProbeOutcome, ProbeStage};
use pm_command::Command as PmCommand;
use pm_fingerprint::FingerprintDb;
use pm_toolchain::{Language, ToolRegistry};
use std::path::Path;
use std::process::Command as StdCommand;

fn language_extension(language: Language) -> &'static str {
    match language {
        Language::C => "c",
        Language::Cxx => "cpp",
        Language::Asm => "s",
    }
}

/// Compile (and, for `Links`/`Runs`, link and optionally execute) one probe
/// program under `work_dir`, using whatever tool the solution's registry
/// has registered for the check's language.
pub fn run_probe(tools: &ToolRegistry, work_dir: &Path, check: &Check) -> Result<ProbeOutcome, String> {
    std::fs::create_dir_all(work_dir).map_err(|e| e.to_string())?;
    let ext = language_extension(check.params.language);
    let source = work_dir.join(format!("probe-{}.{ext}", &check.hash()[..16]));
    std::fs::write(&source, &check.data).map_err(|e| e.to_string())?;

    let tool = tools.for_extension(ext).map_err(|e| e.to_string())?;
    let object = source.with_extension("o");
    let mut compile = StdCommand::new(tool.program());
    compile.args(&tool.base_args).arg("-c").arg(&source).arg("-o").arg(&object);
    let compiled = compile.output().map_err(|e| e.to_string())?;
    if !compiled.status.success() {
        return Ok(ProbeOutcome::Value(0));
    }
    if check.kind.stage() == ProbeStage::Compile {
        return Ok(ProbeOutcome::Value(1));
    }

    let binary = source.with_extension("out");
    let mut link = StdCommand::new(tool.program());
    link.arg(&object).arg("-o").arg(&binary);
    let linked = link.output().map_err(|e| e.to_string())?;
    if !linked.status.success() {
        return Ok(ProbeOutcome::Value(0));
    }
    if check.kind.stage() == ProbeStage::Link {
        return Ok(ProbeOutcome::Value(1));
    }

    match StdCommand::new(&binary).output() {
        Ok(output) => Ok(ProbeOutcome::Value(output.status.code().unwrap_or(-1))),
        Err(_) => Ok(ProbeOutcome::RequiresManualRun),
    }
}

/// Actually spawn one constructed build command, recording the
/// fingerprints `pm-plan` will consult on the next run.
pub fn run_command(command: &PmCommand, fingerprints: &FingerprintDb) -> Result<(), String> {
    std::fs::create_dir_all(&command.working_dir).map_err(|e| e.to_string())?;
    for parent in command.outputs.iter().filter_map(|p| p.parent()) {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }

    let args = command.resolve_args();
    let output = StdCommand::new(&command.program)
        .args(&args)
        .current_dir(&command.working_dir)
        .envs(&command.env)
        .output()
        .map_err(|e| format!("failed to spawn {}: {e}", command.program.display()))?;

    if !output.status.success() {
        return Err(format!(
            "{} exited with {}: {}",
            command.program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    for input in &command.inputs {
        let _ = fingerprints.update(input, None, None);
    }
    let deps = pm_command::extract_implicit_dependencies(
        pm_toolchain::ToolKind::Gnu,
        &String::from_utf8_lossy(&output.stdout),
        None,
    );
    let implicit = (!deps.is_empty()).then(|| deps.into_iter().collect());
    for produced in &command.outputs {
        let _ = fingerprints.update(produced, Some(command.hash()), implicit.clone());
    }
    Ok(())
}
