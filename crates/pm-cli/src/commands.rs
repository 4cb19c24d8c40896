//! Command implementations. Each function owns exactly one subcommand and
//! does nothing the library crates don't already expose; this module only
//! wires their narrow interfaces together and turns failures into rich
//! diagnostics.

use crate::probe;
use miette::{IntoDiagnostic, Result};
use pm_checks::CheckSet;
use pm_config::Config;
use pm_diagnostics::PmError;
use pm_fingerprint::FingerprintDb;
use pm_index_client::IndexClient;
use pm_plan::FailureBound;
use pm_registry::{IndexDb, ResolvedEntry};
use pm_resolver::{resolve_install_verify, Resolution};
use pm_solution::{Build, ConfigurationName, LibrariesType, Solution, SolutionKey};
use pm_source::Source;
use pm_store::{OverrideRecord, Store};
use pm_target::{ConfigurationType, OptionBundle, OptionScope, Target, TargetKind};
use pm_toolchain::{Language, PlatformTriple, Tool, ToolKind, ToolRegistry};
use pm_types::{PackageId, PackagePath, Version, VersionRange};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn parse_request(request: &str) -> Result<(PackagePath, VersionRange)> {
    let (path_str, range_str) = match request.split_once('@') {
        Some((p, r)) => (p, r),
        None => (request, "*"),
    };
    let path = PackagePath::parse(path_str).map_err(|e| PmError::InvalidPackagePath(e.to_string()))?;
    let range = VersionRange::parse(range_str).map_err(|e| PmError::InvalidVersionRange(e.to_string()))?;
    Ok((path, range))
}

fn host_triple() -> PlatformTriple {
    let arch = std::env::consts::ARCH;
    let os = std::env::consts::OS;
    let triple = PlatformTriple::new(arch, "unknown", os);
    if os == "linux" {
        triple.with_env("gnu")
    } else {
        triple
    }
}

fn host_tool_registry() -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    let cc = Tool::locate("cc", ToolKind::Gnu, Language::C).map_err(|e| PmError::Generic(format!("toolchain lookup failed: {e}")))?;
    let cxx = Tool::locate("c++", ToolKind::Gnu, Language::Cxx).unwrap_or_else(|_| cc.clone());
    registry.register("c", cc.clone());
    registry.register("cpp", cxx);
    registry.register("s", cc.clone());
    registry.register("o-link", cc);
    if let Ok(ar) = Tool::locate("ar", ToolKind::Librarian, Language::C) {
        registry.register("a-archive", ar);
    }
    Ok(registry)
}

// ---------------------------------------------------------------------
// install
// ---------------------------------------------------------------------

/// Resolve every request (and its transitive dependencies) against the
/// remote index and install the results into the content-addressed store.
///
/// The real `find_dependencies` wire protocol (out of scope for the core)
/// already resolves a path to a single authoritative version server-side,
/// so there is no catalog of candidate versions for PubGrub to choose
/// among here; this walks `IndexDb::resolve_exact` breadth-first instead of
/// running `pm_resolver::Resolver`, which is reserved for callers (e.g. a
/// lockfile regenerator) that do hold a fully prefetched version catalog.
pub async fn install(config: &Config, requests: Vec<String>) -> Result<()> {
    let store = Store::open(&config.store_root).map_err(|e| PmError::filesystem(e.to_string()))?;
    let mut index = IndexDb::open(&config.store_root, config.refresh_window_secs).map_err(|e| PmError::filesystem(e.to_string()))?;
    let client = IndexClient::new(&config.index_url);
    let now = now_unix();

    let mut resolution = Resolution::default();
    let mut frontier: Vec<(PackagePath, VersionRange)> = Vec::new();
    for request in &requests {
        frontier.push(parse_request(request)?);
    }

    let mut visited = std::collections::HashSet::new();
    while let Some((path, range)) = frontier.pop() {
        let key = path.lowercase_joined();
        if !visited.insert(key.clone()) {
            continue;
        }

        // Overrides bypass the index entirely; the local filesystem is
        // authoritative, so a path with no published index entry at all
        // (purely local, never pushed) must still resolve.
        if let Some(record) = store.overridden_package(&key).map_err(|e| PmError::filesystem(e.to_string()))? {
            resolution.packages.insert(key, record.version);
            for dep_path in &record.dependencies {
                if let Ok(dep) = PackagePath::parse(dep_path) {
                    frontier.push((dep, VersionRange::any()));
                }
            }
            continue;
        }

        let entry = index
            .resolve_exact(&path, &range, &client, now)
            .await
            .map_err(|e| PmError::no_such_version(key.clone(), format!("{range:?}"), vec![e.to_string()]))?;
        let version = Version::parse(&entry.version).map_err(|e| PmError::InvalidVersionRange(e.to_string()))?;
        resolution.packages.insert(key, version);
        for dep_path in &entry.dependency_ids {
            if let Ok(dep) = PackagePath::parse(dep_path) {
                frontier.push((dep, VersionRange::any()));
            }
        }
    }

    let mut already_installed: HashMap<String, PackageId> = HashMap::new();
    let outcomes = resolve_install_verify(&resolution, &mut already_installed, &mut index, &client, &store, now, |entry: &ResolvedEntry| {
        let store = &store;
        async move {
            let id = entry.package_id().map_err(|e| pm_source::SourceError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
            let dest = store.package_dir(&id);
            let url = format!("{}/{}-{}.tar.gz", entry.prefix.trim_end_matches('/'), entry.path, entry.version);
            let source = Source::RemoteFile { url };
            source.download(&dest).await?;
            Ok(dest)
        }
    })
    .await;

    let mut failures = Vec::new();
    for (path, outcome) in outcomes {
        match outcome {
            Ok(installed) => match &installed.override_dir {
                Some(dir) => println!("overridden {path} -> {}", dir.display()),
                None => println!("installed {path} ({})", installed.hash),
            },
            Err(e) => failures.push(format!("{path}: {e}")),
        }
    }
    if !failures.is_empty() {
        return Err(PmError::Generic(failures.join("; ")).into());
    }
    Ok(())
}

// ---------------------------------------------------------------------
// tree
// ---------------------------------------------------------------------

pub fn tree(config: &Config, pattern: Option<String>) -> Result<()> {
    let index = IndexDb::open(&config.store_root, config.refresh_window_secs).map_err(|e| PmError::filesystem(e.to_string()))?;
    let pattern = pattern.unwrap_or_default();
    let mut paths = index.get_matching_packages(&pattern);
    paths.sort();
    for path_key in paths {
        let Ok(path) = PackagePath::parse(&path_key) else { continue };
        let mut versions = index.get_versions_for_package(&path);
        versions.sort();
        let rendered: Vec<String> = versions.iter().map(|v| v.to_string()).collect();
        println!("{path_key}: {}", rendered.join(", "));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// clean
// ---------------------------------------------------------------------

/// Remove installed packages whose path matches `filter`, per the store's
/// "removal by explicit clean with a regex filter; optional cascade to
/// dependents" lifecycle.
pub fn clean(config: &Config, filter: &str, cascade: bool) -> Result<()> {
    let re = Regex::new(filter).map_err(|e| PmError::Generic(format!("invalid clean filter: {e}")))?;
    let index = IndexDb::open(&config.store_root, config.refresh_window_secs).map_err(|e| PmError::filesystem(e.to_string()))?;
    let store = Store::open(&config.store_root).map_err(|e| PmError::filesystem(e.to_string()))?;

    let mut matched: Vec<String> = index.get_matching_packages("").into_iter().filter(|p| re.is_match(p)).collect();
    if cascade {
        let all = index.get_matching_packages("");
        let mut changed = true;
        while changed {
            changed = false;
            for path_key in &all {
                if matched.contains(path_key) {
                    continue;
                }
                let Ok(path) = PackagePath::parse(path_key) else { continue };
                for version in index.get_versions_for_package(&path) {
                    if let Ok(entry) = index.resolve_exact_offline(&path, &VersionRange::exact(version), now_unix()) {
                        if entry.dependency_ids.iter().any(|d| matched.contains(d)) {
                            matched.push(path_key.clone());
                            changed = true;
                            break;
                        }
                    }
                }
            }
        }
    }

    let mut removed = 0usize;
    for path_key in &matched {
        let Ok(path) = PackagePath::parse(path_key) else { continue };
        for version in index.get_versions_for_package(&path) {
            let id = PackageId::new(path.clone(), version);
            if store.is_installed(&id) {
                let dir = store.package_dir(&id);
                std::fs::remove_dir_all(&dir).map_err(|e| PmError::filesystem(e.to_string()))?;
                removed += 1;
            }
        }
    }
    println!("removed {removed} package director{}", if removed == 1 { "y" } else { "ies" });
    Ok(())
}

// ---------------------------------------------------------------------
// override
// ---------------------------------------------------------------------

pub fn override_package(config: &Config, request: &str, dir: PathBuf) -> Result<()> {
    let (path, range) = parse_request(request)?;
    let store = Store::open(&config.store_root).map_err(|e| PmError::filesystem(e.to_string()))?;
    let index = IndexDb::open(&config.store_root, config.refresh_window_secs).map_err(|e| PmError::filesystem(e.to_string()))?;

    let versions = index.get_versions_for_package(&path);
    let version = range.max_satisfying(versions.iter()).cloned().unwrap_or(Version::Any);
    let id = PackageId::new(path, version);

    let dir = dir.canonicalize().into_diagnostic()?;
    let prefix_length = id.path.elements().len();
    let record = OverrideRecord::new(dir, prefix_length, -(now_unix().max(1)), id.version.clone());
    store.override_package(&id, record).map_err(|e| PmError::filesystem(e.to_string()))?;
    println!("overrode {id}");
    Ok(())
}

// ---------------------------------------------------------------------
// build / check
// ---------------------------------------------------------------------

fn demo_solution(config: &Config, release: bool) -> Result<Solution> {
    let configuration = if release { ConfigurationName::Release } else { ConfigurationName::Debug };
    let key = SolutionKey {
        triple: host_triple().to_string(),
        libraries: LibrariesType::Static,
        configuration,
        compiler: "gnu".to_string(),
    };
    let tools = host_tool_registry()?;
    let config_name = key.config_name();
    Ok(Solution::new(
        key,
        host_triple(),
        tools,
        config.checks_cache_path(&config_name),
        config.manual_checks_path(&config_name),
        config.tmp_build_dir(&config_name),
    ))
}

fn load_demo_target(solution: &mut Solution, configuration: ConfigurationType) {
    let path = PackagePath::parse("pm.cli.demo").expect("valid literal path");
    let mut target = Target::new("demo", path, TargetKind::Executable, Language::C).with_configuration(configuration);
    target.sources = vec![PathBuf::from("src/main.c")];
    target = target.with_scoped(OptionScope::Public, OptionBundle::default());
    solution.add_target(target);
}

pub fn build(config: &Config, plugin: PathBuf, release: bool, jobs: Option<usize>) -> Result<()> {
    let mut solution = demo_solution(config, release)?;
    load_demo_target(&mut solution, solution.key.configuration.as_target_configuration());

    let mut build = Build::new();
    build.add_solution(solution);

    // SAFETY: the caller passes a module implementing the documented ABI.
    unsafe { build.load_plugin(&plugin) }.map_err(|e| PmError::PluginLoadFailed(e.to_string()))?;

    let work_dir = std::env::temp_dir().join("pm-checks");
    for solution in &mut build.solutions {
        let set = CheckSet::new(&solution.triple);
        solution.checker_mut().accumulate(&set);
        let tools = solution.tools.clone();
        solution
            .perform_checks(|check| probe::run_probe(&tools, &work_dir, check))
            .map_err(|e| PmError::CheckFailed(e.to_string()))?;
    }

    build.prepare().map_err(|e| PmError::BuildFailed {
        target: plugin.display().to_string(),
        src: Some(e.to_string()),
        span: None,
    })?;

    let fingerprints = FingerprintDb::open(config.store_root.join("etc").join("fingerprints.json")).map_err(|e| PmError::filesystem(e.to_string()))?;
    let bound = if config.stop_on_first_error { FailureBound::StopOnFirst } else { FailureBound::ContinueUpTo(usize::MAX) };
    let jobs = jobs.or(config.jobs).unwrap_or_else(num_cpus);

    let summaries = build
        .execute(jobs, bound, Some(&fingerprints), |command| probe::run_command(command, &fingerprints))
        .map_err(|e| PmError::BuildFailed {
            target: plugin.display().to_string(),
            src: Some(e.to_string()),
            span: None,
        })?;
    fingerprints.save().map_err(|e| PmError::filesystem(e.to_string()))?;

    for summary in &summaries {
        println!(
            "{} succeeded, {} cached, {} failed, {} skipped",
            summary.succeeded.len(),
            summary.cached.len(),
            summary.failed.len(),
            summary.skipped.len()
        );
        for (id, reason) in &summary.failed {
            eprintln!("failed: {id}: {reason}");
        }
        if !summary.failed.is_empty() {
            return Err(PmError::Suppressed("build failed".to_string()).into());
        }
    }
    Ok(())
}

pub fn check(config: &Config, plugin: PathBuf, release: bool) -> Result<()> {
    let mut solution = demo_solution(config, release)?;
    load_demo_target(&mut solution, solution.key.configuration.as_target_configuration());

    let mut build = Build::new();
    build.add_solution(solution);
    unsafe { build.load_plugin(&plugin) }.map_err(|e| PmError::PluginLoadFailed(e.to_string()))?;

    let work_dir = std::env::temp_dir().join("pm-checks");
    for solution in &mut build.solutions {
        let set = CheckSet::new(&solution.triple);
        solution.checker_mut().accumulate(&set);
        let tools = solution.tools.clone();
        solution
            .perform_checks(|check| probe::run_probe(&tools, &work_dir, check))
            .map_err(|e| PmError::CheckFailed(e.to_string()))?;
    }
    println!("checks complete");
    Ok(())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
