//! The six-pass dependency resolution run over a whole target graph.

use crate::{OptionBundle, OptionScope, Target, TargetError};
use std::collections::HashMap;

/// Run all six passes in place over `targets`, keyed by target name.
pub fn resolve_targets(targets: &mut HashMap<String, Target>) -> Result<(), TargetError> {
    pass1_bind_dependencies(targets)?;
    pass2_flood_fill(targets)?;
    pass3_merge_and_configure(targets)?;
    pass4_circular_links(targets);
    pass5_objects_and_prerequisites(targets);
    pass6_finalize_outputs(targets);
    Ok(())
}

/// Pass 1: every dependency edge must resolve to a target present in the
/// graph. Unbound after this pass is fatal.
fn pass1_bind_dependencies(targets: &HashMap<String, Target>) -> Result<(), TargetError> {
    for target in targets.values() {
        for edge in &target.dependency_edges {
            if !targets.contains_key(&edge.target_name) {
                return Err(TargetError::UnboundDependency(target.name.clone(), edge.target_name.clone()));
            }
        }
    }
    Ok(())
}

/// Pass 2: inheritance flood-fill to a fixed point. Each round recomputes
/// every target's `effective`/`exported` bundles from a snapshot of the
/// previous round so absorption order within a round never matters; the
/// loop stops the first round nothing changes.
fn pass2_flood_fill(targets: &mut HashMap<String, Target>) -> Result<(), TargetError> {
    let names: Vec<String> = targets.keys().cloned().collect();
    // A DAG of N targets converges in at most N rounds; double it as slack
    // before treating non-convergence as an error distinct from the
    // legitimate link cycles Pass 4 handles separately.
    let max_rounds = names.len() * 2 + 2;

    for round in 0..max_rounds {
        let snapshot = targets.clone();
        let mut changed = false;

        for name in &names {
            let owner = &snapshot[name];
            let mut effective = owner.bundle(OptionScope::Private);
            effective.merge_from(&owner.bundle(OptionScope::Protected));
            effective.merge_from(&owner.bundle(OptionScope::Public));
            let mut exported = owner.bundle(OptionScope::Public);
            exported.merge_from(&owner.bundle(OptionScope::Interface));
            let mut headers_only_edges = owner.headers_only_edges.clone();

            for edge in &owner.dependency_edges {
                let dep = &snapshot[&edge.target_name];
                let mut contribution = OptionBundle::default();
                contribution.merge_from(&dep.bundle(OptionScope::Public));
                contribution.merge_from(&dep.bundle(OptionScope::Interface));
                if owner.shares_package_prefix(dep) {
                    contribution.merge_from(&dep.bundle(OptionScope::Protected));
                }
                // Re-export whatever the dependency has itself already
                // absorbed from further down the graph.
                contribution.merge_from(&dep.exported);

                let observed_headers_only = contribution.is_headers_only();
                let prior_headers_only =
                    headers_only_edges.get(&edge.target_name).copied().unwrap_or(true);
                // Monotone: once a non-headers-only contribution is seen
                // along this edge it never reverts to headers-only.
                headers_only_edges
                    .insert(edge.target_name.clone(), prior_headers_only && observed_headers_only);

                if edge.scope != OptionScope::Interface {
                    effective.merge_from(&contribution);
                }
                if matches!(edge.scope, OptionScope::Public | OptionScope::Interface) {
                    exported.merge_from(&contribution);
                }
            }

            let target = targets.get_mut(name).unwrap();
            if target.effective != effective {
                target.effective = effective;
                changed = true;
            }
            if target.exported != exported {
                target.exported = exported;
                changed = true;
            }
            if target.headers_only_edges != headers_only_edges {
                target.headers_only_edges = headers_only_edges;
                changed = true;
            }
        }

        if !changed {
            return Ok(());
        }
        if round == max_rounds - 1 {
            return Err(TargetError::FloodFillDidNotConverge(max_rounds));
        }
    }
    Ok(())
}

/// Pass 3: apply configuration-type defaults and sanity-check the merged
/// option set isn't empty (an empty set after resolution signals a
/// programming error, not a valid empty target).
fn pass3_merge_and_configure(targets: &mut HashMap<String, Target>) -> Result<(), TargetError> {
    for target in targets.values_mut() {
        target.compiler_settings = Some(target.configuration.default_compiler_settings());
        if target.effective.include_dirs.is_empty()
            && target.effective.definitions.is_empty()
            && target.effective.compile_options.is_empty()
            && target.effective.link_libraries.is_empty()
            && target.effective.link_directories.is_empty()
            && target.sources.is_empty()
        {
            return Err(TargetError::EmptyAfterExecution(target.name.clone()));
        }
    }
    Ok(())
}

/// Pass 4: detect circular link dependencies among sibling targets.
/// Participants are marked for the "circular linker" alternate command
/// (links with `force:unresolved` or equivalent) rather than failing the
/// build, since native toolchains can resolve such cycles at link time
/// given cooperating import libraries.
fn pass4_circular_links(targets: &mut HashMap<String, Target>) {
    let names: Vec<String> = targets.keys().cloned().collect();
    let adjacency: HashMap<String, Vec<String>> = names
        .iter()
        .map(|n| (n.clone(), targets[n].dependency_edges.iter().map(|e| e.target_name.clone()).collect()))
        .collect();

    let sccs = tarjan_scc(&names, &adjacency);
    for scc in sccs {
        if scc.len() < 2 {
            continue;
        }
        for name in &scc {
            let target = targets.get_mut(name).unwrap();
            target.circular_linker = true;
            target.circular_partners = scc.iter().filter(|n| *n != name).cloned().collect();
        }
    }
}

/// Tarjan's strongly-connected-components algorithm, iterative to avoid
/// recursion depth limits on deep target graphs.
fn tarjan_scc(names: &[String], adjacency: &HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    struct State {
        index: HashMap<String, usize>,
        lowlink: HashMap<String, usize>,
        on_stack: HashMap<String, bool>,
        stack: Vec<String>,
        next_index: usize,
        sccs: Vec<Vec<String>>,
    }

    fn strongconnect(node: &str, adjacency: &HashMap<String, Vec<String>>, state: &mut State) {
        state.index.insert(node.to_string(), state.next_index);
        state.lowlink.insert(node.to_string(), state.next_index);
        state.next_index += 1;
        state.stack.push(node.to_string());
        state.on_stack.insert(node.to_string(), true);

        if let Some(neighbors) = adjacency.get(node) {
            for neighbor in neighbors {
                if !state.index.contains_key(neighbor) {
                    strongconnect(neighbor, adjacency, state);
                    let nl = state.lowlink[neighbor];
                    let entry = state.lowlink.get_mut(node).unwrap();
                    *entry = (*entry).min(nl);
                } else if *state.on_stack.get(neighbor).unwrap_or(&false) {
                    let ni = state.index[neighbor];
                    let entry = state.lowlink.get_mut(node).unwrap();
                    *entry = (*entry).min(ni);
                }
            }
        }

        if state.lowlink[node] == state.index[node] {
            let mut component = Vec::new();
            loop {
                let member = state.stack.pop().unwrap();
                state.on_stack.insert(member.clone(), false);
                component.push(member.clone());
                if member == node {
                    break;
                }
            }
            state.sccs.push(component);
        }
    }

    let mut state = State {
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashMap::new(),
        stack: Vec::new(),
        next_index: 0,
        sccs: Vec::new(),
    };
    for name in names {
        if !state.index.contains_key(name) {
            strongconnect(name, adjacency, &mut state);
        }
    }
    state.sccs
}

/// Pass 5: set object-file paths (one per source file, alongside the
/// source, extension swapped for the platform object extension) and wire
/// generated-source-file commands as prerequisites for the compile step
/// that consumes them.
fn pass5_objects_and_prerequisites(targets: &mut HashMap<String, Target>) {
    for target in targets.values_mut() {
        target.object_files = target
            .sources
            .iter()
            .map(|src| src.with_extension("o"))
            .collect();
        target.generated_source_prerequisites = target
            .sources
            .iter()
            .filter(|src| !src.exists())
            .map(|src| src.display().to_string())
            .collect();
    }
}

/// Pass 6: finalize output path, import-library path (shared libraries on
/// import-library-producing toolchains), and an export-definitions file
/// when `export_all_symbols` is set.
fn pass6_finalize_outputs(targets: &mut HashMap<String, Target>) {
    for target in targets.values_mut() {
        let output_name = match target.kind {
            crate::TargetKind::Executable => target.name.clone(),
            crate::TargetKind::StaticLibrary => format!("lib{}.a", target.name),
            crate::TargetKind::SharedLibrary => format!("lib{}.so", target.name),
        };
        target.output_path = Some(std::path::PathBuf::from(output_name));

        if matches!(target.kind, crate::TargetKind::SharedLibrary) {
            target.import_library_path = Some(std::path::PathBuf::from(format!("{}.lib", target.name)));
            if target.export_all_symbols {
                target.export_definitions_path = Some(std::path::PathBuf::from(format!("{}.def", target.name)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigurationType, OptionBundle, OptionScope, Target, TargetKind};
    use pm_toolchain::Language;
    use pm_types::PackagePath;
    use std::path::PathBuf;

    fn target(name: &str) -> Target {
        Target::new(name, PackagePath::parse("org.acme.thing").unwrap(), TargetKind::StaticLibrary, Language::C)
            .with_sources([PathBuf::from(format!("{name}.c"))])
    }

    #[test]
    fn unbound_dependency_is_fatal() {
        let mut targets = HashMap::new();
        targets.insert("a".to_string(), target("a").depends_on("missing", OptionScope::Public));
        let err = resolve_targets(&mut targets).unwrap_err();
        assert!(matches!(err, TargetError::UnboundDependency(_, _)));
    }

    #[test]
    fn public_dependency_propagates_to_effective_and_exported() {
        let mut lib_bundle = OptionBundle::default();
        lib_bundle.definitions.push("LIB_FEATURE".to_string());

        let mut targets = HashMap::new();
        targets.insert("lib".to_string(), target("lib").with_scoped(OptionScope::Public, lib_bundle));
        targets.insert("app".to_string(), target("app").depends_on("lib", OptionScope::Public));

        resolve_targets(&mut targets).unwrap();

        let app = &targets["app"];
        assert!(app.effective.definitions.contains(&"LIB_FEATURE".to_string()));
        assert!(app.exported.definitions.contains(&"LIB_FEATURE".to_string()));
    }

    #[test]
    fn private_dependency_does_not_export_onward() {
        let mut lib_bundle = OptionBundle::default();
        lib_bundle.definitions.push("LIB_FEATURE".to_string());

        let mut targets = HashMap::new();
        targets.insert("lib".to_string(), target("lib").with_scoped(OptionScope::Public, lib_bundle));
        targets.insert("app".to_string(), target("app").depends_on("lib", OptionScope::Private));

        resolve_targets(&mut targets).unwrap();

        let app = &targets["app"];
        assert!(app.effective.definitions.contains(&"LIB_FEATURE".to_string()));
        assert!(!app.exported.definitions.contains(&"LIB_FEATURE".to_string()));
    }

    #[test]
    fn protected_dependency_only_flows_to_package_siblings() {
        let mut lib_bundle = OptionBundle::default();
        lib_bundle.definitions.push("SIBLING_ONLY".to_string());

        let sibling = Target::new("sibling", PackagePath::parse("org.acme.thing").unwrap(), TargetKind::StaticLibrary, Language::C)
            .with_sources([PathBuf::from("sibling.c")])
            .depends_on("lib", OptionScope::Public);
        let stranger = Target::new("stranger", PackagePath::parse("org.other.thing").unwrap(), TargetKind::StaticLibrary, Language::C)
            .with_sources([PathBuf::from("stranger.c")])
            .depends_on("lib", OptionScope::Public);

        let mut targets = HashMap::new();
        targets.insert(
            "lib".to_string(),
            Target::new("lib", PackagePath::parse("org.acme.lib").unwrap(), TargetKind::StaticLibrary, Language::C)
                .with_sources([PathBuf::from("lib.c")])
                .with_scoped(OptionScope::Protected, lib_bundle),
        );
        targets.insert("sibling".to_string(), sibling);
        targets.insert("stranger".to_string(), stranger);

        resolve_targets(&mut targets).unwrap();

        assert!(targets["sibling"].effective.definitions.contains(&"SIBLING_ONLY".to_string()));
        assert!(!targets["stranger"].effective.definitions.contains(&"SIBLING_ONLY".to_string()));
    }

    #[test]
    fn circular_link_dependency_marks_all_participants() {
        let mut targets = HashMap::new();
        targets.insert("a".to_string(), target("a").depends_on("b", OptionScope::Public));
        targets.insert("b".to_string(), target("b").depends_on("a", OptionScope::Public));

        resolve_targets(&mut targets).unwrap();

        assert!(targets["a"].circular_linker);
        assert!(targets["b"].circular_linker);
    }

    #[test]
    fn acyclic_targets_are_not_marked_circular() {
        let mut targets = HashMap::new();
        targets.insert("a".to_string(), target("a"));
        targets.insert("b".to_string(), target("b").depends_on("a", OptionScope::Public));

        resolve_targets(&mut targets).unwrap();

        assert!(!targets["a"].circular_linker);
        assert!(!targets["b"].circular_linker);
    }

    #[test]
    fn shared_library_gets_import_library_and_export_definitions() {
        let mut bundle = OptionBundle::default();
        bundle.definitions.push("EXPORTED".to_string());
        let mut targets = HashMap::new();
        targets.insert(
            "shared".to_string(),
            Target::new("shared", PackagePath::parse("org.acme.shared").unwrap(), TargetKind::SharedLibrary, Language::C)
                .with_sources([PathBuf::from("shared.c")])
                .with_scoped(OptionScope::Public, bundle),
        );
        if let Some(t) = targets.get_mut("shared") {
            t.export_all_symbols = true;
        }

        resolve_targets(&mut targets).unwrap();

        let shared = &targets["shared"];
        assert!(shared.import_library_path.is_some());
        assert!(shared.export_definitions_path.is_some());
    }

    #[test]
    fn configuration_defaults_applied_in_pass_three() {
        let mut targets = HashMap::new();
        targets.insert("a".to_string(), target("a").with_configuration(ConfigurationType::Release));
        resolve_targets(&mut targets).unwrap();
        let settings = targets["a"].compiler_settings.unwrap();
        assert!(!settings.debug_info);
    }
}
