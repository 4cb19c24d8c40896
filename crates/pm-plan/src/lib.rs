//! Execution plan: a dependency-ordered command DAG, a thread-pool
//! scheduler honoring staleness and completion, and a private binary
//! (de)serialization format.

mod serialize;

pub use serialize::{deserialize_plan, serialize_plan, SerializeError};

use pm_command::{Command, CommandKind};
use pm_fingerprint::FingerprintDb;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("command {0:?} references unknown dependency {1:?}")]
    UnknownDependency(String, String),
    #[error("command dependency cycle detected")]
    Cycle(String),
    #[error("failed to write cycle dump to {path:?}: {source}")]
    CycleDumpWrite { path: std::path::PathBuf, #[source] source: std::io::Error },
}

/// How many failures the plan tolerates before it stops dispatching new
/// waves: stop on first error, or continue up to a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureBound {
    StopOnFirst,
    ContinueUpTo(usize),
}

#[derive(Debug, Default)]
pub struct ExecutionSummary {
    pub succeeded: Vec<String>,
    pub cached: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<String>,
}

/// A topologically ordered set of commands ready for dispatch.
pub struct Plan {
    commands: HashMap<String, Command>,
    order: Vec<String>,
    current_command: AtomicUsize,
}

impl Plan {
    /// Build a plan from an unordered command list, validating every
    /// dependency id resolves and topologically sorting. A cycle returns
    /// [`PlanError::Cycle`] carrying a Graphviz dump of the unprocessed
    /// commands; persist it with [`write_cycle_dump`].
    pub fn build(commands: Vec<Command>) -> Result<Plan, PlanError> {
        let mut map = HashMap::new();
        for command in commands {
            map.insert(command.id.clone(), command);
        }
        for command in map.values() {
            for dep in &command.dependency_ids {
                if !map.contains_key(dep) {
                    return Err(PlanError::UnknownDependency(command.id.clone(), dep.clone()));
                }
            }
        }

        let mut graph = DiGraph::<String, ()>::new();
        let mut nodes = HashMap::new();
        for id in map.keys() {
            nodes.insert(id.clone(), graph.add_node(id.clone()));
        }
        for command in map.values() {
            for dep in &command.dependency_ids {
                graph.add_edge(nodes[dep], nodes[&command.id], ());
            }
        }

        let order = match toposort(&graph, None) {
            Ok(idxs) => idxs.into_iter().map(|i| graph[i].clone()).collect(),
            Err(_cycle) => return Err(PlanError::Cycle(dot_dump(&graph))),
        };

        Ok(Plan { commands: map, order, current_command: AtomicUsize::new(0) })
    }

    pub fn total_commands(&self) -> usize {
        self.order.len()
    }

    pub fn current_command(&self) -> usize {
        self.current_command.load(Ordering::SeqCst)
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn command(&self, id: &str) -> Option<&Command> {
        self.commands.get(id)
    }

    /// Whether `command` can be skipped this run: every input file's
    /// fingerprint still matches the recorded one and every output exists
    /// with a matching fingerprint. Built-in commands additionally require
    /// every output to be no older than every input (an `isTimeChanged`
    /// comparison), since generator steps can produce byte-identical output
    /// from different inputs where a pure hash comparison alone would
    /// under-invalidate.
    pub fn is_stale(command: &Command, fingerprints: &FingerprintDb) -> bool {
        for input in &command.inputs {
            if !fingerprints.is_fresh(input) {
                return true;
            }
        }
        for output in &command.outputs {
            if !output.exists() || !fingerprints.is_fresh(output) {
                return true;
            }
        }
        if command.kind == CommandKind::Builtin && time_changed(command) {
            return true;
        }
        false
    }

    /// Group commands into Kahn layers: every command in a layer depends
    /// only on commands in earlier layers, so a layer's members can run
    /// concurrently.
    fn layered_waves(&self) -> Vec<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = self.order.iter().map(|id| (id.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for id in &self.order {
            let command = &self.commands[id];
            *indegree.get_mut(id.as_str()).unwrap() = command.dependency_ids.len();
            for dep in &command.dependency_ids {
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }

        let mut waves = Vec::new();
        let mut remaining: Vec<&str> = indegree.iter().filter(|&(_, &deg)| deg == 0).map(|(id, _)| *id).collect();
        remaining.sort();
        let mut indeg = indegree;

        while !remaining.is_empty() {
            waves.push(remaining.iter().map(|s| s.to_string()).collect());
            let mut next = Vec::new();
            for id in &remaining {
                if let Some(deps) = dependents.get(id) {
                    for dependent in deps {
                        let entry = indeg.get_mut(dependent).unwrap();
                        *entry -= 1;
                        if *entry == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
            next.sort();
            remaining = next;
        }
        waves
    }

    /// Dispatch commands wave-by-wave to a `jobs`-sized thread pool. `run`
    /// is injected by the caller (`pm-solution`, which owns the actual
    /// toolchain invocation) so this crate never needs to know how a
    /// command is actually executed — the same separation `pm-checks` uses
    /// for probes and `pm-resolver` uses for fetches.
    pub fn execute<F>(&self, jobs: usize, bound: FailureBound, fingerprints: Option<&FingerprintDb>, run: F) -> ExecutionSummary
    where
        F: Fn(&Command) -> Result<(), String> + Sync,
    {
        let pool = ThreadPoolBuilder::new().num_threads(jobs.max(1)).build().expect("thread pool build");
        let waves = self.layered_waves();

        let succeeded = Mutex::new(Vec::new());
        let cached = Mutex::new(Vec::new());
        let failed = Mutex::new(Vec::new());
        let skipped = Mutex::new(Vec::new());
        let dead: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
        let mut stop = false;

        for wave in waves {
            if stop {
                skipped.lock().unwrap().extend(wave);
                continue;
            }

            pool.install(|| {
                wave.par_iter().for_each(|id| {
                    let command = &self.commands[id];
                    let blocked = {
                        let dead = dead.lock().unwrap();
                        command.dependency_ids.iter().any(|dep| dead.contains(dep))
                    };
                    if blocked {
                        skipped.lock().unwrap().push(id.clone());
                        dead.lock().unwrap().insert(id.clone());
                        self.current_command.fetch_add(1, Ordering::SeqCst);
                        return;
                    }

                    let stale = fingerprints.map(|db| Self::is_stale(command, db)).unwrap_or(true);
                    if !stale {
                        cached.lock().unwrap().push(id.clone());
                        self.current_command.fetch_add(1, Ordering::SeqCst);
                        return;
                    }

                    match run(command) {
                        Ok(()) => succeeded.lock().unwrap().push(id.clone()),
                        Err(reason) => {
                            failed.lock().unwrap().push((id.clone(), reason));
                            dead.lock().unwrap().insert(id.clone());
                        }
                    }
                    self.current_command.fetch_add(1, Ordering::SeqCst);
                });
            });

            let failure_count = failed.lock().unwrap().len();
            stop = match bound {
                FailureBound::StopOnFirst => failure_count > 0,
                FailureBound::ContinueUpTo(n) => failure_count > n,
            };
        }

        ExecutionSummary {
            succeeded: succeeded.into_inner().unwrap(),
            cached: cached.into_inner().unwrap(),
            failed: failed.into_inner().unwrap(),
            skipped: skipped.into_inner().unwrap(),
        }
    }
}

fn time_changed(command: &Command) -> bool {
    let newest_input = command
        .inputs
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .filter_map(|m| m.modified().ok())
        .max();
    let oldest_output = command
        .outputs
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .filter_map(|m| m.modified().ok())
        .min();
    match (newest_input, oldest_output) {
        (Some(newest_input), Some(oldest_output)) => newest_input > oldest_output,
        _ => true,
    }
}

fn dot_dump(graph: &DiGraph<String, ()>) -> String {
    let mut lines = vec!["digraph commands {".to_string()];
    for idx in graph.node_indices() {
        lines.push(format!("  \"{}\";", graph[idx]));
    }
    for edge in graph.edge_indices() {
        if let Some((a, b)) = graph.edge_endpoints(edge) {
            lines.push(format!("  \"{}\" -> \"{}\";", graph[a], graph[b]));
        }
    }
    lines.push("}".to_string());
    lines.join("\n")
}

pub fn write_cycle_dump(dot: &str, path: &Path) -> Result<(), PlanError> {
    std::fs::write(path, dot).map_err(|e| PlanError::CycleDumpWrite { path: path.to_path_buf(), source: e })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn command(id: &str, deps: &[&str]) -> Command {
        let mut c = Command::new(id, CommandKind::Generic, "/bin/true", "/work");
        c.dependency_ids = deps.iter().map(|s| s.to_string()).collect();
        c
    }

    #[test]
    fn build_rejects_unknown_dependency() {
        let err = Plan::build(vec![command("a", &["missing"])]).unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency(_, _)));
    }

    #[test]
    fn build_detects_cycle() {
        let err = Plan::build(vec![command("a", &["b"]), command("b", &["a"])]).unwrap_err();
        assert!(matches!(err, PlanError::Cycle(_)));
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let plan = Plan::build(vec![command("b", &["a"]), command("a", &[])]).unwrap();
        let pos_a = plan.order().iter().position(|i| i == "a").unwrap();
        let pos_b = plan.order().iter().position(|i| i == "b").unwrap();
        assert!(pos_a < pos_b);
    }

    #[test]
    fn execute_runs_every_command_without_a_cache() {
        let plan = Plan::build(vec![command("a", &[]), command("b", &["a"])]).unwrap();
        let summary = plan.execute(2, FailureBound::StopOnFirst, None, |_cmd| Ok(()));
        assert_eq!(summary.succeeded.len(), 2);
        assert!(summary.failed.is_empty());
        assert_eq!(plan.current_command(), 2);
    }

    #[test]
    fn failure_skips_dependents_and_stops_on_first_error_by_default() {
        let plan = Plan::build(vec![command("a", &[]), command("b", &["a"]), command("c", &[])]).unwrap();
        let summary = plan.execute(2, FailureBound::StopOnFirst, None, |cmd| {
            if cmd.id == "a" {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        });
        assert_eq!(summary.failed.len(), 1);
        assert!(summary.skipped.contains(&"b".to_string()) || summary.skipped.contains(&"c".to_string()));
    }

    #[test]
    fn continue_up_to_bound_tolerates_failures_under_the_limit() {
        let plan = Plan::build(vec![command("a", &[]), command("b", &[])]).unwrap();
        let summary = plan.execute(2, FailureBound::ContinueUpTo(1), None, |cmd| {
            if cmd.id == "a" {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        });
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.succeeded.len(), 1);
    }

    #[test]
    fn fresh_output_is_skipped_as_cached() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("a.c");
        let output = tmp.path().join("a.o");
        std::fs::write(&input, "int main(){}").unwrap();
        std::fs::write(&output, "obj").unwrap();

        let db = FingerprintDb::open(tmp.path().join("db.json")).unwrap();
        db.update(&input, None, None).unwrap();
        db.update(&output, None, None).unwrap();

        let mut c = command("compile", &[]);
        c.inputs.push(input);
        c.outputs.push(output);
        let plan = Plan::build(vec![c]).unwrap();

        let summary = plan.execute(1, FailureBound::StopOnFirst, Some(&db), |_| {
            panic!("should not run a cached command")
        });
        assert_eq!(summary.cached, vec!["compile".to_string()]);
    }

    #[test]
    fn cycle_dump_is_valid_graphviz_and_writable() {
        let err = Plan::build(vec![command("a", &["b"]), command("b", &["a"])]).unwrap_err();
        let PlanError::Cycle(dot) = err else { panic!("expected cycle") };
        assert!(dot.starts_with("digraph commands {"));

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cycle.dot");
        write_cycle_dump(&dot, &path).unwrap();
        assert!(path.exists());
    }
}
