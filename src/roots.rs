//! Direct-root resolution over the installed dependency graph
//!
//! Best-effort mapping from an observed package back to the direct
//! dependencies of the project that pull it in. The graph is rebuilt
//! from installed manifests, so it reflects what is actually on disk
//! rather than what a lockfile promises.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;

use serde_json::Value;

use crate::preflight;

/// Manifest cap for graph construction
pub const MAX_MANIFESTS: usize = 50_000;

/// Adjacency by package name
pub type DepGraph = HashMap<String, BTreeSet<String>>;

fn dep_names(manifest: &Value, keys: &[&str]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for key in keys {
        if let Some(map) = manifest.get(*key).and_then(Value::as_object) {
            out.extend(map.keys().cloned());
        }
    }
    out
}

/// Build the dependency graph from a set of parsed manifests. Edges are
/// the union of runtime, optional and peer dependencies.
pub fn graph_from_manifests<'a, I>(manifests: I) -> DepGraph
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut graph = DepGraph::new();
    for manifest in manifests {
        let name = match manifest.get("name").and_then(Value::as_str) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => continue,
        };
        let deps = dep_names(
            manifest,
            &["dependencies", "optionalDependencies", "peerDependencies"],
        );
        graph.entry(name).or_default().extend(deps);
    }
    graph
}

/// Read every installed manifest under `<root>/node_modules`
pub fn load_installed_graph(project_root: &Path) -> DepGraph {
    let node_modules = project_root.join("node_modules");
    let mut paths = preflight::manifest_paths(&node_modules, MAX_MANIFESTS);
    paths.truncate(MAX_MANIFESTS);
    let manifests: Vec<Value> = paths
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .filter_map(|s| serde_json::from_str(&s).ok())
        .collect();
    graph_from_manifests(&manifests)
}

/// Direct dependencies declared by the project's top-level manifest,
/// including dev dependencies.
pub fn direct_roots(project_root: &Path) -> BTreeSet<String> {
    let manifest: Option<Value> = std::fs::read_to_string(project_root.join("package.json"))
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok());
    match manifest {
        Some(m) => dep_names(
            &m,
            &[
                "dependencies",
                "devDependencies",
                "optionalDependencies",
                "peerDependencies",
            ],
        ),
        None => BTreeSet::new(),
    }
}

/// For each queried package, the sorted `|`-joined set of direct roots
/// that reach it, or `None` when the walk never gets there. Direct roots
/// always map to themselves.
pub fn resolve(
    graph: &DepGraph,
    roots: &BTreeSet<String>,
    queried: &[String],
) -> HashMap<String, Option<String>> {
    let mut roots_for: HashMap<String, BTreeSet<String>> = HashMap::new();
    for root in roots {
        // BFS, bounded by a (root, node) seen set so cycles terminate
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        seen.insert(root.as_str());
        queue.push_back(root.as_str());
        while let Some(node) = queue.pop_front() {
            roots_for
                .entry(node.to_string())
                .or_default()
                .insert(root.clone());
            if let Some(deps) = graph.get(node) {
                for dep in deps {
                    if seen.insert(dep.as_str()) {
                        queue.push_back(dep.as_str());
                    }
                }
            }
        }
    }
    for root in roots {
        roots_for
            .entry(root.clone())
            .or_default()
            .insert(root.clone());
    }

    let mut out = HashMap::new();
    for pkg in queried {
        let joined = roots_for
            .get(pkg)
            .filter(|set| !set.is_empty())
            .map(|set| set.iter().cloned().collect::<Vec<_>>().join("|"));
        out.insert(pkg.clone(), joined);
    }
    out
}

/// Host-side resolution for one project tree
pub fn resolve_for_project(
    project_root: &Path,
    queried: &[String],
) -> HashMap<String, Option<String>> {
    let graph = load_installed_graph(project_root);
    let roots = direct_roots(project_root);
    resolve(&graph, &roots, queried)
}
