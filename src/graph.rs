//! The dependency graph: pure bookkeeping over collection names.
//!
//! Grounded on `compute_graph.py::ComputeGraph` (§4.2 of SPEC_FULL.md). The graph
//! never holds a collection itself — only the name-level edges, invalidation flags
//! and last-computed timestamps the engine needs to plan a coordinated update. The
//! collections (and their compute functions) are owned by [`crate::engine::ComputeEngine`]'s
//! node registry, keyed by the same names.

use crate::error::EngineError;
use indexmap::IndexSet;
use rustc_hash::{FxHashMap, FxHashSet};
use std::time::Instant;

/// One node per collection, keyed by collection name.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub name: String,
    /// Upstream collection names, in the order dependencies were added.
    pub dependencies: IndexSet<String>,
    /// Downstream collection names, in the order dependents were added.
    pub dependents: IndexSet<String>,
    pub invalidated: bool,
    pub last_computed: Option<Instant>,
}

impl DependencyNode {
    fn new(name: String) -> Self {
        DependencyNode {
            name,
            dependencies: IndexSet::default(),
            dependents: IndexSet::default(),
            invalidated: false,
            last_computed: None,
        }
    }
}

/// Directed graph over collection names. Acyclic by construction: [`add_dependency`]
/// refuses any edge that would close a cycle.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: FxHashMap<String, DependencyNode>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        DependencyGraph {
            nodes: FxHashMap::default(),
        }
    }

    /// Idempotent registration: a second call with the same name is a no-op, per
    /// SPEC_FULL.md §9's "`add_node` deduplicates" decision.
    pub fn add_node(&mut self, name: &str) {
        if !self.nodes.contains_key(name) {
            self.nodes
                .insert(name.to_string(), DependencyNode::new(name.to_string()));
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&DependencyNode> {
        self.nodes.get(name)
    }

    /// Adds the edge `dependency -> dependent`. Rejects the edge (leaving the graph
    /// untouched) if `dependency` is already reachable from `dependent`, which would
    /// close a cycle.
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str) -> Result<(), EngineError> {
        if dependent == dependency {
            return Err(EngineError::CycleRejected {
                dependent: dependent.to_string(),
                dependency: dependency.to_string(),
            });
        }
        if self.reachable(dependent, dependency) {
            return Err(EngineError::CycleRejected {
                dependent: dependent.to_string(),
                dependency: dependency.to_string(),
            });
        }

        self.nodes
            .get_mut(dependency)
            .ok_or_else(|| EngineError::UnknownNode(dependency.to_string()))?
            .dependents
            .insert(dependent.to_string());
        self.nodes
            .get_mut(dependent)
            .ok_or_else(|| EngineError::UnknownNode(dependent.to_string()))?
            .dependencies
            .insert(dependency.to_string());
        Ok(())
    }

    pub fn remove_dependency(&mut self, dependent: &str, dependency: &str) {
        if let Some(node) = self.nodes.get_mut(dependency) {
            node.dependents.shift_remove(dependent);
        }
        if let Some(node) = self.nodes.get_mut(dependent) {
            node.dependencies.shift_remove(dependency);
        }
    }

    /// True if `to` is reachable from `from` by following `dependents` edges
    /// (i.e. `from`'s transitive closure would include `to`).
    fn reachable(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        let mut seen = FxHashSet::default();
        let mut stack = vec![from.to_string()];
        while let Some(cur) = stack.pop() {
            if !seen.insert(cur.clone()) {
                continue;
            }
            if cur == to {
                return true;
            }
            if let Some(node) = self.nodes.get(&cur) {
                stack.extend(node.dependents.iter().cloned());
            }
        }
        false
    }

    /// Depth-first walk from `start` through `dependents`, marking each
    /// previously-clean node `invalidated = true`. Nodes already invalidated are
    /// skipped, so a node is visited at most once per call. Returns the set of
    /// node names this call actually flipped to invalidated (which includes `start`
    /// itself if it wasn't already).
    pub fn invalidate(&mut self, start: &str) -> FxHashSet<String> {
        let mut newly_invalidated = FxHashSet::default();
        self.invalidate_recursive(start, &mut newly_invalidated);
        newly_invalidated
    }

    fn invalidate_recursive(&mut self, name: &str, newly_invalidated: &mut FxHashSet<String>) {
        let dependents = match self.nodes.get_mut(name) {
            Some(node) if !node.invalidated => {
                node.invalidated = true;
                newly_invalidated.insert(name.to_string());
                node.dependents.iter().cloned().collect::<Vec<_>>()
            }
            _ => return,
        };
        for dependent in dependents {
            self.invalidate_recursive(&dependent, newly_invalidated);
        }
    }

    pub fn is_invalidated(&self, name: &str) -> bool {
        self.nodes.get(name).map(|n| n.invalidated).unwrap_or(false)
    }

    pub fn mark_computed(&mut self, name: &str, at: Instant) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.invalidated = false;
            node.last_computed = Some(at);
        }
    }

    /// Topologically sorts the given node names so that every dependency precedes
    /// its dependent. Ties are broken by insertion order in `dependencies` (a
    /// standard post-order DFS with a temp-mark cycle guard, mirroring
    /// `compute_graph.py::_topological_sort`).
    pub fn topo_sort(&self, names: &FxHashSet<String>) -> Vec<String> {
        let mut result = Vec::with_capacity(names.len());
        let mut visited = FxHashSet::default();
        let mut temp_mark = FxHashSet::default();

        // Deterministic visitation order over the (unordered) input set: sort by
        // name so the same invalidated set always yields the same traversal.
        let mut roots: Vec<&String> = names.iter().collect();
        roots.sort();

        for name in roots {
            self.visit(name, &mut visited, &mut temp_mark, &mut result);
        }
        result
    }

    fn visit(
        &self,
        name: &str,
        visited: &mut FxHashSet<String>,
        temp_mark: &mut FxHashSet<String>,
        result: &mut Vec<String>,
    ) {
        if temp_mark.contains(name) {
            tracing::warn!(node = name, "circular dependency detected during topo sort");
            return;
        }
        if visited.contains(name) {
            return;
        }
        let Some(node) = self.nodes.get(name) else {
            return;
        };
        temp_mark.insert(name.to_string());
        for dep in node.dependencies.iter() {
            self.visit(dep, visited, temp_mark, result);
        }
        temp_mark.remove(name);
        visited.insert(name.to_string());
        result.push(name.to_string());
    }
}
