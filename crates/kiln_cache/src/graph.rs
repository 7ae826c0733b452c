//! Source units, modules and the acyclic module dependency graph.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Stable identity of a source unit: its path relative to the project root,
/// always with `/` separators.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    /// Creates a unit identity, normalizing `\` separators to `/`.
    pub fn new(id: impl Into<String>) -> Self {
        let id: String = id.into();
        Self(id.replace('\\', "/"))
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        UnitId::new(s)
    }
}

/// A single compiled input file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceUnit {
    /// Stable identity used as the cache key.
    pub id: UnitId,
    /// Location of the file on disk.
    pub path: PathBuf,
}

impl SourceUnit {
    /// Creates a unit with an explicit identity.
    pub fn new(id: impl Into<UnitId>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    /// Creates a unit whose identity is `path` relative to `root`.
    ///
    /// Falls back to the full path when `path` is not under `root`.
    pub fn relative_to(root: &Path, path: PathBuf) -> Self {
        let id = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Self {
            id: UnitId::new(id),
            path,
        }
    }
}

impl From<String> for UnitId {
    fn from(s: String) -> Self {
        UnitId::new(s)
    }
}

/// A separately linkable unit of output.
#[derive(Clone, Debug, Default)]
pub struct Module {
    /// Module name; unique within a graph.
    pub name: String,
    /// Source units in source order. The module artifact follows this order.
    pub units: Vec<SourceUnit>,
    /// Names of the modules this module depends on.
    pub dependencies: Vec<String>,
    /// Dependencies whose `internal` declarations this module may see.
    pub friends: Vec<String>,
    /// Resolved compiler options.
    pub options: BTreeMap<String, String>,
    /// Extra input directories that participate in the module fingerprint.
    pub libraries: Vec<PathBuf>,
}

impl Module {
    /// Creates an empty module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Appends a source unit.
    pub fn with_unit(mut self, unit: SourceUnit) -> Self {
        self.units.push(unit);
        self
    }

    /// Adds a dependency.
    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Adds a friend; the friend must also be listed as a dependency.
    pub fn with_friend(mut self, friend: impl Into<String>) -> Self {
        self.friends.push(friend.into());
        self
    }

    /// Sets a compiler option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Adds an extra input directory.
    pub fn with_library(mut self, dir: impl Into<PathBuf>) -> Self {
        self.libraries.push(dir.into());
        self
    }
}

/// The validated, acyclic module dependency graph.
///
/// Edges point from a dependency to its dependents, so a topological walk
/// visits leaves (modules with no dependencies) first.
#[derive(Debug)]
pub struct ModuleGraph {
    modules: Vec<Module>,
    graph: DiGraph<usize, ()>,
    nodes: Vec<NodeIndex>,
    by_name: HashMap<String, usize>,
    order: Vec<usize>,
}

impl ModuleGraph {
    /// Validates `modules` and builds the graph.
    ///
    /// Rejects duplicate modules or units, unknown dependencies, friends that
    /// are not dependencies, and dependency cycles.
    pub fn new(modules: Vec<Module>) -> Result<Self, GraphError> {
        let mut by_name = HashMap::with_capacity(modules.len());
        for (idx, module) in modules.iter().enumerate() {
            if by_name.insert(module.name.clone(), idx).is_some() {
                return Err(GraphError::DuplicateModule(module.name.clone()));
            }
            let mut seen = HashSet::new();
            for unit in &module.units {
                if !seen.insert(&unit.id) {
                    return Err(GraphError::DuplicateUnit {
                        module: module.name.clone(),
                        unit: unit.id.to_string(),
                    });
                }
            }
        }

        let mut graph = DiGraph::with_capacity(modules.len(), modules.len());
        let nodes: Vec<NodeIndex> = (0..modules.len()).map(|i| graph.add_node(i)).collect();

        for (idx, module) in modules.iter().enumerate() {
            for dep in &module.dependencies {
                let dep_idx = *by_name
                    .get(dep)
                    .ok_or_else(|| GraphError::UnknownDependency {
                        module: module.name.clone(),
                        dependency: dep.clone(),
                    })?;
                graph.update_edge(nodes[dep_idx], nodes[idx], ());
            }
            for friend in &module.friends {
                if !module.dependencies.contains(friend) {
                    return Err(GraphError::FriendNotDependency {
                        module: module.name.clone(),
                        friend: friend.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = find_cycle(&graph, &modules) {
            return Err(GraphError::CyclicModuleDependency { cycle });
        }

        let order = topological_order(&graph, &nodes, &modules);
        Ok(Self {
            modules,
            graph,
            nodes,
            by_name,
            order,
        })
    }

    /// Returns all modules in insertion order.
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Returns the number of modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` if the graph has no modules.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Looks up a module by name.
    pub fn get(&self, name: &str) -> Option<&Module> {
        self.index_of(name).map(|i| &self.modules[i])
    }

    /// Returns the insertion index of the named module.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Module indices in deterministic dependency order: every module appears
    /// after all of its dependencies, ties broken by module name.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Indices of the modules that depend directly on module `idx`.
    pub fn dependents(&self, idx: usize) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .graph
            .neighbors_directed(self.nodes[idx], Direction::Outgoing)
            .map(|n| self.graph[n])
            .collect();
        out.sort_unstable();
        out
    }

    /// Indices of the modules that module `idx` depends on directly.
    pub fn dependencies(&self, idx: usize) -> Vec<usize> {
        self.modules[idx]
            .dependencies
            .iter()
            .filter_map(|d| self.index_of(d))
            .collect()
    }
}

/// Returns one dependency cycle, if any, as module names in dependency order
/// with the first module repeated at the end.
fn find_cycle(graph: &DiGraph<usize, ()>, modules: &[Module]) -> Option<Vec<String>> {
    let mut sccs: Vec<Vec<NodeIndex>> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .collect();
    if sccs.is_empty() {
        return None;
    }

    let name = |n: NodeIndex| modules[graph[n]].name.as_str();
    for scc in &mut sccs {
        scc.sort_by(|a, b| name(*a).cmp(name(*b)));
    }
    sccs.sort_by(|a, b| name(a[0]).cmp(name(b[0])));
    let scc = &sccs[0];
    let members: HashSet<NodeIndex> = scc.iter().copied().collect();
    let start = scc[0];

    // Breadth-first search from `start` back to itself inside the component.
    // Edges run dependency -> dependent, so walk them backwards to list the
    // cycle as "a depends on b depends on ... a".
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    let mut closing = None;
    while let Some(node) = queue.pop_front() {
        let mut next: Vec<NodeIndex> = graph
            .neighbors_directed(node, Direction::Incoming)
            .filter(|n| members.contains(n))
            .collect();
        next.sort_by(|a, b| name(*a).cmp(name(*b)));
        for n in next {
            if n == start {
                closing = Some(node);
                break;
            }
            if !parent.contains_key(&n) {
                parent.insert(n, node);
                queue.push_back(n);
            }
        }
        if closing.is_some() {
            break;
        }
    }

    let mut path = vec![start];
    let mut tail = Vec::new();
    let mut cursor = closing?;
    while cursor != start {
        tail.push(cursor);
        cursor = parent[&cursor];
    }
    tail.reverse();
    path.extend(tail);
    path.push(start);
    Some(path.into_iter().map(|n| name(n).to_string()).collect())
}

/// Kahn's algorithm with a name-ordered ready set, so the order is stable
/// across runs and independent of insertion order.
fn topological_order(
    graph: &DiGraph<usize, ()>,
    nodes: &[NodeIndex],
    modules: &[Module],
) -> Vec<usize> {
    let mut remaining: Vec<usize> = nodes
        .iter()
        .map(|n| graph.neighbors_directed(*n, Direction::Incoming).count())
        .collect();
    let mut ready: BTreeSet<(&str, usize)> = remaining
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(i, _)| (modules[i].name.as_str(), i))
        .collect();

    let mut order = Vec::with_capacity(modules.len());
    while let Some(entry) = ready.pop_first() {
        let idx = entry.1;
        order.push(idx);
        for n in graph.neighbors_directed(nodes[idx], Direction::Outgoing) {
            let dependent = graph[n];
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert((modules[dependent].name.as_str(), dependent));
            }
        }
    }
    order
}
