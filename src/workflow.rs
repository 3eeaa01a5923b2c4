// src/workflow.rs
//
// =============================================================================
// REPX-LAB: RUN GRAPH SCHEDULER
// =============================================================================
//
// The Graph Brain.
//
// Responsibilities:
// 1. Manage the DAG of runs (dependency -> dependent, Hard/Soft edges).
// 2. Topological ordering with cycle detection (every cyclic run is named).
// 3. Evaluate runs in that order so each run sees its upstream results.
// 4. Global name checks (unique run names, no group/run collisions).

use crate::core::DependencyKind;
use crate::error::{quoted, BuildError, Result};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

// ============================================================================
// 1. GRAPH HELPERS
// ============================================================================

/// Kahn's algorithm. Among ready nodes the lowest index (declaration order)
/// goes first, so the order is deterministic. On failure returns the nodes
/// that sit on a cycle.
pub(crate) fn topo_order<N, E>(graph: &DiGraph<N, E>) -> std::result::Result<Vec<NodeIndex>, Vec<NodeIndex>> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| Reverse(*n))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(n)) = ready.pop() {
        order.push(n);
        for next in graph.neighbors_directed(n, Direction::Outgoing) {
            if let Some(d) = in_degree.get_mut(&next) {
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(next));
                }
            }
        }
    }

    if order.len() == graph.node_count() {
        return Ok(order);
    }
    Err(cyclic_members(graph))
}

/// Nodes in a strongly connected component of size > 1, or with a self loop.
pub(crate) fn cyclic_members<N, E>(graph: &DiGraph<N, E>) -> Vec<NodeIndex> {
    let mut members: Vec<NodeIndex> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || scc.iter().any(|n| graph.contains_edge(*n, *n)))
        .flatten()
        .collect();
    members.sort();
    members
}

// ============================================================================
// 2. THE RUN GRAPH
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEdge {
    pub from: String,
    pub to: String,
    pub kind: DependencyKind,
}

pub struct RunGraph {
    graph: DiGraph<String, DependencyKind>,
    index: HashMap<String, NodeIndex>,
}

/// Results of the runs a run depends on, available while it is evaluated.
pub struct Upstream<'a, T> {
    deps: Vec<(&'a str, DependencyKind, &'a T)>,
}

impl<'a, T> Upstream<'a, T> {
    pub fn all(&self) -> impl Iterator<Item = (&'a str, DependencyKind, &'a T)> + '_ {
        self.deps.iter().copied()
    }

    pub fn hard(&self) -> impl Iterator<Item = (&'a str, &'a T)> + '_ {
        self.deps
            .iter()
            .filter(|(_, k, _)| *k == DependencyKind::Hard)
            .map(|(n, _, v)| (*n, *v))
    }

    pub fn get(&self, run: &str) -> Option<&'a T> {
        self.deps.iter().find(|(n, _, _)| *n == run).map(|(_, _, v)| *v)
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }
}

impl RunGraph {
    /// Registers every run; duplicate names are a validation error.
    pub fn new<I, S>(runs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for name in runs {
            let name = name.into();
            if index.contains_key(&name) {
                return Err(BuildError::validation(
                    format!("run '{name}'"),
                    "run name is declared more than once",
                ));
            }
            let idx = graph.add_node(name.clone());
            index.insert(name, idx);
        }
        Ok(Self { graph, index })
    }

    /// Adds `from -> to` (`to` depends on `from`).
    pub fn add_edge(&mut self, edge: RunEdge) -> Result<()> {
        let to = *self.index.get(&edge.to).ok_or_else(|| {
            BuildError::definition(format!("run '{}'", edge.to), "dependency edge targets an unknown run")
        })?;
        let from = *self.index.get(&edge.from).ok_or_else(|| {
            BuildError::definition(
                format!("run '{}'", edge.to),
                format!("depends on unknown run '{}'", edge.from),
            )
        })?;
        if self.graph.contains_edge(from, to) {
            return Err(BuildError::validation(
                format!("run '{}'", edge.to),
                format!("dependency on run '{}' is listed more than once", edge.from),
            ));
        }
        self.graph.add_edge(from, to, edge.kind);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Direct dependencies of `run` with their kind.
    pub fn dependencies(&self, run: &str) -> BTreeMap<String, DependencyKind> {
        let Some(&idx) = self.index.get(run) else {
            return BTreeMap::new();
        };
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| (self.graph[e.source()].clone(), *e.weight()))
            .collect()
    }

    /// Topological order of run names; a cycle is a topology error naming
    /// every run on it. No run is ever dropped.
    pub fn schedule(&self) -> Result<Vec<String>> {
        match topo_order(&self.graph) {
            Ok(order) => Ok(order.into_iter().map(|n| self.graph[n].clone()).collect()),
            Err(cyclic) => {
                let names: Vec<&str> = cyclic.iter().map(|n| self.graph[*n].as_str()).collect();
                Err(BuildError::topology(
                    "run graph",
                    format!("dependency cycle between runs {}", quoted(&names)),
                ))
            }
        }
    }

    /// Evaluates every run strictly in scheduled order. `eval` receives the
    /// run name and the already-evaluated results of its dependencies.
    pub fn evaluate<T, F>(&self, mut eval: F) -> Result<Vec<(String, T)>>
    where
        F: FnMut(&str, &Upstream<'_, T>) -> Result<T>,
    {
        let order = self.schedule()?;
        let mut done: BTreeMap<String, T> = BTreeMap::new();

        for name in &order {
            let deps = self.dependencies(name);
            let value = {
                let upstream = Upstream {
                    deps: deps
                        .iter()
                        .filter_map(|(dep, kind)| {
                            done.get_key_value(dep).map(|(k, v)| (k.as_str(), *kind, v))
                        })
                        .collect(),
                };
                log::debug!("Evaluating run '{}' ({} upstream)", name, upstream.deps.len());
                eval(name, &upstream)?
            };
            done.insert(name.clone(), value);
        }

        Ok(order
            .into_iter()
            .filter_map(|name| done.remove(&name).map(|v| (name, v)))
            .collect())
    }
}

// ============================================================================
// 3. GLOBAL NAME CHECKS
// ============================================================================

/// Run names must be unique, groups may not shadow runs and may only list
/// known runs.
pub fn validate_names(runs: &[String], groups: &BTreeMap<String, Vec<String>>) -> Result<()> {
    let mut seen = BTreeSet::new();
    let duplicates: BTreeSet<&str> = runs
        .iter()
        .filter(|r| !seen.insert(r.as_str()))
        .map(String::as_str)
        .collect();
    if !duplicates.is_empty() {
        return Err(BuildError::validation(
            "lab",
            format!("duplicate run name(s) {}", quoted(&duplicates)),
        ));
    }

    let collisions: Vec<&str> = groups
        .keys()
        .filter(|g| seen.contains(g.as_str()))
        .map(String::as_str)
        .collect();
    if !collisions.is_empty() {
        return Err(BuildError::validation(
            "lab",
            format!("group name(s) {} collide with run names", quoted(&collisions)),
        ));
    }

    for (group, members) in groups {
        let unknown: Vec<&str> = members
            .iter()
            .filter(|m| !seen.contains(m.as_str()))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(BuildError::validation(
                format!("group '{group}'"),
                format!("references unknown run(s) {}", quoted(&unknown)),
            ));
        }
    }
    Ok(())
}
