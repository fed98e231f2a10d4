//! Dependency graph over service descriptors.
//!
//! The [`DependencyGraph`] resolves `depends_on` names to [`NodeIndex`]es
//! once, at build time, and never holds references to the descriptors
//! themselves. Edges point from a dependency to its dependent. Cycles are
//! rejected with the offending path (three-colour DFS); start levels are
//! computed with Kahn's algorithm, names ascending within a level.

use std::collections::{BTreeSet, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::descriptor::DescriptorStore;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// Read-only dependency view derived from a [`DescriptorStore`].
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node weights are service names; node `i` is the store's descriptor `i`.
    graph: DiGraph<String, ()>,
    levels: Vec<Vec<NodeIndex>>,
}

impl DependencyGraph {
    /// Build the graph and validate that it is acyclic.
    pub fn build(store: &DescriptorStore) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(store.len(), 0);
        for name in store.names() {
            graph.add_node(name.to_string());
        }

        for (i, desc) in store.iter().enumerate() {
            let dependent = NodeIndex::new(i);
            for dep in &desc.depends_on {
                let j = store
                    .index_of(dep)
                    .ok_or_else(|| Error::UnknownDependency {
                        service: desc.name.clone(),
                        dependency: dep.clone(),
                    })?;
                graph.update_edge(NodeIndex::new(j), dependent, ());
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(Error::CyclicDependency {
                cycle: cycle.into_iter().map(|n| graph[n].clone()).collect(),
            });
        }

        let levels = kahn_levels(&graph);
        Ok(Self { graph, levels })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.graph.node_indices().find(|&n| self.graph[n] == name)
    }

    /// Neighbours in one direction, sorted by index (and so by name).
    fn neighbours(&self, node: NodeIndex, direction: Direction) -> Vec<&str> {
        let mut out: Vec<NodeIndex> = self.graph.neighbors_directed(node, direction).collect();
        out.sort_unstable();
        out.into_iter().map(|n| self.graph[n].as_str()).collect()
    }

    /// Start levels as names, ascending within each level.
    pub fn levels(&self) -> Vec<Vec<&str>> {
        self.levels
            .iter()
            .map(|level| level.iter().map(|&n| self.graph[n].as_str()).collect())
            .collect()
    }

    /// Total start order: levels flattened.
    pub fn order(&self) -> Vec<&str> {
        self.levels
            .iter()
            .flatten()
            .map(|&n| self.graph[n].as_str())
            .collect()
    }

    /// Exact reverse of [`order`](Self::order): dependents before dependencies.
    pub fn shutdown_order(&self) -> Vec<&str> {
        let mut order = self.order();
        order.reverse();
        order
    }

    /// Direct dependencies of a service.
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.index_of(name)
            .map(|n| self.neighbours(n, Direction::Incoming))
            .unwrap_or_default()
    }

    /// Services that directly depend on `name`.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.index_of(name)
            .map(|n| self.neighbours(n, Direction::Outgoing))
            .unwrap_or_default()
    }

    /// Every service that depends on `name`, directly or transitively, sorted.
    pub fn transitive_dependents(&self, name: &str) -> Vec<&str> {
        let Some(start) = self.index_of(name) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .neighbors_directed(start, Direction::Outgoing)
            .collect();
        while let Some(n) = queue.pop_front() {
            if seen.insert(n) {
                queue.extend(self.graph.neighbors_directed(n, Direction::Outgoing));
            }
        }
        seen.into_iter().map(|n| self.graph[n].as_str()).collect()
    }
}

/// Three-colour DFS along dependency edges. Returns the node path of the
/// first cycle found, dependent first.
fn find_cycle(graph: &DiGraph<String, ()>) -> Option<Vec<NodeIndex>> {
    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut path: Vec<NodeIndex> = Vec::new();

    for root in graph.node_indices() {
        if marks[root.index()] != Mark::Unvisited {
            continue;
        }
        // Explicit stack of (node, remaining dependencies) to avoid recursion depth limits.
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = vec![(root, dependencies(graph, root))];
        marks[root.index()] = Mark::Visiting;
        path.push(root);

        while let Some((node, pending)) = stack.last_mut() {
            let node = *node;
            if let Some(next) = pending.pop() {
                match marks[next.index()] {
                    Mark::Unvisited => {
                        marks[next.index()] = Mark::Visiting;
                        path.push(next);
                        stack.push((next, dependencies(graph, next)));
                    }
                    Mark::Visiting => {
                        let start = path.iter().position(|&n| n == next).unwrap_or(0);
                        return Some(path[start..].to_vec());
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node.index()] = Mark::Done;
                path.pop();
                stack.pop();
            }
        }
    }
    None
}

/// Dependencies of `node`, reversed so that popping visits them in index order.
fn dependencies(graph: &DiGraph<String, ()>, node: NodeIndex) -> Vec<NodeIndex> {
    let mut deps: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Incoming).collect();
    deps.sort_unstable_by(|a, b| b.cmp(a));
    deps
}

/// Kahn's algorithm, grouping nodes whose dependencies are all in earlier levels.
fn kahn_levels(graph: &DiGraph<String, ()>) -> Vec<Vec<NodeIndex>> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut current: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|n| in_degree[n.index()] == 0)
        .collect();
    let mut levels = Vec::new();

    while !current.is_empty() {
        // Indices follow the store's name ordering, so sorting indices sorts names.
        current.sort_unstable();
        let mut next = Vec::new();
        for &node in &current {
            for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
                let degree = &mut in_degree[dependent.index()];
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    next.push(dependent);
                }
            }
        }
        levels.push(std::mem::take(&mut current));
        current = next;
    }
    levels
}
