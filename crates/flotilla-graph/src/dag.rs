//! Generic directed graph keyed by opaque string ids.
//!
//! An edge `from -> to` means "`to` depends on `from`": work flows from
//! roots (no dependencies) towards leaves (no dependents).

use std::collections::{BTreeSet, HashMap, VecDeque};

use indexmap::IndexMap;
use thiserror::Error;

/// Errors raised by graph mutation and ordering operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// An edge endpoint does not exist in the graph.
    #[error("node `{0}` does not exist")]
    MissingNode(String),
    /// The graph contains a cycle; the payload is one example cycle.
    #[error("cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// A generic node-and-edge graph with the orderings scheduling needs.
#[derive(Debug, Clone)]
pub struct Dag<T> {
    nodes: IndexMap<String, T>,
    /// from -> nodes depending on it (outgoing edges).
    dependents: HashMap<String, BTreeSet<String>>,
    /// to -> nodes it depends on (incoming edges).
    dependencies: HashMap<String, BTreeSet<String>>,
}

impl<T> Default for Dag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dag<T> {
    /// An empty graph.
    pub fn new() -> Self {
        Self {
            nodes: IndexMap::new(),
            dependents: HashMap::new(),
            dependencies: HashMap::new(),
        }
    }

    /// Insert or replace a node's payload. Existing edges are kept.
    pub fn add_node(&mut self, id: impl Into<String>, payload: T) -> Option<T> {
        self.nodes.insert(id.into(), payload)
    }

    /// Remove a node and detach all incident edges.
    pub fn remove_node(&mut self, id: &str) -> Option<T> {
        let payload = self.nodes.shift_remove(id)?;
        if let Some(outgoing) = self.dependents.remove(id) {
            for to in outgoing {
                if let Some(incoming) = self.dependencies.get_mut(&to) {
                    incoming.remove(id);
                }
            }
        }
        if let Some(incoming) = self.dependencies.remove(id) {
            for from in incoming {
                if let Some(outgoing) = self.dependents.get_mut(&from) {
                    outgoing.remove(id);
                }
            }
        }
        Some(payload)
    }

    /// Whether a node exists.
    pub fn has_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Borrow a node's payload.
    pub fn node(&self, id: &str) -> Option<&T> {
        self.nodes.get(id)
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Remove every node and edge.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.dependents.clear();
        self.dependencies.clear();
    }

    /// Add an edge `from -> to` ("`to` depends on `from`"). Both endpoints
    /// must already exist.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        if !self.has_node(from) {
            return Err(GraphError::MissingNode(from.to_string()));
        }
        if !self.has_node(to) {
            return Err(GraphError::MissingNode(to.to_string()));
        }
        self.dependents
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        self.dependencies
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
        Ok(())
    }

    /// Remove an edge; returns whether it existed.
    pub fn remove_edge(&mut self, from: &str, to: &str) -> bool {
        let removed = self
            .dependents
            .get_mut(from)
            .map_or(false, |set| set.remove(to));
        if removed {
            if let Some(set) = self.dependencies.get_mut(to) {
                set.remove(from);
            }
        }
        removed
    }

    /// Direct dependencies of a node.
    pub fn get_dependencies(&self, id: &str) -> Vec<String> {
        self.dependencies
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct dependents of a node.
    pub fn get_dependents(&self, id: &str) -> Vec<String> {
        self.dependents
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Transitive closure of a node's dependencies.
    pub fn get_all_dependencies(&self, id: &str) -> BTreeSet<String> {
        self.closure(id, &self.dependencies)
    }

    /// Transitive closure of a node's dependents.
    pub fn get_all_dependents(&self, id: &str) -> BTreeSet<String> {
        self.closure(id, &self.dependents)
    }

    fn closure(&self, id: &str, edges: &HashMap<String, BTreeSet<String>>) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut frontier = VecDeque::new();
        frontier.push_back(id.to_string());
        while let Some(current) = frontier.pop_front() {
            if let Some(nexts) = edges.get(&current) {
                for next in nexts {
                    if seen.insert(next.clone()) {
                        frontier.push_back(next.clone());
                    }
                }
            }
        }
        seen
    }

    /// Whether `id` transitively depends on `dependency`.
    pub fn depends_on(&self, id: &str, dependency: &str) -> bool {
        self.get_all_dependencies(id).contains(dependency)
    }

    /// Nodes with no dependencies, in insertion order.
    pub fn roots(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| self.dependencies.get(*id).map_or(true, BTreeSet::is_empty))
            .cloned()
            .collect()
    }

    /// Nodes with no dependents, in insertion order.
    pub fn leaves(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| self.dependents.get(*id).map_or(true, BTreeSet::is_empty))
            .cloned()
            .collect()
    }

    /// Kahn topological sort. Fails with an example cycle when cyclic.
    pub fn topological_sort(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree: HashMap<&String, usize> = self
            .nodes
            .keys()
            .map(|id| {
                let degree = self.dependencies.get(id).map_or(0, BTreeSet::len);
                (id, degree)
            })
            .collect();
        let mut queue: VecDeque<&String> = self
            .nodes
            .keys()
            .filter(|id| in_degree[*id] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            if let Some(nexts) = self.dependents.get(id) {
                for next in nexts {
                    if let Some(degree) = in_degree.get_mut(next) {
                        *degree -= 1;
                        if *degree == 0 {
                            if let Some((key, _)) = self.nodes.get_key_value(next) {
                                queue.push_back(key);
                            }
                        }
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(GraphError::Cycle(self.detect_cycle().unwrap_or_default()));
        }
        Ok(order)
    }

    /// Group nodes into execution levels: level 0 holds all zero-in-degree
    /// nodes; each later level holds nodes whose dependencies all live in
    /// earlier levels.
    pub fn execution_levels(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let mut in_degree: HashMap<String, usize> = self
            .nodes
            .keys()
            .map(|id| {
                let degree = self.dependencies.get(id).map_or(0, BTreeSet::len);
                (id.clone(), degree)
            })
            .collect();

        let mut levels = Vec::new();
        let mut placed = 0usize;
        let mut current: Vec<String> = self
            .nodes
            .keys()
            .filter(|id| in_degree[*id] == 0)
            .cloned()
            .collect();

        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();
            for id in &current {
                if let Some(dependents) = self.dependents.get(id) {
                    for dependent in dependents {
                        if let Some(degree) = in_degree.get_mut(dependent) {
                            *degree -= 1;
                            if *degree == 0 {
                                next.push(dependent.clone());
                            }
                        }
                    }
                }
            }
            levels.push(std::mem::replace(&mut current, next));
        }

        if placed != self.nodes.len() {
            return Err(GraphError::Cycle(self.detect_cycle().unwrap_or_default()));
        }
        Ok(levels)
    }

    /// Find one cycle via depth-first coloring, as the list of participating
    /// node ids in traversal order. Returns `None` on acyclic graphs.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        // 0 = unvisited, 1 = on the current path, 2 = finished.
        let mut color: HashMap<String, u8> = HashMap::with_capacity(self.nodes.len());
        let mut path: Vec<String> = Vec::new();
        for id in self.nodes.keys() {
            if color.get(id).copied().unwrap_or(0) == 0 {
                if let Some(cycle) = self.dfs_cycle(id, &mut color, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        id: &str,
        color: &mut HashMap<String, u8>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        color.insert(id.to_string(), 1);
        path.push(id.to_string());
        if let Some(nexts) = self.dependents.get(id) {
            for next in nexts {
                match color.get(next).copied().unwrap_or(0) {
                    0 => {
                        if let Some(cycle) = self.dfs_cycle(next, color, path) {
                            return Some(cycle);
                        }
                    }
                    1 => {
                        let start = path.iter().position(|p| p == next).unwrap_or(0);
                        return Some(path[start..].to_vec());
                    }
                    _ => {}
                }
            }
        }
        path.pop();
        color.insert(id.to_string(), 2);
        None
    }

    /// Whether the graph contains any cycle.
    pub fn has_cycle(&self) -> bool {
        self.detect_cycle().is_some()
    }

    /// Longest path through the graph by node count, root to leaf.
    /// Empty when the graph is cyclic or empty.
    pub fn critical_path(&self) -> Vec<String> {
        let Ok(order) = self.topological_sort() else {
            return Vec::new();
        };
        let mut length: HashMap<String, usize> = HashMap::with_capacity(order.len());
        let mut predecessor: HashMap<String, String> = HashMap::new();
        let mut best: Option<String> = None;
        let mut best_length = 0usize;

        for id in &order {
            let mut node_length = 1;
            if let Some(deps) = self.dependencies.get(id) {
                for dep in deps {
                    let candidate = length.get(dep).copied().unwrap_or(0) + 1;
                    if candidate > node_length {
                        node_length = candidate;
                        predecessor.insert(id.clone(), dep.clone());
                    }
                }
            }
            length.insert(id.clone(), node_length);
            if node_length > best_length {
                best_length = node_length;
                best = Some(id.clone());
            }
        }

        let mut rev = Vec::new();
        let mut cursor = best;
        while let Some(id) = cursor {
            cursor = predecessor.get(&id).cloned();
            rev.push(id);
        }
        rev.reverse();
        rev
    }
}
