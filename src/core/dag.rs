//! KF-008: Dependency graph of block vertices.
//!
//! Edges point from an upstream block to the blocks that reference it.
//! Every graph owns a `root` vertex; blocks without dependencies hang off
//! it so the scheduler can reach the whole graph from one start point.
//! Topological order uses Kahn's algorithm with alphabetical tie-breaking.

use super::error::{Error, Result};
use super::types::{Vertex, ROOT_VERTEX};
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Directed acyclic graph of vertices keyed by block name.
#[derive(Debug, Clone)]
pub struct Dag {
    vertices: IndexMap<String, Arc<Vertex>>,
    up: IndexMap<String, IndexSet<String>>,
    down: IndexMap<String, IndexSet<String>>,
}

impl Default for Dag {
    fn default() -> Self {
        Self::new()
    }
}

impl Dag {
    /// An empty graph holding only the root vertex.
    pub fn new() -> Self {
        let mut dag = Self {
            vertices: IndexMap::new(),
            up: IndexMap::new(),
            down: IndexMap::new(),
        };
        dag.insert(Vertex::root());
        dag
    }

    fn insert(&mut self, vertex: Vertex) {
        let name = vertex.block_name.clone();
        self.up.entry(name.clone()).or_default();
        self.down.entry(name.clone()).or_default();
        self.vertices.insert(name, Arc::new(vertex));
    }

    pub fn add_vertex(&mut self, vertex: Vertex) -> Result<()> {
        if self.vertices.contains_key(&vertex.block_name) {
            return Err(Error::Graph(format!(
                "duplicate vertex '{}'",
                vertex.block_name
            )));
        }
        self.insert(vertex);
        Ok(())
    }

    /// Replace the payload of an existing vertex; edges are kept.
    pub fn update_vertex(&mut self, vertex: Vertex) -> Result<()> {
        match self.vertices.get_mut(&vertex.block_name) {
            Some(slot) => {
                *slot = Arc::new(vertex);
                Ok(())
            }
            None => Err(Error::Graph(format!(
                "cannot update unknown vertex '{}'",
                vertex.block_name
            ))),
        }
    }

    pub fn get_vertex(&self, name: &str) -> Option<Arc<Vertex>> {
        self.vertices.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vertices.contains_key(name)
    }

    /// All vertices in insertion order, root first.
    pub fn vertices(&self) -> impl Iterator<Item = &Arc<Vertex>> {
        self.vertices.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vertices.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Add the edge `from → to`.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        for name in [from, to] {
            if !self.vertices.contains_key(name) {
                return Err(Error::Graph(format!("unknown vertex '{}'", name)));
            }
        }
        if from == to {
            return Err(Error::Graph(format!("vertex '{}' depends on itself", from)));
        }
        self.down.entry(from.to_string()).or_default().insert(to.to_string());
        self.up.entry(to.to_string()).or_default().insert(from.to_string());
        Ok(())
    }

    fn disconnect(&mut self, from: &str, to: &str) {
        if let Some(d) = self.down.get_mut(from) {
            d.shift_remove(to);
        }
        if let Some(u) = self.up.get_mut(to) {
            u.shift_remove(from);
        }
    }

    /// Derive edges from each vertex's dependency set. Vertices with no
    /// dependencies are connected to the root. Fails on unknown
    /// dependencies and on cycles.
    pub fn connect_dependencies(&mut self) -> Result<()> {
        let pending: Vec<(String, Vec<String>)> = self
            .vertices
            .values()
            .filter(|v| v.block_name != ROOT_VERTEX)
            .map(|v| (v.block_name.clone(), v.dependencies.iter().cloned().collect()))
            .collect();

        for (name, deps) in pending {
            if deps.is_empty() {
                self.connect(ROOT_VERTEX, &name)?;
                continue;
            }
            for dep in deps {
                if !self.vertices.contains_key(&dep) {
                    return Err(Error::Graph(format!(
                        "'{}' depends on unknown '{}'",
                        name, dep
                    )));
                }
                self.connect(&dep, &name)?;
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Direct upstream neighbours of a vertex.
    pub fn get_up_vertexes(&self, name: &str) -> Vec<String> {
        self.up
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct downstream neighbours of a vertex.
    pub fn get_down_vertexes(&self, name: &str) -> Vec<String> {
        self.down
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every edge as `(from, to)`.
    pub fn edges(&self) -> Vec<(String, String)> {
        self.down
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |to| (from.clone(), to.clone())))
            .collect()
    }

    /// Kahn's algorithm with sorted tie-breaking for determinism.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .vertices
            .keys()
            .map(|k| (k.as_str(), self.up.get(k).map_or(0, IndexSet::len)))
            .collect();

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(k, _)| *k)
            .collect();
        ready.sort_unstable();
        let mut queue: VecDeque<&str> = ready.into_iter().collect();

        let mut order = Vec::with_capacity(self.vertices.len());
        while let Some(current) = queue.pop_front() {
            order.push(current.to_string());

            let mut next_ready = Vec::new();
            if let Some(neighbors) = self.down.get(current) {
                for neighbor in neighbors {
                    if let Some(degree) = in_degree.get_mut(neighbor.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            next_ready.push(neighbor.as_str());
                        }
                    }
                }
            }
            next_ready.sort_unstable();
            queue.extend(next_ready);
        }

        if order.len() != self.vertices.len() {
            let mut cycle_members: Vec<&str> = in_degree
                .iter()
                .filter(|(_, &d)| d > 0)
                .map(|(k, _)| *k)
                .collect();
            cycle_members.sort_unstable();
            return Err(Error::Graph(format!(
                "dependency cycle detected involving: {}",
                cycle_members.join(", ")
            )));
        }
        Ok(order)
    }

    /// Drop every edge `u → v` for which another path from `u` to `v`
    /// exists. Reachability is unchanged.
    pub fn transitive_reduction(&mut self) {
        let edges = self.edges();
        for (from, to) in edges {
            let others: Vec<String> = self
                .get_down_vertexes(&from)
                .into_iter()
                .filter(|n| *n != to)
                .collect();
            if others.iter().any(|start| self.reaches(start, &to)) {
                self.disconnect(&from, &to);
            }
        }
    }

    fn reaches(&self, start: &str, target: &str) -> bool {
        let mut stack = vec![start];
        let mut seen: IndexSet<&str> = IndexSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(next) = self.down.get(current) {
                stack.extend(next.iter().map(String::as_str));
            }
        }
        false
    }
}
