//! The directed transform graph over [`System`] nodes, and its shortest-path planner.
//!
//! The graph is built once from the transform catalogue and held behind a
//! [`once_cell::sync::Lazy`]; `System` and `Edge` are plain data (no interior mutability), so the
//! shared graph is free to read from multiple threads.

use std::collections::{HashMap, HashSet, VecDeque};

use once_cell::sync::Lazy;

use crate::bundle::Bundle;
use crate::error::Error;
use crate::system::System;
use crate::transforms::{catalogue, Edge, EdgeArgs};

/// The transform graph: a directed graph whose nodes are [`System`] values and whose edges are
/// the catalogue's entries.
pub struct Graph {
    edges: &'static [Edge],
}

static GRAPH: Lazy<Graph> = Lazy::new(|| Graph {
    edges: catalogue(),
});

/// Returns the process-wide transform graph, building it on first use.
pub fn graph() -> &'static Graph {
    &GRAPH
}

impl Graph {
    /// Finds the shortest (fewest-edges) directed path from `src` to `dst` via breadth-first
    /// search over the catalogue's edges. Returns an empty path if `src == dst` (the identity
    /// transform, per the "S -> S" testable property). Fails with
    /// [`Error::UnsupportedTransformation`] if no path exists.
    pub fn shortest_path(&self, src: System, dst: System) -> Result<Vec<&'static Edge>, Error> {
        if src == dst {
            return Ok(Vec::new());
        }

        let mut visited: HashSet<System> = HashSet::new();
        visited.insert(src);
        let mut queue: VecDeque<System> = VecDeque::new();
        queue.push_back(src);
        let mut predecessor: HashMap<System, (System, &'static Edge)> = HashMap::new();

        while let Some(node) = queue.pop_front() {
            if node == dst {
                break;
            }
            for edge in self.edges.iter().filter(|e| e.src == node) {
                if visited.insert(edge.dst) {
                    predecessor.insert(edge.dst, (node, edge));
                    queue.push_back(edge.dst);
                }
            }
        }

        if !visited.contains(&dst) {
            return Err(Error::unsupported(src, dst));
        }

        let mut path = Vec::new();
        let mut current = dst;
        while current != src {
            let (prev, edge) = predecessor[&current];
            path.push(edge);
            current = prev;
        }
        path.reverse();
        Ok(path)
    }
}

/// A planned, composed path: a sequence of edges to apply in order. Composition is a fold: edge
/// `k` consumes the output of edge `k-1`. The composed path's `uses_alpha`/`uses_out_angles`
/// attributes are the logical OR across every edge on the path.
pub struct ComposedPath {
    edges: Vec<&'static Edge>,
}

impl ComposedPath {
    /// Wraps a planned edge sequence for execution.
    pub fn new(edges: Vec<&'static Edge>) -> Self {
        Self { edges }
    }

    /// Whether any edge on this path reads the `alpha` position-angle field.
    pub fn uses_alpha(&self) -> bool {
        self.edges.iter().any(|edge| edge.uses_alpha)
    }

    /// Whether any edge on this path requires caller-supplied `out_angles`.
    pub fn uses_out_angles(&self) -> bool {
        self.edges.iter().any(|edge| edge.uses_out_angles)
    }

    /// Executes the composed path, threading `args` into every edge. An empty path (the identity
    /// transform) returns a clone of `input`.
    pub fn execute(&self, input: &Bundle, args: &EdgeArgs) -> Result<Bundle, Error> {
        let mut current = input.clone();
        for edge in &self.edges {
            current = (edge.apply)(&current, args)?;
        }
        Ok(current)
    }
}
