//! Dependency ordering for resources that must start after one another
//!
//! Resources form a DAG over their declared dependencies. Creation walks the
//! graph in topological order (dependencies first); teardown walks the exact
//! reverse (dependents first). A cycle is a configuration error and is
//! reported with the names of its members before any remote mutation.

use thiserror::Error;

/// Errors raised while building or ordering a dependency graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// A node depends on a name that is not part of the graph.
    #[error("`{node}` depends on unknown resource `{dependency}`")]
    UnknownDependency { node: String, dependency: String },

    /// The dependency relation contains a cycle.
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Three-color DFS mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// A dependency graph over named nodes.
#[derive(Debug)]
pub struct DependencyGraph {
    names: Vec<String>,
    /// `deps[i]` holds the indices node `i` depends on.
    deps: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build a graph from `(name, dependencies)` pairs.
    ///
    /// Dependencies are given by name and must refer to nodes in the same
    /// graph.
    pub fn build<S: AsRef<str>>(nodes: &[(S, Vec<S>)]) -> Result<Self, GraphError> {
        let names: Vec<String> = nodes.iter().map(|(n, _)| n.as_ref().to_string()).collect();

        let index_of = |name: &str| names.iter().position(|n| n == name);

        let mut deps = Vec::with_capacity(nodes.len());
        for (name, dependencies) in nodes {
            let mut resolved = Vec::with_capacity(dependencies.len());
            for dep in dependencies {
                let idx = index_of(dep.as_ref()).ok_or_else(|| GraphError::UnknownDependency {
                    node: name.as_ref().to_string(),
                    dependency: dep.as_ref().to_string(),
                })?;
                resolved.push(idx);
            }
            deps.push(resolved);
        }

        Ok(Self { names, deps })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, idx: usize) -> &str {
        &self.names[idx]
    }

    /// Topological order for creation: every node appears after all of its
    /// dependencies. Declaration order is preserved among unrelated nodes.
    pub fn creation_order(&self) -> Result<Vec<usize>, GraphError> {
        let mut marks = vec![Mark::White; self.names.len()];
        let mut order = Vec::with_capacity(self.names.len());
        let mut stack = Vec::new();

        for idx in 0..self.names.len() {
            if marks[idx] == Mark::White {
                self.visit(idx, &mut marks, &mut order, &mut stack)?;
            }
        }

        Ok(order)
    }

    /// Reverse topological order for teardown: dependents are removed before
    /// the resources they depend on.
    pub fn teardown_order(&self) -> Result<Vec<usize>, GraphError> {
        let mut order = self.creation_order()?;
        order.reverse();
        Ok(order)
    }

    fn visit(
        &self,
        idx: usize,
        marks: &mut [Mark],
        order: &mut Vec<usize>,
        stack: &mut Vec<usize>,
    ) -> Result<(), GraphError> {
        marks[idx] = Mark::Gray;
        stack.push(idx);

        for &dep in &self.deps[idx] {
            match marks[dep] {
                Mark::Black => {}
                Mark::White => self.visit(dep, marks, order, stack)?,
                Mark::Gray => {
                    // Back edge: the cycle is the gray stack from the first
                    // occurrence of `dep`, closed by `dep` itself.
                    let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut members: Vec<String> = stack[start..]
                        .iter()
                        .map(|&n| self.names[n].clone())
                        .collect();
                    members.push(self.names[dep].clone());
                    return Err(GraphError::Cycle(members));
                }
            }
        }

        stack.pop();
        marks[idx] = Mark::Black;
        order.push(idx);
        Ok(())
    }
}
