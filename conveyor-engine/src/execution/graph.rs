// Execution Graph (DAG) Builder
// Orders jobs into dependency layers for execution

use crate::workflow::models::JobSpec;

use std::collections::{HashMap, HashSet};
use std::fmt;

/// Error type for graph operations
#[derive(Debug, Clone, PartialEq)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
    /// Offending node ids; for cycles the full path, first node repeated last
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    CyclicDependency,
    /// Reference to unknown job
    UnknownDependency,
    /// Invalid graph structure (duplicate ids)
    InvalidStructure,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cyclic(path: Vec<String>) -> Self {
        Self {
            message: format!("circular dependency detected: {}", path.join(" -> ")),
            kind: GraphErrorKind::CyclicDependency,
            path,
        }
    }

    pub fn unknown_dependency(message: impl Into<String>, path: Vec<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownDependency,
            path,
        }
    }

    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::InvalidStructure,
            path: Vec::new(),
        }
    }
}

/// Anything that can be placed in the dependency graph
pub trait GraphNode {
    fn node_id(&self) -> &str;
    fn dependencies(&self) -> &[String];
}

impl GraphNode for JobSpec {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self) -> &[String] {
        self.needs.as_slice()
    }
}

/// Validated DAG of node ids with its execution layers
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    /// Node ids in declared order
    nodes: Vec<String>,
    /// Quick lookup of node index by id
    indices: HashMap<String, usize>,
    /// Direct dependencies per node, by index
    dependencies: Vec<Vec<usize>>,
    /// Layers of node indices; every dependency sits in an earlier layer
    layers: Vec<Vec<usize>>,
}

impl ExecutionGraph {
    /// Build the graph, rejecting unknown dependencies and cycles.
    pub fn build<N: GraphNode>(nodes: &[N]) -> Result<Self, GraphError> {
        let mut indices = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if indices.insert(node.node_id().to_string(), i).is_some() {
                return Err(GraphError::invalid_structure(format!(
                    "duplicate job id '{}'",
                    node.node_id()
                )));
            }
        }

        let mut dependencies = Vec::with_capacity(nodes.len());
        for node in nodes {
            let mut deps = Vec::new();
            for dep in node.dependencies() {
                let Some(&idx) = indices.get(dep) else {
                    return Err(GraphError::unknown_dependency(
                        format!(
                            "job '{}' depends on unknown job '{}'",
                            node.node_id(),
                            dep
                        ),
                        vec![node.node_id().to_string(), dep.clone()],
                    ));
                };
                if !deps.contains(&idx) {
                    deps.push(idx);
                }
            }
            dependencies.push(deps);
        }

        let mut graph = Self {
            nodes: nodes.iter().map(|n| n.node_id().to_string()).collect(),
            indices,
            dependencies,
            layers: Vec::new(),
        };

        graph.detect_cycles()?;
        graph.layers = graph.compute_layers();

        Ok(graph)
    }

    /// Detect cycles using DFS with a recursion stack
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for start in 0..self.nodes.len() {
            if !visited.contains(&start) {
                if let Some(cycle) = self.dfs_cycle(start, &mut visited, &mut stack) {
                    let path = cycle.iter().map(|&i| self.nodes[i].clone()).collect();
                    return Err(GraphError::cyclic(path));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: usize,
        visited: &mut HashSet<usize>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        visited.insert(node);
        stack.push(node);

        for &dep in &self.dependencies[node] {
            if let Some(pos) = stack.iter().position(|&n| n == dep) {
                let mut cycle = stack[pos..].to_vec();
                cycle.push(dep);
                return Some(cycle);
            }
            if !visited.contains(&dep) {
                if let Some(cycle) = self.dfs_cycle(dep, visited, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        None
    }

    /// Kahn's algorithm, one frontier at a time, declared order kept within a layer
    fn compute_layers(&self) -> Vec<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (node, deps) in self.dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(node);
            }
        }

        let mut layers = Vec::new();
        let mut frontier: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for &node in &frontier {
                for &dependent in &dependents[node] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();
            layers.push(std::mem::replace(&mut frontier, next));
        }

        layers
    }

    /// Layers of node ids; concatenated they form a topological order
    pub fn layers(&self) -> Vec<Vec<&str>> {
        self.layers
            .iter()
            .map(|layer| layer.iter().map(|&i| self.nodes[i].as_str()).collect())
            .collect()
    }

    /// All node ids in a valid topological order
    pub fn topological_order(&self) -> Vec<&str> {
        self.layers.iter().flatten().map(|&i| self.nodes[i].as_str()).collect()
    }

    /// Direct dependencies of a node
    pub fn dependencies_of(&self, id: &str) -> Option<Vec<&str>> {
        let idx = *self.indices.get(id)?;
        Some(
            self.dependencies[idx]
                .iter()
                .map(|&i| self.nodes[i].as_str())
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
