//! Generic dependency-graph validation: cycle detection, roots, and
//! transitive dependents over any type exposing an id and a dependency set.
//!
//! Shared by `domain::TaskFile::validate` (invariant 6: `depends_on` forms
//! a DAG) and `intake`'s document-level dependency validation.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("cycle detected involving task {0}")]
    Cycle(String),
    #[error("unknown task id referenced: {0}")]
    UnknownId(String),
}

/// Implemented by any node type that can sit in a dependency graph.
pub trait GraphNode {
    fn id(&self) -> &str;
    fn dependencies(&self) -> &HashSet<String>;
}

/// A read-only view over a slice of nodes, supporting DAG validation and
/// dependency queries without taking ownership of the nodes.
pub struct DependencyGraph<'a, T: GraphNode> {
    nodes: Vec<&'a T>,
    by_id: HashMap<&'a str, &'a T>,
}

impl<'a, T: GraphNode> DependencyGraph<'a, T> {
    pub fn new(nodes: &[&'a T]) -> Self {
        let by_id = nodes.iter().map(|n| (n.id(), *n)).collect();
        Self {
            nodes: nodes.to_vec(),
            by_id,
        }
    }

    /// Runs a full DFS cycle check over every node in the graph.
    pub fn validate_dag(&self) -> Result<(), GraphError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        for node in &self.nodes {
            if !visited.contains(node.id()) {
                self.has_cycle_dfs(node.id(), &mut visited, &mut rec_stack)?;
            }
        }
        Ok(())
    }

    fn has_cycle_dfs(
        &self,
        node_id: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
    ) -> Result<(), GraphError> {
        visited.insert(node_id.to_string());
        rec_stack.insert(node_id.to_string());

        if let Some(node) = self.by_id.get(node_id) {
            for dep in node.dependencies() {
                if !self.by_id.contains_key(dep.as_str()) {
                    return Err(GraphError::UnknownId(dep.clone()));
                }
                if rec_stack.contains(dep) {
                    return Err(GraphError::Cycle(dep.clone()));
                }
                if !visited.contains(dep) {
                    self.has_cycle_dfs(dep, visited, rec_stack)?;
                }
            }
        }

        rec_stack.remove(node_id);
        Ok(())
    }

    /// Nodes with no dependencies at all.
    pub fn get_roots(&self) -> Vec<&'a T> {
        self.nodes
            .iter()
            .filter(|n| n.dependencies().is_empty())
            .copied()
            .collect()
    }

    /// Direct dependents of `node_id`: nodes whose `dependencies()` include it.
    pub fn get_dependents(&self, node_id: &str) -> Vec<&'a T> {
        self.nodes
            .iter()
            .filter(|n| n.dependencies().contains(node_id))
            .copied()
            .collect()
    }

    /// All nodes transitively depending on `node_id`, via repeated BFS over `get_dependents`.
    pub fn get_transitive_dependents(&self, node_id: &str) -> Vec<&'a T> {
        let mut seen = HashSet::new();
        let mut frontier = vec![node_id.to_string()];
        let mut result = Vec::new();

        while let Some(current) = frontier.pop() {
            for dependent in self.get_dependents(&current) {
                if seen.insert(dependent.id().to_string()) {
                    result.push(dependent);
                    frontier.push(dependent.id().to_string());
                }
            }
        }

        result
    }

    /// True if adding a dependency edge `from -> to` would create a cycle.
    pub fn would_create_cycle(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        self.is_reachable(to, from)
    }

    fn is_reachable(&self, from: &str, to: &str) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from.to_string()];
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.by_id.get(current.as_str()) {
                for dep in node.dependencies() {
                    stack.push(dep.clone());
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        id: String,
        deps: HashSet<String>,
    }

    impl Node {
        fn new(id: &str, deps: &[&str]) -> Self {
            Self {
                id: id.to_string(),
                deps: deps.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl GraphNode for Node {
        fn id(&self) -> &str {
            &self.id
        }

        fn dependencies(&self) -> &HashSet<String> {
            &self.deps
        }
    }

    #[test]
    fn validate_dag_accepts_acyclic_graph() {
        let a = Node::new("a", &[]);
        let b = Node::new("b", &["a"]);
        let c = Node::new("c", &["b"]);
        let refs = vec![&a, &b, &c];
        let graph = DependencyGraph::new(&refs);
        assert!(graph.validate_dag().is_ok());
    }

    #[test]
    fn validate_dag_rejects_direct_cycle() {
        let a = Node::new("a", &["b"]);
        let b = Node::new("b", &["a"]);
        let refs = vec![&a, &b];
        let graph = DependencyGraph::new(&refs);
        assert!(graph.validate_dag().is_err());
    }

    #[test]
    fn validate_dag_rejects_self_cycle() {
        let a = Node::new("a", &["a"]);
        let refs = vec![&a];
        let graph = DependencyGraph::new(&refs);
        assert!(graph.validate_dag().is_err());
    }

    #[test]
    fn get_roots_returns_only_dependency_free_nodes() {
        let a = Node::new("a", &[]);
        let b = Node::new("b", &["a"]);
        let refs = vec![&a, &b];
        let graph = DependencyGraph::new(&refs);
        let roots = graph.get_roots();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id(), "a");
    }

    #[test]
    fn transitive_dependents_follow_chain() {
        let a = Node::new("a", &[]);
        let b = Node::new("b", &["a"]);
        let c = Node::new("c", &["b"]);
        let refs = vec![&a, &b, &c];
        let graph = DependencyGraph::new(&refs);
        let deps = graph.get_transitive_dependents("a");
        let ids: HashSet<_> = deps.iter().map(|n| n.id().to_string()).collect();
        assert!(ids.contains("b"));
        assert!(ids.contains("c"));
    }

    #[test]
    fn would_create_cycle_detects_back_edge() {
        let a = Node::new("a", &[]);
        let b = Node::new("b", &["a"]);
        let refs = vec![&a, &b];
        let graph = DependencyGraph::new(&refs);
        assert!(graph.would_create_cycle("a", "b"));
        assert!(!graph.would_create_cycle("b", "a"));
    }
}

#[cfg(test)]
#[path = "graph_proptests.rs"]
mod proptests;
