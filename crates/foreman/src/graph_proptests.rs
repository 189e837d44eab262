//! Property-based tests for dependency-graph validation.
//!
//! These generate random DAGs (and, separately, graphs with an injected
//! back edge) to check `validate_dag`/`would_create_cycle` hold across
//! shapes beyond the handful of examples above.

use super::*;
use proptest::prelude::*;

struct Node {
    id: String,
    deps: HashSet<String>,
}

impl Node {
    fn new(id: impl Into<String>, deps: HashSet<String>) -> Self {
        Self { id: id.into(), deps }
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

/// Builds a chain of `n` nodes, each depending only on lower-numbered
/// nodes (so the result is acyclic by construction, the way a
/// topologically-sorted `depends_on` list would be).
fn acyclic_chain(n: usize, edge_density: f64, seed: u64) -> Vec<Node> {
    let mut state = seed;
    let mut next_bit = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state % 1000) as f64 / 1000.0
    };

    (0..n)
        .map(|i| {
            let deps: HashSet<String> = (0..i)
                .filter(|_| next_bit() < edge_density)
                .map(|j| format!("n{j}"))
                .collect();
            Node::new(format!("n{i}"), deps)
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_acyclic_by_construction_graph_always_validates(
        n in 1usize..15,
        edge_density in 0.0f64..1.0,
        seed in any::<u64>(),
    ) {
        let nodes = acyclic_chain(n, edge_density, seed);
        let refs: Vec<&Node> = nodes.iter().collect();
        let graph = DependencyGraph::new(&refs);
        prop_assert!(graph.validate_dag().is_ok());
    }

    #[test]
    fn prop_injected_back_edge_is_always_detected(
        n in 2usize..15,
        edge_density in 0.0f64..1.0,
        seed in any::<u64>(),
    ) {
        let mut nodes = acyclic_chain(n, edge_density, seed);
        // Force the last node to depend on the first, and the first to
        // depend on the last: a guaranteed cycle regardless of the rest
        // of the (acyclic-by-construction) edge set.
        let first_id = nodes[0].id.clone();
        let last_id = nodes[n - 1].id.clone();
        nodes[0].deps.insert(last_id.clone());
        prop_assume!(first_id != last_id);

        let refs: Vec<&Node> = nodes.iter().collect();
        let graph = DependencyGraph::new(&refs);
        prop_assert!(graph.validate_dag().is_err());
    }

    #[test]
    fn prop_would_create_cycle_agrees_with_validate_dag(
        n in 1usize..10,
        edge_density in 0.0f64..1.0,
        seed in any::<u64>(),
    ) {
        let nodes = acyclic_chain(n, edge_density, seed);
        let refs: Vec<&Node> = nodes.iter().collect();
        let graph = DependencyGraph::new(&refs);

        for from in &nodes {
            for to in &nodes {
                if from.id == to.id {
                    continue;
                }
                if graph.would_create_cycle(&from.id, &to.id) {
                    // Adding from -> to would close a cycle only if `to`
                    // already (transitively) depends on `from`.
                    prop_assert!(graph.is_reachable(&to.id, &from.id));
                }
            }
        }
    }
}
