//! Property tests for the dependency graph utilities.

use proptest::prelude::*;
use std::collections::HashMap;
use uuid::Uuid;
use zmcp::services::dependency_graph::{detect_cycle, topological_sort};

/// Build a random DAG: edges only point from later nodes to earlier ones
/// (dependencies), which is acyclic by construction.
fn arb_dag(max_nodes: usize) -> impl Strategy<Value = HashMap<Uuid, Vec<Uuid>>> {
    (2..max_nodes).prop_flat_map(|n| {
        let nodes: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        let edge_mask = proptest::collection::vec(proptest::bool::ANY, n * n);
        (Just(nodes), edge_mask).prop_map(|(nodes, mask)| {
            let n = nodes.len();
            let mut graph: HashMap<Uuid, Vec<Uuid>> =
                nodes.iter().map(|&id| (id, Vec::new())).collect();
            for i in 0..n {
                for j in 0..i {
                    if mask[i * n + j] {
                        graph.get_mut(&nodes[i]).unwrap().push(nodes[j]);
                    }
                }
            }
            graph
        })
    })
}

proptest! {
    #[test]
    fn prop_random_dag_has_no_cycle(graph in arb_dag(12)) {
        prop_assert!(detect_cycle(&graph).is_none());
    }

    #[test]
    fn prop_topological_order_respects_every_edge(graph in arb_dag(12)) {
        let order = topological_sort(&graph, |_| 0u8).expect("DAG must sort");
        prop_assert_eq!(order.len(), graph.len());

        let position: HashMap<Uuid, usize> =
            order.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        for (node, deps) in &graph {
            for dep in deps {
                prop_assert!(
                    position[dep] < position[node],
                    "dependency must sort before dependent"
                );
            }
        }
    }

    #[test]
    fn prop_closing_a_loop_is_detected(graph in arb_dag(12)) {
        // Pick any edge a -> b and add the reverse edge b -> a.
        let Some((&node, deps)) = graph.iter().find(|(_, deps)| !deps.is_empty()) else {
            return Ok(());
        };
        let back = deps[0];
        let mut cyclic = graph.clone();
        cyclic.get_mut(&back).unwrap().push(node);

        prop_assert!(detect_cycle(&cyclic).is_some());
        prop_assert!(topological_sort(&cyclic, |_| 0u8).is_none());
    }
}
