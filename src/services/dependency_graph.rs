//! Dependency graph utilities: cycle detection and stable topological
//! ordering over id → dependency-ids adjacency maps. Shared by objective
//! planning and agent dependency validation.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Detect a cycle in a dependency graph. Returns the node path forming
/// the cycle when one exists.
pub fn detect_cycle(graph: &HashMap<Uuid, Vec<Uuid>>) -> Option<Vec<Uuid>> {
    fn visit(
        node: Uuid,
        graph: &HashMap<Uuid, Vec<Uuid>>,
        visited: &mut HashSet<Uuid>,
        rec_stack: &mut HashSet<Uuid>,
        path: &mut Vec<Uuid>,
    ) -> bool {
        visited.insert(node);
        rec_stack.insert(node);
        path.push(node);

        if let Some(neighbors) = graph.get(&node) {
            for &neighbor in neighbors {
                if !visited.contains(&neighbor) {
                    if visit(neighbor, graph, visited, rec_stack, path) {
                        return true;
                    }
                } else if rec_stack.contains(&neighbor) {
                    if let Some(start) = path.iter().position(|&id| id == neighbor) {
                        path.drain(0..start);
                    }
                    return true;
                }
            }
        }

        rec_stack.remove(&node);
        path.pop();
        false
    }

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    let mut nodes: Vec<Uuid> = graph.keys().copied().collect();
    nodes.sort();
    for node in nodes {
        if !visited.contains(&node) && visit(node, graph, &mut visited, &mut rec_stack, &mut path)
        {
            return Some(path);
        }
    }
    None
}

/// Stable topological sort via Kahn's algorithm. Dependencies come before
/// dependents; ties are broken by the caller-supplied ranking (lower rank
/// first). Edges pointing outside the node set are ignored. Returns None
/// when the graph is cyclic.
pub fn topological_sort<K: Ord>(
    graph: &HashMap<Uuid, Vec<Uuid>>,
    rank: impl Fn(Uuid) -> K,
) -> Option<Vec<Uuid>> {
    let nodes: HashSet<Uuid> = graph.keys().copied().collect();
    let mut in_degree: HashMap<Uuid, usize> = nodes.iter().map(|&id| (id, 0)).collect();
    let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

    for (&node, deps) in graph {
        for &dep in deps {
            if nodes.contains(&dep) {
                dependents.entry(dep).or_default().push(node);
                *in_degree.entry(node).or_insert(0) += 1;
            }
        }
    }

    let mut ready: Vec<Uuid> = in_degree
        .iter()
        .filter(|&(_, &degree)| degree == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut sorted = Vec::with_capacity(nodes.len());
    while !ready.is_empty() {
        // Pick the lowest-ranked ready node so the order is deterministic.
        ready.sort_by_key(|&id| (rank(id), id));
        let node = ready.remove(0);
        sorted.push(node);

        if let Some(children) = dependents.get(&node) {
            for &child in children {
                if let Some(degree) = in_degree.get_mut(&child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(child);
                    }
                }
            }
        }
    }

    (sorted.len() == nodes.len()).then_some(sorted)
}

/// Longest path through a DAG weighted by per-node durations. Returns the
/// path and its total weight. Assumes `order` is a valid topological
/// order of `graph`'s nodes.
pub fn critical_path(
    graph: &HashMap<Uuid, Vec<Uuid>>,
    order: &[Uuid],
    weight: impl Fn(Uuid) -> u64,
) -> (Vec<Uuid>, u64) {
    let nodes: HashSet<Uuid> = graph.keys().copied().collect();
    let mut best: HashMap<Uuid, (u64, Option<Uuid>)> = HashMap::new();

    for &node in order {
        let own = weight(node);
        let mut incoming: Option<(u64, Uuid)> = None;
        if let Some(deps) = graph.get(&node) {
            for &dep in deps {
                if !nodes.contains(&dep) {
                    continue;
                }
                let dep_total = best.get(&dep).map_or(0, |(total, _)| *total);
                if incoming.is_none_or(|(t, _)| dep_total > t) {
                    incoming = Some((dep_total, dep));
                }
            }
        }
        let (base, via) = incoming.map_or((0, None), |(t, d)| (t, Some(d)));
        best.insert(node, (base + own, via));
    }

    let Some((end, total)) = best
        .iter()
        .map(|(&id, &(total, _))| (id, total))
        .max_by_key(|&(id, total)| (total, id))
    else {
        return (Vec::new(), 0);
    };

    let mut path = vec![end];
    let mut cursor = end;
    while let Some(&(_, Some(prev))) = best.get(&cursor) {
        path.push(prev);
        cursor = prev;
    }
    path.reverse();
    (path, total)
}
