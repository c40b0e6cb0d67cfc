// src/dag/analysis.rs

//! Derived metadata over the thunk graph.
//!
//! The graph itself is acyclic; dependent links are back-edges, so they are
//! kept as derived mappings keyed on node identity and rebuilt per compute
//! call rather than stored on the nodes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::chunk::ChunkId;
use crate::errors::{DagflowError, Result};
use crate::thunk::{Thunk, ThunkId, ThunkInput};

/// Identity of a node tracked by the reference counter.
///
/// Thunks are keyed by their id; chunk-valued leaf inputs are keyed by the
/// chunk id so their consumers can be counted too (views count against the
/// parent chunk). Plain data inputs get no entry. Only thunk outputs are
/// ever reclaimed; leaf chunks stay owned by whoever supplied them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKey {
    Thunk(ThunkId),
    Chunk(ChunkId),
}

impl NodeKey {
    pub fn of_input(input: &ThunkInput) -> Option<NodeKey> {
        match input {
            ThunkInput::Thunk(t) => Some(NodeKey::Thunk(t.id)),
            ThunkInput::Chunk(ac) => match ac {
                crate::chunk::AbstractChunk::Chunk(c) => Some(NodeKey::Chunk(c.id)),
                crate::chunk::AbstractChunk::View(v) => Some(NodeKey::Chunk(v.parent.id)),
                // aggregates are fused before execution in all driven paths
                // and are not reference-counted as leaves
                crate::chunk::AbstractChunk::Cat(_) => None,
            },
            ThunkInput::Data(_) => None,
        }
    }
}

/// Every thunk reachable from `root` through input edges, keyed by id.
pub fn collect_thunks(root: &Arc<Thunk>) -> HashMap<ThunkId, Arc<Thunk>> {
    let mut thunks = HashMap::new();
    let mut stack = vec![root.clone()];

    while let Some(node) = stack.pop() {
        if thunks.insert(node.id, node.clone()).is_some() {
            continue;
        }
        for dep in node.thunk_inputs() {
            stack.push(dep.clone());
        }
    }

    thunks
}

/// For each node, the set of thunks that list it among their inputs.
///
/// Every reachable thunk gets an entry (the root's is empty); chunk leaves
/// get entries so the reference counter can track their consumers.
pub fn dependents(root: &Arc<Thunk>) -> HashMap<NodeKey, HashSet<ThunkId>> {
    let mut deps: HashMap<NodeKey, HashSet<ThunkId>> = HashMap::new();
    let mut visited: HashSet<ThunkId> = HashSet::new();
    let mut stack = vec![root.clone()];

    deps.entry(NodeKey::Thunk(root.id)).or_default();

    while let Some(node) = stack.pop() {
        if !visited.insert(node.id) {
            continue;
        }
        for input in &node.inputs {
            if let Some(key) = NodeKey::of_input(input) {
                deps.entry(key).or_default().insert(node.id);
            }
            if let ThunkInput::Thunk(dep) = input {
                deps.entry(NodeKey::Thunk(dep.id)).or_default();
                stack.push(dep.clone());
            }
        }
    }

    deps
}

/// Per-thunk count of distinct transitively dependent nodes. Used as the
/// branch-priority heuristic when deriving the total order.
pub fn offspring(deps: &HashMap<NodeKey, HashSet<ThunkId>>) -> HashMap<ThunkId, usize> {
    let mut counts = HashMap::new();

    for key in deps.keys() {
        let NodeKey::Thunk(id) = key else { continue };
        let mut seen: HashSet<ThunkId> = HashSet::new();
        let mut stack: Vec<ThunkId> = deps[key].iter().copied().collect();
        while let Some(dependent) = stack.pop() {
            if seen.insert(dependent) {
                if let Some(next) = deps.get(&NodeKey::Thunk(dependent)) {
                    stack.extend(next.iter().copied());
                }
            }
        }
        counts.insert(*id, seen.len());
    }

    counts
}

/// DFS pre-order from the root, children visited in ascending offspring
/// count. Each node is numbered exactly once; smaller numbers are closer to
/// the root, and dispatch priority is the negated order index.
pub fn total_order(
    root: &Arc<Thunk>,
    offspring: &HashMap<ThunkId, usize>,
) -> HashMap<ThunkId, usize> {
    let mut order = HashMap::new();
    let mut next = 0usize;
    let mut stack = vec![root.clone()];

    while let Some(node) = stack.pop() {
        if order.contains_key(&node.id) {
            continue;
        }
        next += 1;
        order.insert(node.id, next);

        let mut children: Vec<Arc<Thunk>> = node.thunk_inputs().cloned().collect();
        children.sort_by_key(|c| offspring.get(&c.id).copied().unwrap_or(0));
        // reversed push so the lowest-offspring child is visited first
        for child in children.into_iter().rev() {
            if !order.contains_key(&child.id) {
                stack.push(child);
            }
        }
    }

    order
}

/// Validate that the input relation is acyclic.
///
/// Edge direction: input -> consumer. A topological sort will fail if there
/// is a cycle; that is a structural error the scheduler does not tolerate.
pub fn ensure_acyclic(thunks: &HashMap<ThunkId, Arc<Thunk>>) -> Result<()> {
    let mut graph: DiGraphMap<ThunkId, ()> = DiGraphMap::new();

    for id in thunks.keys() {
        graph.add_node(*id);
    }
    for (id, thunk) in thunks {
        for dep in thunk.thunk_inputs() {
            graph.add_edge(dep.id, *id, ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(DagflowError::GraphCycle(cycle.node_id())),
    }
}
