//! Graph analysis over hand-built thunk DAGs: dependents, offspring counts,
//! total order, acyclicity.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use dagflow::dag::analysis::{
    collect_thunks, dependents, ensure_acyclic, offspring, total_order, NodeKey,
};
use dagflow::{Thunk, ThunkInput};

use common::{constant, map_usize, sum_all};

/// A = leaf, B = f(A), C = g(A), D = h(B, C).
fn diamond() -> (Arc<Thunk>, Arc<Thunk>, Arc<Thunk>, Arc<Thunk>) {
    let a = Thunk::new(constant(1), vec![]);
    let b = Thunk::new(map_usize(|x| x + 1), vec![ThunkInput::Thunk(a.clone())]);
    let c = Thunk::new(map_usize(|x| x * 2), vec![ThunkInput::Thunk(a.clone())]);
    let d = Thunk::new(
        sum_all(),
        vec![ThunkInput::Thunk(b.clone()), ThunkInput::Thunk(c.clone())],
    );
    (a, b, c, d)
}

#[test]
fn collect_finds_every_reachable_thunk() {
    let (a, b, c, d) = diamond();
    let thunks = collect_thunks(&d);
    assert_eq!(thunks.len(), 4);
    for t in [&a, &b, &c, &d] {
        assert!(thunks.contains_key(&t.id));
    }
}

#[test]
fn dependents_maps_every_node_to_its_consumers() {
    let (a, b, c, d) = diamond();
    let deps = dependents(&d);

    let consumers: HashSet<_> = deps[&NodeKey::Thunk(a.id)].iter().copied().collect();
    assert_eq!(consumers, HashSet::from([b.id, c.id]));

    assert_eq!(deps[&NodeKey::Thunk(b.id)], HashSet::from([d.id]));
    assert_eq!(deps[&NodeKey::Thunk(c.id)], HashSet::from([d.id]));
    assert!(deps[&NodeKey::Thunk(d.id)].is_empty());
}

#[test]
fn offspring_counts_distinct_transitive_dependents() {
    let (a, b, c, d) = diamond();
    let deps = dependents(&d);
    let counts = offspring(&deps);

    assert_eq!(counts[&a.id], 3); // b, c, d
    assert_eq!(counts[&b.id], 1);
    assert_eq!(counts[&c.id], 1);
    assert_eq!(counts[&d.id], 0);
}

#[test]
fn order_numbers_each_node_exactly_once_from_the_root() {
    let (a, b, c, d) = diamond();
    let deps = dependents(&d);
    let counts = offspring(&deps);
    let order = total_order(&d, &counts);

    assert_eq!(order.len(), 4);
    assert_eq!(order[&d.id], 1);

    let mut indices: Vec<usize> = order.values().copied().collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![1, 2, 3, 4]);

    // the shared leaf sits below both branches
    assert!(order[&a.id] > order[&b.id] || order[&a.id] > order[&c.id]);
}

#[test]
fn order_visits_low_offspring_children_first() {
    // s feeds both m and the root; m feeds only the root
    let s = Thunk::new(constant(1), vec![]);
    let m = Thunk::new(map_usize(|v| v + 1), vec![ThunkInput::Thunk(s.clone())]);
    let root = Thunk::new(
        sum_all(),
        vec![ThunkInput::Thunk(s.clone()), ThunkInput::Thunk(m.clone())],
    );

    let deps = dependents(&root);
    let counts = offspring(&deps);
    let order = total_order(&root, &counts);

    // m has fewer transitive dependents than s, so it is numbered first even
    // though s comes first in the input list
    assert!(order[&m.id] < order[&s.id]);
}

#[test]
fn acyclic_graphs_validate() {
    let (_a, _b, _c, d) = diamond();
    let thunks = collect_thunks(&d);
    assert!(ensure_acyclic(&thunks).is_ok());
}

#[test]
fn chunk_leaves_are_tracked_for_reference_counting() {
    let chunk = dagflow::Chunk { id: 77, worker: 0 };
    let t = Thunk::new(
        map_usize(|x| x),
        vec![ThunkInput::Chunk(dagflow::AbstractChunk::Chunk(chunk))],
    );
    let deps = dependents(&t);
    assert_eq!(deps[&NodeKey::Chunk(77)], HashSet::from([t.id]));
}
