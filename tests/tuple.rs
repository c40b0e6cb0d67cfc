//! Tuple computations: the result is the ordered tuple of the parts'
//! materialized results.

mod common;

use dagflow::{gather, Computation, Context, ContextOptions};

use common::{as_usize, as_vec, constant, map_usize};

fn two_workers() -> Context {
    Context::with_options(ContextOptions {
        workers: 2,
        profile: false,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_tuple_returns_both_results_in_order() {
    let ctx = two_workers();

    let a = Computation::apply(constant(3), vec![]);
    let b = Computation::apply(map_usize(|x| x + 10), vec![a.clone()]);
    let pair = Computation::tuple(vec![a, b]);

    let values = gather(&ctx, &pair).await.expect("gather");
    let cells = as_vec(&values);

    assert_eq!(cells.len(), 2);
    assert_eq!(as_usize(&cells[0]), 3);
    assert_eq!(as_usize(&cells[1]), 13);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nested_tuples_materialize_recursively() {
    let ctx = two_workers();

    let a = Computation::apply(constant(1), vec![]);
    let b = Computation::apply(constant(2), vec![]);
    let inner = Computation::tuple(vec![a, b]);
    let c = Computation::apply(constant(3), vec![]);
    let outer = Computation::tuple(vec![inner, c]);

    let values = gather(&ctx, &outer).await.expect("gather");
    let cells = as_vec(&values);

    assert_eq!(cells.len(), 2);
    let inner_cells = as_vec(&cells[0]);
    assert_eq!(as_usize(&inner_cells[0]), 1);
    assert_eq!(as_usize(&inner_cells[1]), 2);
    assert_eq!(as_usize(&cells[1]), 3);
}
