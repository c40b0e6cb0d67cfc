//! End-to-end diamond graph: a shared leaf is staged and computed once, its
//! chunk is reclaimed after both consumers fire, and the result matches the
//! composed functions.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dagflow::{compute, debug_compute, gather, gather_computed, Computation, Context, ContextOptions};

use common::{as_usize, await_live_count, counted_const, map_usize, sum_all};

fn two_workers() -> Context {
    Context::with_options(ContextOptions {
        workers: 2,
        profile: false,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn diamond_computes_the_shared_leaf_once() {
    let ctx = two_workers();
    let invocations = Arc::new(AtomicUsize::new(0));

    let a = Computation::apply(counted_const(7, invocations.clone()), vec![]);
    let b = Computation::apply(map_usize(|x| x + 1), vec![a.clone()]);
    let c = Computation::apply(map_usize(|x| x * 2), vec![a]);
    let d = Computation::apply(sum_all(), vec![b, c]);

    let result = gather(&ctx, &d).await.expect("gather");

    // h(f(7), g(7)) = (7 + 1) + (7 * 2)
    assert_eq!(as_usize(&result), 22);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn intermediates_are_reclaimed_after_their_last_consumer() {
    let ctx = two_workers();
    let invocations = Arc::new(AtomicUsize::new(0));

    let a = Computation::apply(counted_const(3, invocations), vec![]);
    let b = Computation::apply(map_usize(|x| x + 1), vec![a.clone()]);
    let c = Computation::apply(map_usize(|x| x * 2), vec![a]);
    let d = Computation::apply(sum_all(), vec![b, c]);

    let computed = compute(&ctx, &d).await.expect("compute");

    // a, b and c are gone; only the root's chunk is live
    await_live_count(&ctx, 1).await;

    let result = gather_computed(&ctx, &computed).await.expect("gather");
    assert_eq!(as_usize(&result), 10);

    // dropping the result schedules the forced free of the root chunk
    drop(computed);
    await_live_count(&ctx, 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gather_of_compute_equals_direct_gather() {
    let ctx = two_workers();

    let make = || {
        let a = Computation::apply(common::constant(5), vec![]);
        let b = Computation::apply(map_usize(|x| x * 3), vec![a.clone()]);
        Computation::apply(sum_all(), vec![a, b])
    };

    let via_compute = {
        let computed = compute(&ctx, &make()).await.expect("compute");
        as_usize(&gather_computed(&ctx, &computed).await.expect("gather"))
    };
    let direct = as_usize(&gather(&ctx, &make()).await.expect("gather"));

    assert_eq!(via_compute, direct);
    assert_eq!(direct, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn debug_compute_reports_timing() {
    let ctx = two_workers();

    let a = Computation::apply(common::constant(2), vec![]);
    let b = Computation::apply(map_usize(|x| x + 2), vec![a]);

    let (computed, stats) = debug_compute(&ctx, &b).await.expect("debug compute");
    assert!(stats.elapsed.as_nanos() > 0);

    let v = gather_computed(&ctx, &computed).await.expect("gather");
    assert_eq!(as_usize(&v), 4);
}
