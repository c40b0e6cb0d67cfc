//! Cached computations: the result survives the run, later computes reuse it
//! without re-invoking the function, and a reclaimed datum falls back to
//! recomputation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dagflow::{compute, free_computed, gather, Computation, Context, ContextOptions};

use common::{as_usize, counted_const, map_usize};

fn two_workers() -> Context {
    Context::with_options(ContextOptions {
        workers: 2,
        profile: false,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_cached_computation_runs_once_across_computes() {
    let ctx = two_workers();
    let invocations = Arc::new(AtomicUsize::new(0));

    let e = Computation::apply(counted_const(5, invocations.clone()), vec![]).cached();

    let first = compute(&ctx, &e).await.expect("first compute");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // a second expression containing e must not re-invoke its function
    let f = Computation::apply(map_usize(|x| x * 2), vec![e.clone()]);
    let doubled = gather(&ctx, &f).await.expect("gather");
    assert_eq!(as_usize(&doubled), 10);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // recomputing e itself is a pure cache hit as well
    let again = compute(&ctx, &e).await.expect("recompute");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    drop(first);
    drop(again);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_reclaimed_cached_result_is_recomputed() {
    let ctx = two_workers();
    let invocations = Arc::new(AtomicUsize::new(0));

    let e = Computation::apply(counted_const(8, invocations.clone()), vec![]).cached();

    let first = compute(&ctx, &e).await.expect("first compute");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // forcibly release the persisted datum, then give the reaper a moment
    free_computed(&ctx, &first, true, false);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let f = Computation::apply(map_usize(|x| x + 1), vec![e.clone()]);
    let bumped = gather(&ctx, &f).await.expect("gather");
    assert_eq!(as_usize(&bumped), 9);
    assert_eq!(
        invocations.load(Ordering::SeqCst),
        2,
        "the cache miss falls back to remote execution"
    );
}
