//! Failure propagation: a raising task aborts the whole run and the error
//! surfaces on the master with its message intact.

mod common;

use anyhow::anyhow;
use dagflow::{compute, gather, task_fn, Computation, Context, ContextOptions, DagflowError};

use common::{constant, map_usize};

fn two_workers() -> Context {
    Context::with_options(ContextOptions {
        workers: 2,
        profile: false,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_raising_task_aborts_the_run() {
    let ctx = two_workers();
    let boom = Computation::apply(task_fn(|_| Err(anyhow!("boom"))), vec![]);

    let err = compute(&ctx, &boom).await.expect_err("must fail");
    assert!(err.to_string().contains("boom"), "got: {err}");
    assert!(matches!(err, DagflowError::TaskFailed { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_failure_downstream_of_healthy_tasks_still_surfaces() {
    let ctx = two_workers();

    let ok = Computation::apply(constant(1), vec![]);
    let boom = Computation::apply(
        task_fn(|_| Err(anyhow!("boom in the middle"))),
        vec![ok.clone()],
    );
    let root = Computation::apply(map_usize(|x| x), vec![boom]);

    let err = gather(&ctx, &root).await.expect_err("must fail");
    assert!(err.to_string().contains("boom in the middle"), "got: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_failing_tuple_component_fails_the_tuple() {
    let ctx = two_workers();

    let ok = Computation::apply(constant(2), vec![]);
    let bad = Computation::apply(task_fn(|_| Err(anyhow!("boom"))), vec![]);
    let pair = Computation::tuple(vec![ok, bad]);

    let err = gather(&ctx, &pair).await.expect_err("must fail");
    assert!(err.to_string().contains("boom"), "got: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_panicking_task_is_captured_not_propagated() {
    let ctx = two_workers();
    let kapow = Computation::apply(task_fn(|_| panic!("kapow")), vec![]);

    let err = compute(&ctx, &kapow).await.expect_err("must fail");
    assert!(err.to_string().contains("kapow"), "got: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn the_context_survives_a_failed_run() {
    let ctx = two_workers();

    let bad = Computation::apply(task_fn(|_| Err(anyhow!("boom"))), vec![]);
    assert!(compute(&ctx, &bad).await.is_err());

    // the pool is still usable for the next run
    let ok = Computation::apply(constant(11), vec![]);
    let v = gather(&ctx, &ok).await.expect("gather after failure");
    assert_eq!(common::as_usize(&v), 11);
}
