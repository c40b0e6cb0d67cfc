//! Stager contracts: memoization by identity, tuple staging, cached marking,
//! computed passthrough.

mod common;

use std::sync::Arc;

use dagflow::{
    cached_stage, value, AbstractChunk, Computation, Context, ContextOptions, Staged, ThunkInput,
};

use common::{constant, map_usize};

fn small_context() -> Context {
    Context::with_options(ContextOptions {
        workers: 2,
        profile: false,
    })
}

#[tokio::test]
async fn staging_the_same_computation_twice_yields_the_same_node() {
    let ctx = small_context();
    let c = Computation::apply(constant(1), vec![]);

    let first = cached_stage(&ctx, &c).expect("stage");
    let second = cached_stage(&ctx, &c).expect("stage");

    let (Some(a), Some(b)) = (first.thunk(), second.thunk()) else {
        panic!("expected staged thunks");
    };
    assert!(Arc::ptr_eq(a, b));
}

#[tokio::test]
async fn clones_share_identity_and_therefore_nodes() {
    let ctx = small_context();
    let c = Computation::apply(constant(2), vec![]);
    let cloned = c.clone();

    let first = cached_stage(&ctx, &c).expect("stage");
    let second = cached_stage(&ctx, &cloned).expect("stage");

    assert!(Arc::ptr_eq(
        first.thunk().expect("thunk"),
        second.thunk().expect("thunk")
    ));
}

#[tokio::test]
async fn separate_contexts_do_not_share_staged_nodes() {
    let ctx_a = small_context();
    let ctx_b = small_context();
    let c = Computation::apply(constant(3), vec![]);

    let in_a = cached_stage(&ctx_a, &c).expect("stage");
    let in_b = cached_stage(&ctx_b, &c).expect("stage");

    assert!(!Arc::ptr_eq(
        in_a.thunk().expect("thunk"),
        in_b.thunk().expect("thunk")
    ));
}

#[tokio::test]
async fn tuple_stages_a_shared_child_once() {
    let ctx = small_context();
    let shared = Computation::apply(constant(4), vec![]);
    let pair = Computation::tuple(vec![shared.clone(), shared]);

    let staged = cached_stage(&ctx, &pair).expect("stage");
    let thunk = staged.thunk().expect("tuple stages to a thunk");

    assert_eq!(thunk.inputs.len(), 2);
    let (ThunkInput::Thunk(left), ThunkInput::Thunk(right)) = (&thunk.inputs[0], &thunk.inputs[1])
    else {
        panic!("expected thunk inputs");
    };
    assert!(Arc::ptr_eq(left, right));
}

#[tokio::test]
async fn cached_marks_the_staged_node() {
    let ctx = small_context();
    let c = Computation::apply(constant(5), vec![]).cached();

    let staged = cached_stage(&ctx, &c).expect("stage");
    let thunk = staged.thunk().expect("thunk");

    assert!(thunk.is_cached());
    assert!(thunk.is_persisted());
}

#[tokio::test]
async fn computed_stages_to_its_chunk_directly() {
    let ctx = small_context();
    let chunk = ctx.put(value(9usize)).await.expect("put");
    let c = Computation::from_chunk(chunk);

    let staged = cached_stage(&ctx, &c).expect("stage");
    match staged {
        Staged::Chunk(AbstractChunk::Chunk(staged_chunk)) => assert_eq!(staged_chunk, chunk),
        other => panic!("expected the chunk back, got {other:?}"),
    }
}

#[tokio::test]
async fn apply_reuses_the_memoized_child_graph() {
    let ctx = small_context();
    let shared = Computation::apply(constant(6), vec![]);
    let left = Computation::apply(map_usize(|x| x + 1), vec![shared.clone()]);
    let right = Computation::apply(map_usize(|x| x * 2), vec![shared]);

    let left_staged = cached_stage(&ctx, &left).expect("stage");
    let right_staged = cached_stage(&ctx, &right).expect("stage");

    let leaf_of = |staged: &Staged| match &staged.thunk().expect("thunk").inputs[0] {
        ThunkInput::Thunk(t) => t.clone(),
        other => panic!("expected a thunk input, got {other:?}"),
    };
    assert!(Arc::ptr_eq(&leaf_of(&left_staged), &leaf_of(&right_staged)));
}
