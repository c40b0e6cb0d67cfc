// src/lib.rs

//! dagflow: a dynamic dataflow DAG execution engine.
//!
//! A computation is described as an opaque [`Computation`]; `compute` stages
//! it into a memoized [`Thunk`] DAG, walks the DAG with an affinity-aware
//! ready-queue scheduler over a pool of workers, short-circuits on persisted
//! cached results, and frees intermediate data as soon as its last consumer
//! has fired.

pub mod chunk;
pub mod context;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod memory;
pub mod stage;
pub mod thunk;

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tracing::info;

pub use chunk::{AbstractChunk, Cat, CatCell, Chunk, ChunkId, Domain, View, WorkerId};
pub use context::{Context, ContextOptions};
pub use errors::{DagflowError, Result};
pub use memory::Computed;
pub use stage::{cached_stage, stage, thunkize, CompId, Computation, LeafCompute, Staged};
pub use thunk::{task_fn, value, TaskFn, Thunk, ThunkId, ThunkInput, ThunkOptions, Value};

use crate::dag::Stored;

/// Stage, run, and wrap the result of a computation.
pub async fn compute(ctx: &Context, c: &Computation) -> Result<Computed> {
    let staged = thunkize(cached_stage(ctx, c)?)?;
    match staged {
        // nothing to run; the handle's lifetime is owned elsewhere
        Staged::Chunk(chunk) => Ok(Computed::detached(chunk)),
        Staged::Thunk(root) => {
            let cached_root = root.is_cached();
            let stored = engine::compute_dag(ctx, root).await?;
            computed_from_stored(ctx, stored, cached_root).await
        }
    }
}

async fn computed_from_stored(ctx: &Context, stored: Stored, detach: bool) -> Result<Computed> {
    let chunk = match stored {
        Stored::Chunk(chunk) => chunk,
        Stored::Raw(v) => match v.downcast_ref::<AbstractChunk>() {
            Some(chunk) => chunk.clone(),
            // a raw master-side result is lifted into the cluster
            None => AbstractChunk::Chunk(ctx.put(v).await?),
        },
    };
    if detach {
        // the cache registry owns the lifetime of a cached root's result
        Ok(Computed::detached(chunk))
    } else {
        Ok(Computed::new(chunk, ctx.reaper().clone()))
    }
}

/// Compute, then materialize the result into the caller's address space.
pub async fn gather(ctx: &Context, c: &Computation) -> Result<Value> {
    let computed = compute(ctx, c).await?;
    gather_computed(ctx, &computed).await
}

/// Materialize an already-computed result.
pub async fn gather_computed(ctx: &Context, computed: &Computed) -> Result<Value> {
    exec::gather_handle(ctx.workers(), computed.chunk()).await
}

/// The process-wide default context, created on first use from the
/// environment. Must first be touched inside a Tokio runtime.
pub fn default_context() -> &'static Context {
    static DEFAULT: OnceLock<Context> = OnceLock::new();
    DEFAULT.get_or_init(|| Context::with_options(ContextOptions::from_env()))
}

/// [`compute`] against the default context.
pub async fn compute_default(c: &Computation) -> Result<Computed> {
    compute(default_context(), c).await
}

/// [`gather`] against the default context.
pub async fn gather_default(c: &Computation) -> Result<Value> {
    gather(default_context(), c).await
}

/// Timings extracted from a [`debug_compute`] run.
#[derive(Debug, Clone, Copy)]
pub struct ComputeStats {
    pub elapsed: Duration,
}

/// Compute with wall-clock timing. Per-task comm/compute timings are logged
/// when the context was created with `profile` set.
pub async fn debug_compute(ctx: &Context, c: &Computation) -> Result<(Computed, ComputeStats)> {
    let started = Instant::now();
    let computed = compute(ctx, c).await?;
    let elapsed = started.elapsed();
    info!(elapsed_ms = elapsed.as_millis() as u64, "compute finished");
    Ok((computed, ComputeStats { elapsed }))
}

/// Explicit release of a computed result's storage.
pub fn free_computed(ctx: &Context, computed: &Computed, force: bool, cache: bool) {
    ctx.reaper().free(computed.chunk().clone(), force, cache);
}
