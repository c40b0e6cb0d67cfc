// src/stage.rs

//! Staging: turning deferred computation descriptions into thunk graphs.
//!
//! Computations carry a stable identity that survives cloning; the stager
//! memoizes on it per context, so equal sub-expressions share nodes and a
//! shared leaf is computed once.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use tracing::debug;

use crate::chunk::{AbstractChunk, Cat, CatCell, WorkerId};
use crate::context::Context;
use crate::errors::Result;
use crate::memory::Computed;
use crate::thunk::{task_fn, TaskFn, Thunk, ThunkInput, ThunkOptions, Value};

pub type CompId = u64;

static NEXT_COMP_ID: AtomicU64 = AtomicU64::new(1);

/// Extension point for new computation variants.
///
/// The contract is referential transparency: equal computations must stage
/// to identical thunk graphs within a context. `cached_stage` enforces this
/// per computation identity; implementations staging sub-computations should
/// go through it as well.
pub trait LeafCompute: Send + Sync + 'static {
    fn stage(&self, ctx: &Context) -> Result<Staged>;

    /// Optional placement hint for the staged work.
    fn affinity(&self, _ctx: &Context) -> Vec<(WorkerId, u64)> {
        Vec::new()
    }
}

/// Result of staging: an executable node, or an already-materialized handle.
#[derive(Debug, Clone)]
pub enum Staged {
    Thunk(Arc<Thunk>),
    Chunk(AbstractChunk),
}

impl Staged {
    pub fn as_input(&self) -> ThunkInput {
        match self {
            Staged::Thunk(t) => ThunkInput::Thunk(t.clone()),
            Staged::Chunk(c) => ThunkInput::Chunk(c.clone()),
        }
    }

    pub fn thunk(&self) -> Option<&Arc<Thunk>> {
        match self {
            Staged::Thunk(t) => Some(t),
            Staged::Chunk(_) => None,
        }
    }
}

enum CompKind {
    Leaf(Arc<dyn LeafCompute>),
    Tuple(Vec<Computation>),
    Cached(Computation),
    Computed {
        chunk: AbstractChunk,
        // keeps the wrapped result's finalizer from firing while this
        // computation can still be staged
        _keep: Option<Computed>,
    },
}

/// An opaque description of a deferred result. Clones share identity, which
/// is what the stager memoizes on.
#[derive(Clone)]
pub struct Computation {
    id: CompId,
    kind: Arc<CompKind>,
}

impl Computation {
    fn from_kind(kind: CompKind) -> Self {
        Self {
            id: NEXT_COMP_ID.fetch_add(1, Ordering::Relaxed),
            kind: Arc::new(kind),
        }
    }

    pub fn id(&self) -> CompId {
        self.id
    }

    /// A user-defined leaf; it knows how to stage itself.
    pub fn leaf(leaf: impl LeafCompute) -> Self {
        Self::from_kind(CompKind::Leaf(Arc::new(leaf)))
    }

    /// An ordered sequence whose result is the tuple of its parts' results.
    pub fn tuple(parts: Vec<Computation>) -> Self {
        Self::from_kind(CompKind::Tuple(parts))
    }

    /// Mark this computation's result to be retained and re-used across
    /// compute invocations.
    pub fn cached(self) -> Self {
        Self::from_kind(CompKind::Cached(self))
    }

    /// An already-materialized result participating as a leaf.
    pub fn computed(result: Computed) -> Self {
        Self::from_kind(CompKind::Computed {
            chunk: result.chunk().clone(),
            _keep: Some(result),
        })
    }

    /// A bare chunk handle participating as a leaf; the data's lifetime is
    /// owned elsewhere.
    pub fn from_chunk(chunk: impl Into<AbstractChunk>) -> Self {
        Self::from_kind(CompKind::Computed {
            chunk: chunk.into(),
            _keep: None,
        })
    }

    /// Lift a plain value into a single-thunk computation.
    pub fn lift<T: Send + Sync + 'static>(v: T) -> Self {
        Self::leaf(LiftCompute {
            value: Arc::new(v) as Value,
        })
    }

    /// Apply a function to the results of `inputs`.
    pub fn apply(f: TaskFn, inputs: Vec<Computation>) -> Self {
        Self::apply_with(f, inputs, ThunkOptions::default())
    }

    /// [`Computation::apply`] with explicit thunk options (meta execution,
    /// raw results, pinning, affinity hints).
    pub fn apply_with(f: TaskFn, inputs: Vec<Computation>, options: ThunkOptions) -> Self {
        Self::leaf(ApplyCompute { f, inputs, options })
    }
}

impl fmt::Debug for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind.as_ref() {
            CompKind::Leaf(_) => "Leaf",
            CompKind::Tuple(_) => "Tuple",
            CompKind::Cached(_) => "Cached",
            CompKind::Computed { .. } => "Computed",
        };
        write!(f, "Computation({kind}, id={})", self.id)
    }
}

struct LiftCompute {
    value: Value,
}

impl LeafCompute for LiftCompute {
    fn stage(&self, _ctx: &Context) -> Result<Staged> {
        let value = self.value.clone();
        Ok(Staged::Thunk(Thunk::new(
            task_fn(move |_| Ok(value.clone())),
            Vec::new(),
        )))
    }
}

struct ApplyCompute {
    f: TaskFn,
    inputs: Vec<Computation>,
    options: ThunkOptions,
}

impl LeafCompute for ApplyCompute {
    fn stage(&self, ctx: &Context) -> Result<Staged> {
        let mut staged = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            staged.push(thunkize(cached_stage(ctx, input)?)?.as_input());
        }
        Ok(Staged::Thunk(Thunk::with_options(
            self.f.clone(),
            staged,
            self.options.clone(),
        )))
    }
}

/// Stage a computation into a thunk graph (or an already-resolved handle).
pub fn stage(ctx: &Context, c: &Computation) -> Result<Staged> {
    match c.kind.as_ref() {
        CompKind::Leaf(leaf) => {
            let staged = leaf.stage(ctx)?;
            let hints = leaf.affinity(ctx);
            if hints.is_empty() {
                return Ok(staged);
            }
            if let Staged::Thunk(t) = &staged {
                if t.affinity_override.is_none() {
                    let options = ThunkOptions {
                        cache: t.is_cached(),
                        meta: t.meta,
                        get_result: t.get_result,
                        persist: t.is_persisted(),
                        affinity: Some(hints),
                    };
                    return Ok(Staged::Thunk(Thunk::with_options(
                        t.f.clone(),
                        t.inputs.clone(),
                        options,
                    )));
                }
            }
            Ok(staged)
        }
        CompKind::Tuple(parts) => {
            let mut staged = Vec::with_capacity(parts.len());
            for part in parts {
                staged.push(thunkize(cached_stage(ctx, part)?)?.as_input());
            }
            let f = task_fn(|values: &[Value]| Ok(Arc::new(values.to_vec()) as Value));
            Ok(Staged::Thunk(Thunk::new(f, staged)))
        }
        CompKind::Cached(inner) => {
            let staged = cached_stage(ctx, inner)?;
            match &staged {
                Staged::Thunk(t) => {
                    t.set_cached(true);
                    t.set_persisted(true);
                }
                Staged::Chunk(c) => ctx.reaper().persist(c.clone()),
            }
            Ok(staged)
        }
        CompKind::Computed { chunk, .. } => Ok(Staged::Chunk(chunk.clone())),
    }
}

/// Memoized staging, keyed on computation identity per context.
pub fn cached_stage(ctx: &Context, c: &Computation) -> Result<Staged> {
    if let Some(staged) = ctx.lookup_staged(c.id()) {
        return Ok(staged);
    }
    let staged = stage(ctx, c)?;
    debug!(computation = c.id(), ?staged, "staged computation");
    ctx.store_staged(c.id(), staged.clone());
    Ok(staged)
}

/// Realize a staged handle: plain chunks and thunks pass through; a deferred
/// aggregate fuses into a single master-side thunk that rebuilds the
/// resolved grid.
pub fn thunkize(staged: Staged) -> Result<Staged> {
    match staged {
        Staged::Chunk(AbstractChunk::Cat(cat)) if cat.is_deferred() => fuse_cat(cat),
        other => Ok(other),
    }
}

fn fuse_cat(cat: Cat) -> Result<Staged> {
    let inputs: Vec<ThunkInput> = cat
        .cells
        .iter()
        .map(|cell| match cell {
            CatCell::Thunk(t) => ThunkInput::Thunk(t.clone()),
            CatCell::Chunk(c) => ThunkInput::Chunk(AbstractChunk::Chunk(*c)),
            CatCell::View(v) => ThunkInput::Chunk(AbstractChunk::View(v.clone())),
        })
        .collect();

    let Cat {
        chunk_type,
        domain,
        grid,
        chunk_sizes,
        ..
    } = cat;

    let f = task_fn(move |values: &[Value]| {
        let mut cells = Vec::with_capacity(values.len());
        for value in values {
            match value.downcast_ref::<AbstractChunk>() {
                Some(AbstractChunk::Chunk(c)) => cells.push(CatCell::Chunk(*c)),
                Some(AbstractChunk::View(view)) => cells.push(CatCell::View(view.clone())),
                Some(AbstractChunk::Cat(_)) => {
                    return Err(anyhow!("nested aggregate in a grid cell"))
                }
                None => {
                    return Err(anyhow!(
                        "grid cell resolved to a raw value, expected a chunk handle"
                    ))
                }
            }
        }
        let resolved = Cat {
            chunk_type: chunk_type.clone(),
            domain: domain.clone(),
            grid: grid.clone(),
            chunk_sizes: chunk_sizes.clone(),
            cells,
        };
        Ok(Arc::new(AbstractChunk::Cat(resolved)) as Value)
    });

    Ok(Staged::Thunk(Thunk::with_options(
        f,
        inputs,
        ThunkOptions {
            meta: true,
            ..ThunkOptions::default()
        },
    )))
}
