// src/thunk.rs

//! Nodes of the executable DAG.
//!
//! A [`Thunk`] is a function plus an ordered list of inputs, each either
//! another thunk or an already-materialized value. Thunk ids are assigned
//! monotonically from a process-wide counter and double as the tie-break
//! ordering among otherwise equal dispatch candidates.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::chunk::{AbstractChunk, Chunk, WorkerId};

pub type ThunkId = u64;

/// The dynamically-typed datum moved between workers.
pub type Value = Arc<dyn Any + Send + Sync>;

/// A task function. Computation errors are the `Err` arm; they are captured
/// on the worker and surfaced to the master as failure completions.
pub type TaskFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

static NEXT_THUNK_ID: AtomicU64 = AtomicU64::new(1);

/// Wrap a plain value into a [`Value`].
pub fn value<T: Any + Send + Sync>(v: T) -> Value {
    Arc::new(v)
}

/// Wrap a closure into a [`TaskFn`].
pub fn task_fn<F>(f: F) -> TaskFn
where
    F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One input of a thunk.
#[derive(Clone)]
pub enum ThunkInput {
    /// A dependency edge: the input is the result of another thunk.
    Thunk(Arc<Thunk>),
    /// An already-materialized chunk handle.
    Chunk(AbstractChunk),
    /// A plain datum passed through unchanged.
    Data(Value),
}

impl ThunkInput {
    pub fn as_thunk(&self) -> Option<&Arc<Thunk>> {
        match self {
            ThunkInput::Thunk(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Debug for ThunkInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThunkInput::Thunk(t) => write!(f, "Thunk({})", t.id),
            ThunkInput::Chunk(c) => write!(f, "Chunk({c:?})"),
            ThunkInput::Data(_) => write!(f, "Data(..)"),
        }
    }
}

/// Construction-time flags for a thunk.
#[derive(Debug, Clone, Default)]
pub struct ThunkOptions {
    /// Retain the result and re-use it across compute invocations.
    pub cache: bool,
    /// Run on the master with inputs as-is (no data movement).
    pub meta: bool,
    /// Return the raw computed value instead of a chunk handle.
    pub get_result: bool,
    /// Pin the produced chunk so workers will not reclaim it on a plain free.
    pub persist: bool,
    /// Affinity override supplied by the staging layer. When `None`, dispatch
    /// derives affinity from the locations of the inputs.
    pub affinity: Option<Vec<(WorkerId, u64)>>,
}

/// A node in the executable DAG.
pub struct Thunk {
    pub id: ThunkId,
    pub f: TaskFn,
    pub inputs: Vec<ThunkInput>,
    pub meta: bool,
    pub get_result: bool,
    pub affinity_override: Option<Vec<(WorkerId, u64)>>,
    // `cache` and `persist` are settable after construction because staging a
    // `Cached` wrapper marks an already-shared, memoized node.
    cache: AtomicBool,
    persist: AtomicBool,
    cache_ref: Mutex<Option<Chunk>>,
}

impl Thunk {
    pub fn new(f: TaskFn, inputs: Vec<ThunkInput>) -> Arc<Self> {
        Self::with_options(f, inputs, ThunkOptions::default())
    }

    pub fn with_options(f: TaskFn, inputs: Vec<ThunkInput>, opts: ThunkOptions) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_THUNK_ID.fetch_add(1, Ordering::Relaxed),
            f,
            inputs,
            meta: opts.meta,
            get_result: opts.get_result,
            affinity_override: opts.affinity,
            cache: AtomicBool::new(opts.cache),
            persist: AtomicBool::new(opts.persist),
            cache_ref: Mutex::new(None),
        })
    }

    pub fn is_cached(&self) -> bool {
        self.cache.load(Ordering::Relaxed)
    }

    pub fn set_cached(&self, cache: bool) {
        self.cache.store(cache, Ordering::Relaxed);
    }

    pub fn is_persisted(&self) -> bool {
        self.persist.load(Ordering::Relaxed)
    }

    pub fn set_persisted(&self, persist: bool) {
        self.persist.store(persist, Ordering::Relaxed);
    }

    /// Handle to a previously computed, possibly still-live result. The
    /// scheduler verifies liveness with the owning worker before relying on
    /// it.
    pub fn cache_ref(&self) -> Option<Chunk> {
        *self.cache_ref.lock().expect("cache_ref lock poisoned")
    }

    pub fn set_cache_ref(&self, chunk: Option<Chunk>) {
        *self.cache_ref.lock().expect("cache_ref lock poisoned") = chunk;
    }

    /// The thunk-valued inputs, i.e. the dependency edges of this node.
    pub fn thunk_inputs(&self) -> impl Iterator<Item = &Arc<Thunk>> {
        self.inputs.iter().filter_map(ThunkInput::as_thunk)
    }
}

impl fmt::Debug for Thunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thunk")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("cache", &self.is_cached())
            .field("meta", &self.meta)
            .field("get_result", &self.get_result)
            .field("persist", &self.is_persisted())
            .finish()
    }
}
