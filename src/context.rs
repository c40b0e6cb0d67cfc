// src/context.rs

//! The ambient configuration a compute runs under: the worker pool, the
//! per-context stager cache, the reaper, and profile flags.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::chunk::{Chunk, WorkerId};
use crate::errors::{DagflowError, Result};
use crate::exec::{spawn_worker_pool, StoreStats, WorkerHandle};
use crate::memory::{spawn_reaper, ReaperHandle};
use crate::stage::{CompId, Staged};
use crate::thunk::Value;

/// Options that influence how a context behaves.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Number of workers to spawn.
    pub workers: usize,
    /// Log per-task comm/compute timings at info level.
    pub profile: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            profile: false,
        }
    }
}

impl ContextOptions {
    /// Read options from `DAGFLOW_WORKERS` / `DAGFLOW_PROFILE`, falling back
    /// to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let workers = std::env::var("DAGFLOW_WORKERS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.workers);
        let profile = std::env::var("DAGFLOW_PROFILE")
            .map(|s| matches!(s.trim(), "1" | "true" | "yes"))
            .unwrap_or(defaults.profile);
        Self { workers, profile }
    }
}

/// Ambient configuration for compute runs. Cheap to clone.
///
/// The stager cache is owned here, so dropping the last clone releases every
/// staged node; the workers and the reaper wind down with it. Must be
/// created inside a Tokio runtime, since worker loops are spawned on
/// construction.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    workers: Vec<WorkerHandle>,
    staged: Mutex<HashMap<CompId, Staged>>,
    reaper: ReaperHandle,
    profile: bool,
    round_robin: AtomicUsize,
}

impl Context {
    pub fn new() -> Self {
        Self::with_options(ContextOptions::default())
    }

    pub fn with_options(options: ContextOptions) -> Self {
        let workers = spawn_worker_pool(options.workers.max(1));
        let reaper = spawn_reaper(workers.clone());
        debug!(
            workers = workers.len(),
            profile = options.profile,
            "context created"
        );
        Self {
            inner: Arc::new(ContextInner {
                workers,
                staged: Mutex::new(HashMap::new()),
                reaper,
                profile: options.profile,
                round_robin: AtomicUsize::new(0),
            }),
        }
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.inner.workers
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.inner.workers.iter().find(|w| w.id == id)
    }

    pub fn profile(&self) -> bool {
        self.inner.profile
    }

    pub fn reaper(&self) -> &ReaperHandle {
        &self.inner.reaper
    }

    pub(crate) fn lookup_staged(&self, id: CompId) -> Option<Staged> {
        self.inner
            .staged
            .lock()
            .expect("stager cache lock poisoned")
            .get(&id)
            .cloned()
    }

    pub(crate) fn store_staged(&self, id: CompId, staged: Staged) {
        self.inner
            .staged
            .lock()
            .expect("stager cache lock poisoned")
            .insert(id, staged);
    }

    /// Move a master-side value into the cluster, round-robining across
    /// workers.
    pub async fn put(&self, value: Value) -> Result<Chunk> {
        let workers = &self.inner.workers;
        let index = self.inner.round_robin.fetch_add(1, Ordering::Relaxed) % workers.len();
        workers[index].put(value, false).await
    }

    /// Move a master-side value onto a specific worker.
    pub async fn put_on(&self, worker: WorkerId, value: Value) -> Result<Chunk> {
        self.worker(worker)
            .ok_or_else(|| DagflowError::Invariant(format!("unknown worker {worker}")))?
            .put(value, false)
            .await
    }

    /// Chunk-store counters for every worker, in id order.
    pub async fn store_stats(&self) -> Result<Vec<StoreStats>> {
        let mut stats = Vec::with_capacity(self.inner.workers.len());
        for worker in &self.inner.workers {
            stats.push(worker.stats().await?);
        }
        Ok(stats)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("workers", &self.inner.workers.len())
            .field("profile", &self.inner.profile)
            .finish()
    }
}
