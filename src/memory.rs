// src/memory.rs

//! Lifetime management: pinning, freeing, and the reaper task.
//!
//! All fire-and-forget lifetime traffic funnels through one background task
//! per context. Finalizers only enqueue (destruction can happen where
//! blocking or suspension is unsafe) and the single queue keeps frees and
//! persists ordered relative to each other.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::chunk::{AbstractChunk, CatCell, Chunk};
use crate::exec::WorkerHandle;

#[derive(Debug)]
pub enum ReapRequest {
    Free {
        chunk: AbstractChunk,
        force: bool,
        cache: bool,
    },
    Persist {
        chunk: AbstractChunk,
    },
}

/// Non-blocking entry point to the reaper queue.
#[derive(Debug, Clone)]
pub struct ReaperHandle {
    tx: mpsc::UnboundedSender<ReapRequest>,
}

impl ReaperHandle {
    /// Schedule a release of worker-side storage. With `cache` the datum
    /// moves to the keep-alive registry instead, so a future run can
    /// unrelease it; pinned chunks ignore the request unless `force`.
    pub fn free(&self, chunk: AbstractChunk, force: bool, cache: bool) {
        if self
            .tx
            .send(ReapRequest::Free {
                chunk,
                force,
                cache,
            })
            .is_err()
        {
            warn!("reaper gone; dropping free request");
        }
    }

    /// Schedule pinning, so plain frees become no-ops.
    pub fn persist(&self, chunk: AbstractChunk) {
        if self.tx.send(ReapRequest::Persist { chunk }).is_err() {
            warn!("reaper gone; dropping persist request");
        }
    }
}

/// Spawn the per-context reaper loop.
pub fn spawn_reaper(workers: Vec<WorkerHandle>) -> ReaperHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<ReapRequest>();

    tokio::spawn(async move {
        debug!("reaper loop started");
        while let Some(request) = rx.recv().await {
            match request {
                ReapRequest::Free {
                    chunk,
                    force,
                    cache,
                } => free_handle(&workers, &chunk, force, cache).await,
                ReapRequest::Persist { chunk } => persist_handle(&workers, &chunk).await,
            }
        }
        debug!("reaper loop finished (context dropped)");
    });

    ReaperHandle { tx }
}

async fn free_one(workers: &[WorkerHandle], chunk: &Chunk, force: bool, cache: bool) {
    match workers.iter().find(|w| w.id == chunk.worker) {
        Some(worker) => {
            if let Err(err) = worker.free(chunk.id, force, cache).await {
                warn!(chunk = chunk.id, error = %err, "free failed");
            }
        }
        None => warn!(chunk = chunk.id, worker = chunk.worker, "free for unknown worker"),
    }
}

async fn free_handle(workers: &[WorkerHandle], handle: &AbstractChunk, force: bool, cache: bool) {
    match handle {
        AbstractChunk::Chunk(c) => free_one(workers, c, force, cache).await,
        // a view does not own data
        AbstractChunk::View(_) => trace!("free of a view is a no-op"),
        AbstractChunk::Cat(cat) => {
            for cell in &cat.cells {
                if let CatCell::Chunk(c) = cell {
                    free_one(workers, c, force, cache).await;
                }
            }
        }
    }
}

async fn persist_one(workers: &[WorkerHandle], chunk: &Chunk) {
    match workers.iter().find(|w| w.id == chunk.worker) {
        Some(worker) => {
            if let Err(err) = worker.persist(chunk.id).await {
                warn!(chunk = chunk.id, error = %err, "persist failed");
            }
        }
        None => warn!(chunk = chunk.id, worker = chunk.worker, "persist for unknown worker"),
    }
}

async fn persist_handle(workers: &[WorkerHandle], handle: &AbstractChunk) {
    match handle {
        AbstractChunk::Chunk(c) => persist_one(workers, c).await,
        AbstractChunk::View(v) => persist_one(workers, &v.parent).await,
        AbstractChunk::Cat(cat) => {
            for cell in &cat.cells {
                match cell {
                    CatCell::Chunk(c) => persist_one(workers, c).await,
                    CatCell::View(v) => persist_one(workers, &v.parent).await,
                    CatCell::Thunk(_) => {}
                }
            }
        }
    }
}

/// A computed result: the chunk handle plus, usually, a finalizer that
/// schedules a forced free once the last clone is dropped.
#[derive(Debug, Clone)]
pub struct Computed {
    chunk: AbstractChunk,
    _guard: Option<Arc<FreeGuard>>,
}

#[derive(Debug)]
struct FreeGuard {
    chunk: AbstractChunk,
    reaper: ReaperHandle,
}

impl Drop for FreeGuard {
    fn drop(&mut self) {
        // only enqueue; this can run on a thread where blocking is unsafe
        self.reaper.free(self.chunk.clone(), true, false);
    }
}

impl Computed {
    pub fn new(chunk: AbstractChunk, reaper: ReaperHandle) -> Self {
        let guard = FreeGuard {
            chunk: chunk.clone(),
            reaper,
        };
        Self {
            chunk,
            _guard: Some(Arc::new(guard)),
        }
    }

    /// A handle without a finalizer; someone else owns the data's lifetime
    /// (already-materialized inputs, results of cached roots).
    pub fn detached(chunk: AbstractChunk) -> Self {
        Self {
            chunk,
            _guard: None,
        }
    }

    pub fn chunk(&self) -> &AbstractChunk {
        &self.chunk
    }
}
