// src/exec/task.rs

//! Remote task invocation: input movement, execution, result packaging.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, info, Instrument};

use crate::chunk::{AbstractChunk, CatCell, Chunk, WorkerId};
use crate::engine::{CapturedError, Completion, Failure, TaskOutput};
use crate::errors::{DagflowError, Result};
use crate::thunk::{TaskFn, ThunkId, Value};

use super::worker::{ChunkStore, WorkerHandle, WorkerRequest};

/// Run one task on this worker: move every input here, invoke the function,
/// package the result. Failures (including panics) are captured, never
/// propagated as panics.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn do_task(
    worker: WorkerId,
    store: &Arc<Mutex<ChunkStore>>,
    peers: &HashMap<WorkerId, WorkerHandle>,
    thunk: ThunkId,
    f: TaskFn,
    data: Vec<Value>,
    send_result: bool,
    persist: bool,
    profile: bool,
) -> std::result::Result<TaskOutput, CapturedError> {
    let comm_started = Instant::now();
    let moved = async {
        let mut moved = Vec::with_capacity(data.len());
        for datum in data {
            moved.push(move_datum(worker, store, peers, datum).await?);
        }
        Ok::<_, anyhow::Error>(moved)
    }
    .instrument(debug_span!("comm", worker, thunk))
    .await;
    let moved = match moved {
        Ok(moved) => moved,
        Err(err) => {
            debug!(worker, thunk, error = %err, "input movement failed");
            return Err(CapturedError::from_anyhow(&err));
        }
    };
    let comm_elapsed = comm_started.elapsed();

    let compute_started = Instant::now();
    let outcome = {
        let _span = debug_span!("compute", worker, thunk).entered();
        catch_unwind(AssertUnwindSafe(|| f(&moved)))
    };
    let compute_elapsed = compute_started.elapsed();

    if profile {
        info!(
            worker,
            thunk,
            comm_ms = comm_elapsed.as_millis() as u64,
            compute_ms = compute_elapsed.as_millis() as u64,
            "task timing"
        );
    }

    let value = match outcome {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            debug!(worker, thunk, error = %err, "task function failed");
            return Err(CapturedError::from_anyhow(&err));
        }
        Err(panic) => return Err(CapturedError::from_panic(panic.as_ref())),
    };

    if send_result {
        Ok(TaskOutput::Value(value))
    } else {
        let id = store
            .lock()
            .expect("store lock poisoned")
            .put(value, persist);
        Ok(TaskOutput::Chunk(Chunk { id, worker }))
    }
}

/// Identity for plain data; chunk handles are gathered to this worker.
async fn move_datum(
    worker: WorkerId,
    store: &Arc<Mutex<ChunkStore>>,
    peers: &HashMap<WorkerId, WorkerHandle>,
    datum: Value,
) -> anyhow::Result<Value> {
    let Some(handle) = datum.downcast_ref::<AbstractChunk>() else {
        return Ok(datum);
    };
    fetch_handle(worker, store, peers, handle).await
}

async fn fetch_handle(
    worker: WorkerId,
    store: &Arc<Mutex<ChunkStore>>,
    peers: &HashMap<WorkerId, WorkerHandle>,
    handle: &AbstractChunk,
) -> anyhow::Result<Value> {
    match handle {
        AbstractChunk::Chunk(c) => fetch_chunk(worker, store, peers, c).await,
        AbstractChunk::View(v) => fetch_chunk(worker, store, peers, &v.parent).await,
        AbstractChunk::Cat(cat) => {
            let mut cells = Vec::with_capacity(cat.cells.len());
            for cell in &cat.cells {
                match cell {
                    CatCell::Chunk(c) => cells.push(fetch_chunk(worker, store, peers, c).await?),
                    CatCell::View(v) => {
                        cells.push(fetch_chunk(worker, store, peers, &v.parent).await?)
                    }
                    CatCell::Thunk(t) => {
                        return Err(anyhow!(
                            "deferred cell (thunk {}) reached worker {worker}",
                            t.id
                        ))
                    }
                }
            }
            Ok(Arc::new(cells) as Value)
        }
    }
}

async fn fetch_chunk(
    worker: WorkerId,
    store: &Arc<Mutex<ChunkStore>>,
    peers: &HashMap<WorkerId, WorkerHandle>,
    chunk: &Chunk,
) -> anyhow::Result<Value> {
    if chunk.worker == worker {
        return store
            .lock()
            .expect("store lock poisoned")
            .get(chunk.id)
            .ok_or_else(|| anyhow!("chunk {} missing from local store on worker {worker}", chunk.id));
    }
    let peer = peers
        .get(&chunk.worker)
        .ok_or_else(|| anyhow!("no worker {} in this pool", chunk.worker))?;
    match peer.gather(chunk.id).await {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(anyhow!(
            "chunk {} not found on worker {}",
            chunk.id,
            chunk.worker
        )),
        Err(err) => Err(anyhow!(
            "gathering chunk {} from worker {}: {err}",
            chunk.id,
            chunk.worker
        )),
    }
}

/// Master-side launcher: spawn a background task that performs the remote
/// call and forwards the reply to the completion channel. Transport errors
/// are forwarded as failures too; replies arriving after the scheduler is
/// gone are dropped.
#[allow(clippy::too_many_arguments)]
pub fn async_apply(
    worker: WorkerHandle,
    thunk: ThunkId,
    f: TaskFn,
    data: Vec<Value>,
    send_result: bool,
    persist: bool,
    profile: bool,
    completion_tx: mpsc::Sender<Completion>,
) {
    tokio::spawn(async move {
        let result = remote_call(&worker, thunk, f, data, send_result, persist, profile).await;
        let worker_id = worker.id;
        if completion_tx
            .send(Completion {
                worker: worker_id,
                thunk,
                result,
            })
            .await
            .is_err()
        {
            debug!(worker = worker_id, thunk, "scheduler gone; dropping completion");
        }
    });
}

async fn remote_call(
    worker: &WorkerHandle,
    thunk: ThunkId,
    f: TaskFn,
    data: Vec<Value>,
    send_result: bool,
    persist: bool,
    profile: bool,
) -> std::result::Result<TaskOutput, Failure> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let request = WorkerRequest::DoTask {
        thunk,
        f,
        data,
        send_result,
        persist,
        profile,
        reply: reply_tx,
    };
    if worker.send(request).await.is_err() {
        return Err(Failure::Transport("worker channel closed".into()));
    }
    match reply_rx.await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(captured)) => Err(Failure::Task(captured)),
        Err(_) => Err(Failure::Transport("worker dropped the reply".into())),
    }
}

/// Materialize a handle into the caller's address space: chunks and views
/// fetch the owning worker's datum, aggregates gather per cell into a
/// `Vec<Value>`.
pub async fn gather_handle(workers: &[WorkerHandle], handle: &AbstractChunk) -> Result<Value> {
    match handle {
        AbstractChunk::Chunk(c) => gather_remote(workers, c).await,
        AbstractChunk::View(v) => gather_remote(workers, &v.parent).await,
        AbstractChunk::Cat(cat) => {
            let mut cells = Vec::with_capacity(cat.cells.len());
            for cell in &cat.cells {
                match cell {
                    CatCell::Chunk(c) => cells.push(gather_remote(workers, c).await?),
                    CatCell::View(v) => cells.push(gather_remote(workers, &v.parent).await?),
                    CatCell::Thunk(t) => {
                        return Err(DagflowError::Invariant(format!(
                            "gather of a deferred aggregate (thunk {})",
                            t.id
                        )))
                    }
                }
            }
            Ok(Arc::new(cells) as Value)
        }
    }
}

async fn gather_remote(workers: &[WorkerHandle], chunk: &Chunk) -> Result<Value> {
    let worker = workers
        .iter()
        .find(|w| w.id == chunk.worker)
        .ok_or_else(|| DagflowError::Invariant(format!("unknown worker {}", chunk.worker)))?;
    worker.gather(chunk.id).await?.ok_or_else(|| {
        DagflowError::Invariant(format!(
            "chunk {} no longer live on worker {}",
            chunk.id, chunk.worker
        ))
    })
}
