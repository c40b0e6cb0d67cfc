// src/exec/worker.rs

//! In-process workers and their chunk stores.
//!
//! A worker is a background loop consuming [`WorkerRequest`]s from an mpsc
//! channel and answering on oneshot replies. That channel pair is the whole
//! transport surface, so swapping in a real RPC layer stays confined to this
//! module. Task execution is spawned off the loop so gathers from peers stay
//! serviceable while a task runs; one concurrent task per worker is enforced
//! by the scheduler, not here.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::chunk::{Chunk, ChunkId, WorkerId};
use crate::engine::{CapturedError, TaskOutput};
use crate::errors::{DagflowError, Result};
use crate::thunk::{TaskFn, ThunkId, Value};

use super::task::do_task;

static NEXT_CHUNK_ID: AtomicU64 = AtomicU64::new(1);

/// Requests understood by a worker.
pub enum WorkerRequest {
    /// Run a task: move the inputs here, invoke the function, package the
    /// result (pinned when `persist`).
    DoTask {
        thunk: ThunkId,
        f: TaskFn,
        data: Vec<Value>,
        send_result: bool,
        persist: bool,
        profile: bool,
        reply: oneshot::Sender<std::result::Result<TaskOutput, CapturedError>>,
    },
    /// Fetch a chunk's datum.
    Gather {
        chunk: ChunkId,
        reply: oneshot::Sender<Option<Value>>,
    },
    /// Store a datum and hand back its handle.
    Put {
        value: Value,
        pin: bool,
        reply: oneshot::Sender<Chunk>,
    },
    /// Release storage. Pinned chunks ignore plain frees; `cache` moves the
    /// datum to the keep-alive registry instead of dropping it.
    Free {
        chunk: ChunkId,
        force: bool,
        cache: bool,
    },
    /// Pin a chunk so plain frees become no-ops.
    Persist { chunk: ChunkId },
    /// Restore a keep-alive datum to the live store; replies whether the
    /// datum was still held.
    Unrelease {
        chunk: ChunkId,
        reply: oneshot::Sender<bool>,
    },
    /// Store counters, for observability and tests.
    Stats { reply: oneshot::Sender<StoreStats> },
}

impl fmt::Debug for WorkerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRequest::DoTask { thunk, .. } => write!(f, "DoTask(thunk={thunk})"),
            WorkerRequest::Gather { chunk, .. } => write!(f, "Gather(chunk={chunk})"),
            WorkerRequest::Put { pin, .. } => write!(f, "Put(pin={pin})"),
            WorkerRequest::Free {
                chunk,
                force,
                cache,
            } => write!(f, "Free(chunk={chunk}, force={force}, cache={cache})"),
            WorkerRequest::Persist { chunk } => write!(f, "Persist(chunk={chunk})"),
            WorkerRequest::Unrelease { chunk, .. } => write!(f, "Unrelease(chunk={chunk})"),
            WorkerRequest::Stats { .. } => write!(f, "Stats"),
        }
    }
}

/// Counters over one worker's chunk store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub live: usize,
    pub retired: usize,
    pub pinned: usize,
}

struct StoredChunk {
    value: Value,
    pinned: bool,
}

/// Worker-side storage: live data plus the keep-alive registry backing the
/// cache-hit short-circuit.
#[derive(Default)]
pub(crate) struct ChunkStore {
    live: HashMap<ChunkId, StoredChunk>,
    retired: HashMap<ChunkId, Value>,
}

impl ChunkStore {
    pub(crate) fn put(&mut self, value: Value, pinned: bool) -> ChunkId {
        let id = NEXT_CHUNK_ID.fetch_add(1, Ordering::Relaxed);
        self.live.insert(id, StoredChunk { value, pinned });
        id
    }

    pub(crate) fn get(&self, id: ChunkId) -> Option<Value> {
        self.live
            .get(&id)
            .map(|s| s.value.clone())
            .or_else(|| self.retired.get(&id).cloned())
    }

    pub(crate) fn free(&mut self, id: ChunkId, force: bool, cache: bool) {
        match self.live.remove(&id) {
            Some(entry) if entry.pinned && !force => {
                self.live.insert(id, entry);
            }
            Some(entry) if cache => {
                self.retired.insert(id, entry.value);
            }
            Some(_) => {}
            None => {
                if force {
                    self.retired.remove(&id);
                }
            }
        }
    }

    pub(crate) fn persist(&mut self, id: ChunkId) {
        if let Some(entry) = self.live.get_mut(&id) {
            entry.pinned = true;
        }
    }

    pub(crate) fn unrelease(&mut self, id: ChunkId) -> bool {
        if self.live.contains_key(&id) {
            return true;
        }
        match self.retired.remove(&id) {
            Some(value) => {
                self.live.insert(
                    id,
                    StoredChunk {
                        value,
                        pinned: false,
                    },
                );
                true
            }
            None => false,
        }
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            live: self.live.len(),
            retired: self.retired.len(),
            pinned: self.live.values().filter(|s| s.pinned).count(),
        }
    }
}

/// Handle to a spawned worker: its id plus the request channel.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    tx: mpsc::Sender<WorkerRequest>,
}

impl WorkerHandle {
    fn transport_err(&self, message: &str) -> DagflowError {
        DagflowError::Transport {
            worker: self.id,
            message: message.into(),
        }
    }

    pub(crate) async fn send(&self, request: WorkerRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| self.transport_err("worker channel closed"))
    }

    pub async fn gather(&self, chunk: ChunkId) -> Result<Option<Value>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(WorkerRequest::Gather {
            chunk,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| self.transport_err("worker dropped the gather reply"))
    }

    pub async fn put(&self, value: Value, pin: bool) -> Result<Chunk> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(WorkerRequest::Put {
            value,
            pin,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| self.transport_err("worker dropped the put reply"))
    }

    pub async fn unrelease(&self, chunk: ChunkId) -> Result<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(WorkerRequest::Unrelease {
            chunk,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| self.transport_err("worker dropped the unrelease reply"))
    }

    pub async fn free(&self, chunk: ChunkId, force: bool, cache: bool) -> Result<()> {
        self.send(WorkerRequest::Free {
            chunk,
            force,
            cache,
        })
        .await
    }

    pub async fn persist(&self, chunk: ChunkId) -> Result<()> {
        self.send(WorkerRequest::Persist { chunk }).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(WorkerRequest::Stats { reply: reply_tx }).await?;
        reply_rx
            .await
            .map_err(|_| self.transport_err("worker dropped the stats reply"))
    }
}

/// Spawn `count` workers wired to each other, ids `0..count`.
pub fn spawn_worker_pool(count: usize) -> Vec<WorkerHandle> {
    let mut receivers = Vec::with_capacity(count);
    let handles: Vec<WorkerHandle> = (0..count)
        .map(|id| {
            let (tx, rx) = mpsc::channel::<WorkerRequest>(32);
            receivers.push(rx);
            WorkerHandle { id, tx }
        })
        .collect();

    for (id, rx) in receivers.into_iter().enumerate() {
        // a worker must not hold its own sender, or the loop never exits
        let peers: HashMap<WorkerId, WorkerHandle> = handles
            .iter()
            .filter(|h| h.id != id)
            .map(|h| (h.id, h.clone()))
            .collect();
        spawn_worker(id, rx, peers);
    }

    handles
}

fn spawn_worker(
    id: WorkerId,
    mut rx: mpsc::Receiver<WorkerRequest>,
    peers: HashMap<WorkerId, WorkerHandle>,
) {
    tokio::spawn(async move {
        let store = Arc::new(Mutex::new(ChunkStore::default()));
        debug!(worker = id, "worker loop started");

        while let Some(request) = rx.recv().await {
            trace!(worker = id, ?request, "worker received request");
            match request {
                WorkerRequest::DoTask {
                    thunk,
                    f,
                    data,
                    send_result,
                    persist,
                    profile,
                    reply,
                } => {
                    let store = Arc::clone(&store);
                    let peers = peers.clone();
                    tokio::spawn(async move {
                        let result = do_task(
                            id,
                            &store,
                            &peers,
                            thunk,
                            f,
                            data,
                            send_result,
                            persist,
                            profile,
                        )
                        .await;
                        if reply.send(result).is_err() {
                            trace!(worker = id, thunk, "task reply receiver dropped");
                        }
                    });
                }
                WorkerRequest::Gather { chunk, reply } => {
                    let value = store.lock().expect("store lock poisoned").get(chunk);
                    let _ = reply.send(value);
                }
                WorkerRequest::Put { value, pin, reply } => {
                    let chunk_id = store.lock().expect("store lock poisoned").put(value, pin);
                    let _ = reply.send(Chunk {
                        id: chunk_id,
                        worker: id,
                    });
                }
                WorkerRequest::Free {
                    chunk,
                    force,
                    cache,
                } => {
                    store
                        .lock()
                        .expect("store lock poisoned")
                        .free(chunk, force, cache);
                    trace!(worker = id, chunk, force, cache, "freed chunk");
                }
                WorkerRequest::Persist { chunk } => {
                    store.lock().expect("store lock poisoned").persist(chunk);
                }
                WorkerRequest::Unrelease { chunk, reply } => {
                    let live = store.lock().expect("store lock poisoned").unrelease(chunk);
                    let _ = reply.send(live);
                }
                WorkerRequest::Stats { reply } => {
                    let stats = store.lock().expect("store lock poisoned").stats();
                    let _ = reply.send(stats);
                }
            }
        }

        debug!(worker = id, "worker loop finished (channel closed)");
    });
}
