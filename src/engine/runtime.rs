// src/engine/runtime.rs

//! The master dispatch loop.
//!
//! One logical task drives the whole run: it seeds the workers from the
//! initial ready set, then blocks on a single completion channel. Background
//! tasks spawned by `exec::async_apply` do nothing but await an RPC reply
//! and forward it here, so no scheduler state is ever touched concurrently.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, debug_span, info_span, warn};

use crate::chunk::{AbstractChunk, Chunk, WorkerId};
use crate::context::Context;
use crate::dag::scheduler::{FreeOp, SchedulerState, Stored};
use crate::errors::{DagflowError, Result};
use crate::exec::async_apply;
use crate::thunk::{Thunk, ThunkId, ThunkInput, Value};

/// An error raised while running a task function, captured with its
/// backtrace rendering so the master can rethrow something useful.
#[derive(Debug, Clone)]
pub struct CapturedError {
    pub message: String,
    pub backtrace: String,
}

impl CapturedError {
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self {
            message: format!("{err:#}"),
            backtrace: format!("{err:?}"),
        }
    }

    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "task panicked".to_string());
        Self {
            message,
            backtrace: String::new(),
        }
    }
}

/// Failure payloads on the completion channel. Computation and transport
/// errors are distinguishable here; both abort the run.
#[derive(Debug, Clone)]
pub enum Failure {
    Task(CapturedError),
    Transport(String),
}

/// Successful reply from a worker: a chunk handle, or the raw value when
/// the task was fired with `get_result`.
#[derive(Clone)]
pub enum TaskOutput {
    Chunk(Chunk),
    Value(Value),
}

impl std::fmt::Debug for TaskOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutput::Chunk(c) => write!(f, "Chunk({c:?})"),
            TaskOutput::Value(_) => write!(f, "Value(..)"),
        }
    }
}

/// One message on the completion channel: `(worker, thunk, result | failure)`.
#[derive(Debug)]
pub struct Completion {
    pub worker: WorkerId,
    pub thunk: ThunkId,
    pub result: std::result::Result<TaskOutput, Failure>,
}

enum Fired {
    /// The task went to a worker; a completion will arrive on the channel.
    Dispatched,
    /// The task completed on the master (meta task or cache hit); the worker
    /// was never occupied.
    Inline { immediate_next: bool },
}

/// Run the DAG rooted at `root` to completion and return the root's result.
pub async fn compute_dag(ctx: &Context, root: Arc<Thunk>) -> Result<Stored> {
    let mut state = {
        let _span = info_span!("scheduler_init", master = true, root = root.id).entered();
        SchedulerState::build(&root)?
    };

    let (completion_tx, mut completion_rx) = mpsc::channel::<Completion>(64);
    let live: HashSet<WorkerId> = ctx.workers().iter().map(|w| w.id).collect();
    let mut idle: Vec<WorkerId> = ctx.workers().iter().map(|w| w.id).collect();

    dispatch_idle(ctx, &mut state, &mut idle, &live, &completion_tx, false).await?;

    while !state.is_complete() {
        if state.running_len() == 0 {
            return Err(DagflowError::Invariant(
                "scheduler stalled with no running tasks".into(),
            ));
        }

        let Some(Completion {
            worker,
            thunk,
            result,
        }) = completion_rx.recv().await
        else {
            return Err(DagflowError::Invariant("completion channel closed".into()));
        };

        let output = match result {
            Ok(output) => output,
            Err(Failure::Task(err)) => {
                warn!(thunk, worker, error = %err.message, "task failed; aborting run");
                return Err(DagflowError::TaskFailed {
                    thunk,
                    site: format!("worker-{worker}"),
                    message: err.message,
                    backtrace: err.backtrace,
                });
            }
            Err(Failure::Transport(message)) => {
                warn!(thunk, worker, error = %message, "transport failure; aborting run");
                return Err(DagflowError::Transport { worker, message });
            }
        };

        let _span = debug_span!("scheduler", master = true, thunk).entered();
        state.store_result(thunk, stored_output(output));
        let (immediate_next, frees) = state.finish_task(thunk, true)?;
        apply_frees(ctx, frees);

        idle.push(worker);
        dispatch_idle(ctx, &mut state, &mut idle, &live, &completion_tx, immediate_next).await?;
    }

    state.root_result()
}

fn stored_output(output: TaskOutput) -> Stored {
    match output {
        TaskOutput::Chunk(c) => Stored::Chunk(AbstractChunk::Chunk(c)),
        TaskOutput::Value(v) => Stored::Raw(v),
    }
}

fn apply_frees(ctx: &Context, frees: Vec<FreeOp>) {
    for op in frees {
        ctx.reaper().free(op.chunk, false, op.cache);
    }
}

/// Hand ready tasks to idle workers, most recently freed worker first.
///
/// When `fast_path` is set, the first pick takes the just-unlocked child
/// directly, bypassing affinity. A worker with nothing eligible is dropped
/// for the rest of this cycle and rejoins on the next completion.
async fn dispatch_idle(
    ctx: &Context,
    state: &mut SchedulerState,
    idle: &mut Vec<WorkerId>,
    live: &HashSet<WorkerId>,
    completion_tx: &mpsc::Sender<Completion>,
    mut fast_path: bool,
) -> Result<()> {
    let mut skipped: Vec<WorkerId> = Vec::new();

    while state.has_ready() {
        let Some(worker) = idle.pop() else { break };

        let picked = if fast_path {
            fast_path = false;
            state.pop_newest()
        } else {
            state.pop_with_affinity(worker, live)
        };

        match picked {
            None => {
                debug!(worker, "no eligible task; worker idles this cycle");
                skipped.push(worker);
            }
            Some(thunk_id) => match fire_task(ctx, state, thunk_id, worker, completion_tx).await? {
                Fired::Dispatched => {}
                Fired::Inline { immediate_next } => {
                    if immediate_next {
                        fast_path = true;
                    }
                    idle.push(worker);
                }
            },
        }
    }

    idle.extend(skipped);
    Ok(())
}

/// Fire one ready task: short-circuit on a live cached result, run meta
/// tasks inline on the master, otherwise dispatch to the given worker.
async fn fire_task(
    ctx: &Context,
    state: &mut SchedulerState,
    thunk_id: ThunkId,
    worker: WorkerId,
    completion_tx: &mpsc::Sender<Completion>,
) -> Result<Fired> {
    let thunk = state.thunk(thunk_id)?.clone();
    if state.is_running(thunk_id) {
        return Err(DagflowError::Invariant(format!(
            "thunk {thunk_id} dispatched while already running"
        )));
    }

    if thunk.is_cached() {
        if let Some(cache_ref) = thunk.cache_ref() {
            let hit = match ctx.worker(cache_ref.worker) {
                Some(owner) => owner.unrelease(cache_ref.id).await?,
                // the owner left the context; treat as a miss
                None => false,
            };
            if hit {
                debug!(thunk = thunk_id, chunk = cache_ref.id, "cache hit; reusing persisted result");
                state.store_result(thunk_id, Stored::Chunk(AbstractChunk::Chunk(cache_ref)));
                let (immediate_next, _) = state.finish_task(thunk_id, false)?;
                return Ok(Fired::Inline { immediate_next });
            }
            debug!(thunk = thunk_id, "cached result no longer live; recomputing");
            thunk.set_cache_ref(None);
        }
    }

    // every thunk input must already be in the cache; this is the
    // definition of readiness
    let mut data = Vec::with_capacity(thunk.inputs.len());
    for input in &thunk.inputs {
        match input {
            ThunkInput::Thunk(dep) => {
                let stored = state.result_of(dep.id).ok_or_else(|| {
                    DagflowError::Invariant(format!(
                        "thunk {thunk_id} fired before input {} was cached",
                        dep.id
                    ))
                })?;
                data.push(stored.as_value());
            }
            ThunkInput::Chunk(ac) => data.push(Arc::new(ac.clone()) as Value),
            ThunkInput::Data(v) => data.push(v.clone()),
        }
    }

    state.mark_running(thunk_id)?;

    if thunk.meta {
        // meta tasks run on the master and see their inputs unmoved
        let result = {
            let _span = debug_span!("compute", site = "master", thunk = thunk_id).entered();
            catch_unwind(AssertUnwindSafe(|| (thunk.f)(&data)))
        };
        let value = match result {
            Ok(Ok(v)) => v,
            Ok(Err(err)) => {
                return Err(DagflowError::TaskFailed {
                    thunk: thunk_id,
                    site: "master".into(),
                    message: format!("{err:#}"),
                    backtrace: format!("{err:?}"),
                })
            }
            Err(panic) => {
                let captured = CapturedError::from_panic(panic.as_ref());
                return Err(DagflowError::TaskFailed {
                    thunk: thunk_id,
                    site: "master".into(),
                    message: captured.message,
                    backtrace: captured.backtrace,
                });
            }
        };
        state.store_result(thunk_id, Stored::Raw(value));
        // a meta task does not consume its inputs: they arrive unmoved and a
        // grid fusion re-exports them as cells of its result, whose finalizer
        // then owns their lifetime
        let (immediate_next, _) = state.finish_task(thunk_id, false)?;
        return Ok(Fired::Inline { immediate_next });
    }

    let handle = ctx
        .worker(worker)
        .ok_or_else(|| DagflowError::Invariant(format!("unknown worker {worker}")))?
        .clone();
    debug!(thunk = thunk_id, worker, "dispatching task to worker");
    async_apply(
        handle,
        thunk_id,
        thunk.f.clone(),
        data,
        thunk.get_result,
        thunk.is_persisted(),
        ctx.profile(),
        completion_tx.clone(),
    );
    Ok(Fired::Dispatched)
}
