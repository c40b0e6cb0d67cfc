// src/dag/scheduler.rs

//! Scheduler state machine: ready/waiting/running bookkeeping, reference
//! counting of intermediate results, and affinity-aware selection.
//!
//! This is deliberately synchronous; the async dispatch loop in
//! `engine::runtime` drives it and performs all channel and worker traffic.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::chunk::{AbstractChunk, WorkerId};
use crate::dag::analysis::{
    collect_thunks, dependents, ensure_acyclic, offspring, total_order, NodeKey,
};
use crate::errors::{DagflowError, Result};
use crate::thunk::{Thunk, ThunkId, ThunkInput, Value};

/// A result held in the scheduler cache: a chunk handle for ordinary tasks,
/// or the raw value for `get_result` and meta tasks.
#[derive(Clone)]
pub enum Stored {
    Chunk(AbstractChunk),
    Raw(Value),
}

impl Stored {
    /// The result as a task input value. Chunk handles stay handles; the
    /// worker-side move step materializes them.
    pub fn as_value(&self) -> Value {
        match self {
            Stored::Chunk(ac) => Arc::new(ac.clone()) as Value,
            Stored::Raw(v) => v.clone(),
        }
    }

    pub fn as_chunk(&self) -> Option<&AbstractChunk> {
        match self {
            Stored::Chunk(ac) => Some(ac),
            Stored::Raw(_) => None,
        }
    }

    pub fn affinity(&self) -> Vec<(WorkerId, u64)> {
        match self {
            Stored::Chunk(ac) => ac.affinity(),
            Stored::Raw(_) => Vec::new(),
        }
    }
}

impl fmt::Debug for Stored {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stored::Chunk(ac) => write!(f, "Chunk({ac:?})"),
            Stored::Raw(_) => write!(f, "Raw(..)"),
        }
    }
}

/// A deferred lifetime operation emitted by the state machine. The runtime
/// hands these to the reaper; the state machine itself never blocks.
#[derive(Debug)]
pub struct FreeOp {
    pub chunk: AbstractChunk,
    /// Move the datum to the keep-alive registry instead of dropping it, so
    /// a future run can unrelease it.
    pub cache: bool,
}

/// Per-run scheduler state over one thunk DAG.
pub struct SchedulerState {
    thunks: HashMap<ThunkId, Arc<Thunk>>,
    dependents: HashMap<NodeKey, HashSet<ThunkId>>,
    /// For each not-yet-ready thunk, the thunk inputs not yet finished.
    waiting: HashMap<ThunkId, HashSet<ThunkId>>,
    /// For each node, the dependents that have not fired yet; empty means
    /// the node's data has no remaining consumers.
    waiting_data: HashMap<NodeKey, HashSet<ThunkId>>,
    /// Tasks with all inputs finished, awaiting a worker. The tail holds the
    /// highest-priority entry.
    ready: Vec<ThunkId>,
    running: HashSet<ThunkId>,
    cache: HashMap<ThunkId, Stored>,
    finished: Option<ThunkId>,
    order: HashMap<ThunkId, usize>,
    root: ThunkId,
}

impl SchedulerState {
    pub fn build(root: &Arc<Thunk>) -> Result<Self> {
        let thunks = collect_thunks(root);
        ensure_acyclic(&thunks)?;

        let deps = dependents(root);
        let counts = offspring(&deps);
        let order = total_order(root, &counts);

        let mut waiting = HashMap::new();
        let mut initially_ready = Vec::new();
        for (id, thunk) in &thunks {
            let pending: HashSet<ThunkId> = thunk.thunk_inputs().map(|d| d.id).collect();
            if pending.is_empty() {
                initially_ready.push(*id);
            } else {
                waiting.insert(*id, pending);
            }
        }

        let waiting_data = deps.clone();

        let mut state = Self {
            thunks,
            dependents: deps,
            waiting,
            waiting_data,
            ready: Vec::new(),
            running: HashSet::new(),
            cache: HashMap::new(),
            finished: None,
            order,
            root: root.id,
        };
        state.push_ready_many(initially_ready);

        debug!(
            root = state.root,
            thunks = state.thunks.len(),
            ready = state.ready.len(),
            "scheduler state initialized"
        );
        Ok(state)
    }

    pub fn is_complete(&self) -> bool {
        self.waiting.is_empty() && self.ready.is_empty() && self.running.is_empty()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn ready(&self) -> &[ThunkId] {
        &self.ready
    }

    pub fn is_waiting(&self, id: ThunkId) -> bool {
        self.waiting.contains_key(&id)
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn is_running(&self, id: ThunkId) -> bool {
        self.running.contains(&id)
    }

    pub fn thunk_count(&self) -> usize {
        self.thunks.len()
    }

    pub fn order_of(&self, id: ThunkId) -> Option<usize> {
        self.order.get(&id).copied()
    }

    pub fn thunk(&self, id: ThunkId) -> Result<&Arc<Thunk>> {
        self.thunks
            .get(&id)
            .ok_or_else(|| DagflowError::Invariant(format!("unknown thunk {id}")))
    }

    pub fn result_of(&self, id: ThunkId) -> Option<&Stored> {
        self.cache.get(&id)
    }

    pub fn root_result(&self) -> Result<Stored> {
        self.cache.get(&self.root).cloned().ok_or_else(|| {
            DagflowError::Invariant(format!(
                "run completed without a result for root {}",
                self.root
            ))
        })
    }

    /// Record a completed result. Caching thunks also get their `cache_ref`
    /// updated so later runs can short-circuit.
    pub fn store_result(&mut self, id: ThunkId, result: Stored) {
        if let Some(thunk) = self.thunks.get(&id) {
            if thunk.is_cached() {
                if let Stored::Chunk(AbstractChunk::Chunk(c)) = &result {
                    thunk.set_cache_ref(Some(*c));
                }
            }
        }
        self.cache.insert(id, result);
    }

    pub fn mark_running(&mut self, id: ThunkId) -> Result<()> {
        if !self.running.insert(id) {
            return Err(DagflowError::Invariant(format!("thunk {id} fired twice")));
        }
        Ok(())
    }

    /// Apply the consequences of `node` finishing.
    ///
    /// Dependents with no remaining unfinished inputs move to `ready`
    /// (signalled through the returned `immediate_next` flag so dispatch can
    /// take the fast path). Each input's unfired-dependent set shrinks; when
    /// one empties and `free` is set, a free op for its data is emitted;
    /// caching thunks free with `cache = true` and keep their cache slot.
    pub fn finish_task(&mut self, node_id: ThunkId, free: bool) -> Result<(bool, Vec<FreeOp>)> {
        let node = self.thunk(node_id)?.clone();

        let mut unlocked = Vec::new();
        if let Some(deps) = self.dependents.get(&NodeKey::Thunk(node_id)) {
            for dependent in deps.clone() {
                if let Some(pending) = self.waiting.get_mut(&dependent) {
                    pending.remove(&node_id);
                    if pending.is_empty() {
                        self.waiting.remove(&dependent);
                        debug!(
                            thunk = dependent,
                            unlocked_by = node_id,
                            "dependencies satisfied; marking ready"
                        );
                        unlocked.push(dependent);
                    }
                }
            }
        }
        let immediate_next = !unlocked.is_empty();
        self.push_ready_many(unlocked);

        let mut frees = Vec::new();
        for input in &node.inputs {
            let Some(key) = NodeKey::of_input(input) else {
                continue;
            };
            if let Some(unfired) = self.waiting_data.get_mut(&key) {
                unfired.remove(&node_id);
                if unfired.is_empty() {
                    self.waiting_data.remove(&key);
                    if free {
                        frees.extend(self.free_node(key));
                    }
                }
            }
        }

        self.running.remove(&node_id);
        self.finished = Some(node_id);
        Ok((immediate_next, frees))
    }

    pub fn last_finished(&self) -> Option<ThunkId> {
        self.finished
    }

    /// Release a node whose last dependent has fired. Only thunk outputs are
    /// reclaimed here; input chunks are owned by whoever supplied them.
    fn free_node(&mut self, key: NodeKey) -> Option<FreeOp> {
        match key {
            NodeKey::Thunk(id) => {
                let keep = self.thunks.get(&id).map(|t| t.is_cached()).unwrap_or(false);
                if keep {
                    // retain the cache slot; the worker-side datum moves to
                    // the keep-alive registry (or stays put if pinned)
                    match self.cache.get(&id) {
                        Some(Stored::Chunk(ac)) => Some(FreeOp {
                            chunk: ac.clone(),
                            cache: true,
                        }),
                        _ => None,
                    }
                } else {
                    match self.cache.remove(&id) {
                        Some(Stored::Chunk(ac)) => Some(FreeOp {
                            chunk: ac,
                            cache: false,
                        }),
                        _ => None,
                    }
                }
            }
            NodeKey::Chunk(_) => None,
        }
    }

    /// Affinity of a thunk: the override if the staging layer supplied one,
    /// otherwise the concatenated affinities of its inputs (finished thunk
    /// inputs report the location of their cached result).
    pub fn affinity_of(&self, id: ThunkId) -> Vec<(WorkerId, u64)> {
        let Some(thunk) = self.thunks.get(&id) else {
            return Vec::new();
        };
        if let Some(hint) = &thunk.affinity_override {
            return hint.clone();
        }
        let mut affinity = Vec::new();
        for input in &thunk.inputs {
            match input {
                ThunkInput::Chunk(ac) => affinity.extend(ac.affinity()),
                ThunkInput::Thunk(dep) => {
                    if let Some(stored) = self.cache.get(&dep.id) {
                        affinity.extend(stored.affinity());
                    }
                }
                ThunkInput::Data(_) => {}
            }
        }
        affinity
    }

    /// Pick a task for `worker`, scanning from most recently added to
    /// oldest. First pass: a task with `worker` in the affinity of any
    /// input. Second pass: a task with no affinity at all, or one orphaned
    /// by having no live worker match. Otherwise `None`: the worker idles
    /// this cycle.
    pub fn pop_with_affinity(
        &mut self,
        worker: WorkerId,
        live: &HashSet<WorkerId>,
    ) -> Option<ThunkId> {
        for i in (0..self.ready.len()).rev() {
            let affinity = self.affinity_of(self.ready[i]);
            if affinity.iter().any(|(w, _)| *w == worker) {
                return Some(self.ready.remove(i));
            }
        }
        for i in (0..self.ready.len()).rev() {
            let affinity = self.affinity_of(self.ready[i]);
            if affinity.is_empty() || !affinity.iter().any(|(w, _)| live.contains(w)) {
                return Some(self.ready.remove(i));
            }
        }
        None
    }

    /// Fast path: take the just-unlocked highest-priority task, bypassing
    /// affinity to pipeline work.
    pub fn pop_newest(&mut self) -> Option<ThunkId> {
        self.ready.pop()
    }

    fn push_ready_many(&mut self, mut ids: Vec<ThunkId>) {
        // keep the root-closest task at the tail, where both the fast path
        // and the affinity scan look first
        ids.sort_by_key(|id| std::cmp::Reverse(self.order.get(id).copied().unwrap_or(usize::MAX)));
        self.ready.extend(ids);
    }
}
