// src/errors.rs

//! Crate-wide error type and `Result` alias.

use thiserror::Error;

use crate::chunk::WorkerId;
use crate::thunk::ThunkId;

#[derive(Error, Debug)]
pub enum DagflowError {
    /// A task function raised on a worker (or on the master for meta tasks).
    /// Captured with its backtrace and rethrown here, aborting the run.
    #[error("task {thunk} failed on {site}: {message}")]
    TaskFailed {
        thunk: ThunkId,
        site: String,
        message: String,
        backtrace: String,
    },

    /// Delivery to or from a worker failed (channel closed, reply dropped).
    #[error("transport failure talking to worker {worker}: {message}")]
    Transport { worker: WorkerId, message: String },

    #[error("cycle detected in thunk graph involving thunk {0}")]
    GraphCycle(ThunkId),

    /// A would-be bug: missing cache entry at fire time, double-fire of a
    /// thunk, a stalled scheduler. Not tolerated; the run aborts.
    #[error("scheduler invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DagflowError>;
