// src/exec/mod.rs

//! Worker protocol: chunk stores, the request/reply transport, and remote
//! task invocation.
//!
//! - [`worker`] owns the worker loops and their chunk stores.
//! - [`task`] implements `do_task` (move inputs, run, package) and the
//!   master-side `async_apply` launcher.

pub mod task;
pub mod worker;

pub use task::{async_apply, gather_handle};
pub use worker::{spawn_worker_pool, StoreStats, WorkerHandle, WorkerRequest};
