// src/engine/mod.rs

//! The master-side dispatch loop and its channel types.

pub mod runtime;

pub use runtime::{compute_dag, CapturedError, Completion, Failure, TaskOutput};
