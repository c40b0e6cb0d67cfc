#![allow(dead_code)]

//! Shared helpers for the integration tests: counting task functions,
//! downcast shorthands, and store polling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dagflow::{task_fn, Context, TaskFn, Value};

pub fn as_usize(v: &Value) -> usize {
    *v.downcast_ref::<usize>().expect("expected a usize value")
}

pub fn as_vec(v: &Value) -> &Vec<Value> {
    v.downcast_ref::<Vec<Value>>().expect("expected a Vec<Value>")
}

/// A task that returns `n` and counts its invocations.
pub fn counted_const(n: usize, counter: Arc<AtomicUsize>) -> TaskFn {
    task_fn(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(n) as Value)
    })
}

pub fn constant(n: usize) -> TaskFn {
    task_fn(move |_| Ok(Arc::new(n) as Value))
}

/// Unary map over a usize input.
pub fn map_usize(f: impl Fn(usize) -> usize + Send + Sync + 'static) -> TaskFn {
    task_fn(move |values| {
        let x = *values[0]
            .downcast_ref::<usize>()
            .ok_or_else(|| anyhow::anyhow!("expected a usize input"))?;
        Ok(Arc::new(f(x)) as Value)
    })
}

/// Sum of all usize inputs.
pub fn sum_all() -> TaskFn {
    task_fn(|values| {
        let mut sum = 0usize;
        for v in values {
            sum += *v
                .downcast_ref::<usize>()
                .ok_or_else(|| anyhow::anyhow!("expected a usize input"))?;
        }
        Ok(Arc::new(sum) as Value)
    })
}

/// Total live chunks across every worker store.
pub async fn total_live(ctx: &Context) -> usize {
    ctx.store_stats()
        .await
        .expect("store stats")
        .iter()
        .map(|s| s.live)
        .sum()
}

/// Poll the stores until the live-chunk total reaches `expected` (frees are
/// asynchronous; they drain through the reaper).
pub async fn await_live_count(ctx: &Context, expected: usize) {
    for _ in 0..200 {
        if total_live(ctx).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "live chunk count did not reach {expected}; still at {}",
        total_live(ctx).await
    );
}
