//! Concurrent application of pipeline stages
//!
//! Workers pull from a shared input channel and push to a shared output
//! channel. The output closes once every worker has returned, so a
//! consumer reading until `None` has seen every result. Results arrive in
//! completion order.

use super::fxcore::{Func, Maybe};
use crate::netx::Context;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

fn workers(parallelism: i64) -> usize {
    usize::try_from(parallelism.max(1)).unwrap_or(1)
}

fn spawn_pool<I, O, W, Fut>(parallelism: i64, input: mpsc::Receiver<I>, work: W) -> mpsc::Receiver<O>
where
    I: Send + 'static,
    O: Send + 'static,
    W: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let input = Arc::new(Mutex::new(input));
    let work = Arc::new(work);

    for _ in 0..workers(parallelism) {
        let tx = tx.clone();
        let input = Arc::clone(&input);
        let work = Arc::clone(&work);
        tokio::spawn(async move {
            loop {
                let next = input.lock().await.recv().await;
                let Some(item) = next else {
                    break;
                };
                if tx.send(work(item).await).await.is_err() {
                    break;
                }
            }
        });
    }
    rx
}

/// Apply `f` to every value of `inputs` using `parallelism` workers.
///
/// Values of `parallelism` below one mean one worker.
pub fn map_parallel<A, B, F>(
    ctx: &Context,
    parallelism: i64,
    f: Arc<F>,
    inputs: mpsc::Receiver<A>,
) -> mpsc::Receiver<Maybe<B>>
where
    A: Send + 'static,
    B: Send + 'static,
    F: Func<A, B> + ?Sized + 'static,
{
    let ctx = ctx.clone();
    spawn_pool(parallelism, inputs, move |input| {
        let f = Arc::clone(&f);
        let ctx = ctx.clone();
        async move { f.apply(&ctx, Maybe::ok(input)).await }
    })
}

/// Apply every stage of `fns` to the same `input` using `parallelism`
/// workers, and wait for all results.
pub async fn parallel<A, B>(
    ctx: &Context,
    parallelism: i64,
    input: A,
    fns: Vec<Arc<dyn Func<A, B>>>,
) -> Vec<Maybe<B>>
where
    A: Clone + Send + Sync + 'static,
    B: Send + 'static,
{
    let ctx = ctx.clone();
    let results = spawn_pool(parallelism, stream_list(fns), move |f: Arc<dyn Func<A, B>>| {
        let ctx = ctx.clone();
        let input = input.clone();
        async move { f.apply(&ctx, Maybe::ok(input)).await }
    });
    collect(results).await
}

/// Run `f` on `input` in the background; the channel yields its result
pub fn apply_async<A, B, F>(ctx: &Context, f: Arc<F>, input: Maybe<A>) -> mpsc::Receiver<Maybe<B>>
where
    A: Send + 'static,
    B: Send + 'static,
    F: Func<A, B> + ?Sized + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let _ = tx.send(f.apply(&ctx, input).await).await;
    });
    rx
}

/// A closed channel holding `items`
pub fn stream_list<T: Send + 'static>(items: Vec<T>) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(items.len().max(1));
    for item in items {
        // capacity covers every item
        let _ = tx.try_send(item);
    }
    rx
}

/// Read `rx` until it closes
pub async fn collect<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Some(item) = rx.recv().await {
        out.push(item);
    }
    out
}
