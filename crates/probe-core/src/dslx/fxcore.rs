//! Steps, results and sequential composition

use super::observations::Observations;
use crate::failure::{NetError, HOST_UNREACHABLE, NETWORK_UNREACHABLE};
use crate::netx::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Result of a pipeline step: the next state or the failure that stopped
/// the pipeline, plus every observation collected so far.
#[derive(Debug, Clone)]
pub struct Maybe<T> {
    /// Next state, or the failure
    pub result: Result<T, NetError>,
    /// Observations in collection order
    pub observations: Vec<Observations>,
}

impl<T> Maybe<T> {
    /// A successful result without observations
    pub fn ok(state: T) -> Self {
        Self {
            result: Ok(state),
            observations: Vec::new(),
        }
    }

    /// A failed result without observations
    pub fn err(error: NetError) -> Self {
        Self {
            result: Err(error),
            observations: Vec::new(),
        }
    }

    /// Build from parts
    pub fn new(result: Result<T, NetError>, observations: Vec<Observations>) -> Self {
        Self { result, observations }
    }

    /// Whether the step succeeded
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// The failure, if any
    pub fn error(&self) -> Option<&NetError> {
        self.result.as_ref().err()
    }

    /// The state, if any
    pub fn state(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    /// Put `earlier` in front of the observations of this result
    #[must_use]
    pub fn after(mut self, mut earlier: Vec<Observations>) -> Self {
        earlier.append(&mut self.observations);
        self.observations = earlier;
        self
    }
}

/// One operation of a pipeline, run only on successful input.
#[async_trait]
pub trait Step<A, B>: Send + Sync
where
    A: Send + 'static,
    B: Send + 'static,
{
    /// Perform the operation
    async fn run(&self, ctx: &Context, input: A) -> Maybe<B>;
}

/// A pipeline stage mapping one [`Maybe`] to the next.
#[async_trait]
pub trait Func<A, B>: Send + Sync
where
    A: Send + 'static,
    B: Send + 'static,
{
    /// Apply the stage
    async fn apply(&self, ctx: &Context, input: Maybe<A>) -> Maybe<B>;
}

#[async_trait]
impl<A, B, F> Func<A, B> for Arc<F>
where
    A: Send + 'static,
    B: Send + 'static,
    F: Func<A, B> + ?Sized,
{
    async fn apply(&self, ctx: &Context, input: Maybe<A>) -> Maybe<B> {
        (**self).apply(ctx, input).await
    }
}

/// [`Func`] running a [`Step`] on successful input and passing failures
/// through untouched.
#[derive(Debug, Clone)]
pub struct StepFunc<S> {
    step: S,
}

/// Lift a [`Step`] into a [`Func`]
pub fn operation<S>(step: S) -> StepFunc<S> {
    StepFunc { step }
}

#[async_trait]
impl<A, B, S> Func<A, B> for StepFunc<S>
where
    A: Send + 'static,
    B: Send + 'static,
    S: Step<A, B>,
{
    async fn apply(&self, ctx: &Context, input: Maybe<A>) -> Maybe<B> {
        let Maybe { result, observations } = input;
        match result {
            Err(error) => Maybe::new(Err(error), observations),
            Ok(state) => self.step.run(ctx, state).await.after(observations),
        }
    }
}

/// [`Step`] built from a synchronous closure.
pub struct FnStep<F> {
    f: F,
}

/// Wrap a closure as a [`Step`]
pub fn step_fn<F>(f: F) -> FnStep<F> {
    FnStep { f }
}

#[async_trait]
impl<A, B, F> Step<A, B> for FnStep<F>
where
    A: Send + 'static,
    B: Send + 'static,
    F: Fn(A) -> Maybe<B> + Send + Sync,
{
    async fn run(&self, _ctx: &Context, input: A) -> Maybe<B> {
        (self.f)(input)
    }
}

/// Sequential composition of two stages.
pub struct Compose2<F, G, B> {
    f: F,
    g: G,
    _mid: PhantomData<fn() -> B>,
}

/// Run `f`, then `g` on its result.
///
/// Failures short-circuit because `g` passes a failed input through.
/// Longer chains are right folds of this function, see [`compose!`](crate::compose).
pub fn compose2<A, B, C, F, G>(f: F, g: G) -> Compose2<F, G, B>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    F: Func<A, B>,
    G: Func<B, C>,
{
    Compose2 {
        f,
        g,
        _mid: PhantomData,
    }
}

#[async_trait]
impl<A, B, C, F, G> Func<A, C> for Compose2<F, G, B>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    F: Func<A, B>,
    G: Func<B, C>,
{
    async fn apply(&self, ctx: &Context, input: Maybe<A>) -> Maybe<C> {
        let mid = self.f.apply(ctx, input).await;
        self.g.apply(ctx, mid).await
    }
}

/// Compose any number of stages left to right.
///
/// `compose!(f, g, h)` is `compose2(f, compose2(g, h))`.
#[macro_export]
macro_rules! compose {
    ($f:expr $(,)?) => {
        $f
    };
    ($f:expr, $($rest:expr),+ $(,)?) => {
        $crate::dslx::compose2($f, $crate::compose!($($rest),+))
    };
}

/// Every observation of `results`, in order, duplicates included
pub fn extract_observations<'a, T: 'a>(results: impl IntoIterator<Item = &'a Maybe<T>>) -> Vec<Observations> {
    results
        .into_iter()
        .flat_map(|r| r.observations.iter().cloned())
        .collect()
}

/// Counts the successful values flowing through a pipeline.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    n: Arc<AtomicI64>,
}

/// [`Step`] behind [`Counter::func`]
#[derive(Debug, Clone)]
pub struct CountStep {
    n: Arc<AtomicI64>,
}

#[async_trait]
impl<T: Send + 'static> Step<T, T> for CountStep {
    async fn run(&self, _ctx: &Context, input: T) -> Maybe<T> {
        self.n.fetch_add(1, Ordering::Relaxed);
        Maybe::ok(input)
    }
}

impl Counter {
    /// A new counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage that counts and forwards its input
    pub fn func(&self) -> StepFunc<CountStep> {
        operation(CountStep {
            n: Arc::clone(&self.n),
        })
    }

    /// Values seen so far
    pub fn value(&self) -> i64 {
        self.n.load(Ordering::Relaxed)
    }
}

/// Collects failures from many results.
#[derive(Debug, Default)]
pub struct ErrorLogger {
    errors: Mutex<Vec<NetError>>,
}

impl ErrorLogger {
    /// An empty logger
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember one failure
    pub fn record(&self, error: NetError) {
        self.errors.lock().push(error);
    }

    /// Failures recorded so far
    pub fn errors(&self) -> Vec<NetError> {
        self.errors.lock().clone()
    }
}

/// Record the failure of each failed result
pub fn record_errors<'a, T: 'a>(logger: &ErrorLogger, results: impl IntoIterator<Item = &'a Maybe<T>>) {
    for error in results.into_iter().filter_map(Maybe::error) {
        logger.record(error.clone());
    }
}

/// First failure among `results`
pub fn first_error<'a, T: 'a>(results: impl IntoIterator<Item = &'a Maybe<T>>) -> Option<&'a NetError> {
    results.into_iter().find_map(Maybe::error)
}

/// First failure among `results`, ignoring the unreachable-network errors
/// that hosts without IPv6 connectivity produce.
pub fn first_error_excluding_broken_ipv6<'a, T: 'a>(
    results: impl IntoIterator<Item = &'a Maybe<T>>,
) -> Option<&'a NetError> {
    results
        .into_iter()
        .filter_map(Maybe::error)
        .find(|e| e.failure != NETWORK_UNREACHABLE && e.failure != HOST_UNREACHABLE)
}
