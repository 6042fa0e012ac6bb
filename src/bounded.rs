use std::future::Future;

use futures::future::join_all;

use crate::error::{LimitError, TaskError};
use crate::limiter::Limiter;

/// Run every job through `limiter` and collect the outcomes in submission
/// order, whatever order they settle in.
///
/// All jobs are submitted before anything is awaited, so the limiter's queue
/// holds the overflow. An empty batch returns an empty vec.
pub async fn run_bounded<F, Fut, T, E>(
    limiter: &Limiter,
    jobs: Vec<F>,
) -> Vec<Result<T, TaskError<E>>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    if jobs.is_empty() {
        return Vec::new();
    }

    let handles: Vec<_> = jobs.into_iter().map(|job| limiter.submit(job)).collect();
    join_all(handles).await
}

/// [`run_bounded`] on a fresh limiter of `max_parallel` slots.
pub async fn run_with_limit<F, Fut, T, E>(
    max_parallel: usize,
    jobs: Vec<F>,
) -> Result<Vec<Result<T, TaskError<E>>>, LimitError>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let limiter = Limiter::new(max_parallel)?;
    Ok(run_bounded(&limiter, jobs).await)
}
