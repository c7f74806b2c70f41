use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

// Runs `op` over every item with at most `limit` tasks in flight. The first
// failure cancels the remaining work and wins; successful results come back
// re-indexed by input position. Workers that finish after the cancellation
// broadcast still have their results observed before this returns, so callers
// tracking side effects through the op closure see every completed task.
pub async fn map_bounded<I, T, F, Fut>(
    items: Vec<I>,
    limit: usize,
    cancel: &CancellationToken,
    op: F,
) -> Result<Vec<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let total = items.len();
    let child = cancel.child_token();
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let op = Arc::new(op);

    let mut tasks: JoinSet<(usize, Result<T>)> = JoinSet::new();
    for (index, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let token = child.clone();
        let op = op.clone();
        tasks.spawn(async move {
            let _permit = tokio::select! {
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return (index, Err(Error::Cancelled)),
                },
                _ = token.cancelled() => return (index, Err(Error::Cancelled)),
            };
            if token.is_cancelled() {
                return (index, Err(Error::Cancelled));
            }
            (index, op(item, token).await)
        });
    }

    let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(total).collect();
    let mut first_error: Option<Error> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Ok(value))) => slots[index] = Some(value),
            Ok((_, Err(err))) => {
                if first_error.is_none() {
                    child.cancel();
                    first_error = Some(err);
                }
            }
            Err(err) => {
                if first_error.is_none() {
                    child.cancel();
                    first_error = Some(Error::Upstream(format!("fan-out worker failed: {err}")));
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(slots.into_iter().flatten().collect()),
    }
}
