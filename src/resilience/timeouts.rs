//! Timeout and cancellation enforcement.
//!
//! Every backend call has a deadline. The per-server timeout and the caller's
//! cancellation are independent: either ends that server's participation.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Why a bounded call did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    TimedOut(Duration),
    Cancelled,
}

/// Run `fut` until it completes, `limit` elapses, or `cancel` fires.
pub async fn bounded<F, T>(
    fut: F,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<T, Interrupted>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
        result = tokio::time::timeout(limit, fut) => result.map_err(|_| Interrupted::TimedOut(limit)),
    }
}

/// Run `fut` until it completes or `cancel` fires. No deadline of its own.
pub async fn cancellable<F, T>(fut: F, cancel: &CancellationToken) -> Result<T, Interrupted>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
        result = fut => Ok(result),
    }
}

/// Run `fut` until it completes, the overall `deadline` passes, or `cancel`
/// fires. `TimedOut` carries the time that was left when the call started.
pub async fn until_deadline<F, T>(
    fut: F,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<T, Interrupted>
where
    F: Future<Output = T>,
{
    match deadline {
        Some(deadline) => bounded(fut, deadline.saturating_duration_since(Instant::now()), cancel).await,
        None => cancellable(fut, cancel).await,
    }
}
