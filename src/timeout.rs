//! Run a fallible future under a deadline.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Run `fut` on its own task and return its result, or [`Error::Timeout`]
/// if `timeout` passes first.
///
/// A panic inside `fut` is re-raised in the caller. On timeout the task is
/// aborted at its next await point.
pub async fn do_with_timeout<F, T>(fut: F, timeout: Duration) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    do_with_cancel(fut, timeout, &CancellationToken::new()).await
}

/// Like [`do_with_timeout`], additionally returning [`Error::Canceled`] when
/// `cancel` fires first.
pub async fn do_with_cancel<F, T>(fut: F, timeout: Duration, cancel: &CancellationToken) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = tokio::spawn(fut);

    tokio::select! {
        joined = &mut handle => match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(Error::Other(format!("task failed: {e}"))),
        },
        _ = tokio::time::sleep(timeout) => {
            handle.abort();
            debug!(timeout_ms = timeout.as_millis() as u64, "deadline exceeded");
            Err(Error::Timeout)
        }
        _ = cancel.cancelled() => {
            handle.abort();
            Err(Error::Canceled)
        }
    }
}
