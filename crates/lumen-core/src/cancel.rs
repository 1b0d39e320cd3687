// SPDX-License-Identifier: Apache-2.0

//! Cancellation and timeout wrappers for calls that reach the server.

use std::future::Future;
use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

use crate::error::{LumenError, LumenResult};

/// Runs `fut` until it completes or `cancel` fires, whichever comes first.
///
/// The future is dropped on cancellation, which closes any connection it owns.
pub async fn run_cancellable<T, F>(cancel: &CancellationToken, fut: F) -> LumenResult<T>
where
    F: Future<Output = LumenResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LumenError::Cancelled),
        result = fut => result,
    }
}

/// Like [`run_cancellable`] with an upper bound on elapsed time.
pub async fn run_with_deadline<T, F>(
    cancel: &CancellationToken,
    limit: Duration,
    fut: F,
) -> LumenResult<T>
where
    F: Future<Output = LumenResult<T>>,
{
    let bounded = async {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(LumenError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    };
    run_cancellable(cancel, bounded).await
}
