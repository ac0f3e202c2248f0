//! Bounded retry loop used for polling operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use vmlite_shared::errors::{VmliteError, VmliteResult};

/// Outcome of one polling attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutAction<T> {
    Done(T),
    Retry,
}

/// Run `action` until it reports `Done` or `timeout` elapses.
///
/// Attempts are spaced `interval` apart; the final sleep is clipped so the
/// loop never overshoots the deadline by more than one attempt. An error
/// from `action` aborts immediately. On timeout the error built by
/// `on_timeout` is returned.
pub async fn try_action_for<T, F, Fut, E>(
    timeout: Duration,
    interval: Duration,
    on_timeout: E,
    mut action: F,
) -> VmliteResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = VmliteResult<TimeoutAction<T>>>,
    E: FnOnce() -> VmliteError,
{
    let deadline = Instant::now() + timeout;

    loop {
        if let TimeoutAction::Done(value) = action().await? {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(on_timeout());
        }

        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
