//! Parallel dispatch of one request per candidate target, resolving to the
//! first usable reply or a shared timeout.
//!
//! Grounded in the same "race everything, take the first Some" shape the
//! teacher crate uses for its multi-probe fan-out, built here on top of
//! [`FuturesUnordered`] so that losing attempts keep draining (and thus keep
//! releasing their sockets) after the race itself has returned.

use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};

/// Runs `attempt(target)` concurrently for every entry in `targets`, with a
/// shared deadline of `timeout`. Returns the first `Some` to complete, or
/// `None` if the deadline elapses (or `targets` is empty) without one.
///
/// Attempts that return `None` (transport error, malformed reply, negative
/// protocol result) never short-circuit the race; only a real timeout or an
/// exhausted candidate set ends it without a winner. Every future in
/// `targets` is expected to release its own resources (sockets, etc.) on
/// drop, satisfying the "no socket outlives the race" resource rule even
/// for attempts still in flight when a winner is found.
pub async fn race<T, F, Fut, R>(targets: Vec<T>, timeout: Duration, attempt: F) -> Option<R>
where
    F: Fn(T) -> Fut,
    Fut: std::future::Future<Output = Option<R>>,
{
    if targets.is_empty() {
        return None;
    }

    let mut in_flight: FuturesUnordered<_> = targets.into_iter().map(attempt).collect();

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = &mut deadline => return None,
            next = in_flight.next() => {
                match next {
                    Some(Some(result)) => return Some(result),
                    Some(None) => continue,
                    None => return None,
                }
            }
        }
    }
}
