//! "First of" combinator over completion futures with an optional timeout.

use std::future::{pending, Future};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};

/// Result of [`first_of`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum First<T> {
    /// The first future to finish, with its output
    Completed(T),
    /// The timeout fired before any future finished
    TimedOut,
    /// There was nothing to race
    Empty,
}

/// Wait for whichever of `futures` finishes first, or for `timeout`.
///
/// Exactly one branch is selected. Futures are driven through a
/// [`FuturesUnordered`], so readiness is observed in wake order rather than by
/// slot. The timeout is raced with an unbiased `select!`. With no timeout the
/// race waits for the first completion indefinitely. Futures that lose are
/// dropped.
pub async fn first_of<I, F>(futures: I, timeout: Option<Duration>) -> First<F::Output>
where
    I: IntoIterator<Item = F>,
    F: Future,
{
    let mut racers: FuturesUnordered<F> = futures.into_iter().collect();
    if racers.is_empty() {
        return First::Empty;
    }

    let deadline = async move {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => pending::<()>().await,
        }
    };

    tokio::select! {
        Some(output) = racers.next() => First::Completed(output),
        _ = deadline => First::TimedOut,
    }
}
