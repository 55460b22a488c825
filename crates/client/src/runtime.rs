//! Task spawning and timers for both targets.
//!
//! The browser build runs everything on the page's event loop through
//! `spawn_local`, so spawned futures need not be `Send` there; native builds
//! use the ambient tokio runtime and require it.

use std::future::Future;
use std::time::Duration;

use futures_util::future::{select, Either};

#[cfg(not(target_arch = "wasm32"))]
pub fn spawn<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(fut);
}

#[cfg(target_arch = "wasm32")]
pub fn spawn<F>(fut: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(fut);
}

#[cfg(not(target_arch = "wasm32"))]
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[cfg(target_arch = "wasm32")]
pub async fn sleep(duration: Duration) {
    gloo_timers::future::sleep(duration).await;
}

/// Resolve `fut`, or `None` once `limit` elapses first.
pub async fn timeout<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    let fut = std::pin::pin!(fut);
    let delay = std::pin::pin!(sleep(limit));
    match select(fut, delay).await {
        Either::Left((output, _)) => Some(output),
        Either::Right(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_prefers_the_faster_side() {
        assert_eq!(timeout(Duration::from_secs(5), async { 7 }).await, Some(7));
        let never = futures_util::future::pending::<()>();
        assert_eq!(timeout(Duration::from_millis(5), never).await, None);
    }
}
