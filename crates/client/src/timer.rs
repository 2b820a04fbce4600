//! Time source injected into the connection manager.
//!
//! Backoff, heartbeat, connect timeouts and the rate window all read time
//! through [`Timer`], so tests can swap in a controllable clock. The default
//! [`TokioTimer`] also cooperates with tokio's paused test clock.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::time::Instant;

pub trait Timer: Send + Sync + 'static {
    /// Monotonic "now" used for windows and deadlines.
    fn now(&self) -> Instant;

    /// Future that resolves once `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// [`Timer`] backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}
