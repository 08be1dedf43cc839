use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;

/// State of one fixed-window counter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowState {
    pub count: u64,
    /// Time until the window expires and the counter starts over
    pub ttl: Duration,
}

/// Atomic counters shared by every worker process.
///
/// No in-process state is used for correctness: workers do not share memory, so every
/// decision is made from the store's answer.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait CounterStore: Send + Sync {
    /// Reads a window without modifying it. Implementations may answer from a replica,
    /// so the count can lag slightly behind concurrent increments.
    async fn read_window(&self, key: &str) -> Result<Option<WindowState>, Error>;

    /// Creates the window with `count = 1` and the given expiry, or increments it.
    /// An increment never extends the expiry.
    async fn hit_window(&self, key: &str, window: Duration) -> Result<WindowState, Error>;

    async fn try_acquire_lock(&self, key: &str, token: &str, ttl: Duration)
    -> Result<bool, Error>;

    /// Releases the lock only if it is still held with `token`
    async fn release_lock(&self, key: &str, token: &str) -> Result<(), Error>;
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
