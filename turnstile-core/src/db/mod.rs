use async_trait::async_trait;

use crate::error::Error;

pub mod counters;
pub mod identity;
pub mod pool;
pub mod postgres;
pub mod quota;
pub mod usage;
pub mod valkey;

pub use pool::PoolStats;

#[async_trait]
pub trait HealthCheckable {
    async fn health(&self) -> Result<(), Error>;
}

/// A connection pool the Health Monitor and the diagnostics endpoint can inspect.
///
/// Implementations must only ever touch connections that are idle in the pool.
#[async_trait]
pub trait MonitoredPool: Send + Sync {
    fn name(&self) -> &str;

    fn stats(&self) -> PoolStats;

    /// Total connections closed by the pool for exceeding their idle timeout or max lifetime
    fn reclaimed_total(&self) -> u64;

    /// Validates idle connections, replacing any that fail validation.
    /// Returns the number of connections that were checked.
    async fn refresh_idle(&self) -> Result<usize, Error>;
}
