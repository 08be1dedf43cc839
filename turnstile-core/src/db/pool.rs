//! Fixed-capacity connection pools with a bounded checkout.
//!
//! Sizing is computed from the deployment shape rather than hand-tuned, because every
//! worker process shares one backing store instance.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bb8::{ErrorSink, ManageConnection, PooledConnection, RunError};
use serde::Serialize;

use crate::config::PoolConfig;
use crate::db::MonitoredPool;
use crate::error::{Error, ErrorDetails};

/// Longest a refresh waits for one connection before giving up on the cycle
const REFRESH_CHECKOUT_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSizing {
    pub worker_count: u32,
    pub threads_per_worker: u32,
    pub background_concurrency: u32,
    pub fixed_buffer: u32,
    pub min_floor: u32,
    pub max_ceiling: u32,
}

impl PoolSizing {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            threads_per_worker: config.threads_per_worker,
            background_concurrency: config.background_concurrency,
            fixed_buffer: config.fixed_buffer,
            min_floor: config.min_floor,
            max_ceiling: config.max_ceiling,
        }
    }

    /// `clamp(worker_count * threads_per_worker + background_concurrency / 2 + fixed_buffer, min_floor, max_ceiling)`
    pub fn foreground_size(&self) -> u32 {
        let wanted = self
            .worker_count
            .saturating_mul(self.threads_per_worker)
            .saturating_add(self.background_concurrency / 2)
            .saturating_add(self.fixed_buffer);
        self.clamp(wanted)
    }

    /// Size of the background-job partition: `clamp(background_concurrency + fixed_buffer, min_floor, max_ceiling)`
    pub fn background_size(&self) -> u32 {
        self.clamp(
            self.background_concurrency
                .saturating_add(self.fixed_buffer),
        )
    }

    fn clamp(&self, wanted: u32) -> u32 {
        wanted.max(self.min_floor).min(self.max_ceiling).max(1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolTimeouts {
    pub checkout: Duration,
    pub connect: Duration,
    pub idle: Duration,
    pub max_lifetime: Duration,
}

impl PoolTimeouts {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            checkout: Duration::from_millis(config.checkout_timeout_ms),
            connect: Duration::from_millis(config.connect_timeout_ms),
            idle: Duration::from_secs(config.idle_timeout_s),
            max_lifetime: Duration::from_secs(config.max_lifetime_s),
        }
    }
}

/// Point-in-time snapshot of a pool. `size` is the configured capacity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pool: String,
    pub size: u32,
    pub in_use: u32,
    pub idle: u32,
    pub waiting: u32,
}

impl PoolStats {
    pub fn utilization(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        f64::from(self.in_use) / f64::from(self.size)
    }
}

/// Counts callers currently blocked in a checkout
pub(crate) struct WaitingGuard<'a>(&'a AtomicU32);

impl<'a> WaitingGuard<'a> {
    pub(crate) fn new(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug)]
struct LoggingErrorSink {
    pool: String,
}

impl<E: Display + Send + 'static> ErrorSink<E> for LoggingErrorSink {
    fn sink(&self, error: E) {
        tracing::warn!(pool = %self.pool, "Failed to open a pooled connection: {error}");
    }

    fn boxed_clone(&self) -> Box<dyn ErrorSink<E>> {
        Box::new(self.clone())
    }
}

/// A named `bb8` pool whose checkouts fail with `PoolCheckoutTimeout` instead of waiting forever.
pub struct ManagedPool<M: ManageConnection> {
    name: String,
    pool: bb8::Pool<M>,
    size: u32,
    checkout_timeout: Duration,
    waiting: Arc<AtomicU32>,
}

impl<M> ManagedPool<M>
where
    M: ManageConnection,
    M::Error: Display,
{
    fn builder(name: &str, size: u32, timeouts: &PoolTimeouts) -> bb8::Builder<M> {
        bb8::Pool::builder()
            .max_size(size)
            .connection_timeout(timeouts.checkout)
            .idle_timeout(Some(timeouts.idle))
            .max_lifetime(Some(timeouts.max_lifetime))
            .test_on_check_out(true)
            .retry_connection(false)
            .error_sink(Box::new(LoggingErrorSink {
                pool: name.to_string(),
            }))
    }

    /// Builds the pool and opens one connection, so an unreachable store fails startup.
    pub async fn connect(
        name: &str,
        manager: M,
        size: u32,
        timeouts: &PoolTimeouts,
    ) -> Result<Self, Error> {
        let pool = Self::builder(name, size, timeouts)
            .min_idle(Some(1))
            .build(manager)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::CounterStoreConnection {
                    pool: name.to_string(),
                    message: e.to_string(),
                })
            })?;
        Ok(Self::from_pool(name, pool, size, timeouts))
    }

    /// Builds the pool without opening any connection up front.
    pub fn connect_lazy(name: &str, manager: M, size: u32, timeouts: &PoolTimeouts) -> Self {
        let pool = Self::builder(name, size, timeouts).build_unchecked(manager);
        Self::from_pool(name, pool, size, timeouts)
    }

    fn from_pool(name: &str, pool: bb8::Pool<M>, size: u32, timeouts: &PoolTimeouts) -> Self {
        Self {
            name: name.to_string(),
            pool,
            size,
            checkout_timeout: timeouts.checkout,
            waiting: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Checks out a validated connection. The connection goes back to the pool when dropped.
    pub async fn checkout(&self) -> Result<PooledConnection<'_, M>, Error> {
        let _waiting = WaitingGuard::new(&self.waiting);
        self.pool.get().await.map_err(|e| self.checkout_error(e))
    }

    fn checkout_error(&self, error: RunError<M::Error>) -> Error {
        match error {
            RunError::TimedOut => Error::new(ErrorDetails::PoolCheckoutTimeout {
                pool: self.name.clone(),
                timeout_ms: u64::try_from(self.checkout_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RunError::User(e) => Error::new(ErrorDetails::CounterStoreConnection {
                pool: self.name.clone(),
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl<M> MonitoredPool for ManagedPool<M>
where
    M: ManageConnection,
    M::Error: Display,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            pool: self.name.clone(),
            size: self.size,
            in_use: state.connections.saturating_sub(state.idle_connections),
            idle: state.idle_connections,
            waiting: self.waiting.load(Ordering::Relaxed),
        }
    }

    fn reclaimed_total(&self) -> u64 {
        let statistics = self.pool.state().statistics;
        statistics.connections_closed_idle_timeout + statistics.connections_closed_max_lifetime
    }

    /// Cycles through the idle connections one at a time. With `test_on_check_out`, every
    /// checkout validates the connection and replaces it if it is broken.
    async fn refresh_idle(&self) -> Result<usize, Error> {
        let idle = self.pool.state().idle_connections;
        let wait = self.checkout_timeout.min(REFRESH_CHECKOUT_TIMEOUT);
        let mut refreshed = 0;
        for _ in 0..idle {
            if self.pool.state().idle_connections == 0 {
                break;
            }
            // Live traffic can take the last idle connection between the check and the
            // checkout. Never queue behind it for the full checkout timeout.
            match tokio::time::timeout(wait, self.pool.get()).await {
                Ok(connection) => drop(connection.map_err(|e| self.checkout_error(e))?),
                Err(_) => {
                    tracing::debug!(pool = %self.name, refreshed, "No idle connection available, ending refresh");
                    break;
                }
            }
            refreshed += 1;
        }
        Ok(refreshed)
    }
}
