use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, migrate};
use tokio::time::timeout;

use crate::db::pool::{PoolStats, PoolTimeouts, WaitingGuard};
use crate::db::{HealthCheckable, MonitoredPool};
use crate::error::{Error, ErrorDetails};

mod identity;
mod quota;
mod usage;

pub const RELATIONAL_POOL_NAME: &str = "relational";

const HEALTH_CHECK_TIMEOUT_MS: u64 = 1000;

/// The relational store pool. Every acquisition goes through `acquire`, so callers
/// waiting for a connection can be counted and time out with a `PoolCheckoutTimeout`.
pub struct RelationalPool {
    pool: PgPool,
    size: u32,
    acquire_timeout: Duration,
    waiting: AtomicU32,
    opened: Arc<AtomicU64>,
}

impl RelationalPool {
    fn options(size: u32, timeouts: &PoolTimeouts, opened: &Arc<AtomicU64>) -> PgPoolOptions {
        let opened = opened.clone();
        PgPoolOptions::new()
            .max_connections(size)
            .min_connections(0)
            .acquire_timeout(timeouts.checkout)
            .idle_timeout(Some(timeouts.idle))
            .max_lifetime(Some(timeouts.max_lifetime))
            .test_before_acquire(true)
            .after_connect(move |_conn, _meta| {
                opened.fetch_add(1, Ordering::Relaxed);
                Box::pin(async { Ok(()) })
            })
    }

    /// Connects eagerly, so an unreachable database fails startup
    pub async fn connect(
        url: &SecretString,
        size: u32,
        timeouts: &PoolTimeouts,
    ) -> Result<Self, Error> {
        let opened = Arc::new(AtomicU64::new(0));
        let pool = Self::options(size, timeouts, &opened)
            .connect(url.expose_secret())
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::PostgresConnectionInitialization {
                    message: e.to_string(),
                })
            })?;
        Ok(Self::from_pool(pool, size, timeouts, opened))
    }

    pub fn connect_lazy(
        url: &SecretString,
        size: u32,
        timeouts: &PoolTimeouts,
    ) -> Result<Self, Error> {
        let opened = Arc::new(AtomicU64::new(0));
        let pool = Self::options(size, timeouts, &opened)
            .connect_lazy(url.expose_secret())
            .map_err(|e| {
                Error::new(ErrorDetails::PostgresConnectionInitialization {
                    message: e.to_string(),
                })
            })?;
        Ok(Self::from_pool(pool, size, timeouts, opened))
    }

    fn from_pool(pool: PgPool, size: u32, timeouts: &PoolTimeouts, opened: Arc<AtomicU64>) -> Self {
        Self {
            pool,
            size,
            acquire_timeout: timeouts.checkout,
            waiting: AtomicU32::new(0),
            opened,
        }
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>, Error> {
        let _waiting = WaitingGuard::new(&self.waiting);
        self.pool.acquire().await.map_err(|e| match e {
            sqlx::Error::PoolTimedOut => Error::new(ErrorDetails::PoolCheckoutTimeout {
                pool: RELATIONAL_POOL_NAME.to_string(),
                timeout_ms: u64::try_from(self.acquire_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            e => Error::from(e),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MonitoredPool for RelationalPool {
    fn name(&self) -> &str {
        RELATIONAL_POOL_NAME
    }

    fn stats(&self) -> PoolStats {
        let open = self.pool.size();
        let idle = u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX);
        PoolStats {
            pool: RELATIONAL_POOL_NAME.to_string(),
            size: self.size,
            in_use: open.saturating_sub(idle),
            idle,
            waiting: self.waiting.load(Ordering::Relaxed),
        }
    }

    /// Connections the pool has closed, whether for idleness, age, or failing validation
    fn reclaimed_total(&self) -> u64 {
        self.opened
            .load(Ordering::Relaxed)
            .saturating_sub(u64::from(self.pool.size()))
    }

    /// `test_before_acquire` pings each connection as it is handed out and replaces it
    /// if the ping fails
    async fn refresh_idle(&self) -> Result<usize, Error> {
        let idle = self.pool.num_idle();
        let mut refreshed = 0;
        for _ in 0..idle {
            if self.pool.num_idle() == 0 {
                break;
            }
            drop(self.acquire().await?);
            refreshed += 1;
        }
        Ok(refreshed)
    }
}

#[async_trait]
impl HealthCheckable for RelationalPool {
    async fn health(&self) -> Result<(), Error> {
        let check = async {
            let mut conn = self.acquire().await?;
            sqlx::query("SELECT 1").execute(&mut *conn).await?;
            Ok::<(), Error>(())
        };
        match timeout(Duration::from_millis(HEALTH_CHECK_TIMEOUT_MS), check).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorDetails::PostgresQuery {
                function_name: None,
                message: "Postgres health check timed out".to_string(),
            })),
        }
    }
}

pub async fn manual_run_postgres_migrations(postgres_url: &SecretString) -> Result<(), Error> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(postgres_url.expose_secret())
        .await
        .map_err(|err| {
            Error::new(ErrorDetails::PostgresConnectionInitialization {
                message: err.to_string(),
            })
        })?;
    let result = migrate!("src/db/postgres/migrations")
        .run(&pool)
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::PostgresMigration {
                message: e.to_string(),
            })
        });
    pool.close().await;
    result
}
