//! Background sampling of connection pool health.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::db::{MonitoredPool, PoolStats};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    Healthy,
    /// Utilization is at or above the warning ratio
    Elevated,
    /// Every connection is checked out and callers are waiting
    Saturated,
}

pub fn classify(stats: &PoolStats, saturation_warn_ratio: f64) -> PoolHealth {
    if stats.waiting > 0 && stats.in_use >= stats.size {
        PoolHealth::Saturated
    } else if stats.utilization() >= saturation_warn_ratio {
        PoolHealth::Elevated
    } else {
        PoolHealth::Healthy
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoolSample {
    pub stats: PoolStats,
    pub health: PoolHealth,
    /// Connections reclaimed since the previous sample
    pub reclaimed: u64,
}

fn publish(stats: &PoolStats) {
    for (state, value) in [
        ("size", stats.size),
        ("in_use", stats.in_use),
        ("idle", stats.idle),
        ("waiting", stats.waiting),
    ] {
        gauge!("turnstile_pool_connections", "pool" => stats.pool.clone(), "state" => state)
            .set(f64::from(value));
    }
}

/// Samples every pool on an interval and refreshes idle connections less often.
///
/// Only ever touches connections that are idle in their pool, so it is safe to run
/// alongside live traffic. Reaping idle and expired connections is left to the pools.
pub struct HealthMonitor {
    pools: Vec<Arc<dyn MonitoredPool>>,
    last_reclaimed: Vec<u64>,
    interval: Duration,
    idle_probe_interval: Duration,
    saturation_warn_ratio: f64,
}

impl HealthMonitor {
    pub fn new(pools: Vec<Arc<dyn MonitoredPool>>, config: &HealthConfig) -> Self {
        let last_reclaimed = pools.iter().map(|pool| pool.reclaimed_total()).collect();
        Self {
            pools,
            last_reclaimed,
            interval: Duration::from_secs(config.interval_s),
            idle_probe_interval: Duration::from_secs(config.idle_probe_interval_s),
            saturation_warn_ratio: config.saturation_warn_ratio,
        }
    }

    pub fn sample_once(&mut self) -> Vec<PoolSample> {
        let mut samples = Vec::with_capacity(self.pools.len());
        for (pool, last_reclaimed) in self.pools.iter().zip(self.last_reclaimed.iter_mut()) {
            let stats = pool.stats();
            publish(&stats);

            let reclaimed_total = pool.reclaimed_total();
            let reclaimed = reclaimed_total.saturating_sub(*last_reclaimed);
            *last_reclaimed = reclaimed_total;
            if reclaimed > 0 {
                tracing::debug!(pool = %stats.pool, reclaimed, "Pool reclaimed connections");
                counter!("turnstile_pool_reclaimed_total", "pool" => stats.pool.clone())
                    .increment(reclaimed);
            }

            let health = classify(&stats, self.saturation_warn_ratio);
            match health {
                PoolHealth::Healthy => {}
                PoolHealth::Elevated => tracing::warn!(
                    pool = %stats.pool,
                    in_use = stats.in_use,
                    size = stats.size,
                    "Connection pool utilization is elevated"
                ),
                PoolHealth::Saturated => tracing::error!(
                    pool = %stats.pool,
                    size = stats.size,
                    waiting = stats.waiting,
                    "Connection pool is saturated"
                ),
            }
            samples.push(PoolSample {
                stats,
                health,
                reclaimed,
            });
        }
        samples
    }

    /// Validates the idle connections of every pool
    pub async fn refresh_idle(&self) {
        for pool in &self.pools {
            match pool.refresh_idle().await {
                Ok(refreshed) => {
                    tracing::debug!(pool = pool.name(), refreshed, "Refreshed idle connections");
                }
                Err(e) => {
                    tracing::warn!(pool = pool.name(), "Failed to refresh idle connections: {e}");
                }
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut sample = interval(self.interval);
        sample.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probe = interval_at(
            Instant::now() + self.idle_probe_interval,
            self.idle_probe_interval,
        );
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = sample.tick() => {
                    self.sample_once();
                }
                _ = probe.tick() => self.refresh_idle().await,
            }
        }
        tracing::debug!("Health monitor stopped");
    }
}
