use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::counters::CounterStore;
use crate::db::quota::QuotaQueries;
use crate::error::Error;
use crate::quota::next_reset_date;

pub const QUOTA_RESET_LOCK_KEY: &str = "lock:quota_reset_sweep";

/// Periodically resets every quota record whose reset date has passed.
///
/// Enforcement resets due records lazily as well, so the sweep only keeps
/// counters of inactive users accurate. Worker processes share a lock in the
/// background counter store, so one sweep runs at a time.
pub struct QuotaResetJob {
    queries: Arc<dyn QuotaQueries>,
    locks: Arc<dyn CounterStore>,
    interval: Duration,
}

impl QuotaResetJob {
    pub fn new(
        queries: Arc<dyn QuotaQueries>,
        locks: Arc<dyn CounterStore>,
        interval: Duration,
    ) -> Self {
        Self {
            queries,
            locks,
            interval,
        }
    }

    /// Returns the number of records reset, or `None` when another process holds the lock
    #[tracing::instrument(skip_all)]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Option<u64>, Error> {
        let token = Uuid::now_v7().to_string();
        if !self
            .locks
            .try_acquire_lock(QUOTA_RESET_LOCK_KEY, &token, self.interval)
            .await?
        {
            tracing::debug!("Quota reset sweep is running elsewhere");
            return Ok(None);
        }
        let result = self
            .queries
            .reset_due_quota_records(now, next_reset_date(now))
            .await;
        if let Err(e) = self.locks.release_lock(QUOTA_RESET_LOCK_KEY, &token).await {
            tracing::warn!("Failed to release the quota reset lock: {e}");
        }
        let reset = result?;
        if reset > 0 {
            tracing::info!(reset, "Reset quota records");
        }
        Ok(Some(reset))
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    // Errors are logged when they are created
                    let _ = self.run_once(Utc::now()).await;
                }
            }
        }
        tracing::debug!("Quota reset sweep stopped");
    }
}
