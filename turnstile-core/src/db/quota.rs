use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::quota::MeteredAction;

/// One row per user. Counters only go up, except when a reset zeroes them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaRecord {
    pub user_id: Uuid,
    pub monthly_limit: i64,
    pub readings_this_month: i64,
    pub reset_date: DateTime<Utc>,
    pub llm_calls_this_month: i64,
    pub llm_calls_limit: i64,
}

impl QuotaRecord {
    pub fn new(
        user_id: Uuid,
        monthly_limit: i64,
        llm_calls_limit: i64,
        reset_date: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            monthly_limit,
            readings_this_month: 0,
            reset_date,
            llm_calls_this_month: 0,
            llm_calls_limit,
        }
    }

    pub fn used(&self, action: MeteredAction) -> i64 {
        match action {
            MeteredAction::Reading => self.readings_this_month,
            MeteredAction::LlmCall => self.llm_calls_this_month,
        }
    }

    pub fn limit(&self, action: MeteredAction) -> i64 {
        match action {
            MeteredAction::Reading => self.monthly_limit,
            MeteredAction::LlmCall => self.llm_calls_limit,
        }
    }

    pub fn is_reset_due(&self, now: DateTime<Utc>) -> bool {
        self.reset_date <= now
    }
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait QuotaQueries: Send + Sync {
    /// A subscription is active when its status is `active` or `trialing` and its
    /// current period has not ended.
    async fn has_active_subscription(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, Error>;

    /// Inserts `defaults` if the user has no record yet, then returns the stored record.
    /// Concurrent creators converge on a single row.
    async fn get_or_create_quota_record(&self, defaults: &QuotaRecord)
    -> Result<QuotaRecord, Error>;

    /// Zeroes the counters and sets `reset_date` to `next_reset_date`, but only if the
    /// record is still due at `now`, so concurrent resetters reset at most once.
    /// Returns the record as stored afterwards.
    async fn reset_quota_record_if_due(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        next_reset_date: DateTime<Utc>,
    ) -> Result<QuotaRecord, Error>;

    /// Atomically adds one to the counter for `action`
    async fn increment_quota_usage(&self, user_id: Uuid, action: MeteredAction)
    -> Result<(), Error>;

    /// Resets every record that is due at `now`. Returns how many were reset.
    async fn reset_due_quota_records(
        &self,
        now: DateTime<Utc>,
        next_reset_date: DateTime<Utc>,
    ) -> Result<u64, Error>;
}
