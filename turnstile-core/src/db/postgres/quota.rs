use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use super::RelationalPool;
use crate::db::quota::{QuotaQueries, QuotaRecord};
use crate::error::Error;
use crate::quota::MeteredAction;

fn quota_record_from_row(row: &PgRow) -> Result<QuotaRecord, Error> {
    Ok(QuotaRecord {
        user_id: row.try_get("user_id")?,
        monthly_limit: row.try_get("monthly_limit")?,
        readings_this_month: row.try_get("readings_this_month")?,
        reset_date: row.try_get("reset_date")?,
        llm_calls_this_month: row.try_get("llm_calls_this_month")?,
        llm_calls_limit: row.try_get("llm_calls_limit")?,
    })
}

impl RelationalPool {
    async fn fetch_quota_record(&self, user_id: Uuid) -> Result<QuotaRecord, Error> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query(
            r"
            SELECT user_id, monthly_limit, readings_this_month, reset_date, llm_calls_this_month, llm_calls_limit
            FROM quota_records
            WHERE user_id = $1
            ",
        )
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await?;
        quota_record_from_row(&row)
    }
}

#[async_trait]
impl QuotaQueries for RelationalPool {
    async fn has_active_subscription(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query(
            r"
            SELECT EXISTS (
                SELECT 1 FROM subscriptions
                WHERE user_id = $1
                  AND status IN ('active', 'trialing')
                  AND (current_period_end IS NULL OR current_period_end > $2)
            ) AS active
            ",
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
        Ok(row.try_get("active")?)
    }

    /// Uses `ON CONFLICT DO NOTHING` to handle races, then re-reads the winner.
    async fn get_or_create_quota_record(
        &self,
        defaults: &QuotaRecord,
    ) -> Result<QuotaRecord, Error> {
        {
            let mut conn = self.acquire().await?;
            sqlx::query(
                r"
                INSERT INTO quota_records
                    (user_id, monthly_limit, readings_this_month, reset_date, llm_calls_this_month, llm_calls_limit)
                VALUES ($1, $2, 0, $3, 0, $4)
                ON CONFLICT (user_id) DO NOTHING
                ",
            )
            .bind(defaults.user_id)
            .bind(defaults.monthly_limit)
            .bind(defaults.reset_date)
            .bind(defaults.llm_calls_limit)
            .execute(&mut *conn)
            .await?;
        }
        self.fetch_quota_record(defaults.user_id).await
    }

    async fn reset_quota_record_if_due(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        next_reset_date: DateTime<Utc>,
    ) -> Result<QuotaRecord, Error> {
        {
            let mut conn = self.acquire().await?;
            sqlx::query(
                r"
                UPDATE quota_records
                SET readings_this_month = 0,
                    llm_calls_this_month = 0,
                    reset_date = $3,
                    updated_at = NOW()
                WHERE user_id = $1 AND reset_date <= $2
                ",
            )
            .bind(user_id)
            .bind(now)
            .bind(next_reset_date)
            .execute(&mut *conn)
            .await?;
        }
        self.fetch_quota_record(user_id).await
    }

    async fn increment_quota_usage(
        &self,
        user_id: Uuid,
        action: MeteredAction,
    ) -> Result<(), Error> {
        let query = match action {
            MeteredAction::Reading => {
                "UPDATE quota_records SET readings_this_month = readings_this_month + 1, updated_at = NOW() WHERE user_id = $1"
            }
            MeteredAction::LlmCall => {
                "UPDATE quota_records SET llm_calls_this_month = llm_calls_this_month + 1, updated_at = NOW() WHERE user_id = $1"
            }
        };
        let mut conn = self.acquire().await?;
        let result = sqlx::query(query).bind(user_id).execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            tracing::warn!(%user_id, "No quota record to increment");
        }
        Ok(())
    }

    async fn reset_due_quota_records(
        &self,
        now: DateTime<Utc>,
        next_reset_date: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;
        let result = sqlx::query(
            r"
            UPDATE quota_records
            SET readings_this_month = 0,
                llm_calls_this_month = 0,
                reset_date = $2,
                updated_at = NOW()
            WHERE reset_date <= $1
            ",
        )
        .bind(now)
        .bind(next_reset_date)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }
}
