use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::RelationalPool;
use crate::db::usage::{UsageEvent, UsageMetricType, UsageQueries};
use crate::error::Error;

#[async_trait]
impl UsageQueries for RelationalPool {
    async fn insert_usage_event(&self, event: &UsageEvent) -> Result<(), Error> {
        let mut conn = self.acquire().await?;
        sqlx::query(
            r"
            INSERT INTO usage_events (id, organization_id, user_id, metric_type, recorded_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(event.id)
        .bind(event.organization_id)
        .bind(event.user_id)
        .bind(event.metric_type.as_str())
        .bind(event.recorded_at)
        .bind(&event.metadata)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn count_usage_events_since(
        &self,
        organization_id: Uuid,
        metric_type: UsageMetricType,
        since: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;
        let row = sqlx::query(
            r"
            SELECT COUNT(*) AS event_count
            FROM usage_events
            WHERE organization_id = $1 AND metric_type = $2 AND recorded_at >= $3
            ",
        )
        .bind(organization_id)
        .bind(metric_type.as_str())
        .bind(since)
        .fetch_one(&mut *conn)
        .await?;
        let count: i64 = row.try_get("event_count")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
