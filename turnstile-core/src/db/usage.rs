use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UsageMetricType {
    ApiCall,
    Reading,
    Session,
    Error,
}

impl UsageMetricType {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageMetricType::ApiCall => "api_call",
            UsageMetricType::Reading => "reading",
            UsageMetricType::Session => "session",
            UsageMetricType::Error => "error",
        }
    }
}

/// Append-only. Never updated or deleted once written.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub metric_type: UsageMetricType,
    pub recorded_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait UsageQueries: Send + Sync {
    async fn insert_usage_event(&self, event: &UsageEvent) -> Result<(), Error>;

    async fn count_usage_events_since(
        &self,
        organization_id: Uuid,
        metric_type: UsageMetricType,
        since: DateTime<Utc>,
    ) -> Result<u64, Error>;
}
