//! Usage metering. Every request that resolves to an organization produces usage
//! events after its response is built. Writes are best-effort: a failed write is
//! logged and counted, and never affects the response.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use chrono::Utc;
use metrics::counter;
use serde_json::json;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::MeteringConfig;
use crate::db::usage::{UsageEvent, UsageMetricType, UsageQueries};
use crate::identity::ClientIdentity;
use crate::rate_limiting::endpoint_class::prefix_matches;

/// What the metering recorder needs to know about a finished request
#[derive(Clone, Debug)]
pub struct RequestOutcome {
    pub method: Method,
    pub path: String,
    pub status: StatusCode,
    pub elapsed: Duration,
    /// The layer that denied the request, if a rate limit did
    pub rate_limit_layer: Option<String>,
}

/// Who a usage event is billed to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BillingTarget {
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
}

impl BillingTarget {
    pub fn for_identity(identity: &ClientIdentity) -> Option<Self> {
        Some(Self {
            organization_id: identity.resolved_org_id()?,
            user_id: identity.resolved_user_id(),
            api_key_id: identity.api_key_id(),
        })
    }
}

#[derive(Clone)]
pub struct UsageRecorder {
    queries: Arc<dyn UsageQueries>,
    config: Arc<MeteringConfig>,
    tasks: TaskTracker,
}

impl UsageRecorder {
    pub fn new(queries: Arc<dyn UsageQueries>, config: MeteringConfig, tasks: TaskTracker) -> Self {
        Self {
            queries,
            config: Arc::new(config),
            tasks,
        }
    }

    /// Writes the request's usage events in the background. No-op when the caller
    /// did not resolve to an organization.
    pub fn record(&self, identity: &ClientIdentity, outcome: RequestOutcome) {
        if !self.config.enabled {
            return;
        }
        let Some(target) = BillingTarget::for_identity(identity) else {
            return;
        };
        let recorder = self.clone();
        self.tasks.spawn(async move {
            recorder.write_events(target, &outcome).await;
        });
    }

    fn is_streaming(&self, path: &str) -> bool {
        self.config
            .streaming_prefixes
            .iter()
            .any(|prefix| prefix_matches(prefix, path))
    }

    fn is_reading_creation(&self, outcome: &RequestOutcome) -> bool {
        outcome.status == StatusCode::CREATED
            && outcome.method.as_str() == self.config.reading_method
            && outcome.path == self.config.reading_path
    }

    /// Writes every event the outcome calls for and returns how many were stored
    #[tracing::instrument(skip_all, fields(organization_id = %target.organization_id, path = %outcome.path))]
    pub async fn write_events(&self, target: BillingTarget, outcome: &RequestOutcome) -> usize {
        let mut written = 0;

        let mut metadata = json!({
            "endpoint": outcome.path,
            "method": outcome.method.as_str(),
            "status": outcome.status.as_u16(),
            "elapsed_ms": u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
        });
        if let Some(api_key_id) = target.api_key_id {
            metadata["api_key_id"] = json!(api_key_id);
        }
        written += self.write(target, UsageMetricType::ApiCall, metadata).await;

        if outcome.status.is_success() && self.is_streaming(&outcome.path) {
            let since = Utc::now()
                - chrono::Duration::minutes(i64::from(self.config.session_window_minutes));
            match self
                .queries
                .count_usage_events_since(target.organization_id, UsageMetricType::Session, since)
                .await
            {
                Ok(active) => {
                    let metadata = json!({
                        "endpoint": outcome.path,
                        "concurrent_count": active + 1,
                    });
                    written += self.write(target, UsageMetricType::Session, metadata).await;
                }
                Err(e) => {
                    tracing::warn!("Failed to count active sessions: {e}");
                    counter!("turnstile_usage_event_failures_total").increment(1);
                }
            }
        }

        if self.is_reading_creation(outcome) {
            let metadata = json!({
                "endpoint": outcome.path,
                "status": outcome.status.as_u16(),
            });
            written += self.write(target, UsageMetricType::Reading, metadata).await;
        }

        if outcome.status == StatusCode::TOO_MANY_REQUESTS {
            let mut metadata = json!({
                "error": "rate_limit_exceeded",
                "endpoint": outcome.path,
            });
            if let Some(layer) = &outcome.rate_limit_layer {
                metadata["layer"] = json!(layer);
            }
            written += self.write(target, UsageMetricType::Error, metadata).await;
        }

        written
    }

    async fn write(
        &self,
        target: BillingTarget,
        metric_type: UsageMetricType,
        metadata: serde_json::Value,
    ) -> usize {
        let event = UsageEvent {
            id: Uuid::now_v7(),
            organization_id: target.organization_id,
            user_id: target.user_id,
            metric_type,
            recorded_at: Utc::now(),
            metadata,
        };
        match self.queries.insert_usage_event(&event).await {
            Ok(()) => {
                counter!("turnstile_usage_events_total", "metric_type" => metric_type.as_str())
                    .increment(1);
                1
            }
            Err(e) => {
                tracing::warn!(
                    metric_type = metric_type.as_str(),
                    "Failed to record usage event: {e}"
                );
                counter!("turnstile_usage_event_failures_total").increment(1);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::identity::CredentialOwner;
    use crate::identity::IdentityKind;
    use crate::testing::InMemoryUsageStore;

    fn outcome(method: Method, path: &str, status: StatusCode) -> RequestOutcome {
        RequestOutcome {
            method,
            path: path.to_string(),
            status,
            elapsed: Duration::from_millis(42),
            rate_limit_layer: None,
        }
    }

    fn target() -> BillingTarget {
        BillingTarget {
            organization_id: Uuid::now_v7(),
            user_id: Some(Uuid::now_v7()),
            api_key_id: Some(Uuid::now_v7()),
        }
    }

    fn recorder(store: &Arc<InMemoryUsageStore>) -> UsageRecorder {
        UsageRecorder::new(store.clone(), MeteringConfig::default(), TaskTracker::new())
    }

    #[tokio::test]
    async fn test_generic_call_writes_one_api_call_event() {
        let store = Arc::new(InMemoryUsageStore::new());
        let target = target();
        let written = recorder(&store)
            .write_events(target, &outcome(Method::GET, "/api/v1/cards", StatusCode::OK))
            .await;
        assert_eq!(written, 1);

        let events = store.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.metric_type, UsageMetricType::ApiCall);
        assert_eq!(event.organization_id, target.organization_id);
        assert_eq!(event.user_id, target.user_id);
        assert_eq!(event.metadata["endpoint"], "/api/v1/cards");
        assert_eq!(event.metadata["method"], "GET");
        assert_eq!(event.metadata["status"], 200);
        assert_eq!(event.metadata["elapsed_ms"], 42);
        assert_eq!(
            event.metadata["api_key_id"],
            json!(target.api_key_id.unwrap())
        );
    }

    #[tokio::test]
    async fn test_sessions_count_recent_sessions() {
        let store = Arc::new(InMemoryUsageStore::new());
        let recorder = recorder(&store);
        let target = target();
        let stream = outcome(Method::GET, "/api/v1/seance/stream", StatusCode::OK);

        for expected in 1..=3 {
            assert_eq!(recorder.write_events(target, &stream).await, 2);
            let sessions = store.events_of(UsageMetricType::Session);
            assert_eq!(sessions.last().unwrap().metadata["concurrent_count"], expected);
        }

        // Another organization's sessions are not counted
        let other = BillingTarget {
            organization_id: Uuid::now_v7(),
            ..target
        };
        recorder.write_events(other, &stream).await;
        let sessions = store.events_of(UsageMetricType::Session);
        assert_eq!(sessions.last().unwrap().metadata["concurrent_count"], 1);

        // Failed streaming requests are not sessions
        recorder
            .write_events(
                target,
                &outcome(Method::GET, "/api/v1/reading_sessions/4", StatusCode::NOT_FOUND),
            )
            .await;
        assert_eq!(store.events_of(UsageMetricType::Session).len(), 4);
    }

    #[tokio::test]
    async fn test_reading_event_only_on_creation() {
        let store = Arc::new(InMemoryUsageStore::new());
        let recorder = recorder(&store);
        let target = target();

        let created = outcome(Method::POST, "/api/v1/readings", StatusCode::CREATED);
        assert_eq!(recorder.write_events(target, &created).await, 2);
        let readings = store.events_of(UsageMetricType::Reading);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].metadata["status"], 201);

        recorder
            .write_events(target, &outcome(Method::POST, "/api/v1/readings", StatusCode::UNPROCESSABLE_ENTITY))
            .await;
        recorder
            .write_events(target, &outcome(Method::GET, "/api/v1/readings", StatusCode::OK))
            .await;
        assert_eq!(store.events_of(UsageMetricType::Reading).len(), 1);
        assert_eq!(store.events_of(UsageMetricType::ApiCall).len(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_violation_writes_error_event() {
        let store = Arc::new(InMemoryUsageStore::new());
        let denied = RequestOutcome {
            rate_limit_layer: Some("client_hourly".to_string()),
            ..outcome(Method::POST, "/api/v1/seance/messages", StatusCode::TOO_MANY_REQUESTS)
        };
        assert_eq!(recorder(&store).write_events(target(), &denied).await, 2);
        let errors = store.events_of(UsageMetricType::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].metadata["error"], "rate_limit_exceeded");
        assert_eq!(errors[0].metadata["layer"], "client_hourly");
        // A denied stream is not a session
        assert!(store.events_of(UsageMetricType::Session).is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        let store = Arc::new(InMemoryUsageStore::new());
        store.set_unavailable(true);
        let written = recorder(&store)
            .write_events(target(), &outcome(Method::GET, "/api/v1/seance", StatusCode::OK))
            .await;
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn test_record_skips_callers_without_organization() {
        let store = Arc::new(InMemoryUsageStore::new());
        let tasks = TaskTracker::new();
        let recorder = UsageRecorder::new(store.clone(), MeteringConfig::default(), tasks.clone());

        let anonymous = ClientIdentity::from_source_address("203.0.113.5");
        recorder.record(&anonymous, outcome(Method::GET, "/api/v1/cards", StatusCode::OK));

        let personal = ClientIdentity::resolved(
            IdentityKind::BearerToken,
            "token",
            "203.0.113.5".to_string(),
            CredentialOwner {
                user_id: Uuid::now_v7(),
                organization_id: None,
                api_key_id: None,
            },
        );
        recorder.record(&personal, outcome(Method::GET, "/api/v1/cards", StatusCode::OK));

        let member = ClientIdentity::resolved(
            IdentityKind::BearerToken,
            "token",
            "203.0.113.5".to_string(),
            CredentialOwner {
                user_id: Uuid::now_v7(),
                organization_id: Some(Uuid::now_v7()),
                api_key_id: None,
            },
        );
        recorder.record(&member, outcome(Method::GET, "/api/v1/cards", StatusCode::OK));

        tasks.close();
        tasks.wait().await;
        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].organization_id, member.resolved_org_id().unwrap());
        assert!(events[0].metadata.get("api_key_id").is_none());
    }
}
