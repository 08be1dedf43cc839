//! Layered fixed-window rate limiting.
//!
//! The default configuration runs two layers: a coarse IP-keyed layer over every path
//! and a finer identity-keyed layer with per-class limits. The IP layer still protects
//! when identity resolution degrades to the caller's address. Both are evaluated for
//! every request and either can deny it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;

use crate::config::RateLimitingConfig;
use crate::db::counters::CounterStore;
use crate::error::{Error, ErrorDetails};
use crate::identity::ClientIdentity;

pub mod endpoint_class;
pub mod headers;
pub mod layer;

pub use headers::RateLimitHeaders;
pub use layer::FixedWindowLayer;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub layer: String,
    pub endpoint_class: String,
    pub allowed: bool,
    pub limit: u64,
    /// The window's count after this request
    pub count: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    pub fn headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining,
            reset_at: self.reset_at,
        }
    }

    pub fn to_error(&self) -> Error {
        Error::new(ErrorDetails::RateLimitExceeded {
            layer: self.layer.clone(),
            endpoint_class: self.endpoint_class.clone(),
            limit: self.limit,
            reset_at: self.reset_at,
            retry_after_secs: self.retry_after_secs,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayerOutcome {
    /// No endpoint class of this layer applies to the path
    Skipped,
    Decided(RateLimitDecision),
    /// The counter store failed and the layer is configured to fail open
    Degraded,
}

/// One independently configured rate limit layer
#[async_trait]
pub trait RateLimitPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Counts this request against the caller's window for the path's endpoint class.
    /// Returns an error only when the store failed and the layer fails closed.
    async fn check_and_increment(
        &self,
        identity: &ClientIdentity,
        path: &str,
    ) -> Result<LayerOutcome, Error>;
}

/// The combined outcome of every layer for one request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RateLimitVerdict {
    decisions: Vec<RateLimitDecision>,
}

impl RateLimitVerdict {
    pub fn decisions(&self) -> &[RateLimitDecision] {
        &self.decisions
    }

    /// The first denying layer, in configuration order
    pub fn denial(&self) -> Option<&RateLimitDecision> {
        self.decisions.iter().find(|decision| !decision.allowed)
    }

    /// Headers for the response: the denying layer's, otherwise those of the layer
    /// with the fewest requests remaining
    pub fn headers(&self) -> Option<RateLimitHeaders> {
        self.denial()
            .or_else(|| {
                self.decisions
                    .iter()
                    .min_by_key(|decision| (decision.remaining, decision.reset_at))
            })
            .map(RateLimitDecision::headers)
    }
}

pub struct RateLimiter {
    layers: Vec<Arc<dyn RateLimitPolicy>>,
}

impl RateLimiter {
    pub fn new(layers: Vec<Arc<dyn RateLimitPolicy>>) -> Self {
        Self { layers }
    }

    pub fn from_config(config: &RateLimitingConfig, store: &Arc<dyn CounterStore>) -> Self {
        if !config.enabled {
            tracing::warn!("Rate limiting is disabled");
            return Self::new(Vec::new());
        }
        let layers = config
            .layers
            .iter()
            .map(|layer| Arc::new(FixedWindowLayer::new(layer, store.clone())) as Arc<dyn RateLimitPolicy>)
            .collect();
        Self::new(layers)
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }

    /// Evaluates every layer concurrently. A fail-closed layer whose store is
    /// unavailable fails the whole check.
    pub async fn check(
        &self,
        identity: &ClientIdentity,
        path: &str,
    ) -> Result<RateLimitVerdict, Error> {
        let outcomes = join_all(
            self.layers
                .iter()
                .map(|layer| layer.check_and_increment(identity, path)),
        )
        .await;
        let mut decisions = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            if let LayerOutcome::Decided(decision) = outcome? {
                decisions.push(decision);
            }
        }
        Ok(RateLimitVerdict { decisions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailureMode;
    use crate::db::counters::MockCounterStore;
    use crate::db::pool::{ManagedPool, PoolTimeouts};
    use crate::db::valkey::ValkeyCounterStore;
    use crate::db::valkey::test_helpers::{ScriptedConnection, ScriptedManager, connection_error};
    use crate::testing::InMemoryCounterStore;
    use std::time::Duration;

    fn decision(layer: &str, allowed: bool, limit: u64, remaining: u64) -> RateLimitDecision {
        RateLimitDecision {
            layer: layer.to_string(),
            endpoint_class: "general".to_string(),
            allowed,
            limit,
            count: limit.saturating_sub(remaining),
            remaining,
            reset_at: Utc::now(),
            retry_after_secs: 60,
        }
    }

    #[test]
    fn test_headers_come_from_most_restrictive_layer() {
        let verdict = RateLimitVerdict {
            decisions: vec![
                decision("ip_burst", true, 300, 250),
                decision("client_hourly", true, 30, 3),
            ],
        };
        assert!(verdict.denial().is_none());
        assert_eq!(verdict.headers().unwrap().remaining, 3);
        assert_eq!(verdict.headers().unwrap().limit, 30);

        let verdict = RateLimitVerdict {
            decisions: vec![
                decision("ip_burst", false, 300, 0),
                decision("client_hourly", true, 30, 0),
            ],
        };
        assert_eq!(verdict.denial().unwrap().layer, "ip_burst");

        assert!(RateLimitVerdict::default().headers().is_none());
    }

    #[tokio::test]
    async fn test_both_default_layers_are_evaluated() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = RateLimiter::from_config(
            &RateLimitingConfig::default(),
            &(store.clone() as Arc<dyn CounterStore>),
        );
        assert_eq!(limiter.layer_names(), vec!["ip_burst", "client_hourly"]);

        let identity = ClientIdentity::from_source_address("203.0.113.5");
        let verdict = limiter.check(&identity, "/api/v1/seance").await.unwrap();
        assert_eq!(verdict.decisions().len(), 2);
        assert!(verdict.denial().is_none());
        // seance allows 30 per hour, the IP layer 300 per 5 minutes
        assert_eq!(verdict.headers().unwrap().limit, 30);
        assert_eq!(verdict.headers().unwrap().remaining, 29);
        assert_eq!(store.count("rate_limit:api_general:ip:203.0.113.5"), Some(1));
        assert_eq!(store.count("rate_limit:seance:ip:203.0.113.5"), Some(1));
    }

    #[tokio::test]
    async fn test_either_layer_can_deny() {
        let store = Arc::new(InMemoryCounterStore::new());
        let mut config = RateLimitingConfig::default();
        config.layers[0].classes[0].limit = 2;
        let limiter = RateLimiter::from_config(&config, &(store as Arc<dyn CounterStore>));
        let identity = ClientIdentity::from_source_address("198.51.100.7");

        for _ in 0..2 {
            let verdict = limiter.check(&identity, "/api/v1/cards").await.unwrap();
            assert!(verdict.denial().is_none());
        }
        let verdict = limiter.check(&identity, "/api/v1/cards").await.unwrap();
        let denial = verdict.denial().unwrap();
        assert_eq!(denial.layer, "ip_burst");
        assert_eq!(denial.endpoint_class, "api_general");
        assert_eq!(verdict.headers().unwrap().remaining, 0);

        let err = denial.to_error();
        assert_eq!(err.status_code(), axum::http::StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_disabled_limiter_has_no_layers() {
        let config = RateLimitingConfig {
            enabled: false,
            ..RateLimitingConfig::default()
        };
        let store: Arc<dyn CounterStore> = Arc::new(MockCounterStore::new());
        let limiter = RateLimiter::from_config(&config, &store);
        let verdict = limiter
            .check(&ClientIdentity::from_source_address("203.0.113.5"), "/api/v1/seance")
            .await
            .unwrap();
        assert_eq!(verdict, RateLimitVerdict::default());
    }

    #[tokio::test]
    async fn test_fail_closed_layer_fails_the_check() {
        let mut store = MockCounterStore::new();
        store.expect_read_window().returning(|_| {
            Box::pin(async {
                Err(Error::new(ErrorDetails::CounterStoreQuery {
                    message: "broken pipe".to_string(),
                }))
            })
        });
        let store: Arc<dyn CounterStore> = Arc::new(store);
        let mut config = RateLimitingConfig::default();
        config.layers[1].failure_mode = FailureMode::FailOpen;
        let limiter = RateLimiter::from_config(&config, &store);

        let err = limiter
            .check(&ClientIdentity::from_source_address("203.0.113.5"), "/api/v1/cards")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
        assert!(matches!(
            err.get_details(),
            ErrorDetails::RateLimiterUnavailable { layer, .. } if layer == "ip_burst"
        ));

        // With both layers failing open the request goes through without headers
        config.layers[0].failure_mode = FailureMode::FailOpen;
        let limiter = RateLimiter::from_config(&config, &store);
        let verdict = limiter
            .check(&ClientIdentity::from_source_address("203.0.113.5"), "/api/v1/cards")
            .await
            .unwrap();
        assert!(verdict.headers().is_none());
    }

    #[tokio::test]
    async fn test_replica_failure_falls_back_to_primary() {
        let timeouts = PoolTimeouts {
            checkout: Duration::from_millis(500),
            connect: Duration::from_millis(500),
            idle: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
        };
        let key = "rate_limit:api_general:ip:203.0.113.5";
        let mut read = redis::cmd("FCALL_RO");
        read.arg("turnstile_window_read_v1").arg(1).arg(key);
        let mut hit = redis::cmd("FCALL");
        hit.arg("turnstile_window_hit_v1").arg(1).arg(key).arg(300_000u64);

        let replica = ScriptedConnection::new();
        replica.expect(&read, Err(connection_error()));
        let primary = ScriptedConnection::new();
        primary
            .expect_str(&read, r#"{"exists":true,"count":10,"ttl_ms":120000}"#)
            .expect_str(&hit, r#"{"count":11,"ttl_ms":119990}"#);

        let pool = |name: &str, connection: &ScriptedConnection| {
            Arc::new(ManagedPool::connect_lazy(
                name,
                ScriptedManager {
                    connection: connection.clone(),
                },
                2,
                &timeouts,
            ))
        };
        let store: Arc<dyn CounterStore> = Arc::new(ValkeyCounterStore::new(
            pool("counter_primary", &primary),
            Some(pool("counter_replica", &replica)),
        ));
        let mut config = RateLimitingConfig::default();
        config.layers.truncate(1);
        let limiter = RateLimiter::from_config(&config, &store);

        let verdict = limiter
            .check(&ClientIdentity::from_source_address("203.0.113.5"), "/api/v1/cards")
            .await
            .unwrap();
        assert!(verdict.denial().is_none());
        let headers = verdict.headers().unwrap();
        assert_eq!(headers.limit, 300);
        assert_eq!(headers.remaining, 289);
        assert_eq!(replica.remaining(), 0);
        assert_eq!(primary.remaining(), 0);
    }
}
