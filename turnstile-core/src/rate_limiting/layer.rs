use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;

use crate::config::{FailureMode, LayerKey, RateLimitLayerConfig};
use crate::db::counters::{CounterStore, WindowState};
use crate::error::{Error, ErrorDetails};
use crate::identity::ClientIdentity;
use crate::rate_limiting::endpoint_class::{EndpointClass, EndpointClassifier};
use crate::rate_limiting::{LayerOutcome, RateLimitDecision, RateLimitPolicy};

/// Counter key for one (endpoint class, caller) pair
pub fn window_key(endpoint_class: &str, identity_key: &str) -> String {
    format!("rate_limit:{endpoint_class}:{identity_key}")
}

/// A fixed-window rate limit layer backed by the shared counter store
pub struct FixedWindowLayer {
    name: String,
    key_by: LayerKey,
    failure_mode: FailureMode,
    classifier: EndpointClassifier,
    store: Arc<dyn CounterStore>,
}

impl FixedWindowLayer {
    pub fn new(config: &RateLimitLayerConfig, store: Arc<dyn CounterStore>) -> Self {
        Self {
            name: config.name.clone(),
            key_by: config.key_by,
            failure_mode: config.failure_mode,
            classifier: EndpointClassifier::new(&config.classes, config.default_class.as_deref()),
            store,
        }
    }

    fn identity_key(&self, identity: &ClientIdentity) -> String {
        match self.key_by {
            LayerKey::Ip => identity.ip_key(),
            LayerKey::Identity => identity.key(),
        }
    }

    /// A window already at its limit is denied without being incremented.
    /// Otherwise the hit is counted and allowed if it stays within the limit.
    async fn evaluate(&self, class: &EndpointClass, key: &str) -> Result<RateLimitDecision, Error> {
        if let Some(state) = self.store.read_window(key).await?
            && state.count >= class.limit
        {
            return Ok(self.decision(class, state, false));
        }
        let state = self.store.hit_window(key, class.window).await?;
        Ok(self.decision(class, state, state.count <= class.limit))
    }

    fn decision(&self, class: &EndpointClass, state: WindowState, allowed: bool) -> RateLimitDecision {
        let ttl = chrono::Duration::from_std(state.ttl).unwrap_or_default();
        let retry_after_secs = state.ttl.as_secs() + u64::from(state.ttl.subsec_nanos() > 0);
        RateLimitDecision {
            layer: self.name.clone(),
            endpoint_class: class.name.clone(),
            allowed,
            limit: class.limit,
            count: state.count,
            remaining: class.limit.saturating_sub(state.count),
            reset_at: Utc::now() + ttl,
            retry_after_secs: retry_after_secs.max(1),
        }
    }
}

#[async_trait]
impl RateLimitPolicy for FixedWindowLayer {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip_all, fields(layer = %self.name))]
    async fn check_and_increment(
        &self,
        identity: &ClientIdentity,
        path: &str,
    ) -> Result<LayerOutcome, Error> {
        let Some(class) = self.classifier.classify(path) else {
            return Ok(LayerOutcome::Skipped);
        };
        let key = window_key(&class.name, &self.identity_key(identity));
        match self.evaluate(class, &key).await {
            Ok(decision) => {
                let outcome = if decision.allowed { "allowed" } else { "denied" };
                counter!(
                    "turnstile_rate_limit_decisions_total",
                    "layer" => self.name.clone(),
                    "endpoint_class" => class.name.clone(),
                    "decision" => outcome,
                )
                .increment(1);
                Ok(LayerOutcome::Decided(decision))
            }
            Err(e) => match self.failure_mode {
                // The store error was logged when it was created
                FailureMode::FailClosed => Err(Error::new_without_logging(
                    ErrorDetails::RateLimiterUnavailable {
                        layer: self.name.clone(),
                        message: e.to_string(),
                    },
                )),
                FailureMode::FailOpen => {
                    tracing::warn!(
                        endpoint_class = %class.name,
                        "Counter store unavailable, skipping rate limit layer: {e}"
                    );
                    counter!(
                        "turnstile_degraded_checks_total",
                        "component" => "rate_limiter",
                    )
                    .increment(1);
                    Ok(LayerOutcome::Degraded)
                }
            },
        }
    }
}
