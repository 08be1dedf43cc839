use std::sync::Arc;

use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::db::counters::CounterStore;
use crate::db::identity::IdentityQueries;
use crate::db::quota::QuotaQueries;
use crate::db::usage::UsageQueries;
use crate::db::{HealthCheckable, MonitoredPool};
use crate::error::Error;
use crate::identity::IdentityResolver;
use crate::metering::UsageRecorder;
use crate::quota::QuotaEnforcer;
use crate::rate_limiting::RateLimiter;

/// The stores the request path depends on, behind their traits
pub struct Stores {
    pub counters: Arc<dyn CounterStore>,
    pub identity: Arc<dyn IdentityQueries>,
    pub quota: Arc<dyn QuotaQueries>,
    pub usage: Arc<dyn UsageQueries>,
    pub counter_store_health: Arc<dyn HealthCheckable + Send + Sync>,
    pub relational_health: Arc<dyn HealthCheckable + Send + Sync>,
    pub monitored_pools: Vec<Arc<dyn MonitoredPool>>,
}

/// State for the admission middleware and the diagnostic endpoints
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub identity_resolver: Arc<IdentityResolver>,
    pub rate_limiter: Arc<RateLimiter>,
    pub quota_enforcer: Arc<QuotaEnforcer>,
    pub usage_recorder: UsageRecorder,
    pub counter_store_health: Arc<dyn HealthCheckable + Send + Sync>,
    pub relational_health: Arc<dyn HealthCheckable + Send + Sync>,
    pub monitored_pools: Vec<Arc<dyn MonitoredPool>>,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    /// `tasks` tracks the background usage writes, so shutdown can wait for them
    pub fn new(config: Arc<Config>, stores: Stores, tasks: TaskTracker) -> Result<Self, Error> {
        let Stores {
            counters,
            identity,
            quota,
            usage,
            counter_store_health,
            relational_health,
            monitored_pools,
        } = stores;
        let identity_resolver = Arc::new(IdentityResolver::new(
            identity,
            config.gateway.trust_forwarded_for,
        ));
        let rate_limiter = Arc::new(RateLimiter::from_config(&config.rate_limiting, &counters));
        let quota_enforcer = Arc::new(QuotaEnforcer::new(quota, &config.quota)?);
        let usage_recorder = UsageRecorder::new(usage, config.metering.clone(), tasks);
        Ok(Self {
            config,
            identity_resolver,
            rate_limiter,
            quota_enforcer,
            usage_recorder,
            counter_store_health,
            relational_health,
            monitored_pools,
        })
    }
}
