//! In-memory fakes of the backing stores, for tests in this crate and downstream crates.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::counters::{CounterStore, WindowState};
use crate::db::identity::{CredentialOwner, IdentityQueries};
use crate::db::quota::{QuotaQueries, QuotaRecord};
use crate::db::usage::{UsageEvent, UsageMetricType, UsageQueries};
use crate::db::{HealthCheckable, MonitoredPool, PoolStats};
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::Stores;
use crate::identity::sha256_hex;
use crate::quota::MeteredAction;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unavailable(pool: &str) -> Error {
    Error::new(ErrorDetails::CounterStoreConnection {
        pool: pool.to_string(),
        message: "store unavailable".to_string(),
    })
}

fn relational_unavailable() -> Error {
    Error::new(ErrorDetails::PoolCheckoutTimeout {
        pool: "relational".to_string(),
        timeout_ms: 0,
    })
}

#[derive(Default)]
pub struct InMemoryCounterStore {
    windows: Mutex<HashMap<String, (u64, Instant)>>,
    locks: Mutex<HashMap<String, (String, Instant)>>,
    unavailable: AtomicBool,
    hits: AtomicU64,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Expires every window, as if their TTLs had elapsed
    pub fn expire_all(&self) {
        lock(&self.windows).clear();
    }

    pub fn count(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        lock(&self.windows)
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(count, _)| *count)
    }

    /// Number of `hit_window` calls that reached the store
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn is_locked(&self, key: &str) -> bool {
        let now = Instant::now();
        lock(&self.locks)
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > now)
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(unavailable("in_memory"));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn read_window(&self, key: &str) -> Result<Option<WindowState>, Error> {
        self.check_available()?;
        let now = Instant::now();
        Ok(lock(&self.windows)
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(count, expires_at)| WindowState {
                count: *count,
                ttl: *expires_at - now,
            }))
    }

    async fn hit_window(&self, key: &str, window: Duration) -> Result<WindowState, Error> {
        self.check_available()?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut windows = lock(&self.windows);
        let entry = windows
            .entry(key.to_string())
            .and_modify(|(count, expires_at)| {
                if *expires_at <= now {
                    *count = 0;
                    *expires_at = now + window;
                }
            })
            .or_insert((0, now + window));
        entry.0 += 1;
        Ok(WindowState {
            count: entry.0,
            ttl: entry.1 - now,
        })
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        self.check_available()?;
        let now = Instant::now();
        let mut locks = lock(&self.locks);
        if locks
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > now)
        {
            return Ok(false);
        }
        locks.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<(), Error> {
        self.check_available()?;
        let mut locks = lock(&self.locks);
        if locks.get(key).is_some_and(|(held, _)| held == token) {
            locks.remove(key);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryQuotaStore {
    records: Mutex<HashMap<Uuid, QuotaRecord>>,
    subscribers: Mutex<HashSet<Uuid>>,
    unavailable: AtomicBool,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subscription(&self, user_id: Uuid) {
        lock(&self.subscribers).insert(user_id);
    }

    pub fn insert_record(&self, record: QuotaRecord) {
        lock(&self.records).insert(record.user_id, record);
    }

    pub fn record(&self, user_id: Uuid) -> Option<QuotaRecord> {
        lock(&self.records).get(&user_id).cloned()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(relational_unavailable());
        }
        Ok(())
    }
}

fn reset(record: &mut QuotaRecord, next_reset_date: DateTime<Utc>) {
    record.readings_this_month = 0;
    record.llm_calls_this_month = 0;
    record.reset_date = next_reset_date;
}

#[async_trait]
impl QuotaQueries for InMemoryQuotaStore {
    async fn has_active_subscription(
        &self,
        user_id: Uuid,
        _now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        self.check_available()?;
        Ok(lock(&self.subscribers).contains(&user_id))
    }

    async fn get_or_create_quota_record(
        &self,
        defaults: &QuotaRecord,
    ) -> Result<QuotaRecord, Error> {
        self.check_available()?;
        Ok(lock(&self.records)
            .entry(defaults.user_id)
            .or_insert_with(|| defaults.clone())
            .clone())
    }

    async fn reset_quota_record_if_due(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        next_reset_date: DateTime<Utc>,
    ) -> Result<QuotaRecord, Error> {
        self.check_available()?;
        let mut records = lock(&self.records);
        let Some(record) = records.get_mut(&user_id) else {
            return Err(Error::new(ErrorDetails::PostgresQuery {
                function_name: Some("reset_quota_record_if_due".to_string()),
                message: format!("no quota record for user {user_id}"),
            }));
        };
        if record.is_reset_due(now) {
            reset(record, next_reset_date);
        }
        Ok(record.clone())
    }

    async fn increment_quota_usage(
        &self,
        user_id: Uuid,
        action: MeteredAction,
    ) -> Result<(), Error> {
        self.check_available()?;
        if let Some(record) = lock(&self.records).get_mut(&user_id) {
            match action {
                MeteredAction::Reading => record.readings_this_month += 1,
                MeteredAction::LlmCall => record.llm_calls_this_month += 1,
            }
        }
        Ok(())
    }

    async fn reset_due_quota_records(
        &self,
        now: DateTime<Utc>,
        next_reset_date: DateTime<Utc>,
    ) -> Result<u64, Error> {
        self.check_available()?;
        let mut reset_count = 0;
        for record in lock(&self.records).values_mut() {
            if record.is_reset_due(now) {
                reset(record, next_reset_date);
                reset_count += 1;
            }
        }
        Ok(reset_count)
    }
}

#[derive(Default)]
pub struct InMemoryUsageStore {
    events: Mutex<Vec<UsageEvent>>,
    unavailable: AtomicBool,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        lock(&self.events).clone()
    }

    pub fn events_of(&self, metric_type: UsageMetricType) -> Vec<UsageEvent> {
        lock(&self.events)
            .iter()
            .filter(|event| event.metric_type == metric_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl UsageQueries for InMemoryUsageStore {
    async fn insert_usage_event(&self, event: &UsageEvent) -> Result<(), Error> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(relational_unavailable());
        }
        lock(&self.events).push(event.clone());
        Ok(())
    }

    async fn count_usage_events_since(
        &self,
        organization_id: Uuid,
        metric_type: UsageMetricType,
        since: DateTime<Utc>,
    ) -> Result<u64, Error> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(relational_unavailable());
        }
        let count = lock(&self.events)
            .iter()
            .filter(|event| {
                event.organization_id == organization_id
                    && event.metric_type == metric_type
                    && event.recorded_at >= since
            })
            .count();
        Ok(count as u64)
    }
}

/// Credentials are registered in raw form and looked up by digest, like the real store
#[derive(Default)]
pub struct InMemoryIdentityStore {
    api_keys: Mutex<HashMap<String, CredentialOwner>>,
    access_tokens: Mutex<HashMap<String, CredentialOwner>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_api_key(&self, raw_key: &str, owner: CredentialOwner) {
        lock(&self.api_keys).insert(sha256_hex(raw_key), owner);
    }

    pub fn add_access_token(&self, raw_token: &str, owner: CredentialOwner) {
        lock(&self.access_tokens).insert(sha256_hex(raw_token), owner);
    }
}

#[async_trait]
impl IdentityQueries for InMemoryIdentityStore {
    async fn find_api_key_owner(
        &self,
        key_hash: &str,
        _now: DateTime<Utc>,
    ) -> Result<Option<CredentialOwner>, Error> {
        Ok(lock(&self.api_keys).get(key_hash).cloned())
    }

    async fn find_access_token_owner(
        &self,
        token_hash: &str,
        _now: DateTime<Utc>,
    ) -> Result<Option<CredentialOwner>, Error> {
        Ok(lock(&self.access_tokens).get(token_hash).cloned())
    }
}

/// A pool whose statistics are set by the test
pub struct FakeMonitoredPool {
    name: String,
    stats: Mutex<PoolStats>,
    reclaimed: AtomicU64,
    refreshes: AtomicUsize,
}

impl FakeMonitoredPool {
    pub fn new(name: &str, size: u32) -> Self {
        Self {
            name: name.to_string(),
            stats: Mutex::new(PoolStats {
                pool: name.to_string(),
                size,
                in_use: 0,
                idle: size,
                waiting: 0,
            }),
            reclaimed: AtomicU64::new(0),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn set_usage(&self, in_use: u32, idle: u32, waiting: u32) {
        let mut stats = lock(&self.stats);
        stats.in_use = in_use;
        stats.idle = idle;
        stats.waiting = waiting;
    }

    pub fn add_reclaimed(&self, count: u64) {
        self.reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    /// Number of times `refresh_idle` was called
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MonitoredPool for FakeMonitoredPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> PoolStats {
        lock(&self.stats).clone()
    }

    fn reclaimed_total(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    async fn refresh_idle(&self) -> Result<usize, Error> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(lock(&self.stats).idle as usize)
    }
}

/// A health check whose result is set by the test
#[derive(Default)]
pub struct FakeHealthCheck {
    failing: AtomicBool,
}

impl FakeHealthCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl HealthCheckable for FakeHealthCheck {
    async fn health(&self) -> Result<(), Error> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(unavailable("fake"));
        }
        Ok(())
    }
}

/// Every in-memory store, with handles kept for assertions
pub struct TestStores {
    pub counters: Arc<InMemoryCounterStore>,
    pub identity: Arc<InMemoryIdentityStore>,
    pub quota: Arc<InMemoryQuotaStore>,
    pub usage: Arc<InMemoryUsageStore>,
    pub counter_store_health: Arc<FakeHealthCheck>,
    pub relational_health: Arc<FakeHealthCheck>,
    pub pool: Arc<FakeMonitoredPool>,
}

impl TestStores {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(InMemoryCounterStore::new()),
            identity: Arc::new(InMemoryIdentityStore::new()),
            quota: Arc::new(InMemoryQuotaStore::new()),
            usage: Arc::new(InMemoryUsageStore::new()),
            counter_store_health: Arc::new(FakeHealthCheck::new()),
            relational_health: Arc::new(FakeHealthCheck::new()),
            pool: Arc::new(FakeMonitoredPool::new("counter_primary", 20)),
        }
    }

    pub fn stores(&self) -> Stores {
        Stores {
            counters: self.counters.clone(),
            identity: self.identity.clone(),
            quota: self.quota.clone(),
            usage: self.usage.clone(),
            counter_store_health: self.counter_store_health.clone(),
            relational_health: self.relational_health.clone(),
            monitored_pools: vec![self.pool.clone() as Arc<dyn MonitoredPool>],
        }
    }
}

impl Default for TestStores {
    fn default() -> Self {
        Self::new()
    }
}
