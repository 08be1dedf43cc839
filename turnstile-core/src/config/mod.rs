use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, ErrorDetails};
use crate::quota::MeteredAction;

pub mod rate_limiting;

pub use rate_limiting::{EndpointClassConfig, LayerKey, RateLimitLayerConfig, RateLimitingConfig};

/// What a component does when its backing store cannot answer
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Reject the request with a 503
    FailClosed,
    /// Allow the request and record that the check was skipped
    FailOpen,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub pools: PoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub metering: MeteringConfig,
}

/// Values supplied on the command line or through `TURNSTILE_*` environment variables.
/// Anything set here takes precedence over the config file.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub worker_count: Option<u32>,
    pub threads_per_worker: Option<u32>,
    pub background_concurrency: Option<u32>,
    pub checkout_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub replica_enabled: Option<bool>,
    pub default_monthly_limit: Option<i64>,
    pub default_llm_calls_limit: Option<i64>,
    pub upstream_url: Option<Url>,
}

impl Config {
    /// Loads, overrides and validates the configuration. Every error here is fatal at startup.
    ///
    /// `env` is scanned for `TURNSTILE_RATE_LIMIT_<CLASS>` overrides; pass `std::env::vars()` in production.
    pub fn load(
        path: Option<&Path>,
        overrides: &ConfigOverrides,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, Error> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    Error::new(ErrorDetails::Config {
                        message: format!("Failed to read config file `{}`: {e}", path.display()),
                    })
                })?;
                Self::from_toml_str(&contents)?
            }
            None => {
                tracing::info!("No config file provided, so only default settings will be used.");
                Self::default()
            }
        };
        config.apply_overrides(overrides);
        config.rate_limiting.apply_env_overrides(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file: {e}"),
            })
        })
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        let ConfigOverrides {
            worker_count,
            threads_per_worker,
            background_concurrency,
            checkout_timeout_ms,
            connect_timeout_ms,
            replica_enabled,
            default_monthly_limit,
            default_llm_calls_limit,
            upstream_url,
        } = overrides;
        if let Some(v) = worker_count {
            self.pools.worker_count = *v;
        }
        if let Some(v) = threads_per_worker {
            self.pools.threads_per_worker = *v;
        }
        if let Some(v) = background_concurrency {
            self.pools.background_concurrency = *v;
        }
        if let Some(v) = checkout_timeout_ms {
            self.pools.checkout_timeout_ms = *v;
        }
        if let Some(v) = connect_timeout_ms {
            self.pools.connect_timeout_ms = *v;
        }
        if let Some(v) = replica_enabled {
            self.pools.replica_enabled = *v;
        }
        if let Some(v) = default_monthly_limit {
            self.quota.default_monthly_limit = *v;
        }
        if let Some(v) = default_llm_calls_limit {
            self.quota.default_llm_calls_limit = *v;
        }
        if let Some(v) = upstream_url {
            self.gateway.upstream_url = Some(v.clone());
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.gateway.validate()?;
        self.pools.validate()?;
        self.health.validate()?;
        self.rate_limiting.validate()?;
        self.quota.validate()?;
        self.metering.validate()?;
        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> Error {
    Error::new(ErrorDetails::Config {
        message: message.into(),
    })
}

fn validate_method(field: &str, method: &str) -> Result<(), Error> {
    let is_upper = !method.is_empty() && method.chars().all(|c| c.is_ascii_uppercase());
    match http::Method::from_bytes(method.as_bytes()) {
        Ok(_) if is_upper => Ok(()),
        _ => Err(config_error(format!(
            "`{field}` must be an upper-case HTTP method, got `{method}`"
        ))),
    }
}

fn validate_path(field: &str, path: &str) -> Result<(), Error> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(config_error(format!(
            "`{field}` must start with `/`, got `{path}`"
        )))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub bind_address: Option<SocketAddr>,
    /// Use the left-most `X-Forwarded-For` entry as the client address.
    /// Only enable this behind a proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
    #[serde(default)]
    pub upstream_url: Option<Url>,
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// Larger request bodies are rejected with a 413 before anything is sent upstream
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            trust_forwarded_for: false,
            upstream_url: None,
            upstream_timeout_ms: default_upstream_timeout_ms(),
            max_request_body_bytes: default_max_request_body_bytes(),
        }
    }
}

impl GatewayConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.max_request_body_bytes == 0 {
            return Err(config_error(
                "`gateway.max_request_body_bytes` must be greater than 0",
            ));
        }
        Ok(())
    }
}

fn default_upstream_timeout_ms() -> u64 {
    30_000
}

fn default_max_request_body_bytes() -> usize {
    2 * 1024 * 1024
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: u32,
    #[serde(default = "default_threads_per_worker")]
    pub threads_per_worker: u32,
    #[serde(default = "default_background_concurrency")]
    pub background_concurrency: u32,
    #[serde(default = "default_fixed_buffer")]
    pub fixed_buffer: u32,
    #[serde(default = "default_min_floor")]
    pub min_floor: u32,
    #[serde(default = "default_max_ceiling")]
    pub max_ceiling: u32,
    #[serde(default = "default_checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_s")]
    pub idle_timeout_s: u64,
    #[serde(default = "default_max_lifetime_s")]
    pub max_lifetime_s: u64,
    #[serde(default)]
    pub replica_enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            threads_per_worker: default_threads_per_worker(),
            background_concurrency: default_background_concurrency(),
            fixed_buffer: default_fixed_buffer(),
            min_floor: default_min_floor(),
            max_ceiling: default_max_ceiling(),
            checkout_timeout_ms: default_checkout_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_s: default_idle_timeout_s(),
            max_lifetime_s: default_max_lifetime_s(),
            replica_enabled: false,
        }
    }
}

fn default_worker_count() -> u32 {
    2
}

fn default_threads_per_worker() -> u32 {
    5
}

fn default_background_concurrency() -> u32 {
    10
}

fn default_fixed_buffer() -> u32 {
    5
}

fn default_min_floor() -> u32 {
    5
}

fn default_max_ceiling() -> u32 {
    50
}

fn default_checkout_timeout_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_idle_timeout_s() -> u64 {
    300
}

fn default_max_lifetime_s() -> u64 {
    1800
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let positive = [
            ("pools.worker_count", u64::from(self.worker_count)),
            ("pools.threads_per_worker", u64::from(self.threads_per_worker)),
            ("pools.min_floor", u64::from(self.min_floor)),
            ("pools.checkout_timeout_ms", self.checkout_timeout_ms),
            ("pools.connect_timeout_ms", self.connect_timeout_ms),
            ("pools.idle_timeout_s", self.idle_timeout_s),
            ("pools.max_lifetime_s", self.max_lifetime_s),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(config_error(format!("`{field}` must be greater than zero")));
            }
        }
        if self.min_floor > self.max_ceiling {
            return Err(config_error(format!(
                "`pools.min_floor` ({}) must not exceed `pools.max_ceiling` ({})",
                self.min_floor, self.max_ceiling
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_interval_s")]
    pub interval_s: u64,
    /// Fraction of a pool in use at which the monitor starts warning
    #[serde(default = "default_saturation_warn_ratio")]
    pub saturation_warn_ratio: f64,
    #[serde(default = "default_idle_probe_interval_s")]
    pub idle_probe_interval_s: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_s: default_health_interval_s(),
            saturation_warn_ratio: default_saturation_warn_ratio(),
            idle_probe_interval_s: default_idle_probe_interval_s(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_health_interval_s() -> u64 {
    30
}

fn default_saturation_warn_ratio() -> f64 {
    0.8
}

fn default_idle_probe_interval_s() -> u64 {
    300
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.interval_s == 0 || self.idle_probe_interval_s == 0 {
            return Err(config_error(
                "`health.interval_s` and `health.idle_probe_interval_s` must be greater than zero",
            ));
        }
        if !(self.saturation_warn_ratio > 0.0 && self.saturation_warn_ratio <= 1.0) {
            return Err(config_error(format!(
                "`health.saturation_warn_ratio` must be in (0, 1], got {}",
                self.saturation_warn_ratio
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MeteredEndpointConfig {
    pub method: String,
    pub path: String,
    #[serde(default = "default_metered_content_type")]
    pub content_type: String,
    pub action: MeteredAction,
    /// The upstream status that means the metered action happened
    pub success_status: u16,
}

fn default_metered_content_type() -> String {
    "application/json".to_string()
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResetSweepConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reset_sweep_interval_s")]
    pub interval_s: u64,
}

impl Default for ResetSweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_s: default_reset_sweep_interval_s(),
        }
    }
}

fn default_reset_sweep_interval_s() -> u64 {
    3600
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_monthly_limit")]
    pub default_monthly_limit: i64,
    #[serde(default = "default_llm_calls_limit")]
    pub default_llm_calls_limit: i64,
    #[serde(default = "default_quota_failure_mode")]
    pub failure_mode: FailureMode,
    #[serde(default = "default_upgrade_url")]
    pub upgrade_url: String,
    #[serde(default = "default_metered_endpoints")]
    pub metered_endpoints: Vec<MeteredEndpointConfig>,
    #[serde(default)]
    pub reset_sweep: ResetSweepConfig,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_monthly_limit: default_monthly_limit(),
            default_llm_calls_limit: default_llm_calls_limit(),
            failure_mode: default_quota_failure_mode(),
            upgrade_url: default_upgrade_url(),
            metered_endpoints: default_metered_endpoints(),
            reset_sweep: ResetSweepConfig::default(),
        }
    }
}

fn default_monthly_limit() -> i64 {
    10
}

fn default_llm_calls_limit() -> i64 {
    100
}

fn default_quota_failure_mode() -> FailureMode {
    FailureMode::FailOpen
}

fn default_upgrade_url() -> String {
    "/pricing".to_string()
}

fn default_metered_endpoints() -> Vec<MeteredEndpointConfig> {
    vec![
        MeteredEndpointConfig {
            method: "POST".to_string(),
            path: "/api/v1/readings".to_string(),
            content_type: default_metered_content_type(),
            action: MeteredAction::Reading,
            success_status: 201,
        },
        MeteredEndpointConfig {
            method: "POST".to_string(),
            path: "/api/v1/seance/messages".to_string(),
            content_type: default_metered_content_type(),
            action: MeteredAction::LlmCall,
            success_status: 200,
        },
    ]
}

impl QuotaConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.default_monthly_limit < 0 || self.default_llm_calls_limit < 0 {
            return Err(config_error(
                "`quota.default_monthly_limit` and `quota.default_llm_calls_limit` must not be negative",
            ));
        }
        if self.reset_sweep.interval_s == 0 {
            return Err(config_error(
                "`quota.reset_sweep.interval_s` must be greater than zero",
            ));
        }
        for endpoint in &self.metered_endpoints {
            validate_method("quota.metered_endpoints[].method", &endpoint.method)?;
            validate_path("quota.metered_endpoints[].path", &endpoint.path)?;
            if http::StatusCode::from_u16(endpoint.success_status).is_err() {
                return Err(config_error(format!(
                    "`quota.metered_endpoints[].success_status` is not a valid status code: {}",
                    endpoint.success_status
                )));
            }
        }
        Ok(())
    }

    /// The monthly limit a new quota record starts with
    pub fn default_limit_for(&self, action: MeteredAction) -> i64 {
        match action {
            MeteredAction::Reading => self.default_monthly_limit,
            MeteredAction::LlmCall => self.default_llm_calls_limit,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MeteringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Path prefixes whose successful responses count as a session
    #[serde(default = "default_streaming_prefixes")]
    pub streaming_prefixes: Vec<String>,
    #[serde(default = "default_session_window_minutes")]
    pub session_window_minutes: u32,
    #[serde(default = "default_reading_method")]
    pub reading_method: String,
    #[serde(default = "default_reading_path")]
    pub reading_path: String,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            streaming_prefixes: default_streaming_prefixes(),
            session_window_minutes: default_session_window_minutes(),
            reading_method: default_reading_method(),
            reading_path: default_reading_path(),
        }
    }
}

fn default_streaming_prefixes() -> Vec<String> {
    vec![
        "/api/v1/seance".to_string(),
        "/api/v1/reading_sessions".to_string(),
    ]
}

fn default_session_window_minutes() -> u32 {
    30
}

fn default_reading_method() -> String {
    "POST".to_string()
}

fn default_reading_path() -> String {
    "/api/v1/readings".to_string()
}

impl MeteringConfig {
    pub fn validate(&self) -> Result<(), Error> {
        for prefix in &self.streaming_prefixes {
            validate_path("metering.streaming_prefixes[]", prefix)?;
        }
        validate_method("metering.reading_method", &self.reading_method)?;
        validate_path("metering.reading_path", &self.reading_path)?;
        if self.session_window_minutes == 0 {
            return Err(config_error(
                "`metering.session_window_minutes` must be greater than zero",
            ));
        }
        Ok(())
    }
}
