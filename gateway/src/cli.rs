//! CLI argument definitions for the Turnstile Gateway.
//!
//! Every deployment setting can also be supplied through its `TURNSTILE_*` environment variable.

use clap::{Args, Parser};
use secrecy::SecretString;
use std::path::PathBuf;
use turnstile_core::config::ConfigOverrides;
use turnstile_core::observability::LogFormat;
use turnstile_core::pool_manager::PoolManagerSettings;
use url::Url;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct GatewayArgs {
    /// Path to a TOML config file. Without one, default settings are used.
    #[arg(long, env = "TURNSTILE_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Sets the log format used for all gateway logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub stores: StoreArgs,

    #[command(flatten)]
    pub overrides: OverrideArgs,

    /// These commands trigger some workflow then exit without launching the gateway.
    #[command(flatten)]
    pub early_exit_commands: EarlyExitCommands,
}

#[derive(Args, Debug)]
pub struct StoreArgs {
    /// Primary counter store, e.g. `redis://valkey:6379`
    #[arg(long, env = "TURNSTILE_VALKEY_URL", hide_env_values = true)]
    pub valkey_url: Option<SecretString>,

    /// Read replica of the counter store. Only used with `--replica-enabled`.
    #[arg(long, env = "TURNSTILE_VALKEY_REPLICA_URL", hide_env_values = true)]
    pub valkey_replica_url: Option<SecretString>,

    /// Counter store partition for background jobs. Defaults to `--valkey-url`.
    #[arg(long, env = "TURNSTILE_VALKEY_BACKGROUND_URL", hide_env_values = true)]
    pub valkey_background_url: Option<SecretString>,

    #[arg(long, env = "TURNSTILE_POSTGRES_URL", hide_env_values = true)]
    pub postgres_url: Option<SecretString>,
}

#[derive(Args, Debug)]
pub struct OverrideArgs {
    #[arg(long, env = "TURNSTILE_UPSTREAM_URL")]
    pub upstream_url: Option<Url>,

    #[arg(long, env = "TURNSTILE_WORKER_COUNT")]
    pub worker_count: Option<u32>,

    #[arg(long, env = "TURNSTILE_THREADS_PER_WORKER")]
    pub threads_per_worker: Option<u32>,

    #[arg(long, env = "TURNSTILE_BACKGROUND_CONCURRENCY")]
    pub background_concurrency: Option<u32>,

    #[arg(long, env = "TURNSTILE_CHECKOUT_TIMEOUT_MS")]
    pub checkout_timeout_ms: Option<u64>,

    #[arg(long, env = "TURNSTILE_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: Option<u64>,

    #[arg(long, env = "TURNSTILE_REPLICA_ENABLED")]
    pub replica_enabled: Option<bool>,

    #[arg(long, env = "TURNSTILE_DEFAULT_MONTHLY_READINGS")]
    pub default_monthly_readings: Option<i64>,

    #[arg(long, env = "TURNSTILE_DEFAULT_LLM_CALLS")]
    pub default_llm_calls: Option<i64>,
}

#[derive(Args, Debug)]
#[group(multiple = false)]
pub struct EarlyExitCommands {
    /// Run PostgreSQL migrations manually then exit.
    #[arg(long)]
    pub run_postgres_migrations: bool,
}

impl OverrideArgs {
    pub fn to_config_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            worker_count: self.worker_count,
            threads_per_worker: self.threads_per_worker,
            background_concurrency: self.background_concurrency,
            checkout_timeout_ms: self.checkout_timeout_ms,
            connect_timeout_ms: self.connect_timeout_ms,
            replica_enabled: self.replica_enabled,
            default_monthly_limit: self.default_monthly_readings,
            default_llm_calls_limit: self.default_llm_calls,
            upstream_url: self.upstream_url.clone(),
        }
    }
}

impl StoreArgs {
    /// Returns the name of the first missing setting on failure
    pub fn pool_manager_settings(&self) -> Result<PoolManagerSettings, &'static str> {
        Ok(PoolManagerSettings {
            valkey_url: self.valkey_url.clone().ok_or("TURNSTILE_VALKEY_URL")?,
            valkey_replica_url: self.valkey_replica_url.clone(),
            valkey_background_url: self.valkey_background_url.clone(),
            postgres_url: self.postgres_url.clone().ok_or("TURNSTILE_POSTGRES_URL")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_parse_store_and_override_flags() {
        let args = GatewayArgs::try_parse_from([
            "gateway",
            "--valkey-url",
            "redis://valkey:6379",
            "--postgres-url",
            "postgres://turnstile@db/turnstile",
            "--worker-count",
            "4",
            "--replica-enabled",
            "true",
            "--upstream-url",
            "http://app:3000",
        ])
        .unwrap();
        let settings = args.stores.pool_manager_settings().unwrap();
        assert_eq!(settings.valkey_url.expose_secret(), "redis://valkey:6379");
        assert!(settings.valkey_background_url.is_none());

        let overrides = args.overrides.to_config_overrides();
        assert_eq!(overrides.worker_count, Some(4));
        assert_eq!(overrides.replica_enabled, Some(true));
        assert_eq!(
            overrides.upstream_url.unwrap().as_str(),
            "http://app:3000/"
        );
        assert!(!args.early_exit_commands.run_postgres_migrations);
    }

    #[test]
    fn test_missing_store_url_is_named() {
        let args = GatewayArgs::try_parse_from(["gateway", "--valkey-url", "redis://valkey:6379"])
            .unwrap();
        if std::env::var("TURNSTILE_POSTGRES_URL").is_err() {
            assert_eq!(
                args.stores.pool_manager_settings().err(),
                Some("TURNSTILE_POSTGRES_URL")
            );
        }
    }
}
