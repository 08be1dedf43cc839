use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use mimalloc::MiMalloc;
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use turnstile_core::admission::admission_middleware;
use turnstile_core::config::Config;
use turnstile_core::db::postgres::manual_run_postgres_migrations;
use turnstile_core::endpoints;
use turnstile_core::endpoints::status::TURNSTILE_VERSION;
use turnstile_core::gateway_util::AppStateData;
use turnstile_core::health::HealthMonitor;
use turnstile_core::observability;
use turnstile_core::pool_manager::PoolManager;
use turnstile_core::quota::QuotaResetJob;

use crate::cli::GatewayArgs;
use crate::proxy::{ProxyState, proxy_handler};

mod cli;
mod proxy;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Diagnostics are served directly; every other path goes through admission to the upstream
fn build_router(
    app_state: AppStateData,
    proxy_state: ProxyState,
    metrics_handle: PrometheusHandle,
) -> Router {
    let diagnostics = Router::new()
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler))
        .route("/internal/pools", get(endpoints::status::pools_handler))
        .with_state(app_state.clone())
        .route(
            "/metrics",
            get(move || std::future::ready(metrics_handle.render())),
        );

    let proxied = Router::new()
        .fallback(proxy_handler)
        .with_state(proxy_state)
        .layer(from_fn_with_state(app_state, admission_middleware));

    diagnostics
        .merge(proxied)
        // We log failed requests messages at 'DEBUG', since we already have our own error-logging code
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
}

#[tokio::main]
async fn main() {
    let args = GatewayArgs::parse();
    // Set up logs and metrics immediately, so that we can use `tracing`.
    observability::setup_observability(args.log_format.clone())
        .expect_pretty("Failed to set up logs");

    if args.early_exit_commands.run_postgres_migrations {
        let postgres_url = args
            .stores
            .postgres_url
            .as_ref()
            .expect_pretty("`TURNSTILE_POSTGRES_URL` must be set to run migrations");
        manual_run_postgres_migrations(postgres_url)
            .await
            .expect_pretty("Failed to run PostgreSQL migrations");
        return;
    }

    tracing::info!("Starting Turnstile Gateway {TURNSTILE_VERSION}");

    let metrics_handle = observability::setup_metrics().expect_pretty("Failed to set up metrics");

    let config = Arc::new(
        Config::load(
            args.config_file.as_deref(),
            &args.overrides.to_config_overrides(),
            std::env::vars(),
        )
        .ok() // Don't print the error here, since it was already printed when it was constructed
        .expect_pretty("Failed to load config"),
    );

    let settings = args
        .stores
        .pool_manager_settings()
        .map_err(|name| format!("`{name}` is not set"))
        .expect_pretty("Missing store configuration");
    let pools = PoolManager::connect(&settings, &config.pools)
        .await
        .expect_pretty("Failed to connect to backing stores");

    let usage_tasks = TaskTracker::new();
    let app_state = AppStateData::new(config.clone(), pools.stores(), usage_tasks.clone())
        .expect_pretty("Failed to initialize AppState");

    let upstream_url = config
        .gateway
        .upstream_url
        .clone()
        .expect_pretty("`gateway.upstream_url` (or `TURNSTILE_UPSTREAM_URL`) must be set");
    let proxy_state = ProxyState::new(
        upstream_url.clone(),
        Duration::from_millis(config.gateway.upstream_timeout_ms),
        config.gateway.max_request_body_bytes,
    )
    .expect_pretty("Failed to set up the upstream proxy");

    let cancel = CancellationToken::new();
    let background_tasks = TaskTracker::new();
    if config.health.enabled {
        let monitor = HealthMonitor::new(pools.monitored_pools(), &config.health);
        background_tasks.spawn(monitor.run(cancel.clone()));
    }
    if config.quota.reset_sweep.enabled {
        let sweep = QuotaResetJob::new(
            pools.relational(),
            pools.background_counter_store(),
            Duration::from_secs(config.quota.reset_sweep.interval_s),
        );
        background_tasks.spawn(sweep.run(cancel.clone()));
    }
    background_tasks.close();

    let router = build_router(app_state, proxy_state, metrics_handle);

    // Bind to the socket address specified in the config, or default to 0.0.0.0:3000
    let bind_address = config
        .gateway
        .bind_address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::error!(
                "Failed to bind to socket address {bind_address}: {e}. Tip: Ensure no other process is using port {} or try a different port.",
                bind_address.port()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to bind to socket address {bind_address}: {e}");
            std::process::exit(1);
        }
    };

    // This will give us the chosen port if the user specified a port of 0
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to get bind address from listener");

    tracing::info!("Turnstile Gateway is listening on {actual_bind_address}");
    tracing::info!("├ Upstream: {upstream_url}");
    match &args.config_file {
        Some(path) => tracing::info!("├ Configuration: {}", path.display()),
        None => tracing::info!("├ Configuration: default"),
    }
    tracing::info!(
        "├ Rate Limiting: {}",
        if config.rate_limiting.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    tracing::info!(
        "└ Quota: {}",
        if config.quota.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );

    // Start the server
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect_pretty("Failed to start server");

    tracing::info!("Stopping background tasks");
    cancel.cancel();
    background_tasks.wait().await;

    tracing::info!("Waiting for usage events to be written");
    usage_tasks.close();
    usage_tasks.wait().await;

    pools.close().await;
    tracing::info!("Turnstile Gateway shut down");
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(unix)]
    let hangup = async {
        signal::unix::signal(signal::unix::SignalKind::hangup())
            .expect_pretty("Failed to install SIGHUP handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
        () = hangup => {
            tracing::info!("Received SIGHUP signal");
        }
    };
}

/// Only `main.rs` may exit the process, and only during initialization.
/// `expect_pretty` logs the error and exits with a status code of 1.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                tracing::error!("{msg}");
                std::process::exit(1);
            }
        }
    }
}
