//! Logging and metrics setup for the gateway.
//!
//! Logs go through `tracing` with an `EnvFilter`; metrics are recorded with the
//! `metrics` facade and rendered by the Prometheus exporter at `/metrics`.

use clap::ValueEnum;
use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Debug, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// This is used when `RUST_LOG` is not set
const DEFAULT_GATEWAY_DIRECTIVES: &str = "warn,gateway=info,turnstile_core=info";

/// Set up logging.
///
/// If `RUST_LOG` is set, it is used as the filter verbatim.
/// Otherwise we use `DEFAULT_GATEWAY_DIRECTIVES`.
pub fn setup_observability(log_format: LogFormat) -> Result<(), Error> {
    let env_var_name = "RUST_LOG";
    let filter = if std::env::var(env_var_name).is_ok() {
        EnvFilter::builder()
            .with_env_var(env_var_name)
            .from_env()
            .map_err(|e| {
                Error::new(ErrorDetails::Observability {
                    message: format!("Invalid `{env_var_name}` environment variable: {e}"),
                })
            })?
    } else {
        EnvFilter::builder()
            .parse(DEFAULT_GATEWAY_DIRECTIVES)
            .map_err(|e| {
                Error::new(ErrorDetails::InternalError {
                    message: format!(
                        "Failed to parse internal log directives - this should never happen: {e}"
                    ),
                })
            })?
    };

    let log_layer = match log_format {
        LogFormat::Pretty => {
            Box::new(tracing_subscriber::fmt::layer()) as Box<dyn Layer<_> + Send + Sync>
        }
        LogFormat::Json => Box::new(tracing_subscriber::fmt::layer().json()),
    };

    tracing_subscriber::registry()
        .with(log_layer.with_filter(filter))
        .try_init()
        .map_err(|e| {
            Error::new(ErrorDetails::Observability {
                message: format!("Failed to initialize tracing subscriber: {e}"),
            })
        })?;

    // `redis` negotiates `rediss://` connections through rustls, which needs a
    // process-wide crypto provider. A second install attempt is harmless.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    Ok(())
}

pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    let metrics_handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new(ErrorDetails::Observability {
            message: format!("Failed to install Prometheus exporter: {e}"),
        })
    })?;

    // Register the expected metrics along with their types and docstrings
    describe_counter!(
        "turnstile_requests_total",
        Unit::Count,
        "Requests that went through admission control, by outcome",
    );

    describe_counter!(
        "turnstile_rate_limit_decisions_total",
        Unit::Count,
        "Rate limit decisions, by layer, endpoint class and decision",
    );

    describe_counter!(
        "turnstile_counter_store_fallbacks_total",
        Unit::Count,
        "Counter store reads that fell back from the replica to the primary",
    );

    describe_counter!(
        "turnstile_degraded_checks_total",
        Unit::Count,
        "Admission checks that were allowed because a backing store was unavailable",
    );

    describe_counter!(
        "turnstile_quota_denials_total",
        Unit::Count,
        "Requests denied by the monthly quota, by metered action",
    );

    describe_counter!(
        "turnstile_usage_events_total",
        Unit::Count,
        "Usage events written, by metric type",
    );

    describe_counter!(
        "turnstile_usage_event_failures_total",
        Unit::Count,
        "Usage events that could not be written",
    );

    describe_gauge!(
        "turnstile_pool_connections",
        Unit::Count,
        "Connection pool occupancy, by pool and state",
    );

    describe_counter!(
        "turnstile_pool_reclaimed_total",
        Unit::Count,
        "Idle or expired connections closed by the pool reaper",
    );

    describe_histogram!(
        "turnstile_admission_latency_seconds",
        Unit::Seconds,
        "Time spent in admission control before the request is forwarded",
    );

    Ok(metrics_handle)
}
