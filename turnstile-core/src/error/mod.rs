use std::fmt::Debug;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::quota::MeteredAction;
use crate::rate_limiting::headers::{RateLimitHeaders, insert_retry_after};

pub const IMPOSSIBLE_ERROR_MESSAGE: &str =
    "This should never happen, please file a bug report with the gateway logs attached";

#[derive(Clone, Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
#[error(transparent)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We arc `ErrorDetails` per the `clippy::result_large_err` lint, as well as to make it cloneable
pub struct Error(Arc<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Arc::new(details))
    }

    /// For errors that wrap a cause which was already logged when it was constructed
    pub(crate) fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Arc::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    /// Errors that come from a backing store being slow or unreachable.
    /// Callers use this to apply their documented degradation policy.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self.get_details(),
            ErrorDetails::CounterStoreConnection { .. }
                | ErrorDetails::CounterStoreQuery { .. }
                | ErrorDetails::PoolCheckoutTimeout { .. }
                | ErrorDetails::PostgresQuery { .. }
        )
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
pub enum ErrorDetails {
    AppState {
        message: String,
    },
    Config {
        message: String,
    },
    CounterStoreConnection {
        pool: String,
        message: String,
    },
    CounterStoreQuery {
        message: String,
    },
    InternalError {
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    Observability {
        message: String,
    },
    PayloadTooLarge {
        limit_bytes: usize,
    },
    PoolCheckoutTimeout {
        pool: String,
        timeout_ms: u64,
    },
    PostgresConnectionInitialization {
        message: String,
    },
    PostgresMigration {
        message: String,
    },
    PostgresQuery {
        function_name: Option<String>,
        message: String,
    },
    QuotaExceeded {
        action: MeteredAction,
        limit: i64,
        used: i64,
        reset_date: DateTime<Utc>,
        upgrade_url: String,
    },
    QuotaUnavailable {
        message: String,
    },
    RateLimitExceeded {
        layer: String,
        endpoint_class: String,
        limit: u64,
        reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },
    RateLimiterUnavailable {
        layer: String,
        message: String,
    },
    Serialization {
        message: String,
    },
    Upstream {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::CounterStoreConnection { .. } => tracing::Level::ERROR,
            ErrorDetails::CounterStoreQuery { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::PayloadTooLarge { .. } => tracing::Level::WARN,
            ErrorDetails::PoolCheckoutTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::PostgresConnectionInitialization { .. } => tracing::Level::ERROR,
            ErrorDetails::PostgresMigration { .. } => tracing::Level::ERROR,
            ErrorDetails::PostgresQuery { .. } => tracing::Level::ERROR,
            // Limit violations are an expected outcome for well-behaved clients
            ErrorDetails::QuotaExceeded { .. } => tracing::Level::INFO,
            ErrorDetails::QuotaUnavailable { .. } => tracing::Level::WARN,
            ErrorDetails::RateLimitExceeded { .. } => tracing::Level::INFO,
            ErrorDetails::RateLimiterUnavailable { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::Upstream { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::CounterStoreConnection { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::CounterStoreQuery { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorDetails::PoolCheckoutTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::PostgresConnectionInitialization { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorDetails::PostgresMigration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::PostgresQuery { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            ErrorDetails::QuotaUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::RateLimiterUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Upstream { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Stable, machine-readable identifier used in the `error` field of response bodies
    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorDetails::QuotaExceeded { .. } => "quota_exceeded",
            ErrorDetails::RateLimitExceeded { .. } => "rate_limit_exceeded",
            ErrorDetails::Upstream { .. } => "upstream_unavailable",
            ErrorDetails::InvalidRequest { .. } => "invalid_request",
            ErrorDetails::PayloadTooLarge { .. } => "payload_too_large",
            ErrorDetails::CounterStoreConnection { .. }
            | ErrorDetails::CounterStoreQuery { .. }
            | ErrorDetails::PoolCheckoutTimeout { .. }
            | ErrorDetails::PostgresConnectionInitialization { .. }
            | ErrorDetails::PostgresQuery { .. }
            | ErrorDetails::QuotaUnavailable { .. }
            | ErrorDetails::RateLimiterUnavailable { .. } => "service_unavailable",
            ErrorDetails::AppState { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::InternalError { .. }
            | ErrorDetails::Observability { .. }
            | ErrorDetails::PostgresMigration { .. }
            | ErrorDetails::Serialization { .. } => "internal_error",
        }
    }

    pub fn log_at_level(&self, prefix: &str, level: tracing::Level) {
        match level {
            tracing::Level::ERROR => tracing::error!("{prefix}{self}"),
            tracing::Level::WARN => tracing::warn!("{prefix}{self}"),
            tracing::Level::INFO => tracing::info!("{prefix}{self}"),
            tracing::Level::DEBUG => tracing::debug!("{prefix}{self}"),
            tracing::Level::TRACE => tracing::trace!("{prefix}{self}"),
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        self.log_at_level("", self.level());
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::CounterStoreConnection { pool, message } => {
                write!(f, "Error connecting to counter store `{pool}`: {message}")
            }
            ErrorDetails::CounterStoreQuery { message } => {
                write!(f, "Counter store query failed: {message}")
            }
            ErrorDetails::InternalError { message } => write!(f, "Internal error: {message}"),
            ErrorDetails::InvalidRequest { message } => write!(f, "Invalid request: {message}"),
            ErrorDetails::Observability { message } => write!(f, "{message}"),
            ErrorDetails::PayloadTooLarge { limit_bytes } => write!(
                f,
                "Request body exceeds the limit of {limit_bytes} bytes"
            ),
            ErrorDetails::PoolCheckoutTimeout { pool, timeout_ms } => write!(
                f,
                "Timed out after {timeout_ms}ms waiting for a connection from pool `{pool}`"
            ),
            ErrorDetails::PostgresConnectionInitialization { message } => {
                write!(
                    f,
                    "Postgres connection initialization failed with message: {message}"
                )
            }
            ErrorDetails::PostgresMigration { message } => {
                write!(f, "Postgres migration failed with message: {message}")
            }
            ErrorDetails::PostgresQuery {
                function_name,
                message,
            } => match function_name {
                Some(function_name) => write!(
                    f,
                    "Postgres query failed in function {function_name} with message: {message}"
                ),
                None => write!(f, "Postgres query failed: {message}"),
            },
            ErrorDetails::QuotaExceeded {
                action,
                limit,
                used,
                reset_date,
                ..
            } => write!(
                f,
                "Monthly {} quota exhausted ({used}/{limit}). The quota resets on {}. Upgrade your plan for unlimited usage.",
                action.as_str(),
                reset_date.format("%Y-%m-%d")
            ),
            ErrorDetails::QuotaUnavailable { message } => {
                write!(f, "Quota check is temporarily unavailable: {message}")
            }
            ErrorDetails::RateLimitExceeded {
                layer,
                endpoint_class,
                limit,
                retry_after_secs,
                ..
            } => write!(
                f,
                "Rate limit exceeded for `{endpoint_class}` ({limit} requests per window, layer `{layer}`). Retry after {retry_after_secs}s."
            ),
            ErrorDetails::RateLimiterUnavailable { layer, message } => write!(
                f,
                "Rate limiter `{layer}` is temporarily unavailable: {message}"
            ),
            ErrorDetails::Serialization { message } => write!(f, "{message}"),
            ErrorDetails::Upstream { message } => {
                write!(f, "Error forwarding request upstream: {message}")
            }
        }
    }
}

impl IntoResponse for Error {
    /// Convert the error into an Axum response with a machine-readable body
    fn into_response(self) -> Response {
        let details = self.get_details();
        let mut body = json!({
            "error": details.error_code(),
            "message": self.to_string(),
        });
        match details {
            ErrorDetails::RateLimitExceeded {
                layer,
                endpoint_class,
                limit,
                reset_at,
                retry_after_secs,
            } => {
                body["layer"] = json!(layer);
                body["endpoint_class"] = json!(endpoint_class);
                body["limit"] = json!(limit);
                body["remaining"] = json!(0);
                body["reset"] = json!(reset_at.timestamp());
                body["retry_after"] = json!(retry_after_secs);
            }
            ErrorDetails::QuotaExceeded {
                action,
                limit,
                used,
                reset_date,
                upgrade_url,
            } => {
                body["upgrade_url"] = json!(upgrade_url);
                body["action"] = json!(action);
                body["limit"] = json!(limit);
                body["used"] = json!(used);
                body["reset_date"] = json!(reset_date.to_rfc3339());
            }
            _ => {}
        }

        let mut response = (self.status_code(), Json(body)).into_response();
        if let ErrorDetails::RateLimitExceeded {
            limit,
            reset_at,
            retry_after_secs,
            ..
        } = details
        {
            RateLimitHeaders {
                limit: *limit,
                remaining: 0,
                reset_at: *reset_at,
            }
            .apply(response.headers_mut());
            insert_retry_after(response.headers_mut(), *retry_after_secs);
        }
        // Attach the error to the response, so middleware can see what went wrong
        response.extensions_mut().insert(self);
        response
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorDetails::Serialization {
            message: err.to_string(),
        })
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::new(ErrorDetails::PostgresQuery {
            message: err.to_string(),
            function_name: None,
        })
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::new(ErrorDetails::CounterStoreQuery {
            message: err.to_string(),
        })
    }
}
