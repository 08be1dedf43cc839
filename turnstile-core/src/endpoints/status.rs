use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use futures::join;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::gateway_util::{AppState, AppStateData};
use crate::health::{PoolHealth, classify};

pub const TURNSTILE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A handler for a simple liveness check
pub async fn status_handler() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        version: TURNSTILE_VERSION.to_string(),
    })
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
}

/// A handler for a health check that includes availability of the backing stores
pub async fn health_handler(
    State(AppStateData {
        counter_store_health,
        relational_health,
        ..
    }): AppState,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let (counter_store_result, relational_result) =
        join!(counter_store_health.health(), relational_health.health());

    if counter_store_result.is_ok() && relational_result.is_ok() {
        return Ok(Json(json!({
            "gateway": "ok",
            "counter_store": "ok",
            "relational": "ok",
        })));
    }

    Err((
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "gateway": "ok",
            "counter_store": if counter_store_result.is_ok() { "ok" } else { "error" },
            "relational": if relational_result.is_ok() { "ok" } else { "error" },
        })),
    ))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PoolReport {
    pub pool: String,
    pub size: u32,
    pub in_use: u32,
    pub idle: u32,
    pub waiting: u32,
    pub health: PoolHealth,
}

/// Current statistics for every connection pool, for operators
pub async fn pools_handler(
    State(AppStateData {
        config,
        monitored_pools,
        ..
    }): AppState,
) -> Json<Vec<PoolReport>> {
    let reports = monitored_pools
        .iter()
        .map(|pool| {
            let stats = pool.stats();
            let health = classify(&stats, config.health.saturation_warn_ratio);
            PoolReport {
                pool: stats.pool,
                size: stats.size,
                in_use: stats.in_use,
                idle: stats.idle,
                waiting: stats.waiting,
                health,
            }
        })
        .collect();
    Json(reports)
}
