//! Monthly quota enforcement for metered write endpoints.
//!
//! The check and the commit are separate store operations. Concurrent requests from one
//! user can all pass the check before any of them commits, so a user can exceed their
//! limit by at most the number of metered requests they have in flight at once.

use std::sync::Arc;

use axum::http::{HeaderMap, Method, StatusCode, header};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{FailureMode, MeteredEndpointConfig, QuotaConfig};
use crate::db::quota::{QuotaQueries, QuotaRecord};
use crate::error::{Error, ErrorDetails};
use crate::identity::ClientIdentity;

mod reset_job;

pub use reset_job::QuotaResetJob;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MeteredAction {
    Reading,
    LlmCall,
}

impl MeteredAction {
    pub fn as_str(self) -> &'static str {
        match self {
            MeteredAction::Reading => "reading",
            MeteredAction::LlmCall => "llm_call",
        }
    }
}

/// First instant (00:00 UTC) of the calendar month after `now`
pub fn next_reset_date(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map_or(DateTime::<Utc>::MAX_UTC, |date| date.and_utc())
}

/// The media type of a `Content-Type` header, without parameters, lower-cased
fn media_type(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let media_type = value.split(';').next()?.trim();
    (!media_type.is_empty()).then(|| media_type.to_ascii_lowercase())
}

/// A metered write endpoint. Matching is exact on method, path and media type,
/// never by prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeteredEndpoint {
    pub method: Method,
    pub path: String,
    pub content_type: String,
    pub action: MeteredAction,
    pub success_status: StatusCode,
}

impl MeteredEndpoint {
    pub fn from_config(config: &MeteredEndpointConfig) -> Result<Self, Error> {
        let method = Method::from_bytes(config.method.as_bytes()).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid metered endpoint method `{}`: {e}", config.method),
            })
        })?;
        let success_status = StatusCode::from_u16(config.success_status).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!(
                    "Invalid metered endpoint success status `{}`: {e}",
                    config.success_status
                ),
            })
        })?;
        Ok(Self {
            method,
            path: config.path.clone(),
            content_type: config.content_type.to_ascii_lowercase(),
            action: config.action,
            success_status,
        })
    }

    pub fn matches(&self, method: &Method, path: &str, headers: &HeaderMap) -> bool {
        self.method == *method
            && self.path == path
            && media_type(headers).is_some_and(|media_type| media_type == self.content_type)
    }
}

/// Result of a quota check that did not deny the request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuotaCheck {
    /// Not a metered endpoint, or the caller did not resolve to a user
    NotMetered,
    /// The user has an active subscription
    Unlimited,
    Allowed {
        user_id: Uuid,
        action: MeteredAction,
        success_status: StatusCode,
        /// Uses left before this request
        remaining: i64,
    },
    /// The quota store could not answer and the enforcer is configured to fail open
    Degraded {
        user_id: Uuid,
        action: MeteredAction,
        success_status: StatusCode,
    },
}

impl QuotaCheck {
    /// The usage to commit once the upstream has answered with `status`
    pub fn commit_for(&self, status: StatusCode) -> Option<(Uuid, MeteredAction)> {
        match self {
            QuotaCheck::Allowed {
                user_id,
                action,
                success_status,
                ..
            }
            | QuotaCheck::Degraded {
                user_id,
                action,
                success_status,
            } if *success_status == status => Some((*user_id, *action)),
            _ => None,
        }
    }
}

enum Evaluation {
    Unlimited,
    Within(QuotaRecord),
    Exhausted(QuotaRecord),
}

pub struct QuotaEnforcer {
    queries: Arc<dyn QuotaQueries>,
    enabled: bool,
    endpoints: Vec<MeteredEndpoint>,
    failure_mode: FailureMode,
    upgrade_url: String,
    default_monthly_limit: i64,
    default_llm_calls_limit: i64,
}

impl QuotaEnforcer {
    pub fn new(queries: Arc<dyn QuotaQueries>, config: &QuotaConfig) -> Result<Self, Error> {
        let endpoints = config
            .metered_endpoints
            .iter()
            .map(MeteredEndpoint::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            queries,
            enabled: config.enabled,
            endpoints,
            failure_mode: config.failure_mode,
            upgrade_url: config.upgrade_url.clone(),
            default_monthly_limit: config.default_monthly_limit,
            default_llm_calls_limit: config.default_llm_calls_limit,
        })
    }

    pub fn metered_endpoint(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> Option<&MeteredEndpoint> {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.matches(method, path, headers))
    }

    /// Decides whether a metered action may proceed. Denials are returned as
    /// `QuotaExceeded`; store failures follow the configured failure mode.
    #[tracing::instrument(skip_all, fields(path = %path))]
    pub async fn check(
        &self,
        identity: &ClientIdentity,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<QuotaCheck, Error> {
        if !self.enabled {
            return Ok(QuotaCheck::NotMetered);
        }
        let Some(endpoint) = self.metered_endpoint(method, path, headers) else {
            return Ok(QuotaCheck::NotMetered);
        };
        let Some(user_id) = identity.resolved_user_id() else {
            tracing::debug!("Skipping quota check for a caller without a resolved user");
            return Ok(QuotaCheck::NotMetered);
        };
        let action = endpoint.action;

        match self.evaluate(user_id, action, Utc::now()).await {
            Ok(Evaluation::Unlimited) => Ok(QuotaCheck::Unlimited),
            Ok(Evaluation::Within(record)) => Ok(QuotaCheck::Allowed {
                user_id,
                action,
                success_status: endpoint.success_status,
                remaining: record.limit(action) - record.used(action),
            }),
            Ok(Evaluation::Exhausted(record)) => {
                counter!("turnstile_quota_denials_total", "action" => action.as_str())
                    .increment(1);
                Err(Error::new(ErrorDetails::QuotaExceeded {
                    action,
                    limit: record.limit(action),
                    used: record.used(action),
                    reset_date: record.reset_date,
                    upgrade_url: self.upgrade_url.clone(),
                }))
            }
            Err(e) => match self.failure_mode {
                FailureMode::FailOpen => {
                    tracing::warn!(%user_id, "Quota store unavailable, allowing request: {e}");
                    counter!("turnstile_degraded_checks_total", "component" => "quota")
                        .increment(1);
                    Ok(QuotaCheck::Degraded {
                        user_id,
                        action,
                        success_status: endpoint.success_status,
                    })
                }
                FailureMode::FailClosed => Err(Error::new_without_logging(
                    ErrorDetails::QuotaUnavailable {
                        message: e.to_string(),
                    },
                )),
            },
        }
    }

    async fn evaluate(
        &self,
        user_id: Uuid,
        action: MeteredAction,
        now: DateTime<Utc>,
    ) -> Result<Evaluation, Error> {
        if self.queries.has_active_subscription(user_id, now).await? {
            return Ok(Evaluation::Unlimited);
        }
        let defaults = QuotaRecord::new(
            user_id,
            self.default_monthly_limit,
            self.default_llm_calls_limit,
            next_reset_date(now),
        );
        let mut record = self.queries.get_or_create_quota_record(&defaults).await?;
        if record.is_reset_due(now) {
            record = self
                .queries
                .reset_quota_record_if_due(user_id, now, next_reset_date(now))
                .await?;
        }
        if record.used(action) >= record.limit(action) {
            Ok(Evaluation::Exhausted(record))
        } else {
            Ok(Evaluation::Within(record))
        }
    }

    /// Records one use of `action`. Failures are logged and otherwise ignored:
    /// the response has already been decided.
    pub async fn commit(&self, user_id: Uuid, action: MeteredAction) {
        if let Err(e) = self.queries.increment_quota_usage(user_id, action).await {
            tracing::warn!(
                %user_id,
                action = action.as_str(),
                "Failed to record quota usage: {e}"
            );
        }
    }
}
