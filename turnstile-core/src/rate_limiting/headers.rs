use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Values advertised to the caller on every rate-limited response.
///
/// When several layers apply to a request, the caller sees the most restrictive one
/// (the layer with the fewest remaining requests).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitHeaders {
    /// `x-ratelimit-reset` is the window end as epoch seconds.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_at.timestamp()));
    }
}

pub fn insert_retry_after(headers: &mut HeaderMap, retry_after_secs: u64) {
    headers.insert(
        axum::http::header::RETRY_AFTER,
        HeaderValue::from(retry_after_secs),
    );
}
