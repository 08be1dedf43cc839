//! The admission pipeline, run in front of every proxied request:
//! identity resolution, rate limiting, quota enforcement, then the upstream handler.
//! Usage is recorded once the response is known, whether the request was admitted or not.

use std::borrow::Cow;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::uri::PathAndQuery;
use axum::http::{HeaderMap, Method, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::{counter, histogram};
use tokio::time::Instant;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppStateData;
use crate::identity::ClientIdentity;
use crate::metering::RequestOutcome;
use crate::quota::QuotaCheck;
use crate::rate_limiting::RateLimitVerdict;

struct Admitted {
    verdict: RateLimitVerdict,
    quota: QuotaCheck,
}

struct Rejected {
    error: Error,
    /// Set once the rate limiter has decided, so the response still carries its headers
    verdict: Option<RateLimitVerdict>,
}

/// The single spelling of `path` that admission and the upstream both see.
/// Empty and `.` segments are dropped, `..` removes the previous segment,
/// and only the root keeps a trailing slash.
fn canonical_path(path: &str) -> Cow<'_, str> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    let canonical = format!("/{}", segments.join("/"));
    if canonical == path {
        Cow::Borrowed(path)
    } else {
        Cow::Owned(canonical)
    }
}

/// Percent-encoded `.`, `/` or `\` in the path
fn has_encoded_separator(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    ["%2e", "%2f", "%5c"].iter().any(|encoded| lower.contains(encoded))
}

fn with_path(uri: &Uri, path: &str) -> Option<Uri> {
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query).ok()?);
    Uri::from_parts(parts).ok()
}

fn invalid_path(message: String) -> Response {
    counter!("turnstile_requests_total", "outcome" => "invalid").increment(1);
    Error::new(ErrorDetails::InvalidRequest { message }).into_response()
}

fn outcome_label(error: &Error) -> &'static str {
    match error.get_details() {
        ErrorDetails::RateLimitExceeded { .. } => "rate_limited",
        ErrorDetails::QuotaExceeded { .. } => "quota_exceeded",
        _ => "unavailable",
    }
}

async fn admit(
    state: &AppStateData,
    identity: &ClientIdentity,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
) -> Result<Admitted, Rejected> {
    let verdict = state
        .rate_limiter
        .check(identity, path)
        .await
        .map_err(|error| Rejected {
            error,
            verdict: None,
        })?;
    if let Some(denial) = verdict.denial() {
        return Err(Rejected {
            error: denial.to_error(),
            verdict: Some(verdict.clone()),
        });
    }
    match state
        .quota_enforcer
        .check(identity, method, path, headers)
        .await
    {
        Ok(quota) => Ok(Admitted { verdict, quota }),
        Err(error) => Err(Rejected {
            error,
            verdict: Some(verdict),
        }),
    }
}

/// Axum middleware that admits, rejects and meters requests.
///
/// Store failures never surface as 500s: they are 503s, or the check is skipped
/// when the component is configured to fail open.
pub async fn admission_middleware(
    State(state): State<AppStateData>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    if has_encoded_separator(request.uri().path()) {
        return invalid_path("Percent-encoded path separators are not allowed".to_string());
    }
    let path = canonical_path(request.uri().path()).into_owned();
    if path != request.uri().path() {
        match with_path(request.uri(), &path) {
            Some(uri) => *request.uri_mut() = uri,
            None => {
                return invalid_path(format!(
                    "Unsupported request path `{}`",
                    request.uri().path()
                ));
            }
        }
    }
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let method = request.method().clone();
    let identity = state
        .identity_resolver
        .resolve(request.headers(), peer)
        .await;

    let admission = admit(&state, &identity, &method, &path, request.headers()).await;
    histogram!("turnstile_admission_latency_seconds").record(started.elapsed().as_secs_f64());

    let (response, rate_limit_layer) = match admission {
        Ok(Admitted { verdict, quota }) => {
            counter!("turnstile_requests_total", "outcome" => "admitted").increment(1);
            let mut response = next.run(request).await;
            if let Some((user_id, action)) = quota.commit_for(response.status()) {
                state.quota_enforcer.commit(user_id, action).await;
            }
            if let Some(headers) = verdict.headers() {
                headers.apply(response.headers_mut());
            }
            (response, None)
        }
        Err(Rejected { error, verdict }) => {
            counter!("turnstile_requests_total", "outcome" => outcome_label(&error)).increment(1);
            let rate_limit_layer = match error.get_details() {
                ErrorDetails::RateLimitExceeded { layer, .. } => Some(layer.clone()),
                _ => None,
            };
            let mut response = error.into_response();
            if let Some(headers) = verdict.as_ref().and_then(RateLimitVerdict::headers) {
                headers.apply(response.headers_mut());
            }
            (response, rate_limit_layer)
        }
    };

    state.usage_recorder.record(
        &identity,
        RequestOutcome {
            method,
            path,
            status: response.status(),
            elapsed: started.elapsed(),
            rate_limit_layer,
        },
    );
    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{StatusCode, header};
    use axum::middleware::from_fn_with_state;
    use axum::routing::{get, post};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tokio_util::task::TaskTracker;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;
    use crate::config::Config;
    use crate::db::identity::CredentialOwner;
    use crate::db::usage::UsageMetricType;
    use crate::quota::MeteredAction;
    use crate::testing::TestStores;

    struct Harness {
        stores: TestStores,
        tasks: TaskTracker,
        router: Router,
    }

    impl Harness {
        fn new(config: Config) -> Self {
            let stores = TestStores::new();
            let tasks = TaskTracker::new();
            let state =
                AppStateData::new(Arc::new(config), stores.stores(), tasks.clone()).unwrap();
            let router = Router::new()
                .route("/api/v1/cards", get(|| async { "cards" }))
                .route(
                    "/api/v1/readings",
                    post(|| async { (StatusCode::CREATED, "reading") }),
                )
                .route("/api/v1/seance/messages", post(|| async { "the spirits answer" }))
                .route(
                    "/api/v1/broken",
                    get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
                )
                // Stands in for the upstream proxy, which only sees what admission passes on
                .fallback(|uri: Uri| async move { uri.to_string() })
                .layer(from_fn_with_state(state, admission_middleware));
            Self {
                stores,
                tasks,
                router,
            }
        }

        fn member(&self, api_key: &str) -> CredentialOwner {
            let owner = CredentialOwner {
                user_id: Uuid::now_v7(),
                organization_id: Some(Uuid::now_v7()),
                api_key_id: Some(Uuid::now_v7()),
            };
            self.stores.identity.add_api_key(api_key, owner.clone());
            owner
        }

        async fn send(&self, method: Method, path: &str, api_key: Option<&str>) -> Response {
            let mut builder = axum::http::Request::builder()
                .method(method)
                .uri(path)
                .header(header::CONTENT_TYPE, "application/json");
            if let Some(api_key) = api_key {
                builder = builder.header("x-api-key", api_key);
            }
            let mut request = builder.body(Body::from("{}")).unwrap();
            let peer: SocketAddr = "203.0.113.5:41000".parse().unwrap();
            request.extensions_mut().insert(ConnectInfo(peer));
            self.router.clone().oneshot(request).await.unwrap()
        }

        async fn drain(&self) {
            self.tasks.close();
            self.tasks.wait().await;
        }
    }

    fn header_value(response: &Response, name: &str) -> Option<String> {
        response
            .headers()
            .get(name)
            .map(|v| v.to_str().unwrap().to_string())
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_admitted_request_carries_rate_limit_headers() {
        let harness = Harness::new(Config::default());
        let response = harness.send(Method::GET, "/api/v1/cards", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        // The IP layer (300) is more restrictive than the general class (1000)
        assert_eq!(header_value(&response, "x-ratelimit-limit").as_deref(), Some("300"));
        assert_eq!(header_value(&response, "x-ratelimit-remaining").as_deref(), Some("299"));
        assert!(header_value(&response, "x-ratelimit-reset").is_some());
        assert!(header_value(&response, "retry-after").is_none());

        // Anonymous callers are not metered
        harness.drain().await;
        assert!(harness.stores.usage.events().is_empty());
    }

    #[tokio::test]
    async fn test_thirty_first_seance_message_is_rejected() {
        let harness = Harness::new(Config::default());
        harness.member("abc");

        for _ in 0..30 {
            let response = harness
                .send(Method::POST, "/api/v1/seance/messages", Some("abc"))
                .await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = harness
            .send(Method::POST, "/api/v1/seance/messages", Some("abc"))
            .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header_value(&response, "x-ratelimit-limit").as_deref(), Some("30"));
        assert_eq!(header_value(&response, "x-ratelimit-remaining").as_deref(), Some("0"));
        let retry_after: u64 = header_value(&response, "retry-after")
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=3600).contains(&retry_after));
        let body = json_body(response).await;
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert_eq!(body["layer"], "client_hourly");

        harness.drain().await;
        let errors = harness.stores.usage.events_of(UsageMetricType::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].metadata["layer"], "client_hourly");
        assert_eq!(harness.stores.usage.events_of(UsageMetricType::ApiCall).len(), 31);
    }

    #[tokio::test]
    async fn test_eleventh_reading_requires_payment() {
        let harness = Harness::new(Config::default());
        let owner = harness.member("reader");

        for _ in 0..10 {
            let response = harness
                .send(Method::POST, "/api/v1/readings", Some("reader"))
                .await;
            assert_eq!(response.status(), StatusCode::CREATED);
        }
        let record = harness.stores.quota.record(owner.user_id).unwrap();
        assert_eq!(record.used(MeteredAction::Reading), 10);

        let response = harness
            .send(Method::POST, "/api/v1/readings", Some("reader"))
            .await;
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        // Passed rate limiting, so the headers are still present
        assert!(header_value(&response, "x-ratelimit-remaining").is_some());
        let body = json_body(response).await;
        assert_eq!(body["error"], "quota_exceeded");
        assert_eq!(body["upgrade_url"], "/pricing");
        assert_eq!(body["limit"], 10);
        assert_eq!(body["used"], 10);

        let record = harness.stores.quota.record(owner.user_id).unwrap();
        assert_eq!(record.used(MeteredAction::Reading), 10);

        harness.drain().await;
        assert_eq!(harness.stores.usage.events_of(UsageMetricType::Reading).len(), 10);
    }

    #[tokio::test]
    async fn test_subscribers_are_not_limited_by_quota() {
        let harness = Harness::new(Config::default());
        let owner = harness.member("subscriber");
        harness.stores.quota.add_subscription(owner.user_id);

        for _ in 0..12 {
            let response = harness
                .send(Method::POST, "/api/v1/readings", Some("subscriber"))
                .await;
            assert_eq!(response.status(), StatusCode::CREATED);
        }
        assert!(harness.stores.quota.record(owner.user_id).is_none());
    }

    #[tokio::test]
    async fn test_counter_store_outage_is_a_503() {
        let harness = Harness::new(Config::default());
        harness.stores.counters.set_unavailable(true);

        let response = harness.send(Method::GET, "/api/v1/cards", None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(header_value(&response, "x-ratelimit-limit").is_none());
        let body = json_body(response).await;
        assert_eq!(body["error"], "service_unavailable");
    }

    #[tokio::test]
    async fn test_quota_store_outage_fails_open() {
        let harness = Harness::new(Config::default());
        harness.member("reader");
        harness.stores.quota.set_unavailable(true);

        let response = harness
            .send(Method::POST, "/api/v1/readings", Some("reader"))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_failed_upstream_response_does_not_use_quota() {
        let harness = Harness::new(Config::default());
        harness.member("abc");

        let response = harness.send(Method::GET, "/api/v1/broken", Some("abc")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(header_value(&response, "x-ratelimit-limit").is_some());

        harness.drain().await;
        let calls = harness.stores.usage.events_of(UsageMetricType::ApiCall);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].metadata["status"], 500);
    }

    #[tokio::test]
    async fn test_usage_store_outage_does_not_affect_response() {
        let harness = Harness::new(Config::default());
        harness.member("abc");
        harness.stores.usage.set_unavailable(true);

        let response = harness.send(Method::GET, "/api/v1/cards", Some("abc")).await;
        assert_eq!(response.status(), StatusCode::OK);
        harness.drain().await;
        assert!(harness.stores.usage.events().is_empty());
    }

    #[test]
    fn test_canonical_path() {
        assert_eq!(canonical_path("/api/v1/readings"), "/api/v1/readings");
        assert!(matches!(canonical_path("/api/v1/readings"), Cow::Borrowed(_)));
        assert_eq!(canonical_path("/"), "/");
        assert_eq!(canonical_path("//"), "/");
        assert_eq!(canonical_path("/api/v1/readings/"), "/api/v1/readings");
        assert_eq!(canonical_path("/api/v1//seance///messages"), "/api/v1/seance/messages");
        assert_eq!(canonical_path("/api/v1/./cards"), "/api/v1/cards");
        assert_eq!(canonical_path("/api/v1/cards/../seance/messages"), "/api/v1/seance/messages");
        assert_eq!(canonical_path("/../../api"), "/api");
    }

    #[tokio::test]
    async fn test_encoded_separators_are_rejected() {
        let harness = Harness::new(Config::default());
        harness.member("abc");

        for path in [
            "/api/v1/cards/%2e%2e/seance/messages",
            "/api/v1%2Fseance/messages",
            "/api/v1/cards/%5C..%5Cseance",
        ] {
            let response = harness.send(Method::POST, path, Some("abc")).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
            assert_eq!(json_body(response).await["error"], "invalid_request");
        }
        assert_eq!(harness.stores.counters.hits(), 0);
    }

    #[tokio::test]
    async fn test_path_spellings_share_the_seance_limit() {
        let harness = Harness::new(Config::default());
        harness.member("abc");

        for _ in 0..30 {
            let response = harness
                .send(Method::POST, "/api/v1/seance/messages", Some("abc"))
                .await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        for path in [
            "/api/v1//seance/messages",
            "/api/v1/seance/messages/",
            "/api/v1/cards/../seance/messages",
        ] {
            let response = harness.send(Method::POST, path, Some("abc")).await;
            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS, "{path}");
            assert_eq!(
                header_value(&response, "x-ratelimit-limit").as_deref(),
                Some("30"),
                "{path}"
            );
        }
    }

    #[tokio::test]
    async fn test_trailing_slash_reading_still_requires_payment() {
        let harness = Harness::new(Config::default());
        let owner = harness.member("reader");

        for _ in 0..10 {
            let response = harness
                .send(Method::POST, "/api/v1/readings", Some("reader"))
                .await;
            assert_eq!(response.status(), StatusCode::CREATED);
        }
        for path in ["/api/v1/readings/", "/api/v1//readings", "/api/v1/./readings"] {
            let response = harness.send(Method::POST, path, Some("reader")).await;
            assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED, "{path}");
        }
        let record = harness.stores.quota.record(owner.user_id).unwrap();
        assert_eq!(record.used(MeteredAction::Reading), 10);
    }

    #[tokio::test]
    async fn test_inner_handler_and_metering_see_canonical_path() {
        let harness = Harness::new(Config::default());
        harness.member("abc");

        let response = harness
            .send(Method::GET, "/api//v1/./spreads/?page=2", Some("abc"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"/api/v1/spreads?page=2");

        harness.drain().await;
        let calls = harness.stores.usage.events_of(UsageMetricType::ApiCall);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].metadata["endpoint"], "/api/v1/spreads");
    }
}
