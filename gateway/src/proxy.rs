//! Forwards admitted requests to the upstream application and streams its response back.

use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, Uri, header};
use axum::response::Response;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use turnstile_core::error::{Error, ErrorDetails};
use url::Url;

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in `Connection` are hop-by-hop as well
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP_HEADERS.iter()) {
        headers.remove(name);
    }
}

fn upstream_error(message: impl Into<String>) -> Error {
    Error::new(ErrorDetails::Upstream {
        message: message.into(),
    })
}

#[derive(Clone)]
pub struct ProxyState {
    client: reqwest::Client,
    upstream: Url,
    max_body_bytes: usize,
}

impl ProxyState {
    /// `timeout` bounds connecting and each read, not the whole exchange,
    /// so long-lived streaming responses are not cut off
    pub fn new(upstream: Url, timeout: Duration, max_body_bytes: usize) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| upstream_error(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            upstream,
            max_body_bytes,
        })
    }

    fn upstream_url(&self, uri: &Uri) -> Url {
        let mut url = self.upstream.clone();
        let base = self.upstream.path().trim_end_matches('/');
        url.set_path(&format!("{base}{}", uri.path()));
        url.set_query(uri.query());
        url
    }
}

/// Fallback handler for every route that is not served by the gateway itself
pub async fn proxy_handler(
    State(proxy): State<ProxyState>,
    request: Request,
) -> Result<Response, Error> {
    let (parts, body) = request.into_parts();
    let url = proxy.upstream_url(&parts.uri);
    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);

    let body = Limited::new(body, proxy.max_body_bytes)
        .collect()
        .await
        .map_err(|e| {
            if e.is::<LengthLimitError>() {
                Error::new(ErrorDetails::PayloadTooLarge {
                    limit_bytes: proxy.max_body_bytes,
                })
            } else {
                upstream_error(format!("Failed to read request body: {e}"))
            }
        })?
        .to_bytes();

    let upstream_response = proxy
        .client
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| upstream_error(e.to_string()))?;

    let status = upstream_response.status();
    let mut response_headers = upstream_response.headers().clone();
    strip_hop_by_hop(&mut response_headers);
    let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderValue, Method, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    async fn echo(request: Request) -> axum::Json<Value> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        axum::Json(json!({
            "method": parts.method.as_str(),
            "path": parts.uri.path(),
            "query": parts.uri.query(),
            "x_custom": parts.headers.get("x-custom").map(|v| v.to_str().unwrap()),
            "keep_alive": parts.headers.get("keep-alive").is_some(),
            "x_hop": parts.headers.get("x-hop").is_some(),
            "body": String::from_utf8(body.to_vec()).unwrap(),
        }))
    }

    async fn spawn_upstream() -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().fallback(echo))
                .await
                .unwrap();
        });
        Url::parse(&format!("http://{address}")).unwrap()
    }

    fn proxy_router(upstream: Url) -> Router {
        proxy_router_with_limit(upstream, 1024 * 1024)
    }

    fn proxy_router_with_limit(upstream: Url, max_body_bytes: usize) -> Router {
        let state = ProxyState::new(upstream, Duration::from_secs(5), max_body_bytes).unwrap();
        Router::new().fallback(proxy_handler).with_state(state)
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-hop"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-hop", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[test]
    fn test_upstream_url_keeps_base_path() {
        let state = ProxyState::new(
            Url::parse("http://app:3000/backend/").unwrap(),
            Duration::from_secs(5),
            1024,
        )
        .unwrap();
        let uri: Uri = "/api/v1/cards?page=2".parse().unwrap();
        assert_eq!(
            state.upstream_url(&uri).as_str(),
            "http://app:3000/backend/api/v1/cards?page=2"
        );
    }

    #[tokio::test]
    async fn test_forwards_request_and_response() {
        let router = proxy_router(spawn_upstream().await);
        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/v1/readings?spread=celtic")
            .header("x-custom", "tarot")
            .header(header::CONNECTION, "x-hop")
            .header("x-hop", "1")
            .header("keep-alive", "timeout=5")
            .body(Body::from(r#"{"question":"?"}"#))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let echoed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["path"], "/api/v1/readings");
        assert_eq!(echoed["query"], "spread=celtic");
        assert_eq!(echoed["x_custom"], "tarot");
        assert_eq!(echoed["keep_alive"], false);
        assert_eq!(echoed["x_hop"], false);
        assert_eq!(echoed["body"], r#"{"question":"?"}"#);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_a_502() {
        // Bind then drop, so nothing is listening on the port
        let address = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let router = proxy_router(Url::parse(&format!("http://{address}")).unwrap());
        let request = axum::http::Request::builder()
            .uri("/api/v1/cards")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "upstream_unavailable");
    }

    #[tokio::test]
    async fn test_oversize_body_is_rejected_before_forwarding() {
        let upstream = spawn_upstream().await;
        let router = proxy_router_with_limit(upstream, 16);

        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/v1/readings")
            .body(Body::from(vec![b'x'; 17]))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "payload_too_large");

        // A body at the limit is forwarded
        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/v1/readings")
            .body(Body::from(vec![b'x'; 16]))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
