//! Rate limiting middleware for HTTP requests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::{HeaderMap, HeaderName, StatusCode};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::ratelimit::{Decision, RateLimiter};
use crate::store::CallContext;

/// Body returned with `429 Too Many Requests`.
pub const THROTTLED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed \
     within a certain time frame";

/// Address used when no forwarding header or peer address is available.
const UNKNOWN_ADDRESS: &str = "unknown";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Shared state for the rate limiting middleware.
#[derive(Clone)]
pub struct GuardState {
    limiter: Arc<RateLimiter>,
    credential_header: HeaderName,
    trust_forwarded_headers: bool,
    decision_timeout: Duration,
    shutdown: CancellationToken,
}

impl GuardState {
    /// Build middleware state from server settings.
    ///
    /// `shutdown` is cancelled when the server stops, which aborts any
    /// store calls still in flight.
    pub fn new(
        limiter: Arc<RateLimiter>,
        config: &ServerConfig,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            limiter,
            credential_header: config.credential_header_name()?,
            trust_forwarded_headers: config.trust_forwarded_headers,
            decision_timeout: config.decision_timeout,
            shutdown,
        })
    }

    fn call_context(&self) -> CallContext {
        CallContext::new()
            .with_cancellation(self.shutdown.child_token())
            .with_timeout(self.decision_timeout)
    }

    /// Resolve the client address for a request.
    ///
    /// Forwarding headers win over the peer address when they are trusted.
    fn client_address(&self, request: &Request) -> String {
        if self.trust_forwarded_headers {
            if let Some(address) = forwarded_address(request.headers()) {
                return address;
            }
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(peer)| peer.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
    }

    fn credential(&self, request: &Request) -> String {
        request
            .headers()
            .get(&self.credential_header)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .unwrap_or_default()
    }
}

/// Admit or reject a request according to the rate limiter.
///
/// Throttled clients get `429`. A limiter failure gets `500` so clients can
/// tell the two apart.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn rate_limit(State(state): State<GuardState>, request: Request, next: Next) -> Response {
    let address = state.client_address(&request);
    let credential = state.credential(&request);
    let ctx = state.call_context();

    match state.limiter.allow(&ctx, &address, &credential).await {
        Ok(Decision::Allow) => next.run(request).await,
        Ok(Decision::Deny) => {
            debug!(
                address = %address,
                has_credential = !credential.is_empty(),
                "Request throttled"
            );
            let body = Json(json!({ "error": THROTTLED_MESSAGE }));
            (StatusCode::TOO_MANY_REQUESTS, body).into_response()
        }
        Err(e) => {
            error!(error = %e, key = e.key(), "Rate limiter failed to decide");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "rate limiter unavailable" })),
            )
                .into_response()
        }
    }
}

/// First address from `X-Forwarded-For`, else `X-Real-IP`.
fn forwarded_address(headers: &HeaderMap) -> Option<String> {
    let from_header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    from_header(X_FORWARDED_FOR).or_else(|| from_header(X_REAL_IP))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::http::router;
    use crate::ratelimit::LimitPolicy;
    use crate::store::{CounterStore, MemoryStore};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::Router;
    use tower::ServiceExt;

    fn app_with(
        store: Arc<dyn CounterStore>,
        policy: LimitPolicy,
        config: &ServerConfig,
    ) -> Router {
        let limiter = Arc::new(RateLimiter::new(store, policy));
        let state = GuardState::new(limiter, config, CancellationToken::new()).unwrap();
        router(state)
    }

    fn app(ip_limit: u64, token_limit: u64) -> Router {
        app_with(
            Arc::new(MemoryStore::new()),
            LimitPolicy::new(ip_limit, token_limit, Duration::from_secs(5)),
            &ServerConfig::default(),
        )
    }

    fn request_from(peer: &str) -> http::request::Builder {
        let peer: SocketAddr = peer.parse().unwrap();
        let mut builder = http::Request::builder().uri("/");
        if let Some(extensions) = builder.extensions_mut() {
            extensions.insert(ConnectInfo(peer));
        }
        builder
    }

    async fn send(app: &Router, request: http::Request<Body>) -> (StatusCode, String) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_rate_limit() {
        let app = app(3, 10);

        for i in 0..3 {
            let request = request_from("192.168.1.1:12345").body(Body::empty()).unwrap();
            let (status, _) = send(&app, request).await;
            assert_eq!(status, StatusCode::OK, "request {} should succeed", i + 1);
        }

        let request = request_from("192.168.1.1:12345").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body.contains(THROTTLED_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_header_rate_limit() {
        let app = app(3, 5);

        for _ in 0..5 {
            let request = request_from("192.168.1.1:12345")
                .header("API_KEY", "test-token")
                .body(Body::empty())
                .unwrap();
            assert_eq!(send(&app, request).await.0, StatusCode::OK);
        }

        let request = request_from("192.168.1.1:12345")
            .header("API_KEY", "test-token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, request).await.0, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_peers_are_independent() {
        let app = app(2, 10);

        for peer in ["192.168.1.1:12345", "192.168.1.2:12345", "192.168.1.3:12345"] {
            for _ in 0..2 {
                let request = request_from(peer).body(Body::empty()).unwrap();
                assert_eq!(send(&app, request).await.0, StatusCode::OK, "peer {peer}");
            }

            let request = request_from(peer).body(Body::empty()).unwrap();
            assert_eq!(send(&app, request).await.0, StatusCode::TOO_MANY_REQUESTS, "peer {peer}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarded_for_takes_precedence() {
        let app = app(2, 10);

        for _ in 0..2 {
            let request = request_from("10.0.0.1:12345")
                .header("X-Forwarded-For", "192.168.1.100, 10.0.0.1")
                .body(Body::empty())
                .unwrap();
            assert_eq!(send(&app, request).await.0, StatusCode::OK);
        }

        let request = request_from("10.0.0.1:12345")
            .header("X-Forwarded-For", "192.168.1.100")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, request).await.0, StatusCode::TOO_MANY_REQUESTS);

        // The proxy's own address has not been counted
        let request = request_from("10.0.0.1:12345").body(Body::empty()).unwrap();
        assert_eq!(send(&app, request).await.0, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarded_headers_ignored_when_untrusted() {
        let config = ServerConfig {
            trust_forwarded_headers: false,
            ..ServerConfig::default()
        };
        let app = app_with(
            Arc::new(MemoryStore::new()),
            LimitPolicy::new(1, 10, Duration::from_secs(5)),
            &config,
        );

        let request = request_from("10.0.0.1:12345")
            .header("X-Forwarded-For", "192.168.1.100")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, request).await.0, StatusCode::OK);

        let request = request_from("10.0.0.1:12345")
            .header("X-Forwarded-For", "192.168.1.200")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, request).await.0, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_is_not_throttled() {
        let app = app(0, 0);

        for _ in 0..5 {
            let request = request_from("192.168.1.1:12345")
                .uri("/health")
                .body(Body::empty())
                .unwrap();
            assert_eq!(send(&app, request).await.0, StatusCode::OK);
        }
    }

    struct UnavailableStore;

    #[async_trait]
    impl CounterStore for UnavailableStore {
        async fn increment(
            &self,
            _ctx: &CallContext,
            _key: &str,
            _window: Duration,
        ) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(500)))
        }

        async fn get(
            &self,
            _ctx: &CallContext,
            _key: &str,
        ) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(500)))
        }

        async fn set_block(
            &self,
            _ctx: &CallContext,
            _key: &str,
            _cooldown: Duration,
        ) -> std::result::Result<(), StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(500)))
        }

        async fn is_blocked(
            &self,
            _ctx: &CallContext,
            _key: &str,
        ) -> std::result::Result<bool, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(500)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_is_server_error() {
        let app = app_with(
            Arc::new(UnavailableStore),
            LimitPolicy::new(10, 10, Duration::from_secs(5)),
            &ServerConfig::default(),
        );

        let request = request_from("192.168.1.1:12345").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.contains(THROTTLED_MESSAGE));
    }

    #[test]
    fn test_forwarded_address_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_address(&headers), None);

        headers.insert(X_REAL_IP, "172.16.0.9".parse().unwrap());
        assert_eq!(forwarded_address(&headers).as_deref(), Some("172.16.0.9"));

        headers.insert(X_FORWARDED_FOR, " 203.0.113.7 , 10.0.0.1".parse().unwrap());
        assert_eq!(forwarded_address(&headers).as_deref(), Some("203.0.113.7"));
    }
}
