//! # HTTP 入口
//!
//! 把 axum 请求转换为 [`ProxyRequest`]，再把 [`ProxyOutcome`] 转换为 HTTP 响应

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::caller::{CallerIdentity, resolve_source_address};
use super::orchestrator::ProxyOrchestrator;
use super::types::{ProxyOutcome, ProxyRequest};
use crate::config::ServerConfig;
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;

pub const X_CACHE: &str = "x-cache";
pub const X_REQUEST_ID: &str = "x-request-id";

/// 路由共享状态
#[derive(Clone)]
pub struct ProxyState {
    orchestrator: Arc<ProxyOrchestrator>,
    body_limit: usize,
    trust_forwarded_headers: bool,
}

impl ProxyState {
    pub fn new(orchestrator: Arc<ProxyOrchestrator>, server: &ServerConfig) -> Self {
        Self {
            orchestrator,
            body_limit: server.request_body_limit,
            trust_forwarded_headers: server.trust_forwarded_headers,
        }
    }
}

fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), ToString::to_string)
}

/// `POST /chat/completions`
pub async fn chat_completions(State(state): State<ProxyState>, request: Request) -> Response {
    let request_id = request_id_from(request.headers());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let source = resolve_source_address(request.headers(), peer, state.trust_forwarded_headers);
    let caller = CallerIdentity::from_source(&source);

    let body = match to_bytes(request.into_body(), state.body_limit).await {
        Ok(body) => body,
        Err(e) => {
            lwarn!(
                request_id,
                LogStage::RequestStart,
                LogComponent::Proxy,
                "body_read_failed",
                "读取请求体失败",
                error = %e
            );
            let outcome = ProxyOutcome::Invalid {
                message: "Request body too large or unreadable".to_string(),
            };
            return with_request_id(outcome.into_response(), &request_id);
        }
    };

    let outcome = state
        .orchestrator
        .handle(ProxyRequest {
            request_id: request_id.clone(),
            caller,
            body,
        })
        .await;

    with_request_id(outcome.into_response(), &request_id)
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

impl IntoResponse for ProxyOutcome {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            Self::Success {
                payload,
                cache_status,
            } => Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/json")
                .header(X_CACHE, cache_status.as_header_value())
                .body(Body::from(payload))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
            failure => {
                let body = json!({
                    "error": failure.error_message().unwrap_or_default(),
                    "code": failure.error_code().unwrap_or("INTERNAL_ERROR"),
                });
                (status, Json(body)).into_response()
            }
        }
    }
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    if server.cors_origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let origins = server
        .cors_origins
        .iter()
        .map(|origin| origin.parse::<HeaderValue>())
        .collect::<std::result::Result<Vec<_>, _>>();
    match origins {
        Ok(origins) => layer.allow_origin(origins),
        Err(e) => {
            lwarn!(
                "system",
                LogStage::Startup,
                LogComponent::ServerSetup,
                "cors_config_fail",
                &format!("Invalid CORS origin configuration: {e}, falling back to allow any")
            );
            layer.allow_origin(Any)
        }
    }
}

/// 创建路由器
pub fn create_router(state: ProxyState, server: &ServerConfig) -> Router {
    let app = Router::new()
        .route("/", post(chat_completions))
        .route("/chat/completions", post(chat_completions))
        .route("/health", get(health))
        .with_state(state);

    let service_builder = ServiceBuilder::new().layer(TraceLayer::new_for_http());
    if server.enable_cors {
        app.layer(service_builder.layer(cors_layer(server)))
    } else {
        app.layer(service_builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::{AppConfig, MockSecretProvider};
    use crate::proxy::orchestrator::OrchestratorDeps;
    use crate::proxy::upstream::MockUpstreamClient;
    use crate::statistics::TracingUsageSink;
    use crate::utils::SystemClock;
    use bytes::Bytes;
    use serde_json::Value;
    use tower::ServiceExt;

    const PAYLOAD: &str = r#"{"id":"r1","choices":[{"message":{"content":"ok"}}]}"#;

    fn router(config: &AppConfig, upstream_calls: usize) -> Router {
        let mut upstream = MockUpstreamClient::new();
        upstream
            .expect_complete()
            .times(upstream_calls)
            .returning(|_, _| Ok(Bytes::from_static(PAYLOAD.as_bytes())));
        let mut secrets = MockSecretProvider::new();
        secrets
            .expect_get_secret()
            .returning(|_| Ok(Some("k".to_string())));

        let clock = Arc::new(SystemClock);
        let orchestrator = ProxyOrchestrator::new(
            config,
            OrchestratorDeps {
                store: Arc::new(MemoryCache::new(128, clock.clone())),
                upstream: Arc::new(upstream),
                secrets: Arc::new(secrets),
                usage_sink: Arc::new(TracingUsageSink),
                clock,
            },
        );
        create_router(
            ProxyState::new(Arc::new(orchestrator), &config.server),
            &config.server,
        )
    }

    fn post_json(uri: &str, body: &str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-real-ip", "203.0.113.7")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = router(&AppConfig::default(), 0)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn success_sets_cache_header_and_passes_payload_through() {
        let app = router(&AppConfig::default(), 1);
        let body = r#"{"messages":[{"role":"user","content":"hi"}]}"#;

        let first = app.clone().oneshot(post_json("/chat/completions", body)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[X_CACHE], "MISS");
        assert_eq!(first.headers()[header::CONTENT_TYPE], "application/json");
        assert!(first.headers().contains_key(X_REQUEST_ID));
        let bytes = to_bytes(first.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes, PAYLOAD.as_bytes());

        let second = app.oneshot(post_json("/", body)).await.unwrap();
        assert_eq!(second.headers()[X_CACHE], "HIT");
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let response = router(&AppConfig::default(), 0)
            .oneshot(post_json("/chat/completions", "{oops"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            json!({"error": "Invalid JSON body", "code": "INVALID_REQUEST"})
        );
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_processing() {
        let mut config = AppConfig::default();
        config.server.request_body_limit = 16;
        let response = router(&config, 0)
            .oneshot(post_json(
                "/chat/completions",
                r#"{"messages":[{"role":"user","content":"a long question"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().contains_key(X_REQUEST_ID));
        assert_eq!(
            json_body(response).await,
            json!({"error": "Request body too large or unreadable", "code": "INVALID_REQUEST"})
        );
    }

    #[tokio::test]
    async fn echoes_caller_request_id() {
        let mut request = post_json("/chat/completions", "{}");
        request
            .headers_mut()
            .insert(X_REQUEST_ID, HeaderValue::from_static("abc-123"));
        let response = router(&AppConfig::default(), 0).oneshot(request).await.unwrap();

        assert_eq!(response.headers()[X_REQUEST_ID], "abc-123");
        assert_eq!(
            json_body(response).await["error"],
            "Messages are required"
        );
    }

    #[tokio::test]
    async fn cors_preflight_is_answered() {
        let response = router(&AppConfig::default(), 0)
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/chat/completions")
                    .header(header::ORIGIN, "https://app.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }

    #[test]
    fn rate_limited_outcome_renders_error_body() {
        let response = ProxyOutcome::RateLimited { window: None }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
