//! # 代理编排器
//!
//! 单次请求的处理流程：
//!
//! ```text
//! 校验 → 速率检查 → 指纹 + 缓存查找 → 补齐默认值 → 读取密钥 → 调用上游
//!      → 计数 + 写缓存 + 记录用量 → 成功
//! ```
//!
//! 任一步失败都折叠为 [`ProxyOutcome`] 的某个变体。只有上游成功才会消耗配额、
//! 写入缓存；缓存命中不消耗配额。

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde_json::Value;

use super::caller::CallerIdentity;
use super::fingerprint::RequestFingerprint;
use super::rate_limiter::{RateDecision, RateLimiter};
use super::request_transform::RequestTransformer;
use super::response_cache::ResponseCache;
use super::types::{CacheStatus, ChatMessage, CompletionRequest, ProxyOutcome, ProxyRequest};
use super::upstream::UpstreamClient;
use crate::cache::CacheProvider;
use crate::config::{AppConfig, SecretProvider};
use crate::error::NetworkError;
use crate::logging::{LogComponent, LogStage};
use crate::statistics::{UsageRecord, UsageRecorder, UsageSink};
use crate::utils::Clock;
use crate::{ldebug, lerror, linfo, lwarn};

const MISSING_API_KEY: &str = "API key not configured";

/// 代理编排器依赖的外部协作者
pub struct OrchestratorDeps {
    pub store: Arc<dyn CacheProvider>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub secrets: Arc<dyn SecretProvider>,
    pub usage_sink: Arc<dyn UsageSink>,
    pub clock: Arc<dyn Clock>,
}

pub struct ProxyOrchestrator {
    rate_limiter: RateLimiter,
    response_cache: ResponseCache,
    transformer: RequestTransformer,
    upstream: Arc<dyn UpstreamClient>,
    secrets: Arc<dyn SecretProvider>,
    usage: UsageRecorder,
    clock: Arc<dyn Clock>,
    api_key_secret: String,
    upstream_name: String,
}

impl ProxyOrchestrator {
    #[must_use]
    pub fn new(config: &AppConfig, deps: OrchestratorDeps) -> Self {
        let OrchestratorDeps {
            store,
            upstream,
            secrets,
            usage_sink,
            clock,
        } = deps;

        Self {
            rate_limiter: RateLimiter::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                config.rate_limit.clone(),
            ),
            response_cache: ResponseCache::new(
                store,
                Arc::clone(&clock),
                config.cache.freshness_ttl(),
                config.cache.retention_ttl(),
            ),
            transformer: RequestTransformer::new(config.upstream.defaults.clone()),
            upstream,
            secrets,
            usage: UsageRecorder::new(usage_sink),
            clock,
            api_key_secret: config.upstream.api_key_secret.clone(),
            upstream_name: config.upstream.display_name.clone(),
        }
    }

    #[must_use]
    pub const fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// 处理一次代理请求
    pub async fn handle(&self, request: ProxyRequest) -> ProxyOutcome {
        let started = Instant::now();
        let request_id = request.request_id.as_str();

        linfo!(
            request_id,
            LogStage::RequestStart,
            LogComponent::Proxy,
            "request_start",
            "收到补全请求",
            caller = %request.caller,
            body_bytes = request.body.len()
        );

        let outcome = self.process(request_id, &request.caller, &request.body).await;

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &outcome {
            ProxyOutcome::Success { .. } => linfo!(
                request_id,
                LogStage::Response,
                LogComponent::Proxy,
                "request_completed",
                "请求处理完成",
                outcome = outcome.kind(),
                duration_ms = elapsed_ms
            ),
            failure => lwarn!(
                request_id,
                LogStage::ResponseFailure,
                LogComponent::Proxy,
                "request_failed",
                "请求处理失败",
                outcome = failure.kind(),
                status = failure.status_code().as_u16(),
                duration_ms = elapsed_ms
            ),
        }

        outcome
    }

    async fn process(&self, request_id: &str, caller: &CallerIdentity, body: &Bytes) -> ProxyOutcome {
        // 1. 校验
        let (request, messages) = match Self::validate(body) {
            Ok(parsed) => parsed,
            Err(message) => {
                ldebug!(
                    request_id,
                    LogStage::Validation,
                    LogComponent::Proxy,
                    "validation_failed",
                    &message
                );
                return ProxyOutcome::Invalid { message };
            }
        };

        // 2. 速率检查
        if let Some(outcome) = self.check_rate(request_id, caller).await {
            return outcome;
        }

        // 3. 缓存查找
        let fingerprint =
            RequestFingerprint::compute(&self.transformer.fingerprint_input(&request, &messages));
        if let Some(payload) = self.response_cache.lookup(request_id, &fingerprint).await {
            linfo!(
                request_id,
                LogStage::Cache,
                LogComponent::Cache,
                "cache_hit",
                "命中响应缓存",
                fingerprint = %fingerprint
            );
            return ProxyOutcome::Success {
                payload,
                cache_status: CacheStatus::Hit,
            };
        }
        ldebug!(
            request_id,
            LogStage::Cache,
            LogComponent::Cache,
            "cache_miss",
            "响应缓存未命中",
            fingerprint = %fingerprint
        );

        // 4. 补齐默认值
        let outbound = self.transformer.augment(&request, &messages);
        ldebug!(
            request_id,
            LogStage::RequestModify,
            LogComponent::RequestTransform,
            "request_augmented",
            "出站请求已补齐默认值",
            model = %outbound.model,
            message_count = outbound.messages.len()
        );

        // 5. 读取密钥
        let api_key = match self.secrets.get_secret(&self.api_key_secret).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                lerror!(
                    request_id,
                    LogStage::UpstreamRequest,
                    LogComponent::Secrets,
                    "api_key_missing",
                    "上游 API 密钥未配置",
                    secret = %self.api_key_secret
                );
                return ProxyOutcome::InternalError {
                    message: MISSING_API_KEY.to_string(),
                };
            }
            Err(e) => {
                lerror!(
                    request_id,
                    LogStage::UpstreamRequest,
                    LogComponent::Secrets,
                    "api_key_load_failed",
                    "读取上游 API 密钥失败",
                    error = %e
                );
                return ProxyOutcome::InternalError {
                    message: "Internal server error: failed to load API key".to_string(),
                };
            }
        };

        // 6. 调用上游
        let upstream_started = Instant::now();
        let payload = match self.upstream.complete(&api_key, &outbound).await {
            Ok(payload) => payload,
            Err(e) => return self.upstream_failure(request_id, e),
        };
        linfo!(
            request_id,
            LogStage::UpstreamRequest,
            LogComponent::Upstream,
            "upstream_succeeded",
            "上游调用成功",
            response_bytes = payload.len(),
            upstream_ms = u64::try_from(upstream_started.elapsed().as_millis()).unwrap_or(u64::MAX)
        );

        let response: Value = match serde_json::from_slice(&payload) {
            Ok(value) => value,
            Err(e) => {
                lerror!(
                    request_id,
                    LogStage::Response,
                    LogComponent::Upstream,
                    "invalid_upstream_body",
                    "上游响应不是合法 JSON",
                    error = %e
                );
                return ProxyOutcome::InternalError {
                    message: format!("Internal server error: invalid upstream response: {e}"),
                };
            }
        };

        // 7. 收尾：计数、写缓存、记录用量互不依赖，并发执行
        let usage_record =
            UsageRecord::from_exchange(caller, &outbound, &response, self.clock.now());
        let (recorded, (), ()) = tokio::join!(
            self.rate_limiter.record(caller),
            self.response_cache.store(request_id, &fingerprint, &payload),
            self.usage.record(request_id, &usage_record),
        );
        if let Err(e) = recorded {
            lwarn!(
                request_id,
                LogStage::RateLimit,
                LogComponent::RateLimiter,
                "rate_record_failed",
                "速率计数递增失败",
                error = %e
            );
        }

        ProxyOutcome::Success {
            payload,
            cache_status: CacheStatus::Miss,
        }
    }

    /// 解析请求体，要求非空的 `messages`
    fn validate(body: &[u8]) -> Result<(CompletionRequest, Vec<ChatMessage>), String> {
        let value: Value =
            serde_json::from_slice(body).map_err(|_| "Invalid JSON body".to_string())?;
        let mut request: CompletionRequest =
            serde_json::from_value(value).map_err(|e| format!("Invalid request: {e}"))?;

        match request.messages.take() {
            Some(messages) if !messages.is_empty() => Ok((request, messages)),
            _ => Err("Messages are required".to_string()),
        }
    }

    async fn check_rate(&self, request_id: &str, caller: &CallerIdentity) -> Option<ProxyOutcome> {
        match self.rate_limiter.check(caller).await {
            RateDecision::Allowed => None,
            RateDecision::Exceeded {
                window,
                current,
                limit,
            } => {
                lwarn!(
                    request_id,
                    LogStage::RateLimit,
                    LogComponent::RateLimiter,
                    "rate_limit_exceeded",
                    "超出速率限制",
                    caller = %caller,
                    window = window.as_str(),
                    current = current,
                    limit = limit
                );
                Some(ProxyOutcome::RateLimited {
                    window: Some(window),
                })
            }
            RateDecision::StoreUnavailable {
                allowed: true,
                reason,
            } => {
                lwarn!(
                    request_id,
                    LogStage::RateLimit,
                    LogComponent::RateLimiter,
                    "rate_store_unavailable",
                    "计数存储不可用，放行请求",
                    reason = %reason
                );
                None
            }
            RateDecision::StoreUnavailable {
                allowed: false,
                reason,
            } => {
                lerror!(
                    request_id,
                    LogStage::RateLimit,
                    LogComponent::RateLimiter,
                    "rate_store_unavailable",
                    "计数存储不可用，拒绝请求",
                    reason = %reason
                );
                Some(ProxyOutcome::RateLimited { window: None })
            }
        }
    }

    fn upstream_failure(&self, request_id: &str, error: NetworkError) -> ProxyOutcome {
        lerror!(
            request_id,
            LogStage::UpstreamRequest,
            LogComponent::Upstream,
            "upstream_failed",
            "上游调用失败",
            error = %error
        );

        match error {
            NetworkError::Timeout(_) => ProxyOutcome::UpstreamTimeout,
            NetworkError::Rejected { status, body } => ProxyOutcome::UpstreamRejected {
                status,
                message: format!("{} API error: {body}", self.upstream_name),
            },
            NetworkError::Transport(detail) => ProxyOutcome::UpstreamUnavailable {
                message: format!("API request failed: {detail}"),
            },
        }
    }
}

impl std::fmt::Debug for ProxyOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyOrchestrator")
            .field("rate_limiter", &self.rate_limiter)
            .field("upstream_name", &self.upstream_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, MockCacheProvider};
    use crate::config::{DEFAULT_SYSTEM_PROMPT, MockSecretProvider, RateLimitConfig};
    use crate::error::ProxyError;
    use crate::proxy::rate_limiter::RateWindow;
    use crate::proxy::upstream::MockUpstreamClient;
    use crate::statistics::MockUsageSink;
    use crate::utils::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    const RESPONSE: &str = r#"{"id":"resp-1","choices":[{"message":{"role":"assistant","content":"60-100 bpm"}}],"citations":["https://www.mayoclinic.org"]}"#;

    struct Harness {
        orchestrator: ProxyOrchestrator,
        store: Arc<MemoryCache>,
        clock: ManualClock,
    }

    fn secrets_with_key() -> MockSecretProvider {
        let mut secrets = MockSecretProvider::new();
        secrets
            .expect_get_secret()
            .returning(|_| Ok(Some("pplx-test".to_string())));
        secrets
    }

    fn quiet_sink() -> MockUsageSink {
        let mut sink = MockUsageSink::new();
        sink.expect_record().returning(|_| Ok(()));
        sink
    }

    fn harness_with(
        config: AppConfig,
        upstream: MockUpstreamClient,
        secrets: MockSecretProvider,
        sink: MockUsageSink,
    ) -> Harness {
        harness_sized(config, upstream, secrets, sink, 1024)
    }

    fn harness_sized(
        config: AppConfig,
        upstream: MockUpstreamClient,
        secrets: MockSecretProvider,
        sink: MockUsageSink,
        store_capacity: usize,
    ) -> Harness {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap());
        let store = Arc::new(MemoryCache::new(store_capacity, Arc::new(clock.clone())));
        let orchestrator = ProxyOrchestrator::new(
            &config,
            OrchestratorDeps {
                store: store.clone(),
                upstream: Arc::new(upstream),
                secrets: Arc::new(secrets),
                usage_sink: Arc::new(sink),
                clock: Arc::new(clock.clone()),
            },
        );
        Harness {
            orchestrator,
            store,
            clock,
        }
    }

    fn harness(upstream: MockUpstreamClient) -> Harness {
        harness_with(AppConfig::default(), upstream, secrets_with_key(), quiet_sink())
    }

    fn upstream_returning(times: usize) -> MockUpstreamClient {
        let mut upstream = MockUpstreamClient::new();
        upstream
            .expect_complete()
            .times(times)
            .returning(|_, _| Ok(Bytes::from_static(RESPONSE.as_bytes())));
        upstream
    }

    fn upstream_failing(error: fn() -> NetworkError) -> MockUpstreamClient {
        let mut upstream = MockUpstreamClient::new();
        upstream
            .expect_complete()
            .times(1)
            .returning(move |_, _| Err(error()));
        upstream
    }

    fn request(caller: &str, body: Value) -> ProxyRequest {
        ProxyRequest {
            request_id: "req-test".to_string(),
            caller: CallerIdentity::from_source(caller),
            body: Bytes::from(body.to_string()),
        }
    }

    fn question(content: &str) -> Value {
        json!({"messages": [{"role": "user", "content": content}]})
    }

    async fn counts(h: &Harness, caller: &str) -> Vec<i64> {
        h.orchestrator
            .rate_limiter()
            .usage(&CallerIdentity::from_source(caller))
            .await
            .unwrap()
            .into_iter()
            .map(|(_, n)| n)
            .collect()
    }

    #[tokio::test]
    async fn second_identical_request_is_served_from_cache() {
        let h = harness(upstream_returning(1));
        let body = question("What is a normal heart rate?");

        let first = h.orchestrator.handle(request("c", body.clone())).await;
        assert_eq!(
            first,
            ProxyOutcome::Success {
                payload: Bytes::from_static(RESPONSE.as_bytes()),
                cache_status: CacheStatus::Miss,
            }
        );
        assert_eq!(counts(&h, "c").await, vec![1, 1, 1]);

        h.clock.advance(std::time::Duration::from_secs(10));
        let second = h.orchestrator.handle(request("c", body)).await;
        assert_eq!(
            second,
            ProxyOutcome::Success {
                payload: Bytes::from_static(RESPONSE.as_bytes()),
                cache_status: CacheStatus::Hit,
            }
        );
        assert_eq!(counts(&h, "c").await, vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn rejects_once_minute_ceiling_is_reached() {
        let mut config = AppConfig::default();
        config.rate_limit = RateLimitConfig {
            per_minute: 2,
            ..RateLimitConfig::default()
        };
        let h = harness_with(config, upstream_returning(2), secrets_with_key(), quiet_sink());

        for i in 0..2 {
            let outcome = h.orchestrator.handle(request("d", question(&format!("q{i}")))).await;
            assert!(matches!(outcome, ProxyOutcome::Success { .. }));
        }

        let outcome = h.orchestrator.handle(request("d", question("q-last"))).await;
        assert_eq!(
            outcome,
            ProxyOutcome::RateLimited {
                window: Some(RateWindow::Minute)
            }
        );
        assert_eq!(counts(&h, "d").await, vec![2, 2, 2]);
    }

    #[tokio::test]
    async fn ceiling_holds_when_response_cache_fills_the_store() {
        let mut config = AppConfig::default();
        config.rate_limit = RateLimitConfig {
            per_minute: 3,
            ..RateLimitConfig::default()
        };
        let h = harness_sized(config, upstream_returning(3), secrets_with_key(), quiet_sink(), 5);

        let mut served = 0;
        for i in 0..20 {
            let outcome = h
                .orchestrator
                .handle(request("e", question(&format!("distinct question {i}"))))
                .await;
            match outcome {
                ProxyOutcome::Success { .. } => served += 1,
                other => assert_eq!(
                    other,
                    ProxyOutcome::RateLimited {
                        window: Some(RateWindow::Minute)
                    },
                    "request {i}"
                ),
            }
        }

        assert_eq!(served, 3);
        assert_eq!(counts(&h, "e").await, vec![3, 3, 3]);
        assert!(h.store.len() <= 5);
    }

    #[tokio::test]
    async fn missing_messages_touch_nothing() {
        let mut upstream = MockUpstreamClient::new();
        upstream.expect_complete().never();
        let mut secrets = MockSecretProvider::new();
        secrets.expect_get_secret().never();

        // 没有任何期望：任何存储访问都会让测试失败
        let store = MockCacheProvider::new();
        let orchestrator = ProxyOrchestrator::new(
            &AppConfig::default(),
            OrchestratorDeps {
                store: Arc::new(store),
                upstream: Arc::new(upstream),
                secrets: Arc::new(secrets),
                usage_sink: Arc::new(MockUsageSink::new()),
                clock: Arc::new(ManualClock::new(Utc::now())),
            },
        );

        for body in [json!({"model": "m"}), json!({"messages": []}), json!({"messages": null})] {
            let outcome = orchestrator.handle(request("e", body)).await;
            assert_eq!(
                outcome,
                ProxyOutcome::Invalid {
                    message: "Messages are required".to_string()
                }
            );
        }
    }

    #[tokio::test]
    async fn malformed_body_is_invalid() {
        let h = harness(upstream_returning(0));
        let outcome = h
            .orchestrator
            .handle(ProxyRequest {
                request_id: "r".into(),
                caller: CallerIdentity::from_source("x"),
                body: Bytes::from_static(b"{not json"),
            })
            .await;
        assert_eq!(
            outcome,
            ProxyOutcome::Invalid {
                message: "Invalid JSON body".to_string()
            }
        );

        let outcome = h
            .orchestrator
            .handle(request("x", json!({"messages": [{"content": "no role"}]})))
            .await;
        assert!(matches!(outcome, ProxyOutcome::Invalid { message } if message.starts_with("Invalid request")));
    }

    #[tokio::test]
    async fn timeout_leaves_counters_and_cache_untouched() {
        let h = harness(upstream_failing(|| NetworkError::Timeout(30)));

        let outcome = h.orchestrator.handle(request("t", question("slow"))).await;
        assert_eq!(outcome, ProxyOutcome::UpstreamTimeout);
        assert_eq!(outcome.status_code().as_u16(), 504);
        assert_eq!(counts(&h, "t").await, vec![0, 0, 0]);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn upstream_rejection_passes_status_through() {
        let h = harness(upstream_failing(|| NetworkError::Rejected {
            status: 401,
            body: r#"{"error":"invalid key"}"#.to_string(),
        }));

        let outcome = h.orchestrator.handle(request("r", question("x"))).await;
        assert_eq!(
            outcome,
            ProxyOutcome::UpstreamRejected {
                status: 401,
                message: r#"Perplexity API error: {"error":"invalid key"}"#.to_string()
            }
        );
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn transport_failure_is_bad_gateway() {
        let h = harness(upstream_failing(|| {
            NetworkError::Transport("connection refused".to_string())
        }));

        let outcome = h.orchestrator.handle(request("u", question("x"))).await;
        assert_eq!(
            outcome,
            ProxyOutcome::UpstreamUnavailable {
                message: "API request failed: connection refused".to_string()
            }
        );
        assert_eq!(outcome.status_code().as_u16(), 502);
    }

    #[tokio::test]
    async fn missing_api_key_never_calls_upstream() {
        let mut upstream = MockUpstreamClient::new();
        upstream.expect_complete().never();
        let mut secrets = MockSecretProvider::new();
        secrets.expect_get_secret().times(1).returning(|_| Ok(None));
        let h = harness_with(AppConfig::default(), upstream, secrets, quiet_sink());

        let outcome = h.orchestrator.handle(request("k", question("x"))).await;
        assert_eq!(
            outcome,
            ProxyOutcome::InternalError {
                message: "API key not configured".to_string()
            }
        );
        assert_eq!(counts(&h, "k").await, vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn secret_store_failure_is_internal_error() {
        let mut secrets = MockSecretProvider::new();
        secrets
            .expect_get_secret()
            .returning(|_| Err(ProxyError::secret("parameter store unreachable")));
        let h = harness_with(AppConfig::default(), upstream_returning(0), secrets, quiet_sink());

        let outcome = h.orchestrator.handle(request("k", question("x"))).await;
        assert_eq!(outcome.status_code().as_u16(), 500);
    }

    #[tokio::test]
    async fn non_json_upstream_body_is_not_cached() {
        let mut upstream = MockUpstreamClient::new();
        upstream
            .expect_complete()
            .returning(|_, _| Ok(Bytes::from_static(b"<html>oops</html>")));
        let h = harness(upstream);

        let outcome = h.orchestrator.handle(request("j", question("x"))).await;
        assert!(matches!(outcome, ProxyOutcome::InternalError { .. }));
        assert_eq!(counts(&h, "j").await, vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn outbound_request_carries_key_defaults_and_system_prompt() {
        let mut upstream = MockUpstreamClient::new();
        upstream
            .expect_complete()
            .withf(|api_key, req| {
                api_key.to_string() == "pplx-test"
                    && !req.stream
                    && req.messages.len() == 2
                    && req.messages[0].role == "system"
                    && req.messages[0].content == DEFAULT_SYSTEM_PROMPT
                    && req.max_tokens == 4096
            })
            .times(1)
            .returning(|_, _| Ok(Bytes::from_static(RESPONSE.as_bytes())));
        let h = harness(upstream);

        let outcome = h.orchestrator.handle(request("s", question("hi"))).await;
        assert!(matches!(outcome, ProxyOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn usage_is_recorded_for_upstream_success_only() {
        let mut sink = MockUsageSink::new();
        sink.expect_record()
            .withf(|record| {
                record.request_id == "resp-1"
                    && record.citations_count == 1
                    && record.output_tokens == 10
                    && record.client_id == CallerIdentity::from_source("u").as_str()
            })
            .times(1)
            .returning(|_| Ok(()));
        let h = harness_with(AppConfig::default(), upstream_returning(1), secrets_with_key(), sink);

        h.orchestrator.handle(request("u", question("x"))).await;
        // 第二次命中缓存，不再记录用量
        h.orchestrator.handle(request("u", question("x"))).await;
    }

    #[tokio::test]
    async fn degraded_store_fails_open_and_still_serves() {
        let mut store = MockCacheProvider::new();
        store
            .expect_get_counter()
            .returning(|_| Err(ProxyError::cache("down")));
        store
            .expect_incr_with_expiry()
            .returning(|_, _, _| Err(ProxyError::cache("down")));
        store
            .expect_get_bytes()
            .returning(|_| Err(ProxyError::cache("down")));
        store
            .expect_set_bytes()
            .returning(|_, _, _| Err(ProxyError::cache("down")));

        let orchestrator = ProxyOrchestrator::new(
            &AppConfig::default(),
            OrchestratorDeps {
                store: Arc::new(store),
                upstream: Arc::new(upstream_returning(1)),
                secrets: Arc::new(secrets_with_key()),
                usage_sink: Arc::new(quiet_sink()),
                clock: Arc::new(ManualClock::new(Utc::now())),
            },
        );

        let outcome = orchestrator.handle(request("f", question("x"))).await;
        assert!(matches!(
            outcome,
            ProxyOutcome::Success {
                cache_status: CacheStatus::Miss,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn fail_closed_rejects_when_store_is_down() {
        let mut store = MockCacheProvider::new();
        store
            .expect_get_counter()
            .returning(|_| Err(ProxyError::cache("down")));

        let mut config = AppConfig::default();
        config.rate_limit.fail_open = false;
        let mut upstream = MockUpstreamClient::new();
        upstream.expect_complete().never();

        let orchestrator = ProxyOrchestrator::new(
            &config,
            OrchestratorDeps {
                store: Arc::new(store),
                upstream: Arc::new(upstream),
                secrets: Arc::new(secrets_with_key()),
                usage_sink: Arc::new(quiet_sink()),
                clock: Arc::new(ManualClock::new(Utc::now())),
            },
        );

        let outcome = orchestrator.handle(request("f", question("x"))).await;
        assert_eq!(outcome, ProxyOutcome::RateLimited { window: None });
    }
}
