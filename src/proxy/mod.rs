//! # 补全代理模块
//!
//! 请求准入（校验、限流）、响应缓存、出站改写、上游调用和用量记录

pub mod caller;
pub mod fingerprint;
pub mod handler;
pub mod orchestrator;
pub mod rate_limiter;
pub mod request_transform;
pub mod response_cache;
pub mod types;
pub mod upstream;

pub use caller::{CallerIdentity, resolve_source_address};
pub use fingerprint::{FingerprintInput, RequestFingerprint};
pub use handler::{ProxyState, create_router};
pub use orchestrator::{OrchestratorDeps, ProxyOrchestrator};
pub use rate_limiter::{RateDecision, RateLimiter, RateWindow};
pub use request_transform::RequestTransformer;
pub use response_cache::{CachedCompletion, ResponseCache};
pub use types::{
    CacheStatus, ChatMessage, CompletionRequest, ProxyOutcome, ProxyRequest, UpstreamRequest,
};
pub use upstream::{HttpUpstreamClient, UpstreamClient};

#[cfg(test)]
pub use upstream::MockUpstreamClient;
