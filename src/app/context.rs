//! 应用上下文（DI 容器）
//!
//! 统一持有跨模块共享的服务实例，便于在测试中注入替身实现。

use std::sync::Arc;

use crate::cache::UnifiedCacheManager;
use crate::config::{AppConfig, SecretProvider, create_secret_provider};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::linfo;
use crate::proxy::{HttpUpstreamClient, OrchestratorDeps, ProxyOrchestrator, UpstreamClient};
use crate::statistics::{TracingUsageSink, UsageSink};
use crate::utils::{Clock, SystemClock};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub cache: UnifiedCacheManager,
    pub secrets: Arc<dyn SecretProvider>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub usage_sink: Arc<dyn UsageSink>,
    pub clock: Arc<dyn Clock>,
}

impl AppContext {
    pub fn new(
        config: Arc<AppConfig>,
        cache: UnifiedCacheManager,
        secrets: Arc<dyn SecretProvider>,
        upstream: Arc<dyn UpstreamClient>,
        usage_sink: Arc<dyn UsageSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            cache,
            secrets,
            upstream,
            usage_sink,
            clock,
        }
    }

    /// 根据配置构建生产依赖
    pub async fn from_config(config: Arc<AppConfig>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = UnifiedCacheManager::from_config(&config.cache, Arc::clone(&clock)).await?;
        let upstream = HttpUpstreamClient::new(&config.upstream)?;

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::ServerSetup,
            "context_ready",
            "应用上下文初始化完成",
            cache = ?cache,
            upstream = %upstream.endpoint(),
            rate_limit_enabled = config.rate_limit.enabled
        );

        Ok(Self::new(
            Arc::clone(&config),
            cache,
            create_secret_provider(&config.secrets),
            Arc::new(upstream),
            Arc::new(TracingUsageSink),
            clock,
        ))
    }

    /// 组装请求编排器
    #[must_use]
    pub fn build_orchestrator(&self) -> ProxyOrchestrator {
        ProxyOrchestrator::new(
            &self.config,
            OrchestratorDeps {
                store: self.cache.provider(),
                upstream: Arc::clone(&self.upstream),
                secrets: Arc::clone(&self.secrets),
                usage_sink: Arc::clone(&self.usage_sink),
                clock: Arc::clone(&self.clock),
            },
        )
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
