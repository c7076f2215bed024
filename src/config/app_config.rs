//! # 应用配置结构定义

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ensure_config;
use crate::error::Result;

/// 默认的健康领域系统提示词，仅在调用方没有提供 system 消息时插入
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant specializing in health and medical information. Always provide accurate, evidence-based information and remind users to consult healthcare professionals for medical advice. Include citations from reputable medical sources when possible.";

/// 应用主配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP 服务配置
    pub server: ServerConfig,
    /// 上游补全服务配置
    pub upstream: UpstreamConfig,
    /// 速率限制配置
    pub rate_limit: RateLimitConfig,
    /// 响应缓存配置
    pub cache: CacheConfig,
    /// 密钥来源配置
    pub secrets: SecretsConfig,
}

/// HTTP 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 请求体大小上限（字节）
    pub request_body_limit: usize,
    /// 是否启用CORS
    pub enable_cors: bool,
    /// 允许的CORS源地址
    pub cors_origins: Vec<String>,
    /// 是否信任 X-Real-IP / X-Forwarded-For 头
    pub trust_forwarded_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_body_limit: 1024 * 1024, // 1MB
            enable_cors: true,
            cors_origins: vec!["*".to_string()],
            trust_forwarded_headers: true,
        }
    }
}

/// 上游补全服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// 上游展示名称，出现在透传的错误信息中
    pub display_name: String,
    /// 上游基础地址
    pub base_url: String,
    /// 补全接口路径
    pub path: String,
    /// 单次调用超时（秒）
    pub timeout_seconds: u64,
    /// API 密钥在密钥提供者中的逻辑名称
    pub api_key_secret: String,
    /// 调用方省略字段时使用的默认值
    pub defaults: UpstreamDefaults,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            display_name: "Perplexity".to_string(),
            base_url: "https://api.perplexity.ai".to_string(),
            path: "/chat/completions".to_string(),
            timeout_seconds: 30,
            api_key_secret: "/stayfit/perplexity/api-key".to_string(),
            defaults: UpstreamDefaults::default(),
        }
    }
}

impl UpstreamConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// 拼接完整的补全接口地址
    pub fn endpoint(&self) -> Result<url::Url> {
        let base = url::Url::parse(&self.base_url).map_err(|e| {
            crate::error::ProxyError::config_with_source(
                format!("无效的上游地址: {}", self.base_url),
                e,
            )
        })?;
        base.join(&self.path).map_err(|e| {
            crate::error::ProxyError::config_with_source(
                format!("无效的上游路径: {}", self.path),
                e,
            )
        })
    }
}

/// 出站请求默认值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamDefaults {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub return_citations: bool,
    pub search_domain_filter: Vec<String>,
    pub return_images: bool,
    pub return_related_questions: bool,
    pub search_recency_filter: String,
    pub top_k: u32,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
    pub system_prompt: String,
}

impl Default for UpstreamDefaults {
    fn default() -> Self {
        Self {
            model: "llama-3.1-sonar-large-128k-online".to_string(),
            max_tokens: 4096,
            temperature: 0.2,
            top_p: 0.9,
            return_citations: true,
            search_domain_filter: vec![
                "pubmed.ncbi.nlm.nih.gov".to_string(),
                "mayoclinic.org".to_string(),
                "webmd.com".to_string(),
            ],
            return_images: false,
            return_related_questions: true,
            search_recency_filter: "month".to_string(),
            top_k: 0,
            presence_penalty: 0.0,
            frequency_penalty: 1.0,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// 速率限制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 是否启用速率限制
    pub enabled: bool,
    /// 每分钟请求上限
    pub per_minute: u64,
    /// 每小时请求上限
    pub per_hour: u64,
    /// 每天请求上限
    pub per_day: u64,
    /// 计数存储不可用时是否放行
    pub fail_open: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_minute: 60,
            per_hour: 1000,
            per_day: 10000,
            fail_open: true,
        }
    }
}

/// 缓存类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// 内存缓存
    #[default]
    Memory,
    /// Redis缓存
    Redis,
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 缓存类型
    pub cache_type: CacheType,
    /// 内存缓存最大条目数
    pub memory_max_entries: usize,
    /// 新鲜期（秒），超过后不再命中
    pub freshness_ttl_seconds: u64,
    /// 保留期（秒），超过后由存储回收
    pub retention_ttl_seconds: u64,
    /// Redis 缓存配置
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: CacheType::Memory,
            memory_max_entries: 10000,
            freshness_ttl_seconds: 24 * 3600,
            retention_ttl_seconds: 48 * 3600,
            redis: None,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn freshness_ttl(&self) -> Duration {
        Duration::from_secs(self.freshness_ttl_seconds)
    }

    #[must_use]
    pub const fn retention_ttl(&self) -> Duration {
        Duration::from_secs(self.retention_ttl_seconds)
    }
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 连接超时时间（秒）
    pub connection_timeout: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            connection_timeout: 5,
        }
    }
}

/// 密钥提供者类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretProviderType {
    /// 从环境变量读取
    #[default]
    Env,
    /// 直接使用配置文件中的值
    Static,
}

/// 密钥来源配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    pub provider: SecretProviderType,
    /// 环境变量前缀，逻辑名称会被规范化后拼接在其后
    pub env_prefix: String,
    /// 静态密钥表（仅 static 模式）
    #[serde(skip_serializing)]
    pub values: HashMap<String, String>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            provider: SecretProviderType::Env,
            env_prefix: "PROXY_SECRET_".to_string(),
            values: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        ensure_config!(self.server.port != 0, "无效的服务器端口: {}", self.server.port);
        ensure_config!(self.server.request_body_limit > 0, "请求体大小上限必须大于0");

        ensure_config!(self.upstream.timeout_seconds > 0, "上游超时时间必须大于0");
        ensure_config!(
            !self.upstream.api_key_secret.trim().is_empty(),
            "上游 API 密钥名称不能为空"
        );
        let endpoint = self.upstream.endpoint()?;
        ensure_config!(
            matches!(endpoint.scheme(), "http" | "https"),
            "上游地址必须是 http(s): {}",
            endpoint
        );

        if self.rate_limit.enabled {
            ensure_config!(
                self.rate_limit.per_minute > 0
                    && self.rate_limit.per_hour > 0
                    && self.rate_limit.per_day > 0,
                "速率限制上限必须大于0"
            );
        }

        ensure_config!(self.cache.freshness_ttl_seconds > 0, "缓存新鲜期必须大于0");
        ensure_config!(
            self.cache.freshness_ttl_seconds <= self.cache.retention_ttl_seconds,
            "缓存新鲜期 ({}s) 不能超过保留期 ({}s)",
            self.cache.freshness_ttl_seconds,
            self.cache.retention_ttl_seconds
        );
        match self.cache.cache_type {
            CacheType::Memory => {
                ensure_config!(self.cache.memory_max_entries > 0, "内存缓存最大条目数必须大于0");
            }
            CacheType::Redis => {
                let redis = self.cache.redis.as_ref().ok_or_else(|| {
                    crate::config_error!("cache_type = \"redis\" 时必须提供 [cache.redis] 配置")
                })?;
                ensure_config!(!redis.url.is_empty(), "Redis URL不能为空");
            }
        }

        Ok(())
    }
}
