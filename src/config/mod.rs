//! # 配置管理模块
//!
//! 处理应用配置加载、验证，以及上游密钥的读取

mod app_config;
mod manager;
mod secrets;

pub use app_config::{
    AppConfig, CacheConfig, CacheType, DEFAULT_SYSTEM_PROMPT, RateLimitConfig, RedisConfig,
    SecretProviderType, SecretsConfig, ServerConfig, UpstreamConfig, UpstreamDefaults,
};
pub use manager::{
    CONFIG_PATH_ENV, apply_env_overrides, build_env_overrides, load_config, resolve_config_path,
    resolve_config_path_with,
};
#[cfg(test)]
pub use secrets::MockSecretProvider;
pub use secrets::{
    EnvLookup, EnvSecretProvider, SecretProvider, StaticSecretProvider, create_secret_provider,
};
