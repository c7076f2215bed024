//! # 密钥提供者
//!
//! 上游 API 密钥在每次出站调用前按逻辑名称读取，不缓存、不记录日志

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use async_trait::async_trait;

use super::{SecretProviderType, SecretsConfig};
use crate::error::Result;

/// 按逻辑名称读取密钥
///
/// `Ok(None)` 表示密钥未配置，`Err` 表示密钥存储本身不可用。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<Option<String>>;
}

/// 按变量名读取环境值的函数
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// 从环境变量读取密钥
///
/// `/stayfit/perplexity/api-key` 映射为 `PROXY_SECRET_STAYFIT_PERPLEXITY_API_KEY`
#[derive(Clone)]
pub struct EnvSecretProvider {
    prefix: String,
    lookup: EnvLookup,
}

impl EnvSecretProvider {
    /// 读取进程环境变量
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_lookup(prefix, Arc::new(|name: &str| env::var(name).ok()))
    }

    /// 使用自定义的变量读取函数
    pub fn with_lookup(prefix: impl Into<String>, lookup: EnvLookup) -> Self {
        Self {
            prefix: prefix.into(),
            lookup,
        }
    }

    /// 逻辑名称对应的环境变量名
    #[must_use]
    pub fn variable_name(&self, name: &str) -> String {
        let normalized: String = name
            .trim_matches('/')
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{normalized}", self.prefix)
    }
}

impl std::fmt::Debug for EnvSecretProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvSecretProvider")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        Ok((self.lookup)(&self.variable_name(name)).filter(|value| !value.trim().is_empty()))
    }
}

/// 使用配置文件中的固定密钥
#[derive(Debug, Clone, Default)]
pub struct StaticSecretProvider {
    values: HashMap<String, String>,
}

impl StaticSecretProvider {
    #[must_use]
    pub const fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        Ok(self.values.get(name).cloned())
    }
}

/// 根据配置创建密钥提供者
#[must_use]
pub fn create_secret_provider(config: &SecretsConfig) -> Arc<dyn SecretProvider> {
    match config.provider {
        SecretProviderType::Env => Arc::new(EnvSecretProvider::new(config.env_prefix.clone())),
        SecretProviderType::Static => Arc::new(StaticSecretProvider::new(config.values.clone())),
    }
}
