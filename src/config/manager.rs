//! # 配置加载
//!
//! 读取 TOML 配置文件，应用 `PROXY_` 前缀的环境变量覆盖，最后统一校验

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, info, warn};

use super::{AppConfig, CacheType, RedisConfig, SecretProviderType};
use crate::error::{ProxyError, Result};

/// 指定配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "PROXY_CONFIG_PATH";

/// 配置覆盖使用的环境变量前缀
const OVERRIDE_PREFIX: &str = "PROXY_";

/// 同样以 `PROXY_` 开头、但不属于配置覆盖的变量
const NON_OVERRIDE_KEYS: &[&str] = &["CONFIG_PATH", "LOG_FORMAT", "LOG_LEVEL"];

/// 加载完整配置
///
/// 路径优先级：参数 > `PROXY_CONFIG_PATH` > `config/config.{RUST_ENV}.toml`。
/// 文件不存在时使用默认配置。
pub fn load_config(explicit_path: Option<&Path>) -> Result<AppConfig> {
    let path = resolve_config_path(explicit_path);

    let mut config = if path.exists() {
        let config = load_config_file(&path)?;
        info!(path = %path.display(), "已加载配置文件");
        config
    } else {
        warn!(path = %path.display(), "配置文件不存在，使用默认配置");
        AppConfig::default()
    };

    let overrides = build_env_overrides(env::vars(), &config.secrets.env_prefix);
    apply_env_overrides(&mut config, &overrides)?;
    info!("- 环境变量覆盖: {} 个", overrides.len());

    config.validate()?;
    Ok(config)
}

/// 计算配置文件路径
#[must_use]
pub fn resolve_config_path(explicit_path: Option<&Path>) -> PathBuf {
    resolve_config_path_with(explicit_path, |name| env::var(name).ok())
}

/// 使用指定的变量读取函数计算配置文件路径
#[must_use]
pub fn resolve_config_path_with(
    explicit_path: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> PathBuf {
    if let Some(path) = explicit_path {
        return path.to_path_buf();
    }
    if let Some(path) = lookup(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    let env = lookup("RUST_ENV").unwrap_or_else(|| "dev".to_string());
    PathBuf::from(format!("config/config.{env}.toml"))
}

/// 加载配置文件
fn load_config_file(path: &Path) -> Result<AppConfig> {
    let config_content = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::config_with_source(format!("读取配置文件失败: {}", path.display()), e)
    })?;

    toml::from_str(&config_content).map_err(|e| {
        ProxyError::config_with_source(
            format!("TOML解析失败 - 配置文件: {}, 详细错误: {e}", path.display()),
            e,
        )
    })
}

/// 构建环境变量覆盖映射
///
/// 例如: `PROXY_RATE_LIMIT_PER_MINUTE` -> `rate.limit.per.minute`
pub fn build_env_overrides<I>(vars: I, secret_prefix: &str) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut overrides = HashMap::new();

    for (key, value) in vars {
        if key.starts_with(secret_prefix) {
            continue;
        }
        let Some(config_key) = key.strip_prefix(OVERRIDE_PREFIX) else {
            continue;
        };
        if NON_OVERRIDE_KEYS.contains(&config_key) {
            continue;
        }
        let config_path = config_key.to_lowercase().replace('_', ".");
        overrides.insert(config_path, value);
    }

    debug!("发现 {} 个环境变量覆盖", overrides.len());
    overrides
}

/// 应用环境变量覆盖
pub fn apply_env_overrides(
    config: &mut AppConfig,
    overrides: &HashMap<String, String>,
) -> Result<()> {
    for (path, value) in overrides {
        debug!(
            "应用环境变量覆盖: {} = {}",
            path,
            if path.contains("key") || path.contains("secret") || path.contains("url") {
                "***"
            } else {
                value
            }
        );

        apply_override_to_config(config, path, value)?;
    }
    Ok(())
}

fn parse_value<T>(path: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.trim().parse().map_err(|e| {
        ProxyError::config_with_source(format!("无效的配置值 {path} = {value}"), e)
    })
}

/// 将单个覆盖应用到配置对象
fn apply_override_to_config(config: &mut AppConfig, path: &str, value: &str) -> Result<()> {
    let parts: Vec<&str> = path.split('.').collect();

    match parts.as_slice() {
        ["server", "host"] => config.server.host = value.to_string(),
        ["server", "port"] => config.server.port = parse_value(path, value)?,
        ["server", "request", "body", "limit"] => {
            config.server.request_body_limit = parse_value(path, value)?;
        }
        ["server", "enable", "cors"] => config.server.enable_cors = parse_value(path, value)?,
        ["server", "cors", "origins"] => {
            config.server.cors_origins = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        ["server", "trust", "forwarded", "headers"] => {
            config.server.trust_forwarded_headers = parse_value(path, value)?;
        }

        ["upstream", "base", "url"] => config.upstream.base_url = value.to_string(),
        ["upstream", "path"] => config.upstream.path = value.to_string(),
        ["upstream", "display", "name"] => config.upstream.display_name = value.to_string(),
        ["upstream", "timeout", "seconds"] => {
            config.upstream.timeout_seconds = parse_value(path, value)?;
        }
        ["upstream", "api", "key", "secret"] => {
            config.upstream.api_key_secret = value.to_string();
        }
        ["upstream", "defaults", "model"] => config.upstream.defaults.model = value.to_string(),
        ["upstream", "defaults", "max", "tokens"] => {
            config.upstream.defaults.max_tokens = parse_value(path, value)?;
        }
        ["upstream", "defaults", "temperature"] => {
            config.upstream.defaults.temperature = parse_value(path, value)?;
        }

        ["rate", "limit", "enabled"] => config.rate_limit.enabled = parse_value(path, value)?,
        ["rate", "limit", "per", "minute"] => {
            config.rate_limit.per_minute = parse_value(path, value)?;
        }
        ["rate", "limit", "per", "hour"] => config.rate_limit.per_hour = parse_value(path, value)?,
        ["rate", "limit", "per", "day"] => config.rate_limit.per_day = parse_value(path, value)?,
        ["rate", "limit", "fail", "open"] => {
            config.rate_limit.fail_open = parse_value(path, value)?;
        }

        ["cache", "type"] | ["cache", "cache", "type"] => {
            config.cache.cache_type = match value.trim().to_ascii_lowercase().as_str() {
                "memory" => CacheType::Memory,
                "redis" => CacheType::Redis,
                other => {
                    return Err(ProxyError::config(format!("未知的缓存类型: {other}")));
                }
            };
        }
        ["cache", "memory", "max", "entries"] => {
            config.cache.memory_max_entries = parse_value(path, value)?;
        }
        ["cache", "freshness", "ttl", "seconds"] => {
            config.cache.freshness_ttl_seconds = parse_value(path, value)?;
        }
        ["cache", "retention", "ttl", "seconds"] => {
            config.cache.retention_ttl_seconds = parse_value(path, value)?;
        }
        ["cache", "redis", "url"] | ["redis", "url"] => {
            config
                .cache
                .redis
                .get_or_insert_with(RedisConfig::default)
                .url = value.to_string();
        }

        ["secrets", "provider"] => {
            config.secrets.provider = match value.trim().to_ascii_lowercase().as_str() {
                "env" => SecretProviderType::Env,
                "static" => SecretProviderType::Static,
                other => {
                    return Err(ProxyError::config(format!("未知的密钥提供者: {other}")));
                }
            };
        }

        _ => {
            warn!("未知的配置路径，忽略环境变量覆盖: {}", path);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn builds_dotted_paths_and_skips_reserved_keys() {
        let overrides = build_env_overrides(
            vars(&[
                ("PROXY_RATE_LIMIT_PER_MINUTE", "5"),
                ("PROXY_LOG_FORMAT", "json"),
                ("PROXY_CONFIG_PATH", "/etc/proxy.toml"),
                ("PROXY_SECRET_STAYFIT_PERPLEXITY_API_KEY", "pplx-123"),
                ("HOME", "/root"),
            ]),
            "PROXY_SECRET_",
        );

        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides["rate.limit.per.minute"], "5");
    }

    #[test]
    fn applies_overrides_to_every_section() {
        let mut config = AppConfig::default();
        let overrides = build_env_overrides(
            vars(&[
                ("PROXY_SERVER_PORT", "9090"),
                ("PROXY_SERVER_CORS_ORIGINS", "https://a.example, https://b.example"),
                ("PROXY_UPSTREAM_TIMEOUT_SECONDS", "10"),
                ("PROXY_RATE_LIMIT_FAIL_OPEN", "false"),
                ("PROXY_CACHE_TYPE", "redis"),
                ("PROXY_CACHE_REDIS_URL", "redis://cache:6379/2"),
            ]),
            "PROXY_SECRET_",
        );

        apply_env_overrides(&mut config, &overrides).unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(
            config.server.cors_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert_eq!(config.upstream.timeout_seconds, 10);
        assert!(!config.rate_limit.fail_open);
        assert_eq!(config.cache.cache_type, CacheType::Redis);
        assert_eq!(config.cache.redis.unwrap().url, "redis://cache:6379/2");
    }

    #[test]
    fn rejects_unparseable_override() {
        let mut config = AppConfig::default();
        let overrides = build_env_overrides(vars(&[("PROXY_SERVER_PORT", "eighty")]), "X_");
        let err = apply_env_overrides(&mut config, &overrides).unwrap_err();
        assert!(matches!(err, ProxyError::Config { .. }));
    }

    #[test]
    fn loads_file_then_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [server]
            port = 18080

            [rate_limit]
            per_minute = 2
            "#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 18080);
        assert_eq!(config.rate_limit.per_minute, 2);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/proxy.toml"))).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn invalid_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\nfreshness_ttl_seconds = 999999").unwrap();
        assert!(load_config(Some(file.path())).is_err());
    }

    #[test]
    fn config_path_env_is_used_when_no_argument() {
        let process_env = HashMap::from([
            (CONFIG_PATH_ENV, "/tmp/from-env.toml"),
            ("RUST_ENV", "prod"),
        ]);
        let lookup = |name: &str| process_env.get(name).map(ToString::to_string);

        assert_eq!(
            resolve_config_path_with(None, lookup),
            PathBuf::from("/tmp/from-env.toml")
        );
        assert_eq!(
            resolve_config_path_with(Some(Path::new("cli.toml")), lookup),
            PathBuf::from("cli.toml")
        );
    }

    #[test]
    fn rust_env_selects_default_file() {
        assert_eq!(
            resolve_config_path_with(None, |name| (name == "RUST_ENV").then(|| "prod".to_string())),
            PathBuf::from("config/config.prod.toml")
        );
        assert_eq!(
            resolve_config_path_with(None, |_| None),
            PathBuf::from("config/config.dev.toml")
        );
    }
}
