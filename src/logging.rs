//! # 日志配置模块
//!
//! 初始化 tracing 订阅器，并提供带阶段/组件标签的结构化日志宏：
//!
//! ```ignore
//! linfo!(request_id, LogStage::Cache, LogComponent::Cache, "cache_hit", "命中响应缓存", fingerprint = %fp);
//! ```

use std::env;
use std::str::FromStr;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// 单行紧凑格式，适合本地开发
    #[default]
    Compact,
    /// JSON 格式，适合日志采集
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// 请求处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStage {
    Startup,
    Shutdown,
    Configuration,
    RequestStart,
    Validation,
    RateLimit,
    Cache,
    RequestModify,
    UpstreamRequest,
    Response,
    ResponseFailure,
    Usage,
    Error,
}

impl LogStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Configuration => "configuration",
            Self::RequestStart => "request_start",
            Self::Validation => "validation",
            Self::RateLimit => "rate_limit",
            Self::Cache => "cache",
            Self::RequestModify => "request_modify",
            Self::UpstreamRequest => "upstream_request",
            Self::Response => "response",
            Self::ResponseFailure => "response_failure",
            Self::Usage => "usage",
            Self::Error => "error",
        }
    }
}

/// 产生日志的组件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogComponent {
    Main,
    ServerSetup,
    Config,
    Secrets,
    Cache,
    RateLimiter,
    Fingerprint,
    RequestTransform,
    Upstream,
    Proxy,
    Statistics,
}

impl LogComponent {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::ServerSetup => "server_setup",
            Self::Config => "config",
            Self::Secrets => "secrets",
            Self::Cache => "cache",
            Self::RateLimiter => "rate_limiter",
            Self::Fingerprint => "fingerprint",
            Self::RequestTransform => "request_transform",
            Self::Upstream => "upstream",
            Self::Proxy => "proxy",
            Self::Statistics => "statistics",
        }
    }
}

/// 结构化 info 日志
#[macro_export]
macro_rules! linfo {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($field:tt)+)?) => {
        ::tracing::info!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            component = $component.as_str(),
            operation = $operation,
            $($($field)+ ,)?
            "{}",
            $message
        )
    };
}

/// 结构化 debug 日志
#[macro_export]
macro_rules! ldebug {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($field:tt)+)?) => {
        ::tracing::debug!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            component = $component.as_str(),
            operation = $operation,
            $($($field)+ ,)?
            "{}",
            $message
        )
    };
}

/// 结构化 warn 日志
#[macro_export]
macro_rules! lwarn {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($field:tt)+)?) => {
        ::tracing::warn!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            component = $component.as_str(),
            operation = $operation,
            $($($field)+ ,)?
            "{}",
            $message
        )
    };
}

/// 结构化 error 日志
#[macro_export]
macro_rules! lerror {
    ($request_id:expr, $stage:expr, $component:expr, $operation:expr, $message:expr $(, $($field:tt)+)?) => {
        ::tracing::error!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            component = $component.as_str(),
            operation = $operation,
            $($($field)+ ,)?
            "{}",
            $message
        )
    };
}

/// 默认的过滤规则：应用自身 debug，依赖库只保留 warn 以上
fn default_filter(level: Option<&str>) -> String {
    let level = level.unwrap_or("info");
    format!("{level},completion_proxy=debug,hyper=warn,reqwest=warn,redis=warn")
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先于 `level`。重复初始化（例如测试中）会被静默忽略。
pub fn init_logging(format: LogFormat, level: Option<&str>) {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| default_filter(level));
    let filter = EnvFilter::try_new(&log_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(false),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .compact(),
            )
            .try_init(),
    };

    if result.is_ok() {
        tracing::debug!(filter = %log_filter, ?format, "日志系统初始化完成");
    }
}
