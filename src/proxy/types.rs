//! # 代理请求/响应类型

use std::borrow::Cow;

use axum::http::StatusCode;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::caller::CallerIdentity;
use super::rate_limiter::RateWindow;

/// 单条对话消息
///
/// `content` 保持调用方传入的原始 JSON，未知字段原样透传给上游。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(content.into()),
            extra: Map::new(),
        }
    }
}

/// 入站补全请求，除 `messages` 外的字段都可省略
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_citations: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_domain_filter: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_images: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_related_questions: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_recency_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
}

/// 补齐默认值后的出站请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub return_citations: bool,
    pub search_domain_filter: Vec<String>,
    pub return_images: bool,
    pub return_related_questions: bool,
    pub search_recency_filter: String,
    pub top_k: u32,
    pub stream: bool,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
}

/// 交给编排器处理的一次请求
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub request_id: String,
    pub caller: CallerIdentity,
    pub body: Bytes,
}

/// 成功响应的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    #[must_use]
    pub const fn as_header_value(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }
}

/// 一次代理请求的最终结果
///
/// 编排器不抛出错误，所有失败都折叠成这里的某个变体。
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyOutcome {
    /// 上游载荷，命中缓存时与首次返回的字节完全相同
    Success {
        payload: Bytes,
        cache_status: CacheStatus,
    },
    /// 请求体不合法
    Invalid { message: String },
    /// 超出某个窗口的上限；`window` 为空表示计数存储不可用且配置为拒绝
    RateLimited { window: Option<RateWindow> },
    /// 上游调用超时
    UpstreamTimeout,
    /// 无法与上游通信
    UpstreamUnavailable { message: String },
    /// 上游返回非 2xx，状态码原样透传
    UpstreamRejected { status: u16, message: String },
    /// 其他内部错误
    InternalError { message: String },
}

impl ProxyOutcome {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Success { .. } => StatusCode::OK,
            Self::Invalid { .. } => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 稳定的错误代码，与 `ProxyError` 的代码保持一致
    #[must_use]
    pub const fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Success { .. } => None,
            Self::Invalid { .. } => Some("INVALID_REQUEST"),
            Self::RateLimited { .. } => Some("QUOTA_EXCEEDED"),
            Self::UpstreamTimeout => Some("UPSTREAM_TIMEOUT"),
            Self::UpstreamUnavailable { .. } => Some("UPSTREAM_UNAVAILABLE"),
            Self::UpstreamRejected { .. } => Some("UPSTREAM_REJECTED"),
            Self::InternalError { .. } => Some("INTERNAL_ERROR"),
        }
    }

    /// 返回给调用方的错误信息
    #[must_use]
    pub fn error_message(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Success { .. } => None,
            Self::RateLimited { .. } => Some(Cow::Borrowed("Rate limit exceeded")),
            Self::UpstreamTimeout => Some(Cow::Borrowed("Request timeout")),
            Self::Invalid { message }
            | Self::UpstreamUnavailable { message }
            | Self::UpstreamRejected { message, .. }
            | Self::InternalError { message } => Some(Cow::Borrowed(message.as_str())),
        }
    }

    /// 结果类别，用于日志
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Success {
                cache_status: CacheStatus::Hit,
                ..
            } => "success_cached",
            Self::Success { .. } => "success",
            Self::Invalid { .. } => "invalid",
            Self::RateLimited { .. } => "rate_limited",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::InternalError { .. } => "internal_error",
        }
    }
}
