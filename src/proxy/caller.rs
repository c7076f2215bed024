//! # 调用方身份
//!
//! 调用方身份只用作计数器键，由来源地址的 MD5 派生，日志中也只出现哈希值。

use std::fmt;
use std::net::SocketAddr;

use axum::http::HeaderMap;

const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const UNKNOWN_SOURCE: &str = "unknown";

/// 不透明的调用方标识（来源地址的 MD5 小写十六进制）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerIdentity(String);

impl CallerIdentity {
    #[must_use]
    pub fn from_source(source: &str) -> Self {
        Self(format!("{:x}", md5::compute(source.as_bytes())))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 解析来源地址
///
/// 信任转发头时依次取 `X-Real-IP`、`X-Forwarded-For` 的第一个非空项，
/// 否则使用 TCP 对端地址，都没有时为 `unknown`。
#[must_use]
pub fn resolve_source_address(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_headers: bool,
) -> String {
    if trust_forwarded_headers {
        if let Some(real_ip) = header_str(headers, X_REAL_IP) {
            return real_ip.to_string();
        }

        if let Some(first) = header_str(headers, X_FORWARDED_FOR)
            .and_then(|value| value.split(',').map(str::trim).find(|s| !s.is_empty()))
        {
            return first.to_string();
        }
    }

    peer.map_or_else(|| UNKNOWN_SOURCE.to_string(), |addr| addr.ip().to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
