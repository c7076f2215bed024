//! # 上游补全服务客户端
//!
//! 每次请求只调用一次，不做重试：上游按调用计费，重试会重复扣费。

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use url::Url;

use super::types::UpstreamRequest;
use crate::config::UpstreamConfig;
use crate::error::{NetworkError, ProxyError, Result};

/// 上游响应体最多记录到日志/错误信息中的字节数
const MAX_ERROR_BODY_BYTES: usize = 4096;

/// 上游补全调用
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// 发送补全请求，2xx 时返回原始响应体
    async fn complete(
        &self,
        api_key: &str,
        request: &UpstreamRequest,
    ) -> std::result::Result<Bytes, NetworkError>;
}

/// 基于 reqwest 的 HTTPS 客户端，使用 Bearer 认证
#[derive(Debug, Clone)]
pub struct HttpUpstreamClient {
    http_client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpUpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let timeout = config.timeout();
        let http_client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("completion-proxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProxyError::config_with_source("创建上游 HTTP 客户端失败", e))?;

        Ok(Self {
            http_client,
            endpoint: config.endpoint()?,
            timeout,
        })
    }

    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn complete(
        &self,
        api_key: &str,
        request: &UpstreamRequest,
    ) -> std::result::Result<Bytes, NetworkError> {
        let timeout_seconds = self.timeout.as_secs();

        let response = self
            .http_client
            .post(self.endpoint.clone())
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| NetworkError::from_reqwest(&e, timeout_seconds))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| NetworkError::from_reqwest(&e, timeout_seconds))?;

        if status.is_success() {
            return Ok(body);
        }

        let end = body.len().min(MAX_ERROR_BODY_BYTES);
        Err(NetworkError::Rejected {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body[..end]).into_owned(),
        })
    }
}
