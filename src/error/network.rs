use thiserror::Error;

/// 与上游补全服务通信时的失败分类。
///
/// 三类失败都不会被自动重试：上游按调用计费，重试会重复扣费。
#[derive(Debug, Error)]
pub enum NetworkError {
    /// 超过固定的上游超时时间
    #[error("upstream request timed out after {0}s")]
    Timeout(u64),

    /// 连接失败、DNS 失败、读取响应体失败等传输层错误
    #[error("{0}")]
    Transport(String),

    /// 上游返回了非 2xx 状态码
    #[error("upstream returned status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl NetworkError {
    /// 将 reqwest 错误归类为超时或传输错误
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error, timeout_seconds: u64) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout_seconds)
        } else {
            Self::Transport(err.to_string())
        }
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
