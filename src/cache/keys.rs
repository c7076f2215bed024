//! # 缓存键命名规范
//!
//! 速率计数器与响应缓存共用同一个存储，通过前缀区分

use std::fmt;

/// 缓存键类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey {
    /// 速率窗口计数器 - `ratelimit:{caller}:{window}:{bucket}`
    RateWindow {
        caller: String,
        window: &'static str,
        bucket: String,
    },

    /// 补全响应缓存 - `completion:{fingerprint}`
    Completion { fingerprint: String },
}

impl CacheKey {
    /// 生成缓存键字符串
    #[must_use]
    pub fn build(&self) -> String {
        match self {
            Self::RateWindow {
                caller,
                window,
                bucket,
            } => format!("ratelimit:{caller}:{window}:{bucket}"),
            Self::Completion { fingerprint } => format!("completion:{fingerprint}"),
        }
    }

    /// 键的前缀，用于统计和日志
    #[must_use]
    pub const fn prefix(&self) -> &'static str {
        match self {
            Self::RateWindow { .. } => "ratelimit",
            Self::Completion { .. } => "completion",
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}
