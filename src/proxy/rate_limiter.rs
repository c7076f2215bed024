//! # 多窗口速率限制
//!
//! 每个调用方在分钟/小时/天三个固定窗口各有一个计数器。`check` 只读，
//! `record` 在上游成功后原子递增三个计数器。计数器的过期时间在首次递增时
//! 设置为两倍窗口长度，之后不再改变。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};

use super::caller::CallerIdentity;
use crate::cache::{CacheKey, CacheProvider};
use crate::config::RateLimitConfig;
use crate::error::{ProxyError, Result};
use crate::utils::Clock;

/// 速率窗口粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateWindow {
    Minute,
    Hour,
    Day,
}

impl RateWindow {
    pub const ALL: [Self; 3] = [Self::Minute, Self::Hour, Self::Day];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    #[must_use]
    pub const fn span(self) -> Duration {
        match self {
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(3600),
            Self::Day => Duration::from_secs(86_400),
        }
    }

    /// 计数器存活时间，始终长于窗口本身
    #[must_use]
    pub const fn counter_ttl(self) -> Duration {
        Duration::from_secs(self.span().as_secs() * 2)
    }

    /// 当前时间所在的窗口标签（UTC）
    #[must_use]
    pub fn bucket_label(self, now: DateTime<Utc>) -> String {
        let format = match self {
            Self::Minute => "%Y-%m-%d-%H-%M",
            Self::Hour => "%Y-%m-%d-%H",
            Self::Day => "%Y-%m-%d",
        };
        now.format(format).to_string()
    }
}

impl fmt::Display for RateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 速率检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Exceeded {
        window: RateWindow,
        current: i64,
        limit: u64,
    },
    /// 计数存储不可用，`allowed` 取决于 `fail_open`
    StoreUnavailable { allowed: bool, reason: String },
}

impl RateDecision {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        match self {
            Self::Allowed => true,
            Self::Exceeded { .. } => false,
            Self::StoreUnavailable { allowed, .. } => *allowed,
        }
    }
}

/// 多窗口速率限制器
pub struct RateLimiter {
    store: Arc<dyn CacheProvider>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CacheProvider>, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// 窗口上限
    #[must_use]
    pub const fn limit(&self, window: RateWindow) -> u64 {
        match window {
            RateWindow::Minute => self.config.per_minute,
            RateWindow::Hour => self.config.per_hour,
            RateWindow::Day => self.config.per_day,
        }
    }

    fn counter_key(caller: &CallerIdentity, window: RateWindow, now: DateTime<Utc>) -> String {
        CacheKey::RateWindow {
            caller: caller.as_str().to_string(),
            window: window.as_str(),
            bucket: window.bucket_label(now),
        }
        .build()
    }

    /// 读取三个窗口的当前计数，不做修改
    pub async fn usage(&self, caller: &CallerIdentity) -> Result<Vec<(RateWindow, i64)>> {
        let now = self.clock.now();
        let reads = RateWindow::ALL.map(|window| {
            let key = Self::counter_key(caller, window, now);
            let store = Arc::clone(&self.store);
            async move { store.get_counter(&key).await.map(|count| (window, count)) }
        });
        try_join_all(reads).await
    }

    /// 检查调用方是否还有配额
    ///
    /// 任一窗口的计数达到上限即拒绝。
    pub async fn check(&self, caller: &CallerIdentity) -> RateDecision {
        if !self.config.enabled {
            return RateDecision::Allowed;
        }

        let counts = match self.usage(caller).await {
            Ok(counts) => counts,
            Err(e) => {
                return RateDecision::StoreUnavailable {
                    allowed: self.config.fail_open,
                    reason: e.to_string(),
                };
            }
        };

        for (window, current) in counts {
            let limit = self.limit(window);
            if u64::try_from(current).unwrap_or(0) >= limit {
                return RateDecision::Exceeded {
                    window,
                    current,
                    limit,
                };
            }
        }

        RateDecision::Allowed
    }

    /// 为调用方在三个窗口各计一次
    ///
    /// 三个递增相互独立，部分失败时已成功的递增不会回滚。
    pub async fn record(&self, caller: &CallerIdentity) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = self.clock.now();
        let writes = RateWindow::ALL.map(|window| {
            let key = Self::counter_key(caller, window, now);
            let store = Arc::clone(&self.store);
            async move {
                store
                    .incr_with_expiry(&key, 1, window.counter_ttl())
                    .await
                    .map_err(|e| (window, e))
            }
        });

        let failures: Vec<_> = join_all(writes)
            .await
            .into_iter()
            .filter_map(std::result::Result::err)
            .collect();

        match failures.into_iter().next() {
            None => Ok(()),
            Some((window, e)) => Err(ProxyError::cache_with_source(
                format!("{window} 窗口计数递增失败"),
                e,
            )),
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("backend", &self.store.backend())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
