//! 可注入的时钟
//!
//! 速率窗口的分桶和缓存新鲜度判断都依赖“当前时间”。通过 [`Clock`]
//! 注入而不是直接调用 `Utc::now()`，测试可以用 [`ManualClock`] 精确跨越窗口边界。

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动推进的时钟，克隆体共享同一时间
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

/// `std::time::Duration` 转 chrono 时长，溢出时截断为 100 年
#[must_use]
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances_shared_time() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let view = clock.clone();

        clock.advance(Duration::from_secs(90));
        assert_eq!(view.now(), start + chrono::Duration::seconds(90));

        clock.set(start);
        assert_eq!(view.now(), start);
    }

    #[test]
    fn converts_durations() {
        assert_eq!(
            to_chrono(Duration::from_secs(3600)),
            chrono::Duration::hours(1)
        );
        assert_eq!(to_chrono(Duration::MAX), chrono::Duration::days(36_500));
    }
}
