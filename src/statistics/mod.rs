//! 统计模块
//!
//! 上游用量的提取与写出

pub mod usage;

#[cfg(test)]
pub use usage::MockUsageSink;
pub use usage::{TracingUsageSink, UsageRecord, UsageRecorder, UsageSink, extract_by_path};
