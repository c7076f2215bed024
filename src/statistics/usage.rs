//! # 用量记录
//!
//! 每次成功的上游调用生成一条记录，交给 [`UsageSink`] 异步写出。
//! 写出失败只记日志，不影响返回给调用方的结果。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::proxy::caller::CallerIdentity;
use crate::proxy::types::UpstreamRequest;
use crate::{linfo, lwarn};

/// 单次上游交换的用量
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub client_id: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    /// 出站消息列表序列化后的字符数
    pub input_tokens: u64,
    /// 首个候选回复内容的字符数
    pub output_tokens: u64,
    pub citations_count: u64,
    /// 上游返回的响应 id，缺失时为空
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
}

/// 按 `a.0.b` 形式的路径读取 JSON 字段
#[must_use]
pub fn extract_by_path<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = json;
    for seg in path.split('.') {
        cur = match seg.parse::<usize>() {
            Ok(idx) => cur.get(idx)?,
            Err(_) => cur.get(seg)?,
        };
    }
    Some(cur)
}

fn char_len(s: &str) -> u64 {
    u64::try_from(s.chars().count()).unwrap_or(u64::MAX)
}

impl UsageRecord {
    /// 根据出站请求和上游响应构造记录
    #[must_use]
    pub fn from_exchange(
        caller: &CallerIdentity,
        request: &UpstreamRequest,
        response: &Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let input_tokens = serde_json::to_string(&request.messages)
            .map(|s| char_len(&s))
            .unwrap_or(0);

        let output_tokens = extract_by_path(response, "choices.0.message.content")
            .and_then(Value::as_str)
            .map_or(0, char_len);

        let citations_count = response
            .get("citations")
            .and_then(Value::as_array)
            .map_or(0, |c| u64::try_from(c.len()).unwrap_or(u64::MAX));

        let request_id = response
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Self {
            client_id: caller.as_str().to_string(),
            timestamp,
            model: request.model.clone(),
            input_tokens,
            output_tokens,
            citations_count,
            request_id,
            prompt_tokens: extract_by_path(response, "usage.prompt_tokens").and_then(Value::as_u64),
            completion_tokens: extract_by_path(response, "usage.completion_tokens")
                .and_then(Value::as_u64),
        }
    }
}

/// 用量记录的去向
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: &UsageRecord) -> Result<()>;
}

/// 以结构化日志输出用量，由日志采集侧汇总
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: &UsageRecord) -> Result<()> {
        linfo!(
            "system",
            LogStage::Usage,
            LogComponent::Statistics,
            "usage_recorded",
            "记录上游用量",
            client_id = %record.client_id,
            model = %record.model,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            citations_count = record.citations_count,
            upstream_id = %record.request_id,
            prompt_tokens = ?record.prompt_tokens,
            completion_tokens = ?record.completion_tokens
        );
        Ok(())
    }
}

/// 用量记录器，吸收写出错误
#[derive(Clone)]
pub struct UsageRecorder {
    sink: Arc<dyn UsageSink>,
}

impl UsageRecorder {
    pub fn new(sink: Arc<dyn UsageSink>) -> Self {
        Self { sink }
    }

    pub async fn record(&self, request_id: &str, record: &UsageRecord) {
        if let Err(e) = self.sink.record(record).await {
            lwarn!(
                request_id,
                LogStage::Usage,
                LogComponent::Statistics,
                "usage_record_failed",
                "用量记录写出失败",
                error = %e
            );
        }
    }
}

impl std::fmt::Debug for UsageRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageRecorder").finish_non_exhaustive()
    }
}
