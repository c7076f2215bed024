//! # 补全响应缓存
//!
//! 每条记录保存上游原始字节和写入时间。读取时按新鲜期判断是否命中，
//! 物理过期交给存储按保留期回收。存储不可用时一律视为未命中。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fingerprint::RequestFingerprint;
use crate::cache::{CacheKey, CacheProvider};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::utils::clock::{Clock, to_chrono};
use crate::{ldebug, lwarn};

/// 存储中的缓存记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCompletion {
    pub created_at: DateTime<Utc>,
    /// 上游响应体（UTF-8 JSON 文本）
    pub payload: String,
}

/// 响应缓存
pub struct ResponseCache {
    store: Arc<dyn CacheProvider>,
    clock: Arc<dyn Clock>,
    freshness_ttl: Duration,
    retention_ttl: Duration,
}

impl ResponseCache {
    pub fn new(
        store: Arc<dyn CacheProvider>,
        clock: Arc<dyn Clock>,
        freshness_ttl: Duration,
        retention_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            freshness_ttl,
            retention_ttl: retention_ttl.max(freshness_ttl),
        }
    }

    fn key(fingerprint: &RequestFingerprint) -> String {
        CacheKey::Completion {
            fingerprint: fingerprint.as_str().to_string(),
        }
        .build()
    }

    /// 查找新鲜的缓存响应
    pub async fn lookup(&self, request_id: &str, fingerprint: &RequestFingerprint) -> Option<Bytes> {
        match self.try_lookup(fingerprint).await {
            Ok(found) => found,
            Err(e) => {
                lwarn!(
                    request_id,
                    LogStage::Cache,
                    LogComponent::Cache,
                    "cache_lookup_failed",
                    "读取响应缓存失败，按未命中处理",
                    error = %e
                );
                None
            }
        }
    }

    async fn try_lookup(&self, fingerprint: &RequestFingerprint) -> Result<Option<Bytes>> {
        let Some(raw) = self.store.get_bytes(&Self::key(fingerprint)).await? else {
            return Ok(None);
        };

        let record: CachedCompletion = serde_json::from_slice(&raw)
            .map_err(|e| ProxyError::cache_with_source("缓存记录格式错误", e))?;

        let age = self.clock.now() - record.created_at;
        if age >= to_chrono(self.freshness_ttl) {
            return Ok(None);
        }

        Ok(Some(Bytes::from(record.payload)))
    }

    /// 写入缓存，覆盖同一指纹的旧记录
    pub async fn store(&self, request_id: &str, fingerprint: &RequestFingerprint, payload: &Bytes) {
        match self.try_store(fingerprint, payload).await {
            Ok(()) => ldebug!(
                request_id,
                LogStage::Cache,
                LogComponent::Cache,
                "cache_stored",
                "响应已写入缓存",
                fingerprint = %fingerprint,
                ttl_seconds = self.retention_ttl.as_secs()
            ),
            Err(e) => lwarn!(
                request_id,
                LogStage::Cache,
                LogComponent::Cache,
                "cache_store_failed",
                "写入响应缓存失败",
                error = %e
            ),
        }
    }

    async fn try_store(&self, fingerprint: &RequestFingerprint, payload: &Bytes) -> Result<()> {
        let payload = std::str::from_utf8(payload)
            .map_err(|e| ProxyError::cache_with_source("响应体不是 UTF-8", e))?;
        let record = CachedCompletion {
            created_at: self.clock.now(),
            payload: payload.to_string(),
        };
        let encoded = serde_json::to_vec(&record)?;

        self.store
            .set_bytes(&Self::key(fingerprint), Bytes::from(encoded), self.retention_ttl)
            .await
    }
}
