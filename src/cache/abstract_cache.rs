//! # 缓存抽象层
//!
//! 提供统一的键值存储接口，支持内存缓存和Redis缓存。
//! 速率计数器和补全响应都存放在这里，两者共享过期语义；
//! 内存实现中计数器不参与容量淘汰。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};

use crate::config::{CacheConfig, CacheType, RedisConfig};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::utils::clock::{Clock, to_chrono};
use crate::{ldebug, linfo, lwarn};

/// 原子递增，仅在键没有过期时间时设置过期时间
const INCR_WITH_EXPIRY_SCRIPT: &str = r"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('TTL', KEYS[1]) < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return value
";

/// 缓存抽象trait
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// 读取字节值，不存在或已过期时返回 `None`
    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>>;

    /// 写入字节值并设置过期时间
    async fn set_bytes(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// 读取计数器，不存在或已过期时为 0
    async fn get_counter(&self, key: &str) -> Result<i64>;

    /// 原子递增计数器并返回新值
    ///
    /// 过期时间只在计数器新建时设置，后续递增不会延长它。
    async fn incr_with_expiry(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64>;

    /// 获取缓存统计信息
    async fn stats(&self) -> Result<CacheStats>;

    /// 后端名称
    fn backend(&self) -> &'static str;
}

/// 缓存统计信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub total_keys: usize,
    pub expired_keys: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub cache_type: &'static str,
}

impl CacheStats {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// 容量满时一次淘汰 `max_entries / EVICTION_BATCH_DIVISOR` 条（至少 1 条）
const EVICTION_BATCH_DIVISOR: usize = 10;

/// 每新建多少个计数器顺带清理一次过期计数器
const COUNTER_SWEEP_INTERVAL: u64 = 1024;

/// 缓存项
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    fn new(value: V, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: now + to_chrono(ttl),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// 内存缓存实现
///
/// 字节值受 `max_entries` 限制，满时按过期时间批量淘汰；计数器单独存放，
/// 只按 TTL 过期，永远不会因为容量被淘汰。过期判断基于注入的 [`Clock`]。
#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry<Bytes>>,
    counters: DashMap<String, CacheEntry<i64>>,
    max_entries: usize,
    clock: Arc<dyn Clock>,
    counters_created: AtomicU64,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl MemoryCache {
    pub fn new(max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            counters: DashMap::new(),
            max_entries: max_entries.max(1),
            clock,
            counters_created: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    /// 当前字节值条目数（含尚未清理的过期项）
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 当前计数器数量（含尚未清理的过期项）
    #[must_use]
    pub fn counter_len(&self) -> usize {
        self.counters.len()
    }

    /// 为新键腾出空间
    ///
    /// 满时先清理过期项；仍然满则一次淘汰最早过期的一批条目，
    /// 之后的插入不必再扫描全表。调用时不能持有任何 dashmap 引用。
    fn ensure_capacity(&self, key: &str, now: DateTime<Utc>) {
        if self.entries.len() < self.max_entries || self.entries.contains_key(key) {
            return;
        }

        self.entries.retain(|_, entry| !entry.is_expired(now));
        let len = self.entries.len();
        if len < self.max_entries {
            return;
        }

        let batch = (self.max_entries / EVICTION_BATCH_DIVISOR).max(1) + (len - self.max_entries);
        let mut candidates: Vec<(DateTime<Utc>, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().expires_at, entry.key().clone()))
            .collect();
        if batch < candidates.len() {
            candidates.select_nth_unstable(batch - 1);
            candidates.truncate(batch);
        }

        for (_, victim) in candidates {
            self.entries.remove(&victim);
        }
        ldebug!(
            "system",
            LogStage::Cache,
            LogComponent::Cache,
            "memory_evict",
            "内存缓存已满，批量淘汰最早过期的条目",
            evicted = batch
        );
    }

    /// 计数器按新建次数摊销清理
    fn sweep_counters(&self, now: DateTime<Utc>) {
        let created = self.counters_created.fetch_add(1, Ordering::Relaxed) + 1;
        if created % COUNTER_SWEEP_INTERVAL == 0 {
            self.counters.retain(|_, entry| !entry.is_expired(now));
        }
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        let now = self.clock.now();
        let (value, expired) = match self.entries.get(key) {
            Some(entry) if entry.is_expired(now) => (None, true),
            Some(entry) => (Some(entry.value.clone()), false),
            None => (None, false),
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }

        if value.is_some() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value)
    }

    async fn set_bytes(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        self.ensure_capacity(key, now);
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, now, ttl));
        Ok(())
    }

    async fn get_counter(&self, key: &str) -> Result<i64> {
        let now = self.clock.now();
        let (value, expired) = match self.counters.get(key) {
            Some(entry) if entry.is_expired(now) => (0, true),
            Some(entry) => (entry.value, false),
            None => (0, false),
        };
        if expired {
            self.counters.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(value)
    }

    async fn incr_with_expiry(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let now = self.clock.now();
        let mut created = false;

        let value = {
            let mut entry = self.counters.entry(key.to_string()).or_insert_with(|| {
                created = true;
                CacheEntry::new(0, now, ttl)
            });
            if entry.is_expired(now) {
                *entry = CacheEntry::new(0, now, ttl);
            }
            entry.value += delta;
            entry.value
        };

        if created {
            self.sweep_counters(now);
        }
        Ok(value)
    }

    async fn stats(&self) -> Result<CacheStats> {
        let now = self.clock.now();
        let expired_keys = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired(now))
            .count()
            + self
                .counters
                .iter()
                .filter(|entry| entry.is_expired(now))
                .count();

        Ok(CacheStats {
            total_keys: self.entries.len() + self.counters.len(),
            expired_keys,
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            cache_type: self.backend(),
        })
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Redis缓存实现
///
/// 过期由 Redis 负责，因此不使用注入的时钟。
pub struct RedisCache {
    connection_manager: ConnectionManager,
    incr_script: Script,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl RedisCache {
    /// 建立连接，超过 `connection_timeout` 视为失败
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Cache,
            "connect_to_redis",
            "正在连接 Redis 服务器"
        );

        let client = Client::open(config.url.as_str())
            .map_err(|e| ProxyError::cache_with_source("创建 Redis 客户端失败", e))?;

        let connection_manager = tokio::time::timeout(
            Duration::from_secs(config.connection_timeout.max(1)),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|e| ProxyError::cache_with_source("连接 Redis 超时", e))?
        .map_err(|e| ProxyError::cache_with_source("建立 Redis 连接失败", e))?;

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Cache,
            "redis_connected",
            "Redis 连接建立成功"
        );

        Ok(Self {
            connection_manager,
            incr_script: Script::new(INCR_WITH_EXPIRY_SCRIPT),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl CacheProvider for RedisCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.connection_manager.clone();
        let result: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| ProxyError::cache_with_source(format!("获取缓存失败: {key}"), e))?;

        if result.is_some() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(result.map(Bytes::from))
    }

    async fn set_bytes(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let ttl_seconds = ttl.as_secs().max(1);
        ldebug!(
            "system",
            LogStage::Cache,
            LogComponent::Cache,
            "set_cache",
            &format!("设置缓存: key={key}, ttl={ttl_seconds}s")
        );

        let mut conn = self.connection_manager.clone();
        conn.set_ex::<_, _, ()>(key, value.as_ref(), ttl_seconds)
            .await
            .map_err(|e| ProxyError::cache_with_source(format!("设置缓存失败: {key}"), e))
    }

    async fn get_counter(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection_manager.clone();
        let value: Option<i64> = conn
            .get(key)
            .await
            .map_err(|e| ProxyError::cache_with_source(format!("读取计数器失败: {key}"), e))?;
        Ok(value.unwrap_or(0))
    }

    async fn incr_with_expiry(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let mut conn = self.connection_manager.clone();
        self.incr_script
            .key(key)
            .arg(delta)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ProxyError::cache_with_source(format!("递增计数器失败: {key}"), e))
    }

    async fn stats(&self) -> Result<CacheStats> {
        let mut conn = self.connection_manager.clone();
        let total_keys: usize = redis::cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .map_err(|e| ProxyError::cache_with_source("Redis DBSIZE失败", e))?;

        Ok(CacheStats {
            total_keys,
            expired_keys: 0, // Redis自动清理过期键
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            cache_type: self.backend(),
        })
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// 统一缓存管理器
#[derive(Clone)]
pub struct UnifiedCacheManager {
    provider: Arc<dyn CacheProvider>,
}

impl UnifiedCacheManager {
    /// 根据配置创建缓存管理器
    pub async fn from_config(config: &CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let provider: Arc<dyn CacheProvider> = match config.cache_type {
            CacheType::Memory => {
                tracing::info!("使用内存缓存，最大条目数: {}", config.memory_max_entries);
                Arc::new(MemoryCache::new(config.memory_max_entries, clock))
            }
            CacheType::Redis => {
                let redis = config
                    .redis
                    .as_ref()
                    .ok_or_else(|| ProxyError::config("缺少 [cache.redis] 配置"))?;
                tracing::info!("使用Redis缓存");
                Arc::new(RedisCache::connect(redis).await?)
            }
        };

        Ok(Self { provider })
    }

    /// 使用指定的缓存提供者
    #[must_use]
    pub fn new(provider: Arc<dyn CacheProvider>) -> Self {
        Self { provider }
    }

    /// 获取缓存提供者
    #[must_use]
    pub fn provider(&self) -> Arc<dyn CacheProvider> {
        Arc::clone(&self.provider)
    }

    /// 获取缓存统计信息
    pub async fn stats(&self) -> Result<CacheStats> {
        self.provider.stats().await
    }

    /// 输出一次缓存统计日志，读取失败时只记录警告
    pub async fn log_stats(&self) -> Option<CacheStats> {
        match self.provider.stats().await {
            Ok(stats) => {
                linfo!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::Cache,
                    "cache_stats",
                    "缓存统计",
                    backend = stats.cache_type,
                    total_keys = stats.total_keys,
                    expired_keys = stats.expired_keys,
                    hit_count = stats.hit_count,
                    miss_count = stats.miss_count,
                    hit_rate = %format!("{:.2}", stats.hit_rate())
                );
                Some(stats)
            }
            Err(e) => {
                lwarn!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::Cache,
                    "cache_stats_failed",
                    "读取缓存统计失败",
                    error = %e
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for UnifiedCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedCacheManager")
            .field("backend", &self.provider.backend())
            .finish()
    }
}
