//! # 缓存模块
//!
//! 内存/Redis 键值存储，承载速率计数器和补全响应缓存

pub mod abstract_cache;
pub mod keys;

pub use abstract_cache::{CacheProvider, CacheStats, MemoryCache, RedisCache, UnifiedCacheManager};
pub use keys::CacheKey;

#[cfg(test)]
pub use abstract_cache::MockCacheProvider;
