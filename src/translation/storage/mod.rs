//! 存储模块
//!
//! 提供翻译结果缓存。

pub mod cache;

pub use cache::{cache_key, CacheConfig, CacheEntry, CacheStats, EvictionPolicy, TranslationCache};
