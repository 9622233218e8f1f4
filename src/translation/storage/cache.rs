//! 翻译缓存模块
//!
//! 以规范化文本和语言/模型配置为键缓存翻译结果。容量有上限，
//! 超出时按插入顺序（默认）或最近最少使用淘汰。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::translation::config::{constants, TranslationConfig};

/// 淘汰策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// 先插入的先淘汰
    #[default]
    #[serde(alias = "fifo")]
    InsertionOrder,
    /// 最久未访问的先淘汰
    #[serde(alias = "lru")]
    LeastRecentlyUsed,
}

/// 缓存条目
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub translated_text: String,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
    /// 单调递增的访问序号，LRU 淘汰按它比较
    access_tick: u64,
}

impl CacheEntry {
    fn new(translated_text: String, tick: u64) -> Self {
        let now = Instant::now();
        Self {
            translated_text,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            access_tick: tick,
        }
    }

    /// 更新访问信息
    fn access(&mut self, tick: u64) {
        self.access_count += 1;
        self.last_accessed = Instant::now();
        self.access_tick = tick;
    }

    /// 检查条目是否过期
    pub fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| self.created_at.elapsed() > ttl)
    }
}

/// 缓存配置
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_size: usize,
    /// `None` 表示条目不过期
    pub ttl: Option<Duration>,
    pub eviction: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: constants::DEFAULT_CACHE_MAX_SIZE,
            ttl: None,
            eviction: EvictionPolicy::default(),
        }
    }
}

impl From<&TranslationConfig> for CacheConfig {
    fn from(config: &TranslationConfig) -> Self {
        Self {
            max_size: config.cache_max_size.max(1),
            ttl: config.cache_ttl(),
            eviction: config.cache_eviction,
        }
    }
}

/// 缓存统计信息
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub evictions: u64,
    pub expired: u64,
}

impl CacheStats {
    /// 命中率
    pub fn hit_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.requests as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// 插入顺序，覆盖已有键时位置不变
    order: VecDeque<String>,
    stats: CacheStats,
    tick: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    /// 移除最早插入的条目
    fn pop_oldest(&mut self) -> Option<String> {
        let key = self.order.pop_front()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// 翻译缓存
#[derive(Debug)]
pub struct TranslationCache {
    state: Mutex<CacheState>,
    config: CacheConfig,
}

/// 生成缓存键
///
/// 每个字段带长度前缀，字段边界不会混淆。
pub fn cache_key(text: &str, config: &TranslationConfig) -> String {
    let mut hasher = blake3::Hasher::new();
    for field in [
        text.trim(),
        config.model_id.as_str(),
        config.source_language.as_str(),
        config.target_language.as_str(),
    ] {
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

impl TranslationCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            config,
        }
    }

    /// 按翻译配置创建共享缓存
    pub fn shared(config: &TranslationConfig) -> Arc<Self> {
        Arc::new(Self::new(CacheConfig::from(config)))
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self::new(CacheConfig {
            max_size,
            ..CacheConfig::default()
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 查询缓存，命中时更新访问信息
    pub fn get(&self, text: &str, config: &TranslationConfig) -> Option<String> {
        let key = cache_key(text, config);
        let mut state = self.lock();
        state.stats.requests += 1;

        let expired = state
            .entries
            .get(&key)
            .map(|entry| entry.is_expired(self.config.ttl));

        match expired {
            Some(false) => {
                let tick = state.next_tick();
                let translation = state.entries.get_mut(&key).map(|entry| {
                    entry.access(tick);
                    entry.translated_text.clone()
                });
                state.stats.hits += 1;
                translation
            }
            Some(true) => {
                state.remove(&key);
                state.stats.expired += 1;
                state.stats.misses += 1;
                None
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// 写入翻译结果，空白译文忽略
    pub fn put(&self, text: &str, config: &TranslationConfig, translation: &str) {
        if translation.trim().is_empty() {
            return;
        }

        let key = cache_key(text, config);
        let mut state = self.lock();
        let tick = state.next_tick();

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.translated_text = translation.to_string();
            entry.access_tick = tick;
            return;
        }

        state.order.push_back(key.clone());
        state
            .entries
            .insert(key, CacheEntry::new(translation.to_string(), tick));

        self.evict_over_capacity(&mut state);
    }

    fn evict_over_capacity(&self, state: &mut CacheState) {
        while state.entries.len() > self.config.max_size {
            let victim = match self.config.eviction {
                EvictionPolicy::InsertionOrder => state.pop_oldest(),
                EvictionPolicy::LeastRecentlyUsed => {
                    let key = state
                        .entries
                        .iter()
                        .min_by_key(|(_, entry)| entry.access_tick)
                        .map(|(key, _)| key.clone());
                    if let Some(key) = &key {
                        state.remove(key);
                    }
                    key
                }
            };

            if victim.is_none() {
                break;
            }
            state.stats.evictions += 1;
        }
    }

    /// 是否存在未过期条目，不计入统计
    pub fn contains(&self, text: &str, config: &TranslationConfig) -> bool {
        let key = cache_key(text, config);
        self.lock()
            .entries
            .get(&key)
            .is_some_and(|entry| !entry.is_expired(self.config.ttl))
    }

    /// 清空缓存和统计
    pub fn clear(&self) {
        *self.lock() = CacheState::default();
        tracing::debug!("翻译缓存已清空");
    }

    /// 清理过期条目
    pub fn cleanup_expired(&self) -> usize {
        if self.config.ttl.is_none() {
            return 0;
        }

        let mut state = self.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(self.config.ttl))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }
        state.stats.expired += expired.len() as u64;

        if !expired.is_empty() {
            tracing::debug!("清理了 {} 个过期缓存条目", expired.len());
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            ..state.stats.clone()
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.max_size
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
