//! 配置管理器
//!
//! 提供统一的配置接口，支持文件配置、环境变量和默认值

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::constants;
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::storage::EvictionPolicy;

/// 翻译任务配置
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TranslationConfig {
    // 基础配置
    pub model_id: String,
    pub source_language: String,
    pub target_language: String,

    // 调度配置
    pub concurrency_limit: usize,
    pub request_delay_ms: u64,
    pub segmentation_enabled: bool,

    // 请求配置
    pub request_timeout_ms: u64,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,

    // 缓存配置
    pub cache_enabled: bool,
    pub cache_max_size: usize,
    pub cache_ttl_secs: u64,
    pub cache_eviction: EvictionPolicy,

    // 报告配置
    pub failure_warn_threshold: f64,

    // 按模型覆盖的超时（毫秒）
    pub model_timeouts_ms: HashMap<String, u64>,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            model_id: constants::DEFAULT_MODEL_ID.to_string(),
            source_language: constants::DEFAULT_SOURCE_LANG.to_string(),
            target_language: constants::DEFAULT_TARGET_LANG.to_string(),

            concurrency_limit: constants::DEFAULT_CONCURRENCY_LIMIT,
            request_delay_ms: constants::DEFAULT_REQUEST_DELAY_MS,
            segmentation_enabled: true,

            request_timeout_ms: constants::DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            max_retries: constants::DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: constants::DEFAULT_RETRY_BASE_DELAY_MS,

            cache_enabled: true,
            cache_max_size: constants::DEFAULT_CACHE_MAX_SIZE,
            cache_ttl_secs: 0,
            cache_eviction: EvictionPolicy::default(),

            failure_warn_threshold: constants::DEFAULT_FAILURE_WARN_THRESHOLD,

            model_timeouts_ms: HashMap::new(),
        }
    }
}

impl TranslationConfig {
    /// 创建指定目标语言的默认配置
    pub fn with_target(target_language: &str) -> Self {
        Self {
            target_language: target_language.to_string(),
            ..Self::default()
        }
    }

    /// 将并发数限制到允许范围内
    pub fn normalize(&mut self) {
        let clamped = self
            .concurrency_limit
            .clamp(1, constants::MAX_CONCURRENCY_LIMIT);
        if clamped != self.concurrency_limit {
            tracing::warn!(
                "并发数 {} 超出范围，已调整为 {}",
                self.concurrency_limit,
                clamped
            );
            self.concurrency_limit = clamped;
        }
    }

    /// 验证配置
    pub fn validate(&self) -> TranslationResult<()> {
        if self.model_id.trim().is_empty() {
            return Err(TranslationError::ConfigError("模型标识不能为空".to_string()));
        }

        if self.source_language.trim().is_empty() || self.target_language.trim().is_empty() {
            return Err(TranslationError::ConfigError("语言代码不能为空".to_string()));
        }

        if self.concurrency_limit == 0 || self.concurrency_limit > constants::MAX_CONCURRENCY_LIMIT {
            return Err(TranslationError::ConfigError(format!(
                "并发数必须在 1 到 {} 之间",
                constants::MAX_CONCURRENCY_LIMIT
            )));
        }

        if self.request_timeout_ms == 0 {
            return Err(TranslationError::ConfigError("请求超时不能为0".to_string()));
        }

        if self.cache_enabled && self.cache_max_size == 0 {
            return Err(TranslationError::ConfigError(
                "启用缓存时缓存大小不能为0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.failure_warn_threshold) {
            return Err(TranslationError::ConfigError(
                "失败告警阈值必须在 0 到 1 之间".to_string(),
            ));
        }

        Ok(())
    }

    /// 应用环境变量覆盖
    pub fn apply_env_overrides(&mut self) {
        use crate::env::{cache, translation, EnvVar};

        if let Some(Ok(model)) = translation::ModelId::get_explicit() {
            self.model_id = model;
        }

        if let Some(Ok(target)) = translation::TargetLang::get_explicit() {
            self.target_language = target;
        }

        if let Some(Ok(source)) = translation::SourceLang::get_explicit() {
            self.source_language = source;
        }

        if let Some(Ok(limit)) = translation::ConcurrencyLimit::get_explicit() {
            self.concurrency_limit = limit;
        }

        if let Some(Ok(delay)) = translation::RequestDelay::get_explicit() {
            self.request_delay_ms = delay.as_millis() as u64;
        }

        if let Some(Ok(enabled)) = translation::SegmentationEnabled::get_explicit() {
            self.segmentation_enabled = enabled;
        }

        if let Some(Ok(timeout)) = translation::RequestTimeout::get_explicit() {
            self.request_timeout_ms = timeout.as_millis() as u64;
        }

        if let Some(Ok(retries)) = translation::MaxRetries::get_explicit() {
            self.max_retries = retries;
        }

        // 缓存相关环境变量
        if let Some(Ok(enabled)) = cache::Enabled::get_explicit() {
            self.cache_enabled = enabled;
        }

        if let Some(Ok(size)) = cache::MaxSize::get_explicit() {
            self.cache_max_size = size;
        }

        if let Some(Ok(ttl)) = cache::Ttl::get_explicit() {
            self.cache_ttl_secs = ttl.as_secs();
        }
    }

    /// 某个模型的单次调用超时
    pub fn timeout_for(&self, model_id: &str) -> Duration {
        let millis = self
            .model_timeouts_ms
            .get(model_id)
            .copied()
            .unwrap_or(self.request_timeout_ms);
        Duration::from_millis(millis)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// 缓存TTL，0 表示不过期
    pub fn cache_ttl(&self) -> Option<Duration> {
        if self.cache_ttl_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.cache_ttl_secs))
        }
    }
}

/// 配置管理器
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: TranslationConfig,
}

impl ConfigManager {
    /// 按搜索路径加载配置
    pub fn new() -> TranslationResult<Self> {
        Self::load_dotenv();
        let config = Self::load_config()?;
        Self::finish(config)
    }

    /// 从指定文件加载配置
    pub fn from_path<P: AsRef<Path>>(path: P) -> TranslationResult<Self> {
        Self::load_dotenv();
        let expanded = shellexpand::tilde(&path.as_ref().to_string_lossy()).into_owned();
        tracing::info!("加载配置文件: {}", expanded);
        let config = Self::load_from_file(&expanded)?;
        Self::finish(config)
    }

    /// 使用给定配置，仍然应用环境变量并验证
    pub fn from_config(config: TranslationConfig) -> TranslationResult<Self> {
        Self::finish(config)
    }

    fn finish(mut config: TranslationConfig) -> TranslationResult<Self> {
        config.apply_env_overrides();
        config.normalize();
        config.validate()?;

        Ok(Self { config })
    }

    /// 获取配置
    pub fn get_config(&self) -> &TranslationConfig {
        &self.config
    }

    pub fn into_config(self) -> TranslationConfig {
        self.config
    }

    fn load_config() -> TranslationResult<TranslationConfig> {
        for path in constants::CONFIG_PATHS {
            let expanded_path = shellexpand::tilde(path);
            if Path::new(expanded_path.as_ref()).exists() {
                tracing::info!("加载配置文件: {}", expanded_path);
                return Self::load_from_file(&expanded_path);
            }
        }

        tracing::info!("未找到配置文件，使用默认配置");
        Ok(TranslationConfig::default())
    }

    fn load_from_file(path: &str) -> TranslationResult<TranslationConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TranslationError::ConfigError(format!("读取配置文件失败: {}", e)))?;

        if path.ends_with(".json") {
            serde_json::from_str(&content)
                .map_err(|e| TranslationError::ConfigError(format!("解析JSON配置失败: {}", e)))
        } else {
            toml::from_str(&content)
                .map_err(|e| TranslationError::ConfigError(format!("解析TOML配置失败: {}", e)))
        }
    }

    /// 加载 .env 文件
    fn load_dotenv() {
        let env_files = [".env.local", ".env"];

        for env_file in &env_files {
            if Path::new(env_file).exists() && dotenv::from_filename(env_file).is_ok() {
                tracing::info!("已加载环境变量文件: {}", env_file);
                break;
            }
        }
    }

    /// 生成示例配置文件
    pub fn generate_example_config<P: AsRef<Path>>(path: P) -> TranslationResult<()> {
        let config = TranslationConfig::default();
        let content = toml::to_string_pretty(&config)?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| TranslationError::ConfigError(format!("写入配置文件失败: {}", e)))?;

        Ok(())
    }
}
