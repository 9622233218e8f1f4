//! 翻译后端
//!
//! 管道只依赖 [`Translator`] 特性；具体后端按模型标识注册到 [`BackendRegistry`]。

pub mod mock;
pub mod pseudo;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::translation::config::TranslationConfig;
use crate::translation::error::{TranslationError, TranslationResult};

pub use mock::{MockOutcome, MockTranslator};
pub use pseudo::PseudoTranslator;

/// 翻译能力
#[async_trait]
pub trait Translator: Send + Sync {
    /// 翻译一段文本，语言和模型取自配置
    async fn translate(&self, text: &str, config: &TranslationConfig) -> TranslationResult<String>;

    /// 后端名称，用于日志
    fn name(&self) -> &str {
        "translator"
    }
}

/// 模型标识到后端的映射表
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Translator>>,
    fallback: Option<Arc<dyn Translator>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只有一个后端，所有模型都使用它
    pub fn single(translator: Arc<dyn Translator>) -> Self {
        Self {
            backends: HashMap::new(),
            fallback: Some(translator),
        }
    }

    /// 注册模型后端
    pub fn register(mut self, model_id: impl Into<String>, translator: Arc<dyn Translator>) -> Self {
        self.backends.insert(model_id.into(), translator);
        self
    }

    /// 设置未注册模型使用的后端
    pub fn with_fallback(mut self, translator: Arc<dyn Translator>) -> Self {
        self.fallback = Some(translator);
        self
    }

    /// 按模型标识查找后端
    pub fn resolve(&self, model_id: &str) -> TranslationResult<Arc<dyn Translator>> {
        self.backends
            .get(model_id)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| TranslationError::ConfigError(format!("没有可用于模型 '{}' 的翻译后端", model_id)))
    }

    pub fn models(&self) -> Vec<&str> {
        let mut models: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        models.sort_unstable();
        models
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("models", &self.models())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}
