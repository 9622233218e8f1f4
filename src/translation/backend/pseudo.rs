//! 伪翻译后端
//!
//! 不访问任何服务：给每个段落加上目标语言标记，命令行演示和端到端测试使用。

use async_trait::async_trait;

use super::Translator;
use crate::translation::config::{constants, TranslationConfig};
use crate::translation::error::TranslationResult;

#[derive(Debug, Clone, Copy, Default)]
pub struct PseudoTranslator;

impl PseudoTranslator {
    pub fn render(text: &str, target: &str) -> String {
        text.split(constants::SEGMENT_JOINER)
            .map(|paragraph| {
                if paragraph.trim().is_empty() {
                    paragraph.to_string()
                } else {
                    format!("[{}] {}", target, paragraph)
                }
            })
            .collect::<Vec<_>>()
            .join(constants::SEGMENT_JOINER)
    }
}

#[async_trait]
impl Translator for PseudoTranslator {
    async fn translate(&self, text: &str, config: &TranslationConfig) -> TranslationResult<String> {
        Ok(Self::render(text, &config.target_language))
    }

    fn name(&self) -> &str {
        "pseudo"
    }
}
