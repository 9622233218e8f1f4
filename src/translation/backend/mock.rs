//! 测试用的模拟后端
//!
//! 可以预设每次调用的结果、按文本内容注入失败、模拟延迟，并记录调用次数、
//! 调用时间和最大同时在途数。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::Translator;
use crate::translation::config::{constants, TranslationConfig};
use crate::translation::error::{TranslationError, TranslationResult};

/// 预设的单次调用结果
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// 按默认规则返回译文
    Echo,
    /// 返回固定文本
    Text(String),
    /// 返回错误
    Fail(TranslationError),
}

#[derive(Debug, Default)]
pub struct MockTranslator {
    script: Mutex<VecDeque<MockOutcome>>,
    failing_texts: Mutex<Vec<(String, TranslationError)>>,
    prefix: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    call_log: Mutex<Vec<(Instant, String)>>,
}

impl MockTranslator {
    /// 原样返回输入
    pub fn new() -> Self {
        Self::default()
    }

    /// 每个段落前加上前缀
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// 模拟网络延迟
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// 依次消费的调用结果，用完后回到默认行为
    pub fn with_script(self, outcomes: Vec<MockOutcome>) -> Self {
        *self.script.lock().unwrap_or_else(|e| e.into_inner()) = outcomes.into();
        self
    }

    /// 文本包含 `needle` 时总是失败
    pub fn fail_when_contains(self, needle: impl Into<String>, error: TranslationError) -> Self {
        self.failing_texts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((needle.into(), error));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 观察到的最大同时调用数
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// 每次调用的开始时间
    pub fn call_times(&self) -> Vec<Instant> {
        self.call_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    /// 按调用顺序记录的输入文本
    pub fn texts(&self) -> Vec<String> {
        self.call_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    fn render(&self, text: &str) -> String {
        match &self.prefix {
            None => text.to_string(),
            Some(prefix) => text
                .split(constants::SEGMENT_JOINER)
                .map(|p| format!("{}{}", prefix, p))
                .collect::<Vec<_>>()
                .join(constants::SEGMENT_JOINER),
        }
    }

    fn next_outcome(&self, text: &str) -> MockOutcome {
        let failing = self.failing_texts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, error)) = failing.iter().find(|(needle, _)| text.contains(needle.as_str())) {
            return MockOutcome::Fail(error.clone());
        }
        drop(failing);

        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(MockOutcome::Echo)
    }
}

/// 离开作用域时减少在途计数
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Translator for MockTranslator {
    async fn translate(&self, text: &str, _config: &TranslationConfig) -> TranslationResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((Instant::now(), text.to_string()));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let outcome = self.next_outcome(text);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match outcome {
            MockOutcome::Echo => Ok(self.render(text)),
            MockOutcome::Text(translation) => Ok(translation),
            MockOutcome::Fail(error) => Err(error),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
