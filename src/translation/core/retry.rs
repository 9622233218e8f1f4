//! 重试策略
//!
//! 对失败分类，按类别决定是否重试、最多重试几次和退避时长。
//!
//! | 类别 | 最多重试 | 第 n 次重试前等待 |
//! |---|---|---|
//! | context-invalid | 0 | 不重试，整个任务中止 |
//! | quota | 2 | 2 × base × 2^(n−1) |
//! | network / timeout | min(3, 全局上限) | base × 2^(n−1) |
//! | api | 2 | base |
//! | unknown | 1 | base |

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::sleep;

use super::cancel::CancelFlag;
use crate::translation::config::{constants, TranslationConfig};
use crate::translation::error::{ErrorClass, TranslationError, TranslationResult};

/// 按消息文本分类时使用的规则，按顺序匹配
fn message_rules() -> &'static [(Regex, ErrorClass)] {
    static RULES: OnceLock<Vec<(Regex, ErrorClass)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"context invalidated|extension context|context.*(lost|destroyed)", ErrorClass::ContextInvalid),
            (r"quota|rate.?limit|too many requests|\b429\b", ErrorClass::Quota),
            (r"timed? ?out|deadline", ErrorClass::Timeout),
            (r"network|connection|connect|fetch failed|dns|socket|reset by peer", ErrorClass::Network),
            (r"\bapi\b|status:? ?\d{3}|http \d{3}|bad response", ErrorClass::Api),
        ]
        .into_iter()
        .filter_map(|(pattern, class)| Regex::new(pattern).ok().map(|re| (re, class)))
        .collect()
    })
}

/// 多次尝试后的最终失败
#[derive(Debug, Clone)]
pub struct RetryError {
    pub error: TranslationError,
    pub class: ErrorClass,
    /// 实际调用次数
    pub attempts: u32,
}

impl RetryError {
    pub fn is_fatal(&self) -> bool {
        self.class.is_fatal()
    }
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            constants::DEFAULT_MAX_RETRIES,
            Duration::from_millis(constants::DEFAULT_RETRY_BASE_DELAY_MS),
        )
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &TranslationConfig) -> Self {
        Self::new(config.max_retries, config.retry_base_delay())
    }

    /// 失败分类：先看错误类型，再匹配消息文本
    pub fn classify(error: &TranslationError) -> ErrorClass {
        match error {
            TranslationError::NetworkError(_) => ErrorClass::Network,
            TranslationError::TimeoutError(_) => ErrorClass::Timeout,
            TranslationError::QuotaExceeded(_) => ErrorClass::Quota,
            TranslationError::ApiError(_) => ErrorClass::Api,
            TranslationError::ContextInvalidated(_) => ErrorClass::ContextInvalid,
            other => Self::classify_message(&other.to_string()),
        }
    }

    pub fn classify_message(message: &str) -> ErrorClass {
        let message = message.to_lowercase();
        message_rules()
            .iter()
            .find(|(re, _)| re.is_match(&message))
            .map(|(_, class)| *class)
            .unwrap_or(ErrorClass::Unknown)
    }

    /// 某一类失败最多重试几次
    pub fn max_retries_for(&self, class: ErrorClass) -> usize {
        match class {
            ErrorClass::ContextInvalid => 0,
            ErrorClass::Quota => 2,
            ErrorClass::Network | ErrorClass::Timeout => self.max_retries.min(3),
            ErrorClass::Api => 2,
            ErrorClass::Unknown => 1,
        }
    }

    /// 已经重试 `retries` 次后是否还能再试
    pub fn should_retry(&self, class: ErrorClass, retries: usize) -> bool {
        retries < self.max_retries_for(class)
    }

    /// 第 `retry` 次重试（从 1 开始）前的等待时间
    pub fn backoff_for(&self, class: ErrorClass, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        match class {
            ErrorClass::Quota => self.base_delay * 2 * 2u32.pow(exponent),
            ErrorClass::Network | ErrorClass::Timeout => self.base_delay * 2u32.pow(exponent),
            ErrorClass::Api | ErrorClass::Unknown => self.base_delay,
            ErrorClass::ContextInvalid => Duration::ZERO,
        }
    }

    /// 在策略下执行操作
    ///
    /// 每次尝试前检查取消标志；`op` 的参数是从 1 开始的尝试序号。
    pub async fn execute<T, F, Fut>(&self, cancel: &CancelFlag, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = TranslationResult<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError {
                    error: TranslationError::Cancelled("任务已取消，跳过翻译调用".to_string()),
                    class: ErrorClass::Unknown,
                    attempts: attempt,
                });
            }

            attempt += 1;
            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let class = Self::classify(&error);
            let retries = (attempt - 1) as usize;

            if !self.should_retry(class, retries) {
                if attempt > 1 {
                    tracing::warn!("翻译失败，已尝试 {} 次 ({}): {}", attempt, class, error);
                }
                return Err(RetryError {
                    error,
                    class,
                    attempts: attempt,
                });
            }

            let delay = self.backoff_for(class, attempt);
            tracing::warn!(
                "翻译失败 ({})，{}ms后重试 (尝试 {}/{}): {}",
                class,
                delay.as_millis(),
                attempt + 1,
                self.max_retries_for(class) + 1,
                error
            );
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_classify_typed_and_messages() {
        assert_eq!(
            RetryPolicy::classify(&TranslationError::QuotaExceeded("x".into())),
            ErrorClass::Quota
        );
        assert_eq!(
            RetryPolicy::classify(&TranslationError::InternalError("Extension context invalidated.".into())),
            ErrorClass::ContextInvalid
        );
        assert_eq!(
            RetryPolicy::classify(&TranslationError::ParseError("HTTP 429 Too Many Requests".into())),
            ErrorClass::Quota
        );
        assert_eq!(RetryPolicy::classify_message("request timed out"), ErrorClass::Timeout);
        assert_eq!(RetryPolicy::classify_message("TypeError: Fetch failed"), ErrorClass::Network);
        assert_eq!(RetryPolicy::classify_message("bad gateway, status 502"), ErrorClass::Api);
        assert_eq!(RetryPolicy::classify_message("something odd"), ErrorClass::Unknown);
    }

    #[test]
    fn test_retry_limits() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(ErrorClass::ContextInvalid, 0));
        assert!(policy.should_retry(ErrorClass::Quota, 1));
        assert!(!policy.should_retry(ErrorClass::Quota, 2));
        assert!(policy.should_retry(ErrorClass::Network, 2));
        assert!(!policy.should_retry(ErrorClass::Network, 3));
        assert!(!policy.should_retry(ErrorClass::Unknown, 1));

        let strict = RetryPolicy::new(1, Duration::from_millis(10));
        assert_eq!(strict.max_retries_for(ErrorClass::Timeout), 1);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let millis = |class, n| policy.backoff_for(class, n).as_millis();

        assert_eq!(millis(ErrorClass::Network, 1), 1000);
        assert_eq!(millis(ErrorClass::Network, 2), 2000);
        assert_eq!(millis(ErrorClass::Timeout, 3), 4000);
        assert_eq!(millis(ErrorClass::Quota, 1), 2000);
        assert_eq!(millis(ErrorClass::Quota, 2), 4000);
        assert_eq!(millis(ErrorClass::Api, 2), 1000);
        assert_eq!(millis(ErrorClass::Unknown, 1), 1000);
    }

    #[tokio::test]
    async fn test_execute_stops_at_ceiling() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .execute(&CancelFlag::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TranslationError::NetworkError("connection reset".into())) }
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.class, ErrorClass::Network);
        assert_eq!(failure.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_execute_recovers() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result = policy
            .execute(&CancelFlag::new(), |attempt| async move {
                if attempt < 2 {
                    Err(TranslationError::ApiError("status 503".into()))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_context_invalid_single_attempt() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .execute(&CancelFlag::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TranslationError::ContextInvalidated("gone".into())) }
            })
            .await;

        assert!(result.unwrap_err().is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let flag = CancelFlag::new();
        flag.cancel();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = RetryPolicy::default()
            .execute(&flag, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(result.unwrap_err().error.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
