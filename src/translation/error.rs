//! 翻译模块统一错误处理
//!
//! 提供结构化错误类型、失败分类（用于重试策略）和错误统计

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::env::EnvError;

/// 翻译错误类型
#[derive(Error, Debug, Clone)]
pub enum TranslationError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 网络错误
    #[error("网络错误: {0}")]
    NetworkError(String),

    /// 配额或速率限制
    #[error("配额超限: {0}")]
    QuotaExceeded(String),

    /// 超时错误
    #[error("操作超时: {0}")]
    TimeoutError(String),

    /// 翻译后端返回的错误
    #[error("翻译服务错误: {0}")]
    ApiError(String),

    /// 宿主运行环境已失效，整个任务必须中止
    #[error("运行上下文已失效: {0}")]
    ContextInvalidated(String),

    /// 任务被取消（队列清空或协作式取消）
    #[error("任务已取消: {0}")]
    Cancelled(String),

    /// 输入验证错误
    #[error("输入无效: {0}")]
    InvalidInput(String),

    /// 并发错误
    #[error("并发操作错误: {0}")]
    ConcurrencyError(String),

    /// 解析错误
    #[error("解析错误: {0}")]
    ParseError(String),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerializationError(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    InternalError(String),
}

impl TranslationError {
    /// 获取错误的严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TranslationError::ConfigError(_) => ErrorSeverity::Critical,
            TranslationError::NetworkError(_) => ErrorSeverity::Warning,
            TranslationError::QuotaExceeded(_) => ErrorSeverity::Warning,
            TranslationError::TimeoutError(_) => ErrorSeverity::Warning,
            TranslationError::ApiError(_) => ErrorSeverity::Error,
            TranslationError::ContextInvalidated(_) => ErrorSeverity::Critical,
            TranslationError::Cancelled(_) => ErrorSeverity::Info,
            TranslationError::InvalidInput(_) => ErrorSeverity::Info,
            TranslationError::ConcurrencyError(_) => ErrorSeverity::Warning,
            TranslationError::ParseError(_) => ErrorSeverity::Error,
            TranslationError::SerializationError(_) => ErrorSeverity::Error,
            TranslationError::InternalError(_) => ErrorSeverity::Critical,
        }
    }

    /// 是否为取消类错误
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TranslationError::Cancelled(_))
    }
}

/// 错误严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// 失败分类
///
/// 重试策略按类别决定是否重试、最多重试几次以及退避时长。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Network,
    Timeout,
    Quota,
    Api,
    ContextInvalid,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Network => "network",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Quota => "quota",
            ErrorClass::Api => "api",
            ErrorClass::ContextInvalid => "context-invalid",
            ErrorClass::Unknown => "unknown",
        }
    }

    /// 是否为任务级致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorClass::ContextInvalid)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 标准错误转换
impl From<std::io::Error> for TranslationError {
    fn from(error: std::io::Error) -> Self {
        TranslationError::InternalError(format!("IO错误: {}", error))
    }
}

impl From<serde_json::Error> for TranslationError {
    fn from(error: serde_json::Error) -> Self {
        TranslationError::SerializationError(format!("JSON序列化错误: {}", error))
    }
}

impl From<toml::de::Error> for TranslationError {
    fn from(error: toml::de::Error) -> Self {
        TranslationError::ParseError(format!("TOML解析错误: {}", error))
    }
}

impl From<toml::ser::Error> for TranslationError {
    fn from(error: toml::ser::Error) -> Self {
        TranslationError::SerializationError(format!("TOML序列化错误: {}", error))
    }
}

impl From<tokio::time::error::Elapsed> for TranslationError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        TranslationError::TimeoutError(format!("异步操作超时: {}", error))
    }
}

impl From<EnvError> for TranslationError {
    fn from(error: EnvError) -> Self {
        TranslationError::ConfigError(error.to_string())
    }
}

/// 错误结果类型别名
pub type TranslationResult<T> = Result<T, TranslationError>;

/// 错误统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    pub total_errors: usize,
    pub by_class: HashMap<ErrorClass, usize>,
    pub by_severity: HashMap<ErrorSeverity, usize>,
    pub critical_errors: usize,
}

impl ErrorStats {
    /// 记录错误
    pub fn record_error(&mut self, error: &TranslationError, class: ErrorClass) {
        self.total_errors += 1;

        *self.by_class.entry(class).or_insert(0) += 1;

        let severity = error.severity();
        *self.by_severity.entry(severity).or_insert(0) += 1;

        if severity == ErrorSeverity::Critical {
            self.critical_errors += 1;
        }
    }

    /// 某一类错误的数量
    pub fn count(&self, class: ErrorClass) -> usize {
        self.by_class.get(&class).copied().unwrap_or(0)
    }
}
