//! # pagetrans
//!
//! 页面内容翻译管道：把内容节点分段、查缓存、在有界并发和重试策略下调用翻译后端，
//! 再把译文按节点写回。
//!
//! ## 模块组织
//!
//! - `env` - 环境变量定义与解析
//! - `translation` - 分段、缓存、请求池、重试、重组和任务编排

pub mod env;
pub mod translation;

pub use translation::{
    translate_tree, JobOrchestrator, JobReport, TranslationConfig, TranslationError,
    TranslationResult,
};
