//! 翻译模块
//!
//! 把一棵内容树翻译成目标语言：
//! - **pipeline**: 分段（单节点、分组、合并、拆分）
//! - **storage**: 译文缓存
//! - **core**: 请求池、重试策略、重组引擎和任务编排
//! - **backend**: 翻译后端接口与内置实现
//! - **config**: 配置管理
//! - **error**: 错误处理
//!
//! # 基本用法
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pagetrans::translation::{
//!     BackendRegistry, ContentNode, JobOrchestrator, MemoryTree, PseudoTranslator,
//!     TranslationConfig,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TranslationConfig::with_target("zh");
//! let registry = BackendRegistry::single(Arc::new(PseudoTranslator));
//! let orchestrator = JobOrchestrator::from_config(config, registry);
//!
//! let mut tree = MemoryTree::new(vec![ContentNode::new(1, "Hello world")]);
//! let report = orchestrator.run(&mut tree).await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

/// 翻译后端接口和内置实现
pub mod backend;

/// 配置管理
pub mod config;

/// 内容树模型
pub mod content;

/// 调度核心
pub mod core;

/// 错误类型
pub mod error;

/// 分段管道
pub mod pipeline;

/// 译文缓存
pub mod storage;

pub use backend::{BackendRegistry, MockOutcome, MockTranslator, PseudoTranslator, Translator};
pub use config::{constants, ConfigManager, TranslationConfig};
pub use content::{Ancestor, BoundingBox, ContentNode, ContentTree, MemoryTree, NodeId};
pub use self::core::{
    CancelFlag, JobOrchestrator, JobReport, JobState, JobStatsSnapshot, PoolStats, ProgressEvent,
    ProgressSink, ReassemblyEngine, RequestPool, RetryPolicy,
};
pub use error::{ErrorClass, ErrorSeverity, ErrorStats, TranslationError, TranslationResult};
pub use pipeline::{Segment, SegmentBuilder, SegmentKind, SegmentStats};
pub use storage::{CacheConfig, CacheStats, EvictionPolicy, TranslationCache};

/// 用单个后端翻译一棵内容树
pub async fn translate_tree<T>(
    tree: &mut T,
    config: TranslationConfig,
    translator: std::sync::Arc<dyn Translator>,
) -> TranslationResult<JobReport>
where
    T: ContentTree + Send + ?Sized,
{
    let orchestrator = JobOrchestrator::from_config(config, BackendRegistry::single(translator));
    orchestrator.run(tree).await
}

/// 检查当前目录或用户目录下是否存在配置文件
pub fn config_file_exists() -> bool {
    config::config_file_exists()
}

/// 加载配置（配置文件、环境变量，失败时回退到默认值）
pub fn load_translation_config(target_lang: &str) -> TranslationConfig {
    config::load_translation_config(target_lang)
}
