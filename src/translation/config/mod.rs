//! 翻译配置管理模块
//!
//! 提供配置文件、环境变量和默认值三层合并的配置管理

pub mod manager;

// 重新导出主要类型
pub use manager::{ConfigManager, TranslationConfig};

/// 配置常量
pub mod constants {
    use std::time::Duration;

    // 分段相关
    pub const MIN_SEGMENT_CHARS: usize = 50;
    pub const MAX_SEGMENT_CHARS: usize = 1000;
    pub const MAX_MERGED_CHARS: usize = 500;
    pub const CHUNK_FALLBACK_MIN_CHARS: usize = 500;
    pub const CHUNK_CHARS: usize = 200;
    pub const SEGMENT_JOINER: &str = "\n\n";

    // 分组判定
    pub const GROUP_MAX_DEPTH_DIFF: usize = 2;
    pub const GROUP_MIN_SIMILARITY: f64 = 0.3;
    pub const GROUP_MAX_CENTER_DISTANCE: f64 = 100.0;
    pub const GROUP_NEAR_DEPTH_DIFF: usize = 3;

    // 容器角色
    pub const CONTAINER_ROLES: &[&str] = &[
        "article", "section", "main", "aside", "blockquote", "li", "td", "figure",
    ];

    // 请求池
    pub const DEFAULT_CONCURRENCY_LIMIT: usize = 5;
    pub const MAX_CONCURRENCY_LIMIT: usize = 10;
    pub const DEFAULT_REQUEST_DELAY_MS: u64 = 100;
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    // 重试
    pub const DEFAULT_MAX_RETRIES: usize = 3;
    pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;

    // 缓存
    pub const DEFAULT_CACHE_MAX_SIZE: usize = 1000;

    // 报告
    pub const DEFAULT_FAILURE_WARN_THRESHOLD: f64 = 0.2;

    // 默认模型与语言
    pub const DEFAULT_MODEL_ID: &str = "pseudo";
    pub const DEFAULT_SOURCE_LANG: &str = "auto";
    pub const DEFAULT_TARGET_LANG: &str = "zh";

    // 配置文件搜索路径
    pub const CONFIG_PATHS: &[&str] = &[
        "pagetrans.toml",
        ".pagetrans.toml",
        "pagetrans.json",
        "~/.config/pagetrans/config.toml",
        "/etc/pagetrans/config.toml",
    ];
}

/// 是否存在任一配置文件
pub fn config_file_exists() -> bool {
    constants::CONFIG_PATHS
        .iter()
        .any(|path| std::path::Path::new(shellexpand::tilde(path).as_ref()).exists())
}

/// 加载配置，失败时退回默认值
pub fn load_translation_config(target_lang: &str) -> TranslationConfig {
    match ConfigManager::new() {
        Ok(manager) => {
            let mut config = manager.get_config().clone();
            config.target_language = target_lang.to_string();
            config
        }
        Err(e) => {
            tracing::warn!("配置加载失败，使用默认配置: {}", e);
            TranslationConfig::with_target(target_lang)
        }
    }
}
