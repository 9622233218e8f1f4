//! 命令行入口
//!
//! 读取 JSON 内容树，翻译后输出 `{tree, report, finished_at}`。

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use pagetrans::env::{self, EnvVar};
use pagetrans::translation::{
    BackendRegistry, ConfigManager, JobOrchestrator, JobReport, MemoryTree, ProgressEvent,
    PseudoTranslator, TranslationConfig,
};

/// 页面内容翻译管道
#[derive(Parser, Debug)]
#[command(name = "pagetrans", version, about, long_about = None)]
struct Args {
    /// 输入的 JSON 内容树，`-` 表示标准输入
    input: Option<PathBuf>,

    /// 输出文件，缺省时写到标准输出
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 配置文件（TOML 或 JSON）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 目标语言
    #[arg(short = 't', long)]
    target_lang: Option<String>,

    /// 源语言
    #[arg(short = 's', long)]
    source_lang: Option<String>,

    /// 模型标识
    #[arg(short, long)]
    model: Option<String>,

    /// 最大并发请求数 (1-10)
    #[arg(long)]
    concurrency: Option<usize>,

    /// 请求间隔（毫秒）
    #[arg(long)]
    delay_ms: Option<u64>,

    /// 关闭分段，每个节点单独翻译
    #[arg(long)]
    no_segmentation: bool,

    /// 关闭译文缓存
    #[arg(long)]
    no_cache: bool,

    /// 日志级别
    #[arg(long)]
    log_level: Option<String>,

    /// 在指定路径生成示例配置后退出
    #[arg(long, value_name = "PATH")]
    init_config: Option<PathBuf>,

    /// 打印支持的环境变量后退出
    #[arg(long)]
    env_docs: bool,
}

#[derive(Serialize)]
struct Output<'a> {
    tree: &'a MemoryTree,
    report: &'a JobReport,
    finished_at: String,
}

fn setup_logging(level: Option<&str>) {
    let level = level
        .map(str::to_string)
        .unwrap_or_else(|| env::core::LogLevel::get_or_default("info".to_string()));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pagetrans={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<TranslationConfig, Box<dyn std::error::Error>> {
    let manager = match &args.config {
        Some(path) => ConfigManager::from_path(path)?,
        None => ConfigManager::new()?,
    };
    let mut config = manager.into_config();

    if let Some(target) = &args.target_lang {
        config.target_language = target.clone();
    }
    if let Some(source) = &args.source_lang {
        config.source_language = source.clone();
    }
    if let Some(model) = &args.model {
        config.model_id = model.clone();
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency_limit = concurrency;
    }
    if let Some(delay) = args.delay_ms {
        config.request_delay_ms = delay;
    }
    if args.no_segmentation {
        config.segmentation_enabled = false;
    }
    if args.no_cache {
        config.cache_enabled = false;
    }

    config.normalize();
    config.validate()?;
    Ok(config)
}

fn read_input(input: Option<&PathBuf>) -> Result<String, Box<dyn std::error::Error>> {
    match input {
        Some(path) if path.as_os_str() != "-" => Ok(std::fs::read_to_string(path)?),
        _ => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            Ok(buffer)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_logging(args.log_level.as_deref());

    if args.env_docs {
        println!("{}", env::generate_env_docs());
        return Ok(());
    }

    if let Some(path) = &args.init_config {
        ConfigManager::generate_example_config(path)?;
        eprintln!("已生成示例配置文件: {}", path.display());
        return Ok(());
    }

    let config = load_config(&args)?;
    let mut tree = MemoryTree::from_json(&read_input(args.input.as_ref())?)?;

    let registry = BackendRegistry::single(Arc::new(PseudoTranslator));
    let orchestrator = JobOrchestrator::from_config(config, registry).with_progress(Arc::new(
        |event: &ProgressEvent| {
            tracing::debug!(
                "进度 {}/{} (成功 {}, 失败 {}, 排队 {}, {:.1}/s)",
                event.processed,
                event.total,
                event.succeeded,
                event.failed,
                event.queued,
                event.rate
            );
        },
    ));

    let report = orchestrator.run(&mut tree).await?;
    eprintln!("{}", report.summary());

    let output = Output {
        tree: &tree,
        report: &report,
        finished_at: chrono::Utc::now().to_rfc3339(),
    };
    let json = serde_json::to_string_pretty(&output)?;

    match &args.output {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{}", json),
    }

    if report.is_aborted() {
        std::process::exit(2);
    }
    Ok(())
}
