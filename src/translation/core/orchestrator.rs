//! 任务编排器
//!
//! 一次翻译任务的驱动者：分段、查缓存、把未命中的段提交到请求池、
//! 在重试策略和超时保护下调用翻译后端、把结果交给重组引擎写回，并汇总统计和进度。
//!
//! 状态流转：`Idle → Building → Dispatching → Draining → Completed | Aborted`。
//! `context-invalid` 类失败会中止整个任务：设置本任务的中止标志并清空请求池队列。
//! 中止标志由调用方的取消标志派生，每个任务一个，不会影响之后的任务。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;

use super::cancel::CancelFlag;
use super::pool::{PoolStats, RequestPool};
use super::reassembly::ReassemblyEngine;
use super::retry::RetryPolicy;
use crate::translation::backend::BackendRegistry;
use crate::translation::config::TranslationConfig;
use crate::translation::content::ContentTree;
use crate::translation::error::{ErrorStats, TranslationError, TranslationResult};
use crate::translation::pipeline::{Segment, SegmentBuilder, SegmentKind, SegmentStats};
use crate::translation::storage::{CacheStats, TranslationCache};

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Building,
    Dispatching,
    Draining,
    Completed,
    Aborted,
}

impl JobState {
    pub fn is_running(&self) -> bool {
        matches!(self, JobState::Building | JobState::Dispatching | JobState::Draining)
    }
}

/// 任务统计（线程安全）
#[derive(Debug, Default)]
pub struct JobStats {
    total: AtomicUsize,
    processed: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    cached: AtomicUsize,
    cancelled: AtomicUsize,
    started_at: Mutex<Option<Instant>>,
}

impl JobStats {
    fn reset(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        self.succeeded.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.cached.store(0, Ordering::Relaxed);
        self.cancelled.store(0, Ordering::Relaxed);
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
    }

    fn inc_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_cached(&self) {
        self.cached.fetch_add(1, Ordering::Relaxed);
        self.inc_succeeded();
    }

    fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn add_cancelled(&self, count: usize) {
        self.cancelled.fetch_add(count, Ordering::Relaxed);
        self.processed.fetch_add(count, Ordering::Relaxed);
    }

    /// 获取统计快照
    pub fn snapshot(&self, pool: &PoolStats) -> JobStatsSnapshot {
        let elapsed = self
            .started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|start| start.elapsed())
            .unwrap_or_default();
        let processed = self.processed.load(Ordering::Relaxed);
        let rate = if elapsed.as_secs_f64() > 0.0 {
            processed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        JobStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            processed,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            active: pool.active,
            queued: pool.queued,
            elapsed_ms: elapsed.as_millis() as u64,
            rate,
        }
    }
}

/// 任务统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStatsSnapshot {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// 缓存命中，同时计入 succeeded
    pub cached: usize,
    /// 因取消或中止而未执行
    pub cancelled: usize,
    pub active: usize,
    pub queued: usize,
    pub elapsed_ms: u64,
    /// 每秒处理的段数
    pub rate: f64,
}

/// 进度事件，每个段结束后发出
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub processed: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rate: f64,
    pub queued: usize,
    pub pool: PoolStats,
}

/// 进度接收者
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// 任务报告
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub state: JobState,
    pub stats: JobStatsSnapshot,
    pub pool: PoolStats,
    pub segments: SegmentStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
    pub errors: ErrorStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub failure_warn_threshold: f64,
}

impl JobReport {
    pub fn is_aborted(&self) -> bool {
        self.state == JobState::Aborted
    }

    /// 失败段占全部段的比例
    pub fn failure_rate(&self) -> f64 {
        if self.stats.total == 0 {
            0.0
        } else {
            self.stats.failed as f64 / self.stats.total as f64
        }
    }

    /// 是否超过失败告警阈值
    pub fn exceeds_failure_threshold(&self) -> bool {
        self.failure_rate() > self.failure_warn_threshold
    }

    /// 面向用户的结果摘要
    pub fn summary(&self) -> String {
        if let Some(reason) = &self.abort_reason {
            return format!(
                "aborted: {} ({}/{} segments translated)",
                reason, self.stats.succeeded, self.stats.total
            );
        }

        match self.stats.failed {
            0 => format!("completed: {} segments translated", self.stats.succeeded),
            failed => {
                let mut summary = format!(
                    "completed with {} failures ({}/{} segments translated, failure rate {:.1}%)",
                    failed,
                    self.stats.succeeded,
                    self.stats.total,
                    self.failure_rate() * 100.0
                );
                if self.exceeds_failure_threshold() {
                    summary.push_str(" - warning: failure rate above threshold");
                }
                summary
            }
        }
    }
}

/// 单个任务内共享的写回状态
struct ApplyState<'t, T: ?Sized> {
    tree: &'t mut T,
    engine: ReassemblyEngine,
}

struct JobContext<'t, T: ?Sized> {
    apply: Mutex<ApplyState<'t, T>>,
    errors: Mutex<ErrorStats>,
    /// 本任务的中止标志，调用方取消时同样可见
    abort: CancelFlag,
    abort_reason: Arc<Mutex<Option<String>>>,
}

impl<'t, T: ?Sized> JobContext<'t, T> {
    fn apply(&self) -> MutexGuard<'_, ApplyState<'t, T>> {
        self.apply.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 段的起步结果
enum Started {
    /// 缓存命中，已写回
    Settled,
    /// 任务已中止，未提交
    Cancelled,
    /// 已提交到请求池
    Pending(BoxFuture<'static, TranslationResult<String>>),
}

/// `run` 的 future 在结束前被丢弃时负责收尾
struct RunGuard<'a> {
    orchestrator: &'a JobOrchestrator,
    abort: CancelFlag,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.orchestrator.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.is_running() {
            return;
        }

        self.abort.cancel();
        let rejected = self.orchestrator.pool.cancel_pending();
        *state = JobState::Aborted;
        tracing::warn!("翻译任务在结束前被丢弃，已拒绝 {} 个排队请求", rejected);
    }
}

/// 任务编排器
pub struct JobOrchestrator {
    config: Arc<TranslationConfig>,
    registry: BackendRegistry,
    cache: Option<Arc<TranslationCache>>,
    pool: RequestPool,
    retry: RetryPolicy,
    cancel: CancelFlag,
    progress: Option<Arc<dyn ProgressSink>>,
    state: Mutex<JobState>,
    stats: JobStats,
}

impl JobOrchestrator {
    /// 使用显式传入的缓存和请求池创建编排器
    pub fn new(
        config: TranslationConfig,
        registry: BackendRegistry,
        cache: Option<Arc<TranslationCache>>,
        pool: RequestPool,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            config: Arc::new(config),
            registry,
            cache,
            pool,
            retry,
            cancel: CancelFlag::new(),
            progress: None,
            state: Mutex::new(JobState::Idle),
            stats: JobStats::default(),
        }
    }

    /// 按配置创建缓存和请求池
    pub fn from_config(config: TranslationConfig, registry: BackendRegistry) -> Self {
        let cache = config
            .cache_enabled
            .then(|| TranslationCache::shared(&config));
        let pool = RequestPool::from_config(&config);
        Self::new(config, registry, cache, pool)
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn config(&self) -> &TranslationConfig {
        &self.config
    }

    pub fn pool(&self) -> &RequestPool {
        &self.pool
    }

    pub fn cache(&self) -> Option<&Arc<TranslationCache>> {
        self.cache.as_ref()
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: JobState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        tracing::debug!("任务状态: {:?}", state);
    }

    /// 当前统计快照
    pub fn stats(&self) -> JobStatsSnapshot {
        self.stats.snapshot(&self.pool.stats())
    }

    /// 执行一次翻译任务
    ///
    /// 同一时间只能运行一个任务；请求池统计在任务开始时重置。
    /// 返回的 future 被提前丢弃时，排队请求被拒绝，状态置为 `Aborted`。
    pub async fn run<T>(&self, tree: &mut T) -> TranslationResult<JobReport>
    where
        T: ContentTree + Send + ?Sized,
    {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.is_running() {
                return Err(TranslationError::ConcurrencyError(
                    "已有翻译任务正在运行".to_string(),
                ));
            }
            *state = JobState::Building;
        }
        let guard = RunGuard {
            orchestrator: self,
            abort: self.cancel.child(),
        };

        self.stats.reset(0);
        self.pool.clear();
        self.pool.set_concurrency(self.config.concurrency_limit);
        self.pool.set_delay(self.config.request_delay());

        let nodes = tree.nodes();
        let mut builder = SegmentBuilder::with_enabled(self.config.segmentation_enabled);
        let segments = builder.build(&nodes);
        let segment_stats = builder.stats();
        self.stats.set_total(segments.len());

        tracing::info!(
            "开始翻译任务: {} 个节点, {} 个段, 模型 {}, {} -> {}",
            nodes.len(),
            segments.len(),
            self.config.model_id,
            self.config.source_language,
            self.config.target_language
        );

        let ctx = JobContext {
            apply: Mutex::new(ApplyState {
                tree,
                engine: ReassemblyEngine::new(),
            }),
            errors: Mutex::new(ErrorStats::default()),
            abort: guard.abort.clone(),
            abort_reason: Arc::new(Mutex::new(None)),
        };

        self.set_state(JobState::Dispatching);
        let units = self.dispatch(&ctx, segments);

        self.set_state(JobState::Draining);
        join_all(units).await;

        let abort_reason = ctx
            .abort_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .or_else(|| {
                self.cancel
                    .is_cancelled()
                    .then(|| "任务被调用方取消".to_string())
            });

        let final_state = if abort_reason.is_some() {
            ctx.apply().engine.discard_pending();
            JobState::Aborted
        } else {
            JobState::Completed
        };
        self.set_state(final_state);

        let pool = self.pool.stats();
        let report = JobReport {
            state: final_state,
            stats: self.stats.snapshot(&pool),
            pool,
            segments: segment_stats,
            cache: self.cache.as_ref().map(|cache| cache.stats()),
            errors: ctx.errors.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            abort_reason,
            failure_warn_threshold: self.config.failure_warn_threshold,
        };

        if report.is_aborted() || report.exceeds_failure_threshold() {
            tracing::warn!("翻译任务结束: {}", report.summary());
        } else {
            tracing::info!("翻译任务结束: {}", report.summary());
        }

        Ok(report)
    }

    /// 提交所有段，返回等待它们结束的 future
    ///
    /// 段按构建顺序提交；拆分组在第 0 部分的位置起步，后续部分依次提交。
    fn dispatch<'a, T>(&'a self, ctx: &'a JobContext<'_, T>, segments: Vec<Segment>) -> Vec<BoxFuture<'a, ()>>
    where
        T: ContentTree + Send + ?Sized,
    {
        let mut heads = Vec::new();
        let mut rest: HashMap<usize, Vec<Segment>> = HashMap::new();
        for segment in segments {
            match segment.split {
                Some(info) if info.part_index > 0 => rest.entry(info.group_id).or_default().push(segment),
                _ => heads.push(segment),
            }
        }

        let mut units: Vec<BoxFuture<'a, ()>> = Vec::new();
        for segment in heads {
            let started = self.start(ctx, &segment);
            match segment.split {
                Some(info) => {
                    let mut parts = rest.remove(&info.group_id).unwrap_or_default();
                    parts.sort_by_key(|s| s.split.map(|info| info.part_index).unwrap_or_default());
                    units.push(self.run_chain(ctx, segment, started, parts).boxed());
                }
                None => {
                    if let Started::Pending(pending) = started {
                        units.push(
                            async move {
                                let result = pending.await;
                                self.settle(ctx, &segment, result);
                            }
                            .boxed(),
                        );
                    }
                }
            }
        }

        for (group_id, parts) in rest {
            tracing::warn!("拆分组 {} 缺少第 0 部分，丢弃 {} 个部分", group_id, parts.len());
            self.stats.add_cancelled(parts.len());
        }

        units
    }

    /// 查缓存或提交单个段
    fn start<T>(&self, ctx: &JobContext<'_, T>, segment: &Segment) -> Started
    where
        T: ContentTree + Send + ?Sized,
    {
        if ctx.abort.is_cancelled() {
            self.stats.add_cancelled(1);
            self.emit_progress();
            return Started::Cancelled;
        }

        if let Some(translation) = self.cached(segment) {
            self.apply_success(ctx, segment, &translation, true);
            return Started::Settled;
        }

        let task = self.make_task(
            segment.text.clone(),
            ctx.abort.clone(),
            Arc::clone(&ctx.abort_reason),
        );
        Started::Pending(self.pool.submit(task).boxed())
    }

    /// 按部分顺序处理一个拆分组，`head` 已经起步
    async fn run_chain<T>(&self, ctx: &JobContext<'_, T>, head: Segment, started: Started, rest: Vec<Segment>)
    where
        T: ContentTree + Send + ?Sized,
    {
        match started {
            Started::Pending(pending) => {
                let result = pending.await;
                self.settle(ctx, &head, result);
            }
            Started::Cancelled => {
                self.stats.add_cancelled(rest.len());
                self.emit_progress();
                return;
            }
            Started::Settled => {}
        }

        for (index, segment) in rest.iter().enumerate() {
            match self.start(ctx, segment) {
                Started::Pending(pending) => {
                    let result = pending.await;
                    self.settle(ctx, segment, result);
                }
                Started::Cancelled => {
                    self.stats.add_cancelled(rest.len() - index - 1);
                    self.emit_progress();
                    return;
                }
                Started::Settled => {}
            }
        }
    }

    fn cached(&self, segment: &Segment) -> Option<String> {
        self.cache
            .as_ref()
            .and_then(|cache| cache.get(&segment.text, &self.config))
    }

    /// 构造请求池任务：检查取消、解析后端、在重试和超时保护下调用翻译
    fn make_task(
        &self,
        text: String,
        abort: CancelFlag,
        abort_reason: Arc<Mutex<Option<String>>>,
    ) -> impl FnOnce() -> BoxFuture<'static, TranslationResult<String>> + Send + 'static {
        let config = Arc::clone(&self.config);
        let registry = self.registry.clone();
        let retry = self.retry.clone();
        let pool = self.pool.clone();

        move || {
            async move {
                if abort.is_cancelled() {
                    return Err(TranslationError::Cancelled("任务已取消".to_string()));
                }

                let translator = registry.resolve(&config.model_id)?;
                let timeout = config.timeout_for(&config.model_id);

                let result = retry
                    .execute(&abort, |attempt| {
                        let translator = Arc::clone(&translator);
                        let config = Arc::clone(&config);
                        let text = text.clone();
                        async move {
                            tracing::debug!(
                                "调用翻译后端 {} (第 {} 次, {} 字符)",
                                translator.name(),
                                attempt,
                                text.chars().count()
                            );
                            match tokio::time::timeout(timeout, translator.translate(&text, &config)).await {
                                Ok(result) => result,
                                Err(_) => Err(TranslationError::TimeoutError(format!(
                                    "翻译调用超过 {}ms",
                                    timeout.as_millis()
                                ))),
                            }
                        }
                    })
                    .await;

                match result {
                    Ok(translation) => Ok(translation),
                    Err(failure) => {
                        if failure.is_fatal() {
                            abort.cancel();
                            abort_reason
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .get_or_insert_with(|| failure.error.to_string());
                            let rejected = pool.cancel_pending();
                            tracing::error!(
                                "运行上下文失效，中止任务并拒绝 {} 个排队请求: {}",
                                rejected,
                                failure.error
                            );
                        }
                        Err(failure.error)
                    }
                }
            }
            .boxed()
        }
    }

    /// 处理单个段的结果
    fn settle<T>(&self, ctx: &JobContext<'_, T>, segment: &Segment, result: TranslationResult<String>)
    where
        T: ContentTree + Send + ?Sized,
    {
        match result {
            Ok(translation) => {
                self.apply_success(ctx, segment, &translation, false);
                return;
            }
            Err(error) if error.is_cancelled() => {
                tracing::debug!("段 (起始节点 {:?}) 已取消", segment.first_node());
                self.stats.add_cancelled(1);
            }
            Err(error) => {
                let class = RetryPolicy::classify(&error);
                tracing::warn!(
                    "段 (起始节点 {:?}, {}) 翻译失败 [{}]: {}",
                    segment.first_node(),
                    segment.kind.as_str(),
                    class,
                    error
                );
                ctx.errors
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_error(&error, class);
                self.stats.inc_failed();
            }
        }

        // 拆分段失败时用原文占位，后续部分仍可按序写入
        if segment.kind == SegmentKind::Split {
            let mut apply = ctx.apply();
            let ApplyState { tree, engine } = &mut *apply;
            if let Err(e) = engine.apply_fallback(&mut **tree, segment) {
                tracing::warn!("拆分段占位写入失败: {}", e);
            }
        }
        self.emit_progress();
    }

    fn apply_success<T>(&self, ctx: &JobContext<'_, T>, segment: &Segment, translation: &str, from_cache: bool)
    where
        T: ContentTree + Send + ?Sized,
    {
        let applied = {
            let mut apply = ctx.apply();
            let ApplyState { tree, engine } = &mut *apply;
            engine.apply(&mut **tree, segment, translation)
        };

        match applied {
            Ok(()) => {
                if from_cache {
                    tracing::debug!("段 (起始节点 {:?}) 命中缓存", segment.first_node());
                    self.stats.inc_cached();
                } else {
                    if let Some(cache) = &self.cache {
                        cache.put(&segment.text, &self.config, translation);
                    }
                    self.stats.inc_succeeded();
                }
            }
            Err(error) => {
                tracing::warn!("写回译文失败: {}", error);
                let class = RetryPolicy::classify(&error);
                ctx.errors
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record_error(&error, class);
                self.stats.inc_failed();
            }
        }
        self.emit_progress();
    }

    fn emit_progress(&self) {
        let Some(sink) = &self.progress else {
            return;
        };

        let pool = self.pool.stats();
        let stats = self.stats.snapshot(&pool);
        sink.on_progress(&ProgressEvent {
            processed: stats.processed,
            total: stats.total,
            succeeded: stats.succeeded,
            failed: stats.failed,
            rate: stats.rate,
            queued: pool.queued,
            pool,
        });
    }
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("model_id", &self.config.model_id)
            .field("state", &self.state())
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .finish()
    }
}
