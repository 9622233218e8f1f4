//! 请求池
//!
//! 有界并发的任务执行器：无界 FIFO 队列加活跃计数。任务出队后先等待请求间隔，
//! 再在独立的 tokio 任务中执行；结束后让出一次调度，再继续从队列取任务。

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::sleep;

use crate::translation::config::{constants, TranslationConfig};
use crate::translation::error::{TranslationError, TranslationResult};

/// 任务执行结果，用于统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// 任务结束后交付结果；统计更新完成后才调用，提交方醒来时统计已是最新
struct Settled {
    outcome: TaskOutcome,
    deliver: Box<dyn FnOnce() + Send>,
}

type TaskRun = Box<dyn FnOnce() -> BoxFuture<'static, Settled> + Send>;
type TaskReject = Box<dyn FnOnce(TranslationError) + Send>;

/// 排队中的任务
struct PoolTask {
    run: TaskRun,
    reject: TaskReject,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    succeeded: u64,
    failed: u64,
    cancelled: u64,
    rejected: u64,
    peak_active: usize,
    first_started: Option<Instant>,
}

struct PoolState {
    queue: VecDeque<PoolTask>,
    active: usize,
    concurrency: usize,
    delay: Duration,
    counters: Counters,
}

/// 请求池统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// 执行时发现任务已取消
    pub cancelled: u64,
    /// 排队中被拒绝、从未执行
    pub rejected: u64,
    pub peak_active: usize,
    /// 自第一个任务开始执行以来的毫秒数
    pub elapsed_ms: u64,
    /// 每秒完成的任务数
    pub throughput: f64,
}

/// 请求池
#[derive(Clone)]
pub struct RequestPool {
    state: Arc<Mutex<PoolState>>,
}

impl RequestPool {
    pub fn new(concurrency: usize, delay: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                queue: VecDeque::new(),
                active: 0,
                concurrency: clamp_concurrency(concurrency),
                delay,
                counters: Counters::default(),
            })),
        }
    }

    pub fn from_config(config: &TranslationConfig) -> Self {
        Self::new(config.concurrency_limit, config.request_delay())
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 提交任务
    ///
    /// 任务在调用时同步入队并尝试立即启动，返回的 future 等待任务结果。
    /// 必须在 tokio 运行时中调用。
    pub fn submit<T, F, Fut>(&self, task: F) -> impl Future<Output = TranslationResult<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TranslationResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<TranslationResult<T>>();
        let sender = Arc::new(Mutex::new(Some(tx)));
        let reject_sender = Arc::clone(&sender);

        let run: TaskRun = Box::new(move || {
            async move {
                let result = task().await;
                let outcome = match &result {
                    Ok(_) => TaskOutcome::Succeeded,
                    Err(e) if e.is_cancelled() => TaskOutcome::Cancelled,
                    Err(_) => TaskOutcome::Failed,
                };
                let deliver: Box<dyn FnOnce() + Send> = Box::new(move || {
                    if let Some(tx) = take_sender(&sender) {
                        let _ = tx.send(result);
                    }
                });
                Settled { outcome, deliver }
            }
            .boxed()
        });

        let reject: TaskReject = Box::new(move |error| {
            if let Some(tx) = take_sender(&reject_sender) {
                let _ = tx.send(Err(error));
            }
        });

        self.lock().queue.push_back(PoolTask {
            run,
            reject,
            enqueued_at: Instant::now(),
        });
        self.pump();

        async move {
            rx.await.unwrap_or_else(|_| {
                Err(TranslationError::InternalError("请求任务异常终止".to_string()))
            })
        }
    }

    /// 在并发上限内启动排队任务
    fn pump(&self) {
        let mut state = self.lock();

        while state.active < state.concurrency {
            let Some(task) = state.queue.pop_front() else {
                break;
            };

            state.active += 1;
            state.counters.peak_active = state.counters.peak_active.max(state.active);
            state.counters.first_started.get_or_insert_with(Instant::now);

            let delay = state.delay;
            let pool = self.clone();
            tokio::spawn(async move {
                pool.run_task(task, delay).await;
            });
        }
    }

    async fn run_task(self, task: PoolTask, delay: Duration) {
        let PoolTask {
            run,
            reject,
            enqueued_at,
        } = task;

        if !delay.is_zero() {
            sleep(delay).await;
        }

        tracing::trace!("请求任务开始执行，排队 {}ms", enqueued_at.elapsed().as_millis());

        // 在独立任务中执行，panic 只影响这一个任务
        let settled = tokio::spawn(run()).await;
        let outcome = settled
            .as_ref()
            .map(|s| s.outcome)
            .unwrap_or(TaskOutcome::Failed);

        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            let counters = &mut state.counters;
            counters.completed += 1;
            match outcome {
                TaskOutcome::Succeeded => counters.succeeded += 1,
                TaskOutcome::Failed => counters.failed += 1,
                TaskOutcome::Cancelled => counters.cancelled += 1,
            }
        }

        match settled {
            Ok(settled) => (settled.deliver)(),
            Err(e) => {
                tracing::error!("请求任务异常终止: {}", e);
                reject(TranslationError::InternalError(format!("请求任务异常终止: {}", e)));
            }
        }

        tokio::task::yield_now().await;
        self.pump();
    }

    /// 调整并发上限（1..=10），调高后立即启动更多任务
    pub fn set_concurrency(&self, concurrency: usize) {
        let concurrency = clamp_concurrency(concurrency);
        self.lock().concurrency = concurrency;
        tracing::debug!("请求池并发上限调整为 {}", concurrency);
        self.pump();
    }

    /// 调整请求间隔
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    pub fn concurrency(&self) -> usize {
        self.lock().concurrency
    }

    /// 拒绝所有排队任务，保留统计
    pub fn cancel_pending(&self) -> usize {
        let drained: Vec<PoolTask> = {
            let mut state = self.lock();
            let drained: Vec<PoolTask> = state.queue.drain(..).collect();
            state.counters.rejected += drained.len() as u64;
            drained
        };

        let count = drained.len();
        for task in drained {
            (task.reject)(TranslationError::Cancelled("请求队列已清空".to_string()));
        }

        if count > 0 {
            tracing::info!("已拒绝 {} 个排队中的请求", count);
        }
        count
    }

    /// 拒绝所有排队任务并重置统计，不影响正在执行的任务
    pub fn clear(&self) {
        self.cancel_pending();
        self.lock().counters = Counters::default();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let counters = &state.counters;
        let elapsed = counters
            .first_started
            .map(|start| start.elapsed())
            .unwrap_or_default();
        let throughput = if elapsed.as_secs_f64() > 0.0 {
            counters.completed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        PoolStats {
            active: state.active,
            queued: state.queue.len(),
            completed: counters.completed,
            succeeded: counters.succeeded,
            failed: counters.failed,
            cancelled: counters.cancelled,
            rejected: counters.rejected,
            peak_active: counters.peak_active,
            elapsed_ms: elapsed.as_millis() as u64,
            throughput,
        }
    }
}

impl std::fmt::Debug for RequestPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("RequestPool")
            .field("active", &state.active)
            .field("queued", &state.queue.len())
            .field("concurrency", &state.concurrency)
            .field("delay", &state.delay)
            .finish()
    }
}

fn clamp_concurrency(concurrency: usize) -> usize {
    concurrency.clamp(1, constants::MAX_CONCURRENCY_LIMIT)
}

fn take_sender<T>(slot: &Mutex<Option<oneshot::Sender<T>>>) -> Option<oneshot::Sender<T>> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_submit_returns_result() {
        let pool = RequestPool::new(2, Duration::ZERO);
        let ok = pool.submit(|| async { Ok::<_, TranslationError>(42) });
        let err = pool.submit(|| async { Err::<u32, _>(TranslationError::ApiError("x".into())) });

        assert_eq!(ok.await.unwrap(), 42);
        assert!(err.await.is_err());

        let stats = pool.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeded() {
        let pool = RequestPool::new(3, Duration::ZERO);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = (0..12)
            .map(|_| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                pool.submit(move || async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, TranslationError>(())
                })
            })
            .collect();

        for result in futures::future::join_all(futures).await {
            assert!(result.is_ok());
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.stats().peak_active <= 3);
    }

    #[tokio::test]
    async fn test_fifo_dispatch_with_single_worker() {
        let pool = RequestPool::new(1, Duration::ZERO);
        let order = Arc::new(Mutex::new(Vec::new()));

        let futures: Vec<_> = (0..5)
            .map(|i| {
                let order = Arc::clone(&order);
                pool.submit(move || async move {
                    order.lock().unwrap().push(i);
                    Ok::<_, TranslationError>(())
                })
            })
            .collect();
        futures::future::join_all(futures).await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_panic_counts_as_failure() {
        let pool = RequestPool::new(1, Duration::ZERO);
        let result = pool
            .submit(|| async {
                if true {
                    panic!("boom");
                }
                Ok::<u32, TranslationError>(1)
            })
            .await;

        assert!(matches!(result, Err(TranslationError::InternalError(_))));
        let after = pool.submit(|| async { Ok::<_, TranslationError>(2) }).await;
        assert_eq!(after.unwrap(), 2);
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_clear_rejects_queued_tasks() {
        let pool = RequestPool::new(1, Duration::from_millis(20));
        let first = pool.submit(|| async { Ok::<_, TranslationError>(1) });
        let queued: Vec<_> = (0..3)
            .map(|i| pool.submit(move || async move { Ok::<_, TranslationError>(i) }))
            .collect();

        assert_eq!(pool.cancel_pending(), 3);
        for result in futures::future::join_all(queued).await {
            assert!(result.unwrap_err().is_cancelled());
        }
        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(pool.stats().rejected, 3);

        pool.clear();
        let stats = pool.stats();
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_raising_concurrency_drains_queue() {
        let pool = RequestPool::new(1, Duration::ZERO);
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let blocked: Vec<_> = (0..3)
            .map(|_| {
                let gate = Arc::clone(&gate);
                pool.submit(move || async move {
                    let _permit = gate
                        .acquire()
                        .await
                        .map_err(|e| TranslationError::ConcurrencyError(e.to_string()))?;
                    Ok::<_, TranslationError>(())
                })
            })
            .collect();
        assert_eq!(pool.stats().active, 1);
        assert_eq!(pool.stats().queued, 2);

        pool.set_concurrency(3);
        assert_eq!(pool.stats().active, 3);
        assert_eq!(pool.stats().queued, 0);

        pool.set_concurrency(50);
        assert_eq!(pool.concurrency(), 10);

        gate.add_permits(3);
        for result in futures::future::join_all(blocked).await {
            assert!(result.is_ok());
        }
        assert_eq!(pool.stats().succeeded, 3);
    }
}
