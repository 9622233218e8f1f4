//! 翻译任务集成测试
//!
//! 通过模拟后端驱动完整任务：并发上限、请求间隔、重试、中止、取消和缓存

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pagetrans::translation::backend::{BackendRegistry, MockOutcome, MockTranslator, PseudoTranslator};
use pagetrans::translation::content::{ContentNode, MemoryTree, NodeId};
use pagetrans::translation::core::{JobOrchestrator, JobState, ProgressEvent, RequestPool};
use pagetrans::translation::error::{ErrorClass, TranslationError};

#[allow(dead_code)]
mod common {
    include!("common/mod.rs");
}

use common::{AssertionHelper, PerformanceHelper, TestConfigBuilder, TestDataGenerator};

fn distinct_nodes(count: u64) -> Vec<ContentNode> {
    (1..=count)
        .map(|i| ContentNode::new(i, format!("Independent node number {}", i)))
        .collect()
}

/// 20 个段、并发 5、间隔 100ms：总耗时不少于 4 轮间隔
#[tokio::test]
async fn test_request_delay_bounds_total_time() {
    let mock = Arc::new(MockTranslator::new());
    let config = TestConfigBuilder::new()
        .concurrency(5)
        .delay_ms(100)
        .without_segmentation()
        .build();
    let orchestrator = JobOrchestrator::from_config(config, BackendRegistry::single(mock.clone()));
    let mut tree = MemoryTree::new(distinct_nodes(20));

    let (report, elapsed) =
        PerformanceHelper::measure_async_time(orchestrator.run(&mut tree)).await;
    let report = report.unwrap();

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.stats.succeeded, 20);
    assert_eq!(mock.call_count(), 20);
    assert!(mock.max_in_flight() <= 5);
    assert!(report.pool.peak_active <= 5);
    AssertionHelper::assert_duration_at_least(
        elapsed,
        Duration::from_millis(400 - 20),
        "20 segments at concurrency 5 with 100ms delay",
    );
}

/// 第 3 个段上下文失效：任务中止，剩余排队请求被拒绝而不是执行
#[tokio::test]
async fn test_context_invalid_aborts_job() {
    let mock = Arc::new(MockTranslator::new().with_script(vec![
        MockOutcome::Echo,
        MockOutcome::Echo,
        MockOutcome::Fail(TranslationError::ContextInvalidated(
            "Extension context invalidated".into(),
        )),
    ]));
    let config = TestConfigBuilder::new()
        .concurrency(1)
        .without_segmentation()
        .build();
    let orchestrator = JobOrchestrator::from_config(config, BackendRegistry::single(mock.clone()));
    let mut tree = MemoryTree::new(distinct_nodes(10));

    let report = orchestrator.run(&mut tree).await.unwrap();

    assert_eq!(report.state, JobState::Aborted);
    assert!(report.is_aborted());
    assert_eq!(mock.call_count(), 3);
    assert_eq!(report.stats.succeeded, 2);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.cancelled, 7);
    assert_eq!(report.pool.rejected, 7);
    assert_eq!(report.pool.failed, 1);
    assert_eq!(report.errors.count(ErrorClass::ContextInvalid), 1);
    assert!(report.abort_reason.is_some());
    assert!(report.summary().starts_with("aborted"));
    assert!(!orchestrator.cancel_flag().is_cancelled());

    assert!(tree.translation(NodeId(1)).is_some());
    assert!(tree.translation(NodeId(2)).is_some());
    assert!((3..=10).all(|i| tree.translation(NodeId(i)).is_none()));
}

/// 上一个任务因上下文失效中止后，下一个任务照常执行
#[tokio::test]
async fn test_abort_does_not_leak_into_next_job() {
    let mock = Arc::new(MockTranslator::new().with_script(vec![MockOutcome::Fail(
        TranslationError::ContextInvalidated("Extension context invalidated".into()),
    )]));
    let config = TestConfigBuilder::new()
        .concurrency(1)
        .without_segmentation()
        .build();
    let orchestrator = JobOrchestrator::from_config(config, BackendRegistry::single(mock.clone()));

    let mut first = MemoryTree::new(distinct_nodes(3));
    let aborted = orchestrator.run(&mut first).await.unwrap();
    assert_eq!(aborted.state, JobState::Aborted);
    assert_eq!(mock.call_count(), 1);

    let mut second = MemoryTree::new(
        (1..=3)
            .map(|i| ContentNode::new(i, format!("Follow-up node number {}", i)))
            .collect(),
    );
    let report = orchestrator.run(&mut second).await.unwrap();

    assert_eq!(report.state, JobState::Completed);
    assert!(report.abort_reason.is_none());
    assert_eq!(report.stats.succeeded, 3);
    assert_eq!(report.stats.cancelled, 0);
    assert_eq!(mock.call_count(), 1 + 3);
    assert_eq!(second.translation(NodeId(2)), Some("Follow-up node number 2"));
}

/// 任意突发规模下在途任务数不超过并发上限
#[tokio::test]
async fn test_pool_never_exceeds_limit() {
    for burst in [1usize, 7, 40] {
        let pool = RequestPool::new(3, Duration::ZERO);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let pending: Vec<_> = (0..burst)
            .map(|i| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                pool.submit(move || async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, TranslationError>(i)
                })
            })
            .collect();

        let results = futures::future::join_all(pending).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 3, "burst {} exceeded limit", burst);
        let stats = pool.stats();
        assert!(stats.peak_active <= 3);
        assert_eq!(stats.succeeded, burst as u64);
        assert_eq!(stats.active, 0);
    }
}

/// network 类失败最多调用 max_retries + 1 次，context-invalid 只调用一次
#[tokio::test]
async fn test_retry_ceiling_per_class() {
    let network = Arc::new(MockTranslator::new().fail_when_contains(
        "node",
        TranslationError::NetworkError("connection refused".into()),
    ));
    let config = TestConfigBuilder::new().max_retries(3).build();
    let orchestrator =
        JobOrchestrator::from_config(config.clone(), BackendRegistry::single(network.clone()));
    let mut tree = MemoryTree::new(vec![ContentNode::new(1, "flaky node")]);

    let report = orchestrator.run(&mut tree).await.unwrap();
    assert_eq!(network.call_count(), 4);
    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.errors.count(ErrorClass::Network), 1);

    let fatal = Arc::new(MockTranslator::new().fail_when_contains(
        "node",
        TranslationError::ContextInvalidated("host gone".into()),
    ));
    let orchestrator = JobOrchestrator::from_config(config, BackendRegistry::single(fatal.clone()));
    let mut tree = MemoryTree::new(vec![ContentNode::new(1, "doomed node")]);

    let report = orchestrator.run(&mut tree).await.unwrap();
    assert_eq!(fatal.call_count(), 1);
    assert_eq!(report.state, JobState::Aborted);
}

/// 同一文本在缓存命中时不会再次调用后端
#[tokio::test]
async fn test_cached_segments_skip_backend() {
    let mock = Arc::new(MockTranslator::new().with_prefix("T:"));
    let config = TestConfigBuilder::new().without_segmentation().build();
    let orchestrator = JobOrchestrator::from_config(config, BackendRegistry::single(mock.clone()));

    let mut first = MemoryTree::new(distinct_nodes(5));
    orchestrator.run(&mut first).await.unwrap();
    assert_eq!(mock.call_count(), 5);

    let mut second = MemoryTree::new(distinct_nodes(5));
    let report = orchestrator.run(&mut second).await.unwrap();

    assert_eq!(mock.call_count(), 5);
    assert_eq!(report.stats.cached, 5);
    assert_eq!(first.translations, second.translations);
    let cache = report.cache.expect("cache enabled");
    assert_eq!(cache.hits, 5);
}

#[tokio::test]
async fn test_cache_disabled_always_calls_backend() {
    let mock = Arc::new(MockTranslator::new());
    let config = TestConfigBuilder::new().without_segmentation().without_cache().build();
    let orchestrator = JobOrchestrator::from_config(config, BackendRegistry::single(mock.clone()));

    for _ in 0..2 {
        let mut tree = MemoryTree::new(distinct_nodes(3));
        let report = orchestrator.run(&mut tree).await.unwrap();
        assert!(report.cache.is_none());
    }
    assert_eq!(mock.call_count(), 6);
}

/// 拆分段在并发池中仍按部分顺序写回
#[tokio::test]
async fn test_split_paragraph_reassembled_in_order() {
    let text = TestDataGenerator::long_paragraph(20, 120);
    let mut nodes = TestDataGenerator::short_paragraphs(3);
    nodes.push(TestDataGenerator::paragraph(50, &text));

    let config = TestConfigBuilder::new().concurrency(5).build();
    let orchestrator =
        JobOrchestrator::from_config(config, BackendRegistry::single(Arc::new(PseudoTranslator)));
    let mut tree = MemoryTree::new(nodes);

    let report = orchestrator.run(&mut tree).await.unwrap();

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.segments.split_parts, 3);
    let translated = tree.translation(NodeId(50)).expect("split node written");
    assert!(translated.starts_with("[zh] "));
    assert_eq!(translated.matches("[zh] ").count(), 3);
    let restored: String = translated
        .replace("[zh] ", "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    assert_eq!(restored, text);
    for id in 1..=3 {
        assert!(tree.translation(NodeId(id)).is_some_and(|t| t.starts_with("[zh] Short")));
    }
}

/// 拆分组在它第 0 部分所在的位置起步，不排在其余段之后
#[tokio::test]
async fn test_split_group_dispatched_at_its_position() {
    let text = TestDataGenerator::long_paragraph(20, 120);
    let follower = "A separate paragraph that stays on its own because it is long enough.";
    let nodes = vec![
        TestDataGenerator::paragraph(1, &text),
        TestDataGenerator::paragraph(2, follower),
    ];

    let mock = Arc::new(MockTranslator::new());
    let config = TestConfigBuilder::new().concurrency(1).build();
    let orchestrator = JobOrchestrator::from_config(config, BackendRegistry::single(mock.clone()));
    let mut tree = MemoryTree::new(nodes);

    let report = orchestrator.run(&mut tree).await.unwrap();

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.segments.split_parts, 3);
    let texts = mock.texts();
    assert_eq!(texts.len(), 4);
    assert!(texts[0].starts_with("aaa"));
    assert_eq!(texts[1], follower);
    assert_eq!(tree.translation(NodeId(2)), Some(follower));
}

#[tokio::test]
async fn test_progress_reported_for_every_segment() {
    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let config = TestConfigBuilder::new().without_segmentation().build();
    let orchestrator = JobOrchestrator::from_config(
        config,
        BackendRegistry::single(Arc::new(MockTranslator::new())),
    )
    .with_progress(Arc::new(move |event: &ProgressEvent| {
        sink_events.lock().unwrap().push(event.clone());
    }));
    let mut tree = MemoryTree::new(distinct_nodes(6));

    orchestrator.run(&mut tree).await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 6);
    let last = events.last().unwrap();
    assert_eq!(last.processed, 6);
    assert_eq!(last.total, 6);
    assert_eq!(last.succeeded, 6);
    assert!(events.windows(2).all(|w| w[0].processed <= w[1].processed));
}

/// 调用方取消后不再发起新的翻译调用，进行中的调用正常完成
#[tokio::test]
async fn test_caller_cancellation_stops_dispatch() {
    let mock = Arc::new(MockTranslator::new().with_delay(Duration::from_millis(50)));
    let config = TestConfigBuilder::new()
        .concurrency(1)
        .without_segmentation()
        .build();
    let orchestrator = JobOrchestrator::from_config(config, BackendRegistry::single(mock.clone()));
    let flag = orchestrator.cancel_flag();
    let mut tree = MemoryTree::new(distinct_nodes(5));

    let (report, _) = tokio::join!(orchestrator.run(&mut tree), async {
        tokio::time::sleep(Duration::from_millis(70)).await;
        flag.cancel();
    });
    let report = report.unwrap();

    assert_eq!(report.state, JobState::Aborted);
    assert!(mock.call_count() <= 3);
    assert!(report.stats.cancelled >= 2);
    assert_eq!(
        report.stats.succeeded + report.stats.failed + report.stats.cancelled,
        5
    );
    assert_eq!(report.stats.failed, 0);
}

#[tokio::test]
async fn test_registry_routes_by_model() {
    let alpha = Arc::new(MockTranslator::new().with_prefix("alpha:"));
    let fallback = Arc::new(MockTranslator::new().with_prefix("other:"));
    let registry = BackendRegistry::new()
        .register("alpha", alpha.clone())
        .with_fallback(fallback.clone());

    let mut config = TestConfigBuilder::new().build();
    config.model_id = "alpha".to_string();
    let orchestrator = JobOrchestrator::from_config(config, registry);
    let mut tree = MemoryTree::new(vec![ContentNode::new(1, "route me")]);

    orchestrator.run(&mut tree).await.unwrap();

    assert_eq!(tree.translation(NodeId(1)), Some("alpha:route me"));
    assert_eq!(alpha.call_count(), 1);
    assert_eq!(fallback.call_count(), 0);
}

#[tokio::test]
async fn test_missing_backend_fails_segments() {
    let config = TestConfigBuilder::new().without_segmentation().build();
    let orchestrator = JobOrchestrator::from_config(config, BackendRegistry::new());
    let mut tree = MemoryTree::new(distinct_nodes(2));

    let report = orchestrator.run(&mut tree).await.unwrap();

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.stats.failed, 2);
    assert!(report.exceeds_failure_threshold());
}
