// 集成测试公共模块
//
// 提供测试数据生成、配置构建和断言辅助

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use pagetrans::translation::content::{Ancestor, BoundingBox, ContentNode, NodeId};
use pagetrans::translation::pipeline::Segment;
use pagetrans::translation::TranslationConfig;

/// 测试配置构建器
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: TranslationConfig,
}

impl TestConfigBuilder {
    /// 无请求间隔、重试退避 1ms 的配置
    pub fn new() -> Self {
        Self {
            config: TranslationConfig {
                request_delay_ms: 0,
                retry_base_delay_ms: 1,
                ..TranslationConfig::default()
            },
        }
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.config.concurrency_limit = limit;
        self
    }

    pub fn delay_ms(mut self, delay: u64) -> Self {
        self.config.request_delay_ms = delay;
        self
    }

    pub fn without_segmentation(mut self) -> Self {
        self.config.segmentation_enabled = false;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.config.cache_enabled = false;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn build(self) -> TranslationConfig {
        self.config
    }
}

/// 测试数据生成器
pub struct TestDataGenerator;

impl TestDataGenerator {
    /// 同一容器下的段落节点
    pub fn paragraph(id: u64, text: &str) -> ContentNode {
        ContentNode::new(id, text)
            .with_depth(3)
            .with_bounds(BoundingBox::new(0.0, id as f64 * 24.0, 600.0, 20.0))
            .with_ancestors(vec![Ancestor::new(1000 + id, "p"), Ancestor::new(1, "article")])
    }

    /// 若干个互不相同的短段落
    pub fn short_paragraphs(count: usize) -> Vec<ContentNode> {
        (0..count as u64)
            .map(|i| Self::paragraph(i + 1, &format!("Short paragraph number {:02}.", i)))
            .collect()
    }

    /// 由 `sentences` 个 `sentence_len` 字符的句子组成的长段落
    pub fn long_paragraph(sentences: usize, sentence_len: usize) -> String {
        (0..sentences)
            .map(|i| {
                let body: String = std::iter::repeat(char::from(b'a' + (i % 26) as u8))
                    .take(sentence_len - 1)
                    .collect();
                format!("{}.", body)
            })
            .collect()
    }

    /// 用线性同余序列生成的伪随机节点集合，包含空白节点、短节点和超长节点
    pub fn pseudo_random_nodes(seed: u64, count: usize) -> Vec<ContentNode> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let mut next = move |bound: u64| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) % bound
        };

        (0..count as u64)
            .map(|id| {
                let text = match next(10) {
                    0 => "   ".to_string(),
                    1..=4 => format!("Item {} with a few words.", id),
                    5..=7 => format!(
                        "Paragraph {} talks about topic {} in a moderately long sentence. It has a second sentence too.",
                        id,
                        next(5)
                    ),
                    8 => Self::long_paragraph(8 + next(20) as usize, 60 + next(80) as usize),
                    _ => "z".repeat(600 + next(1500) as usize),
                };
                let container = 1 + next(3);
                ContentNode::new(id + 1, text)
                    .with_depth(next(6) as usize)
                    .with_bounds(BoundingBox::new(0.0, next(2000) as f64, 400.0, 20.0))
                    .with_ancestors(vec![
                        Ancestor::new(500 + id, "p"),
                        Ancestor::new(container, "section"),
                    ])
            })
            .collect()
    }
}

/// 性能测量辅助
pub struct PerformanceHelper;

impl PerformanceHelper {
    /// 从第一次轮询开始计时
    pub async fn measure_async_time<Fut, T>(fut: Fut) -> (T, Duration)
    where
        Fut: Future<Output = T>,
    {
        let start = Instant::now();
        let result = fut.await;
        (result, start.elapsed())
    }
}

/// 断言辅助
pub struct AssertionHelper;

impl AssertionHelper {
    /// 每个非空节点恰好属于一个逻辑段，拆分出的各部分算同一个
    pub fn assert_coverage(nodes: &[ContentNode], segments: &[Segment]) {
        let mut owned: HashMap<NodeId, usize> = HashMap::new();
        for segment in segments {
            if segment.split.map_or(false, |info| info.part_index > 0) {
                continue;
            }
            for id in segment.node_ids() {
                *owned.entry(id).or_default() += 1;
            }
        }

        for node in nodes {
            let count = owned.get(&node.id).copied().unwrap_or(0);
            if node.text.trim().is_empty() {
                assert_eq!(count, 0, "blank node {} must not be segmented", node.id);
            } else {
                assert_eq!(count, 1, "node {} owned {} times", node.id, count);
            }
        }

        let known: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
        assert!(
            owned.keys().all(|id| known.contains(id)),
            "segments reference unknown nodes"
        );
    }

    pub fn assert_duration_at_least(actual: Duration, expected: Duration, context: &str) {
        assert!(
            actual >= expected,
            "{}: expected at least {:?}, got {:?}",
            context,
            expected,
            actual
        );
    }
}
