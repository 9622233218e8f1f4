//! 分段构建器
//!
//! 把按遍历顺序排列的内容节点整理成翻译单元（段）：
//!
//! 1. **分组**：同一容器内相互关联的长节点合成一个 `grouped` 段
//! 2. **合并**：连续的短段批量合成一个 `merged` 段，减少请求次数
//! 3. **拆分**：过长的段按句子切成若干 `split` 段，保证单次请求不超限
//!
//! 每个非空节点恰好属于一个逻辑段，逻辑段按首个节点的遍历顺序输出。
//! 长度一律按字符（Unicode 标量）计算。

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::translation::config::constants;
use crate::translation::content::{ContentNode, NodeId};

/// 段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Single,
    Grouped,
    Merged,
    Split,
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentKind::Single => "single",
            SegmentKind::Grouped => "grouped",
            SegmentKind::Merged => "merged",
            SegmentKind::Split => "split",
        }
    }
}

/// 段中的节点及其源文本
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentMember {
    pub id: NodeId,
    pub text: String,
}

/// 拆分信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SplitInfo {
    /// 同一逻辑段的所有部分共享的编号
    pub group_id: usize,
    pub part_index: usize,
    pub part_count: usize,
    /// 拆分前的段类型
    pub origin: SegmentKind,
}

/// 翻译单元
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub members: Vec<SegmentMember>,
    /// 发送给翻译后端的文本
    pub text: String,
    /// 合并段的组成部分
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub original_groups: Vec<Segment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split: Option<SplitInfo>,
}

impl Segment {
    fn single(node: &ContentNode) -> Self {
        let text = node.text.trim().to_string();
        Self {
            kind: SegmentKind::Single,
            members: vec![SegmentMember {
                id: node.id,
                text: text.clone(),
            }],
            text,
            original_groups: Vec::new(),
            split: None,
        }
    }

    fn grouped(nodes: &[&ContentNode]) -> Self {
        let members: Vec<SegmentMember> = nodes
            .iter()
            .map(|node| SegmentMember {
                id: node.id,
                text: node.text.trim().to_string(),
            })
            .collect();
        let text = join_texts(members.iter().map(|m| m.text.as_str()));

        Self {
            kind: SegmentKind::Grouped,
            members,
            text,
            original_groups: Vec::new(),
            split: None,
        }
    }

    fn merged(groups: Vec<Segment>) -> Self {
        let members = groups.iter().flat_map(|g| g.members.clone()).collect();
        let text = join_texts(groups.iter().map(|g| g.text.as_str()));

        Self {
            kind: SegmentKind::Merged,
            members,
            text,
            original_groups: groups,
            split: None,
        }
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.id).collect()
    }

    /// 第一个节点，用于日志
    pub fn first_node(&self) -> Option<NodeId> {
        self.members.first().map(|m| m.id)
    }

    /// 按空白切成小写词集合
    fn word_set(text: &str) -> HashSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect()
    }
}

fn join_texts<'a>(texts: impl Iterator<Item = &'a str>) -> String {
    texts.collect::<Vec<_>>().join(constants::SEGMENT_JOINER)
}

/// 分段参数
#[derive(Debug, Clone)]
pub struct SegmentBuilderConfig {
    pub enabled: bool,
    pub min_chars: usize,
    pub max_chars: usize,
    pub max_merged_chars: usize,
    pub chunk_chars: usize,
    pub chunk_fallback_min_chars: usize,
    pub container_roles: Vec<String>,
}

impl Default for SegmentBuilderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_chars: constants::MIN_SEGMENT_CHARS,
            max_chars: constants::MAX_SEGMENT_CHARS,
            max_merged_chars: constants::MAX_MERGED_CHARS,
            chunk_chars: constants::CHUNK_CHARS,
            chunk_fallback_min_chars: constants::CHUNK_FALLBACK_MIN_CHARS,
            container_roles: constants::CONTAINER_ROLES.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// 分段统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SegmentStats {
    pub input_nodes: usize,
    pub skipped_empty: usize,
    /// 逻辑段数量（拆分段按一个计）
    pub logical_segments: usize,
    /// 输出段数量（拆分段按部分计）
    pub output_segments: usize,
    pub grouped: usize,
    pub merged: usize,
    pub split_groups: usize,
    pub split_parts: usize,
}

/// 分段构建器
#[derive(Debug)]
pub struct SegmentBuilder {
    config: SegmentBuilderConfig,
    stats: SegmentStats,
    next_group_id: usize,
}

impl SegmentBuilder {
    pub fn new(config: SegmentBuilderConfig) -> Self {
        Self {
            config,
            stats: SegmentStats::default(),
            next_group_id: 0,
        }
    }

    /// 分段开关取自翻译配置，其余使用默认阈值
    pub fn with_enabled(enabled: bool) -> Self {
        Self::new(SegmentBuilderConfig {
            enabled,
            ..SegmentBuilderConfig::default()
        })
    }

    pub fn stats(&self) -> SegmentStats {
        self.stats
    }

    /// 构建段列表
    pub fn build(&mut self, nodes: &[ContentNode]) -> Vec<Segment> {
        self.stats = SegmentStats {
            input_nodes: nodes.len(),
            ..SegmentStats::default()
        };

        let usable: Vec<&ContentNode> = nodes.iter().filter(|n| !n.text.trim().is_empty()).collect();
        self.stats.skipped_empty = nodes.len() - usable.len();

        let segments = if self.config.enabled {
            let grouped = self.group(&usable);
            let merged = self.merge(grouped);
            self.split(merged)
        } else {
            usable.iter().map(|node| Segment::single(node)).collect()
        };

        self.stats.logical_segments = segments
            .iter()
            .filter(|s| s.split.map_or(true, |info| info.part_index == 0))
            .count();
        self.stats.output_segments = segments.len();

        tracing::debug!(
            "分段完成: {} 个节点 -> {} 个段 (分组 {}, 合并 {}, 拆分 {})",
            self.stats.input_nodes,
            self.stats.output_segments,
            self.stats.grouped,
            self.stats.merged,
            self.stats.split_groups
        );

        segments
    }

    /// 节点所在容器：最近的容器角色祖先，否则为父节点
    fn container_of(&self, node: &ContentNode) -> Option<NodeId> {
        node.ancestors
            .iter()
            .find(|a| self.config.container_roles.iter().any(|r| r.eq_ignore_ascii_case(&a.role)))
            .map(|a| a.id)
            .or_else(|| node.parent())
    }

    fn is_related(seed: &ContentNode, candidate: &ContentNode) -> bool {
        let depth_diff = seed.depth.abs_diff(candidate.depth);
        if depth_diff <= constants::GROUP_MAX_DEPTH_DIFF {
            return true;
        }

        if text_similarity(&seed.text, &candidate.text) > constants::GROUP_MIN_SIMILARITY {
            return true;
        }

        seed.bounds.center_distance(&candidate.bounds) < constants::GROUP_MAX_CENTER_DISTANCE
            && depth_diff <= constants::GROUP_NEAR_DEPTH_DIFF
    }

    fn group(&mut self, nodes: &[&ContentNode]) -> Vec<Segment> {
        let joiner_len = constants::SEGMENT_JOINER.chars().count();
        let mut visited = vec![false; nodes.len()];
        let mut segments = Vec::new();

        for i in 0..nodes.len() {
            if visited[i] {
                continue;
            }
            visited[i] = true;

            let seed = nodes[i];
            let mut members = vec![seed];

            // 短节点交给合并阶段处理
            if seed.char_len() >= self.config.min_chars {
                let container = self.container_of(seed);
                let mut total = seed.char_len();

                for j in (i + 1)..nodes.len() {
                    let candidate = nodes[j];
                    if visited[j]
                        || candidate.char_len() < self.config.min_chars
                        || self.container_of(candidate) != container
                        || !Self::is_related(seed, candidate)
                    {
                        continue;
                    }

                    let combined = total + joiner_len + candidate.char_len();
                    if combined > self.config.max_chars {
                        break;
                    }

                    visited[j] = true;
                    members.push(candidate);
                    total = combined;
                }
            }

            if members.len() > 1 {
                self.stats.grouped += 1;
                segments.push(Segment::grouped(&members));
            } else {
                segments.push(Segment::single(seed));
            }
        }

        segments
    }

    fn merge(&mut self, segments: Vec<Segment>) -> Vec<Segment> {
        let mut output = Vec::with_capacity(segments.len());
        let mut batch: Vec<Segment> = Vec::new();
        let mut batch_len = 0;

        for segment in segments {
            let len = segment.char_len();
            if len < self.config.min_chars {
                if !batch.is_empty() && batch_len + len > self.config.max_merged_chars {
                    self.flush_batch(&mut batch, &mut output);
                    batch_len = 0;
                }
                batch_len += len;
                batch.push(segment);
            } else {
                self.flush_batch(&mut batch, &mut output);
                batch_len = 0;
                output.push(segment);
            }
        }
        self.flush_batch(&mut batch, &mut output);

        output
    }

    fn flush_batch(&mut self, batch: &mut Vec<Segment>, output: &mut Vec<Segment>) {
        match batch.len() {
            0 => {}
            1 => output.append(batch),
            _ => {
                self.stats.merged += 1;
                output.push(Segment::merged(std::mem::take(batch)));
            }
        }
    }

    fn split(&mut self, segments: Vec<Segment>) -> Vec<Segment> {
        let mut output = Vec::with_capacity(segments.len());

        for segment in segments {
            if segment.char_len() <= self.config.max_chars {
                output.push(segment);
                continue;
            }

            let runs = self.split_text(&segment.text);
            if runs.len() < 2 {
                output.push(segment);
                continue;
            }

            let group_id = self.next_group_id;
            self.next_group_id += 1;
            self.stats.split_groups += 1;
            self.stats.split_parts += runs.len();

            tracing::debug!(
                "段 (起始节点 {:?}) 长度 {} 超限，拆分为 {} 部分",
                segment.first_node(),
                segment.char_len(),
                runs.len()
            );

            let part_count = runs.len();
            for (part_index, text) in runs.into_iter().enumerate() {
                output.push(Segment {
                    kind: SegmentKind::Split,
                    members: segment.members.clone(),
                    text,
                    original_groups: Vec::new(),
                    split: Some(SplitInfo {
                        group_id,
                        part_index,
                        part_count,
                        origin: segment.kind,
                    }),
                });
            }
        }

        output
    }

    /// 把长文本切成不超过上限的若干部分
    pub fn split_text(&self, text: &str) -> Vec<String> {
        let sentences = self.split_sentences(text);
        let total_len = text.chars().count();

        let pieces: Vec<String> = if sentences.len() < 2 && total_len > self.config.chunk_fallback_min_chars {
            chunk_chars(text, self.config.chunk_chars)
        } else {
            sentences
                .into_iter()
                .flat_map(|sentence| {
                    if sentence.chars().count() > self.config.max_chars {
                        chunk_chars(sentence, self.config.chunk_chars)
                    } else {
                        vec![sentence.to_string()]
                    }
                })
                .collect()
        };

        let mut runs = Vec::new();
        let mut current = String::new();
        let mut current_len = 0;

        for piece in pieces {
            let piece_len = piece.chars().count();
            if current_len > 0 && current_len + piece_len > self.config.max_chars {
                runs.push(std::mem::take(&mut current));
                current_len = 0;
            }
            current.push_str(&piece);
            current_len += piece_len;
        }
        if current_len > 0 {
            runs.push(current);
        }

        runs.into_iter()
            .map(|run| run.trim().to_string())
            .filter(|run| !run.is_empty())
            .collect()
    }

    /// 按句末标点切句，句子保留其后的空白，拼接后与原文一致
    fn split_sentences<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut sentences = Vec::new();
        let mut start = 0;

        for m in sentence_end().find_iter(text) {
            sentences.push(&text[start..m.end()]);
            start = m.end();
        }
        if start < text.len() {
            sentences.push(&text[start..]);
        }

        sentences
    }
}

impl Default for SegmentBuilder {
    fn default() -> Self {
        Self::new(SegmentBuilderConfig::default())
    }
}

/// 句末标点及其后的空白
fn sentence_end() -> &'static Regex {
    static SENTENCE_END: OnceLock<Regex> = OnceLock::new();
    SENTENCE_END.get_or_init(|| {
        Regex::new(r"[.!?。！？]+\s*").unwrap_or_else(|_| Regex::new(r"$^").unwrap())
    })
}

/// 词集合相似度：共同词数 / 较大词集的大小
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let words_a = Segment::word_set(a);
    let words_b = Segment::word_set(b);
    let longest = words_a.len().max(words_b.len());
    if longest == 0 {
        return 0.0;
    }

    words_a.intersection(&words_b).count() as f64 / longest as f64
}

/// 按固定字符数切块
fn chunk_chars(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}
