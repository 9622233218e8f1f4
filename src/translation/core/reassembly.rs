//! 重组引擎
//!
//! 把一次翻译调用的结果写回到段背后的节点上。
//!
//! - `single`：整段写入唯一的节点
//! - `grouped`：按成员原文长度比例切分译文，切点优先落在段落分隔 `"\n\n"` 之后，
//!   其次句末标点，再次空白，最后原始偏移；各部分拼接后与译文完全一致
//! - `merged`：同样的切分作用于各组成段，再递归写入
//! - `split`：按部分序号写入，乱序到达的部分先缓存；第 0 部分替换内容，
//!   之后的部分追加

use std::collections::{BTreeMap, HashMap};

use crate::translation::content::{ContentTree, NodeId};
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::pipeline::{Segment, SegmentKind, SegmentMember, SplitInfo};

const TERMINATORS: &[char] = &['.', '!', '?', '。', '！', '？', '\n'];

/// 一个拆分组的写入状态
#[derive(Debug)]
struct SplitBuffer {
    members: Vec<SegmentMember>,
    part_count: usize,
    origin: SegmentKind,
    /// 尚未写入的部分
    parts: BTreeMap<usize, String>,
    /// 下一个应写入的部分序号
    next: usize,
    /// 多节点来源时累积的完整译文
    joined: String,
    /// 单节点来源时最近一次写入是否以空白结尾
    last_ends_with_space: bool,
}

impl SplitBuffer {
    fn new(segment: &Segment, info: &SplitInfo) -> Self {
        Self {
            members: segment.members.clone(),
            part_count: info.part_count,
            origin: info.origin,
            parts: BTreeMap::new(),
            next: 0,
            joined: String::new(),
            last_ends_with_space: false,
        }
    }

    fn is_multi_node(&self) -> bool {
        self.members.len() > 1
    }

    fn is_done(&self) -> bool {
        self.next >= self.part_count
    }
}

/// 重组引擎，每个任务一个实例
#[derive(Debug, Default)]
pub struct ReassemblyEngine {
    pending: HashMap<usize, SplitBuffer>,
    writes: usize,
}

impl ReassemblyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入一段译文
    pub fn apply<T: ContentTree + ?Sized>(
        &mut self,
        tree: &mut T,
        segment: &Segment,
        translation: &str,
    ) -> TranslationResult<()> {
        match segment.kind {
            SegmentKind::Split => {
                let info = segment.split.ok_or_else(|| {
                    TranslationError::InternalError("拆分段缺少拆分信息".to_string())
                })?;
                self.apply_split(tree, segment, &info, translation)
            }
            _ => self.apply_share(tree, segment, translation),
        }
    }

    /// 拆分段翻译失败时用原文占位，保证后续部分能继续写入
    pub fn apply_fallback<T: ContentTree + ?Sized>(
        &mut self,
        tree: &mut T,
        segment: &Segment,
    ) -> TranslationResult<()> {
        if segment.kind == SegmentKind::Split {
            self.apply(tree, segment, &segment.text)
        } else {
            Ok(())
        }
    }

    /// 仍在等待后续部分的拆分组数量
    pub fn pending_groups(&self) -> usize {
        self.pending.len()
    }

    /// 丢弃未完成的拆分组（任务中止时）
    pub fn discard_pending(&mut self) -> usize {
        let count = self.pending.len();
        if count > 0 {
            tracing::warn!("丢弃 {} 个未完成的拆分组", count);
        }
        self.pending.clear();
        count
    }

    /// 写入次数（set + append）
    pub fn writes(&self) -> usize {
        self.writes
    }

    fn set<T: ContentTree + ?Sized>(&mut self, tree: &mut T, id: NodeId, text: &str) -> TranslationResult<()> {
        self.writes += 1;
        tree.set_translated_text(id, text)
    }

    fn append<T: ContentTree + ?Sized>(&mut self, tree: &mut T, id: NodeId, text: &str) -> TranslationResult<()> {
        self.writes += 1;
        tree.append_translated_text(id, text)
    }

    /// 非拆分段的写入（single / grouped / merged）
    fn apply_share<T: ContentTree + ?Sized>(
        &mut self,
        tree: &mut T,
        segment: &Segment,
        translation: &str,
    ) -> TranslationResult<()> {
        match segment.kind {
            SegmentKind::Merged if !segment.original_groups.is_empty() => {
                let weights: Vec<usize> = segment.original_groups.iter().map(Segment::char_len).collect();
                let shares = partition(translation, &weights);
                for (group, share) in segment.original_groups.iter().zip(shares) {
                    self.apply_share(tree, group, &share)?;
                }
                Ok(())
            }
            _ => self.write_members(tree, &segment.members, translation),
        }
    }

    fn write_members<T: ContentTree + ?Sized>(
        &mut self,
        tree: &mut T,
        members: &[SegmentMember],
        translation: &str,
    ) -> TranslationResult<()> {
        match members {
            [] => Ok(()),
            [only] => self.set(tree, only.id, translation),
            _ => {
                let weights: Vec<usize> = members.iter().map(|m| m.text.chars().count()).collect();
                let shares = partition(translation, &weights);
                for (member, share) in members.iter().zip(shares) {
                    self.set(tree, member.id, &share)?;
                }
                Ok(())
            }
        }
    }

    fn apply_split<T: ContentTree + ?Sized>(
        &mut self,
        tree: &mut T,
        segment: &Segment,
        info: &SplitInfo,
        translation: &str,
    ) -> TranslationResult<()> {
        let mut buffer = self
            .pending
            .remove(&info.group_id)
            .unwrap_or_else(|| SplitBuffer::new(segment, info));

        if info.part_index < buffer.next || buffer.parts.contains_key(&info.part_index) {
            tracing::warn!(
                "拆分组 {} 的第 {} 部分重复到达，已忽略",
                info.group_id,
                info.part_index
            );
            self.pending.insert(info.group_id, buffer);
            return Ok(());
        }
        buffer.parts.insert(info.part_index, translation.to_string());

        // 按序写出所有已就绪的部分
        while let Some(part) = buffer.parts.remove(&buffer.next) {
            if buffer.is_multi_node() {
                push_with_separator(&mut buffer.joined, &part);
            } else if let Some(member) = buffer.members.first() {
                let id = member.id;
                if buffer.next == 0 {
                    self.set(tree, id, &part)?;
                } else {
                    let needs_space = !buffer.last_ends_with_space
                        && !part.starts_with(char::is_whitespace)
                        && !part.is_empty();
                    if needs_space {
                        self.append(tree, id, " ")?;
                    }
                    self.append(tree, id, &part)?;
                }
                if !part.is_empty() {
                    buffer.last_ends_with_space = part.ends_with(char::is_whitespace);
                }
            }
            buffer.next += 1;
        }

        if buffer.is_done() {
            if buffer.is_multi_node() {
                tracing::debug!(
                    "拆分组 {} ({}) 全部到达，分配到 {} 个节点",
                    info.group_id,
                    buffer.origin.as_str(),
                    buffer.members.len()
                );
                let members = std::mem::take(&mut buffer.members);
                let joined = std::mem::take(&mut buffer.joined);
                self.write_members(tree, &members, &joined)?;
            }
        } else {
            self.pending.insert(info.group_id, buffer);
        }

        Ok(())
    }
}

fn push_with_separator(target: &mut String, part: &str) {
    let needs_space = !target.is_empty()
        && !target.ends_with(char::is_whitespace)
        && !part.starts_with(char::is_whitespace)
        && !part.is_empty();
    if needs_space {
        target.push(' ');
    }
    target.push_str(part);
}

/// 按权重比例切分文本
///
/// 各部分首尾相接，拼接后与输入完全一致；最后一部分取余下全部。
pub fn partition(translation: &str, weights: &[usize]) -> Vec<String> {
    match weights.len() {
        0 => return Vec::new(),
        1 => return vec![translation.to_string()],
        _ => {}
    }

    let chars: Vec<char> = translation.chars().collect();
    let byte_offsets: Vec<usize> = translation
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(translation.len()))
        .collect();
    let len = chars.len();

    let total_weight: usize = weights.iter().sum();
    let weights: Vec<usize> = if total_weight == 0 {
        vec![1; weights.len()]
    } else {
        weights.to_vec()
    };
    let total_weight: usize = weights.iter().sum();
    let window = (len / 10).min(50);

    let mut parts = Vec::with_capacity(weights.len());
    let mut previous = 0;
    let mut cumulative = 0;

    for weight in &weights[..weights.len() - 1] {
        cumulative += weight;
        let target = ((len as f64) * (cumulative as f64) / (total_weight as f64)).round() as usize;
        let target = target.clamp(previous, len);
        let cut = find_cut(&chars, target, window, previous);

        parts.push(translation[byte_offsets[previous]..byte_offsets[cut]].to_string());
        previous = cut;
    }
    parts.push(translation[byte_offsets[previous]..].to_string());

    parts
}

/// 在目标偏移附近寻找切点，切点 `p` 表示切在第 `p` 个字符之前
fn find_cut(chars: &[char], target: usize, window: usize, floor: usize) -> usize {
    let low = target.saturating_sub(window).max(floor);
    let high = (target + window).min(chars.len());

    let nearest = |accept: &dyn Fn(usize) -> bool| -> Option<usize> {
        (low.max(1)..=high)
            .filter(|&p| accept(p))
            .min_by_key(|&p| p.abs_diff(target))
    };

    nearest(&|p| p >= 2 && chars[p - 2] == '\n' && chars[p - 1] == '\n')
        .or_else(|| nearest(&|p| TERMINATORS.contains(&chars[p - 1])))
        .or_else(|| nearest(&|p| chars[p - 1].is_whitespace()))
        .unwrap_or(target)
}
