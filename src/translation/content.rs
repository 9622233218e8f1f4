//! 内容树数据模型
//!
//! 管道只通过 [`ContentTree`] 读取节点、回写译文，不关心宿主文档的具体形式。

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::translation::error::{TranslationError, TranslationResult};

/// 节点标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 节点在页面中的可视区域
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// 两个区域中心点的距离
    pub fn center_distance(&self, other: &BoundingBox) -> f64 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }
}

/// 祖先节点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ancestor {
    pub id: NodeId,
    pub role: String,
}

impl Ancestor {
    pub fn new(id: u64, role: impl Into<String>) -> Self {
        Self {
            id: NodeId(id),
            role: role.into(),
        }
    }
}

/// 可翻译的内容节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentNode {
    pub id: NodeId,
    pub text: String,
    #[serde(default)]
    pub depth: usize,
    #[serde(default)]
    pub bounds: BoundingBox,
    /// 祖先链，最近的在前
    #[serde(default)]
    pub ancestors: Vec<Ancestor>,
}

impl ContentNode {
    pub fn new(id: u64, text: impl Into<String>) -> Self {
        Self {
            id: NodeId(id),
            text: text.into(),
            depth: 0,
            bounds: BoundingBox::default(),
            ancestors: Vec::new(),
        }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_bounds(mut self, bounds: BoundingBox) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_ancestors(mut self, ancestors: Vec<Ancestor>) -> Self {
        self.ancestors = ancestors;
        self
    }

    /// 直接父节点
    pub fn parent(&self) -> Option<NodeId> {
        self.ancestors.first().map(|a| a.id)
    }

    /// 字符数（按 Unicode 标量计）
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// 内容树抽象
///
/// `nodes` 按文档遍历顺序返回节点；写回接口由重组引擎调用。
pub trait ContentTree {
    fn nodes(&self) -> Vec<ContentNode>;

    /// 用译文替换节点内容
    fn set_translated_text(&mut self, id: NodeId, text: &str) -> TranslationResult<()>;

    /// 在节点已有译文之后追加
    fn append_translated_text(&mut self, id: NodeId, text: &str) -> TranslationResult<()>;
}

/// 内存中的内容树
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryTree {
    pub nodes: Vec<ContentNode>,
    #[serde(default)]
    pub translations: BTreeMap<NodeId, String>,
    #[serde(skip)]
    index: HashMap<NodeId, usize>,
}

impl MemoryTree {
    pub fn new(nodes: Vec<ContentNode>) -> Self {
        let mut tree = Self {
            nodes,
            translations: BTreeMap::new(),
            index: HashMap::new(),
        };
        tree.reindex();
        tree
    }

    /// 从 JSON 读取
    pub fn from_json(json: &str) -> TranslationResult<Self> {
        let mut tree: MemoryTree = serde_json::from_str(json)?;
        tree.reindex();
        Ok(tree)
    }

    fn reindex(&mut self) {
        self.index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id, i))
            .collect();
    }

    fn ensure_known(&mut self, id: NodeId) -> TranslationResult<()> {
        if self.index.len() != self.nodes.len() {
            self.reindex();
        }
        if self.index.contains_key(&id) {
            Ok(())
        } else {
            Err(TranslationError::InvalidInput(format!("未知节点 {}", id)))
        }
    }

    pub fn translation(&self, id: NodeId) -> Option<&str> {
        self.translations.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl ContentTree for MemoryTree {
    fn nodes(&self) -> Vec<ContentNode> {
        self.nodes.clone()
    }

    fn set_translated_text(&mut self, id: NodeId, text: &str) -> TranslationResult<()> {
        self.ensure_known(id)?;
        self.translations.insert(id, text.to_string());
        Ok(())
    }

    fn append_translated_text(&mut self, id: NodeId, text: &str) -> TranslationResult<()> {
        self.ensure_known(id)?;
        self.translations.entry(id).or_default().push_str(text);
        Ok(())
    }
}
