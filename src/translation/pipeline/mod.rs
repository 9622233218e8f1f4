//! 分段管道
//!
//! 把内容节点组织成适合一次翻译请求的段

pub mod segment;

pub use segment::{
    text_similarity, Segment, SegmentBuilder, SegmentBuilderConfig, SegmentKind, SegmentMember,
    SegmentStats, SplitInfo,
};
