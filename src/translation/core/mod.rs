//! 翻译调度核心
//!
//! - `cancel`: 任务级取消标志
//! - `retry`: 失败分类与重试退避
//! - `pool`: 有界并发、请求间隔的请求池
//! - `reassembly`: 把段译文写回内容树
//! - `orchestrator`: 驱动一次完整的翻译任务
//!
//! ```text
//! JobOrchestrator
//!     ├── SegmentBuilder (pipeline/segment.rs)
//!     ├── TranslationCache (storage/cache.rs)
//!     ├── RequestPool ── RetryPolicy ── Translator (backend)
//!     └── ReassemblyEngine
//! ```

pub mod cancel;
pub mod orchestrator;
pub mod pool;
pub mod reassembly;
pub mod retry;

pub use cancel::CancelFlag;
pub use orchestrator::{
    JobOrchestrator, JobReport, JobState, JobStats, JobStatsSnapshot, ProgressEvent, ProgressSink,
};
pub use pool::{PoolStats, RequestPool};
pub use reassembly::{partition, ReassemblyEngine};
pub use retry::{RetryError, RetryPolicy};
