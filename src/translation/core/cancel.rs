//! 协作式取消标志

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 调用方与任务共享的取消标志
///
/// 只在每次调用翻译后端之前检查，正在进行的调用不会被打断。
/// 通过 [`CancelFlag::child`] 派生的标志能观察到父标志的取消，
/// 但自身的取消不会传回父标志。
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancelFlag>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// 派生一个子标志
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|parent| parent.is_cancelled())
    }
}
