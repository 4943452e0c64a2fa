//! 章节处理上下文
//!
//! 封装"我正在处理哪次任务的第几个章节"这一信息

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{ChapterId, ContentKind};

/// 任务 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }

    /// 日志用的短 ID
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 取消标记
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// 已取消时返回 `AppError::Cancelled`
    pub fn check(&self) -> AppResult<()> {
        if self.is_cancelled() {
            Err(AppError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// 章节处理上下文
///
/// 包含处理单个章节所需的所有上下文信息
#[derive(Debug, Clone)]
pub struct ChapterCtx {
    pub run_id: RunId,
    pub chapter_id: ChapterId,
    pub title: String,
    /// 章节在本次任务中的序号（从 0 开始，用于进度与日志）
    pub position: usize,
    pub total: usize,
    /// 逻辑模型名
    pub model: String,
    pub kind: ContentKind,
    pub exercise_type: Option<String>,
    pub language: String,
    pub cancel: CancelFlag,
}

impl Display for ChapterCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[任务 {} 章节 {}/{} #{}]",
            self.run_id.short(),
            self.position + 1,
            self.total,
            self.chapter_id
        )
    }
}
