//! 章节数据模型
//!
//! 章节树由书籍聚合持有，核心只读取章节正文并在拆分时写回同级章节。

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::services::token_estimator::TokenEstimator;

/// 缓存 token 数时使用的参考模型族
pub const REFERENCE_MODEL: &str = "gpt-4o";

/// 章节 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChapterId(pub u64);

impl fmt::Display for ChapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 章节
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    pub book_id: u64,
    pub title: String,
    /// 同一父节点下的顺序（唯一）
    pub order_index: u32,
    /// 标题层级
    pub level: u8,
    pub content_md: String,
    /// 缓存的 token 数，正文变化时重新计算
    pub token_count: usize,
    pub parent_id: Option<ChapterId>,
}

impl Chapter {
    /// 创建章节并计算 token 数
    pub fn new(
        id: ChapterId,
        book_id: u64,
        title: impl Into<String>,
        order_index: u32,
        content_md: impl Into<String>,
        estimator: &TokenEstimator,
    ) -> Self {
        let content_md = content_md.into();
        let token_count = estimator.estimate(&content_md, REFERENCE_MODEL);
        Self {
            id,
            book_id,
            title: title.into(),
            order_index,
            level: 1,
            content_md,
            token_count,
            parent_id: None,
        }
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    pub fn with_parent(mut self, parent_id: ChapterId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// 替换正文并重新计算 token 数
    pub fn set_content(&mut self, content_md: impl Into<String>, estimator: &TokenEstimator) {
        self.content_md = content_md.into();
        self.token_count = estimator.estimate(&self.content_md, REFERENCE_MODEL);
    }
}

/// 待插入的章节（拆分产生的同级章节，ID 由存储分配）
#[derive(Debug, Clone, PartialEq)]
pub struct NewChapter {
    pub title: String,
    pub content_md: String,
    pub token_count: usize,
    pub level: u8,
}
