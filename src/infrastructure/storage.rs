//! 存储接口
//!
//! 核心只通过这个 trait 读写章节、条目和模板，不关心具体的持久化方式。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::models::{
    Chapter, ChapterId, GeneratedItem, ItemId, ItemStatus, NewChapter, PromptKind, PromptTemplate,
};
use crate::services::prompt_templates::TemplateSnapshot;
use crate::workflow::stage_log::StageLog;

/// 章节审核进度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterProgress {
    pub total: usize,
    pub verified: usize,
}

impl ChapterProgress {
    /// 已审核比例（0..=100）
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            (self.verified * 100 / self.total) as u8
        }
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_chapter(&self, id: ChapterId) -> Result<Chapter, StorageError>;

    /// 书中全部章节，按树的先序遍历排列（同级按 order_index）
    async fn list_chapters(&self, book_id: u64) -> Result<Vec<Chapter>, StorageError>;

    /// 保存条目，返回分配的 ID
    async fn save_items(&self, items: Vec<GeneratedItem>) -> Result<Vec<ItemId>, StorageError>;

    async fn list_items(&self, chapter_id: ChapterId) -> Result<Vec<GeneratedItem>, StorageError>;

    /// 推进条目状态（不允许回退）
    async fn update_item_status(&self, id: ItemId, status: ItemStatus) -> Result<GeneratedItem, StorageError>;

    /// 当前默认模板
    async fn get_template(&self, kind: PromptKind) -> Result<PromptTemplate, StorageError>;

    /// 全部用途的默认模板快照
    async fn template_snapshot(&self) -> Result<TemplateSnapshot, StorageError>;

    /// 用有序的同级章节替换一个章节，原章节及其条目被删除
    async fn replace_chapter(&self, id: ChapterId, parts: Vec<NewChapter>) -> Result<Vec<Chapter>, StorageError>;

    /// 保存智能体审计日志（可选）
    async fn save_stage_logs(&self, _logs: Vec<StageLog>) -> Result<(), StorageError> {
        Ok(())
    }

    async fn chapter_progress(&self, chapter_id: ChapterId) -> Result<ChapterProgress, StorageError>;
}
