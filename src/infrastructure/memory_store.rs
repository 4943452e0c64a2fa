//! 内存存储
//!
//! `Storage` 的进程内实现，单个互斥锁保证单写者。
//! 可整体保存为 JSON 快照，供命令行工具输出结果。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::fs;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::infrastructure::storage::{ChapterProgress, Storage};
use crate::models::{
    Chapter, ChapterId, GeneratedItem, ItemId, ItemStatus, NewChapter, PromptKind, PromptTemplate,
};
use crate::services::prompt_templates::{TemplateSnapshot, TemplateStore};
use crate::services::token_estimator::TokenEstimator;
use crate::workflow::stage_log::StageLog;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    chapters: BTreeMap<ChapterId, Chapter>,
    items: BTreeMap<ItemId, GeneratedItem>,
    #[serde(default)]
    stage_logs: Vec<StageLog>,
    next_chapter_id: u64,
    next_item_id: u64,
}

impl StoreState {
    fn chapter(&self, id: ChapterId) -> Result<&Chapter, StorageError> {
        self.chapters.get(&id).ok_or(StorageError::ChapterNotFound(id))
    }

    fn allocate_chapter_id(&mut self) -> ChapterId {
        self.next_chapter_id = self
            .next_chapter_id
            .max(self.chapters.keys().map(|id| id.0).max().unwrap_or(0));
        self.next_chapter_id += 1;
        ChapterId(self.next_chapter_id)
    }

    fn siblings(&self, book_id: u64, parent_id: Option<ChapterId>) -> impl Iterator<Item = &Chapter> {
        self.chapters
            .values()
            .filter(move |c| c.book_id == book_id && c.parent_id == parent_id)
    }

    /// `ancestor` 是否在 `id` 的祖先链上（含自身）
    fn is_ancestor(&self, ancestor: ChapterId, id: ChapterId) -> bool {
        let mut current = Some(id);
        let mut steps = 0;
        while let Some(cid) = current {
            if cid == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.chapters.len() {
                return true;
            }
            current = self.chapters.get(&cid).and_then(|c| c.parent_id);
        }
        false
    }

    fn validate_placement(&self, chapter: &Chapter) -> Result<(), StorageError> {
        if let Some(parent_id) = chapter.parent_id {
            let parent = self.chapter(parent_id)?;
            if parent.book_id != chapter.book_id {
                return Err(StorageError::InvalidTree(format!(
                    "父章节 {} 不属于书籍 {}",
                    parent_id, chapter.book_id
                )));
            }
            if self.is_ancestor(chapter.id, parent_id) {
                return Err(StorageError::InvalidTree(format!(
                    "章节 {} 不能挂到自己的子孙 {} 下",
                    chapter.id, parent_id
                )));
            }
        }
        let clash = self
            .siblings(chapter.book_id, chapter.parent_id)
            .any(|c| c.id != chapter.id && c.order_index == chapter.order_index);
        if clash {
            return Err(StorageError::InvalidTree(format!(
                "同级章节中 order_index {} 重复",
                chapter.order_index
            )));
        }
        Ok(())
    }

    fn collect_depth_first(&self, book_id: u64, parent_id: Option<ChapterId>, out: &mut Vec<Chapter>) {
        let mut level: Vec<&Chapter> = self.siblings(book_id, parent_id).collect();
        level.sort_by_key(|c| c.order_index);
        for chapter in level {
            out.push(chapter.clone());
            self.collect_depth_first(book_id, Some(chapter.id), out);
        }
    }
}

/// 内存存储
pub struct MemoryStore {
    state: Mutex<StoreState>,
    templates: Mutex<TemplateStore>,
    estimator: TokenEstimator,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    /// 带内置模板的空存储
    pub fn new() -> Self {
        Self::with_templates(TemplateStore::with_builtin())
    }

    pub fn with_templates(templates: TemplateStore) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            templates: Mutex::new(templates),
            estimator: TokenEstimator::default(),
        }
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// 插入一个章节（校验父节点、同级顺序、无环）
    pub fn insert_chapter(&self, chapter: Chapter) -> Result<(), StorageError> {
        let mut state = lock(&self.state);
        if state.chapters.contains_key(&chapter.id) {
            return Err(StorageError::InvalidTree(format!("章节 {} 已存在", chapter.id)));
        }
        state.validate_placement(&chapter)?;
        state.chapters.insert(chapter.id, chapter);
        Ok(())
    }

    /// 把一本书的章节按顺序作为顶层章节插入，返回分配的 ID
    pub fn insert_book(&self, book_id: u64, chapters: Vec<NewChapter>) -> Vec<ChapterId> {
        let mut state = lock(&self.state);
        let start = state
            .siblings(book_id, None)
            .map(|c| c.order_index + 1)
            .max()
            .unwrap_or(0);
        let mut ids = Vec::with_capacity(chapters.len());
        for (offset, new) in chapters.into_iter().enumerate() {
            let id = state.allocate_chapter_id();
            state.chapters.insert(
                id,
                Chapter {
                    id,
                    book_id,
                    title: new.title,
                    order_index: start + offset as u32,
                    level: new.level,
                    content_md: new.content_md,
                    token_count: new.token_count,
                    parent_id: None,
                },
            );
            ids.push(id);
        }
        debug!("书籍 {} 插入 {} 个章节", book_id, ids.len());
        ids
    }

    /// 调整章节的父节点
    pub fn move_chapter(&self, id: ChapterId, new_parent: Option<ChapterId>, order_index: u32) -> Result<(), StorageError> {
        let mut state = lock(&self.state);
        let mut moved = state.chapter(id)?.clone();
        moved.parent_id = new_parent;
        moved.order_index = order_index;
        state.validate_placement(&moved)?;
        state.chapters.insert(id, moved);
        Ok(())
    }

    /// 替换章节正文（重新计算 token 数）
    pub fn update_chapter_content(&self, id: ChapterId, content_md: &str) -> Result<(), StorageError> {
        let mut state = lock(&self.state);
        let chapter = state
            .chapters
            .get_mut(&id)
            .ok_or(StorageError::ChapterNotFound(id))?;
        chapter.set_content(content_md, &self.estimator);
        Ok(())
    }

    /// 编辑模板（追加新版本）
    pub fn update_template(&self, kind: PromptKind, name: &str, body: &str) -> PromptTemplate {
        lock(&self.templates).update(kind, name, body)
    }

    pub fn set_default_template(&self, kind: PromptKind, version: u32) -> Result<(), StorageError> {
        lock(&self.templates).set_default(kind, version)
    }

    /// 用户撤销审核
    pub fn revert_item(&self, id: ItemId) -> Result<GeneratedItem, StorageError> {
        let mut state = lock(&self.state);
        let item = state.items.get_mut(&id).ok_or(StorageError::ItemNotFound(id))?;
        item.revert_verification();
        Ok(item.clone())
    }

    pub fn all_items(&self) -> Vec<GeneratedItem> {
        lock(&self.state).items.values().cloned().collect()
    }

    pub fn stage_logs(&self) -> Vec<StageLog> {
        lock(&self.state).stage_logs.clone()
    }

    /// 保存 JSON 快照
    pub async fn save_snapshot(&self, path: &Path) -> Result<(), StorageError> {
        let json = {
            let state = lock(&self.state);
            serde_json::to_string_pretty(&*state)?
        };
        fs::write(path, json)
            .await
            .map_err(|e| StorageError::io(path.display().to_string(), e))?;
        info!("💾 快照已保存至: {}", path.display());
        Ok(())
    }

    /// 从 JSON 快照恢复（使用内置模板）
    pub async fn load_snapshot(path: &Path) -> Result<Self, StorageError> {
        let json = fs::read_to_string(path)
            .await
            .map_err(|e| StorageError::io(path.display().to_string(), e))?;
        let state: StoreState = serde_json::from_str(&json)?;
        let store = Self::new();
        *lock(&store.state) = state;
        Ok(store)
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get_chapter(&self, id: ChapterId) -> Result<Chapter, StorageError> {
        lock(&self.state).chapter(id).cloned()
    }

    async fn list_chapters(&self, book_id: u64) -> Result<Vec<Chapter>, StorageError> {
        let state = lock(&self.state);
        let mut out = Vec::new();
        state.collect_depth_first(book_id, None, &mut out);
        Ok(out)
    }

    async fn save_items(&self, items: Vec<GeneratedItem>) -> Result<Vec<ItemId>, StorageError> {
        let mut state = lock(&self.state);
        for item in &items {
            state.chapter(item.chapter_id)?;
        }
        let mut ids = Vec::with_capacity(items.len());
        for mut item in items {
            state.next_item_id += 1;
            let id = ItemId(state.next_item_id);
            item.id = Some(id);
            state.items.insert(id, item);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn list_items(&self, chapter_id: ChapterId) -> Result<Vec<GeneratedItem>, StorageError> {
        let state = lock(&self.state);
        state.chapter(chapter_id)?;
        Ok(state
            .items
            .values()
            .filter(|item| item.chapter_id == chapter_id)
            .cloned()
            .collect())
    }

    async fn update_item_status(&self, id: ItemId, status: ItemStatus) -> Result<GeneratedItem, StorageError> {
        let mut state = lock(&self.state);
        let item = state.items.get_mut(&id).ok_or(StorageError::ItemNotFound(id))?;
        item.advance_to(status)?;
        Ok(item.clone())
    }

    async fn get_template(&self, kind: PromptKind) -> Result<PromptTemplate, StorageError> {
        lock(&self.templates)
            .default_for(kind)
            .cloned()
            .ok_or(StorageError::TemplateNotFound(kind))
    }

    async fn template_snapshot(&self) -> Result<TemplateSnapshot, StorageError> {
        Ok(lock(&self.templates).snapshot())
    }

    async fn replace_chapter(&self, id: ChapterId, parts: Vec<NewChapter>) -> Result<Vec<Chapter>, StorageError> {
        let mut state = lock(&self.state);
        let original = state.chapter(id)?.clone();
        if parts.is_empty() {
            return Err(StorageError::InvalidTree(format!("章节 {} 的拆分结果为空", id)));
        }
        let shift = parts.len() as u32 - 1;

        // 后面的同级章节整体后移
        let later: Vec<ChapterId> = state
            .siblings(original.book_id, original.parent_id)
            .filter(|c| c.order_index > original.order_index)
            .map(|c| c.id)
            .collect();
        for sibling in later {
            if let Some(c) = state.chapters.get_mut(&sibling) {
                c.order_index += shift;
            }
        }

        state.chapters.remove(&id);
        let removed_items = state.items.len();
        state.items.retain(|_, item| item.chapter_id != id);
        let removed_items = removed_items - state.items.len();

        let mut created = Vec::with_capacity(parts.len());
        for (offset, part) in parts.into_iter().enumerate() {
            let new_id = state.allocate_chapter_id();
            let chapter = Chapter {
                id: new_id,
                book_id: original.book_id,
                title: part.title,
                order_index: original.order_index + offset as u32,
                level: part.level,
                content_md: part.content_md,
                token_count: part.token_count,
                parent_id: original.parent_id,
            };
            state.chapters.insert(new_id, chapter.clone());
            created.push(chapter);
        }

        // 原章节的子章节挂到第一部分下
        let first = created[0].id;
        for child in state.chapters.values_mut().filter(|c| c.parent_id == Some(id)) {
            child.parent_id = Some(first);
        }

        info!(
            "✂️ 章节 {} 已替换为 {} 个同级章节，删除 {} 个旧条目",
            id,
            created.len(),
            removed_items
        );
        Ok(created)
    }

    async fn save_stage_logs(&self, logs: Vec<StageLog>) -> Result<(), StorageError> {
        lock(&self.state).stage_logs.extend(logs);
        Ok(())
    }

    async fn chapter_progress(&self, chapter_id: ChapterId) -> Result<ChapterProgress, StorageError> {
        let state = lock(&self.state);
        state.chapter(chapter_id)?;
        let mut progress = ChapterProgress::default();
        for item in state.items.values().filter(|i| i.chapter_id == chapter_id) {
            progress.total += 1;
            if item.status == ItemStatus::Verified {
                progress.verified += 1;
            }
        }
        Ok(progress)
    }
}
