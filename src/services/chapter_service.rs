//! 章节服务 - 业务能力层
//!
//! 把超出模型安全阈值的已保存章节替换为若干个有序的同级章节，
//! 标题为 "原标题 (Part n)"。原章节及其条目随之删除。

use std::sync::Arc;
use tracing::info;

use crate::error::{AppResult, BudgetExceededError, ValidationError};
use crate::infrastructure::Storage;
use crate::models::chapter::REFERENCE_MODEL;
use crate::models::{Chapter, ChapterId, NewChapter};
use crate::services::chunk_splitter::ChunkSplitter;

/// 章节的预算检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetCheck {
    pub tokens: usize,
    pub budget: usize,
}

impl BudgetCheck {
    pub fn exceeded(&self) -> bool {
        self.tokens > self.budget
    }
}

/// 章节服务
pub struct ChapterService {
    storage: Arc<dyn Storage>,
    splitter: ChunkSplitter,
}

impl ChapterService {
    pub fn new(storage: Arc<dyn Storage>, splitter: ChunkSplitter) -> Self {
        Self { storage, splitter }
    }

    pub fn splitter(&self) -> &ChunkSplitter {
        &self.splitter
    }

    /// 按目标模型估算章节并与安全阈值比较
    pub fn check_budget(&self, chapter: &Chapter, model: &str, safety_ratio: f64) -> BudgetCheck {
        BudgetCheck {
            tokens: self.splitter.estimate(&chapter.content_md, model),
            budget: self.splitter.budget_for(model, safety_ratio),
        }
    }

    /// 超出阈值时返回 `BudgetExceededError`
    pub fn ensure_within_budget(&self, chapter: &Chapter, model: &str, safety_ratio: f64) -> Result<(), BudgetExceededError> {
        let check = self.check_budget(chapter, model, safety_ratio);
        if check.exceeded() {
            return Err(BudgetExceededError {
                chapter_id: chapter.id,
                model: model.to_string(),
                tokens: check.tokens,
                budget: check.budget,
            });
        }
        Ok(())
    }

    /// 计算拆分结果（不写入存储）
    pub fn plan_split(&self, chapter: &Chapter, model: &str, safety_ratio: f64) -> Vec<NewChapter> {
        self.splitter
            .split(&chapter.content_md, model, safety_ratio)
            .into_iter()
            .map(|chunk| NewChapter {
                title: format!("{} (Part {})", chapter.title, chunk.index + 1),
                token_count: self.splitter.estimate(&chunk.text, REFERENCE_MODEL),
                content_md: chunk.text,
                level: chapter.level,
            })
            .collect()
    }

    /// 拆分已保存的章节
    ///
    /// 章节未超过阈值时拒绝拆分。
    pub async fn split_chapter(&self, chapter_id: ChapterId, model: &str, safety_ratio: f64) -> AppResult<Vec<Chapter>> {
        let chapter = self.storage.get_chapter(chapter_id).await?;
        let check = self.check_budget(&chapter, model, safety_ratio);
        if !check.exceeded() {
            return Err(ValidationError::InvalidRequest(format!(
                "章节 {} 估算 {} tokens，未超过阈值 {}，无需拆分",
                chapter_id, check.tokens, check.budget
            ))
            .into());
        }

        let parts = self.plan_split(&chapter, model, safety_ratio);
        info!(
            "✂️ 章节 {} 《{}》 {} tokens > {}，拆分为 {} 部分",
            chapter_id,
            chapter.title,
            check.tokens,
            check.budget,
            parts.len()
        );
        Ok(self.storage.replace_chapter(chapter_id, parts).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelCatalog;
    use crate::error::AppError;
    use crate::infrastructure::MemoryStore;
    use crate::services::token_estimator::TokenEstimator;

    fn service(store: Arc<MemoryStore>) -> ChapterService {
        let splitter = ChunkSplitter::new(TokenEstimator::default(), Arc::new(ModelCatalog::builtin()));
        ChapterService::new(store, splitter)
    }

    #[tokio::test]
    async fn test_split_refuses_small_chapter() {
        let store = Arc::new(MemoryStore::new());
        let ids = store.insert_book(
            1,
            vec![NewChapter {
                title: "短章".to_string(),
                content_md: "很短的内容。".to_string(),
                token_count: 6,
                level: 1,
            }],
        );
        let err = service(store).split_chapter(ids[0], "deepseek-v3", 0.8).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(ValidationError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_split_replaces_with_numbered_parts() {
        let paragraph = "极限是微积分的基础概念，用来描述变量无限接近某个值时的趋势。".repeat(40);
        let content = vec![paragraph.as_str(); 12].join("\n\n");
        let store = Arc::new(MemoryStore::new());
        let ids = store.insert_book(
            1,
            vec![NewChapter {
                title: "第二章 极限".to_string(),
                content_md: content.clone(),
                token_count: 0,
                level: 1,
            }],
        );
        let service = service(store.clone());
        let chapter = store.get_chapter(ids[0]).await.unwrap();
        let check = service.check_budget(&chapter, "deepseek-v3", 0.05);
        assert!(check.exceeded());

        let parts = service.split_chapter(ids[0], "deepseek-v3", 0.05).await.unwrap();
        assert!(parts.len() >= 2);
        assert_eq!(parts[0].title, "第二章 极限 (Part 1)");
        let joined: String = parts.iter().map(|c| c.content_md.as_str()).collect();
        assert_eq!(joined, content);
        assert!(parts
            .iter()
            .all(|p| service.splitter().estimate(&p.content_md, "deepseek-v3") <= check.budget));
    }
}
