//! 生成条目数据模型

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;
use crate::models::ChapterId;

/// 选择题要求的选项数量
pub const CHOICE_OPTION_COUNT: usize = 4;

/// 条目 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 内容类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// 问答对
    Qa,
    /// 练习题
    Exercise,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Qa => "qa",
            ContentKind::Exercise => "exercise",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "qa" => Some(ContentKind::Qa),
            "exercise" => Some(ContentKind::Exercise),
            _ => None,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 生成模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// 单次调用
    Standard,
    /// 分析 → 生成 → 审核 → 修订
    MultiAgent,
}

impl GenerationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationMode::Standard => "standard",
            GenerationMode::MultiAgent => "multi_agent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "standard" => Some(GenerationMode::Standard),
            "multi_agent" | "agent" => Some(GenerationMode::MultiAgent),
            _ => None,
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 条目生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Generated,
    Verified,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Generated => "generated",
            ItemStatus::Verified => "verified",
        };
        f.write_str(label)
    }
}

/// 经过结构校验的条目草稿
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDraft {
    /// 练习题题型（choice / fill / essay / calculation ...）
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl ItemDraft {
    /// 是否为选择题
    pub fn is_choice(&self) -> bool {
        match self.item_type.as_deref() {
            Some(t) => is_choice_type(t),
            None => self.options.is_some(),
        }
    }
}

/// 题型是否属于选择题
pub fn is_choice_type(item_type: &str) -> bool {
    matches!(
        item_type.trim().to_lowercase().as_str(),
        "choice" | "mcq" | "single_choice" | "multiple_choice" | "选择题"
    )
}

/// 持久化的生成条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedItem {
    pub id: Option<ItemId>,
    pub chapter_id: ChapterId,
    pub kind: ContentKind,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exercise_type: Option<String>,
    pub model_name: String,
    pub mode: GenerationMode,
    pub status: ItemStatus,
    /// 是否经过修订阶段
    #[serde(default)]
    pub refined: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Local>>,
}

impl GeneratedItem {
    /// 由草稿创建条目，状态为 `generated`
    pub fn from_draft(
        draft: ItemDraft,
        chapter_id: ChapterId,
        kind: ContentKind,
        model_name: impl Into<String>,
        mode: GenerationMode,
        refined: bool,
    ) -> Self {
        let options = if draft.is_choice() { draft.options } else { None };
        Self {
            id: None,
            chapter_id,
            kind,
            question: draft.question,
            options,
            answer: draft.answer,
            explanation: draft.explanation,
            exercise_type: draft.item_type,
            model_name: model_name.into(),
            mode,
            status: ItemStatus::Generated,
            refined,
            verified_at: None,
        }
    }

    /// 推进生命周期状态（只允许前进）
    pub fn advance_to(&mut self, status: ItemStatus) -> Result<(), ValidationError> {
        if status < self.status {
            return Err(ValidationError::InvalidStatusTransition {
                from: self.status,
                to: status,
            });
        }
        if status == ItemStatus::Verified && self.status != ItemStatus::Verified {
            self.verified_at = Some(Local::now());
        }
        self.status = status;
        Ok(())
    }

    /// 用户显式撤销审核
    pub fn revert_verification(&mut self) {
        if self.status == ItemStatus::Verified {
            self.status = ItemStatus::Generated;
            self.verified_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(options: Option<Vec<&str>>, item_type: Option<&str>) -> ItemDraft {
        ItemDraft {
            item_type: item_type.map(str::to_string),
            question: "1+1=?".to_string(),
            options: options.map(|o| o.into_iter().map(str::to_string).collect()),
            answer: "2".to_string(),
            explanation: None,
        }
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        let mut item = GeneratedItem::from_draft(
            draft(None, None),
            ChapterId(1),
            ContentKind::Qa,
            "deepseek-v3",
            GenerationMode::Standard,
            false,
        );
        assert_eq!(item.status, ItemStatus::Generated);

        item.advance_to(ItemStatus::Verified).unwrap();
        assert!(item.verified_at.is_some());

        let err = item.advance_to(ItemStatus::Generated).unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidStatusTransition {
                from: ItemStatus::Verified,
                to: ItemStatus::Generated,
            }
        );

        item.revert_verification();
        assert_eq!(item.status, ItemStatus::Generated);
        assert!(item.verified_at.is_none());
    }

    #[test]
    fn test_options_only_kept_for_choice_items() {
        let essay = GeneratedItem::from_draft(
            draft(Some(vec!["A", "B", "C", "D"]), Some("essay")),
            ChapterId(1),
            ContentKind::Exercise,
            "gpt-4o",
            GenerationMode::Standard,
            false,
        );
        assert!(essay.options.is_none());

        let choice = GeneratedItem::from_draft(
            draft(Some(vec!["A", "B", "C", "D"]), Some("choice")),
            ChapterId(1),
            ContentKind::Exercise,
            "gpt-4o",
            GenerationMode::Standard,
            false,
        );
        assert_eq!(choice.options.as_ref().map(Vec::len), Some(4));
    }

    #[test]
    fn test_parse_mode_and_kind() {
        assert_eq!(GenerationMode::parse("multi-agent"), Some(GenerationMode::MultiAgent));
        assert_eq!(GenerationMode::parse("standard"), Some(GenerationMode::Standard));
        assert_eq!(ContentKind::parse("Exercise"), Some(ContentKind::Exercise));
        assert_eq!(ContentKind::parse("essay"), None);
    }
}
