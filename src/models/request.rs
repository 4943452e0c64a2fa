//! 生成请求

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::models::{ChapterId, ContentKind, GenerationMode};

/// 默认输出语言
pub const DEFAULT_LANGUAGE: &str = "中文";

/// 一次生成任务的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// 按顺序处理的章节
    pub chapter_ids: Vec<ChapterId>,
    /// 逻辑模型名（模型目录中的 key）
    pub model: String,
    /// 每个章节期望的条目数
    pub count: usize,
    pub mode: GenerationMode,
    pub kind: ContentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exercise_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// 用户覆盖的单次生成模板
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_template: Option<String>,
}

impl GenerationRequest {
    pub fn new(
        chapter_ids: Vec<ChapterId>,
        model: impl Into<String>,
        count: usize,
        mode: GenerationMode,
        kind: ContentKind,
    ) -> Self {
        Self {
            chapter_ids,
            model: model.into(),
            count,
            mode,
            kind,
            exercise_type: None,
            language: None,
            custom_template: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_exercise_type(mut self, exercise_type: impl Into<String>) -> Self {
        self.exercise_type = Some(exercise_type.into());
        self
    }

    pub fn with_custom_template(mut self, template: impl Into<String>) -> Self {
        self.custom_template = Some(template.into());
        self
    }

    /// 输出语言（未指定时为中文）
    pub fn language(&self) -> &str {
        self.language.as_deref().unwrap_or(DEFAULT_LANGUAGE)
    }

    /// 校验请求不变量
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.chapter_ids.is_empty() {
            return Err(ValidationError::InvalidRequest(
                "至少需要一个章节".to_string(),
            ));
        }
        if self.count == 0 {
            return Err(ValidationError::InvalidRequest(
                "生成数量必须大于 0".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(ValidationError::InvalidRequest("模型不能为空".to_string()));
        }
        Ok(())
    }
}
