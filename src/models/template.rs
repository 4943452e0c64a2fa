//! 提示词模板数据模型

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::ContentKind;

/// 模板用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// 单次生成：问答
    Qa,
    /// 单次生成：练习题
    Exercise,
    /// 智能体 A：内容分析
    Analyzer,
    /// 智能体 B：选择题生成
    GeneratorChoice,
    /// 智能体 B：练习题生成
    GeneratorExercise,
    /// 智能体 C：审核
    Reviewer,
    /// 智能体 D：修订
    Refiner,
}

impl PromptKind {
    pub const ALL: [PromptKind; 7] = [
        PromptKind::Qa,
        PromptKind::Exercise,
        PromptKind::Analyzer,
        PromptKind::GeneratorChoice,
        PromptKind::GeneratorExercise,
        PromptKind::Reviewer,
        PromptKind::Refiner,
    ];

    /// 单次生成使用的模板
    pub fn single_pass(kind: ContentKind) -> Self {
        match kind {
            ContentKind::Qa => PromptKind::Qa,
            ContentKind::Exercise => PromptKind::Exercise,
        }
    }

    /// 多智能体生成阶段使用的模板
    pub fn generator(kind: ContentKind) -> Self {
        match kind {
            ContentKind::Qa => PromptKind::GeneratorChoice,
            ContentKind::Exercise => PromptKind::GeneratorExercise,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PromptKind::Qa => "qa",
            PromptKind::Exercise => "exercise",
            PromptKind::Analyzer => "analyzer",
            PromptKind::GeneratorChoice => "generator_choice",
            PromptKind::GeneratorExercise => "generator_exercise",
            PromptKind::Reviewer => "reviewer",
            PromptKind::Refiner => "refiner",
        }
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 某一版本的提示词模板
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub kind: PromptKind,
    pub name: String,
    /// 含 `{placeholder}` 占位符的正文
    pub body: String,
    pub version: u32,
}
