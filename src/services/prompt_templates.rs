//! 提示词模板 - 业务能力层
//!
//! 职责：
//! - 保存每种用途的模板及其全部历史版本
//! - 每种用途恰好一个默认版本
//! - 编辑只追加新版本，历史版本不可修改
//! - 任务开始时导出不可变快照，运行期间的编辑不影响正在执行的任务
//!
//! 占位符写作 `{name}`，渲染时一次替换；未提供的占位符原样保留。

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::StorageError;
use crate::models::{PromptKind, PromptTemplate};

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\{(\w+)\}").expect("invalid placeholder regex"))
}

/// 用变量替换模板中的 `{key}` 占位符
///
/// 只扫描模板正文一遍，代入的内容不会再被当作占位符。
pub fn render(body: &str, vars: &[(&str, &str)]) -> String {
    placeholder_regex()
        .replace_all(body, |caps: &Captures| {
            let key = &caps[1];
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// 模板仓库
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    history: BTreeMap<PromptKind, Vec<PromptTemplate>>,
    defaults: BTreeMap<PromptKind, u32>,
}

impl TemplateStore {
    /// 空仓库
    pub fn new() -> Self {
        Self::default()
    }

    /// 带内置默认模板的仓库（每种用途 v1）
    pub fn with_builtin() -> Self {
        let mut store = Self::new();
        for kind in PromptKind::ALL {
            store.update(kind, builtin_name(kind), builtin_body(kind));
        }
        store
    }

    /// 追加新版本并设为默认
    pub fn update(&mut self, kind: PromptKind, name: impl Into<String>, body: impl Into<String>) -> PromptTemplate {
        let versions = self.history.entry(kind).or_default();
        let version = versions.last().map(|t| t.version + 1).unwrap_or(1);
        let template = PromptTemplate {
            kind,
            name: name.into(),
            body: body.into(),
            version,
        };
        versions.push(template.clone());
        self.defaults.insert(kind, version);
        template
    }

    /// 把某个历史版本设为默认
    pub fn set_default(&mut self, kind: PromptKind, version: u32) -> Result<(), StorageError> {
        let exists = self
            .history
            .get(&kind)
            .map(|versions| versions.iter().any(|t| t.version == version))
            .unwrap_or(false);
        if !exists {
            return Err(StorageError::TemplateNotFound(kind));
        }
        self.defaults.insert(kind, version);
        Ok(())
    }

    /// 当前默认模板
    pub fn default_for(&self, kind: PromptKind) -> Option<&PromptTemplate> {
        let version = self.defaults.get(&kind)?;
        self.history
            .get(&kind)?
            .iter()
            .find(|t| t.version == *version)
    }

    /// 全部历史版本（按版本号升序）
    pub fn history(&self, kind: PromptKind) -> &[PromptTemplate] {
        self.history.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 导出当前默认模板的快照
    pub fn snapshot(&self) -> TemplateSnapshot {
        let templates = PromptKind::ALL
            .iter()
            .filter_map(|kind| self.default_for(*kind).map(|t| (*kind, t.clone())))
            .collect();
        TemplateSnapshot { templates }
    }
}

/// 任务开始时捕获的模板集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateSnapshot {
    templates: BTreeMap<PromptKind, PromptTemplate>,
}

impl TemplateSnapshot {
    /// 内置模板的快照
    pub fn builtin() -> Self {
        TemplateStore::with_builtin().snapshot()
    }

    pub fn get(&self, kind: PromptKind) -> Result<&PromptTemplate, StorageError> {
        self.templates
            .get(&kind)
            .ok_or(StorageError::TemplateNotFound(kind))
    }

    /// 仅对本次任务生效的覆盖（请求里的自定义模板）
    pub fn with_override(mut self, kind: PromptKind, body: impl Into<String>) -> Self {
        let version = self.templates.get(&kind).map(|t| t.version).unwrap_or(0);
        self.templates.insert(
            kind,
            PromptTemplate {
                kind,
                name: "custom".to_string(),
                body: body.into(),
                version,
            },
        );
        self
    }

    pub fn render(&self, kind: PromptKind, vars: &[(&str, &str)]) -> Result<String, StorageError> {
        Ok(render(&self.get(kind)?.body, vars))
    }
}

fn builtin_name(kind: PromptKind) -> &'static str {
    match kind {
        PromptKind::Qa => "默认问答模板",
        PromptKind::Exercise => "默认练习题模板",
        PromptKind::Analyzer => "内容分析",
        PromptKind::GeneratorChoice => "选择题出题",
        PromptKind::GeneratorExercise => "练习题出题",
        PromptKind::Reviewer => "质量审核",
        PromptKind::Refiner => "修订",
    }
}

fn builtin_body(kind: PromptKind) -> &'static str {
    match kind {
        PromptKind::Qa => QA_TEMPLATE,
        PromptKind::Exercise => EXERCISE_TEMPLATE,
        PromptKind::Analyzer => ANALYZER_TEMPLATE,
        PromptKind::GeneratorChoice => GENERATOR_CHOICE_TEMPLATE,
        PromptKind::GeneratorExercise => GENERATOR_EXERCISE_TEMPLATE,
        PromptKind::Reviewer => REVIEWER_TEMPLATE,
        PromptKind::Refiner => REFINER_TEMPLATE,
    }
}

const QA_TEMPLATE: &str = r#"你是一名经验丰富的学科教师。请阅读下面的教材章节，围绕其中的核心知识点编写 {count} 组问答。

章节标题：{chapter_title}
输出语言：{target_language}

章节内容：
{chapter_content}

要求：
1. 问题覆盖章节的重要概念，避免重复
2. 答案准确、完整，可以直接用于复习
3. 只输出 JSON 数组，不要输出其他内容

输出格式：
[
  {"question": "问题", "answer": "答案", "explanation": "补充说明（可选）"}
]
"#;

const EXERCISE_TEMPLATE: &str = r#"你是一名命题专家。请根据下面的教材章节编写 {count} 道练习题。

章节标题：{chapter_title}
题型要求：{exercise_type}
输出语言：{target_language}

章节内容：
{chapter_content}

要求：
1. 每道题必须有 type 字段（choice / fill / essay / calculation）
2. 选择题必须有 options 字段，且恰好 4 个选项（A-D）
3. 答案与解析必须与章节内容一致
4. 只输出 JSON 数组，不要输出其他内容

输出格式：
[
  {"type": "choice", "question": "题干", "options": ["A. ...", "B. ...", "C. ...", "D. ..."], "answer": "A", "explanation": "解析"}
]
"#;

const ANALYZER_TEMPLATE: &str = r#"你是一名课程设计专家。请分析下面的教材章节，找出最值得考查的知识点。

输出语言：{target_language}

章节内容：
{chapter_content}

对每个知识点给出：
- Topic：知识点名称
- Key_Concepts：涉及的关键概念列表
- Source_Snippet：原文中支撑该知识点的片段
- Potential_Misconceptions：学生常见的误解列表
- Suggested_Question_Type：建议的题型

只输出 JSON 数组：
[
  {"Topic": "...", "Key_Concepts": ["..."], "Source_Snippet": "...", "Potential_Misconceptions": ["..."], "Suggested_Question_Type": "..."}
]
"#;

const GENERATOR_CHOICE_TEMPLATE: &str = r#"你是一名命题专家。请围绕下面的知识点编写 {count} 道单项选择题。

知识点：{topic}
关键概念：{concepts}
常见误解：{misconceptions}
原文依据：{source_text}
输出语言：{target_language}

要求：
1. 每题恰好 4 个选项（A-D），只有一个正确答案
2. 干扰项应来自常见误解，且具有迷惑性
3. 题干不能暗示答案

只输出 JSON 数组：
[
  {"type": "choice", "question": "题干", "options": ["A. ...", "B. ...", "C. ...", "D. ..."], "answer": "A", "explanation": "解析"}
]
"#;

const GENERATOR_EXERCISE_TEMPLATE: &str = r#"你是一名命题专家。请围绕下面的知识点编写 {count} 道练习题。

知识点：{topic}
关键概念：{concepts}
常见误解：{misconceptions}
原文依据：{source_text}
题型要求：{exercise_type}
输出语言：{target_language}

要求：
1. 每道题必须有 type 字段（choice / fill / essay / calculation）
2. 选择题必须有恰好 4 个选项（A-D）
3. 解析需要说明解题思路

只输出 JSON 数组：
[
  {"type": "calculation", "question": "题干", "answer": "答案", "explanation": "解析"}
]
"#;

const REVIEWER_TEMPLATE: &str = r#"你是一名试题质量审核员。请逐条审核下面的题目。

输出语言：{target_language}

题目列表（item_index 从 0 开始）：
{items_json}

评分标准：
- 1：存在致命问题（答案错误、内容虚构）
- 2：有可修复的问题（干扰项太弱、表述含糊）
- 3：质量合格，可以直接使用

只输出 JSON 数组，每道题一条：
[
  {"item_index": 0, "rating": 3, "critique": "问题描述", "suggestion": "修改建议"}
]
"#;

const REFINER_TEMPLATE: &str = r#"你是一名资深试题编辑。请根据审核意见修改下面的题目。

输出语言：{target_language}

原题：
{original_item}

审核意见：{critique}
修改建议：{suggestion}

只输出修改后的题目，格式为单个 JSON 对象：
{"type": "...", "question": "...", "options": ["..."], "answer": "...", "explanation": "..."}
"#;
