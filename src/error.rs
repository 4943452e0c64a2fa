use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::{ChapterId, ItemId, ItemStatus, PromptKind};

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// LLM 返回的条目结构不合法（局部恢复：丢弃该条目）
    #[error("校验错误: {0}")]
    Validation(#[from] ValidationError),
    /// 模型调用错误（按策略重试后仍失败）
    #[error("模型调用错误: {0}")]
    Provider(#[from] ProviderError),
    /// 章节超出模型上下文预算
    #[error("预算错误: {0}")]
    BudgetExceeded(#[from] BudgetExceededError),
    /// 流水线阶段错误（仅中止当前章节）
    #[error("流水线错误: {0}")]
    Stage(#[from] PipelineStageError),
    /// 存储错误
    #[error("存储错误: {0}")]
    Storage(#[from] StorageError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 任务在执行过程中被取消
    #[error("任务已取消")]
    Cancelled,
}

// ========== 校验错误 ==========

/// 条目或请求的结构校验错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// 必填字段为空
    #[error("字段 `{field}` 为空")]
    EmptyField { field: &'static str },
    /// 选择题选项数量不符
    #[error("选择题需要 {expected} 个选项，实际为 {actual} 个")]
    WrongOptionCount { expected: usize, actual: usize },
    /// 练习题缺少题型
    #[error("练习题缺少 `type` 字段")]
    MissingExerciseType,
    /// 响应中找不到 JSON
    #[error("无法从模型响应中解析 JSON: {snippet}")]
    NotJson { snippet: String },
    /// JSON 结构不是期望的形状
    #[error("JSON 结构不符合预期: {0}")]
    UnexpectedShape(String),
    /// 审核评分不在 1..=3 范围内
    #[error("审核评分 {0} 不在 1..=3 范围内")]
    InvalidScore(u8),
    /// 生成请求不合法
    #[error("生成请求不合法: {0}")]
    InvalidRequest(String),
    /// 条目状态回退
    #[error("条目状态不能从 {from} 变为 {to}")]
    InvalidStatusTransition { from: ItemStatus, to: ItemStatus },
}

// ========== 模型调用错误 ==========

/// 模型调用错误的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 鉴权失败（不重试）
    Auth,
    /// 请求频率限制（可重试）
    RateLimit,
    /// 调用超时（可重试）
    Timeout,
    /// 网络或服务端临时故障（可重试）
    Transport,
    /// 请求本身不合法（不重试）
    InvalidRequest,
    /// 返回内容无法使用（不重试）
    MalformedResponse,
    /// 路由中没有注册该模型（不重试）
    UnknownModel,
}

impl ProviderErrorKind {
    /// 是否属于可重试的临时故障
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimit | ProviderErrorKind::Timeout | ProviderErrorKind::Transport
        )
    }

    /// 根据 HTTP 状态码归类
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ProviderErrorKind::Auth,
            429 => ProviderErrorKind::RateLimit,
            408 | 504 => ProviderErrorKind::Timeout,
            500..=599 => ProviderErrorKind::Transport,
            _ => ProviderErrorKind::InvalidRequest,
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderErrorKind::Auth => "AUTH",
            ProviderErrorKind::RateLimit => "RATE_LIMIT",
            ProviderErrorKind::Timeout => "TIMEOUT",
            ProviderErrorKind::Transport => "TRANSPORT",
            ProviderErrorKind::InvalidRequest => "INVALID_REQUEST",
            ProviderErrorKind::MalformedResponse => "MALFORMED_RESPONSE",
            ProviderErrorKind::UnknownModel => "UNKNOWN_MODEL",
        };
        f.write_str(label)
    }
}

/// 模型调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{kind}] 模型 {model}: {message}{}", attempts_suffix(.attempts))]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub model: String,
    pub message: String,
    /// 已尝试次数（由路由器在重试结束后填写）
    pub attempts: u32,
}

fn attempts_suffix(attempts: &u32) -> String {
    if *attempts > 1 {
        format!(" (共尝试 {} 次)", attempts)
    } else {
        String::new()
    }
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, model: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

// ========== 预算 / 流水线错误 ==========

/// 章节 token 数超过模型安全阈值且未拆分
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("章节 {chapter_id} 估算 {tokens} tokens，超过模型 {model} 的安全阈值 {budget}，请先拆分章节")]
pub struct BudgetExceededError {
    pub chapter_id: ChapterId,
    pub model: String,
    pub tokens: usize,
    pub budget: usize,
}

/// 多智能体流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Analyze,
    Generate,
    Review,
    Refine,
    Done,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Analyze => "analyze",
            PipelineStage::Generate => "generate",
            PipelineStage::Review => "review",
            PipelineStage::Refine => "refine",
            PipelineStage::Done => "done",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 阶段失败（ANALYZE 失败时中止当前章节）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("章节 {chapter_id} 在 {stage} 阶段失败: {reason}")]
pub struct PipelineStageError {
    pub chapter_id: ChapterId,
    pub stage: PipelineStage,
    pub reason: String,
}

// ========== 存储 / 配置错误 ==========

/// 存储错误
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("章节不存在: {0}")]
    ChapterNotFound(ChapterId),
    #[error("条目不存在: {0}")]
    ItemNotFound(ItemId),
    #[error("没有可用的 {0} 模板")]
    TemplateNotFound(PromptKind),
    #[error("章节树不合法: {0}")]
    InvalidTree(String),
    #[error("条目状态变更失败: {0}")]
    Status(#[from] ValidationError),
    #[error("读写快照失败 ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("快照格式错误: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 模型目录中没有该模型
    #[error("未知模型: {0}")]
    UnknownModel(String),
    /// 没有配置任何模型的 API 密钥
    #[error("没有配置任何 LLM API 密钥")]
    NoProviderConfigured,
    /// 模型目录 TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// 读取配置文件失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 创建客户端失败
    #[error("创建客户端失败: {0}")]
    ClientBuild(String),
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建阶段失败错误
    pub fn stage_failed(chapter_id: ChapterId, stage: PipelineStage, reason: impl Into<String>) -> Self {
        AppError::Stage(PipelineStageError {
            chapter_id,
            stage,
            reason: reason.into(),
        })
    }

    /// 是否为取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}

impl StorageError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_display_includes_attempts() {
        let mut err = ProviderError::new(ProviderErrorKind::Timeout, "deepseek-v3", "调用超时");
        assert_eq!(err.to_string(), "[TIMEOUT] 模型 deepseek-v3: 调用超时");
        err.attempts = 3;
        assert_eq!(err.to_string(), "[TIMEOUT] 模型 deepseek-v3: 调用超时 (共尝试 3 次)");
        assert!(err.is_transient());
    }
}
