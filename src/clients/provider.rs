//! LLM 供应商接口
//!
//! 每个供应商实现 [`LlmProvider`]，只负责单次调用并把失败归类为
//! [`ProviderErrorKind`]。重试、超时与模型路由由 `ProviderRouter` 负责。

use async_trait::async_trait;

use crate::error::ProviderError;

/// 一次模型调用
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    /// 逻辑模型名（用于日志与错误信息）
    pub model: String,
    /// 供应商侧的模型 ID
    pub model_id: String,
    pub prompt: String,
    pub system_message: Option<String>,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// 调用方对单次调用参数的覆盖
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    pub system_message: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl GenerateOptions {
    pub fn with_system(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = Some(system_message.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// LLM 供应商
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// 供应商名称
    fn name(&self) -> &str;

    /// 执行一次调用，返回模型输出的文本
    async fn generate(&self, request: &LlmRequest) -> Result<String, ProviderError>;
}
