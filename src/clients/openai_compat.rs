//! OpenAI 兼容供应商
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 通过自定义 API 端点同时支持 OpenAI、DeepSeek、Kimi 等兼容服务

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::clients::provider::{LlmProvider, LlmRequest};
use crate::error::{ProviderError, ProviderErrorKind};

/// OpenAI 兼容供应商
pub struct OpenAiCompatibleProvider {
    name: String,
    client: Client<OpenAIConfig>,
}

impl OpenAiCompatibleProvider {
    /// 创建供应商
    pub fn new(name: impl Into<String>, api_key: &str, api_base: &str) -> Self {
        // 配置 OpenAI 客户端（兼容 OpenAI API 的服务）
        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_base);

        Self {
            name: name.into(),
            client: Client::with_config(openai_config),
        }
    }

    fn build_messages(&self, request: &LlmRequest) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let mut messages = Vec::new();

        if let Some(sys_msg) = &request.system_message {
            let system_msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(sys_msg.as_str())
                .build()?;
            messages.push(ChatCompletionRequestMessage::System(system_msg));
        }

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(request.prompt.as_str())
            .build()?;
        messages.push(ChatCompletionRequestMessage::User(user_msg));

        Ok(messages)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &LlmRequest) -> Result<String, ProviderError> {
        debug!("调用 {} API，模型: {}", self.name, request.model_id);
        debug!("用户消息长度: {} 字符", request.prompt.len());

        let invalid = |e: OpenAIError| {
            ProviderError::new(ProviderErrorKind::InvalidRequest, &request.model, e.to_string())
        };

        let messages = self.build_messages(request).map_err(invalid)?;
        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&request.model_id)
            .messages(messages)
            .temperature(request.temperature)
            .max_tokens(request.max_output_tokens)
            .build()
            .map_err(invalid)?;

        let response = self.client.chat().create(chat_request).await.map_err(|e| {
            let message = e.to_string();
            let kind = classify_openai_error(&e);
            warn!("{} API 调用失败 [{}]: {}", self.name, kind, message);
            ProviderError::new(kind, &request.model, message)
        })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::new(ProviderErrorKind::MalformedResponse, &request.model, "模型返回内容为空")
            })?;

        debug!("{} API 调用成功，响应 {} 字符", self.name, content.len());
        Ok(content.trim().to_string())
    }
}

/// 根据 async-openai 的错误类型归类
pub fn classify_openai_error(error: &OpenAIError) -> ProviderErrorKind {
    match error {
        OpenAIError::Reqwest(e) => {
            if e.is_timeout() {
                ProviderErrorKind::Timeout
            } else if let Some(status) = e.status() {
                ProviderErrorKind::from_status(status.as_u16())
            } else {
                ProviderErrorKind::Transport
            }
        }
        OpenAIError::ApiError(api) => classify_api_error(api.r#type.as_deref(), api.code.as_deref(), &api.message),
        OpenAIError::JSONDeserialize(..) => ProviderErrorKind::MalformedResponse,
        OpenAIError::StreamError(_) => ProviderErrorKind::Transport,
        OpenAIError::InvalidArgument(_) | OpenAIError::FileSaveError(_) | OpenAIError::FileReadError(_) => {
            ProviderErrorKind::InvalidRequest
        }
    }
}

/// 根据服务端错误对象归类
///
/// 5xx 响应没有 `type` 与 `code`，按临时故障处理；其余先看 `type` / `code`，
/// 再退回到错误信息关键字。
pub fn classify_api_error(error_type: Option<&str>, code: Option<&str>, message: &str) -> ProviderErrorKind {
    if error_type.is_none() && code.is_none() {
        return match classify_error_message(message) {
            ProviderErrorKind::InvalidRequest => ProviderErrorKind::Transport,
            kind => kind,
        };
    }

    let tags = format!("{} {}", error_type.unwrap_or_default(), code.unwrap_or_default()).to_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| tags.contains(k));
    if has(&["insufficient_quota", "billing", "content_filter", "content_policy"]) {
        ProviderErrorKind::InvalidRequest
    } else if has(&["rate_limit"]) {
        ProviderErrorKind::RateLimit
    } else if has(&["authentication", "invalid_api_key", "permission"]) {
        ProviderErrorKind::Auth
    } else if has(&["server_error", "overloaded", "service_unavailable"]) {
        ProviderErrorKind::Transport
    } else if has(&["timeout"]) {
        ProviderErrorKind::Timeout
    } else {
        classify_error_message(message)
    }
}

/// 根据错误信息关键字归类
///
/// 只用于没有结构化字段的错误；无法识别的按请求错误处理，不再重试。
pub fn classify_error_message(message: &str) -> ProviderErrorKind {
    let lower = message.to_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| lower.contains(k));

    if has(&["insufficient balance", "insufficient_quota", "content policy", "content_filter"]) {
        ProviderErrorKind::InvalidRequest
    } else if has(&["timed out", "timeout", "deadline"]) {
        ProviderErrorKind::Timeout
    } else if has(&["rate limit", "rate_limit", "too many requests"]) {
        ProviderErrorKind::RateLimit
    } else if has(&[
        "unauthorized",
        "invalid api key",
        "incorrect api key",
        "invalid_api_key",
        "authentication",
        "permission",
    ]) {
        ProviderErrorKind::Auth
    } else if has(&["deserialize", "failed to parse", "invalid json"]) {
        ProviderErrorKind::MalformedResponse
    } else if has(&[
        "error sending request",
        "connection",
        "bad gateway",
        "service unavailable",
        "overloaded",
        "internal server error",
    ]) {
        ProviderErrorKind::Transport
    } else {
        ProviderErrorKind::InvalidRequest
    }
}
