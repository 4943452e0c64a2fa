//! 脚本化供应商
//!
//! 按预先给定的顺序返回结果，不访问网络。用于测试和离线演练。

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::clients::provider::{LlmProvider, LlmRequest};
use crate::error::{ProviderError, ProviderErrorKind};

/// 一次预设的回复
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    /// 立即返回文本
    Text(String),
    /// 立即返回错误
    Fail(ProviderErrorKind),
    /// 等待一段时间后返回文本
    Delay(Duration, String),
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedReply::Text(text.into())
    }
}

type Responder = Box<dyn Fn(&LlmRequest) -> ScriptedReply + Send + Sync>;

/// 脚本化供应商
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    responder: Option<Responder>,
    calls: Mutex<Vec<LlmRequest>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedProvider {
    /// 按顺序消费的回复队列
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            responder: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 队列耗尽后由回调根据请求决定回复
    pub fn with_responder(
        mut self,
        responder: impl Fn(&LlmRequest) -> ScriptedReply + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    /// 已收到的请求
    pub fn calls(&self) -> Vec<LlmRequest> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// 队列中剩余的回复数
    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &LlmRequest) -> Result<String, ProviderError> {
        lock(&self.calls).push(request.clone());

        let queued = lock(&self.replies).pop_front();
        let reply = match (queued, &self.responder) {
            (Some(reply), _) => reply,
            (None, Some(responder)) => responder(request),
            (None, None) => {
                return Err(ProviderError::new(
                    ProviderErrorKind::InvalidRequest,
                    &request.model,
                    "脚本化回复已用完",
                ))
            }
        };

        match reply {
            ScriptedReply::Text(text) => Ok(text),
            ScriptedReply::Fail(kind) => Err(ProviderError::new(kind, &request.model, format!("脚本化失败: {}", kind))),
            ScriptedReply::Delay(duration, text) => {
                tokio::time::sleep(duration).await;
                Ok(text)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> LlmRequest {
        LlmRequest {
            model: "scripted".to_string(),
            model_id: "scripted-1".to_string(),
            prompt: prompt.to_string(),
            system_message: None,
            temperature: 0.7,
            max_output_tokens: 1024,
        }
    }

    #[tokio::test]
    async fn test_replies_in_order_then_responder() {
        let provider = ScriptedProvider::new([
            ScriptedReply::text("first"),
            ScriptedReply::Fail(ProviderErrorKind::RateLimit),
        ])
        .with_responder(|req| ScriptedReply::text(format!("echo: {}", req.prompt)));

        assert_eq!(provider.generate(&request("a")).await.unwrap(), "first");
        assert_eq!(
            provider.generate(&request("b")).await.unwrap_err().kind,
            ProviderErrorKind::RateLimit
        );
        assert_eq!(provider.generate(&request("c")).await.unwrap(), "echo: c");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_queue_fails() {
        let provider = ScriptedProvider::new(Vec::new());
        let err = provider.generate(&request("x")).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::InvalidRequest);
    }
}
