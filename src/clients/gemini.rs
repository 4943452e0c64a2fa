//! Gemini 供应商
//!
//! 直接调用 Gemini REST API（`models/{model}:generateContent`）

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::clients::provider::{LlmProvider, LlmRequest};
use crate::error::{ConfigError, ProviderError, ProviderErrorKind};

/// Gemini 供应商
pub struct GeminiProvider {
    client: Client,
    api_base: String,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(api_key: &str, api_base: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn endpoint(&self, model_id: &str) -> String {
        format!("{}/models/{}:generateContent", self.api_base, model_id)
    }
}

#[derive(Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContentIn<'a>>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContentIn<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContentIn<'a> {
    role: &'static str,
    parts: Vec<GeminiPartIn<'a>>,
}

#[derive(Serialize)]
struct GeminiPartIn<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContentOut>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContentOut {
    #[serde(default)]
    parts: Vec<GeminiPartOut>,
}

#[derive(Debug, Deserialize)]
struct GeminiPartOut {
    #[serde(default)]
    text: Option<String>,
}

/// 拼接第一个非空候选的文本
fn extract_text(response: GeminiResponse) -> Option<String> {
    response.candidates.into_iter().find_map(|candidate| {
        if let Some(reason) = candidate.finish_reason.as_deref() {
            match reason {
                "MAX_TOKENS" => warn!("⚠️ Gemini 响应因 max_tokens 被截断"),
                "SAFETY" => warn!("⚠️ Gemini 响应被安全策略拦截"),
                _ => {}
            }
        }
        let text: String = candidate
            .content?
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect();
        (!text.trim().is_empty()).then_some(text)
    })
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, request: &LlmRequest) -> Result<String, ProviderError> {
        debug!("调用 Gemini API，模型: {}", request.model_id);

        let body = GeminiRequest {
            contents: vec![GeminiContentIn {
                role: "user",
                parts: vec![GeminiPartIn {
                    text: &request.prompt,
                }],
            }],
            system_instruction: request.system_message.as_deref().map(|text| GeminiContentIn {
                role: "system",
                parts: vec![GeminiPartIn { text }],
            }),
            generation_config: GeminiGenerationConfig {
                max_output_tokens: request.max_output_tokens,
                temperature: request.temperature,
            },
        };

        let response = self
            .client
            .post(self.endpoint(&request.model_id))
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    ProviderErrorKind::Timeout
                } else {
                    ProviderErrorKind::Transport
                };
                ProviderError::new(kind, &request.model, e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let kind = ProviderErrorKind::from_status(status.as_u16());
            warn!("Gemini API 返回 {} [{}]", status, kind);
            return Err(ProviderError::new(
                kind,
                &request.model,
                format!("HTTP {}: {}", status, text),
            ));
        }

        let parsed: GeminiResponse = response.json().await.map_err(|e| {
            ProviderError::new(ProviderErrorKind::MalformedResponse, &request.model, e.to_string())
        })?;

        extract_text(parsed).ok_or_else(|| {
            ProviderError::new(ProviderErrorKind::MalformedResponse, &request.model, "Gemini 返回内容为空")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_skips_empty_candidates() {
        let raw = r#"{
            "candidates": [
                {"content": {"parts": []}, "finishReason": "SAFETY"},
                {"content": {"parts": [{"text": "[{\"question\": "}, {"text": "\"q\"}]"}]}}
            ]
        }"#;
        let parsed: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(extract_text(parsed).as_deref(), Some("[{\"question\": \"q\"}]"));

        let empty: GeminiResponse = serde_json::from_str("{}").unwrap();
        assert!(extract_text(empty).is_none());
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let provider = GeminiProvider::new(
            "key",
            "https://generativelanguage.googleapis.com/v1beta/",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            provider.endpoint("gemini-2.5-pro"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:generateContent"
        );
    }
}
