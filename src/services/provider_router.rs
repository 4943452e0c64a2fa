//! 模型路由 - 业务能力层
//!
//! 职责：
//! - 逻辑模型名 → (模型参数, 供应商) 的显式映射，不做任何替换或降级
//! - 每次调用都有超时
//! - 临时故障（超时 / 限流 / 网络）按指数退避重试，其余错误立即返回
//!
//! 新的供应商只需实现 `LlmProvider` 并注册到新的模型名下，调度代码不变。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clients::{GeminiProvider, GenerateOptions, LlmProvider, LlmRequest, OpenAiCompatibleProvider};
use crate::config::{Config, ModelCatalog, ModelSpec, ProviderKind};
use crate::error::{ConfigError, ProviderError, ProviderErrorKind};

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最多尝试次数（含第一次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// 第 `attempt` 次（从 1 开始）失败后的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(8))
    }
}

struct Route {
    spec: ModelSpec,
    provider: Arc<dyn LlmProvider>,
}

/// 模型路由器
pub struct ProviderRouter {
    routes: HashMap<String, Route>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl ProviderRouter {
    pub fn new(retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            routes: HashMap::new(),
            retry,
            call_timeout,
        }
    }

    /// 按配置为所有已配置密钥的模型创建供应商
    pub fn from_config(config: &Config, catalog: &ModelCatalog) -> Result<Self, ConfigError> {
        let retry = RetryPolicy::new(
            config.max_attempts.max(1),
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        let timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        let mut router = Self::new(retry, timeout);
        let mut providers: HashMap<ProviderKind, Arc<dyn LlmProvider>> = HashMap::new();

        for spec in catalog.available_models(config) {
            let provider = match providers.get(&spec.provider) {
                Some(provider) => provider.clone(),
                None => {
                    let created = create_provider(config, spec.provider, timeout)?;
                    providers.insert(spec.provider, created.clone());
                    created
                }
            };
            router.register(spec.clone(), provider);
        }

        if router.routes.is_empty() {
            return Err(ConfigError::NoProviderConfigured);
        }
        info!("✓ 已注册 {} 个模型: {}", router.routes.len(), router.models().join(", "));
        Ok(router)
    }

    /// 注册（或替换）一个模型
    pub fn register(&mut self, spec: ModelSpec, provider: Arc<dyn LlmProvider>) {
        debug!("注册模型 {} → {} ({})", spec.key, provider.name(), spec.model_id);
        self.routes.insert(spec.key.clone(), Route { spec, provider });
    }

    pub fn spec(&self, model: &str) -> Option<&ModelSpec> {
        self.routes.get(model).map(|r| &r.spec)
    }

    /// 模型的上下文窗口
    pub fn max_context(&self, model: &str) -> Option<usize> {
        self.spec(model).map(|s| s.max_context)
    }

    /// 已注册模型组成的目录，预算与拆分都以它为准
    pub fn catalog(&self) -> ModelCatalog {
        let mut keys: Vec<&String> = self.routes.keys().collect();
        keys.sort_unstable();
        let mut catalog = ModelCatalog::empty();
        for key in keys {
            catalog.insert(self.routes[key].spec.clone());
        }
        catalog
    }

    /// 已注册的模型名（排序）
    pub fn models(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// 调用模型
    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: Option<&GenerateOptions>,
    ) -> Result<String, ProviderError> {
        let route = self.routes.get(model).ok_or_else(|| {
            ProviderError::new(ProviderErrorKind::UnknownModel, model, "模型未注册")
        })?;

        let options = options.cloned().unwrap_or_default();
        let request = LlmRequest {
            model: model.to_string(),
            model_id: route.spec.model_id.clone(),
            prompt: prompt.to_string(),
            system_message: options.system_message,
            temperature: options.temperature.unwrap_or(route.spec.temperature),
            max_output_tokens: options.max_output_tokens.unwrap_or(route.spec.max_output_tokens),
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.call_timeout, route.provider.generate(&request)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::new(
                    ProviderErrorKind::Timeout,
                    model,
                    format!("调用超过 {:?} 未返回", self.call_timeout),
                )),
            };

            match result {
                Ok(text) => {
                    if attempt > 1 {
                        info!("[模型 {}] ✓ 第 {} 次尝试成功", model, attempt);
                    }
                    return Ok(text);
                }
                Err(mut err) => {
                    if !err.is_transient() || attempt >= max_attempts {
                        err.attempts = attempt;
                        return Err(err);
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "[模型 {}] ⚠️ 第 {}/{} 次调用失败: {}，{:?} 后重试",
                        model, attempt, max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn create_provider(
    config: &Config,
    kind: ProviderKind,
    timeout: Duration,
) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    let api_key = config
        .api_key_for(kind)
        .ok_or(ConfigError::NoProviderConfigured)?;
    let api_base = config.api_base_for(kind);
    Ok(match kind {
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(api_key, api_base, timeout)?),
        ProviderKind::OpenAi | ProviderKind::DeepSeek | ProviderKind::Kimi => {
            Arc::new(OpenAiCompatibleProvider::new(kind.as_str(), api_key, api_base))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ScriptedProvider, ScriptedReply};

    fn fast_router(provider: Arc<ScriptedProvider>) -> ProviderRouter {
        let mut router = ProviderRouter::new(
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4)),
            Duration::from_millis(200),
        );
        router.register(
            ModelSpec::new("test-model", "Test", ProviderKind::OpenAi, "test-model-id", 32_768),
            provider,
        );
        router
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(8));
        assert_eq!(policy.delay_for(40), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = Arc::new(ScriptedProvider::new([
            ScriptedReply::Fail(ProviderErrorKind::Timeout),
            ScriptedReply::Fail(ProviderErrorKind::Timeout),
            ScriptedReply::text("ok"),
        ]));
        let router = fast_router(provider.clone());

        let text = router.generate("test-model", "prompt", None).await.unwrap();
        assert_eq!(text, "ok");
        assert_eq!(provider.call_count(), 3);
        assert_eq!(provider.calls()[0].model_id, "test-model-id");
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::new([
            ScriptedReply::Fail(ProviderErrorKind::Auth),
            ScriptedReply::text("never"),
        ]));
        let router = fast_router(provider.clone());

        let err = router.generate("test-model", "prompt", None).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Auth);
        assert_eq!(err.attempts, 1);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let provider = Arc::new(ScriptedProvider::new(
            std::iter::repeat(ScriptedReply::Fail(ProviderErrorKind::RateLimit)).take(5),
        ));
        let router = fast_router(provider.clone());

        let err = router.generate("test-model", "prompt", None).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::RateLimit);
        assert_eq!(err.attempts, 3);
        assert_eq!(provider.remaining(), 2);
    }

    #[tokio::test]
    async fn test_hanging_call_times_out() {
        let provider = Arc::new(ScriptedProvider::new(
            std::iter::repeat(ScriptedReply::Delay(Duration::from_secs(30), "late".to_string())).take(3),
        ));
        let router = fast_router(provider);

        let err = router.generate("test-model", "prompt", None).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Timeout);
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test]
    async fn test_unknown_model_is_not_substituted() {
        let provider = Arc::new(ScriptedProvider::new([ScriptedReply::text("ok")]));
        let router = fast_router(provider.clone());

        let err = router.generate("gpt-4o", "prompt", None).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::UnknownModel);
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn test_from_config_requires_a_key() {
        let config = Config::default();
        assert!(matches!(
            ProviderRouter::from_config(&config, &ModelCatalog::builtin()),
            Err(ConfigError::NoProviderConfigured)
        ));

        let config = Config {
            kimi_api_key: Some("sk-test".to_string()),
            ..Config::default()
        };
        let router = ProviderRouter::from_config(&config, &ModelCatalog::builtin()).unwrap();
        assert_eq!(router.models(), vec!["kimi-k2"]);
        assert_eq!(router.max_context("kimi-k2"), Some(256_000));
    }
}
