//! 程序配置
//!
//! - `Config`：运行参数，默认值 + 环境变量覆盖
//! - `ModelCatalog`：逻辑模型名 → 供应商 / 模型 ID / 上下文窗口，可由 TOML 文件替换

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::models::{ContentKind, GenerationMode};

/// 目录中查不到的模型使用的上下文窗口
pub const DEFAULT_CONTEXT_WINDOW: usize = 32_768;

/// 章节 token 数占上下文窗口的安全比例
pub const DEFAULT_SAFETY_RATIO: f64 = 0.8;

/// 程序配置
#[derive(Clone, Debug)]
pub struct Config {
    // --- LLM 供应商 ---
    pub openai_api_key: Option<String>,
    pub openai_api_base_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_api_base_url: String,
    pub deepseek_api_key: Option<String>,
    pub deepseek_api_base_url: String,
    pub kimi_api_key: Option<String>,
    pub kimi_api_base_url: String,
    /// 自定义模型目录（TOML）
    pub models_file: Option<String>,
    // --- 输入输出 ---
    /// markdown 教材路径
    pub book_path: String,
    /// 生成结果快照（JSON）
    pub output_file: String,
    // --- 生成参数 ---
    pub model: String,
    pub mode: GenerationMode,
    pub kind: ContentKind,
    /// 每个章节生成的条目数
    pub item_count: usize,
    pub language: String,
    pub exercise_type: Option<String>,
    pub safety_ratio: f64,
    /// 超出阈值的章节是否自动拆分
    pub auto_split: bool,
    // --- 调用策略 ---
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// 进度事件缓冲区大小
    pub progress_buffer: usize,
    /// 审核阶段每批条目数
    pub review_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_api_base_url: "https://api.openai.com/v1".to_string(),
            gemini_api_key: None,
            gemini_api_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            deepseek_api_key: None,
            deepseek_api_base_url: "https://api.deepseek.com/v1".to_string(),
            kimi_api_key: None,
            kimi_api_base_url: "https://api.moonshot.cn/v1".to_string(),
            models_file: None,
            book_path: "book.md".to_string(),
            output_file: "generated_items.json".to_string(),
            model: "deepseek-v3".to_string(),
            mode: GenerationMode::Standard,
            kind: ContentKind::Qa,
            item_count: 5,
            language: "中文".to_string(),
            exercise_type: None,
            safety_ratio: DEFAULT_SAFETY_RATIO,
            auto_split: false,
            request_timeout_secs: 120,
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 8000,
            progress_buffer: 64,
            review_batch_size: 5,
        }
    }
}

fn env_secret(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_enum<T>(name: &str, parse: fn(&str) -> Option<T>, expected: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => parse(&value).map(Some).ok_or_else(|| ConfigError::EnvVarParseFailed {
            var_name: name.to_string(),
            value,
            expected_type: expected.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// 从环境变量读取配置
    ///
    /// 数值类参数解析失败时回退到默认值；生成模式和内容类别写错时报错。
    pub fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();
        Ok(Self {
            openai_api_key: env_secret("OPENAI_API_KEY"),
            openai_api_base_url: std::env::var("OPENAI_API_BASE_URL").unwrap_or(default.openai_api_base_url),
            gemini_api_key: env_secret("GEMINI_API_KEY"),
            gemini_api_base_url: std::env::var("GEMINI_API_BASE_URL").unwrap_or(default.gemini_api_base_url),
            deepseek_api_key: env_secret("DEEPSEEK_API_KEY"),
            deepseek_api_base_url: std::env::var("DEEPSEEK_API_BASE_URL").unwrap_or(default.deepseek_api_base_url),
            kimi_api_key: env_secret("KIMI_API_KEY"),
            kimi_api_base_url: std::env::var("KIMI_API_BASE_URL").unwrap_or(default.kimi_api_base_url),
            models_file: env_secret("MODELS_FILE"),
            book_path: std::env::var("BOOK_PATH").unwrap_or(default.book_path),
            output_file: std::env::var("OUTPUT_FILE").unwrap_or(default.output_file),
            model: std::env::var("MODEL").unwrap_or(default.model),
            mode: env_enum("GENERATION_MODE", GenerationMode::parse, "standard | multi_agent")?.unwrap_or(default.mode),
            kind: env_enum("CONTENT_KIND", ContentKind::parse, "qa | exercise")?.unwrap_or(default.kind),
            item_count: std::env::var("ITEM_COUNT").ok().and_then(|v| v.parse().ok()).unwrap_or(default.item_count),
            language: std::env::var("LANGUAGE").unwrap_or(default.language),
            exercise_type: env_secret("EXERCISE_TYPE"),
            safety_ratio: std::env::var("SAFETY_RATIO").ok().and_then(|v| v.parse().ok()).unwrap_or(default.safety_ratio),
            auto_split: std::env::var("AUTO_SPLIT").ok().and_then(|v| v.parse().ok()).unwrap_or(default.auto_split),
            request_timeout_secs: std::env::var("REQUEST_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.request_timeout_secs),
            max_attempts: std::env::var("MAX_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.max_attempts),
            backoff_base_ms: std::env::var("BACKOFF_BASE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.backoff_base_ms),
            backoff_max_ms: std::env::var("BACKOFF_MAX_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.backoff_max_ms),
            progress_buffer: std::env::var("PROGRESS_BUFFER").ok().and_then(|v| v.parse().ok()).unwrap_or(default.progress_buffer),
            review_batch_size: std::env::var("REVIEW_BATCH_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(default.review_batch_size),
        })
    }

    /// 某个供应商的 API 密钥
    pub fn api_key_for(&self, provider: ProviderKind) -> Option<&str> {
        match provider {
            ProviderKind::OpenAi => self.openai_api_key.as_deref(),
            ProviderKind::Gemini => self.gemini_api_key.as_deref(),
            ProviderKind::DeepSeek => self.deepseek_api_key.as_deref(),
            ProviderKind::Kimi => self.kimi_api_key.as_deref(),
        }
    }

    /// 某个供应商的 API 地址
    pub fn api_base_for(&self, provider: ProviderKind) -> &str {
        match provider {
            ProviderKind::OpenAi => &self.openai_api_base_url,
            ProviderKind::Gemini => &self.gemini_api_base_url,
            ProviderKind::DeepSeek => &self.deepseek_api_base_url,
            ProviderKind::Kimi => &self.kimi_api_base_url,
        }
    }

    /// 读取模型目录（配置了 MODELS_FILE 时使用该文件）
    pub fn load_catalog(&self) -> Result<ModelCatalog, ConfigError> {
        match &self.models_file {
            Some(path) => ModelCatalog::load(Path::new(path)),
            None => Ok(ModelCatalog::builtin()),
        }
    }
}

// ========== 模型目录 ==========

/// LLM 供应商
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(alias = "chatgpt")]
    OpenAi,
    Gemini,
    DeepSeek,
    Kimi,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Kimi => "kimi",
        }
    }
}

/// 一个可选模型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// 逻辑模型名（请求中使用）
    pub key: String,
    pub display_name: String,
    pub provider: ProviderKind,
    /// 供应商侧的模型 ID
    pub model_id: String,
    /// 上下文窗口（token）
    pub max_context: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_output_tokens() -> u32 {
    8192
}

impl ModelSpec {
    pub fn new(
        key: &str,
        display_name: &str,
        provider: ProviderKind,
        model_id: &str,
        max_context: usize,
    ) -> Self {
        Self {
            key: key.to_string(),
            display_name: display_name.to_string(),
            provider,
            model_id: model_id.to_string(),
            max_context,
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
        }
    }

    /// 安全阈值：`floor(max_context * ratio)`
    pub fn budget(&self, safety_ratio: f64) -> usize {
        context_budget(self.max_context, safety_ratio)
    }
}

/// `floor(window * ratio)`，比例限制在 (0, 1]
pub fn context_budget(window: usize, safety_ratio: f64) -> usize {
    let ratio = if safety_ratio.is_finite() && safety_ratio > 0.0 {
        safety_ratio.min(1.0)
    } else {
        DEFAULT_SAFETY_RATIO
    };
    ((window as f64) * ratio).floor().max(1.0) as usize
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelSpec>,
}

/// 模型目录（保持声明顺序）
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCatalog {
    models: Vec<ModelSpec>,
}

impl ModelCatalog {
    /// 内置的六个模型
    pub fn builtin() -> Self {
        Self {
            models: vec![
                ModelSpec::new("gemini-pro-2.5", "Gemini 2.5 Pro", ProviderKind::Gemini, "gemini-2.5-pro", 1_000_000),
                ModelSpec::new("gemini-pro-3.0", "Gemini 3.0 Pro", ProviderKind::Gemini, "gemini-3.0-pro", 2_000_000),
                ModelSpec::new("gpt-5.1", "GPT-5.1", ProviderKind::OpenAi, "gpt-5.1-preview", 400_000),
                ModelSpec::new("gpt-4o", "GPT-4o", ProviderKind::OpenAi, "gpt-4o", 128_000),
                ModelSpec::new("deepseek-v3", "DeepSeek V3", ProviderKind::DeepSeek, "deepseek-chat", 64_000),
                ModelSpec::new("kimi-k2", "Kimi K2", ProviderKind::Kimi, "moonshot-v1-128k", 256_000),
            ],
        }
    }

    pub fn empty() -> Self {
        Self { models: Vec::new() }
    }

    /// 解析 TOML 格式的模型目录
    ///
    /// ```toml
    /// [[models]]
    /// key = "deepseek-v3"
    /// display_name = "DeepSeek V3"
    /// provider = "deepseek"
    /// model_id = "deepseek-chat"
    /// max_context = 64000
    /// ```
    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let file: CatalogFile = toml::from_str(content).map_err(|source| ConfigError::TomlParseFailed {
            path: origin.to_string(),
            source,
        })?;
        let mut catalog = Self::empty();
        for spec in file.models {
            catalog.insert(spec);
        }
        Ok(catalog)
    }

    /// 从文件加载模型目录
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// 加入或替换同名模型
    pub fn insert(&mut self, spec: ModelSpec) {
        match self.models.iter_mut().find(|m| m.key == spec.key) {
            Some(existing) => *existing = spec,
            None => self.models.push(spec),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.key == key)
    }

    /// 按逻辑名或供应商模型 ID 查找
    pub fn resolve(&self, name: &str) -> Option<&ModelSpec> {
        self.get(name)
            .or_else(|| self.models.iter().find(|m| m.model_id == name))
    }

    /// 模型的上下文窗口，未知模型为 [`DEFAULT_CONTEXT_WINDOW`]
    pub fn max_context(&self, name: &str) -> usize {
        self.resolve(name)
            .map(|m| m.max_context)
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.iter()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// 已配置 API 密钥的模型
    pub fn available_models(&self, config: &Config) -> Vec<&ModelSpec> {
        self.models
            .iter()
            .filter(|m| config.api_key_for(m.provider).is_some())
            .collect()
    }
}
