//! # Textbook Corpus
//!
//! 把教材章节转换为问答对和练习题的生成核心
//!
//! ## 架构设计
//!
//! 本系统采用四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 存储接口与内存实现
//! - `clients/` - 各家模型的调用适配（OpenAI 兼容、Gemini、脚本化测试桩）
//!
//! ### ② 业务能力层（Services）
//! - `TokenEstimator` - 按模型家族估算 token 数
//! - `ChunkSplitter` - 按标题 / 段落 / 句子把超长文本切成预算内的片段
//! - `ProviderRouter` - 逻辑模型名 → 供应商，带超时与重试
//! - `TemplateStore` - 带版本的提示词模板
//! - `ProgressEmitter` - 有界、有序、恰好一个终止事件的进度通道
//!
//! ### ③ 流程层（Workflow）
//! - `SinglePassGenerator` - 单次调用生成
//! - `MultiAgentPipeline` - 分析 → 生成 → 审核 → 修订
//!
//! ### ④ 编排层（Orchestration）
//! - `GenerationRunner` - 按顺序处理一次请求中的所有章节
//! - `RunRegistry` - 任务状态与取消
//! - `App` - 命令行入口
//!
//! ## 模块结构

pub mod api;
pub mod clients;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::{Config, ModelCatalog, ModelSpec, ProviderKind};
pub use error::{AppError, AppResult};
pub use infrastructure::{MemoryStore, Storage};
pub use models::{Chapter, ChapterId, ContentKind, GeneratedItem, GenerationMode, GenerationRequest};
pub use orchestrator::{App, GenerationRunner, RunRegistry, RunSummary};
pub use services::{ChunkSplitter, ProviderRouter, TokenEstimator};
pub use workflow::{MultiAgentPipeline, SinglePassGenerator};
