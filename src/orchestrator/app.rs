//! 命令行应用 - 编排层
//!
//! ## 职责
//!
//! 1. **应用初始化**：读取模型目录、创建路由器、加载教材到内存存储
//! 2. **任务执行**：对全部顶层章节发起一次生成任务
//! 3. **事件输出**：把进度事件按 SSE 帧写到标准输出
//! 4. **结果保存**：把内存存储整体写成 JSON 快照
//! 5. **全局统计**：输出成功 / 失败章节与条目数

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::sse;
use crate::config::Config;
use crate::infrastructure::{MemoryStore, Storage};
use crate::models::{load_markdown_book, ChapterId, GenerationRequest};
use crate::orchestrator::generation_runner::{GenerationRunner, RunSummary, RunnerSettings};
use crate::orchestrator::run_registry::RunRegistry;
use crate::services::{ProviderRouter, TokenEstimator};
use crate::utils::logging::{log_run_start, log_startup, print_final_stats};

/// 书籍 ID（命令行每次只处理一本书）
const BOOK_ID: u64 = 1;

/// 应用主结构
pub struct App {
    config: Config,
    store: Arc<MemoryStore>,
    runner: Arc<GenerationRunner>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        let catalog = config.load_catalog()?;
        let router = ProviderRouter::from_config(&config, &catalog)?;
        let models = router.models();
        log_startup(&config, &models);
        if router.spec(&config.model).is_none() {
            warn!("⚠️ 模型 {} 未注册或未配置密钥，任务将失败", config.model);
        }

        let store = Arc::new(MemoryStore::new());
        let chapters = load_markdown_book(Path::new(&config.book_path), store.estimator())
            .await
            .with_context(|| format!("加载教材失败: {}", config.book_path))?;
        let ids = store.insert_book(BOOK_ID, chapters);
        info!("✓ 载入 {} 个章节", ids.len());

        let runner = Arc::new(GenerationRunner::new(
            store.clone(),
            Arc::new(router),
            TokenEstimator::default(),
            Arc::new(RunRegistry::new()),
            RunnerSettings::from(&config),
        ));

        Ok(Self { config, store, runner })
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<RunSummary> {
        let chapter_ids: Vec<_> = self
            .store
            .list_chapters(BOOK_ID)
            .await?
            .into_iter()
            .filter(|c| c.parent_id.is_none())
            .map(|c| c.id)
            .collect();
        if chapter_ids.is_empty() {
            anyhow::bail!("教材中没有任何章节: {}", self.config.book_path);
        }

        let request = self.build_request(chapter_ids);
        log_run_start(&request);

        let handle = self.runner.start(request);
        let mut stdout = tokio::io::stdout();
        sse::pipe_events(handle.events, &mut stdout)
            .await
            .context("写出进度事件失败")?;
        let summary = handle.join.await.context("生成任务异常退出")?;

        self.store
            .save_snapshot(Path::new(&self.config.output_file))
            .await
            .with_context(|| format!("保存结果失败: {}", self.config.output_file))?;
        print_final_stats(&summary, &self.config.output_file);
        Ok(summary)
    }

    fn build_request(&self, chapter_ids: Vec<ChapterId>) -> GenerationRequest {
        let mut request = GenerationRequest::new(
            chapter_ids,
            self.config.model.clone(),
            self.config.item_count,
            self.config.mode,
            self.config.kind,
        )
        .with_language(self.config.language.clone());
        if let Some(exercise_type) = &self.config.exercise_type {
            request = request.with_exercise_type(exercise_type.clone());
        }
        request
    }
}
