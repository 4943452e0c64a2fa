//! 生成任务执行器 - 编排层
//!
//! ## 职责
//!
//! 执行一次 `GenerationRequest`：
//! 1. 校验请求、确认模型已注册
//! 2. 在任务开始时固定模板快照（之后模板的修改不影响本任务）
//! 3. 预检所有章节的 token 预算：超限的章节自动拆分或直接拒绝，都发生在任何模型调用之前
//! 4. 按顺序逐个处理章节，一次只有一个模型调用
//! 5. 保存条目和审计日志，最后发出唯一的终止事件
//!
//! 单个章节失败不会中止整个任务，成功 / 失败数量如实上报。

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, DEFAULT_SAFETY_RATIO};
use crate::error::{AppError, AppResult, ProviderError, ProviderErrorKind, ValidationError};
use crate::infrastructure::Storage;
use crate::models::{Chapter, ChapterId, GeneratedItem, GenerationMode, GenerationRequest, PromptKind};
use crate::orchestrator::run_registry::RunRegistry;
use crate::services::chapter_service::ChapterService;
use crate::services::chunk_splitter::ChunkSplitter;
use crate::services::token_estimator::TokenEstimator;
use crate::services::progress::{progress_channel, ProgressEmitter, ProgressEvent, ProgressReceiver, ProgressScale};
use crate::services::prompt_templates::TemplateSnapshot;
use crate::services::ProviderRouter;
use crate::workflow::chapter_ctx::{CancelFlag, ChapterCtx, RunId};
use crate::workflow::multi_agent::{MultiAgentPipeline, DEFAULT_REVIEW_BATCH};
use crate::workflow::single_pass::SinglePassGenerator;
use crate::workflow::stage_log::PipelineRun;

/// 执行器参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunnerSettings {
    pub safety_ratio: f64,
    /// 超限章节是否自动拆分；否则拒绝该章节
    pub auto_split: bool,
    pub progress_buffer: usize,
    pub review_batch_size: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            safety_ratio: DEFAULT_SAFETY_RATIO,
            auto_split: false,
            progress_buffer: 64,
            review_batch_size: DEFAULT_REVIEW_BATCH,
        }
    }
}

impl From<&Config> for RunnerSettings {
    fn from(config: &Config) -> Self {
        Self {
            safety_ratio: config.safety_ratio,
            auto_split: config.auto_split,
            progress_buffer: config.progress_buffer,
            review_batch_size: config.review_batch_size,
        }
    }
}

/// 单个章节的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterReport {
    pub chapter_id: ChapterId,
    pub title: String,
    pub requested: usize,
    pub saved: usize,
    /// 失败原因（成功时为 None）
    pub error: Option<String>,
}

impl ChapterReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// 一次任务的汇总
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub chapters: Vec<ChapterReport>,
    pub cancelled: bool,
    /// 请求本身失败时的原因（没有处理任何章节）
    pub error: Option<String>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.chapters.iter().filter(|c| c.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.chapters.len() - self.succeeded()
    }

    pub fn saved_items(&self) -> usize {
        self.chapters.iter().map(|c| c.saved).sum()
    }
}

/// 已启动的任务
pub struct RunHandle {
    pub run_id: RunId,
    pub events: ProgressReceiver,
    pub join: JoinHandle<RunSummary>,
}

/// 生成任务执行器
pub struct GenerationRunner {
    storage: Arc<dyn Storage>,
    router: Arc<ProviderRouter>,
    chapters: ChapterService,
    registry: Arc<RunRegistry>,
    settings: RunnerSettings,
}

impl GenerationRunner {
    pub fn new(
        storage: Arc<dyn Storage>,
        router: Arc<ProviderRouter>,
        estimator: TokenEstimator,
        registry: Arc<RunRegistry>,
        settings: RunnerSettings,
    ) -> Self {
        let splitter = ChunkSplitter::new(estimator, Arc::new(router.catalog()));
        Self {
            chapters: ChapterService::new(storage.clone(), splitter),
            storage,
            router,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// 在后台任务中执行请求，立即返回事件流
    pub fn start(self: &Arc<Self>, request: GenerationRequest) -> RunHandle {
        let (run_id, cancel) = self.registry.register(request.clone());
        let (emitter, events) = progress_channel(self.settings.progress_buffer);
        let runner = Arc::clone(self);
        let join = tokio::spawn(async move { runner.execute(run_id, cancel, request, emitter).await });
        RunHandle { run_id, events, join }
    }

    /// 在当前任务中执行请求
    pub async fn execute(
        &self,
        run_id: RunId,
        cancel: CancelFlag,
        request: GenerationRequest,
        progress: ProgressEmitter,
    ) -> RunSummary {
        let mut summary = RunSummary {
            run_id,
            chapters: Vec::new(),
            cancelled: false,
            error: None,
        };

        let plan = match self.prepare(run_id, &request, &progress, &mut summary).await {
            Ok(plan) => plan,
            Err(e) => {
                let reason = e.to_string();
                error!("[任务 {}] ❌ 任务无法开始: {}", run_id.short(), reason);
                self.publish(run_id, &progress, ProgressEvent::error(format!("任务失败: {}", reason), 0, summary.failed()));
                summary.error = Some(reason);
                return summary;
            }
        };

        let total = plan.chapters.len();
        info!(
            "[任务 {}] 🚀 开始生成: {} 个章节, 模型 {}, 模式 {}, 类别 {}, 每章 {} 个",
            run_id.short(),
            total,
            request.model,
            request.mode,
            request.kind,
            request.count
        );

        for (position, chapter) in plan.chapters.iter().enumerate() {
            let ctx = ChapterCtx {
                run_id,
                chapter_id: chapter.id,
                title: chapter.title.clone(),
                position,
                total,
                model: request.model.clone(),
                kind: request.kind,
                exercise_type: request.exercise_type.clone(),
                language: request.language().to_string(),
                cancel: cancel.clone(),
            };
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let scale = ProgressScale::for_chapter(position, total);
            self.publish(
                run_id,
                &progress,
                ProgressEvent::status(scale.map(0), format!("开始处理章节 {}/{}《{}》", position + 1, total, chapter.title))
                    .with_chapter(chapter.id),
            );

            let result = self
                .process_chapter(&ctx, chapter, &request, &plan.templates, &progress, scale)
                .await;
            let report = match result {
                Ok(saved) => {
                    info!("{} ✅ 保存 {} 个条目", ctx, saved);
                    ChapterReport {
                        chapter_id: chapter.id,
                        title: chapter.title.clone(),
                        requested: request.count,
                        saved,
                        error: None,
                    }
                }
                Err(AppError::Cancelled) => {
                    warn!("{} 🛑 任务已取消", ctx);
                    summary.cancelled = true;
                    break;
                }
                Err(e) => {
                    error!("{} ❌ 章节处理失败: {}", ctx, e);
                    ChapterReport {
                        chapter_id: chapter.id,
                        title: chapter.title.clone(),
                        requested: request.count,
                        saved: 0,
                        error: Some(e.to_string()),
                    }
                }
            };

            let message = match &report.error {
                None => format!("《{}》完成，保存 {} 个条目", report.title, report.saved),
                Some(reason) => format!("《{}》失败: {}", report.title, reason),
            };
            summary.chapters.push(report);
            self.publish(
                run_id,
                &progress,
                ProgressEvent::status(scale.map(100), message)
                    .with_chapter(chapter.id)
                    .with_counts(summary.succeeded(), summary.failed()),
            );
        }

        self.finish(run_id, &progress, &summary);
        summary
    }

    /// 校验请求、固定模板并完成预算预检
    async fn prepare(
        &self,
        run_id: RunId,
        request: &GenerationRequest,
        progress: &ProgressEmitter,
        summary: &mut RunSummary,
    ) -> AppResult<RunPlan> {
        request.validate()?;
        if self.router.spec(&request.model).is_none() {
            return Err(ProviderError::new(ProviderErrorKind::UnknownModel, &request.model, "模型未注册").into());
        }

        let mut templates = self.storage.template_snapshot().await?;
        if let Some(body) = &request.custom_template {
            templates = templates.with_override(PromptKind::single_pass(request.kind), body.clone());
        }

        let mut chapters = Vec::with_capacity(request.chapter_ids.len());
        for &chapter_id in &request.chapter_ids {
            let chapter = match self.storage.get_chapter(chapter_id).await {
                Ok(chapter) => chapter,
                Err(err) => {
                    self.reject(run_id, progress, summary, chapter_id, String::new(), request.count, err.to_string());
                    continue;
                }
            };
            match self
                .chapters
                .ensure_within_budget(&chapter, &request.model, self.settings.safety_ratio)
            {
                Ok(()) => chapters.push(chapter),
                Err(_) if self.settings.auto_split => {
                    let parts = match self
                        .chapters
                        .split_chapter(chapter_id, &request.model, self.settings.safety_ratio)
                        .await
                    {
                        Ok(parts) => parts,
                        Err(err) => {
                            let reason = format!("拆分失败: {}", err);
                            self.reject(run_id, progress, summary, chapter_id, chapter.title.clone(), request.count, reason);
                            continue;
                        }
                    };
                    self.publish(
                        run_id,
                        progress,
                        ProgressEvent::status(0, format!("《{}》超出预算，已拆分为 {} 部分", chapter.title, parts.len()))
                            .with_chapter(chapter_id)
                            .with_stage("split"),
                    );
                    chapters.extend(parts);
                }
                Err(err) => {
                    self.reject(run_id, progress, summary, chapter_id, chapter.title.clone(), request.count, err.to_string());
                }
            }
        }

        if chapters.is_empty() {
            let reason = summary
                .chapters
                .last()
                .and_then(|c| c.error.clone())
                .unwrap_or_else(|| "没有可处理的章节".to_string());
            return Err(ValidationError::InvalidRequest(reason).into());
        }

        Ok(RunPlan { templates, chapters })
    }

    /// 预检阶段淘汰的章节记为失败，不影响其余章节
    #[allow(clippy::too_many_arguments)]
    fn reject(
        &self,
        run_id: RunId,
        progress: &ProgressEmitter,
        summary: &mut RunSummary,
        chapter_id: ChapterId,
        title: String,
        requested: usize,
        reason: String,
    ) {
        warn!("[任务 {}] ⚠️ 章节 {} 被拒绝: {}", run_id.short(), chapter_id, reason);
        let label = if title.is_empty() { chapter_id.to_string() } else { title.clone() };
        self.publish(
            run_id,
            progress,
            ProgressEvent::status(0, format!("《{}》被拒绝: {}", label, reason))
                .with_chapter(chapter_id)
                .with_counts(summary.succeeded(), summary.failed() + 1),
        );
        summary.chapters.push(ChapterReport {
            chapter_id,
            title,
            requested,
            saved: 0,
            error: Some(reason),
        });
    }

    /// 处理单个章节，返回保存的条目数
    async fn process_chapter(
        &self,
        ctx: &ChapterCtx,
        chapter: &Chapter,
        request: &GenerationRequest,
        templates: &TemplateSnapshot,
        progress: &ProgressEmitter,
        scale: ProgressScale,
    ) -> AppResult<usize> {
        let drafts = match request.mode {
            GenerationMode::Standard => {
                let generator = SinglePassGenerator::new(self.router.clone());
                let outcome = generator
                    .generate(ctx, chapter, request.count, templates, progress, scale)
                    .await?;
                outcome
                    .drafts
                    .into_iter()
                    .map(|draft| (draft, false))
                    .collect::<Vec<_>>()
            }
            GenerationMode::MultiAgent => {
                let pipeline =
                    MultiAgentPipeline::new(self.router.clone()).with_review_batch_size(self.settings.review_batch_size);
                let mut run = PipelineRun::new(ctx.run_id, ctx.chapter_id, &ctx.model);
                let result = pipeline
                    .run(ctx, chapter, request.count, templates, progress, scale, &mut run)
                    .await;
                if let Err(e) = self.storage.save_stage_logs(run.into_logs()).await {
                    warn!("{} ⚠️ 保存审计日志失败: {}", ctx, e);
                }
                result?
                    .items
                    .into_iter()
                    .map(|item| (item.draft, item.refined))
                    .collect()
            }
        };

        ctx.cancel.check()?;
        if drafts.is_empty() {
            return Err(ValidationError::InvalidRequest("没有得到任何有效条目".to_string()).into());
        }

        let items: Vec<GeneratedItem> = drafts
            .into_iter()
            .map(|(draft, refined)| {
                GeneratedItem::from_draft(draft, chapter.id, request.kind, &request.model, request.mode, refined)
            })
            .collect();
        let ids = self.storage.save_items(items).await?;
        Ok(ids.len())
    }

    fn finish(&self, run_id: RunId, progress: &ProgressEmitter, summary: &RunSummary) {
        let (succeeded, failed) = (summary.succeeded(), summary.failed());
        let event = if summary.cancelled {
            ProgressEvent::error(
                format!("任务已取消（已完成 {} 个章节，失败 {} 个）", succeeded, failed),
                succeeded,
                failed,
            )
        } else if succeeded > 0 {
            ProgressEvent::complete(
                format!(
                    "生成完成: 成功 {} 个章节，失败 {} 个，共保存 {} 个条目",
                    succeeded,
                    failed,
                    summary.saved_items()
                ),
                succeeded,
                failed,
            )
        } else {
            let reason = summary
                .chapters
                .iter()
                .rev()
                .find_map(|c| c.error.clone())
                .unwrap_or_else(|| "没有处理任何章节".to_string());
            ProgressEvent::error(format!("全部 {} 个章节失败，最后一个原因: {}", failed, reason), succeeded, failed)
        };
        self.publish(run_id, progress, event);
    }

    /// 同时更新登记表和进度通道
    fn publish(&self, run_id: RunId, progress: &ProgressEmitter, event: ProgressEvent) {
        self.registry.observe(run_id, &event);
        progress.emit(event);
    }
}

struct RunPlan {
    templates: TemplateSnapshot,
    chapters: Vec<Chapter>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ScriptedProvider, ScriptedReply};
    use crate::config::{ModelSpec, ProviderKind};
    use crate::infrastructure::MemoryStore;
    use crate::models::{ContentKind, NewChapter};
    use crate::orchestrator::run_registry::RunStatus;
    use crate::services::token_estimator::TokenEstimator;
    use crate::services::{EventType, RetryPolicy};
    use std::time::Duration;

    fn runner(store: Arc<MemoryStore>, provider: Arc<ScriptedProvider>, settings: RunnerSettings) -> Arc<GenerationRunner> {
        let mut router = ProviderRouter::new(RetryPolicy::default(), Duration::from_secs(5));
        router.register(
            ModelSpec::new("deepseek-v3", "DeepSeek V3", ProviderKind::DeepSeek, "deepseek-chat", 64_000),
            provider,
        );
        Arc::new(GenerationRunner::new(
            store,
            Arc::new(router),
            TokenEstimator::default(),
            Arc::new(RunRegistry::new()),
            settings,
        ))
    }

    fn chapter(title: &str, content: &str) -> NewChapter {
        NewChapter {
            title: title.to_string(),
            content_md: content.to_string(),
            token_count: 0,
            level: 1,
        }
    }

    #[tokio::test]
    async fn test_standard_run_saves_items_and_completes() {
        let store = Arc::new(MemoryStore::new());
        let ids = store.insert_book(1, vec![chapter("集合", "集合是确定对象的全体。")]);
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedReply::text(
            r#"[{"question": "什么是集合？", "answer": "确定对象的全体"}]"#,
        )]));
        let runner = runner(store.clone(), provider, RunnerSettings::default());

        let request = GenerationRequest::new(ids.clone(), "deepseek-v3", 1, GenerationMode::Standard, ContentKind::Qa);
        let mut handle = runner.start(request);
        let mut last = None;
        while let Some(event) = handle.events.recv().await {
            last = Some(event);
        }
        let summary = handle.join.await.unwrap();

        let last = last.unwrap();
        assert_eq!(last.event_type, EventType::Complete);
        assert_eq!(last.progress, 100);
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(store.list_items(ids[0]).await.unwrap().len(), 1);
        assert_eq!(runner.registry().get(handle.run_id).unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_model_fails_before_any_call() {
        let store = Arc::new(MemoryStore::new());
        let ids = store.insert_book(1, vec![chapter("集合", "内容")]);
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let runner = runner(store, provider.clone(), RunnerSettings::default());

        let (emitter, mut events) = progress_channel(8);
        let request = GenerationRequest::new(ids, "no-such-model", 1, GenerationMode::Standard, ContentKind::Qa);
        let summary = runner.execute(RunId::new(), CancelFlag::new(), request, emitter).await;

        assert!(summary.error.unwrap().contains("UNKNOWN_MODEL"));
        assert_eq!(events.recv().await.unwrap().event_type, EventType::Error);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_chapter_rejected_without_auto_split() {
        let store = Arc::new(MemoryStore::new());
        let huge = "极限描述变量无限接近某个值时的趋势。".repeat(4000);
        let ids = store.insert_book(1, vec![chapter("大章", &huge)]);
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let settings = RunnerSettings {
            safety_ratio: 0.1,
            ..RunnerSettings::default()
        };
        let runner = runner(store, provider.clone(), settings);

        let (emitter, _events) = progress_channel(8);
        let request = GenerationRequest::new(ids, "deepseek-v3", 1, GenerationMode::Standard, ContentKind::Qa);
        let summary = runner.execute(RunId::new(), CancelFlag::new(), request, emitter).await;

        assert_eq!(summary.failed(), 1);
        assert!(summary.error.is_some());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_budget_uses_window_of_registered_model() {
        // 不在内置目录中的小窗口模型：按注册时的 4000 计算阈值
        let store = Arc::new(MemoryStore::new());
        let text = "极限描述变量无限接近某个值时的趋势。".repeat(400);
        let ids = store.insert_book(1, vec![chapter("中章", &text)]);
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let mut router = ProviderRouter::new(RetryPolicy::default(), Duration::from_secs(5));
        router.register(
            ModelSpec::new("local-small", "Local Small", ProviderKind::OpenAi, "local-small", 4_000),
            provider.clone(),
        );
        let router = Arc::new(router);
        assert_eq!(router.max_context("local-small"), Some(4_000));
        assert_eq!(router.catalog().max_context("local-small"), 4_000);
        let runner = GenerationRunner::new(
            store,
            router,
            TokenEstimator::default(),
            Arc::new(RunRegistry::new()),
            RunnerSettings::default(),
        );

        let (emitter, _events) = progress_channel(8);
        let request = GenerationRequest::new(ids, "local-small", 1, GenerationMode::Standard, ContentKind::Qa);
        let summary = runner.execute(RunId::new(), CancelFlag::new(), request, emitter).await;

        assert_eq!(summary.failed(), 1);
        assert!(summary.chapters[0].error.as_deref().unwrap().contains("3200"));
        assert_eq!(provider.call_count(), 0);
    }
}
