//! 多智能体生成流程 - 流程层
//!
//! 流程顺序：
//! 1. ANALYZE：分析章节，提取若干知识点上下文
//! 2. GENERATE：按知识点出题
//! 3. REVIEW：分批审核（3 通过 / 2 修订 / 1 丢弃）
//! 4. REFINE：按审核意见修订一次，修订后不再审核
//!
//! 阶段用 [`AgentStage`] 表示，`Refine` 只能进入 `Done`，因此每个条目最多修订一次。
//! 只有 ANALYZE 失败会中止章节；其余阶段的失败只丢弃受影响的条目。

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::clients::GenerateOptions;
use crate::error::{AppError, AppResult, PipelineStage, ValidationError};
use crate::models::{Chapter, ContentKind, ItemDraft, PromptKind};
use crate::services::progress::{ProgressEmitter, ProgressEvent, ProgressScale};
use crate::services::prompt_templates::TemplateSnapshot;
use crate::services::response_parser::{extract_json_array, extract_json_object, parse_drafts, validate_draft};
use crate::services::ProviderRouter;
use crate::workflow::chapter_ctx::ChapterCtx;
use crate::workflow::single_pass::ANY_EXERCISE_TYPE;
use crate::workflow::stage_log::{PipelineRun, StageCounts};

/// 默认每批审核的条目数
pub const DEFAULT_REVIEW_BATCH: usize = 5;

/// 审核需要稳定的打分，温度低于出题
pub const REVIEW_TEMPERATURE: f32 = 0.2;

const REVIEWER_SYSTEM: &str = "你只输出 JSON 数组，不输出任何解释。";

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s
            .split(['、', ',', '，', ';', '；'])
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        Value::Array(values) => values
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        _ => Vec::new(),
    })
}

/// 分析阶段提取的知识点上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionContext {
    #[serde(alias = "Topic")]
    pub topic: String,
    #[serde(alias = "Key_Concepts", default, deserialize_with = "string_or_list")]
    pub key_concepts: Vec<String>,
    #[serde(alias = "Source_Snippet", alias = "source_snippet", default)]
    pub source_excerpt: String,
    #[serde(alias = "Suggested_Question_Type", alias = "suggested_question_type", default)]
    pub suggested_type: Option<String>,
    #[serde(alias = "Potential_Misconceptions", alias = "potential_misconceptions", default, deserialize_with = "string_or_list")]
    pub misconceptions: Vec<String>,
    #[serde(alias = "Pedagogical_Value", alias = "pedagogical_value", default)]
    pub pedagogical_value: Option<String>,
}

/// 审核评分
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReviewScore {
    /// 1：致命问题，丢弃
    Discard = 1,
    /// 2：可修复，进入修订
    NeedsRevision = 2,
    /// 3：合格
    Accept = 3,
}

impl TryFrom<u8> for ReviewScore {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ReviewScore::Discard),
            2 => Ok(ReviewScore::NeedsRevision),
            3 => Ok(ReviewScore::Accept),
            other => Err(ValidationError::InvalidScore(other)),
        }
    }
}

/// 单条审核意见（`item_index` 为批内下标）
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewVerdict {
    pub item_index: usize,
    pub score: ReviewScore,
    pub critique: String,
    pub suggestion: String,
}

/// 待修订条目
#[derive(Debug, Clone, PartialEq)]
pub struct RefineTicket {
    pub draft: ItemDraft,
    pub critique: String,
    pub suggestion: String,
}

/// 最终条目
#[derive(Debug, Clone, PartialEq)]
pub struct FinalItem {
    pub draft: ItemDraft,
    pub review_score: ReviewScore,
    pub refined: bool,
}

/// 流水线阶段
#[derive(Debug, Clone, PartialEq)]
pub enum AgentStage {
    Analyze,
    Generate { contexts: Vec<QuestionContext> },
    Review { drafts: Vec<ItemDraft> },
    Refine { accepted: Vec<ItemDraft>, tickets: Vec<RefineTicket> },
    Done { items: Vec<FinalItem> },
}

impl AgentStage {
    pub fn stage(&self) -> PipelineStage {
        match self {
            AgentStage::Analyze => PipelineStage::Analyze,
            AgentStage::Generate { .. } => PipelineStage::Generate,
            AgentStage::Review { .. } => PipelineStage::Review,
            AgentStage::Refine { .. } => PipelineStage::Refine,
            AgentStage::Done { .. } => PipelineStage::Done,
        }
    }

    /// 该阶段在章节进度中的区间
    fn span(stage: PipelineStage) -> (u8, u8) {
        match stage {
            PipelineStage::Analyze => (0, 15),
            PipelineStage::Generate => (15, 45),
            PipelineStage::Review => (45, 70),
            PipelineStage::Refine => (70, 95),
            PipelineStage::Done => (95, 100),
        }
    }
}

/// 流水线结果
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub items: Vec<FinalItem>,
    pub requested: usize,
    pub counts: StageCounts,
}

impl PipelineOutcome {
    pub fn shortfall(&self) -> usize {
        self.requested.saturating_sub(self.items.len())
    }
}

/// 解析审核结果
fn parse_verdicts(response: &str) -> Result<Vec<Result<ReviewVerdict, ValidationError>>, ValidationError> {
    let as_u64 = |v: Option<&Value>| -> Option<u64> {
        match v? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    };
    let as_text = |v: Option<&Value>| -> String {
        match v {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    };

    Ok(extract_json_array(response)?
        .iter()
        .map(|value| -> Result<ReviewVerdict, ValidationError> {
            let map = value
                .as_object()
                .ok_or_else(|| ValidationError::UnexpectedShape("审核意见不是 JSON 对象".to_string()))?;
            let item_index = as_u64(map.get("item_index"))
                .ok_or_else(|| ValidationError::UnexpectedShape("缺少 item_index".to_string()))?;
            let rating = as_u64(map.get("rating").or_else(|| map.get("score")))
                .ok_or_else(|| ValidationError::UnexpectedShape("缺少 rating".to_string()))?;
            let score = ReviewScore::try_from(u8::try_from(rating).unwrap_or(u8::MAX))?;
            Ok(ReviewVerdict {
                item_index: item_index as usize,
                score,
                critique: as_text(map.get("critique")),
                suggestion: as_text(map.get("suggestion")),
            })
        })
        .collect())
}

/// 修订结果缺少 type / options 时沿用原题
fn merge_refined(original: &ItemDraft, mut refined: serde_json::Map<String, Value>) -> Value {
    if !refined.contains_key("type") {
        if let Some(item_type) = &original.item_type {
            refined.insert("type".to_string(), json!(item_type));
        }
    }
    if !refined.contains_key("options") {
        if let Some(options) = &original.options {
            refined.insert("options".to_string(), json!(options));
        }
    }
    Value::Object(refined)
}

/// 多智能体流水线
pub struct MultiAgentPipeline {
    router: Arc<ProviderRouter>,
    review_batch_size: usize,
}

impl MultiAgentPipeline {
    pub fn new(router: Arc<ProviderRouter>) -> Self {
        Self {
            router,
            review_batch_size: DEFAULT_REVIEW_BATCH,
        }
    }

    pub fn with_review_batch_size(mut self, size: usize) -> Self {
        self.review_batch_size = size.max(1);
        self
    }

    /// 运行完整流水线
    ///
    /// `run` 由调用方持有，失败时也能拿到已产生的审计日志。
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        ctx: &ChapterCtx,
        chapter: &Chapter,
        count: usize,
        templates: &TemplateSnapshot,
        progress: &ProgressEmitter,
        scale: ProgressScale,
        run: &mut PipelineRun,
    ) -> AppResult<PipelineOutcome> {
        let mut stage = AgentStage::Analyze;
        loop {
            ctx.cancel.check()?;
            run.enter(stage.stage());
            let (from, to) = AgentStage::span(stage.stage());
            let stage_scale = scale.sub(from, to);

            stage = match stage {
                AgentStage::Analyze => {
                    let contexts = self.analyze(ctx, chapter, templates, progress, stage_scale, run).await?;
                    AgentStage::Generate { contexts }
                }
                AgentStage::Generate { contexts } => {
                    let drafts = self
                        .generate(ctx, &contexts, count, templates, progress, stage_scale, run)
                        .await?;
                    AgentStage::Review { drafts }
                }
                AgentStage::Review { drafts } => {
                    let (accepted, tickets) = self.review(ctx, drafts, templates, progress, stage_scale, run).await?;
                    AgentStage::Refine { accepted, tickets }
                }
                AgentStage::Refine { accepted, tickets } => {
                    let items = self
                        .refine(ctx, accepted, tickets, templates, progress, stage_scale, run)
                        .await?;
                    AgentStage::Done { items }
                }
                AgentStage::Done { items } => {
                    info!(
                        "{} ✅ 流水线完成: 最终 {} 个条目 (通过 {}, 修订 {}, 审核丢弃 {}, 无效 {})",
                        ctx,
                        items.len(),
                        run.counts.accepted,
                        run.counts.refined,
                        run.counts.dropped_by_review,
                        run.counts.dropped_invalid
                    );
                    return Ok(PipelineOutcome {
                        items,
                        requested: count,
                        counts: run.counts,
                    });
                }
            };
        }
    }

    fn emit(&self, ctx: &ChapterCtx, progress: &ProgressEmitter, scale: ProgressScale, local: u8, stage: PipelineStage, message: String) {
        progress.emit(
            ProgressEvent::status(scale.map(local), message)
                .with_stage(stage.as_str())
                .with_chapter(ctx.chapter_id),
        );
    }

    /// 单个条目的完成事件
    #[allow(clippy::too_many_arguments)]
    fn emit_item(
        &self,
        ctx: &ChapterCtx,
        progress: &ProgressEmitter,
        scale: ProgressScale,
        local: u8,
        stage: PipelineStage,
        index: usize,
        message: String,
    ) {
        progress.emit(
            ProgressEvent::status(scale.map(local), message)
                .with_stage(stage.as_str())
                .with_chapter(ctx.chapter_id)
                .with_item(index),
        );
    }

    fn fraction(done: usize, total: usize) -> u8 {
        if total == 0 {
            100
        } else {
            (done * 100 / total).min(100) as u8
        }
    }

    /// ANALYZE：失败或没有任何上下文时中止本章节
    async fn analyze(
        &self,
        ctx: &ChapterCtx,
        chapter: &Chapter,
        templates: &TemplateSnapshot,
        progress: &ProgressEmitter,
        scale: ProgressScale,
        run: &mut PipelineRun,
    ) -> AppResult<Vec<QuestionContext>> {
        let stage = PipelineStage::Analyze;
        info!("{} 🔍 [A] 分析章节《{}》", ctx, chapter.title);
        self.emit(ctx, progress, scale, 0, stage, format!("《{}》分析章节内容", chapter.title));

        let prompt = templates.render(
            PromptKind::Analyzer,
            &[
                ("chapter_content", chapter.content_md.as_str()),
                ("target_language", ctx.language.as_str()),
            ],
        )?;

        let response = self.router.generate(&ctx.model, &prompt, None).await.map_err(|e| {
            error!("{} ❌ 分析阶段模型调用失败: {}", ctx, e);
            AppError::stage_failed(ctx.chapter_id, stage, e.to_string())
        })?;
        ctx.cancel.check()?;
        run.record("analysis", &prompt, &response);

        let values = extract_json_array(&response)
            .map_err(|e| AppError::stage_failed(ctx.chapter_id, stage, e.to_string()))?;
        let contexts: Vec<QuestionContext> = values
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<QuestionContext>(value) {
                Ok(context) if !context.topic.trim().is_empty() => Some(context),
                Ok(_) => None,
                Err(e) => {
                    warn!("{} ⚠️ 忽略无法解析的知识点: {}", ctx, e);
                    None
                }
            })
            .collect();

        if contexts.is_empty() {
            return Err(AppError::stage_failed(ctx.chapter_id, stage, "没有提取到任何知识点"));
        }

        run.counts.contexts = contexts.len();
        info!("{} ✓ 提取到 {} 个知识点", ctx, contexts.len());
        self.emit(ctx, progress, scale, 100, stage, format!("提取到 {} 个知识点", contexts.len()));
        Ok(contexts)
    }

    /// GENERATE：每个知识点出 `ceil(count / 知识点数)` 道题，达到 `count` 即停止
    #[allow(clippy::too_many_arguments)]
    async fn generate(
        &self,
        ctx: &ChapterCtx,
        contexts: &[QuestionContext],
        count: usize,
        templates: &TemplateSnapshot,
        progress: &ProgressEmitter,
        scale: ProgressScale,
        run: &mut PipelineRun,
    ) -> AppResult<Vec<ItemDraft>> {
        let stage = PipelineStage::Generate;
        let per_context = count.div_ceil(contexts.len()).max(1);
        let template = PromptKind::generator(ctx.kind);
        let mut drafts: Vec<ItemDraft> = Vec::with_capacity(count);

        for (i, context) in contexts.iter().enumerate() {
            if drafts.len() >= count {
                break;
            }
            ctx.cancel.check()?;

            let want = per_context.min(count - drafts.len());
            let want_text = want.to_string();
            let concepts = context.key_concepts.join("、");
            let misconceptions = context.misconceptions.join("；");
            let exercise_type = match ctx.kind {
                ContentKind::Exercise => ctx
                    .exercise_type
                    .as_deref()
                    .or(context.suggested_type.as_deref())
                    .unwrap_or(ANY_EXERCISE_TYPE),
                ContentKind::Qa => "choice",
            };
            let prompt = templates.render(
                template,
                &[
                    ("topic", context.topic.as_str()),
                    ("concepts", concepts.as_str()),
                    ("misconceptions", misconceptions.as_str()),
                    ("source_text", context.source_excerpt.as_str()),
                    ("count", want_text.as_str()),
                    ("exercise_type", exercise_type),
                    ("target_language", ctx.language.as_str()),
                ],
            )?;

            info!("{} ✍️ [B] 知识点 {}/{}「{}」出题 {} 道", ctx, i + 1, contexts.len(), context.topic, want);
            let response = match self.router.generate(&ctx.model, &prompt, None).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("{} ⚠️ 知识点「{}」出题失败，跳过: {}", ctx, context.topic, e);
                    continue;
                }
            };
            ctx.cancel.check()?;
            run.record(format!("context {}", i + 1), &prompt, &response);

            match parse_drafts(&response, ctx.kind) {
                Ok((mut parsed, rejected)) => {
                    run.counts.dropped_invalid += rejected.len();
                    for reason in &rejected {
                        warn!("{} ⚠️ 丢弃不合法条目: {}", ctx, reason);
                    }
                    parsed.truncate(want);
                    drafts.extend(parsed);
                }
                Err(e) => warn!("{} ⚠️ 知识点「{}」的输出无法解析: {}", ctx, context.topic, e),
            }

            self.emit(
                ctx,
                progress,
                scale,
                Self::fraction(i + 1, contexts.len()),
                stage,
                format!("已生成 {}/{} 个草稿", drafts.len(), count),
            );
        }

        drafts.truncate(count);
        run.counts.drafts = drafts.len();
        info!("{} ✓ 共生成 {} 个草稿", ctx, drafts.len());
        Ok(drafts)
    }

    /// REVIEW：按批审核，批内下标映射回全局下标
    async fn review(
        &self,
        ctx: &ChapterCtx,
        drafts: Vec<ItemDraft>,
        templates: &TemplateSnapshot,
        progress: &ProgressEmitter,
        scale: ProgressScale,
        run: &mut PipelineRun,
    ) -> AppResult<(Vec<ItemDraft>, Vec<RefineTicket>)> {
        let stage = PipelineStage::Review;
        let mut accepted = Vec::new();
        let mut tickets = Vec::new();
        let batches: Vec<&[ItemDraft]> = drafts.chunks(self.review_batch_size).collect();
        let total_batches = batches.len();
        let review_options = GenerateOptions::default()
            .with_system(REVIEWER_SYSTEM)
            .with_temperature(REVIEW_TEMPERATURE);

        for (batch_no, batch) in batches.into_iter().enumerate() {
            ctx.cancel.check()?;
            let offset = batch_no * self.review_batch_size;

            let items_json: Vec<Value> = batch
                .iter()
                .enumerate()
                .map(|(local, draft)| {
                    let mut value = json!(draft);
                    if let Value::Object(map) = &mut value {
                        map.insert("item_index".to_string(), json!(local));
                    }
                    value
                })
                .collect();
            let items_json = serde_json::to_string_pretty(&items_json).unwrap_or_default();
            let prompt = templates.render(
                PromptKind::Reviewer,
                &[
                    ("items_json", items_json.as_str()),
                    ("target_language", ctx.language.as_str()),
                ],
            )?;

            info!("{} 🧐 [C] 审核第 {}/{} 批 ({} 个条目)", ctx, batch_no + 1, total_batches, batch.len());
            let response = match self.router.generate(&ctx.model, &prompt, Some(&review_options)).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("{} ⚠️ 第 {} 批审核失败，丢弃 {} 个条目: {}", ctx, batch_no + 1, batch.len(), e);
                    run.counts.dropped_invalid += batch.len();
                    for global in offset..offset + batch.len() {
                        self.emit_item(
                            ctx,
                            progress,
                            scale,
                            Self::fraction(global + 1, drafts.len()),
                            stage,
                            global,
                            format!("条目 {}/{} 审核失败，丢弃", global + 1, drafts.len()),
                        );
                    }
                    continue;
                }
            };
            ctx.cancel.check()?;
            run.record(format!("batch {}", batch_no + 1), &prompt, &response);

            let mut verdicts: HashMap<usize, ReviewVerdict> = HashMap::new();
            match parse_verdicts(&response) {
                Ok(parsed) => {
                    for verdict in parsed {
                        match verdict {
                            Ok(v) if v.item_index < batch.len() => {
                                verdicts.entry(v.item_index).or_insert(v);
                            }
                            Ok(v) => warn!("{} ⚠️ 审核下标 {} 超出本批范围", ctx, v.item_index),
                            Err(e) => warn!("{} ⚠️ 忽略无效审核意见: {}", ctx, e),
                        }
                    }
                }
                Err(e) => warn!("{} ⚠️ 第 {} 批审核结果无法解析: {}", ctx, batch_no + 1, e),
            }

            for (local, draft) in batch.iter().enumerate() {
                let global = offset + local;
                let decision = match verdicts.remove(&local) {
                    Some(v) if v.score == ReviewScore::Accept => {
                        accepted.push(draft.clone());
                        "通过"
                    }
                    Some(v) if v.score == ReviewScore::NeedsRevision => {
                        tickets.push(RefineTicket {
                            draft: draft.clone(),
                            critique: v.critique,
                            suggestion: v.suggestion,
                        });
                        "待修订"
                    }
                    Some(v) => {
                        debug!("{} 条目 {} 评分 1，丢弃: {}", ctx, global, v.critique);
                        run.counts.dropped_by_review += 1;
                        "丢弃"
                    }
                    None => {
                        warn!("{} ⚠️ 条目 {} 没有审核结果，丢弃", ctx, global);
                        run.counts.dropped_invalid += 1;
                        "丢弃"
                    }
                };
                self.emit_item(
                    ctx,
                    progress,
                    scale,
                    Self::fraction(global + 1, drafts.len()),
                    stage,
                    global,
                    format!("条目 {}/{} 审核{}", global + 1, drafts.len(), decision),
                );
            }
        }

        run.counts.accepted = accepted.len();
        info!("{} ✓ 审核结果: 通过 {}，待修订 {}", ctx, accepted.len(), tickets.len());
        Ok((accepted, tickets))
    }

    /// REFINE：每张工单修订一次，修订结果不再审核
    #[allow(clippy::too_many_arguments)]
    async fn refine(
        &self,
        ctx: &ChapterCtx,
        accepted: Vec<ItemDraft>,
        tickets: Vec<RefineTicket>,
        templates: &TemplateSnapshot,
        progress: &ProgressEmitter,
        scale: ProgressScale,
        run: &mut PipelineRun,
    ) -> AppResult<Vec<FinalItem>> {
        let stage = PipelineStage::Refine;
        let mut items: Vec<FinalItem> = accepted
            .into_iter()
            .map(|draft| FinalItem {
                draft,
                review_score: ReviewScore::Accept,
                refined: false,
            })
            .collect();
        let total = tickets.len();

        for (i, ticket) in tickets.into_iter().enumerate() {
            ctx.cancel.check()?;
            let original = serde_json::to_string_pretty(&ticket.draft).unwrap_or_default();
            let prompt = templates.render(
                PromptKind::Refiner,
                &[
                    ("original_item", original.as_str()),
                    ("critique", ticket.critique.as_str()),
                    ("suggestion", ticket.suggestion.as_str()),
                    ("target_language", ctx.language.as_str()),
                ],
            )?;

            info!("{} 🛠️ [D] 修订条目 {}/{}", ctx, i + 1, total);
            let refined = match self.router.generate(&ctx.model, &prompt, None).await {
                Ok(response) => {
                    ctx.cancel.check()?;
                    run.record(format!("item {}", i + 1), &prompt, &response);
                    extract_json_object(&response)
                        .and_then(|map| validate_draft(&merge_refined(&ticket.draft, map), ctx.kind))
                        .map_err(|e| e.to_string())
                }
                Err(e) => Err(e.to_string()),
            };

            match refined {
                Ok(draft) => {
                    run.counts.refined += 1;
                    items.push(FinalItem {
                        draft,
                        review_score: ReviewScore::NeedsRevision,
                        refined: true,
                    });
                }
                Err(reason) => {
                    warn!("{} ⚠️ 条目修订失败，丢弃: {}", ctx, reason);
                    run.counts.dropped_invalid += 1;
                }
            }

            self.emit_item(
                ctx,
                progress,
                scale,
                Self::fraction(i + 1, total),
                stage,
                i,
                format!("修订完成 {}/{}", i + 1, total),
            );
        }

        Ok(items)
    }
}
