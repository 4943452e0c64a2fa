//! 单次生成流程 - 流程层
//!
//! 流程顺序：
//! 1. 渲染模板（请求中的自定义模板优先）
//! 2. 调用一次模型
//! 3. 解析 JSON 数组并逐条校验，不合法的条目丢弃
//! 4. 截断到请求数量；数量不足时如实报告，不补齐

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::AppResult;
use crate::models::{Chapter, ContentKind, ItemDraft, PromptKind};
use crate::services::progress::{ProgressEmitter, ProgressEvent, ProgressScale};
use crate::services::prompt_templates::TemplateSnapshot;
use crate::services::response_parser::parse_drafts;
use crate::services::ProviderRouter;
use crate::utils::logging::truncate_text;
use crate::workflow::chapter_ctx::ChapterCtx;

/// 未指定题型时填入模板的说明
pub const ANY_EXERCISE_TYPE: &str = "不限（选择题、填空题、解答题均可）";

/// 单次生成结果
#[derive(Debug, Clone, PartialEq)]
pub struct SinglePassOutcome {
    pub drafts: Vec<ItemDraft>,
    pub requested: usize,
    /// 校验失败被丢弃的条目数
    pub rejected: usize,
}

impl SinglePassOutcome {
    /// 比请求数量少了多少
    pub fn shortfall(&self) -> usize {
        self.requested.saturating_sub(self.drafts.len())
    }
}

/// 单次生成器
pub struct SinglePassGenerator {
    router: Arc<ProviderRouter>,
}

impl SinglePassGenerator {
    pub fn new(router: Arc<ProviderRouter>) -> Self {
        Self { router }
    }

    pub async fn generate(
        &self,
        ctx: &ChapterCtx,
        chapter: &Chapter,
        count: usize,
        templates: &TemplateSnapshot,
        progress: &ProgressEmitter,
        scale: ProgressScale,
    ) -> AppResult<SinglePassOutcome> {
        ctx.cancel.check()?;

        let count_text = count.to_string();
        let exercise_type = match ctx.kind {
            ContentKind::Exercise => ctx.exercise_type.as_deref().unwrap_or(ANY_EXERCISE_TYPE),
            ContentKind::Qa => "",
        };
        let prompt = templates.render(
            PromptKind::single_pass(ctx.kind),
            &[
                ("chapter_title", chapter.title.as_str()),
                ("chapter_content", chapter.content_md.as_str()),
                ("count", count_text.as_str()),
                ("target_language", ctx.language.as_str()),
                ("exercise_type", exercise_type),
            ],
        )?;

        info!("{} 🤖 调用模型 {} 生成 {} 个{}条目", ctx, ctx.model, count, ctx.kind);
        progress.emit(
            ProgressEvent::status(scale.map(10), format!("《{}》正在调用模型 {}", chapter.title, ctx.model))
                .with_stage("generate")
                .with_chapter(ctx.chapter_id),
        );

        let response = self.router.generate(&ctx.model, &prompt, None).await?;
        // 取消后返回的结果直接丢弃
        ctx.cancel.check()?;

        let (mut drafts, rejected) = parse_drafts(&response, ctx.kind)?;
        for reason in &rejected {
            warn!("{} ⚠️ 丢弃不合法条目: {}", ctx, reason);
        }
        drafts.truncate(count);
        let total = drafts.len();
        for (index, draft) in drafts.iter().enumerate() {
            let done = 10 + (index + 1) * 90 / total;
            progress.emit(
                ProgressEvent::status(
                    scale.map(done as u8),
                    format!("《{}》条目 {}/{} 有效: {}", chapter.title, index + 1, total, truncate_text(&draft.question, 30)),
                )
                .with_stage("generate")
                .with_chapter(ctx.chapter_id)
                .with_item(index),
            );
        }

        let outcome = SinglePassOutcome {
            drafts,
            requested: count,
            rejected: rejected.len(),
        };
        if outcome.shortfall() > 0 {
            warn!(
                "{} ⚠️ 只得到 {}/{} 个有效条目",
                ctx,
                outcome.drafts.len(),
                count
            );
        }
        progress.emit(
            ProgressEvent::status(
                scale.map(100),
                format!("《{}》生成 {} 个条目", chapter.title, outcome.drafts.len()),
            )
            .with_stage("generate")
            .with_chapter(ctx.chapter_id),
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ScriptedProvider, ScriptedReply};
    use crate::config::{ModelSpec, ProviderKind};
    use crate::error::{AppError, ValidationError};
    use crate::models::ChapterId;
    use crate::services::progress::progress_channel;
    use crate::services::token_estimator::TokenEstimator;
    use crate::services::RetryPolicy;
    use crate::workflow::chapter_ctx::{CancelFlag, RunId};
    use std::time::Duration;

    fn setup(replies: Vec<ScriptedReply>) -> (SinglePassGenerator, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::new(replies));
        let mut router = ProviderRouter::new(RetryPolicy::default(), Duration::from_secs(5));
        router.register(
            ModelSpec::new("m", "M", ProviderKind::DeepSeek, "deepseek-chat", 64_000),
            provider.clone(),
        );
        (SinglePassGenerator::new(Arc::new(router)), provider)
    }

    fn ctx(kind: ContentKind) -> ChapterCtx {
        ChapterCtx {
            run_id: RunId::new(),
            chapter_id: ChapterId(1),
            title: "函数".to_string(),
            position: 0,
            total: 1,
            model: "m".to_string(),
            kind,
            exercise_type: None,
            language: "中文".to_string(),
            cancel: CancelFlag::new(),
        }
    }

    fn chapter() -> Chapter {
        Chapter::new(ChapterId(1), 1, "函数", 0, "函数是一种映射关系。", &TokenEstimator::default())
    }

    #[tokio::test]
    async fn test_truncates_to_count_and_drops_invalid() {
        let response = r#"```json
[
  {"question": "什么是函数？", "answer": "一种映射"},
  {"question": "", "answer": "x"},
  {"question": "定义域是什么？", "answer": "自变量的取值范围"},
  {"question": "值域是什么？", "answer": "函数值的集合"}
]
```"#;
        let (generator, provider) = setup(vec![ScriptedReply::text(response)]);
        let (emitter, mut rx) = progress_channel(16);

        let outcome = generator
            .generate(&ctx(ContentKind::Qa), &chapter(), 2, &TemplateSnapshot::builtin(), &emitter, ProgressScale::new(0.0, 100.0))
            .await
            .unwrap();

        assert_eq!(outcome.drafts.len(), 2);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.shortfall(), 0);
        assert!(provider.calls()[0].prompt.contains("函数是一种映射关系。"));

        drop(emitter);
        let mut item_events = Vec::new();
        while let Some(event) = rx.recv().await {
            if let Some(index) = event.item_index {
                assert_eq!(event.chapter_id, Some(ChapterId(1)));
                item_events.push(index);
            }
        }
        assert_eq!(item_events, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_chapter_braces_reach_provider_unchanged() {
        let content = "Python 中 f\"{count} items\" 会格式化变量 {count}，{target_language} 原样保留。";
        let chapter = Chapter::new(ChapterId(1), 1, "格式化字符串", 0, content, &TokenEstimator::default());
        let (generator, provider) = setup(vec![ScriptedReply::text(r#"[{"question": "f-string 是什么？", "answer": "格式化字符串字面量"}]"#)]);
        let (emitter, _rx) = progress_channel(16);

        generator
            .generate(&ctx(ContentKind::Qa), &chapter, 7, &TemplateSnapshot::builtin(), &emitter, ProgressScale::new(0.0, 100.0))
            .await
            .unwrap();

        let prompt = &provider.calls()[0].prompt;
        assert!(prompt.contains(content));
        assert!(!prompt.contains("f\"7 items\""));
    }

    #[tokio::test]
    async fn test_non_json_response_fails_chapter() {
        let (generator, _) = setup(vec![ScriptedReply::text("抱歉，我不能回答。")]);
        let (emitter, _rx) = progress_channel(16);

        let err = generator
            .generate(&ctx(ContentKind::Exercise), &chapter(), 3, &TemplateSnapshot::builtin(), &emitter, ProgressScale::new(0.0, 100.0))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(ValidationError::NotJson { .. })));
    }

    #[tokio::test]
    async fn test_shortfall_is_reported_not_padded() {
        let response = r#"[{"type": "fill", "question": "f(x)=x 的定义域是____", "answer": "全体实数"}]"#;
        let (generator, provider) = setup(vec![ScriptedReply::text(response)]);
        let (emitter, _rx) = progress_channel(16);

        let outcome = generator
            .generate(&ctx(ContentKind::Exercise), &chapter(), 5, &TemplateSnapshot::builtin(), &emitter, ProgressScale::new(0.0, 100.0))
            .await
            .unwrap();
        assert_eq!(outcome.drafts.len(), 1);
        assert_eq!(outcome.shortfall(), 4);
        assert!(provider.calls()[0].prompt.contains(ANY_EXERCISE_TYPE));
    }
}
