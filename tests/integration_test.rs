use std::sync::Arc;
use std::time::Duration;

use textbook_corpus::clients::{LlmRequest, ScriptedProvider, ScriptedReply};
use textbook_corpus::config::{ModelSpec, ProviderKind};
use textbook_corpus::models::{load_markdown_book, ChapterId, ContentKind, GenerationMode, GenerationRequest, ItemStatus, NewChapter};
use textbook_corpus::orchestrator::{GenerationRunner, RunRegistry, RunStatus, RunnerSettings};
use textbook_corpus::services::progress::{EventType, ProgressEvent, ProgressReceiver};
use textbook_corpus::services::{ProviderRouter, RetryPolicy, TokenEstimator};
use textbook_corpus::{MemoryStore, Storage};
use tokio_test::assert_ok;

const MODEL: &str = "deepseek-v3";

fn runner_with(store: Arc<MemoryStore>, provider: Arc<ScriptedProvider>, settings: RunnerSettings) -> Arc<GenerationRunner> {
    let mut router = ProviderRouter::new(
        RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(10)),
        Duration::from_secs(2),
    );
    router.register(
        ModelSpec::new(MODEL, "DeepSeek V3", ProviderKind::DeepSeek, "deepseek-chat", 64_000),
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

fn new_chapter(title: &str, content: &str) -> NewChapter {
    NewChapter {
        title: title.to_string(),
        content_md: content.to_string(),
        token_count: 0,
        level: 1,
    }
}

async fn drain(mut events: ProgressReceiver) -> Vec<ProgressEvent> {
    let mut all = Vec::new();
    while let Some(event) = events.recv().await {
        all.push(event);
    }
    all
}

fn assert_well_formed(events: &[ProgressEvent]) {
    assert!(!events.is_empty());
    assert!(events.windows(2).all(|w| w[0].progress <= w[1].progress));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.last().unwrap().is_terminal());
}

/// 多智能体流程的脚本：内容含"空章节"的章节分析不出知识点
fn agent_script(request: &LlmRequest) -> ScriptedReply {
    let prompt = request.prompt.as_str();
    if prompt.contains("课程设计专家") {
        if prompt.contains("空章节") {
            ScriptedReply::text("[]")
        } else {
            ScriptedReply::text(r#"[{"Topic": "集合的表示", "Key_Concepts": ["列举法", "描述法"], "Source_Snippet": "集合可以用列举法表示"}]"#)
        }
    } else if prompt.contains("道练习题") {
        ScriptedReply::text(
            r#"[
              {"type": "fill", "question": "用列举法表示小于 3 的自然数集合：____", "answer": "{0, 1, 2}"},
              {"type": "choice", "question": "下列哪项是描述法？", "options": ["A. {1,2}", "B. {x | x > 1}", "C. 1", "D. 空"], "answer": "B"}
            ]"#,
        )
    } else if prompt.contains("试题质量审核员") {
        ScriptedReply::text(r#"[{"item_index": 0, "rating": 3}, {"item_index": 1, "rating": 3}]"#)
    } else {
        ScriptedReply::Fail(textbook_corpus::error::ProviderErrorKind::InvalidRequest)
    }
}

#[tokio::test]
async fn test_markdown_book_to_saved_items() {
    let dir = tempfile::tempdir().unwrap();
    let book = dir.path().join("math.md");
    tokio::fs::write(
        &book,
        "# 目录\n\n# 第一章 集合\n\n集合是确定对象的全体。\n\n# 第二章 函数\n\n函数是一种对应关系。\n",
    )
    .await
    .unwrap();

    let store = Arc::new(MemoryStore::new());
    let chapters = assert_ok!(load_markdown_book(&book, store.estimator()).await);
    assert_eq!(chapters.len(), 2);
    let ids = store.insert_book(1, chapters);

    let provider = Arc::new(ScriptedProvider::new(Vec::new()).with_responder(|request| {
        if request.prompt.contains("集合是确定对象的全体") {
            ScriptedReply::text(r#"[{"question": "什么是集合？", "answer": "确定对象的全体"}, {"question": "集合的元素有什么特征？", "answer": "确定、互异、无序"}]"#)
        } else {
            ScriptedReply::text(r#"[{"question": "什么是函数？", "answer": "一种对应关系"}]"#)
        }
    }));
    let runner = runner_with(store.clone(), provider, RunnerSettings::default());
    let request = GenerationRequest::new(ids.clone(), MODEL, 2, GenerationMode::Standard, ContentKind::Qa);

    let handle = runner.start(request);
    let run_id = handle.run_id;
    let events = drain(handle.events).await;
    let summary = handle.join.await.unwrap();

    assert_well_formed(&events);
    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::Complete);
    assert_eq!((last.succeeded, last.failed), (Some(2), Some(0)));
    assert_eq!(summary.saved_items(), 3);
    assert_eq!(runner.registry().get(run_id).unwrap().status, RunStatus::Completed);

    let items = store.list_items(ids[0]).await.unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i.status == ItemStatus::Generated && i.model_name == MODEL));

    let snapshot = dir.path().join("out.json");
    store.save_snapshot(&snapshot).await.unwrap();
    let restored = MemoryStore::load_snapshot(&snapshot).await.unwrap();
    assert_eq!(restored.all_items().len(), 3);
}

#[tokio::test]
async fn test_multi_chapter_partial_success_reports_counts() {
    let store = Arc::new(MemoryStore::new());
    let ids = store.insert_book(
        1,
        vec![
            new_chapter("集合", "集合可以用列举法表示，也可以用描述法表示。"),
            new_chapter("空白", "空章节"),
        ],
    );
    let provider = Arc::new(ScriptedProvider::new(Vec::new()).with_responder(agent_script));
    let runner = runner_with(store.clone(), provider, RunnerSettings::default());
    let request = GenerationRequest::new(ids.clone(), MODEL, 2, GenerationMode::MultiAgent, ContentKind::Exercise);

    let handle = runner.start(request);
    let events = drain(handle.events).await;
    let summary = handle.join.await.unwrap();

    assert_well_formed(&events);
    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::Complete);
    assert_eq!((last.succeeded, last.failed), (Some(1), Some(1)));
    assert!(summary.chapters[1].error.as_deref().unwrap().contains("analyze"));

    assert_eq!(store.list_items(ids[0]).await.unwrap().len(), 2);
    assert!(store.list_items(ids[1]).await.unwrap().is_empty());
    // 两个章节都留下了审计日志
    assert!(store.stage_logs().iter().any(|l| l.chapter_id == ids[1]));
    assert!(store.stage_logs().iter().any(|l| l.chapter_id == ids[0]));
}

#[tokio::test]
async fn test_missing_chapter_is_counted_without_aborting_run() {
    let store = Arc::new(MemoryStore::new());
    let ids = store.insert_book(1, vec![new_chapter("集合", "集合是确定对象的全体。")]);
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedReply::text(
        r#"[{"question": "什么是集合？", "answer": "确定对象的全体"}]"#,
    )]));
    let runner = runner_with(store.clone(), provider.clone(), RunnerSettings::default());
    let request = GenerationRequest::new(vec![ids[0], ChapterId(999)], MODEL, 1, GenerationMode::Standard, ContentKind::Qa);

    let handle = runner.start(request);
    let events = drain(handle.events).await;
    let summary = handle.join.await.unwrap();

    assert_well_formed(&events);
    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::Complete);
    assert_eq!((last.succeeded, last.failed), (Some(1), Some(1)));
    assert!(summary.error.is_none());
    assert_eq!(provider.call_count(), 1);
    assert_eq!(store.list_items(ids[0]).await.unwrap().len(), 1);
    let missing = summary.chapters.iter().find(|c| c.chapter_id == ChapterId(999)).unwrap();
    assert!(missing.error.as_deref().unwrap().contains("999"));
}

#[tokio::test]
async fn test_all_chapters_failing_ends_with_error() {
    let store = Arc::new(MemoryStore::new());
    let ids = store.insert_book(1, vec![new_chapter("空白", "空章节")]);
    let provider = Arc::new(ScriptedProvider::new(Vec::new()).with_responder(agent_script));
    let runner = runner_with(store, provider, RunnerSettings::default());
    let request = GenerationRequest::new(ids, MODEL, 2, GenerationMode::MultiAgent, ContentKind::Exercise);

    let handle = runner.start(request);
    let events = drain(handle.events).await;
    assert_well_formed(&events);
    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::Error);
    assert_eq!((last.succeeded, last.failed), (Some(0), Some(1)));
    assert!(last.message.contains("没有提取到任何知识点"));
}

#[tokio::test]
async fn test_cancellation_discards_in_flight_result() {
    let store = Arc::new(MemoryStore::new());
    let ids = store.insert_book(1, vec![new_chapter("集合", "集合是确定对象的全体。")]);
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedReply::Delay(
        Duration::from_millis(200),
        r#"[{"question": "什么是集合？", "answer": "确定对象的全体"}]"#.to_string(),
    )]));
    let runner = runner_with(store.clone(), provider, RunnerSettings::default());
    let request = GenerationRequest::new(ids, MODEL, 1, GenerationMode::Standard, ContentKind::Qa);

    let handle = runner.start(request);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(runner.registry().cancel(handle.run_id));

    let events = drain(handle.events).await;
    let summary = handle.join.await.unwrap();

    assert_well_formed(&events);
    assert_eq!(events.last().unwrap().event_type, EventType::Error);
    assert!(summary.cancelled);
    assert!(store.all_items().is_empty());
    assert_eq!(runner.registry().get(handle.run_id).unwrap().status, RunStatus::Cancelled);
}

#[tokio::test]
async fn test_auto_split_replaces_oversized_chapter_before_generation() {
    let store = Arc::new(MemoryStore::new());
    let paragraph = "函数的单调性描述了函数值随自变量增大而变化的趋势。".repeat(30);
    let content = vec![paragraph.as_str(); 8].join("\n\n");
    let ids = store.insert_book(1, vec![new_chapter("函数", &content)]);

    let provider = Arc::new(
        ScriptedProvider::new(Vec::new())
            .with_responder(|_| ScriptedReply::text(r#"[{"question": "什么是单调性？", "answer": "函数值随自变量变化的趋势"}]"#)),
    );
    let settings = RunnerSettings {
        safety_ratio: 0.02,
        auto_split: true,
        ..RunnerSettings::default()
    };
    let runner = runner_with(store.clone(), provider.clone(), settings);
    let request = GenerationRequest::new(ids.clone(), MODEL, 1, GenerationMode::Standard, ContentKind::Qa);

    let handle = runner.start(request);
    let events = drain(handle.events).await;
    let summary = handle.join.await.unwrap();

    assert_well_formed(&events);
    assert!(events.iter().any(|e| e.stage.as_deref() == Some("split")));
    let parts = store.list_chapters(1).await.unwrap();
    assert!(parts.len() >= 2);
    assert_eq!(parts[0].title, "函数 (Part 1)");
    assert!(store.get_chapter(ids[0]).await.is_err());
    assert_eq!(summary.succeeded(), parts.len());
    assert_eq!(provider.call_count(), parts.len());
    let joined: String = parts.iter().map(|c| c.content_md.as_str()).collect();
    assert_eq!(joined, content);
}
