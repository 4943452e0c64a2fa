//! 流水线运行记录
//!
//! `PipelineRun` 只在一次章节处理期间存在：当前阶段、各阶段计数、
//! 以及每次模型调用的原始输入输出。结束后只持久化摘要与可选的审计日志。

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::PipelineStage;
use crate::models::ChapterId;
use crate::workflow::chapter_ctx::RunId;

/// 单次智能体调用的审计记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLog {
    pub run_id: RunId,
    pub chapter_id: ChapterId,
    pub agent: PipelineStage,
    /// 调用标签，例如 "context 2" / "batch 1" / "item 3"
    pub label: String,
    pub input: String,
    pub output: String,
    pub model: String,
    pub at: DateTime<Local>,
}

/// 各阶段计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub contexts: usize,
    pub drafts: usize,
    pub accepted: usize,
    pub refined: usize,
    /// 审核评分为 1 被丢弃
    pub dropped_by_review: usize,
    /// 解析、校验或调用失败被丢弃
    pub dropped_invalid: usize,
}

/// 一次章节处理的运行记录
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub chapter_id: ChapterId,
    pub model: String,
    pub stage: PipelineStage,
    pub counts: StageCounts,
    logs: Vec<StageLog>,
}

impl PipelineRun {
    pub fn new(run_id: RunId, chapter_id: ChapterId, model: impl Into<String>) -> Self {
        Self {
            run_id,
            chapter_id,
            model: model.into(),
            stage: PipelineStage::Analyze,
            counts: StageCounts::default(),
            logs: Vec::new(),
        }
    }

    pub fn enter(&mut self, stage: PipelineStage) {
        self.stage = stage;
    }

    /// 记录一次模型调用
    pub fn record(&mut self, label: impl Into<String>, input: &str, output: &str) {
        self.logs.push(StageLog {
            run_id: self.run_id,
            chapter_id: self.chapter_id,
            agent: self.stage,
            label: label.into(),
            input: input.to_string(),
            output: output.to_string(),
            model: self.model.clone(),
            at: Local::now(),
        });
    }

    pub fn logs(&self) -> &[StageLog] {
        &self.logs
    }

    pub fn into_logs(self) -> Vec<StageLog> {
        self.logs
    }
}
