//! 任务登记表 - 编排层
//!
//! 职责：记录每次生成任务的状态，并持有任务的取消标记。
//! 一个任务只由它自己的 runner 写入，其它调用方只读或请求取消。

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::models::{ChapterId, GenerationRequest};
use crate::services::progress::{EventType, ProgressEvent};
use crate::workflow::chapter_ctx::{CancelFlag, RunId};

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_finished(self) -> bool {
        self != RunStatus::Running
    }
}

/// 任务状态快照
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub run_id: RunId,
    pub request: GenerationRequest,
    pub status: RunStatus,
    pub progress: u8,
    pub message: String,
    pub current_chapter: Option<ChapterId>,
    pub succeeded: usize,
    pub failed: usize,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
}

struct RunEntry {
    state: RunState,
    cancel: CancelFlag,
}

/// 任务登记表
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<RunId, RunEntry>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记新任务，返回任务 ID 和它的取消标记
    pub fn register(&self, request: GenerationRequest) -> (RunId, CancelFlag) {
        let run_id = RunId::new();
        let cancel = CancelFlag::new();
        let state = RunState {
            run_id,
            request,
            status: RunStatus::Running,
            progress: 0,
            message: String::new(),
            current_chapter: None,
            succeeded: 0,
            failed: 0,
            started_at: Local::now(),
            finished_at: None,
        };
        lock(&self.runs).insert(
            run_id,
            RunEntry {
                state,
                cancel: cancel.clone(),
            },
        );
        (run_id, cancel)
    }

    /// 用进度事件刷新状态（终止事件同时结束任务）
    pub fn observe(&self, run_id: RunId, event: &ProgressEvent) {
        let mut runs = lock(&self.runs);
        let Some(entry) = runs.get_mut(&run_id) else {
            return;
        };
        let state = &mut entry.state;
        if state.status.is_finished() {
            return;
        }
        state.progress = state.progress.max(event.progress);
        state.message = event.message.clone();
        if event.chapter_id.is_some() {
            state.current_chapter = event.chapter_id;
        }
        if let (Some(succeeded), Some(failed)) = (event.succeeded, event.failed) {
            state.succeeded = succeeded;
            state.failed = failed;
        }
        match event.event_type {
            EventType::Status => {}
            EventType::Complete => {
                state.status = RunStatus::Completed;
                state.finished_at = Some(Local::now());
            }
            EventType::Error => {
                state.status = if entry.cancel.is_cancelled() {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                state.finished_at = Some(Local::now());
            }
        }
    }

    /// 请求取消，任务不存在或已结束时返回 false
    pub fn cancel(&self, run_id: RunId) -> bool {
        let runs = lock(&self.runs);
        match runs.get(&run_id) {
            Some(entry) if !entry.state.status.is_finished() => {
                entry.cancel.cancel();
                info!("🛑 任务 {} 已请求取消", run_id.short());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, run_id: RunId) -> Option<RunState> {
        lock(&self.runs).get(&run_id).map(|entry| entry.state.clone())
    }

    /// 仍在运行的任务
    pub fn active(&self) -> Vec<RunState> {
        let mut states: Vec<RunState> = lock(&self.runs)
            .values()
            .filter(|entry| !entry.state.status.is_finished())
            .map(|entry| entry.state.clone())
            .collect();
        states.sort_by_key(|state| state.started_at);
        states
    }

    /// 清理已结束的任务，返回清理数量
    pub fn prune_finished(&self) -> usize {
        let mut runs = lock(&self.runs);
        let before = runs.len();
        runs.retain(|_, entry| !entry.state.status.is_finished());
        before - runs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentKind, GenerationMode};

    fn request() -> GenerationRequest {
        GenerationRequest::new(vec![ChapterId(1)], "deepseek-v3", 3, GenerationMode::Standard, ContentKind::Qa)
    }

    #[test]
    fn test_observe_tracks_progress_and_terminal() {
        let registry = RunRegistry::new();
        let (run_id, _cancel) = registry.register(request());

        registry.observe(run_id, &ProgressEvent::status(40, "处理中").with_chapter(ChapterId(1)));
        let state = registry.get(run_id).unwrap();
        assert_eq!(state.progress, 40);
        assert_eq!(state.current_chapter, Some(ChapterId(1)));
        assert_eq!(registry.active().len(), 1);

        registry.observe(run_id, &ProgressEvent::complete("完成", 1, 0));
        let state = registry.get(run_id).unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.succeeded, 1);
        assert!(state.finished_at.is_some());
        assert!(registry.active().is_empty());
        assert_eq!(registry.prune_finished(), 1);
    }

    #[test]
    fn test_cancel_sets_flag_and_marks_cancelled() {
        let registry = RunRegistry::new();
        let (run_id, cancel) = registry.register(request());
        assert!(registry.cancel(run_id));
        assert!(cancel.is_cancelled());

        registry.observe(run_id, &ProgressEvent::error("任务已取消", 0, 0));
        assert_eq!(registry.get(run_id).unwrap().status, RunStatus::Cancelled);
        assert!(!registry.cancel(run_id));
        assert!(!registry.cancel(RunId::new()));
    }
}
