//! 进度事件通道
//!
//! 流水线（生产者）与接口层（消费者）之间的有界通道：
//! - 缓冲区满时丢弃最旧的非终止事件，生产者从不阻塞
//! - 进度值单调不减且不超过 100
//! - 恰好一个终止事件（complete / error），之后的事件被忽略
//! - 生产者未发出终止事件就被丢弃时，自动补发 error 事件
//! - 消费者断开后生产者照常运行

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

use crate::models::ChapterId;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Status,
    Complete,
    Error,
}

/// 进度事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// 0..=100，单调不减
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_id: Option<ChapterId>,
    /// 单个条目的完成事件带有条目在本章节中的下标
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub succeeded: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<usize>,
}

impl ProgressEvent {
    pub fn status(progress: u8, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Status,
            progress,
            message: message.into(),
            stage: None,
            chapter_id: None,
            item_index: None,
            succeeded: None,
            failed: None,
        }
    }

    /// 成功终止事件
    pub fn complete(message: impl Into<String>, succeeded: usize, failed: usize) -> Self {
        Self {
            event_type: EventType::Complete,
            ..Self::status(100, message).with_counts(succeeded, failed)
        }
    }

    /// 失败终止事件
    pub fn error(message: impl Into<String>, succeeded: usize, failed: usize) -> Self {
        Self {
            event_type: EventType::Error,
            ..Self::status(0, message).with_counts(succeeded, failed)
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_chapter(mut self, chapter_id: ChapterId) -> Self {
        self.chapter_id = Some(chapter_id);
        self
    }

    pub fn with_item(mut self, index: usize) -> Self {
        self.item_index = Some(index);
        self
    }

    pub fn with_counts(mut self, succeeded: usize, failed: usize) -> Self {
        self.succeeded = Some(succeeded);
        self.failed = Some(failed);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type != EventType::Status
    }
}

struct Shared {
    queue: Mutex<VecDeque<ProgressEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicUsize,
    receiver_alive: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, VecDeque<ProgressEvent>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, event: ProgressEvent) {
        {
            let mut queue = self.lock();
            if queue.len() >= self.capacity {
                if let Some(pos) = queue.iter().position(|e| !e.is_terminal()) {
                    queue.remove(pos);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// 创建进度通道
pub fn progress_channel(capacity: usize) -> (ProgressEmitter, ProgressReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        notify: Notify::new(),
        capacity: capacity.max(1),
        dropped: AtomicUsize::new(0),
        receiver_alive: AtomicBool::new(true),
    });
    (
        ProgressEmitter {
            shared: shared.clone(),
            last_progress: AtomicU8::new(0),
            finished: AtomicBool::new(false),
        },
        ProgressReceiver {
            shared,
            done: false,
        },
    )
}

/// 进度生产者（唯一）
pub struct ProgressEmitter {
    shared: Arc<Shared>,
    last_progress: AtomicU8,
    finished: AtomicBool,
}

impl ProgressEmitter {
    /// 发出事件；进度会被钳制为单调不减
    pub fn emit(&self, mut event: ProgressEvent) {
        if self.finished.load(Ordering::Acquire) {
            debug!("终止事件之后的进度事件被忽略: {}", event.message);
            return;
        }

        let requested = if event.event_type == EventType::Complete {
            100
        } else {
            event.progress.min(100)
        };
        let previous = self.last_progress.fetch_max(requested, Ordering::AcqRel);
        event.progress = previous.max(requested);

        if event.is_terminal() {
            self.finished.store(true, Ordering::Release);
        }
        self.shared.push(event);
    }

    pub fn status(&self, progress: u8, message: impl Into<String>) {
        self.emit(ProgressEvent::status(progress, message));
    }

    /// 成功结束
    pub fn complete(&self, message: impl Into<String>, succeeded: usize, failed: usize) {
        self.emit(ProgressEvent::complete(message, succeeded, failed));
    }

    /// 失败结束
    pub fn error(&self, message: impl Into<String>, succeeded: usize, failed: usize) {
        self.emit(ProgressEvent::error(message, succeeded, failed));
    }

    pub fn last_progress(&self) -> u8 {
        self.last_progress.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// 因缓冲区已满而丢弃的事件数
    pub fn dropped_count(&self) -> usize {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// 消费者是否仍在连接
    pub fn has_receiver(&self) -> bool {
        self.shared.receiver_alive.load(Ordering::Acquire)
    }
}

impl Drop for ProgressEmitter {
    fn drop(&mut self) {
        if !self.is_finished() {
            self.error("任务在结束前中断", 0, 0);
        }
    }
}

/// 进度消费者
pub struct ProgressReceiver {
    shared: Arc<Shared>,
    done: bool,
}

impl ProgressReceiver {
    /// 接收下一个事件；终止事件之后返回 `None`
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            if self.done {
                return None;
            }
            let notified = self.shared.notify.notified();
            if let Some(event) = self.shared.lock().pop_front() {
                if event.is_terminal() {
                    self.done = true;
                }
                return Some(event);
            }
            notified.await;
        }
    }

    /// 转换为 `Stream`
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> {
        stream::unfold(self, |mut receiver| async move {
            receiver.recv().await.map(|event| (event, receiver))
        })
    }
}

impl Drop for ProgressReceiver {
    fn drop(&mut self) {
        self.shared.receiver_alive.store(false, Ordering::Release);
    }
}

/// 把某一段局部进度（0..=100）映射到全局进度的一个区间
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressScale {
    start: f32,
    end: f32,
}

impl ProgressScale {
    pub fn new(start: f32, end: f32) -> Self {
        let start = start.clamp(0.0, 100.0);
        Self {
            start,
            end: end.clamp(start, 100.0),
        }
    }

    /// 第 `position` 个（从 0 开始）章节在 `total` 个章节中的区间
    pub fn for_chapter(position: usize, total: usize) -> Self {
        let total = total.max(1) as f32;
        Self::new(
            position as f32 / total * 100.0,
            (position + 1) as f32 / total * 100.0,
        )
    }

    /// 区间内的子区间
    pub fn sub(&self, from: u8, to: u8) -> Self {
        Self::new(self.map(from) as f32, self.map(to) as f32)
    }

    pub fn map(&self, local: u8) -> u8 {
        let local = f32::from(local.min(100)) / 100.0;
        (self.start + (self.end - self.start) * local).floor() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_progress_is_clamped_and_single_terminal() {
        let (emitter, receiver) = progress_channel(16);
        emitter.status(30, "a");
        emitter.status(10, "b");
        emitter.status(250, "c");
        emitter.complete("done", 2, 0);
        emitter.error("ignored", 0, 0);

        let events: Vec<ProgressEvent> = receiver.into_stream().collect().await;
        let progress: Vec<u8> = events.iter().map(|e| e.progress).collect();
        assert_eq!(progress, vec![30, 30, 100, 100]);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(events.last().map(|e| e.event_type), Some(EventType::Complete));
    }

    #[tokio::test]
    async fn test_full_buffer_drops_oldest_status() {
        let (emitter, mut receiver) = progress_channel(4);
        for i in 0..10u8 {
            emitter.status(i * 5, format!("step {}", i));
        }
        emitter.complete("done", 1, 0);
        assert_eq!(emitter.dropped_count(), 7);

        let mut messages = Vec::new();
        while let Some(event) = receiver.recv().await {
            messages.push(event.message);
        }
        assert_eq!(messages, vec!["step 7", "step 8", "step 9", "done"]);
    }

    #[tokio::test]
    async fn test_dropped_emitter_emits_error_terminal() {
        let (emitter, mut receiver) = progress_channel(8);
        emitter.status(40, "running");
        drop(emitter);

        assert_eq!(receiver.recv().await.map(|e| e.progress), Some(40));
        let terminal = receiver.recv().await.unwrap();
        assert_eq!(terminal.event_type, EventType::Error);
        assert_eq!(terminal.progress, 40);
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_emitter_survives_receiver_drop() {
        let (emitter, receiver) = progress_channel(2);
        drop(receiver);
        assert!(!emitter.has_receiver());
        emitter.status(50, "nobody listening");
        emitter.complete("done", 0, 0);
        assert!(emitter.is_finished());
    }

    #[tokio::test]
    async fn test_receiver_waits_for_producer_task() {
        let (emitter, receiver) = progress_channel(8);
        let producer = tokio::spawn(async move {
            for p in [10u8, 20, 30] {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                emitter.status(p, "tick");
            }
            emitter.complete("ok", 3, 0);
        });
        let events: Vec<ProgressEvent> = receiver.into_stream().collect().await;
        producer.await.unwrap();
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn test_scale_maps_into_chapter_slice() {
        let second_of_four = ProgressScale::for_chapter(1, 4);
        assert_eq!(second_of_four.map(0), 25);
        assert_eq!(second_of_four.map(100), 50);
        let review = second_of_four.sub(45, 70);
        assert_eq!(review.map(0), second_of_four.map(45));
    }
}
