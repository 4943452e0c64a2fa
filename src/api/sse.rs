//! SSE 事件编码
//!
//! 每个进度事件编码为一帧 `data: <json>\n\n`，终止事件之后不再有帧。

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::services::progress::{ProgressEvent, ProgressReceiver};

/// 把一个可序列化的值编码为 SSE 帧
pub fn frame<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(format!("data: {}\n\n", serde_json::to_string(value)?))
}

/// 解析一帧（去掉 `data: ` 前缀）
pub fn parse_frame(frame: &str) -> Result<ProgressEvent, serde_json::Error> {
    let payload = frame.trim_end().strip_prefix("data:").unwrap_or(frame).trim();
    serde_json::from_str(payload)
}

/// 进度事件流转换为 SSE 帧流
pub fn event_stream(receiver: ProgressReceiver) -> impl Stream<Item = String> {
    receiver.into_stream().filter_map(|event| async move {
        match frame(&event) {
            Ok(text) => Some(text),
            Err(e) => {
                debug!("进度事件序列化失败: {}", e);
                None
            }
        }
    })
}

/// 把全部事件写到输出流，返回最后一个事件
pub async fn pipe_events<W>(receiver: ProgressReceiver, writer: &mut W) -> std::io::Result<Option<ProgressEvent>>
where
    W: AsyncWrite + Unpin,
{
    let mut receiver = receiver;
    let mut last = None;
    while let Some(event) = receiver.recv().await {
        let text = frame(&event).map_err(std::io::Error::other)?;
        writer.write_all(text.as_bytes()).await?;
        writer.flush().await?;
        last = Some(event);
    }
    Ok(last)
}
