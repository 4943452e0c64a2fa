//! API 模块
//!
//! 负责面向客户端的事件编码

pub mod sse;

pub use sse::{event_stream, frame, pipe_events};
