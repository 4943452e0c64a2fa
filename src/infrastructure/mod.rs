//! 基础设施层
//!
//! - `storage`：核心依赖的存储接口
//! - `memory_store`：进程内实现，支持 JSON 快照

pub mod memory_store;
pub mod storage;

pub use memory_store::MemoryStore;
pub use storage::{ChapterProgress, Storage};
