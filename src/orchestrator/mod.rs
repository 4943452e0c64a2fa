//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责任务调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app` - 命令行应用
//! - 管理应用生命周期（初始化、运行、保存结果）
//! - 加载教材、创建路由器
//! - 把进度事件以 SSE 帧输出
//!
//! ### `generation_runner` - 生成任务执行器
//! - 校验请求、固定模板快照、预算预检
//! - 按顺序处理章节，隔离单个章节的失败
//! - 发出唯一的终止事件
//!
//! ### `run_registry` - 任务登记表
//! - 任务 ID → 任务状态
//! - 持有取消标记
//!
//! ## 层次关系
//!
//! ```text
//! app (一本书)
//!     ↓
//! generation_runner (Vec<Chapter>)
//!     ↓
//! workflow::SinglePassGenerator / MultiAgentPipeline (单个章节)
//!     ↓
//! services (能力层：router / splitter / templates / progress)
//!     ↓
//! infrastructure (存储)
//! ```

pub mod app;
pub mod generation_runner;
pub mod run_registry;

// 重新导出主要类型
pub use app::App;
pub use generation_runner::{ChapterReport, GenerationRunner, RunHandle, RunSummary, RunnerSettings};
pub use run_registry::{RunRegistry, RunState, RunStatus};
