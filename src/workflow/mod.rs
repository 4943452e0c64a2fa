//! 流程层（Workflow Layer）
//!
//! 定义"一个章节"的完整生成流程：
//! - `single_pass`：单次调用生成
//! - `multi_agent`：分析 → 生成 → 审核 → 修订
//!
//! 流程层只处理单个章节，章节之间的调度由编排层负责。

pub mod chapter_ctx;
pub mod multi_agent;
pub mod single_pass;
pub mod stage_log;

pub use chapter_ctx::{CancelFlag, ChapterCtx, RunId};
pub use multi_agent::{AgentStage, FinalItem, MultiAgentPipeline, PipelineOutcome, QuestionContext, ReviewScore};
pub use single_pass::{SinglePassGenerator, SinglePassOutcome};
pub use stage_log::{PipelineRun, StageCounts, StageLog};
