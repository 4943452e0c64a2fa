pub mod chapter_service;
pub mod chunk_splitter;
pub mod progress;
pub mod prompt_templates;
pub mod provider_router;
pub mod response_parser;
pub mod token_estimator;

pub use chapter_service::{BudgetCheck, ChapterService};
pub use chunk_splitter::{ChunkSplitter, TextChunk};
pub use progress::{progress_channel, EventType, ProgressEmitter, ProgressEvent, ProgressReceiver, ProgressScale};
pub use prompt_templates::{TemplateSnapshot, TemplateStore};
pub use provider_router::{ProviderRouter, RetryPolicy};
pub use token_estimator::TokenEstimator;
