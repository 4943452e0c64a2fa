pub mod chapter;
pub mod item;
pub mod loaders;
pub mod request;
pub mod template;

pub use chapter::{Chapter, ChapterId, NewChapter};
pub use item::{ContentKind, GeneratedItem, GenerationMode, ItemDraft, ItemId, ItemStatus};
pub use loaders::{load_markdown_book, segment_markdown};
pub use request::GenerationRequest;
pub use template::{PromptKind, PromptTemplate};
