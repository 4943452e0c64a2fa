pub mod markdown_loader;

pub use markdown_loader::{load_markdown_book, segment_markdown, MarkdownSegment};
