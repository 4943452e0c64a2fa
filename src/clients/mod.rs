pub mod gemini;
pub mod openai_compat;
pub mod provider;
pub mod scripted;

pub use gemini::GeminiProvider;
pub use openai_compat::OpenAiCompatibleProvider;
pub use provider::{GenerateOptions, LlmProvider, LlmRequest};
pub use scripted::{ScriptedProvider, ScriptedReply};
