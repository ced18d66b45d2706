//! LLM 层：语言模型抽象与离线实现

pub mod mock;
pub mod traits;

pub use mock::{EchoLanguageModel, ScriptedLanguageModel};
pub use traits::{generate_with_timeout, GenerateParams, LanguageModel, LlmError};
