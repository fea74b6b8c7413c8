pub mod chat_service;
pub mod conversation;
pub mod llm_service;
pub mod prompt;

pub use chat_service::{ChatConfig, ChatInput, ChatReply, ChatService, ChatStream, StreamOutcome};
pub use conversation::ConversationStore;
pub use llm_service::{LlmProvider, OllamaService, ProviderError};
