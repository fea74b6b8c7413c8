use anyhow::Result;
use axum::extract::FromRef;
use std::sync::Arc;

use crate::config::Settings;
use crate::services::conversation::{ConversationStore, MemoryPolicy};
use crate::services::{llm_service, ChatConfig, ChatService, LlmProvider};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub chat_service: Arc<ChatService>,
    pub conversation_store: Arc<ConversationStore>,
}

impl AppState {
    /// Wires the configured backend, memory and chat service together.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let provider = llm_service::from_settings(&settings.llm)?;
        Self::with_provider(settings, provider)
    }

    pub fn with_provider(settings: &Settings, provider: Arc<dyn LlmProvider>) -> Result<Self> {
        let conversation_store = Arc::new(ConversationStore::new(MemoryPolicy::from(
            &settings.memory,
        )));
        let chat_service = Arc::new(ChatService::new(
            provider,
            conversation_store.clone(),
            ChatConfig::from_settings(settings)?,
        ));

        Ok(Self {
            chat_service,
            conversation_store,
        })
    }
}

impl FromRef<AppState> for Arc<ChatService> {
    fn from_ref(state: &AppState) -> Self {
        state.chat_service.clone()
    }
}

impl FromRef<AppState> for Arc<ConversationStore> {
    fn from_ref(state: &AppState) -> Self {
        state.conversation_store.clone()
    }
}
