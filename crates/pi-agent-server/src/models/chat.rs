use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::services::ChatReply;

/// Agents accepted by `POST /chat`.
pub const SUPPORTED_AGENTS: &[&str] = &["general"];

/// Response header carrying the resolved conversation id.
pub const CONVERSATION_ID_HEADER: &str = "x-conversation-id";

// ===== REQUEST MODELS =====

#[derive(Debug, Deserialize, Validate)]
pub struct ChatRequest {
    #[validate(length(min = 1, max = 4000, message = "Message must be between 1 and 4000 characters"))]
    pub message: String,
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    #[validate(length(max = 256, message = "Conversation id too long"))]
    pub conversation_id: Option<String>,
}

fn default_agent() -> String {
    "general".to_string()
}

// ===== RESPONSE MODELS =====

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
    pub conversation_id: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
}

impl From<ChatReply> for ChatResponse {
    fn from(reply: ChatReply) -> Self {
        Self {
            reply: reply.reply,
            conversation_id: Some(reply.conversation_id),
            model: Some(reply.model),
            provider: Some(reply.provider),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentsResponse {
    pub agents: Vec<String>,
}
