use anyhow::Result;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::services::conversation::{ConversationStore, Role};
use crate::services::llm_service::{GenerationOptions, GenerationRequest, LlmProvider, ProviderError};
use crate::services::prompt::build_prompt;

/// Per-process chat settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub system_prompt: String,
    pub model: String,
    pub provider_name: String,
    pub options: GenerationOptions,
    pub memory_enabled: bool,
}

impl ChatConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            system_prompt: settings.prompts.resolve_system_prompt()?,
            model: settings.llm.model.clone(),
            provider_name: settings.llm.provider.clone(),
            options: GenerationOptions::from(&settings.generation),
            memory_enabled: settings.memory.enabled,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChatInput {
    pub message: String,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub reply: String,
    pub conversation_id: String,
    pub model: String,
    pub provider: String,
}

/// How a streamed exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Backend finished the reply
    Completed,
    /// Caller went away or cancelled between fragments
    Cancelled,
    /// Backend failed after output had started; the prefix is kept
    FailedMid,
}

impl fmt::Display for StreamOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StreamOutcome::Completed => "completed",
            StreamOutcome::Cancelled => "cancelled",
            StreamOutcome::FailedMid => "failed_mid",
        };
        f.write_str(label)
    }
}

/// Commits a streamed exchange to memory exactly once, when dropped.
///
/// Dropping covers every exit: normal end, cancellation, backend failure, and
/// the transport dropping the body after a client disconnect.
struct ExchangeCommit {
    store: Option<Arc<ConversationStore>>,
    conversation_id: String,
    message: String,
    reply: String,
    fragments: usize,
    outcome: StreamOutcome,
}

impl ExchangeCommit {
    fn new(store: Option<Arc<ConversationStore>>, conversation_id: String, message: String) -> Self {
        Self {
            store,
            conversation_id,
            message,
            reply: String::new(),
            fragments: 0,
            outcome: StreamOutcome::Cancelled,
        }
    }

    fn record(&mut self, fragment: &str) {
        self.reply.push_str(fragment);
        self.fragments += 1;
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        self.outcome = outcome;
    }
}

impl Drop for ExchangeCommit {
    fn drop(&mut self) {
        info!(
            "Stream {} for conversation {}: {} fragment(s), {} bytes",
            self.outcome,
            self.conversation_id,
            self.fragments,
            self.reply.len()
        );

        let Some(store) = &self.store else {
            return;
        };
        store.append(&self.conversation_id, Role::User, std::mem::take(&mut self.message));
        if self.fragments > 0 {
            store.append(&self.conversation_id, Role::Assistant, std::mem::take(&mut self.reply));
        }
    }
}

/// Live reply relayed to the caller.
///
/// Yields plain text fragments; backend failures after the first fragment end
/// the stream early instead of surfacing as items.
///
/// The transport stops a stream by dropping it when the client goes away.
/// [`ChatService::shutdown`] stops every live stream at its next fragment
/// boundary. Either way the exchange relayed so far is committed.
pub struct ChatStream {
    conversation_id: String,
    fragments: BoxStream<'static, String>,
}

impl ChatStream {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl Stream for ChatStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.fragments.poll_next_unpin(cx)
    }
}

/// Couples conversation memory to the generation backend.
pub struct ChatService {
    provider: Arc<dyn LlmProvider>,
    store: Arc<ConversationStore>,
    config: ChatConfig,
    /// Parent of every stream's cancellation token
    shutdown: CancellationToken,
}

impl ChatService {
    pub fn new(provider: Arc<dyn LlmProvider>, store: Arc<ConversationStore>, config: ChatConfig) -> Self {
        Self {
            provider,
            store,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancels all live streams. Streams started afterwards end before
    /// relaying anything.
    pub fn shutdown(&self) {
        info!("Cancelling live chat streams");
        self.shutdown.cancel();
    }

    fn memory(&self) -> Option<Arc<ConversationStore>> {
        self.config.memory_enabled.then(|| self.store.clone())
    }

    fn prepare(&self, conversation_id: &str, message: &str) -> GenerationRequest {
        let history = match self.memory() {
            Some(store) => store.get(conversation_id),
            None => Vec::new(),
        };
        debug!(
            "Conversation {}: {} remembered turn(s)",
            conversation_id,
            history.len()
        );

        GenerationRequest {
            prompt: build_prompt(&self.config.system_prompt, message, &history),
            model: self.config.model.clone(),
            options: self.config.options,
        }
    }

    /// Generates a complete reply. Memory is only written when the backend succeeds.
    pub async fn reply(&self, input: ChatInput) -> Result<ChatReply, ProviderError> {
        let conversation_id = resolve_conversation_id(input.conversation_id);
        info!(
            "Chat request: conversation={}, message_len={}, stream=false",
            conversation_id,
            input.message.len()
        );

        let request = self.prepare(&conversation_id, &input.message);
        let reply = self.provider.generate(&request).await.map_err(|e| {
            warn!("Generation failed for conversation {}: {}", conversation_id, e);
            e
        })?;

        if let Some(store) = self.memory() {
            store.append(&conversation_id, Role::User, input.message);
            store.append(&conversation_id, Role::Assistant, reply.clone());
        }

        Ok(ChatReply {
            reply,
            conversation_id,
            model: self.config.model.clone(),
            provider: self.config.provider_name.clone(),
        })
    }

    /// Starts a streamed reply.
    ///
    /// The first fragment is pulled before returning, so a backend failure
    /// before any output is returned as an error and nothing is remembered.
    /// Once a stream is returned, the user turn and whatever was relayed are
    /// committed when it ends or is dropped.
    pub async fn stream(&self, input: ChatInput) -> Result<ChatStream, ProviderError> {
        let conversation_id = resolve_conversation_id(input.conversation_id);
        info!(
            "Chat request: conversation={}, message_len={}, stream=true",
            conversation_id,
            input.message.len()
        );

        let request = self.prepare(&conversation_id, &input.message);
        let mut upstream = self.provider.generate_stream(&request).await.map_err(|e| {
            warn!("Generation stream failed to start for conversation {}: {}", conversation_id, e);
            e
        })?;

        let first = match upstream.next().await {
            Some(Ok(fragment)) => Some(fragment),
            Some(Err(e)) => {
                warn!("Generation stream failed before output for conversation {}: {}", conversation_id, e);
                return Err(e);
            }
            None => None,
        };

        let token = self.shutdown.child_token();
        let mut commit = ExchangeCommit::new(self.memory(), conversation_id.clone(), input.message);
        let log_id = conversation_id.clone();

        let fragments = async_stream::stream! {
            let mut pending = first;

            loop {
                let next = match pending.take() {
                    Some(fragment) => Some(Ok(fragment)),
                    None => tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            commit.finish(StreamOutcome::Cancelled);
                            break;
                        }
                        next = upstream.next() => next,
                    },
                };

                match next {
                    Some(Ok(fragment)) => {
                        if token.is_cancelled() {
                            commit.finish(StreamOutcome::Cancelled);
                            break;
                        }
                        commit.record(&fragment);
                        yield fragment;
                    }
                    Some(Err(e)) => {
                        warn!("Streaming error for conversation {}: {}", log_id, e);
                        commit.finish(StreamOutcome::FailedMid);
                        break;
                    }
                    None => {
                        commit.finish(StreamOutcome::Completed);
                        break;
                    }
                }
            }
        };

        Ok(ChatStream {
            conversation_id,
            fragments: Box::pin(fragments),
        })
    }
}

fn resolve_conversation_id(requested: Option<String>) -> String {
    requested
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
