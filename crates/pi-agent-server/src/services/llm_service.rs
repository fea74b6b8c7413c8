use crate::config::{GenerationConfig, LlmConfig};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Lazily produced reply fragments. An `Err` item ends the sequence.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// The generation backend could not produce (more) output.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Backend HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Unexpected backend reply: {0}")]
    Malformed(String),

    #[error("Backend sent nothing for {0:?}")]
    Timeout(Duration),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
}

/// Longest stream line accepted before the reply is rejected.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Bounds applied while reading a streamed reply.
#[derive(Debug, Clone, Copy)]
struct StreamLimits {
    /// Longest silence allowed between two body chunks
    read_timeout: Duration,
    max_line_bytes: usize,
}

/// Generation caps passed through to the backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub context_tokens: u32,
    pub max_output_tokens: u32,
}

impl From<&GenerationConfig> for GenerationOptions {
    fn from(cfg: &GenerationConfig) -> Self {
        Self {
            temperature: cfg.temperature,
            context_tokens: cfg.context_tokens,
            max_output_tokens: cfg.max_output_tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
    pub options: GenerationOptions,
}

/// Text generation backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete reply in one piece.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError>;

    /// Reply as a fragment stream. Errors may surface before or after fragments.
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<FragmentStream, ProviderError>;
}

/// Builds the configured backend.
pub fn from_settings(cfg: &LlmConfig) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    match cfg.provider.trim().to_lowercase().as_str() {
        "ollama" => Ok(Arc::new(OllamaService::new(cfg.clone())?)),
        other => Err(ProviderError::UnknownProvider(other.to_string())),
    }
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_ctx: u32,
    num_predict: u32,
}

impl<'a> OllamaGenerateRequest<'a> {
    fn new(request: &'a GenerationRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            prompt: &request.prompt,
            stream,
            options: OllamaOptions {
                temperature: request.options.temperature,
                num_ctx: request.options.context_tokens,
                num_predict: request.options.max_output_tokens,
            },
        }
    }
}

/// Ollama `/api/generate` client.
#[derive(Clone)]
pub struct OllamaService {
    client: Client,
    config: LlmConfig,
}

impl OllamaService {
    pub fn new(config: LlmConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.config.base_url.trim_end_matches('/'))
    }

    fn stream_limits(&self) -> StreamLimits {
        StreamLimits {
            read_timeout: Duration::from_secs(self.config.stream_timeout_seconds),
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    fn request(&self, request: &GenerationRequest, stream: bool) -> RequestBuilder {
        self.client
            .post(self.endpoint())
            .json(&OllamaGenerateRequest::new(request, stream))
    }
}

async fn check_status(response: Response) -> Result<Response, ProviderError> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Status { status, body });
    }
    Ok(response)
}

#[async_trait]
impl LlmProvider for OllamaService {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        debug!("Starting generation with model {}", request.model);

        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let response = self.request(request, false).timeout(timeout).send().await?;
        let bytes = check_status(response).await?.bytes().await?;

        let body: Value = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::Malformed(format!("invalid JSON body: {}", e)))?;

        if let Some(message) = error_message(&body) {
            return Err(ProviderError::Backend(message));
        }

        match body.get("response") {
            None | Some(Value::Null) => Ok(String::new()),
            Some(Value::String(reply)) => Ok(reply.clone()),
            Some(other) => Err(ProviderError::Malformed(format!(
                "response field is not text: {}",
                other
            ))),
        }
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<FragmentStream, ProviderError> {
        debug!("Starting generation stream with model {}", request.model);

        // No total deadline here: a long reply may take minutes. Only silence
        // longer than the read timeout fails the stream.
        let limits = self.stream_limits();
        let response = tokio::time::timeout(limits.read_timeout, self.request(request, true).send())
            .await
            .map_err(|_| ProviderError::Timeout(limits.read_timeout))??;
        let response = check_status(response).await?;
        Ok(ndjson_fragments(response.bytes_stream(), limits))
    }
}

/// Non-empty `error` field of a backend object, rendered as text.
fn error_message(body: &Value) -> Option<String> {
    match body.get("error")? {
        Value::Null | Value::Bool(false) => None,
        Value::String(message) if message.is_empty() => None,
        Value::String(message) => Some(message.clone()),
        other => Some(other.to_string()),
    }
}

/// Decodes one stream line into an optional fragment and an optional error.
/// Blank and non-JSON lines decode to nothing.
fn decode_line(line: &[u8]) -> (Option<String>, Option<ProviderError>) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return (None, None);
    }

    let Ok(body) = serde_json::from_str::<Value>(text) else {
        debug!("Skipping undecodable stream line");
        return (None, None);
    };

    let fragment = body
        .get("response")
        .and_then(Value::as_str)
        .filter(|fragment| !fragment.is_empty())
        .map(str::to_string);
    let error = error_message(&body).map(ProviderError::Backend);

    (fragment, error)
}

/// Turns a newline-delimited JSON body into fragments. Lines may span
/// several network chunks and are only decoded once complete.
fn ndjson_fragments<S, B, E>(body: S, limits: StreamLimits) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ProviderError> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut body = Box::pin(body);
        let mut buffer: Vec<u8> = Vec::new();
        let mut finished = false;

        while !finished {
            let next = match tokio::time::timeout(limits.read_timeout, body.next()).await {
                Ok(next) => next,
                Err(_) => {
                    yield Err(ProviderError::Timeout(limits.read_timeout));
                    return;
                }
            };

            match next {
                Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    yield Err(e.into());
                    return;
                }
                None => {
                    finished = true;
                    buffer.push(b'\n');
                }
            }

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let (fragment, error) = decode_line(&line);
                if let Some(fragment) = fragment {
                    yield Ok(fragment);
                }
                if let Some(error) = error {
                    yield Err(error);
                    return;
                }
            }

            if buffer.len() > limits.max_line_bytes {
                yield Err(ProviderError::Malformed(format!(
                    "stream line exceeds {} bytes",
                    limits.max_line_bytes
                )));
                return;
            }
        }
    };

    Box::pin(stream)
}
