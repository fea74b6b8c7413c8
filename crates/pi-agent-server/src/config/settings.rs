use anyhow::{Context, Result};
use config::{Config, Environment, File, Map};
use serde::{Deserialize, Deserializer, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful, concise assistant. \
Answer the user's question directly, keep replies short unless asked for detail, \
and say so plainly when you do not know something.";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub generation: GenerationConfig,
    pub memory: MemoryConfig,
    pub prompts: PromptsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    /// Backend name, only `ollama` is wired up
    pub provider: String,
    pub base_url: String,
    pub model: String,
    /// Total deadline for a non-streamed reply
    pub timeout_seconds: u64,
    /// Longest silence allowed while a reply is streamed
    pub stream_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "qwen2.5:3b-instruct".to_string(),
            timeout_seconds: 60,
            stream_timeout_seconds: 120,
            connect_timeout_seconds: 10,
        }
    }
}

/// Generation caps forwarded to the backend as-is.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub context_tokens: u32,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            context_tokens: 2048,
            max_output_tokens: 200,
        }
    }
}

/// Raw memory limits. Out-of-range values are clamped by the store, not rejected here.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    #[serde(deserialize_with = "deserialize_flag")]
    pub enabled: bool,
    pub max_turns: i64,
    /// 0 disables expiry
    pub ttl_seconds: i64,
    pub max_conversations: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_turns: 8,
            ttl_seconds: 3600,
            max_conversations: 500,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PromptsConfig {
    pub system_prompt: String,
    /// When set, overrides `system_prompt` with the file contents
    pub system_prompt_file: Option<PathBuf>,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            system_prompt_file: None,
        }
    }
}

impl PromptsConfig {
    pub fn resolve_system_prompt(&self) -> Result<String> {
        match &self.system_prompt_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read system prompt file {}", path.display()))?;
                Ok(text.trim().to_string())
            }
            None => Ok(self.system_prompt.trim().to_string()),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_sources(None)
    }

    /// Builds settings from the optional settings file and the environment.
    /// `env` replaces the process environment when given.
    pub fn from_sources(env: Option<Map<String, String>>) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .host
            .parse()
            .with_context(|| format!("Invalid server host {}", self.server.host))?;
        Ok(SocketAddr::from((ip, self.server.port)))
    }
}

/// Accepts a real bool, 0/1, or one of `1/true/yes/y` in any case.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => value,
        Flag::Int(value) => value == 1,
        Flag::Text(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y"
        ),
    })
}
