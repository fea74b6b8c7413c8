pub mod settings;

pub use settings::{
    GenerationConfig, LlmConfig, MemoryConfig, PromptsConfig, ServerConfig, Settings,
};
