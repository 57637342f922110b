//! # gateway-runtime
//!
//! Back-end adapters for the LLM gateway, plus the Redis-backed
//! rate-limit and session stores.
//!
//! ## Adapters
//!
//! - **anthropic**: direct Anthropic Messages API
//! - **openai_compat**: the OpenAI chat dialect, covering Groq, Azure
//!   OpenAI deployments, and self-hosted runtimes (vLLM, LM Studio)
//! - **gemini**: Google Gemini generateContent API
//! - **bedrock**: AWS Bedrock InvokeModel, with the request body
//!   selected by model-id prefix (Claude, Llama, Titan)
//! - **ollama**: local inference via Ollama
//!
//! Every adapter translates back-end failures into the canonical
//! taxonomy and performs no retries of its own.

pub mod anthropic;
pub mod bedrock;
pub mod gemini;
pub mod ollama;
pub mod openai_compat;
pub mod store;
mod support;

pub use anthropic::{AnthropicConfig, AnthropicProvider};
pub use bedrock::BedrockProvider;
pub use gemini::{GeminiConfig, GeminiProvider};
pub use ollama::{OllamaConfig, OllamaProvider};
pub use openai_compat::{OpenAiCompatProvider, OpenAiDialect};
pub use store::{RedisRateLimitStore, RedisSessionStore};

// Re-export core types for convenience
pub use gateway_core::{
    ChunkStream, GatewayError, GenerationRequest, GenerationResponse, Provider, ProviderRequest,
    Result, StreamChunk,
};
