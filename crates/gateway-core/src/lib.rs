//! # gateway-core
//!
//! Provider-agnostic LLM gateway core: one logical `generate` call is
//! multiplexed across heterogeneous inference back ends with typed
//! fallback, circuit-breaker health tracking, sliding-window rate
//! limiting, and TTL session persistence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Gateway                              │
//! │  ┌───────────┐  ┌─────────────┐  ┌────────────────────────┐  │
//! │  │   Model   │  │   Health    │  │   Provider             │  │
//! │  │  Registry │──│   Table     │──│   (adapter trait)      │  │
//! │  └───────────┘  └─────────────┘  └────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!        RateLimitStore ──┘            └── SessionStore
//! ```
//!
//! The `Provider` trait enables swapping between Anthropic, Bedrock,
//! Gemini, Groq, Azure OpenAI, Ollama, or any self-hosted runtime
//! without changing gateway logic. The registry decides which model a
//! named agent resolves to; the health table decides which providers
//! are worth trying; the gateway walks the fallback chain.

pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod message;
pub mod provider;
pub mod ratelimit;
pub mod registry;
pub mod session;

pub use config::{GenConfig, GenParams, ParamOverlay};
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayBuilder, ProviderStatus};
pub use health::{CircuitState, HealthTable, ProviderHealth};
pub use message::{Message, Role};
pub use provider::{
    ChunkStream, FinishReason, GenerationRequest, GenerationResponse, Provider,
    ProviderDescription, ProviderRequest, ProviderStream, StreamChunk, TokenUsage,
};
pub use ratelimit::{
    FailoverRateLimitStore, MemoryRateLimitStore, RateDecision, RateLimitCaps, RateLimitStore,
};
pub use registry::{ModelRegistry, ProviderEntry, RegistryDoc, Tier};
pub use session::{MemorySessionStore, SessionId, SessionRecord, SessionStore};
