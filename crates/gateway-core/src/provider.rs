//! Provider Contract
//!
//! Defines the canonical request/response/chunk types and the
//! [`Provider`] trait every back-end adapter implements. Adapters do
//! no retries of their own; retry and fallback policy belongs to the
//! gateway.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::{GenConfig, GenParams};
use crate::error::{GatewayError, Result};
use crate::message::{self, Message};

/// A validated generation request: an ordered message sequence plus
/// call-site configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub config: GenConfig,
}

impl GenerationRequest {
    /// Build a request, validating the message sequence and config.
    pub fn new(messages: Vec<Message>) -> Result<Self> {
        message::validate_sequence(&messages)?;
        Ok(Self {
            messages,
            config: GenConfig::default(),
        })
    }

    /// Attach call-site configuration (validated).
    pub fn with_config(mut self, config: GenConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Re-validate an externally-constructed request.
    pub fn validate(&self) -> Result<()> {
        message::validate_sequence(&self.messages)?;
        self.config.validate()
    }
}

/// The request an adapter receives: messages plus fully-resolved
/// parameters. The gateway composes this per candidate provider.
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    pub messages: Vec<Message>,
    pub params: GenParams,
}

/// Why generation stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
    Filter,
    Error,
}

/// Best-effort token accounting. Zeroed when the back end omits it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Response from a completed (non-streaming) generation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// The generated text
    pub content: String,

    /// Token accounting, zeroed if the back end omits it
    #[serde(default)]
    pub usage: TokenUsage,

    /// Why generation stopped
    pub finish_reason: FinishReason,

    /// Model that produced the response
    pub model: String,

    /// Provider that served the request
    pub provider: String,
}

/// One element of the canonical chunk stream.
///
/// A well-formed stream emits zero or more `Delta` chunks followed by
/// exactly one terminal chunk (`Done` or `Error`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamChunk {
    /// Incremental text
    Delta { delta: String },

    /// Successful termination, with usage when the back end reports it
    Done {
        done: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<FinishReason>,
    },

    /// Terminal failure
    Error { error: String, message: String },
}

impl StreamChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { delta: text.into() }
    }

    pub fn done(usage: Option<TokenUsage>, finish_reason: FinishReason) -> Self {
        Self::Done {
            done: true,
            usage,
            finish_reason: Some(finish_reason),
        }
    }

    pub fn error(err: &GatewayError) -> Self {
        Self::Error {
            error: err.kind().into(),
            message: err.to_string(),
        }
    }

    /// Whether this chunk ends the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// The canonical stream the gateway hands to callers. Errors are
/// in-band terminal chunks; the stream itself never fails.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// The raw stream an adapter yields: deltas and a final `Done`, with
/// back-end failures surfaced as `Err` items for the gateway to map.
pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Static description of a provider for the health surface
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderDescription {
    /// Provider identifier (e.g. "anthropic")
    pub provider: String,

    /// Model used when no tier mapping applies
    pub default_model: String,

    /// Models this adapter knows about (possibly empty)
    pub models: Vec<String>,

    /// Human-readable status detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Contract every back-end adapter implements.
///
/// Adapters are stateless aside from an HTTP/SDK client and their
/// configuration. They translate canonical requests to the back end's
/// wire format, translate failures into the canonical taxonomy, and
/// never retry.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider identifier used by the registry and health table
    fn name(&self) -> &str;

    /// Generate a complete response
    async fn generate(&self, req: &ProviderRequest) -> Result<GenerationResponse>;

    /// Generate a streaming response
    async fn generate_stream(&self, req: &ProviderRequest) -> Result<ProviderStream>;

    /// Cheap availability probe; must not consume generation quota
    async fn is_available(&self) -> bool;

    /// Describe this provider for the health surface
    async fn describe(&self) -> ProviderDescription;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn request_validates_on_construction() {
        assert!(GenerationRequest::new(vec![]).is_err());
        assert!(GenerationRequest::new(vec![Message::user("hi")]).is_ok());
    }

    #[test]
    fn chunk_wire_shapes() {
        let delta = serde_json::to_value(StreamChunk::delta("He")).unwrap();
        assert_eq!(delta, serde_json::json!({"delta": "He"}));

        let done = serde_json::to_value(StreamChunk::done(None, FinishReason::Stop)).unwrap();
        assert_eq!(done, serde_json::json!({"done": true, "finish_reason": "stop"}));

        let err = serde_json::to_value(StreamChunk::error(&GatewayError::Canceled)).unwrap();
        assert_eq!(err["error"], "canceled");
    }

    #[test]
    fn chunk_round_trips() {
        let chunk = StreamChunk::done(
            Some(TokenUsage {
                input_tokens: 3,
                output_tokens: 7,
            }),
            FinishReason::Stop,
        );
        let json = serde_json::to_string(&chunk).unwrap();
        let back: StreamChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chunk);
        assert!(back.is_terminal());
    }
}
