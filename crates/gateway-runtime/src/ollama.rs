//! Ollama adapter for local inference.

use async_trait::async_trait;
use futures::StreamExt;
use ollama_rs::{
    generation::chat::{request::ChatMessageRequest, ChatMessage, ChatMessageResponse, MessageRole},
    models::ModelOptions as OllamaOptions,
    Ollama,
};

use gateway_core::{
    FinishReason, GatewayError, GenerationResponse, Message, Provider, ProviderDescription,
    ProviderRequest, ProviderStream, Result, Role, StreamChunk, TokenUsage,
};

const PROVIDER: &str = "ollama";

/// Ollama adapter configuration
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,

    /// Model reported by `describe`
    pub default_model: String,
}

impl OllamaConfig {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
            default_model: default_model.into(),
        }
    }

    /// Parse a `http://host:port` base URL into host/port parts.
    pub fn from_base_url(base_url: Option<&str>, default_model: impl Into<String>) -> Self {
        let mut config = Self::new(default_model);
        if let Some(url) = base_url {
            let trimmed = url.trim_end_matches('/');
            if let Some((host, port)) = trimmed.rsplit_once(':') {
                if let Ok(port) = port.parse::<u16>() {
                    config.host = host.to_string();
                    config.port = port;
                    return config;
                }
            }
            config.host = trimmed.to_string();
        }
        config
    }
}

/// Local Ollama provider
pub struct OllamaProvider {
    client: Ollama,
    config: OllamaConfig,
}

impl OllamaProvider {
    pub fn from_config(config: OllamaConfig) -> Self {
        Self {
            client: Ollama::new(&config.host, config.port),
            config,
        }
    }

    /// Convert canonical messages to Ollama format
    fn convert_messages(messages: &[Message]) -> Vec<ChatMessage> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => MessageRole::System,
                    Role::User => MessageRole::User,
                    Role::Assistant => MessageRole::Assistant,
                };
                ChatMessage::new(role, m.content.clone())
            })
            .collect()
    }

    fn build_options(req: &ProviderRequest) -> OllamaOptions {
        let mut options = OllamaOptions::default()
            .temperature(req.params.temperature)
            .top_p(req.params.top_p)
            .num_predict(req.params.max_tokens as i32);
        if !req.params.stop_sequences.is_empty() {
            options = options.stop(req.params.stop_sequences.clone());
        }
        options
    }

    fn convert_usage(response: &ChatMessageResponse) -> Option<TokenUsage> {
        response.final_data.as_ref().map(|d| TokenUsage {
            input_tokens: d.prompt_eval_count as u32,
            output_tokens: d.eval_count as u32,
        })
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn generate(&self, req: &ProviderRequest) -> Result<GenerationResponse> {
        let request = ChatMessageRequest::new(
            req.params.model.clone(),
            Self::convert_messages(&req.messages),
        )
        .options(Self::build_options(req));

        let response = self
            .client
            .send_chat_messages(request)
            .await
            .map_err(|e| GatewayError::Unavailable(format!("ollama: {e}")))?;

        Ok(GenerationResponse {
            content: response.message.content.clone(),
            usage: Self::convert_usage(&response).unwrap_or_default(),
            finish_reason: FinishReason::Stop,
            model: req.params.model.clone(),
            provider: PROVIDER.to_string(),
        })
    }

    async fn generate_stream(&self, req: &ProviderRequest) -> Result<ProviderStream> {
        let request = ChatMessageRequest::new(
            req.params.model.clone(),
            Self::convert_messages(&req.messages),
        )
        .options(Self::build_options(req));

        let stream = self
            .client
            .send_chat_messages_stream(request)
            .await
            .map_err(|e| GatewayError::Unavailable(format!("ollama: {e}")))?;

        let mapped = stream.map(|result| match result {
            Ok(chunk) => {
                if chunk.done {
                    Ok(StreamChunk::done(
                        Self::convert_usage(&chunk),
                        FinishReason::Stop,
                    ))
                } else {
                    Ok(StreamChunk::delta(chunk.message.content))
                }
            }
            Err(_) => Err(GatewayError::Unavailable(
                "ollama stream produced an error".into(),
            )),
        });

        Ok(Box::pin(mapped))
    }

    async fn is_available(&self) -> bool {
        match self.client.list_local_models().await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("ollama availability probe failed: {e}");
                false
            }
        }
    }

    async fn describe(&self) -> ProviderDescription {
        let models = self
            .client
            .list_local_models()
            .await
            .map(|models| models.into_iter().map(|m| m.name).collect())
            .unwrap_or_default();

        ProviderDescription {
            provider: PROVIDER.to_string(),
            default_model: self.config.default_model.clone(),
            models,
            detail: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = OllamaConfig::new("llama3.2");
        assert_eq!(config.host, "http://localhost");
        assert_eq!(config.port, 11434);
    }

    #[test]
    fn base_url_parsing() {
        let config = OllamaConfig::from_base_url(Some("http://ollama.internal:11435"), "m");
        assert_eq!(config.host, "http://ollama.internal");
        assert_eq!(config.port, 11435);

        let config = OllamaConfig::from_base_url(None, "m");
        assert_eq!(config.port, 11434);
    }

    #[test]
    fn message_conversion_preserves_order() {
        let messages = vec![Message::system("rules"), Message::user("hi")];
        let converted = OllamaProvider::convert_messages(&messages);
        assert_eq!(converted.len(), 2);
    }
}
