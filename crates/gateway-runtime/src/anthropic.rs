//! Anthropic Messages API adapter.
//!
//! The system message is hoisted into the dedicated `system` field;
//! the remainder of the sequence is sent verbatim as role-tagged
//! messages. Streaming consumes the SSE event stream and concatenates
//! `text_delta` events into canonical chunks.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Error as EsError, Event, EventSource};
use serde_json::{json, Value};

use gateway_core::{
    FinishReason, GatewayError, GenerationResponse, Provider, ProviderDescription,
    ProviderRequest, ProviderStream, Result, StreamChunk, TokenUsage,
};

use crate::support::{classify_sse, classify_status, classify_transport, retry_after_header, split_system};

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Anthropic adapter configuration
#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    /// API key; `None` means the adapter reports an auth error without
    /// any network round-trip
    pub api_key: Option<String>,

    /// Endpoint base URL
    pub base_url: String,

    /// Model reported by `describe` and used for availability probes
    pub default_model: String,
}

impl AnthropicConfig {
    pub fn new(api_key: Option<String>, base_url: Option<String>, default_model: String) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            default_model,
        }
    }
}

/// Direct Anthropic Messages API provider
pub struct AnthropicProvider {
    client: reqwest::Client,
    config: AnthropicConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn api_key(&self) -> Result<&str> {
        self.config
            .api_key
            .as_deref()
            .ok_or_else(|| GatewayError::Auth("anthropic API key is not configured".into()))
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    /// Build the Messages API request body from a canonical request.
    fn build_body(req: &ProviderRequest, stream: bool) -> Value {
        let (system, rest) = split_system(&req.messages);
        let messages: Vec<Value> = rest
            .iter()
            .map(|m| json!({"role": m.role.to_string(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": req.params.model,
            "max_tokens": req.params.max_tokens,
            "temperature": req.params.temperature,
            "top_p": req.params.top_p,
            "messages": messages,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if !req.params.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(req.params.stop_sequences);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn map_stop_reason(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("end_turn" | "stop_sequence") => FinishReason::Stop,
            Some("max_tokens") => FinishReason::Length,
            Some("refusal") => FinishReason::Filter,
            Some(_) | None => FinishReason::Stop,
        }
    }

    fn parse_response(body: &Value, model: &str) -> Result<GenerationResponse> {
        let content = body["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<String>()
            })
            .unwrap_or_default();

        Ok(GenerationResponse {
            content,
            usage: TokenUsage {
                input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            },
            finish_reason: Self::map_stop_reason(body["stop_reason"].as_str()),
            model: body["model"].as_str().unwrap_or(model).to_string(),
            provider: PROVIDER.to_string(),
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn generate(&self, req: &ProviderRequest) -> Result<GenerationResponse> {
        let api_key = self.api_key()?;
        let body = Self::build_body(req, false);

        let resp = self
            .client
            .post(self.messages_url())
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let retry_after = retry_after_header(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(PROVIDER, status, &text, retry_after));
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| classify_transport(PROVIDER, &e))?;
        Self::parse_response(&payload, &req.params.model)
    }

    async fn generate_stream(&self, req: &ProviderRequest) -> Result<ProviderStream> {
        let api_key = self.api_key()?.to_string();
        let body = Self::build_body(req, true);

        let builder = self
            .client
            .post(self.messages_url())
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body);

        let mut source = EventSource::new(builder)
            .map_err(|e| GatewayError::InvalidRequest(format!("anthropic: {e}")))?;

        Ok(Box::pin(async_stream::stream! {
            let mut usage = TokenUsage::default();
            let mut finish = FinishReason::Stop;

            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(msg)) => {
                        let data: Value = match serde_json::from_str(&msg.data) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        match data["type"].as_str() {
                            Some("message_start") => {
                                usage.input_tokens = data["message"]["usage"]["input_tokens"]
                                    .as_u64()
                                    .unwrap_or(0)
                                    as u32;
                            }
                            Some("content_block_delta") => {
                                if let Some(text) = data["delta"]["text"].as_str() {
                                    if !text.is_empty() {
                                        yield Ok(StreamChunk::delta(text));
                                    }
                                }
                            }
                            Some("message_delta") => {
                                if let Some(n) = data["usage"]["output_tokens"].as_u64() {
                                    usage.output_tokens = n as u32;
                                }
                                finish = Self::map_stop_reason(
                                    data["delta"]["stop_reason"].as_str(),
                                );
                            }
                            Some("message_stop") => {
                                yield Ok(StreamChunk::done(Some(usage), finish));
                                break;
                            }
                            Some("error") => {
                                let message = data["error"]["message"]
                                    .as_str()
                                    .unwrap_or("unknown stream error");
                                yield Err(GatewayError::Unavailable(format!(
                                    "anthropic: {message}"
                                )));
                                break;
                            }
                            _ => {}
                        }
                    }
                    Err(EsError::StreamEnded) => break,
                    Err(err) => {
                        yield Err(classify_sse(PROVIDER, &err));
                        break;
                    }
                }
            }
            source.close();
        }))
    }

    async fn is_available(&self) -> bool {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return false;
        };
        self.client
            .get(format!(
                "{}/v1/models?limit=1",
                self.config.base_url.trim_end_matches('/')
            ))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn describe(&self) -> ProviderDescription {
        ProviderDescription {
            provider: PROVIDER.to_string(),
            default_model: self.config.default_model.clone(),
            models: vec![self.config.default_model.clone()],
            detail: if self.config.api_key.is_some() {
                None
            } else {
                Some("no credential configured".to_string())
            },
        }
    }
}
