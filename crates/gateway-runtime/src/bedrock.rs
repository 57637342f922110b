//! AWS Bedrock adapter.
//!
//! One adapter fronts every Bedrock-hosted model family; the request
//! body format is selected by model-id prefix rather than by subtype:
//!
//! - `anthropic.*`: Claude messages payload (system hoisted)
//! - `meta.llama*`: single prompt rendered with Llama special tokens
//! - `amazon.titan*`: `inputText` plus a nested generation config
//!
//! Streaming uses `InvokeModelWithResponseStream`; each event carries
//! a JSON payload part in the same per-family shape.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_bedrockruntime::error::SdkError;
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::ResponseStream;
use aws_sdk_bedrockruntime::Client;
use serde_json::{json, Value};

use gateway_core::{
    FinishReason, GatewayError, GenerationResponse, Message, Provider, ProviderDescription,
    ProviderRequest, ProviderStream, Result, Role, StreamChunk, TokenUsage,
};

use crate::support::split_system;

const PROVIDER: &str = "bedrock";

/// Model family, derived from the model-id prefix
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ModelFamily {
    Claude,
    Llama,
    Titan,
}

fn model_family(model: &str) -> Result<ModelFamily> {
    // Inference profiles prefix a region ("us.anthropic...."), so a
    // substring match covers both direct ids and profiles.
    if model.contains("anthropic.") {
        Ok(ModelFamily::Claude)
    } else if model.contains("meta.llama") {
        Ok(ModelFamily::Llama)
    } else if model.contains("amazon.titan") {
        Ok(ModelFamily::Titan)
    } else {
        Err(GatewayError::ModelNotFound(format!(
            "bedrock adapter has no body mapping for '{model}'"
        )))
    }
}

fn render_llama_prompt(messages: &[Message]) -> String {
    let mut out = String::from("<|begin_of_text|>");
    for m in messages {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        out.push_str("<|start_header_id|>");
        out.push_str(role);
        out.push_str("<|end_header_id|>\n\n");
        out.push_str(&m.content);
        out.push_str("<|eot_id|>");
    }
    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    out
}

fn render_titan_prompt(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        match m.role {
            Role::System => {
                out.push_str(&m.content);
                out.push_str("\n\n");
            }
            Role::User => {
                out.push_str("User: ");
                out.push_str(&m.content);
                out.push('\n');
            }
            Role::Assistant => {
                out.push_str("Bot: ");
                out.push_str(&m.content);
                out.push('\n');
            }
        }
    }
    out.push_str("Bot:");
    out
}

fn build_body(family: ModelFamily, req: &ProviderRequest) -> Value {
    match family {
        ModelFamily::Claude => {
            let (system, rest) = split_system(&req.messages);
            let messages: Vec<Value> = rest
                .iter()
                .map(|m| json!({"role": m.role.to_string(), "content": m.content}))
                .collect();
            let mut body = json!({
                "anthropic_version": "bedrock-2023-05-31",
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
            body
        }
        ModelFamily::Llama => json!({
            "prompt": render_llama_prompt(&req.messages),
            "max_gen_len": req.params.max_tokens,
            "temperature": req.params.temperature,
            "top_p": req.params.top_p,
        }),
        ModelFamily::Titan => {
            let mut config = json!({
                "maxTokenCount": req.params.max_tokens,
                "temperature": req.params.temperature,
                "topP": req.params.top_p,
            });
            if !req.params.stop_sequences.is_empty() {
                config["stopSequences"] = json!(req.params.stop_sequences);
            }
            json!({
                "inputText": render_titan_prompt(&req.messages),
                "textGenerationConfig": config,
            })
        }
    }
}

fn parse_payload(family: ModelFamily, payload: &Value, model: &str) -> GenerationResponse {
    let (content, usage, finish) = match family {
        ModelFamily::Claude => {
            let content = payload["content"]
                .as_array()
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter_map(|b| b["text"].as_str())
                        .collect::<String>()
                })
                .unwrap_or_default();
            let usage = TokenUsage {
                input_tokens: payload["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: payload["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            };
            let finish = match payload["stop_reason"].as_str() {
                Some("max_tokens") => FinishReason::Length,
                _ => FinishReason::Stop,
            };
            (content, usage, finish)
        }
        ModelFamily::Llama => {
            let content = payload["generation"].as_str().unwrap_or("").to_string();
            let usage = TokenUsage {
                input_tokens: payload["prompt_token_count"].as_u64().unwrap_or(0) as u32,
                output_tokens: payload["generation_token_count"].as_u64().unwrap_or(0) as u32,
            };
            let finish = match payload["stop_reason"].as_str() {
                Some("length") => FinishReason::Length,
                _ => FinishReason::Stop,
            };
            (content, usage, finish)
        }
        ModelFamily::Titan => {
            let result = &payload["results"][0];
            let content = result["outputText"].as_str().unwrap_or("").to_string();
            let usage = TokenUsage {
                input_tokens: payload["inputTextTokenCount"].as_u64().unwrap_or(0) as u32,
                output_tokens: result["tokenCount"].as_u64().unwrap_or(0) as u32,
            };
            let finish = match result["completionReason"].as_str() {
                Some("LENGTH") => FinishReason::Length,
                Some("CONTENT_FILTERED") => FinishReason::Filter,
                _ => FinishReason::Stop,
            };
            (content, usage, finish)
        }
    };

    GenerationResponse {
        content,
        usage,
        finish_reason: finish,
        model: model.to_string(),
        provider: PROVIDER.to_string(),
    }
}

/// Accumulates per-family stream payloads into canonical chunks.
struct StreamState {
    family: ModelFamily,
    usage: TokenUsage,
    finish: FinishReason,
}

impl StreamState {
    fn new(family: ModelFamily) -> Self {
        Self {
            family,
            usage: TokenUsage::default(),
            finish: FinishReason::Stop,
        }
    }

    /// Ingest one payload part; returns chunks to emit. A `Done`
    /// element means the stream is complete.
    fn ingest(&mut self, data: &Value) -> Vec<StreamChunk> {
        // The invocation-metrics trailer is family-independent.
        if let Some(metrics) = data.get("amazon-bedrock-invocationMetrics") {
            self.usage.input_tokens = metrics["inputTokenCount"].as_u64().unwrap_or(0) as u32;
            self.usage.output_tokens = metrics["outputTokenCount"].as_u64().unwrap_or(0) as u32;
        }

        match self.family {
            ModelFamily::Claude => match data["type"].as_str() {
                Some("message_start") => {
                    self.usage.input_tokens = data["message"]["usage"]["input_tokens"]
                        .as_u64()
                        .unwrap_or(self.usage.input_tokens as u64)
                        as u32;
                    vec![]
                }
                Some("content_block_delta") => data["delta"]["text"]
                    .as_str()
                    .filter(|t| !t.is_empty())
                    .map(|t| vec![StreamChunk::delta(t)])
                    .unwrap_or_default(),
                Some("message_delta") => {
                    if let Some(n) = data["usage"]["output_tokens"].as_u64() {
                        self.usage.output_tokens = n as u32;
                    }
                    if data["delta"]["stop_reason"].as_str() == Some("max_tokens") {
                        self.finish = FinishReason::Length;
                    }
                    vec![]
                }
                Some("message_stop") => {
                    vec![StreamChunk::done(Some(self.usage), self.finish)]
                }
                _ => vec![],
            },
            ModelFamily::Llama => {
                let mut out = Vec::new();
                if let Some(text) = data["generation"].as_str() {
                    if !text.is_empty() {
                        out.push(StreamChunk::delta(text));
                    }
                }
                if let Some(reason) = data["stop_reason"].as_str() {
                    if reason == "length" {
                        self.finish = FinishReason::Length;
                    }
                    out.push(StreamChunk::done(Some(self.usage), self.finish));
                }
                out
            }
            ModelFamily::Titan => {
                let mut out = Vec::new();
                if let Some(text) = data["outputText"].as_str() {
                    if !text.is_empty() {
                        out.push(StreamChunk::delta(text));
                    }
                }
                if let Some(reason) = data["completionReason"].as_str() {
                    self.finish = match reason {
                        "LENGTH" => FinishReason::Length,
                        "CONTENT_FILTERED" => FinishReason::Filter,
                        _ => FinishReason::Stop,
                    };
                    out.push(StreamChunk::done(Some(self.usage), self.finish));
                }
                out
            }
        }
    }
}

/// AWS Bedrock InvokeModel provider
pub struct BedrockProvider {
    client: Client,
    has_credentials: bool,
    default_model: String,
}

impl BedrockProvider {
    /// Build from the ambient AWS environment (profile, instance role,
    /// or static keys).
    pub async fn from_env(default_model: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let has_credentials = config.credentials_provider().is_some();
        Self {
            client: Client::new(&config),
            has_credentials,
            default_model: default_model.into(),
        }
    }

    pub fn new(client: Client, default_model: impl Into<String>) -> Self {
        Self {
            client,
            has_credentials: true,
            default_model: default_model.into(),
        }
    }

    fn check_credentials(&self) -> Result<()> {
        if !self.has_credentials {
            return Err(GatewayError::Auth(
                "no AWS credentials resolved for bedrock".into(),
            ));
        }
        Ok(())
    }
}

fn classify_invoke_error<E, R>(err: SdkError<E, R>) -> GatewayError
where
    E: BedrockServiceError + std::fmt::Display,
    SdkError<E, R>: std::fmt::Display,
{
    match err {
        SdkError::TimeoutError(_) => GatewayError::Timeout("bedrock request timed out".into()),
        SdkError::DispatchFailure(_) => {
            GatewayError::Network("bedrock request could not be dispatched".into())
        }
        SdkError::ServiceError(ctx) => {
            let service = ctx.into_err();
            let message = service.to_string();
            if service.is_throttling() {
                GatewayError::rate_limited(format!("bedrock: {message}"))
            } else if service.is_access_denied() {
                GatewayError::Auth(format!("bedrock: {message}"))
            } else if service.is_not_found() {
                GatewayError::ModelNotFound(format!("bedrock: {message}"))
            } else if service.is_validation() {
                GatewayError::InvalidRequest(format!("bedrock: {message}"))
            } else {
                GatewayError::Unavailable(format!("bedrock: {message}"))
            }
        }
        other => GatewayError::Unavailable(format!("bedrock: {other}")),
    }
}

/// The SDK's per-operation error enums share no trait; this adapter
/// only needs the canonical classification.
trait BedrockServiceError {
    fn is_throttling(&self) -> bool;
    fn is_access_denied(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_validation(&self) -> bool;
}

impl BedrockServiceError
    for aws_sdk_bedrockruntime::operation::invoke_model::InvokeModelError
{
    fn is_throttling(&self) -> bool {
        self.is_throttling_exception()
    }
    fn is_access_denied(&self) -> bool {
        self.is_access_denied_exception()
    }
    fn is_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
    fn is_validation(&self) -> bool {
        self.is_validation_exception()
    }
}

impl BedrockServiceError
    for aws_sdk_bedrockruntime::operation::invoke_model_with_response_stream::InvokeModelWithResponseStreamError
{
    fn is_throttling(&self) -> bool {
        self.is_throttling_exception()
    }
    fn is_access_denied(&self) -> bool {
        self.is_access_denied_exception()
    }
    fn is_not_found(&self) -> bool {
        self.is_resource_not_found_exception()
    }
    fn is_validation(&self) -> bool {
        self.is_validation_exception()
    }
}

#[async_trait]
impl Provider for BedrockProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn generate(&self, req: &ProviderRequest) -> Result<GenerationResponse> {
        self.check_credentials()?;
        let family = model_family(&req.params.model)?;
        let body = build_body(family, req);

        let output = self
            .client
            .invoke_model()
            .model_id(&req.params.model)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(serde_json::to_vec(&body)?))
            .send()
            .await
            .map_err(classify_invoke_error)?;

        let payload: Value = serde_json::from_slice(output.body().as_ref())?;
        Ok(parse_payload(family, &payload, &req.params.model))
    }

    async fn generate_stream(&self, req: &ProviderRequest) -> Result<ProviderStream> {
        self.check_credentials()?;
        let family = model_family(&req.params.model)?;
        let body = build_body(family, req);

        let output = self
            .client
            .invoke_model_with_response_stream()
            .model_id(&req.params.model)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(serde_json::to_vec(&body)?))
            .send()
            .await
            .map_err(classify_invoke_error)?;

        let mut receiver = output.body;
        Ok(Box::pin(async_stream::stream! {
            let mut state = StreamState::new(family);
            loop {
                match receiver.recv().await {
                    Ok(Some(ResponseStream::Chunk(part))) => {
                        let Some(bytes) = part.bytes() else { continue };
                        let data: Value = match serde_json::from_slice(bytes.as_ref()) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        for chunk in state.ingest(&data) {
                            let terminal = chunk.is_terminal();
                            yield Ok(chunk);
                            if terminal {
                                return;
                            }
                        }
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) => {
                        yield Ok(StreamChunk::done(Some(state.usage), state.finish));
                        return;
                    }
                    Err(err) => {
                        yield Err(GatewayError::Unavailable(format!(
                            "bedrock stream failed: {err}"
                        )));
                        return;
                    }
                }
            }
        }))
    }

    async fn is_available(&self) -> bool {
        self.has_credentials
    }

    async fn describe(&self) -> ProviderDescription {
        ProviderDescription {
            provider: PROVIDER.to_string(),
            default_model: self.default_model.clone(),
            models: vec![self.default_model.clone()],
            detail: if self.has_credentials {
                None
            } else {
                Some("no AWS credentials resolved".to_string())
            },
        }
    }
}
