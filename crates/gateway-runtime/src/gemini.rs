//! Google Gemini adapter.
//!
//! The system message becomes `systemInstruction`; the alternating
//! user/assistant sequence maps to `contents[]` with roles `user` and
//! `model`. Streaming uses `streamGenerateContent` with `alt=sse` and
//! concatenates incremental candidate deltas.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Error as EsError, Event, EventSource};
use serde_json::{json, Value};

use gateway_core::{
    FinishReason, GatewayError, GenerationResponse, Provider, ProviderDescription,
    ProviderRequest, ProviderStream, Result, Role, StreamChunk, TokenUsage,
};

use crate::support::{classify_sse, classify_status, classify_transport, retry_after_header, split_system};

const PROVIDER: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Gemini adapter configuration
#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub default_model: String,
}

impl GeminiConfig {
    pub fn new(api_key: Option<String>, base_url: Option<String>, default_model: String) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            default_model,
        }
    }
}

/// Google Gemini generateContent provider
pub struct GeminiProvider {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn api_key(&self) -> Result<&str> {
        self.config
            .api_key
            .as_deref()
            .ok_or_else(|| GatewayError::Auth("gemini API key is not configured".into()))
    }

    fn method_url(&self, model: &str, method: &str, key: &str, sse: bool) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let alt = if sse { "alt=sse&" } else { "" };
        format!("{base}/v1beta/models/{model}:{method}?{alt}key={key}")
    }

    /// Map the canonical sequence onto Gemini's contents/parts shape.
    fn build_body(req: &ProviderRequest) -> Value {
        let (system, rest) = split_system(&req.messages);
        let contents: Vec<Value> = rest
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let mut generation_config = json!({
            "temperature": req.params.temperature,
            "topP": req.params.top_p,
            "maxOutputTokens": req.params.max_tokens,
        });
        if !req.params.stop_sequences.is_empty() {
            generation_config["stopSequences"] = json!(req.params.stop_sequences);
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if let Some(system) = system {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        body
    }

    fn map_finish_reason(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("MAX_TOKENS") => FinishReason::Length,
            Some("SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT") => {
                FinishReason::Filter
            }
            Some(_) | None => FinishReason::Stop,
        }
    }

    fn candidate_text(payload: &Value) -> String {
        payload["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }

    fn parse_usage(payload: &Value) -> Option<TokenUsage> {
        let meta = payload.get("usageMetadata")?;
        Some(TokenUsage {
            input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
        })
    }

    fn parse_response(payload: &Value, model: &str) -> Result<GenerationResponse> {
        if let Some(reason) = payload["promptFeedback"]["blockReason"].as_str() {
            return Err(GatewayError::ContentFilter(format!(
                "gemini blocked the prompt: {reason}"
            )));
        }

        let finish = payload["candidates"][0]["finishReason"].as_str();
        let content = Self::candidate_text(payload);
        if content.is_empty() && matches!(finish, Some("SAFETY" | "PROHIBITED_CONTENT")) {
            return Err(GatewayError::ContentFilter(
                "gemini refused to produce output".into(),
            ));
        }

        Ok(GenerationResponse {
            content,
            usage: Self::parse_usage(payload).unwrap_or_default(),
            finish_reason: Self::map_finish_reason(finish),
            model: model.to_string(),
            provider: PROVIDER.to_string(),
        })
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn generate(&self, req: &ProviderRequest) -> Result<GenerationResponse> {
        let key = self.api_key()?;
        let url = self.method_url(&req.params.model, "generateContent", key, false);
        let body = Self::build_body(req);

        let resp = self
            .client
            .post(&url)
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
        let key = self.api_key()?.to_string();
        let url = self.method_url(&req.params.model, "streamGenerateContent", &key, true);
        let body = Self::build_body(req);

        let builder = self.client.post(&url).json(&body);
        let mut source = EventSource::new(builder)
            .map_err(|e| GatewayError::InvalidRequest(format!("gemini: {e}")))?;

        Ok(Box::pin(async_stream::stream! {
            let mut usage: Option<TokenUsage> = None;

            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(msg)) => {
                        let data: Value = match serde_json::from_str(&msg.data) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        if let Some(reason) = data["promptFeedback"]["blockReason"].as_str() {
                            yield Err(GatewayError::ContentFilter(format!(
                                "gemini blocked the prompt: {reason}"
                            )));
                            break;
                        }
                        if let Some(u) = Self::parse_usage(&data) {
                            usage = Some(u);
                        }
                        let text = Self::candidate_text(&data);
                        if !text.is_empty() {
                            yield Ok(StreamChunk::delta(text));
                        }
                        if let Some(reason) = data["candidates"][0]["finishReason"].as_str() {
                            yield Ok(StreamChunk::done(
                                usage,
                                Self::map_finish_reason(Some(reason)),
                            ));
                            break;
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
        let Some(key) = self.config.api_key.as_deref() else {
            return false;
        };
        let base = self.config.base_url.trim_end_matches('/');
        self.client
            .get(format!("{base}/v1beta/models?pageSize=1&key={key}"))
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

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::{GenConfig, GenParams, Message};
    use std::time::Duration;

    fn request() -> ProviderRequest {
        ProviderRequest {
            messages: vec![
                Message::system("be terse"),
                Message::user("hi"),
                Message::assistant("hello"),
                Message::user("go on"),
            ],
            params: GenParams::compose(
                "gemini-test",
                &[],
                &GenConfig::default(),
                Duration::from_secs(60),
            ),
        }
    }

    #[test]
    fn contents_use_user_and_model_roles() {
        let body = GeminiProvider::build_body(&request());
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
    }

    #[test]
    fn generation_config_nesting() {
        let body = GeminiProvider::build_body(&request());
        assert!(body["generationConfig"]["maxOutputTokens"].is_number());
        assert!(body["generationConfig"]["topP"].is_number());
    }

    #[test]
    fn safety_refusal_becomes_content_filter() {
        let payload = serde_json::json!({
            "candidates": [{"finishReason": "SAFETY", "content": {"parts": []}}]
        });
        let err = GeminiProvider::parse_response(&payload, "m").unwrap_err();
        assert_eq!(err.kind(), "content_filter");
    }

    #[test]
    fn response_parsing() {
        let payload = serde_json::json!({
            "candidates": [{
                "content": {"parts": [{"text": "he"}, {"text": "llo"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 2}
        });
        let resp = GeminiProvider::parse_response(&payload, "gemini-test").unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.usage.input_tokens, 8);
        assert_eq!(resp.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn missing_credential_fails_without_network() {
        let provider = GeminiProvider::new(GeminiConfig::new(None, None, "gemini-test".into()));
        let err = provider.generate(&request()).await.unwrap_err();
        assert_eq!(err.kind(), "auth_error");
    }
}
