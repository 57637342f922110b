//! OpenAI chat-dialect adapter.
//!
//! One data-driven adapter covers every back end speaking the OpenAI
//! chat-completions dialect: Groq, Azure OpenAI deployments, and
//! self-hosted runtimes (vLLM, LM Studio). Per-back-end differences
//! (URL shape, auth header, api-version query) live in
//! [`OpenAiDialect`] values rather than separate adapter types.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Error as EsError, Event, EventSource};
use serde_json::{json, Value};

use gateway_core::{
    FinishReason, GatewayError, GenerationResponse, Provider, ProviderDescription,
    ProviderRequest, ProviderStream, Result, StreamChunk, TokenUsage,
};

use crate::support::{classify_sse, classify_status, classify_transport, retry_after_header};

const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const AZURE_API_VERSION: &str = "2024-06-01";

/// How requests are addressed and authenticated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UrlStyle {
    /// `{base}/chat/completions`
    OpenAi,
    /// `{base}/openai/deployments/{model}/chat/completions?api-version=...`
    AzureDeployment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `api-key: <key>` (Azure)
    ApiKeyHeader,
}

/// Everything that varies between OpenAI-dialect back ends
#[derive(Clone, Debug)]
pub struct OpenAiDialect {
    /// Provider identifier registered with the gateway
    pub provider: String,
    pub base_url: String,
    pub url_style: UrlStyle,
    pub auth_style: AuthStyle,
    /// Azure api-version query parameter
    pub api_version: Option<String>,
    /// Whether a missing credential is a hard error (false for local
    /// runtimes that accept anonymous requests)
    pub requires_credential: bool,
    pub default_model: String,
}

impl OpenAiDialect {
    /// Groq cloud API
    pub fn groq(default_model: impl Into<String>) -> Self {
        Self {
            provider: "groq".into(),
            base_url: GROQ_BASE_URL.into(),
            url_style: UrlStyle::OpenAi,
            auth_style: AuthStyle::Bearer,
            api_version: None,
            requires_credential: true,
            default_model: default_model.into(),
        }
    }

    /// Azure OpenAI resource; the resolved model doubles as the
    /// deployment name.
    pub fn azure(endpoint: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            provider: "azure".into(),
            base_url: endpoint.into(),
            url_style: UrlStyle::AzureDeployment,
            auth_style: AuthStyle::ApiKeyHeader,
            api_version: Some(AZURE_API_VERSION.into()),
            requires_credential: true,
            default_model: default_model.into(),
        }
    }

    /// A self-hosted OpenAI-compatible runtime (vLLM, LM Studio)
    pub fn self_hosted(
        provider: impl Into<String>,
        base_url: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            base_url: base_url.into(),
            url_style: UrlStyle::OpenAi,
            auth_style: AuthStyle::Bearer,
            api_version: None,
            requires_credential: false,
            default_model: default_model.into(),
        }
    }

    fn chat_url(&self, model: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        match self.url_style {
            UrlStyle::OpenAi => format!("{base}/chat/completions"),
            UrlStyle::AzureDeployment => format!(
                "{base}/openai/deployments/{model}/chat/completions?api-version={}",
                self.api_version.as_deref().unwrap_or(AZURE_API_VERSION)
            ),
        }
    }

    fn models_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        match self.url_style {
            UrlStyle::OpenAi => format!("{base}/models"),
            UrlStyle::AzureDeployment => format!(
                "{base}/openai/deployments?api-version={}",
                self.api_version.as_deref().unwrap_or(AZURE_API_VERSION)
            ),
        }
    }
}

/// Adapter for any OpenAI-dialect back end
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    dialect: OpenAiDialect,
}

impl OpenAiCompatProvider {
    pub fn new(dialect: OpenAiDialect, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            dialect,
        }
    }

    fn check_credential(&self) -> Result<()> {
        if self.dialect.requires_credential && self.api_key.is_none() {
            return Err(GatewayError::Auth(format!(
                "{} API key is not configured",
                self.dialect.provider
            )));
        }
        Ok(())
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.api_key, self.dialect.auth_style) {
            (Some(key), AuthStyle::Bearer) => builder.bearer_auth(key),
            (Some(key), AuthStyle::ApiKeyHeader) => builder.header("api-key", key),
            (None, _) => builder,
        }
    }

    fn build_body(req: &ProviderRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| json!({"role": m.role.to_string(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": req.params.model,
            "messages": messages,
            "temperature": req.params.temperature,
            "top_p": req.params.top_p,
            "max_tokens": req.params.max_tokens,
        });
        if !req.params.stop_sequences.is_empty() {
            body["stop"] = json!(req.params.stop_sequences);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn map_finish_reason(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::Filter,
            Some(_) | None => FinishReason::Stop,
        }
    }

    fn parse_usage(value: &Value) -> Option<TokenUsage> {
        let usage = value.get("usage")?;
        if usage.is_null() {
            return None;
        }
        Some(TokenUsage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }

    fn parse_response(&self, body: &Value, model: &str) -> Result<GenerationResponse> {
        let choice = &body["choices"][0];
        let content = choice["message"]["content"].as_str().unwrap_or("").to_string();

        Ok(GenerationResponse {
            content,
            usage: Self::parse_usage(body).unwrap_or_default(),
            finish_reason: Self::map_finish_reason(choice["finish_reason"].as_str()),
            model: body["model"].as_str().unwrap_or(model).to_string(),
            provider: self.dialect.provider.clone(),
        })
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.dialect.provider
    }

    async fn generate(&self, req: &ProviderRequest) -> Result<GenerationResponse> {
        self.check_credential()?;
        let provider = self.dialect.provider.clone();
        let body = Self::build_body(req, false);

        let builder = self.client.post(self.dialect.chat_url(&req.params.model));
        let resp = self
            .authorize(builder)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&provider, &e))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let retry_after = retry_after_header(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(&provider, status, &text, retry_after));
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| classify_transport(&provider, &e))?;
        self.parse_response(&payload, &req.params.model)
    }

    async fn generate_stream(&self, req: &ProviderRequest) -> Result<ProviderStream> {
        self.check_credential()?;
        let provider = self.dialect.provider.clone();
        let body = Self::build_body(req, true);

        let builder = self
            .authorize(self.client.post(self.dialect.chat_url(&req.params.model)))
            .json(&body);

        let mut source = EventSource::new(builder)
            .map_err(|e| GatewayError::InvalidRequest(format!("{provider}: {e}")))?;

        Ok(Box::pin(async_stream::stream! {
            let mut usage: Option<TokenUsage> = None;

            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(msg)) => {
                        if msg.data.trim() == "[DONE]" {
                            yield Ok(StreamChunk::done(usage, FinishReason::Stop));
                            break;
                        }
                        let data: Value = match serde_json::from_str(&msg.data) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        if let Some(u) = Self::parse_usage(&data) {
                            usage = Some(u);
                        }
                        let choice = &data["choices"][0];
                        if let Some(text) = choice["delta"]["content"].as_str() {
                            if !text.is_empty() {
                                yield Ok(StreamChunk::delta(text));
                            }
                        }
                        if let Some(reason) = choice["finish_reason"].as_str() {
                            yield Ok(StreamChunk::done(
                                usage,
                                Self::map_finish_reason(Some(reason)),
                            ));
                            break;
                        }
                    }
                    Err(EsError::StreamEnded) => break,
                    Err(err) => {
                        yield Err(classify_sse(&provider, &err));
                        break;
                    }
                }
            }
            source.close();
        }))
    }

    async fn is_available(&self) -> bool {
        if self.check_credential().is_err() {
            return false;
        }
        let builder = self.client.get(self.dialect.models_url());
        self.authorize(builder)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn describe(&self) -> ProviderDescription {
        ProviderDescription {
            provider: self.dialect.provider.clone(),
            default_model: self.dialect.default_model.clone(),
            models: vec![self.dialect.default_model.clone()],
            detail: match (self.dialect.requires_credential, &self.api_key) {
                (true, None) => Some("no credential configured".to_string()),
                _ => None,
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
            messages: vec![Message::system("be terse"), Message::user("hi")],
            params: GenParams::compose(
                "test-model",
                &[],
                &GenConfig::default(),
                Duration::from_secs(60),
            ),
        }
    }

    #[test]
    fn groq_url_shape() {
        let dialect = OpenAiDialect::groq("llama-3.3-70b-versatile");
        assert_eq!(
            dialect.chat_url("m"),
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }

    #[test]
    fn azure_url_embeds_deployment() {
        let dialect = OpenAiDialect::azure("https://myres.openai.azure.com", "gpt-4o");
        let url = dialect.chat_url("gpt-4o");
        assert!(url.contains("/openai/deployments/gpt-4o/chat/completions"));
        assert!(url.contains("api-version="));
    }

    #[test]
    fn roles_pass_through_unchanged() {
        let body = OpenAiCompatProvider::build_body(&request(), false);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(
            OpenAiCompatProvider::map_finish_reason(Some("length")),
            FinishReason::Length
        );
        assert_eq!(
            OpenAiCompatProvider::map_finish_reason(Some("content_filter")),
            FinishReason::Filter
        );
        assert_eq!(
            OpenAiCompatProvider::map_finish_reason(Some("stop")),
            FinishReason::Stop
        );
    }

    #[tokio::test]
    async fn cloud_dialects_require_credentials() {
        let provider = OpenAiCompatProvider::new(OpenAiDialect::groq("m"), None);
        let err = provider.generate(&request()).await.unwrap_err();
        assert_eq!(err.kind(), "auth_error");
    }

    #[test]
    fn self_hosted_runs_anonymously() {
        let provider = OpenAiCompatProvider::new(
            OpenAiDialect::self_hosted("vllm", "http://localhost:8000/v1", "m"),
            None,
        );
        assert!(provider.check_credential().is_ok());
    }

    #[test]
    fn usage_parsed_when_present() {
        let body = serde_json::json!({
            "usage": {"prompt_tokens": 10, "completion_tokens": 4}
        });
        let usage = OpenAiCompatProvider::parse_usage(&body).unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 4);
    }
}
