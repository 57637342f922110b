//! Gateway / Fallback Engine
//!
//! One logical `generate` call resolves to one of N registered back
//! ends by registry order and circuit-breaker health. Transferable
//! failures walk the fallback chain; non-transferable failures
//! surface immediately. Streaming commits to a provider at its first
//! chunk; after that, failures become terminal error chunks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::health::{CircuitState, HealthTable};
use crate::provider::{
    ChunkStream, FinishReason, GenerationRequest, GenerationResponse, Provider, ProviderRequest,
    StreamChunk,
};
use crate::registry::ModelRegistry;

/// Per-provider entry in the health surface
#[derive(Clone, Debug, Serialize)]
pub struct ProviderStatus {
    pub provider: String,
    pub available: bool,
    pub default_model: String,
    pub circuit: CircuitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Builder for [`Gateway`]
pub struct GatewayBuilder {
    registry: Arc<ModelRegistry>,
    providers: HashMap<String, Arc<dyn Provider>>,
    failure_threshold: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    probe_timeout: Duration,
}

impl GatewayBuilder {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            providers: HashMap::new(),
            failure_threshold: 5,
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(5),
        }
    }

    /// Register an adapter under its own name.
    pub fn register(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    /// Consecutive transferable failures before a circuit opens.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Initial open-circuit backoff (doubles per failed probe).
    pub fn base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff = backoff;
        self
    }

    /// Backoff ceiling.
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Timeout for health-surface probes.
    pub fn probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn build(self) -> Gateway {
        Gateway {
            registry: self.registry,
            providers: Arc::new(self.providers),
            health: Arc::new(HealthTable::new(
                self.failure_threshold,
                self.base_backoff,
                self.max_backoff,
            )),
            probe_timeout: self.probe_timeout,
        }
    }
}

/// The multiplexing gateway. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Gateway {
    registry: Arc<ModelRegistry>,
    providers: Arc<HashMap<String, Arc<dyn Provider>>>,
    health: Arc<HealthTable>,
    probe_timeout: Duration,
}

impl Gateway {
    pub fn builder(registry: Arc<ModelRegistry>) -> GatewayBuilder {
        GatewayBuilder::new(registry)
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Circuit state for the health surface; never mutates.
    pub fn circuit_state(&self, provider: &str) -> CircuitState {
        self.health.state_of(provider)
    }

    fn build_request(
        &self,
        provider_id: &str,
        agent: &str,
        req: &GenerationRequest,
    ) -> Result<ProviderRequest> {
        let params = self.registry.compose_params(provider_id, agent, &req.config)?;
        Ok(ProviderRequest {
            messages: req.messages.clone(),
            params,
        })
    }

    /// Jittered pause before the next candidate after a provider-side
    /// throttle, at least the provider's Retry-After when given.
    fn throttle_pause(retry_after: Option<Duration>) -> Duration {
        let base = retry_after.unwrap_or(Duration::from_millis(200));
        base + Duration::from_millis(rand::thread_rng().gen_range(25..250))
    }

    /// Generate a complete response, walking the fallback chain on
    /// transferable failures.
    pub async fn generate(
        &self,
        agent: &str,
        req: &GenerationRequest,
    ) -> Result<GenerationResponse> {
        req.validate()?;

        let mut last_err: Option<GatewayError> = None;
        let mut last_tried: Option<String> = None;

        for id in self.registry.candidates() {
            let Some(provider) = self.providers.get(&id).map(Arc::clone) else {
                continue;
            };
            let preq = self.build_request(&id, agent, req)?;
            if !self.health.admit(&id, Instant::now()) {
                debug!(provider = %id, "circuit open, skipping candidate");
                continue;
            }
            last_tried = Some(id.clone());
            debug!(provider = %id, model = %preq.params.model, agent, "attempting generation");

            let attempt = timeout(preq.params.timeout, provider.generate(&preq)).await;
            let outcome = attempt.unwrap_or_else(|_| {
                Err(GatewayError::Timeout(format!(
                    "provider '{id}' exceeded {}s",
                    preq.params.timeout.as_secs()
                )))
            });

            match outcome {
                Ok(response) => {
                    self.health.record_success(&id, Instant::now());
                    return Ok(response);
                }
                Err(err @ GatewayError::RateLimited { .. }) => {
                    // Provider-side throttle: health unchanged, but a
                    // held probe slot must go back.
                    self.health.release_probe(&id, Instant::now());
                    let retry_after = match &err {
                        GatewayError::RateLimited { retry_after, .. } => *retry_after,
                        _ => None,
                    };
                    warn!(provider = %id, "provider throttled request, trying next candidate");
                    tokio::time::sleep(Self::throttle_pause(retry_after)).await;
                    last_err = Some(err);
                }
                Err(err) if err.is_transferable() => {
                    self.health.record_failure(&id, Instant::now());
                    warn!(provider = %id, error = %err, "transferable failure, trying next candidate");
                    last_err = Some(err);
                }
                Err(err) => {
                    self.health.release_probe(&id, Instant::now());
                    return Err(err);
                }
            }
        }

        Err(last_err.unwrap_or(GatewayError::NoProviderAvailable { last_tried }))
    }

    /// Generate a canonical chunk stream.
    ///
    /// Selection and fallback run until a provider yields its first
    /// chunk; from then on the call is committed and any failure is
    /// emitted as the stream's single terminal error chunk. Dropping
    /// the stream cancels in-flight adapter I/O.
    pub fn generate_stream(&self, agent: &str, req: &GenerationRequest) -> ChunkStream {
        let gateway = self.clone();
        let agent = agent.to_string();
        let req = req.clone();

        Box::pin(async_stream::stream! {
            if let Err(err) = req.validate() {
                yield StreamChunk::error(&err);
                return;
            }

            let mut last_err: Option<GatewayError> = None;
            let mut last_tried: Option<String> = None;

            for id in gateway.registry.candidates() {
                let Some(provider) = gateway.providers.get(&id).map(Arc::clone) else {
                    continue;
                };
                let preq = match gateway.build_request(&id, &agent, &req) {
                    Ok(preq) => preq,
                    Err(err) => {
                        yield StreamChunk::error(&err);
                        return;
                    }
                };
                if !gateway.health.admit(&id, Instant::now()) {
                    debug!(provider = %id, "circuit open, skipping candidate");
                    continue;
                }
                last_tried = Some(id.clone());

                // Open the stream and wait for its first item under the
                // effective timeout; until a chunk arrives, fallback is
                // still possible.
                let opened = timeout(preq.params.timeout, async {
                    let mut stream = provider.generate_stream(&preq).await?;
                    let first = stream.next().await;
                    Ok::<_, GatewayError>((stream, first))
                })
                .await
                .unwrap_or_else(|_| {
                    Err(GatewayError::Timeout(format!(
                        "provider '{id}' produced no chunk within {}s",
                        preq.params.timeout.as_secs()
                    )))
                });

                let (mut stream, first) = match opened {
                    Ok(pair) => pair,
                    Err(err @ GatewayError::RateLimited { .. }) => {
                        gateway.health.release_probe(&id, Instant::now());
                        let retry_after = match &err {
                            GatewayError::RateLimited { retry_after, .. } => *retry_after,
                            _ => None,
                        };
                        warn!(provider = %id, "provider throttled stream, trying next candidate");
                        tokio::time::sleep(Self::throttle_pause(retry_after)).await;
                        last_err = Some(err);
                        continue;
                    }
                    Err(err) if err.is_transferable() => {
                        gateway.health.record_failure(&id, Instant::now());
                        warn!(provider = %id, error = %err, "stream open failed, trying next candidate");
                        last_err = Some(err);
                        continue;
                    }
                    Err(err) => {
                        gateway.health.release_probe(&id, Instant::now());
                        yield StreamChunk::error(&err);
                        return;
                    }
                };

                let first_chunk = match first {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(err)) if err.is_transferable() => {
                        gateway.health.record_failure(&id, Instant::now());
                        warn!(provider = %id, error = %err, "stream failed before first chunk, trying next candidate");
                        last_err = Some(err);
                        continue;
                    }
                    Some(Err(err)) => {
                        gateway.health.release_probe(&id, Instant::now());
                        yield StreamChunk::error(&err);
                        return;
                    }
                    None => {
                        // A stream with no chunks at all counts as a
                        // transferable outage.
                        let err = GatewayError::Unavailable(format!(
                            "provider '{id}' closed the stream without output"
                        ));
                        gateway.health.record_failure(&id, Instant::now());
                        last_err = Some(err);
                        continue;
                    }
                };

                // Committed: the provider delivered. No fallback past
                // this point.
                gateway.health.record_success(&id, Instant::now());
                let terminal = first_chunk.is_terminal();
                yield first_chunk;
                if terminal {
                    return;
                }

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(chunk) => {
                            let terminal = chunk.is_terminal();
                            yield chunk;
                            if terminal {
                                return;
                            }
                        }
                        Err(err) => {
                            yield StreamChunk::error(&err);
                            return;
                        }
                    }
                }

                // Adapter stream ended without a terminal chunk.
                yield StreamChunk::done(None, FinishReason::Stop);
                return;
            }

            let err = last_err.unwrap_or(GatewayError::NoProviderAvailable { last_tried });
            yield StreamChunk::error(&err);
        })
    }

    /// Probe every registered provider in parallel with a short
    /// timeout. Does not consume rate budget and does not touch the
    /// circuit breaker.
    pub async fn health_check_all(&self) -> Vec<ProviderStatus> {
        let probes = self.providers.iter().map(|(id, provider)| {
            let id = id.clone();
            let provider = Arc::clone(provider);
            let probe_timeout = self.probe_timeout;
            let circuit = self.health.state_of(&id);
            async move {
                let available = timeout(probe_timeout, provider.is_available())
                    .await
                    .unwrap_or(false);
                let description = timeout(probe_timeout, provider.describe()).await.ok();
                let (default_model, detail) = match description {
                    Some(d) => (d.default_model, d.detail),
                    None => (String::new(), Some("describe timed out".to_string())),
                };
                ProviderStatus {
                    provider: id,
                    available,
                    default_model,
                    circuit,
                    detail,
                }
            }
        });
        let mut statuses = futures::future::join_all(probes).await;
        statuses.sort_by(|a, b| a.provider.cmp(&b.provider));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenConfig;
    use crate::message::Message;
    use crate::provider::{ProviderDescription, ProviderStream, TokenUsage};
    use crate::registry::{ModelRegistry, RegistryDoc};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn test_registry(primary: &str, chain: &[&str]) -> Arc<ModelRegistry> {
        let mut yaml = String::from("providers:\n");
        let mut ids: Vec<&str> = vec![primary];
        ids.extend_from_slice(chain);
        ids.dedup();
        for id in &ids {
            yaml.push_str(&format!("  {id}:\n    models:\n      default: {id}-model\n"));
        }
        yaml.push_str(&format!("defaults:\n  provider: {primary}\n  fallback_chain: [{}]\n", chain.join(", ")));
        let doc: RegistryDoc = serde_yaml::from_str(&yaml).unwrap();
        Arc::new(ModelRegistry::from_doc(doc, None, BTreeMap::new()).unwrap())
    }

    /// Spy adapter with a scripted outcome per call.
    struct ScriptedProvider {
        name: String,
        outcomes: Mutex<std::collections::VecDeque<Result<String>>>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(name: &str, outcomes: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn next_outcome(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::Unavailable("script exhausted".into())))
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn generate(&self, req: &ProviderRequest) -> Result<GenerationResponse> {
            self.next_outcome().map(|content| GenerationResponse {
                content,
                usage: TokenUsage::default(),
                finish_reason: FinishReason::Stop,
                model: req.params.model.clone(),
                provider: self.name.clone(),
            })
        }

        async fn generate_stream(&self, _req: &ProviderRequest) -> Result<ProviderStream> {
            let outcome = self.next_outcome()?;
            let chunks = vec![
                Ok(StreamChunk::delta(outcome)),
                Ok(StreamChunk::done(None, FinishReason::Stop)),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn describe(&self) -> ProviderDescription {
            ProviderDescription {
                provider: self.name.clone(),
                default_model: format!("{}-model", self.name),
                models: vec![],
                detail: None,
            }
        }
    }

    /// Spy adapter with one scripted chunk stream.
    struct StreamingProvider {
        name: String,
        script: Mutex<Option<Vec<Result<StreamChunk>>>>,
        open_error: Mutex<Option<GatewayError>>,
        calls: AtomicU32,
    }

    impl StreamingProvider {
        fn new(name: &str, script: Vec<Result<StreamChunk>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script: Mutex::new(Some(script)),
                open_error: Mutex::new(None),
                calls: AtomicU32::new(0),
            })
        }

        fn failing_open(name: &str, err: GatewayError) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script: Mutex::new(None),
                open_error: Mutex::new(Some(err)),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for StreamingProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn generate(&self, _req: &ProviderRequest) -> Result<GenerationResponse> {
            Err(GatewayError::Unavailable("streaming-only spy".into()))
        }

        async fn generate_stream(&self, _req: &ProviderRequest) -> Result<ProviderStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.open_error.lock().unwrap().take() {
                return Err(err);
            }
            let chunks = self.script.lock().unwrap().take().unwrap_or_default();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn describe(&self) -> ProviderDescription {
            ProviderDescription {
                provider: self.name.clone(),
                default_model: String::new(),
                models: vec![],
                detail: None,
            }
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new(vec![Message::user("hi")]).unwrap()
    }

    async fn collect(stream: ChunkStream) -> Vec<StreamChunk> {
        stream.collect::<Vec<_>>().await
    }

    #[tokio::test]
    async fn fallback_on_unavailable() {
        let a = ScriptedProvider::new("a", vec![Err(GatewayError::Unavailable("down".into()))]);
        let b = ScriptedProvider::new("b", vec![Ok("ok".into())]);
        let gateway = Gateway::builder(test_registry("a", &["a", "b"]))
            .register(a.clone())
            .register(b.clone())
            .build();

        let resp = gateway.generate("any", &request()).await.unwrap();
        assert_eq!(resp.content, "ok");
        assert_eq!(resp.provider, "b");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(gateway.health.snapshot("a").unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn non_transferable_stops_the_chain() {
        let a = ScriptedProvider::new("a", vec![Err(GatewayError::Auth("bad key".into()))]);
        let b = ScriptedProvider::new("b", vec![Ok("unreachable".into())]);
        let gateway = Gateway::builder(test_registry("a", &["a", "b"]))
            .register(a.clone())
            .register(b.clone())
            .build();

        let err = gateway.generate("any", &request()).await.unwrap_err();
        assert_eq!(err.kind(), "auth_error");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 0);
        // Auth failures do not move the circuit.
        assert!(gateway.health.snapshot("a").is_none());
    }

    #[tokio::test]
    async fn provider_throttle_leaves_health_untouched() {
        let a = ScriptedProvider::new("a", vec![Err(GatewayError::rate_limited("slow down"))]);
        let b = ScriptedProvider::new("b", vec![Err(GatewayError::rate_limited("here too"))]);
        let gateway = Gateway::builder(test_registry("a", &["a", "b"]))
            .register(a.clone())
            .register(b.clone())
            .build();

        let err = gateway.generate("any", &request()).await.unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(gateway.circuit_state("a"), CircuitState::Closed);
        assert_eq!(gateway.circuit_state("b"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn circuit_opens_and_recovers() {
        let a = ScriptedProvider::new(
            "a",
            vec![
                Err(GatewayError::Unavailable("1".into())),
                Err(GatewayError::Unavailable("2".into())),
                Ok("recovered".into()),
            ],
        );
        let gateway = Gateway::builder(test_registry("a", &[]))
            .register(a.clone())
            .failure_threshold(2)
            .base_backoff(Duration::from_millis(50))
            .build();

        assert!(gateway.generate("any", &request()).await.is_err());
        assert!(gateway.generate("any", &request()).await.is_err());
        assert_eq!(gateway.circuit_state("a"), CircuitState::Open);

        // While open, the provider is not called at all.
        let err = gateway.generate("any", &request()).await.unwrap_err();
        assert_eq!(err.kind(), "no_provider_available");
        assert_eq!(a.calls(), 2);

        // Past the probe deadline, exactly one probe goes through and
        // closes the circuit.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let resp = gateway.generate("any", &request()).await.unwrap();
        assert_eq!(resp.content, "recovered");
        assert_eq!(a.calls(), 3);
        assert_eq!(gateway.circuit_state("a"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_last_error() {
        let a = ScriptedProvider::new("a", vec![Err(GatewayError::Timeout("slow".into()))]);
        let b = ScriptedProvider::new("b", vec![Err(GatewayError::Network("reset".into()))]);
        let gateway = Gateway::builder(test_registry("a", &["a", "b"]))
            .register(a)
            .register(b)
            .build();

        let err = gateway.generate("any", &request()).await.unwrap_err();
        assert_eq!(err.kind(), "network_error");
    }

    #[tokio::test]
    async fn no_registered_adapter_yields_no_provider() {
        let gateway = Gateway::builder(test_registry("a", &[])).build();
        let err = gateway.generate("any", &request()).await.unwrap_err();
        assert_eq!(err.kind(), "no_provider_available");
    }

    #[tokio::test]
    async fn stream_emits_deltas_then_done() {
        let a = StreamingProvider::new(
            "a",
            vec![
                Ok(StreamChunk::delta("He")),
                Ok(StreamChunk::delta("llo")),
                Ok(StreamChunk::done(None, FinishReason::Stop)),
            ],
        );
        let gateway = Gateway::builder(test_registry("a", &[]))
            .register(a)
            .build();

        let chunks = collect(gateway.generate_stream("any", &request())).await;
        assert_eq!(
            chunks,
            vec![
                StreamChunk::delta("He"),
                StreamChunk::delta("llo"),
                StreamChunk::done(None, FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn stream_falls_back_before_first_chunk() {
        let a = StreamingProvider::failing_open("a", GatewayError::Unavailable("down".into()));
        let b = StreamingProvider::new(
            "b",
            vec![
                Ok(StreamChunk::delta("ok")),
                Ok(StreamChunk::done(None, FinishReason::Stop)),
            ],
        );
        let gateway = Gateway::builder(test_registry("a", &["a", "b"]))
            .register(a.clone())
            .register(b.clone())
            .build();

        let chunks = collect(gateway.generate_stream("any", &request())).await;
        assert_eq!(chunks[0], StreamChunk::delta("ok"));
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn stream_error_after_first_chunk_is_terminal() {
        let a = StreamingProvider::new(
            "a",
            vec![
                Ok(StreamChunk::delta("partial")),
                Err(GatewayError::Network("reset mid-stream".into())),
            ],
        );
        let b = StreamingProvider::new("b", vec![]);
        let gateway = Gateway::builder(test_registry("a", &["a", "b"]))
            .register(a.clone())
            .register(b.clone())
            .build();

        let chunks = collect(gateway.generate_stream("any", &request())).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], StreamChunk::delta("partial"));
        assert!(matches!(&chunks[1], StreamChunk::Error { error, .. } if error == "network_error"));
        // Committed after the first chunk: no fallback to b.
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn every_stream_has_exactly_one_terminal_chunk() {
        // Adapter forgets its Done chunk; the gateway synthesizes one.
        let a = StreamingProvider::new("a", vec![Ok(StreamChunk::delta("text"))]);
        let gateway = Gateway::builder(test_registry("a", &[]))
            .register(a)
            .build();

        let chunks = collect(gateway.generate_stream("any", &request())).await;
        let terminals = chunks.iter().filter(|c| c.is_terminal()).count();
        assert_eq!(terminals, 1);
        assert!(chunks.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn health_surface_reports_all_providers() {
        let a = ScriptedProvider::new("a", vec![]);
        let b = ScriptedProvider::new("b", vec![]);
        let gateway = Gateway::builder(test_registry("a", &["a", "b"]))
            .register(a)
            .register(b)
            .build();

        let statuses = gateway.health_check_all().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.available));
        // Probing does not move any circuit.
        assert_eq!(gateway.circuit_state("a"), CircuitState::Closed);
    }
}
