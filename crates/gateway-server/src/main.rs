//! LLM Gateway HTTP Server
//!
//! Axum-based surface wiring the registry, adapters, stores, and
//! middleware into the request path:
//! auth → rate limit → session load → gateway → session save.

mod auth;
mod config;
mod error;
mod handlers;
mod ratelimit;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway_core::{
    FailoverRateLimitStore, Gateway, MemoryRateLimitStore, MemorySessionStore, ModelRegistry,
    Provider, RateLimitStore, SessionStore, Tier,
};
use gateway_runtime::{
    AnthropicConfig, AnthropicProvider, BedrockProvider, GeminiConfig, GeminiProvider,
    OllamaConfig, OllamaProvider, OpenAiCompatProvider, OpenAiDialect, RedisRateLimitStore,
    RedisSessionStore,
};

use crate::auth::{auth_middleware, Authenticator};
use crate::config::{ServerSettings, SessionBackend};
use crate::handlers::{chat, chat_stream, delete_session, get_session, health, live, ready};
use crate::ratelimit::ratelimit_middleware;
use crate::state::AppState;

/// Build an adapter per enabled registry entry. Cloud providers with
/// no resolvable credential are skipped (and logged) so the fallback
/// chain never wastes an attempt on them.
async fn build_providers(registry: &ModelRegistry) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    for (id, entry) in registry.enabled_providers() {
        let credential = registry.credential(id);
        let base_url = registry.base_url(id);
        let default_model = entry
            .models
            .get(&Tier::Default)
            .or_else(|| entry.models.values().next())
            .cloned()
            .unwrap_or_default();

        match id {
            "anthropic" => {
                if credential.is_some() {
                    providers.push(Arc::new(AnthropicProvider::new(AnthropicConfig::new(
                        credential,
                        base_url,
                        default_model,
                    ))));
                } else {
                    tracing::warn!("anthropic enabled but no credential resolved, skipping");
                }
            }
            "gemini" => {
                if credential.is_some() {
                    providers.push(Arc::new(GeminiProvider::new(GeminiConfig::new(
                        credential,
                        base_url,
                        default_model,
                    ))));
                } else {
                    tracing::warn!("gemini enabled but no credential resolved, skipping");
                }
            }
            "groq" => {
                if credential.is_some() {
                    providers.push(Arc::new(OpenAiCompatProvider::new(
                        OpenAiDialect::groq(default_model),
                        credential,
                    )));
                } else {
                    tracing::warn!("groq enabled but no credential resolved, skipping");
                }
            }
            "azure" => match (&credential, &base_url) {
                (Some(_), Some(endpoint)) => {
                    providers.push(Arc::new(OpenAiCompatProvider::new(
                        OpenAiDialect::azure(endpoint.clone(), default_model),
                        credential,
                    )));
                }
                _ => {
                    tracing::warn!("azure needs both a credential and a base_url, skipping");
                }
            },
            "bedrock" => {
                providers.push(Arc::new(BedrockProvider::from_env(default_model).await));
            }
            "ollama" => {
                providers.push(Arc::new(OllamaProvider::from_config(
                    OllamaConfig::from_base_url(base_url.as_deref(), default_model),
                )));
            }
            other => {
                // Any other id is treated as a self-hosted
                // OpenAI-compatible runtime.
                if let Some(base) = base_url {
                    providers.push(Arc::new(OpenAiCompatProvider::new(
                        OpenAiDialect::self_hosted(other, base, default_model),
                        credential,
                    )));
                } else {
                    tracing::warn!(provider = other, "no base_url for self-hosted runtime, skipping");
                }
            }
        }
    }

    providers
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let settings = ServerSettings::from_env()?;

    // Model registry: immutable after load, explicit reload only.
    let registry = Arc::new(ModelRegistry::load_path(&settings.registry_path)?);
    tracing::info!(
        path = %settings.registry_path,
        primary = registry.default_provider(),
        chain = ?registry.fallback_chain(),
        "model registry loaded"
    );

    let adapters = build_providers(&registry).await;
    if adapters.is_empty() {
        tracing::warn!("no provider adapters constructed; every request will fail over to nothing");
    } else {
        tracing::info!(count = adapters.len(), "provider adapters ready");
    }

    let mut builder = Gateway::builder(Arc::clone(&registry));
    for adapter in adapters {
        builder = builder.register(adapter);
    }
    let gateway = builder.build();

    // Rate-limit store: Redis when configured, degrading to per-node.
    let limiter: Arc<dyn RateLimitStore> = match &settings.rate_limit.redis_url {
        Some(url) => match RedisRateLimitStore::connect(url).await {
            Ok(redis) => {
                tracing::info!("cluster-wide rate limiting via redis");
                Arc::new(FailoverRateLimitStore::new(
                    Arc::new(redis),
                    Arc::new(MemoryRateLimitStore::new()),
                ))
            }
            Err(e) => {
                tracing::warn!("redis rate-limit store unreachable ({e}), using in-memory store");
                Arc::new(MemoryRateLimitStore::new())
            }
        },
        None => Arc::new(MemoryRateLimitStore::new()),
    };

    // Session store per configuration.
    let sessions: Arc<dyn SessionStore> = match settings.session.backend {
        SessionBackend::Redis => {
            let url = settings
                .session
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("redis session backend without url"))?;
            let store =
                RedisSessionStore::connect(url, &settings.session.prefix, Duration::from_secs(5))
                    .await?;
            tracing::info!("session persistence via redis");
            Arc::new(store)
        }
        SessionBackend::Memory => {
            Arc::new(MemorySessionStore::new(settings.session.max_sessions))
        }
    };

    let auth = Arc::new(Authenticator::from_settings(&settings.auth)?);
    if settings.auth.enabled {
        tracing::info!("bearer-token authentication enabled");
    } else {
        tracing::warn!("authentication disabled, using demo identity");
    }

    let bind_addr = settings.bind_addr.clone();
    let state = AppState {
        gateway,
        sessions,
        limiter,
        auth,
        settings: Arc::new(settings),
    };

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router. Auth runs outermost so the rate limiter can key on
    // the authenticated tenant.
    let app = Router::new()
        .route("/chat", post(chat))
        .route("/chat/stream", get(chat_stream))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/live", get(live))
        .layer(middleware::from_fn_with_state(state.clone(), ratelimit_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("gateway server listening on http://{bind_addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
