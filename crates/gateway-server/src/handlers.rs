//! HTTP/WebSocket Handlers

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;

use gateway_core::{
    FinishReason, GatewayError, GenConfig, GenerationRequest, Message, ProviderStatus, Result,
    SessionId, SessionRecord, StreamChunk, TokenUsage,
};

use crate::auth::Identity;
use crate::error::ApiError;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Single user turn, appended to the session history
    #[serde(default)]
    pub message: Option<String>,

    /// Full message sequence, replacing any session history
    #[serde(default)]
    pub messages: Option<Vec<Message>>,

    #[serde(default)]
    pub session_id: Option<String>,

    /// Agent name resolved through the model registry
    #[serde(default)]
    pub agent: Option<String>,

    #[serde(default)]
    pub config: Option<GenConfig>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
    pub model: String,
    pub provider: String,
    pub session_id: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub providers: Vec<ProviderStatus>,
}

/// The per-session state blob: the conversation so far.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionState {
    messages: Vec<Message>,
}

const DEFAULT_AGENT: &str = "default";

// ============================================================================
// Session plumbing
// ============================================================================

/// Load the caller's session, or start a fresh one.
///
/// A session belonging to a different tenant is indistinguishable from
/// an absent one: the caller gets a brand-new session either way.
async fn resolve_session(
    state: &AppState,
    identity: &Identity,
    session_id: Option<&str>,
) -> Result<(SessionRecord, Vec<Message>)> {
    if let Some(id) = session_id {
        if let Some(record) = state.sessions.load(&SessionId::from_string(id)).await? {
            if record.tenant == identity.tenant {
                let history: SessionState =
                    serde_json::from_value(record.state.clone()).unwrap_or_default();
                return Ok((record, history.messages));
            }
        }
    }
    let record = SessionRecord::new(
        identity.tenant.clone(),
        json!({}),
        state.settings.session.ttl_secs,
    );
    Ok((record, Vec::new()))
}

/// Assemble the message sequence for this turn.
fn build_turn(history: Vec<Message>, payload: &ChatRequest) -> Result<Vec<Message>> {
    if let Some(messages) = &payload.messages {
        if !messages.is_empty() {
            return Ok(messages.clone());
        }
    }
    if let Some(message) = &payload.message {
        let mut turn = history;
        turn.push(Message::user(message));
        return Ok(turn);
    }
    Err(GatewayError::InvalidRequest(
        "request carries neither 'message' nor 'messages'".into(),
    ))
}

async fn persist_turn(
    state: &AppState,
    mut record: SessionRecord,
    mut messages: Vec<Message>,
    assistant: &str,
) -> Result<SessionRecord> {
    messages.push(Message::assistant(assistant));
    record.state = serde_json::to_value(SessionState { messages })?;
    record.touch();
    state.sessions.save(&record).await?;
    Ok(record)
}

fn current_identity(identity: Option<Extension<Identity>>) -> Identity {
    identity.map(|Extension(i)| i).unwrap_or_else(Identity::demo)
}

// ============================================================================
// Chat
// ============================================================================

/// Main chat endpoint (non-streaming)
#[axum::debug_handler]
pub async fn chat(
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
    Json(payload): Json<ChatRequest>,
) -> std::result::Result<Json<ChatResponse>, ApiError> {
    let identity = current_identity(identity);
    let (record, history) = resolve_session(&state, &identity, payload.session_id.as_deref()).await?;

    let turn = build_turn(history, &payload)?;
    let request = GenerationRequest::new(turn.clone())?
        .with_config(payload.config.clone().unwrap_or_default())?;
    let agent = payload.agent.as_deref().unwrap_or(DEFAULT_AGENT);

    let response = state.gateway.generate(agent, &request).await?;
    let record = persist_turn(&state, record, turn, &response.content).await?;

    Ok(Json(ChatResponse {
        content: response.content,
        usage: response.usage,
        finish_reason: response.finish_reason,
        model: response.model,
        provider: response.provider,
        session_id: record.id.to_string(),
    }))
}

// ============================================================================
// Streaming chat (WebSocket)
// ============================================================================

/// WebSocket endpoint emitting canonical chunk frames.
pub async fn chat_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
) -> Response {
    let identity = current_identity(identity);
    ws.on_upgrade(move |socket| handle_stream(socket, state, identity))
}

async fn send_frame(sender: &mut futures::stream::SplitSink<WebSocket, WsMessage>, chunk: &StreamChunk) -> bool {
    match serde_json::to_string(chunk) {
        Ok(frame) => sender.send(WsMessage::Text(frame.into())).await.is_ok(),
        Err(_) => false,
    }
}

async fn handle_stream(socket: WebSocket, state: AppState, identity: Identity) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(incoming) = receiver.next().await {
        let text = match incoming {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                tracing::debug!("websocket receive error: {e}");
                break;
            }
            _ => continue,
        };

        let payload: ChatRequest = match serde_json::from_str(&text) {
            Ok(payload) => payload,
            Err(e) => {
                let err = GatewayError::InvalidRequest(format!("malformed frame: {e}"));
                if !send_frame(&mut sender, &StreamChunk::error(&err)).await {
                    return;
                }
                continue;
            }
        };

        // Each streamed turn consumes a rate-limit token of its own.
        if state.settings.rate_limit.enabled {
            match state
                .limiter
                .admit(&identity.tenant, state.settings.rate_limit.caps)
                .await
            {
                Ok(decision) if !decision.allowed => {
                    let err = GatewayError::RateLimited {
                        message: "rate limit exceeded".into(),
                        retry_after: decision
                            .retry_after
                            .map(std::time::Duration::from_secs),
                    };
                    if !send_frame(&mut sender, &StreamChunk::error(&err)).await {
                        return;
                    }
                    continue;
                }
                _ => {}
            }
        }

        let (record, history) =
            match resolve_session(&state, &identity, payload.session_id.as_deref()).await {
                Ok(pair) => pair,
                Err(err) => {
                    if !send_frame(&mut sender, &StreamChunk::error(&err)).await {
                        return;
                    }
                    continue;
                }
            };

        let turn = match build_turn(history, &payload) {
            Ok(turn) => turn,
            Err(err) => {
                if !send_frame(&mut sender, &StreamChunk::error(&err)).await {
                    return;
                }
                continue;
            }
        };

        let request = match GenerationRequest::new(turn.clone())
            .and_then(|r| r.with_config(payload.config.clone().unwrap_or_default()))
        {
            Ok(request) => request,
            Err(err) => {
                if !send_frame(&mut sender, &StreamChunk::error(&err)).await {
                    return;
                }
                continue;
            }
        };

        let agent = payload.agent.as_deref().unwrap_or(DEFAULT_AGENT);
        let mut stream = state.gateway.generate_stream(agent, &request);

        let mut assistant = String::new();
        let mut completed = false;
        while let Some(chunk) = stream.next().await {
            match &chunk {
                StreamChunk::Delta { delta } => assistant.push_str(delta),
                StreamChunk::Done { .. } => completed = true,
                StreamChunk::Error { .. } => {}
            }
            let terminal = chunk.is_terminal();
            if !send_frame(&mut sender, &chunk).await {
                // Client hung up mid-stream: drop the adapter stream
                // and skip the session save.
                return;
            }
            if terminal {
                break;
            }
        }

        // Only a completed stream persists the turn.
        if completed {
            if let Err(e) = persist_turn(&state, record, turn, &assistant).await {
                tracing::warn!("session save after stream failed: {e}");
            }
        }
    }
}

// ============================================================================
// Sessions
// ============================================================================

fn session_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "not_found", "message": "no such session"})),
    )
        .into_response()
}

/// Fetch session state; only the owning tenant sees it.
pub async fn get_session(
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
    Path(id): Path<String>,
) -> Response {
    let identity = current_identity(identity);
    match state.sessions.load(&SessionId::from_string(&id)).await {
        Ok(Some(record)) if record.tenant == identity.tenant => (
            StatusCode::OK,
            Json(json!({
                "session_id": record.id.to_string(),
                "created_at": record.created_at,
                "updated_at": record.updated_at,
                "state": record.state,
            })),
        )
            .into_response(),
        Ok(_) => session_not_found(),
        Err(err) => ApiError(err).into_response(),
    }
}

/// Delete a session; same ownership rule as reads.
pub async fn delete_session(
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
    Path(id): Path<String>,
) -> Response {
    let identity = current_identity(identity);
    let session_id = SessionId::from_string(&id);
    match state.sessions.load(&session_id).await {
        Ok(Some(record)) if record.tenant == identity.tenant => {
            match state.sessions.delete(&session_id).await {
                Ok(()) => StatusCode::NO_CONTENT.into_response(),
                Err(err) => ApiError(err).into_response(),
            }
        }
        Ok(_) => session_not_found(),
        Err(err) => ApiError(err).into_response(),
    }
}

// ============================================================================
// Health surface
// ============================================================================

/// Aggregate health: every enabled provider probed in parallel.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let providers = state.gateway.health_check_all().await;
    let any_available = providers.iter().any(|p| p.available);
    Json(HealthResponse {
        status: if any_available { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        providers,
    })
}

/// Readiness: at least one provider must answer.
pub async fn ready(State(state): State<AppState>) -> Response {
    let providers = state.gateway.health_check_all().await;
    if providers.iter().any(|p| p.available) {
        (StatusCode::OK, Json(json!({"ready": true}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"ready": false})),
        )
            .into_response()
    }
}

/// Liveness: the process is up.
pub async fn live() -> Json<serde_json::Value> {
    Json(json!({"alive": true}))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(message: Option<&str>, messages: Option<Vec<Message>>) -> ChatRequest {
        ChatRequest {
            message: message.map(str::to_string),
            messages,
            session_id: None,
            agent: None,
            config: None,
        }
    }

    #[test]
    fn single_message_appends_to_history() {
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        let turn = build_turn(history, &payload(Some("more"), None)).unwrap();
        assert_eq!(turn.len(), 3);
        assert_eq!(turn[2], Message::user("more"));
    }

    #[test]
    fn explicit_messages_replace_history() {
        let history = vec![Message::user("old")];
        let turn = build_turn(
            history,
            &payload(None, Some(vec![Message::system("s"), Message::user("new")])),
        )
        .unwrap();
        assert_eq!(turn.len(), 2);
        assert_eq!(turn[1], Message::user("new"));
    }

    #[test]
    fn empty_request_rejected() {
        let err = build_turn(vec![], &payload(None, None)).unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[test]
    fn session_state_round_trips() {
        let state = SessionState {
            messages: vec![Message::user("hi")],
        };
        let value = serde_json::to_value(&state).unwrap();
        let back: SessionState = serde_json::from_value(value).unwrap();
        assert_eq!(back.messages, state.messages);
    }
}
