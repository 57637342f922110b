//! Rate-Limit Middleware
//!
//! Admission runs before any handler work: a denied request performs
//! no session or provider I/O. Every response carries the
//! `X-RateLimit-*` headers; denials answer 429 with `Retry-After`.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use gateway_core::RateDecision;

use crate::auth::Identity;
use crate::state::AppState;

const HEALTH_PATHS: &[&str] = &["/health", "/ready", "/live"];

static LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Resolve the identity a request is rate-limited under.
///
/// Precedence: authenticated tenant, explicit tenant header, tenant
/// query parameter, first forwarded-for hop, socket peer address.
fn derive_identity(request: &Request) -> String {
    if let Some(identity) = request.extensions().get::<Identity>() {
        return identity.tenant.clone();
    }
    if let Some(tenant) = request
        .headers()
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return tenant.to_string();
    }
    if let Some(tenant) = request
        .uri()
        .query()
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("tenant="))
        })
        .filter(|v| !v.is_empty())
    {
        return tenant.to_string();
    }
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

fn apply_headers(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert(LIMIT_HEADER.clone(), value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert(REMAINING_HEADER.clone(), value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.reset_at.to_string()) {
        headers.insert(RESET_HEADER.clone(), value);
    }
}

fn denied_response(decision: &RateDecision) -> Response {
    let retry_after = decision.retry_after.unwrap_or(1);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "rate_limit_exceeded",
            "retry_after": retry_after,
        })),
    )
        .into_response();
    apply_headers(&mut response, decision);
    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

/// Axum middleware enforcing per-identity sliding-window admission.
pub async fn ratelimit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if !state.settings.rate_limit.enabled || HEALTH_PATHS.contains(&path) {
        return next.run(request).await;
    }

    let identity = derive_identity(&request);
    let decision = match state
        .limiter
        .admit(&identity, state.settings.rate_limit.caps)
        .await
    {
        Ok(decision) => decision,
        Err(err) => {
            // Admission itself failing open beats refusing all traffic.
            warn!(error = %err, "rate-limit admission failed, letting request through");
            return next.run(request).await;
        }
    };

    if !decision.allowed {
        tracing::debug!(identity, "request rate limited");
        return denied_response(&decision);
    }

    let mut response = next.run(request).await;
    apply_headers(&mut response, &decision);
    response
}
