//! Bearer-Token Authentication
//!
//! Validates JWTs with a pre-shared secret and stamps the
//! request-scoped [`Identity`] into extensions. Health and
//! documentation paths bypass authentication entirely; with auth
//! disabled (local development) a fixed demo identity is substituted.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

use gateway_core::{GatewayError, Result};

use crate::config::AuthSettings;
use crate::state::AppState;

/// The authenticated subject of a request
#[derive(Clone, Debug, Serialize)]
pub struct Identity {
    pub tenant: String,
    pub roles: Vec<String>,
    /// Token expiry (epoch seconds); `None` for the demo identity
    pub expires_at: Option<i64>,
}

impl Identity {
    /// Fixed identity used when authentication is disabled.
    pub fn demo() -> Self {
        Self {
            tenant: "demo-tenant".to_string(),
            roles: vec!["demo".to_string()],
            expires_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    roles: Option<Vec<String>>,
    exp: i64,
}

/// Token validator built once at startup
pub struct Authenticator {
    enabled: bool,
    decoding_key: Option<DecodingKey>,
    validation: Validation,
    exclude_paths: Vec<String>,
}

impl Authenticator {
    pub fn from_settings(settings: &AuthSettings) -> Result<Self> {
        let algorithm = match settings.algorithm.to_ascii_uppercase().as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => {
                return Err(GatewayError::Configuration(format!(
                    "unsupported JWT_ALGORITHM '{other}'"
                )));
            }
        };

        if settings.enabled && settings.secret.is_none() {
            return Err(GatewayError::Configuration(
                "authentication enabled without a signing secret".into(),
            ));
        }

        Ok(Self {
            enabled: settings.enabled,
            decoding_key: settings
                .secret
                .as_ref()
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation: Validation::new(algorithm),
            exclude_paths: settings.exclude_paths.clone(),
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a path bypasses authentication (prefix match).
    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude_paths.iter().any(|p| path.starts_with(p))
    }

    /// Verify a bearer token and extract the identity.
    pub fn verify(&self, token: &str) -> std::result::Result<Identity, String> {
        let key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| "no signing secret configured".to_string())?;

        let data = decode::<Claims>(token, key, &self.validation)
            .map_err(|e| format!("token rejected: {e}"))?;

        let tenant = data
            .claims
            .tenant_id
            .or(data.claims.sub)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| "token carries no tenant claim".to_string())?;

        Ok(Identity {
            tenant,
            roles: data.claims.roles.unwrap_or_default(),
            expires_at: Some(data.claims.exp),
        })
    }
}

fn unauthorized(message: &str) -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "auth_error", "message": message})),
    )
        .into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        header::HeaderValue::from_static("Bearer"),
    );
    response
}

/// Axum middleware enforcing the auth policy.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth = &state.auth;
    let path = request.uri().path().to_string();

    if auth.is_excluded(&path) {
        return next.run(request).await;
    }
    if !auth.enabled() {
        request.extensions_mut().insert(Identity::demo());
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        None => unauthorized("missing bearer token"),
        Some(token) => match auth.verify(token) {
            Ok(identity) => {
                tracing::debug!(tenant = %identity.tenant, path, "request authenticated");
                request.extensions_mut().insert(identity);
                next.run(request).await
            }
            Err(reason) => {
                tracing::debug!(path, %reason, "request rejected");
                unauthorized(&reason)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn authenticator() -> Authenticator {
        Authenticator::from_settings(&AuthSettings {
            enabled: true,
            secret: Some(SECRET.to_string()),
            algorithm: "HS256".to_string(),
            exclude_paths: vec!["/health".to_string()],
        })
        .unwrap()
    }

    fn issue(claims: &serde_json::Value) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 600
    }

    #[test]
    fn valid_token_yields_identity() {
        let token = issue(&serde_json::json!({
            "tenant_id": "acme",
            "roles": ["ops"],
            "exp": future_exp(),
        }));
        let identity = authenticator().verify(&token).unwrap();
        assert_eq!(identity.tenant, "acme");
        assert_eq!(identity.roles, vec!["ops".to_string()]);
    }

    #[test]
    fn sub_claim_backfills_tenant() {
        let token = issue(&serde_json::json!({"sub": "t42", "exp": future_exp()}));
        let identity = authenticator().verify(&token).unwrap();
        assert_eq!(identity.tenant, "t42");
    }

    #[test]
    fn expired_token_rejected() {
        let token = issue(&serde_json::json!({
            "tenant_id": "acme",
            "exp": chrono::Utc::now().timestamp() - 600,
        }));
        assert!(authenticator().verify(&token).is_err());
    }

    #[test]
    fn missing_tenant_rejected() {
        let token = issue(&serde_json::json!({"exp": future_exp()}));
        assert!(authenticator().verify(&token).is_err());
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = encode(
            &Header::default(),
            &serde_json::json!({"tenant_id": "acme", "exp": future_exp()}),
            &EncodingKey::from_secret(b"other-secret"),
        )
        .unwrap();
        assert!(authenticator().verify(&token).is_err());
    }

    #[test]
    fn path_exclusion_is_prefix_based() {
        let auth = authenticator();
        assert!(auth.is_excluded("/health"));
        assert!(auth.is_excluded("/health/providers"));
        assert!(!auth.is_excluded("/chat"));
    }

    #[test]
    fn unsupported_algorithm_is_fatal() {
        let err = Authenticator::from_settings(&AuthSettings {
            enabled: true,
            secret: Some(SECRET.to_string()),
            algorithm: "RS256".to_string(),
            exclude_paths: vec![],
        })
        .unwrap_err();
        assert_eq!(err.kind(), "configuration_error");
    }
}
