//! Error Types
//!
//! Canonical error taxonomy shared by adapters, the gateway, and the
//! HTTP layer. Adapters translate every back-end failure into one of
//! these kinds; the gateway only consults [`GatewayError::is_transferable`]
//! when deciding whether to walk the fallback chain.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Canonical gateway error taxonomy
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Missing or rejected credential
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Provider-imposed throttling
    #[error("provider throttled the request: {message}")]
    RateLimited {
        message: String,
        /// Provider-supplied Retry-After, when present
        retry_after: Option<Duration>,
    },

    /// Requested model unknown to the provider
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Malformed prompt or parameters
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Back end refused to produce output
    #[error("content filtered: {0}")]
    ContentFilter(String),

    /// Deadline exceeded
    #[error("timed out: {0}")]
    Timeout(String),

    /// Back end down or returning 5xx
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Transport failure
    #[error("network error: {0}")]
    Network(String),

    /// Caller context canceled
    #[error("request canceled")]
    Canceled,

    /// Startup or registry problem
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Candidate list exhausted or empty
    #[error("no provider available{}", last_tried.as_deref().map(|p| format!(" (last tried: {p})")).unwrap_or_default())]
    NoProviderAvailable { last_tried: Option<String> },
}

impl GatewayError {
    /// Machine-readable kind identifier, stable on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::ModelNotFound(_) => "model_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ContentFilter(_) => "content_filter",
            Self::Timeout(_) => "timeout",
            Self::Unavailable(_) => "unavailable",
            Self::Network(_) => "network_error",
            Self::Canceled => "canceled",
            Self::Configuration(_) => "configuration_error",
            Self::NoProviderAvailable { .. } => "no_provider_available",
        }
    }

    /// Whether the same logical request may be retried on a different
    /// provider. Non-transferable errors surface immediately.
    pub fn is_transferable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Unavailable(_) | Self::Network(_)
        )
    }

    /// Shorthand for a rate-limit error without a Retry-After hint.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after: None,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(format!("payload (de)serialization failed: {err}"))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}
