//! Application State

use std::sync::Arc;

use gateway_core::{Gateway, RateLimitStore, SessionStore};

use crate::auth::Authenticator;
use crate::config::ServerSettings;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// The multiplexing gateway
    pub gateway: Gateway,

    /// Session persistence (memory or Redis)
    pub sessions: Arc<dyn SessionStore>,

    /// Rate-limit admission (memory, or Redis with failover)
    pub limiter: Arc<dyn RateLimitStore>,

    /// Bearer-token validator
    pub auth: Arc<Authenticator>,

    /// Environment-derived settings
    pub settings: Arc<ServerSettings>,
}
