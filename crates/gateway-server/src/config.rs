//! Server Settings
//!
//! Environment-driven configuration for the HTTP surface. The model
//! registry itself lives in its YAML document; these settings cover
//! the ambient concerns around it (binding, rate limits, sessions,
//! auth).

use std::collections::BTreeMap;

use gateway_core::{GatewayError, RateLimitCaps, Result};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_REGISTRY_PATH: &str = "config/models.yaml";
const DEFAULT_SESSION_TTL_SECS: u64 = 3600;
const DEFAULT_SESSION_PREFIX: &str = "gateway:session";
const DEFAULT_MAX_SESSIONS: usize = 10_000;
const DEFAULT_EXCLUDE_PATHS: &[&str] = &["/health", "/ready", "/live", "/docs"];

#[derive(Clone, Debug)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub caps: RateLimitCaps,
    /// When set, admission goes through Redis with in-memory failover
    pub redis_url: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionBackend {
    Memory,
    Redis,
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub backend: SessionBackend,
    pub redis_url: Option<String>,
    pub ttl_secs: u64,
    pub prefix: String,
    pub max_sessions: usize,
}

#[derive(Clone, Debug)]
pub struct AuthSettings {
    pub enabled: bool,
    pub secret: Option<String>,
    pub algorithm: String,
    pub exclude_paths: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub registry_path: String,
    pub rate_limit: RateLimitSettings,
    pub session: SessionSettings,
    pub auth: AuthSettings,
}

fn parse_bool(value: Option<&String>, default: bool) -> bool {
    value
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn parse_number<T: std::str::FromStr>(value: Option<&String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl ServerSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_env_map(&env)
    }

    /// Read settings from an explicit map (tests use this).
    pub fn from_env_map(env: &BTreeMap<String, String>) -> Result<Self> {
        let rate_limit = RateLimitSettings {
            enabled: parse_bool(env.get("RATE_LIMIT_ENABLED"), true),
            caps: RateLimitCaps {
                per_minute: parse_number(env.get("RATE_LIMIT_PER_MINUTE"), 60),
                per_hour: parse_number(env.get("RATE_LIMIT_PER_HOUR"), 1000),
            },
            redis_url: env.get("RATE_LIMIT_REDIS_URL").cloned().filter(|v| !v.is_empty()),
        };

        let backend = match env.get("SESSION_STORE").map(String::as_str) {
            Some("redis") => SessionBackend::Redis,
            Some("memory") | None => SessionBackend::Memory,
            Some(other) => {
                return Err(GatewayError::Configuration(format!(
                    "SESSION_STORE must be 'memory' or 'redis', got '{other}'"
                )));
            }
        };
        let session = SessionSettings {
            backend,
            redis_url: env.get("SESSION_REDIS_URL").cloned().filter(|v| !v.is_empty()),
            ttl_secs: parse_number(env.get("SESSION_TTL"), DEFAULT_SESSION_TTL_SECS),
            prefix: env
                .get("SESSION_PREFIX")
                .cloned()
                .unwrap_or_else(|| DEFAULT_SESSION_PREFIX.to_string()),
            max_sessions: parse_number(env.get("SESSION_MAX_ENTRIES"), DEFAULT_MAX_SESSIONS),
        };
        if session.backend == SessionBackend::Redis && session.redis_url.is_none() {
            return Err(GatewayError::Configuration(
                "SESSION_STORE=redis requires SESSION_REDIS_URL".into(),
            ));
        }

        let auth_enabled = parse_bool(env.get("AUTH_ENABLED"), false);
        let secret = env.get("JWT_SECRET").cloned().filter(|v| !v.is_empty());
        if auth_enabled && secret.is_none() {
            // A missing secret with auth on is a fatal misconfiguration,
            // never a silent fallback to open access.
            return Err(GatewayError::Configuration(
                "AUTH_ENABLED=true requires JWT_SECRET".into(),
            ));
        }
        let exclude_paths = env
            .get("AUTH_EXCLUDE_PATHS")
            .map(|raw| {
                raw.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| {
                DEFAULT_EXCLUDE_PATHS.iter().map(|p| p.to_string()).collect()
            });
        let auth = AuthSettings {
            enabled: auth_enabled,
            secret,
            algorithm: env
                .get("JWT_ALGORITHM")
                .cloned()
                .unwrap_or_else(|| "HS256".to_string()),
            exclude_paths,
        };

        Ok(Self {
            bind_addr: env
                .get("BIND_ADDR")
                .cloned()
                .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            registry_path: env
                .get("GATEWAY_REGISTRY")
                .cloned()
                .unwrap_or_else(|| DEFAULT_REGISTRY_PATH.to_string()),
            rate_limit,
            session,
            auth,
        })
    }
}
