//! Redis-backed stores: cluster-wide rate limiting over sorted sets
//! and session persistence with native TTL.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::timeout;

use gateway_core::{
    GatewayError, RateDecision, RateLimitCaps, RateLimitStore, Result, SessionId, SessionRecord,
    SessionStore,
};

const MINUTE_WINDOW_MS: i64 = 60_000;
const HOUR_WINDOW_MS: i64 = 3_600_000;
/// Keys linger one minute past their window so a slow consumer can
/// still observe them.
const KEY_GRACE_SECS: i64 = 60;

fn store_error(err: redis::RedisError) -> GatewayError {
    GatewayError::Network(format!("redis: {err}"))
}

fn retry_after_secs(oldest_ms: i64, window_ms: i64, now_ms: i64) -> u64 {
    let ms = (window_ms - (now_ms - oldest_ms)).max(0) as u64;
    ms.div_ceil(1000).max(1)
}

/// Cluster-wide sliding-window rate limiter over Redis sorted sets.
///
/// Per identity and window, members are scored by timestamp; each
/// probe atomically adds the request, prunes expired members, and
/// counts. A denied request removes its own member again, so denials
/// never consume budget.
#[derive(Clone)]
pub struct RedisRateLimitStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisRateLimitStore {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_prefix(url, "ratelimit").await
    }

    pub async fn connect_with_prefix(url: &str, prefix: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| GatewayError::Configuration(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client).await.map_err(store_error)?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn window_key(&self, identity: &str, label: &str) -> String {
        format!("{}:{identity}:{label}", self.prefix)
    }

    async fn oldest_score(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, i64)> = conn
            .zrange_withscores(key, 0, 0)
            .await
            .map_err(store_error)?;
        Ok(entries.first().map(|(_, score)| *score))
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn admit(&self, identity: &str, caps: RateLimitCaps) -> Result<RateDecision> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());
        let minute_key = self.window_key(identity, "minute");
        let hour_key = self.window_key(identity, "hour");
        let mut conn = self.conn.clone();

        // One atomic round trip: add to both windows, prune, count.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(&minute_key, &member, now_ms)
            .zrembyscore(&minute_key, "-inf", now_ms - MINUTE_WINDOW_MS)
            .zcard(&minute_key)
            .expire(&minute_key, MINUTE_WINDOW_MS / 1000 + KEY_GRACE_SECS)
            .zadd(&hour_key, &member, now_ms)
            .zrembyscore(&hour_key, "-inf", now_ms - HOUR_WINDOW_MS)
            .zcard(&hour_key)
            .expire(&hour_key, HOUR_WINDOW_MS / 1000 + KEY_GRACE_SECS);

        let counts: (i64, i64, i64, i64, i64, i64, i64, i64) =
            pipe.query_async(&mut conn).await.map_err(store_error)?;
        let minute_count = counts.2;
        let hour_count = counts.6;

        let minute_denied = minute_count > i64::from(caps.per_minute);
        let hour_denied = hour_count > i64::from(caps.per_hour);

        if !minute_denied && !hour_denied {
            let oldest = self.oldest_score(&minute_key).await?.unwrap_or(now_ms);
            return Ok(RateDecision {
                allowed: true,
                limit: caps.per_minute,
                remaining: caps.per_minute.saturating_sub(minute_count as u32),
                reset_at: (oldest + MINUTE_WINDOW_MS) / 1000,
                retry_after: None,
            });
        }

        // Denied: take the request back out of both windows.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(&minute_key, &member)
            .zrem(&hour_key, &member);
        let _: (i64, i64) = pipe.query_async(&mut conn).await.map_err(store_error)?;

        let minute_binding = if minute_denied {
            self.oldest_score(&minute_key).await?.map(|oldest| {
                (
                    retry_after_secs(oldest, MINUTE_WINDOW_MS, now_ms),
                    oldest,
                    caps.per_minute,
                    (minute_count - 1) as u32,
                    MINUTE_WINDOW_MS,
                )
            })
        } else {
            None
        };
        let hour_binding = if hour_denied {
            self.oldest_score(&hour_key).await?.map(|oldest| {
                (
                    retry_after_secs(oldest, HOUR_WINDOW_MS, now_ms),
                    oldest,
                    caps.per_hour,
                    (hour_count - 1) as u32,
                    HOUR_WINDOW_MS,
                )
            })
        } else {
            None
        };

        // The larger retry-after wins when both windows deny.
        let (retry, oldest, limit, count, window_ms) = match (minute_binding, hour_binding) {
            (Some(m), Some(h)) => {
                if h.0 >= m.0 {
                    h
                } else {
                    m
                }
            }
            (Some(m), None) => m,
            (None, Some(h)) => h,
            (None, None) => (1, now_ms, caps.per_minute, caps.per_minute, MINUTE_WINDOW_MS),
        };

        Ok(RateDecision {
            allowed: false,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: (oldest + window_ms) / 1000,
            retry_after: Some(retry),
        })
    }
}

/// Session store over Redis string values with native TTL.
///
/// Records serialize to a single JSON document under a prefixed key;
/// every operation is bounded by `op_timeout`.
#[derive(Clone)]
pub struct RedisSessionStore {
    conn: ConnectionManager,
    prefix: String,
    op_timeout: Duration,
}

impl RedisSessionStore {
    pub async fn connect(url: &str, prefix: &str, op_timeout: Duration) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| GatewayError::Configuration(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client).await.map_err(store_error)?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            op_timeout,
        })
    }

    fn key(&self, id: &SessionId) -> String {
        format!("{}:{}", self.prefix, id)
    }

    async fn bounded<T>(
        &self,
        op: impl std::future::Future<Output = redis::RedisResult<T>> + Send,
    ) -> Result<T> {
        timeout(self.op_timeout, op)
            .await
            .map_err(|_| GatewayError::Timeout("session store operation timed out".into()))?
            .map_err(store_error)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn save(&self, record: &SessionRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let key = self.key(&record.id);
        let mut conn = self.conn.clone();
        self.bounded(async move {
            conn.set_ex::<_, _, ()>(key, payload, record.ttl_secs.max(1))
                .await
        })
        .await
    }

    async fn load(&self, id: &SessionId) -> Result<Option<SessionRecord>> {
        let key = self.key(id);
        let mut conn = self.conn.clone();
        let raw: Option<String> = self.bounded(async move { conn.get(key).await }).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &SessionId) -> Result<()> {
        let key = self.key(id);
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.del::<_, ()>(key).await }).await
    }

    async fn exists(&self, id: &SessionId) -> Result<bool> {
        let key = self.key(id);
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.exists(key).await }).await
    }
}
