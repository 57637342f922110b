//! Sliding-Window Rate Limiting
//!
//! Per-identity admission over two concurrent windows (minute and
//! hour). Admission is decided before any provider I/O; a denied
//! request leaves no trace in either window.
//!
//! Two back ends implement [`RateLimitStore`]: the in-memory store
//! here (per-node fairness) and a Redis sorted-set store in the
//! runtime crate (cluster-wide fairness). [`FailoverRateLimitStore`]
//! degrades from the remote store to the in-memory one when Redis is
//! unreachable, logging once per failure window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::error::Result;

/// Milliseconds in the minute window
pub const MINUTE_WINDOW_MS: i64 = 60_000;
/// Milliseconds in the hour window
pub const HOUR_WINDOW_MS: i64 = 3_600_000;

/// Per-identity request caps
#[derive(Clone, Copy, Debug)]
pub struct RateLimitCaps {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Default for RateLimitCaps {
    fn default() -> Self {
        Self {
            per_minute: 60,
            per_hour: 1000,
        }
    }
}

/// Outcome of one admission probe
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,

    /// Cap of the window the decision reports on
    pub limit: u32,

    /// Requests left in that window
    pub remaining: u32,

    /// Epoch seconds when the window frees up
    pub reset_at: i64,

    /// Seconds to wait before retrying (denials only). When both
    /// windows deny, the larger value wins so admission is guaranteed
    /// on return.
    pub retry_after: Option<u64>,
}

/// Pluggable admission store
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Check and record one request for `identity`.
    async fn admit(&self, identity: &str, caps: RateLimitCaps) -> Result<RateDecision>;
}

#[derive(Debug, Default)]
struct WindowPair {
    minute: VecDeque<i64>,
    hour: VecDeque<i64>,
}

fn prune(window: &mut VecDeque<i64>, cutoff_ms: i64) {
    while window.front().is_some_and(|&t| t <= cutoff_ms) {
        window.pop_front();
    }
}

fn retry_after_secs(oldest_ms: i64, window_ms: i64, now_ms: i64) -> u64 {
    let ms = (window_ms - (now_ms - oldest_ms)).max(0) as u64;
    ms.div_ceil(1000).max(1)
}

/// In-memory sliding-window store.
///
/// The outer map is read-locked on the hot path; each identity owns a
/// small mutex so probes for different identities never contend.
/// Memory per identity is bounded by the hour cap.
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    entries: RwLock<HashMap<String, Arc<Mutex<WindowPair>>>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, identity: &str) -> Arc<Mutex<WindowPair>> {
        if let Some(found) = self.entries.read().unwrap().get(identity) {
            return Arc::clone(found);
        }
        let mut map = self.entries.write().unwrap();
        Arc::clone(map.entry(identity.to_string()).or_default())
    }

    /// Admission with an explicit clock, for deterministic tests.
    pub fn admit_at(&self, identity: &str, caps: RateLimitCaps, now_ms: i64) -> RateDecision {
        let entry = self.entry(identity);
        let mut windows = entry.lock().unwrap();

        prune(&mut windows.minute, now_ms - MINUTE_WINDOW_MS);
        prune(&mut windows.hour, now_ms - HOUR_WINDOW_MS);

        let minute_count = windows.minute.len() as u32;
        let hour_count = windows.hour.len() as u32;
        let minute_ok = minute_count < caps.per_minute;
        let hour_ok = hour_count < caps.per_hour;

        if minute_ok && hour_ok {
            windows.minute.push_back(now_ms);
            windows.hour.push_back(now_ms);
            let oldest = *windows.minute.front().unwrap_or(&now_ms);
            return RateDecision {
                allowed: true,
                limit: caps.per_minute,
                remaining: caps.per_minute - (minute_count + 1),
                reset_at: (oldest + MINUTE_WINDOW_MS) / 1000,
                retry_after: None,
            };
        }

        // Denied: report the window the caller has to wait on. When
        // both deny, the larger retry-after wins.
        let minute_retry = (!minute_ok)
            .then(|| windows.minute.front().copied())
            .flatten()
            .map(|oldest| (retry_after_secs(oldest, MINUTE_WINDOW_MS, now_ms), oldest));
        let hour_retry = (!hour_ok)
            .then(|| windows.hour.front().copied())
            .flatten()
            .map(|oldest| (retry_after_secs(oldest, HOUR_WINDOW_MS, now_ms), oldest));

        let minute_binding = minute_retry
            .map(|(retry, oldest)| (retry, oldest, caps.per_minute, minute_count, MINUTE_WINDOW_MS));
        let hour_binding = hour_retry
            .map(|(retry, oldest)| (retry, oldest, caps.per_hour, hour_count, HOUR_WINDOW_MS));
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
            (None, None) => unreachable!("denied admission always has a full window"),
        };

        RateDecision {
            allowed: false,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: (oldest + window_ms) / 1000,
            retry_after: Some(retry),
        }
    }
}

fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn admit(&self, identity: &str, caps: RateLimitCaps) -> Result<RateDecision> {
        Ok(self.admit_at(identity, caps, now_epoch_ms()))
    }
}

/// Degrading wrapper: a remote primary with an in-memory fallback.
///
/// When the primary errors, admission falls back to the per-node store
/// so traffic keeps flowing with per-node fairness, and one warning is
/// logged per failure window.
pub struct FailoverRateLimitStore {
    primary: Arc<dyn RateLimitStore>,
    fallback: Arc<dyn RateLimitStore>,
    warn_interval: Duration,
    last_warned: Mutex<Option<Instant>>,
}

impl FailoverRateLimitStore {
    pub fn new(primary: Arc<dyn RateLimitStore>, fallback: Arc<dyn RateLimitStore>) -> Self {
        Self {
            primary,
            fallback,
            warn_interval: Duration::from_secs(60),
            last_warned: Mutex::new(None),
        }
    }

    fn warn_once(&self, err: &crate::error::GatewayError) {
        let mut last = self.last_warned.lock().unwrap();
        let due = last.is_none_or(|at| at.elapsed() >= self.warn_interval);
        if due {
            warn!(error = %err, "remote rate-limit store unreachable, degrading to in-memory admission");
            *last = Some(Instant::now());
        }
    }
}

#[async_trait]
impl RateLimitStore for FailoverRateLimitStore {
    async fn admit(&self, identity: &str, caps: RateLimitCaps) -> Result<RateDecision> {
        match self.primary.admit(identity, caps).await {
            Ok(decision) => Ok(decision),
            Err(err) => {
                self.warn_once(&err);
                self.fallback.admit(identity, caps).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;

    const CAPS: RateLimitCaps = RateLimitCaps {
        per_minute: 2,
        per_hour: 10,
    };

    #[test]
    fn admits_until_minute_cap() {
        let store = MemoryRateLimitStore::new();
        let t0: i64 = 1_000_000;

        let first = store.admit_at("t1", CAPS, t0);
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        let second = store.admit_at("t1", CAPS, t0 + 5_000);
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        // Third within 10s is denied with retry-after in [50, 60].
        let third = store.admit_at("t1", CAPS, t0 + 10_000);
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        let retry = third.retry_after.unwrap();
        assert!((50..=60).contains(&retry), "retry_after was {retry}");

        // 60s after the first request the window has room again.
        let fourth = store.admit_at("t1", CAPS, t0 + 61_000);
        assert!(fourth.allowed);
    }

    #[test]
    fn denied_requests_do_not_consume_budget() {
        let store = MemoryRateLimitStore::new();
        let t0: i64 = 0;
        store.admit_at("t1", CAPS, t0);
        store.admit_at("t1", CAPS, t0 + 1_000);
        for i in 0..20 {
            assert!(!store.admit_at("t1", CAPS, t0 + 2_000 + i).allowed);
        }
        // The two admitted requests expire on schedule regardless of
        // how many denials happened meanwhile.
        assert!(store.admit_at("t1", CAPS, t0 + 61_000).allowed);
    }

    #[test]
    fn hour_window_denies_independently() {
        let caps = RateLimitCaps {
            per_minute: 100,
            per_hour: 3,
        };
        let store = MemoryRateLimitStore::new();
        let t0: i64 = 0;
        for i in 0..3 {
            assert!(store.admit_at("t1", caps, t0 + i * 120_000).allowed);
        }
        let denied = store.admit_at("t1", caps, t0 + 360_000);
        assert!(!denied.allowed);
        assert_eq!(denied.limit, 3);
        // Oldest entry is at t0; the hour frees up 3600s after it.
        assert_eq!(denied.reset_at, 3600);
    }

    #[test]
    fn larger_retry_after_wins_when_both_deny() {
        let caps = RateLimitCaps {
            per_minute: 1,
            per_hour: 1,
        };
        let store = MemoryRateLimitStore::new();
        store.admit_at("t1", caps, 0);
        let denied = store.admit_at("t1", caps, 1_000);
        assert!(!denied.allowed);
        // Hour window owes the longer wait.
        assert_eq!(denied.limit, 1);
        assert_eq!(denied.retry_after, Some(3_599));
    }

    #[test]
    fn identities_are_independent() {
        let store = MemoryRateLimitStore::new();
        store.admit_at("t1", CAPS, 0);
        store.admit_at("t1", CAPS, 0);
        assert!(!store.admit_at("t1", CAPS, 0).allowed);
        assert!(store.admit_at("t2", CAPS, 0).allowed);
    }

    struct BrokenStore;

    #[async_trait]
    impl RateLimitStore for BrokenStore {
        async fn admit(&self, _identity: &str, _caps: RateLimitCaps) -> Result<RateDecision> {
            Err(GatewayError::Network("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn failover_degrades_to_fallback() {
        let failover = FailoverRateLimitStore::new(
            Arc::new(BrokenStore),
            Arc::new(MemoryRateLimitStore::new()),
        );
        let decision = failover.admit("t1", CAPS).await.unwrap();
        assert!(decision.allowed);
        let decision = failover.admit("t1", CAPS).await.unwrap();
        assert!(decision.allowed);
        let decision = failover.admit("t1", CAPS).await.unwrap();
        assert!(!decision.allowed);
    }
}
