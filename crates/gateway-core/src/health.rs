//! Provider Health Tracking
//!
//! Per-provider circuit breaker: closed while a provider behaves,
//! open (with an exponentially backed-off probe deadline) after
//! repeated transferable failures, half-open for exactly one probe
//! request once the deadline passes.
//!
//! Writers are rare (state transitions); readers are frequent
//! (selection), so the table lives behind a `RwLock` and transitions
//! take the write lock only when needed.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

/// Circuit state of one provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

/// Snapshot of one provider's health entry
#[derive(Clone, Debug)]
pub struct ProviderHealth {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub next_probe_at: Option<Instant>,
    pub last_success: Option<Instant>,
    backoff: Duration,
}

impl ProviderHealth {
    fn new(base_backoff: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            next_probe_at: None,
            last_success: None,
            backoff: base_backoff,
        }
    }
}

/// Concurrent-safe circuit-breaker table keyed by provider id.
#[derive(Debug)]
pub struct HealthTable {
    entries: RwLock<HashMap<String, ProviderHealth>>,
    failure_threshold: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl Default for HealthTable {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(10), Duration::from_secs(300))
    }
}

impl HealthTable {
    pub fn new(failure_threshold: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            base_backoff,
            max_backoff,
        }
    }

    /// May selection attempt this provider right now?
    ///
    /// Open circuits are skipped until their probe deadline; the first
    /// caller past the deadline becomes the half-open probe, and only
    /// one probe is in flight at a time.
    pub fn admit(&self, provider: &str, now: Instant) -> bool {
        {
            let entries = self.entries.read().unwrap();
            match entries.get(provider) {
                None => return true,
                Some(e) => match e.state {
                    CircuitState::Closed => return true,
                    CircuitState::HalfOpen => return false,
                    CircuitState::Open => {
                        if e.next_probe_at.is_some_and(|at| at > now) {
                            return false;
                        }
                    }
                },
            }
        }

        // Deadline elapsed: promote to half-open under the write lock,
        // re-checking so concurrent callers race to a single probe.
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry(provider.to_string())
            .or_insert_with(|| ProviderHealth::new(self.base_backoff));
        if entry.state == CircuitState::Open && entry.next_probe_at.is_none_or(|at| at <= now) {
            entry.state = CircuitState::HalfOpen;
            debug!(provider, "circuit half-open, sending probe");
            true
        } else {
            entry.state == CircuitState::Closed
        }
    }

    /// Record a successful call: close the circuit and reset backoff.
    pub fn record_success(&self, provider: &str, now: Instant) {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry(provider.to_string())
            .or_insert_with(|| ProviderHealth::new(self.base_backoff));
        if entry.state != CircuitState::Closed {
            debug!(provider, "circuit closed");
        }
        entry.state = CircuitState::Closed;
        entry.consecutive_failures = 0;
        entry.next_probe_at = None;
        entry.last_success = Some(now);
        entry.backoff = self.base_backoff;
    }

    /// Record a transferable failure. A half-open probe failure
    /// reopens the circuit and doubles the backoff; enough consecutive
    /// failures trip a closed circuit.
    pub fn record_failure(&self, provider: &str, now: Instant) {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .entry(provider.to_string())
            .or_insert_with(|| ProviderHealth::new(self.base_backoff));
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        match entry.state {
            CircuitState::HalfOpen => {
                entry.backoff = (entry.backoff * 2).min(self.max_backoff);
                entry.state = CircuitState::Open;
                entry.next_probe_at = Some(now + entry.backoff);
                warn!(provider, backoff_secs = entry.backoff.as_secs(), "probe failed, circuit reopened");
            }
            CircuitState::Closed if entry.consecutive_failures >= self.failure_threshold => {
                entry.state = CircuitState::Open;
                entry.next_probe_at = Some(now + entry.backoff);
                warn!(
                    provider,
                    failures = entry.consecutive_failures,
                    backoff_secs = entry.backoff.as_secs(),
                    "failure threshold reached, circuit open"
                );
            }
            _ => {}
        }
    }

    /// Give back a half-open probe slot without judging the provider:
    /// the attempt ended in an outcome that says nothing about its
    /// health (provider-side throttle, non-transferable error). The
    /// circuit reopens with its current backoff, neither reset nor
    /// doubled.
    pub fn release_probe(&self, provider: &str, now: Instant) {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(provider) {
            if entry.state == CircuitState::HalfOpen {
                entry.state = CircuitState::Open;
                entry.next_probe_at = Some(now + entry.backoff);
            }
        }
    }

    /// Read-only snapshot of one provider (absent means closed/untracked).
    pub fn snapshot(&self, provider: &str) -> Option<ProviderHealth> {
        self.entries.read().unwrap().get(provider).cloned()
    }

    /// Read-only state for the health surface; never mutates.
    pub fn state_of(&self, provider: &str) -> CircuitState {
        self.entries
            .read()
            .unwrap()
            .get(provider)
            .map_or(CircuitState::Closed, |e| e.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> HealthTable {
        HealthTable::new(3, Duration::from_secs(10), Duration::from_secs(60))
    }

    #[test]
    fn closed_by_default() {
        let t = table();
        assert!(t.admit("p", Instant::now()));
        assert_eq!(t.state_of("p"), CircuitState::Closed);
    }

    #[test]
    fn trips_after_threshold() {
        let t = table();
        let now = Instant::now();
        t.record_failure("p", now);
        t.record_failure("p", now);
        assert!(t.admit("p", now));
        t.record_failure("p", now);
        assert_eq!(t.state_of("p"), CircuitState::Open);
        assert!(!t.admit("p", now));
    }

    #[test]
    fn single_probe_after_deadline() {
        let t = table();
        let now = Instant::now();
        for _ in 0..3 {
            t.record_failure("p", now);
        }
        let after = now + Duration::from_secs(11);
        // First caller past the deadline becomes the probe...
        assert!(t.admit("p", after));
        assert_eq!(t.state_of("p"), CircuitState::HalfOpen);
        // ...and concurrent callers are still held back.
        assert!(!t.admit("p", after));
    }

    #[test]
    fn probe_success_closes() {
        let t = table();
        let now = Instant::now();
        for _ in 0..3 {
            t.record_failure("p", now);
        }
        let after = now + Duration::from_secs(11);
        assert!(t.admit("p", after));
        t.record_success("p", after);
        assert_eq!(t.state_of("p"), CircuitState::Closed);
        assert!(t.admit("p", after));
    }

    #[test]
    fn probe_failure_doubles_backoff() {
        let t = table();
        let now = Instant::now();
        for _ in 0..3 {
            t.record_failure("p", now);
        }
        let first_probe = now + Duration::from_secs(11);
        assert!(t.admit("p", first_probe));
        t.record_failure("p", first_probe);

        // Backoff doubled to 20s: 11s later is still closed off.
        assert!(!t.admit("p", first_probe + Duration::from_secs(11)));
        assert!(t.admit("p", first_probe + Duration::from_secs(21)));
    }

    #[test]
    fn released_probe_reopens_without_doubling() {
        let t = table();
        let now = Instant::now();
        for _ in 0..3 {
            t.record_failure("p", now);
        }
        let probe_at = now + Duration::from_secs(11);
        assert!(t.admit("p", probe_at));
        t.release_probe("p", probe_at);
        assert_eq!(t.state_of("p"), CircuitState::Open);
        // Backoff stayed at 10s, so another probe is due 10s later.
        assert!(t.admit("p", probe_at + Duration::from_secs(11)));
    }

    #[test]
    fn backoff_capped() {
        let t = HealthTable::new(1, Duration::from_secs(40), Duration::from_secs(60));
        let now = Instant::now();
        t.record_failure("p", now);
        for i in 1..5 {
            let probe_at = now + Duration::from_secs(120 * i);
            assert!(t.admit("p", probe_at));
            t.record_failure("p", probe_at);
        }
        let snap = t.snapshot("p").unwrap();
        assert!(snap.backoff <= Duration::from_secs(60));
    }
}
